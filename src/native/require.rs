use crate::object::{Class, Closure, Instance, Obj};
use crate::value::Value;
use crate::vm::Vm;
use anyhow::Result;
use std::fs;

/// The module loader behind both `require(path)` and the `import` statement.
///
/// Loads, compiles, and runs the file once, memoising its `exports` instance.
/// Read and compile failures yield `null`; a runtime error inside the module
/// propagates to the requiring script.
pub fn native_require(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let Some(path) = args.first().and_then(|v| vm.get_string_value(*v)) else {
        eprintln!("require expects a file path string.");
        return Ok(Value::Null);
    };

    if let Some(module) = vm.modules.get(&path) {
        return Ok(*module);
    }

    let Ok(source) = fs::read_to_string(&path) else {
        eprintln!("Could not open file: {path}");
        return Ok(Value::Null);
    };

    let previous_exports = vm.globals.get("exports").copied();

    // Fresh exports object for the module, protected while it is only
    // reachable from the global slot we are about to overwrite.
    vm.maybe_collect();
    let exports_class = vm.heap.alloc(Obj::Class(Class::new("exports".to_string())));
    let exports = vm.heap.alloc(Obj::Instance(Instance::new(exports_class)));
    vm.temp_roots.push(exports);
    vm.globals.insert("exports".to_string(), Value::Obj(exports));

    let restore = |vm: &mut Vm| match previous_exports {
        Some(value) => {
            vm.globals.insert("exports".to_string(), value);
        }
        None => {
            vm.globals.remove("exports");
        }
    };

    let script = match vm.compile_source(&source, &path) {
        Ok(script) => script,
        Err(error) => {
            eprintln!("Compile Error: {error}");
            restore(vm);
            vm.temp_roots.pop();
            return Ok(Value::Null);
        }
    };

    vm.temp_roots.push(script);
    let closure = vm.allocate(Obj::Closure(Closure {
        function: script,
        upvalues: Vec::new(),
    }));
    vm.temp_roots.pop();

    let result = vm.call_and_run(closure);
    restore(vm);
    vm.temp_roots.pop();
    result?;

    vm.modules.insert(path, Value::Obj(exports));
    Ok(Value::Obj(exports))
}
