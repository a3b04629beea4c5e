use crate::event_loop::{spawn_interval, spawn_timeout};
use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;
use anyhow::{bail, Result};
use std::env;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn register(vm: &mut Vm) {
    vm.define_native("print", native_print);
    vm.define_native("println", native_println);
    vm.define_native("now", native_now);
    vm.define_native("sleep", native_sleep);
    vm.define_native("getEnv", native_get_env);
    vm.define_native("setEnv", native_set_env);
    vm.define_native("exit", native_exit);
    vm.define_native("typeof", native_typeof);
    vm.define_native("setTimeout", native_set_timeout);
    vm.define_native("setInterval", native_set_interval);
    vm.define_native("clearInterval", native_clear_interval);
}

fn join_args(vm: &Vm, args: &[Value]) -> String {
    args.iter()
        .map(|value| vm.value_to_string(*value))
        .collect::<Vec<_>>()
        .join(" ")
}

fn native_print(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let text = join_args(vm, args);
    vm.write_out(&text);
    Ok(Value::Null)
}

fn native_println(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let text = join_args(vm, args);
    vm.write_out(&text);
    vm.write_out("\n");
    Ok(Value::Null)
}

fn native_now(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    Ok(Value::Number(ms as f64))
}

fn native_sleep(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let Some(Value::Number(ms)) = args.first() else {
        bail!("sleep expects a duration in milliseconds.");
    };
    thread::sleep(Duration::from_millis(ms.max(0.0) as u64));
    Ok(Value::Null)
}

fn native_get_env(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let Some(name) = args.first().and_then(|v| vm.get_string_value(*v)) else {
        bail!("getEnv expects a variable name string.");
    };
    match env::var(name) {
        Ok(value) => Ok(vm.new_string(&value)),
        Err(_) => Ok(Value::Null),
    }
}

fn native_set_env(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let name = args.first().and_then(|v| vm.get_string_value(*v));
    let Some(name) = name else {
        bail!("setEnv expects a variable name string.");
    };
    let Some(value) = args.get(1) else {
        bail!("setEnv expects a value.");
    };
    env::set_var(name, vm.value_to_string(*value));
    Ok(Value::Null)
}

fn native_exit(_vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let code = args
        .first()
        .and_then(|v| v.as_number())
        .unwrap_or(0.0);
    std::process::exit(code as i32);
}

fn native_typeof(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let name = match args.first() {
        None => "undefined",
        Some(Value::Null) => "object",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::Obj(handle)) => match vm.heap.get(*handle) {
            Obj::String(_) => "string",
            Obj::Function(_)
            | Obj::Closure(_)
            | Obj::Native(_)
            | Obj::BoundMethod(_)
            | Obj::Class(_) => "function",
            _ => "object",
        },
    };
    Ok(vm.new_string(name))
}

fn timer_args(vm: &Vm, which: &str, args: &[Value]) -> Result<(u32, u64)> {
    let callback = args.first().and_then(|v| v.as_obj());
    let callback = match callback {
        Some(handle) if matches!(vm.heap.get(handle), Obj::Closure(_)) => handle,
        _ => bail!("{which} expects a function as its first argument."),
    };
    let Some(Value::Number(ms)) = args.get(1) else {
        bail!("{which} expects a delay in milliseconds.");
    };
    Ok((callback, ms.max(0.0) as u64))
}

fn native_set_timeout(
    vm: &mut Vm,
    _receiver: Value,
    args: &[Value],
) -> Result<Value> {
    let (callback, ms) = timer_args(vm, "setTimeout", args)?;
    let worker = spawn_timeout(vm.timers.clone(), callback, ms);
    vm.workers.push(worker);
    Ok(Value::Null)
}

fn native_set_interval(
    vm: &mut Vm,
    _receiver: Value,
    args: &[Value],
) -> Result<Value> {
    let (callback, ms) = timer_args(vm, "setInterval", args)?;
    let id = vm.timers.register_interval();
    let worker = spawn_interval(vm.timers.clone(), callback, id, ms);
    vm.workers.push(worker);
    Ok(Value::Number(id as f64))
}

fn native_clear_interval(
    vm: &mut Vm,
    _receiver: Value,
    args: &[Value],
) -> Result<Value> {
    let Some(Value::Number(id)) = args.first() else {
        bail!("clearInterval expects an interval id.");
    };
    vm.timers.clear_interval(*id as u32);
    Ok(Value::Null)
}
