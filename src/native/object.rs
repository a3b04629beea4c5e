use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;
use anyhow::{bail, Result};

pub fn register(vm: &mut Vm) {
    vm.define_native_class(
        "Object",
        &[
            ("keys", native_keys),
            ("values", native_values),
            ("entries", native_entries),
        ],
    );
}

fn instance_fields(vm: &Vm, args: &[Value]) -> Result<Vec<(String, Value)>> {
    let instance = args.first().and_then(|v| v.as_obj());
    match instance.map(|handle| vm.heap.get(handle)) {
        Some(Obj::Instance(instance)) => Ok(instance
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), *value))
            .collect()),
        _ => bail!("Argument must be an object instance."),
    }
}

fn native_keys(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let fields = instance_fields(vm, args)?;
    vm.maybe_collect();
    let keys = fields
        .iter()
        .map(|(key, _)| Value::Obj(vm.heap.alloc(Obj::String(key.clone()))))
        .collect();
    Ok(Value::Obj(vm.heap.alloc(Obj::List(keys))))
}

fn native_values(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let fields = instance_fields(vm, args)?;
    vm.maybe_collect();
    let values = fields.iter().map(|(_, value)| *value).collect();
    Ok(Value::Obj(vm.heap.alloc(Obj::List(values))))
}

fn native_entries(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value> {
    let fields = instance_fields(vm, args)?;
    vm.maybe_collect();
    let entries = fields
        .into_iter()
        .map(|(key, value)| {
            let key = Value::Obj(vm.heap.alloc(Obj::String(key)));
            Value::Obj(vm.heap.alloc(Obj::List(vec![key, value])))
        })
        .collect();
    Ok(Value::Obj(vm.heap.alloc(Obj::List(entries))))
}
