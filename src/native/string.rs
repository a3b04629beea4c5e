use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;
use anyhow::{bail, Result};

pub fn register(vm: &mut Vm) {
    vm.bind_string_method("at", native_string_at);
    vm.bind_string_method("indexOf", native_string_index_of);
    vm.bind_string_method("substring", native_string_substring);
    vm.bind_string_method("toUpperCase", native_string_to_upper);
    vm.bind_string_method("toLowerCase", native_string_to_lower);
    vm.bind_string_method("trim", native_string_trim);

    vm.bind_list_method("push", native_list_push);
    vm.bind_list_method("pop", native_list_pop);
    vm.bind_list_method("clear", native_list_clear);
    vm.bind_list_method("join", native_list_join);
    vm.bind_list_method("at", native_list_at);
}

fn receiver_string(vm: &Vm, receiver: Value) -> Result<String> {
    match receiver.as_obj().map(|h| vm.heap.get(h)) {
        Some(Obj::String(s)) => Ok(s.clone()),
        _ => bail!("Receiver must be a string."),
    }
}

fn receiver_list(receiver: Value) -> Result<u32> {
    match receiver.as_obj() {
        Some(handle) => Ok(handle),
        None => bail!("Receiver must be a list."),
    }
}

fn index_arg(args: &[Value]) -> Result<i64> {
    match args.first() {
        Some(Value::Number(n)) => Ok(*n as i64),
        _ => bail!("Index must be a number."),
    }
}

fn native_string_at(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let text = receiver_string(vm, receiver)?;
    let index = index_arg(args)?;
    let chars: Vec<char> = text.chars().collect();
    if index < 0 || index as usize >= chars.len() {
        bail!("String index out of bounds.");
    }
    Ok(vm.new_string(&chars[index as usize].to_string()))
}

fn native_string_index_of(
    vm: &mut Vm,
    receiver: Value,
    args: &[Value],
) -> Result<Value> {
    let text = receiver_string(vm, receiver)?;
    let Some(needle) = args.first().and_then(|v| vm.get_string_value(*v)) else {
        bail!("Argument must be a string.");
    };
    match text.find(&needle) {
        Some(position) => Ok(Value::Number(position as f64)),
        None => Ok(Value::Number(-1.0)),
    }
}

fn native_string_substring(
    vm: &mut Vm,
    receiver: Value,
    args: &[Value],
) -> Result<Value> {
    let text = receiver_string(vm, receiver)?;
    let (Some(Value::Number(start)), Some(Value::Number(end))) =
        (args.first(), args.get(1))
    else {
        bail!("Arguments must be numbers.");
    };
    let (start, end) = (*start as i64, *end as i64);
    if start < 0 || end > text.len() as i64 || start > end {
        bail!("Invalid substring indices.");
    }
    let slice = text[start as usize..end as usize].to_string();
    Ok(vm.new_string(&slice))
}

fn native_string_to_upper(
    vm: &mut Vm,
    receiver: Value,
    _args: &[Value],
) -> Result<Value> {
    let text = receiver_string(vm, receiver)?;
    Ok(vm.new_string(&text.to_uppercase()))
}

fn native_string_to_lower(
    vm: &mut Vm,
    receiver: Value,
    _args: &[Value],
) -> Result<Value> {
    let text = receiver_string(vm, receiver)?;
    Ok(vm.new_string(&text.to_lowercase()))
}

fn native_string_trim(
    vm: &mut Vm,
    receiver: Value,
    _args: &[Value],
) -> Result<Value> {
    let text = receiver_string(vm, receiver)?;
    Ok(vm.new_string(text.trim()))
}

fn native_list_push(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let handle = receiver_list(receiver)?;
    match vm.heap.get_mut(handle) {
        Obj::List(items) => {
            items.extend_from_slice(args);
            Ok(Value::Null)
        }
        _ => bail!("Receiver must be a list."),
    }
}

fn native_list_pop(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let handle = receiver_list(receiver)?;
    match vm.heap.get_mut(handle) {
        Obj::List(items) => match items.pop() {
            Some(value) => Ok(value),
            None => bail!("Cannot pop from an empty list."),
        },
        _ => bail!("Receiver must be a list."),
    }
}

fn native_list_clear(
    vm: &mut Vm,
    receiver: Value,
    _args: &[Value],
) -> Result<Value> {
    let handle = receiver_list(receiver)?;
    match vm.heap.get_mut(handle) {
        Obj::List(items) => {
            items.clear();
            Ok(Value::Null)
        }
        _ => bail!("Receiver must be a list."),
    }
}

fn native_list_join(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let handle = receiver_list(receiver)?;
    let separator = args
        .first()
        .and_then(|v| vm.get_string_value(*v))
        .unwrap_or_else(|| ",".to_string());
    let items = match vm.heap.get(handle) {
        Obj::List(items) => items.clone(),
        _ => bail!("Receiver must be a list."),
    };
    let joined = items
        .iter()
        .map(|value| vm.value_to_string(*value))
        .collect::<Vec<_>>()
        .join(&separator);
    Ok(vm.new_string(&joined))
}

fn native_list_at(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let handle = receiver_list(receiver)?;
    let index = index_arg(args)?;
    match vm.heap.get(handle) {
        Obj::List(items) => {
            if index < 0 || index as usize >= items.len() {
                bail!("List index out of bounds.");
            }
            Ok(items[index as usize])
        }
        _ => bail!("Receiver must be a list."),
    }
}
