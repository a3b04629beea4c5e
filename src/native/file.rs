use crate::object::Obj;
use crate::value::Value;
use crate::vm::Vm;
use anyhow::{bail, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};

/// Host data behind a `File` instance. Dropping the handle closes the file.
pub struct FileHandle {
    pub file: Option<File>,
    pub path: String,
}

pub fn register(vm: &mut Vm) {
    vm.define_native_class(
        "File",
        &[
            ("constructor", native_constructor),
            ("read", native_read),
            ("write", native_write),
            ("close", native_close),
            ("isOpen", native_is_open),
            ("size", native_size),
            ("remove", native_remove),
        ],
    );
}

fn instance_data(vm: &Vm, receiver: Value) -> Result<u32> {
    let instance = receiver
        .as_obj()
        .and_then(|handle| match vm.heap.get(handle) {
            Obj::Instance(instance) => instance.native_data,
            _ => None,
        });
    match instance {
        Some(data) => Ok(data),
        None => bail!("File method called on a non-file receiver."),
    }
}

fn native_constructor(
    vm: &mut Vm,
    receiver: Value,
    args: &[Value],
) -> Result<Value> {
    let Some(path) = args.first().map(|v| vm.value_to_string(*v)) else {
        bail!("File expects a path.");
    };
    let mode = args
        .get(1)
        .map(|v| vm.value_to_string(*v))
        .unwrap_or_else(|| "r".to_string());

    let file = match mode.as_str() {
        "w" => File::create(&path).ok(),
        "a" => OpenOptions::new().append(true).create(true).open(&path).ok(),
        _ => File::open(&path).ok(),
    };

    let data = vm.handles.store(FileHandle {
        file,
        path: path.clone(),
    });

    let Some(handle) = receiver.as_obj() else {
        bail!("File constructor requires an instance receiver.");
    };
    match vm.heap.get_mut(handle) {
        Obj::Instance(instance) => instance.native_data = Some(data),
        _ => bail!("File constructor requires an instance receiver."),
    }
    Ok(Value::Null)
}

fn native_read(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let data = instance_data(vm, receiver)?;
    let mut contents = String::new();
    match vm.handles.get_mut::<FileHandle>(data) {
        Some(FileHandle {
            file: Some(file), ..
        }) => {
            if file.read_to_string(&mut contents).is_err() {
                return Ok(Value::Null);
            }
        }
        _ => return Ok(Value::Null),
    }
    Ok(vm.new_string(&contents))
}

fn native_write(vm: &mut Vm, receiver: Value, args: &[Value]) -> Result<Value> {
    let data = instance_data(vm, receiver)?;
    let Some(text) = args.first().map(|v| vm.value_to_string(*v)) else {
        bail!("write expects a value.");
    };
    if let Some(FileHandle {
        file: Some(file), ..
    }) = vm.handles.get_mut::<FileHandle>(data)
    {
        let _ = file.write_all(text.as_bytes());
    }
    Ok(Value::Null)
}

fn native_close(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let data = instance_data(vm, receiver)?;
    if let Some(handle) = vm.handles.get_mut::<FileHandle>(data) {
        handle.file.take();
    }
    Ok(Value::Null)
}

fn native_is_open(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let data = instance_data(vm, receiver)?;
    let open = vm
        .handles
        .get::<FileHandle>(data)
        .map(|handle| handle.file.is_some())
        .unwrap_or(false);
    Ok(Value::Bool(open))
}

fn native_size(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let data = instance_data(vm, receiver)?;
    let Some(handle) = vm.handles.get_mut::<FileHandle>(data) else {
        return Ok(Value::Number(-1.0));
    };
    if let Some(file) = handle.file.as_mut() {
        let _ = file.flush();
    }
    match fs::metadata(&handle.path) {
        Ok(metadata) => Ok(Value::Number(metadata.len() as f64)),
        Err(_) => Ok(Value::Number(-1.0)),
    }
}

fn native_remove(vm: &mut Vm, receiver: Value, _args: &[Value]) -> Result<Value> {
    let data = instance_data(vm, receiver)?;
    let Some(handle) = vm.handles.get_mut::<FileHandle>(data) else {
        return Ok(Value::Bool(false));
    };
    handle.file.take();
    let path = handle.path.clone();
    Ok(Value::Bool(fs::remove_file(path).is_ok()))
}
