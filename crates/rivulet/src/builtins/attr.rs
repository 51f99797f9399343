//! Implementation of the hasattr(), getattr() and setattr() builtin functions.

use std::sync::Arc;

use crate::{
    args::ArgValues,
    bytecode::vm::VM,
    exception::{ExcType, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Implementation of the hasattr() builtin function.
///
/// Only `AttributeError` means "absent"; any other error raised while looking the
/// attribute up propagates.
pub fn builtin_hasattr(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let (obj, name) = args.get_two_args("hasattr")?;
    let name = attr_name(vm, &name)?;
    match vm.get_attr(&obj, &name) {
        Ok(_) => Ok(Value::Bool(true)),
        Err(err) if vm.error_is(&err, ExcType::AttributeError) => Ok(Value::Bool(false)),
        Err(err) => Err(err),
    }
}

/// Implementation of the getattr() builtin function.
pub fn builtin_getattr(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    args.check_no_kwargs("getattr")?;
    let count = args.positional.len();
    let mut positional = args.positional.into_iter();
    let (obj, name, default) = match (positional.next(), positional.next(), positional.next()) {
        (Some(obj), Some(name), default) if count <= 3 => (obj, name, default),
        _ if count < 2 => return Err(ExcType::type_error_at_least("getattr", 2, count)),
        _ => return Err(ExcType::type_error_at_most("getattr", 3, count)),
    };
    let name = attr_name(vm, &name)?;
    match (vm.get_attr(&obj, &name), default) {
        (Ok(value), _) => Ok(value),
        (Err(err), Some(default)) if vm.error_is(&err, ExcType::AttributeError) => Ok(default),
        (Err(err), _) => Err(err),
    }
}

/// Implementation of the setattr() builtin function.
pub fn builtin_setattr(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    args.check_no_kwargs("setattr")?;
    let [obj, name, value] = <[Value; 3]>::try_from(args.positional).map_err(|positional| {
        ExcType::type_error(format!("setattr expected 3 arguments, got {}", positional.len()))
    })?;
    let name = attr_name(vm, &name)?;
    vm.set_attr(&obj, &name, value)?;
    Ok(Value::None)
}

fn attr_name(vm: &VM<'_, impl ResourceTracker, impl PrintWriter>, name: &Value) -> RunResult<Arc<str>> {
    match name {
        Value::Str(name) => Ok(name.clone()),
        other => Err(ExcType::type_error(format!(
            "attribute name must be string, not '{}'",
            other.type_name(vm.heap)
        ))),
    }
}
