//! Implementation of the class-related builtins: `__build_class__`, type() and super().

use crate::{
    args::ArgValues,
    bytecode::vm::{CallResult, VM},
    exception::{ExcType, RunResult},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    types::SuperProxy,
    value::Value,
};

/// `__build_class__(func, name, *bases)`, emitted by the compiler for `class`
/// statements.
///
/// Returns the class body's frame; the class is created when that frame returns its
/// namespace.
pub fn builtin_build_class(
    vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>,
    args: ArgValues,
) -> RunResult<CallResult> {
    args.check_no_kwargs("__build_class__")?;
    let count = args.positional.len();
    let mut positional = args.positional.into_iter();
    let (Some(func), Some(name)) = (positional.next(), positional.next()) else {
        return Err(ExcType::type_error(format!(
            "__build_class__: not enough arguments (got {count})"
        )));
    };
    let Value::Str(name) = name else {
        return Err(ExcType::type_error("__build_class__: name is not a string"));
    };
    vm.class_body_frame(&func, name, positional.collect())
}

/// Implementation of the one-argument form of type().
pub fn builtin_type(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    args.check_no_kwargs("type")?;
    match <[Value; 1]>::try_from(args.positional) {
        Ok([value]) => Ok(value.class_of(vm.heap)),
        Err(_) => Err(ExcType::type_error("type() takes 1 argument")),
    }
}

/// Implementation of super().
///
/// Methods calling `super()` with no arguments are compiled into the explicit
/// `super(__class__, self)` form, so only that form reaches here.
pub fn builtin_super(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    args.check_no_kwargs("super")?;
    let [class, receiver] = match <[Value; 2]>::try_from(args.positional) {
        Ok(pair) => pair,
        Err(positional) if positional.is_empty() => {
            return Err(ExcType::runtime_error("super(): no arguments"));
        }
        Err(positional) => return Err(ExcType::type_error_at_most("super", 2, positional.len())),
    };

    let class_id = match &class {
        Value::Ref(id) if matches!(vm.heap.get(*id), HeapData::Class(_)) => *id,
        other => {
            return Err(ExcType::type_error(format!(
                "super() argument 1 must be a type, not {}",
                other.type_name(vm.heap)
            )));
        }
    };
    let derives = vm
        .user_class(&receiver)
        .is_some_and(|receiver_class| match vm.heap.get(receiver_class) {
            HeapData::Class(receiver_class) => receiver_class.derives_from(class_id),
            _ => false,
        });
    if !derives {
        return Err(ExcType::type_error("super(type, obj): obj must be an instance or subtype of type"));
    }

    let proxy = vm.heap.allocate(HeapData::Super(SuperProxy {
        class: class_id,
        receiver,
    }))?;
    Ok(Value::Ref(proxy))
}
