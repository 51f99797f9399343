//! Implementation of the isinstance() and issubclass() builtin functions.

use super::Builtins;
use crate::{
    args::ArgValues,
    bytecode::vm::VM,
    exception::{ExcType, RunResult},
    heap::{Heap, HeapData},
    io::PrintWriter,
    resource::ResourceTracker,
    types::ExcClass,
    value::Value,
};

/// Implementation of the isinstance() builtin function.
///
/// Checks if an object is an instance of a class or a tuple of classes.
pub fn builtin_isinstance(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let (obj, classinfo) = args.get_two_args("isinstance")?;
    let class = obj.class_of(vm.heap);
    match subclass_check(&class, &classinfo, vm.heap) {
        Some(result) => Ok(Value::Bool(result)),
        None => Err(ExcType::type_error(
            "isinstance() arg 2 must be a type, a tuple of types, or a union",
        )),
    }
}

/// Implementation of the issubclass() builtin function.
pub fn builtin_issubclass(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let (class, classinfo) = args.get_two_args("issubclass")?;
    if !is_class(&class, vm.heap) {
        return Err(ExcType::type_error("issubclass() arg 1 must be a class"));
    }
    match subclass_check(&class, &classinfo, vm.heap) {
        Some(result) => Ok(Value::Bool(result)),
        None => Err(ExcType::type_error(
            "issubclass() arg 2 must be a class, a tuple of classes, or a union",
        )),
    }
}

fn is_class(value: &Value, heap: &Heap<impl ResourceTracker>) -> bool {
    match value {
        Value::ExcType(_) => true,
        Value::Builtin(b) => b.is_type(),
        Value::Ref(id) => matches!(heap.get(*id), HeapData::Class(_)),
        _ => false,
    }
}

/// Whether `class` derives from `classinfo` (a class or a nested tuple of classes);
/// `None` when `classinfo` is not a class.
///
/// Supports:
/// - Builtin types, with `bool` a subclass of `int` and everything a subclass of `object`
/// - Exception hierarchies, including user classes deriving from builtin exceptions
/// - User classes through their lookup order
fn subclass_check(class: &Value, classinfo: &Value, heap: &Heap<impl ResourceTracker>) -> Option<bool> {
    match classinfo {
        Value::Builtin(Builtins::Object) => Some(true),
        Value::Builtin(target) if target.is_type() => Some(match class {
            Value::Builtin(b) => b == target || (*b == Builtins::Bool && *target == Builtins::Int),
            _ => false,
        }),
        Value::ExcType(_) => Some(match class {
            Value::ExcType(t) => ExcClass::Builtin(*t).is_subclass_of(classinfo, heap),
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Class(c) => c.exc_base.is_some() && ExcClass::User(*id).is_subclass_of(classinfo, heap),
                _ => false,
            },
            _ => false,
        }),
        Value::Ref(target) => match heap.get(*target) {
            HeapData::Tuple(options) => {
                for option in options {
                    if subclass_check(class, option, heap)? {
                        return Some(true);
                    }
                }
                Some(false)
            }
            HeapData::Class(_) => Some(match class {
                Value::Ref(id) => match heap.get(*id) {
                    HeapData::Class(c) => c.derives_from(*target),
                    _ => false,
                },
                _ => false,
            }),
            _ => None,
        },
        _ => None,
    }
}
