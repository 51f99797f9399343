//! Implementation of the sum() builtin function.

use crate::{
    args::ArgValues,
    bytecode::{Opcode, vm::VM},
    exception::{ExcType, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Implementation of the sum() builtin function.
///
/// Adds the items of an iterable to `start` (default `0`) with the `+` operator, so
/// user `__add__`/`__radd__` take part. Strings are rejected as a start value.
pub fn builtin_sum(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, mut args: ArgValues) -> RunResult<Value> {
    let start_kwarg = args.take_kwarg("start");
    let mut positional = args.get_at_most("sum", 2)?.into_iter();
    let Some(iterable) = positional.next() else {
        return Err(ExcType::type_error_at_least("sum", 1, 0));
    };
    let start = match (positional.next(), start_kwarg) {
        (Some(_), Some(_)) => return Err(ExcType::type_error_multiple_values("sum", "start")),
        (Some(start), None) | (None, Some(start)) => start,
        (None, None) => Value::Int(0),
    };
    if matches!(start, Value::Str(_)) {
        return Err(ExcType::type_error("sum() can't sum strings [use ''.join(seq) instead]"));
    }

    let iter = vm.get_iter(iterable)?;
    let mut total = start;
    while let Some(item) = vm.iter_next(&iter)? {
        total = vm.binary_opcode(Opcode::BinaryAdd, total, item)?;
    }
    Ok(total)
}
