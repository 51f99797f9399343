//! Implementation of the iteration builtins: iter(), next(), reversed(), enumerate()
//! and zip().

use crate::{
    args::ArgValues,
    bytecode::vm::VM,
    exception::{ExcType, RunResult},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    types::IterState,
    value::Value,
};

/// Implementation of the iter() builtin function.
pub fn builtin_iter(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let iterable = args.get_one_arg("iter")?;
    vm.get_iter(iterable)
}

/// Implementation of the next() builtin function.
///
/// With a default, an exhausted iterator returns it instead of raising `StopIteration`.
pub fn builtin_next(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let (iter, default) = args.get_one_two_args("next")?;
    match vm.iter_next(&iter)? {
        Some(item) => Ok(item),
        None => default.ok_or_else(ExcType::stop_iteration),
    }
}

/// Implementation of the reversed() builtin function.
///
/// Works on sequences only; the items are snapshotted when the iterator is created.
pub fn builtin_reversed(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let seq = args.get_one_arg("reversed")?;
    let items: Vec<Value> = match &seq {
        Value::Str(text) => text.chars().rev().map(|c| Value::from(c.to_string())).collect(),
        Value::Ref(id) => match vm.heap.get(*id) {
            HeapData::List(items) | HeapData::Tuple(items) => items.iter().rev().cloned().collect(),
            HeapData::Range(range) => {
                let range = *range;
                (0..range.len()).rev().filter_map(|i| range.get(i)).map(Value::Int).collect()
            }
            other => {
                return Err(ExcType::type_error(format!(
                    "'{}' object is not reversible",
                    other.type_name()
                )));
            }
        },
        other => {
            return Err(ExcType::type_error(format!(
                "'{}' object is not reversible",
                other.type_name(vm.heap)
            )));
        }
    };
    let id = vm.heap.allocate(HeapData::Iter(IterState::Values { items, index: 0 }))?;
    Ok(Value::Ref(id))
}

/// Implementation of the enumerate() builtin function.
pub fn builtin_enumerate(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, mut args: ArgValues) -> RunResult<Value> {
    let start_kwarg = args.take_kwarg("start");
    let mut positional = args.get_at_most("enumerate", 2)?.into_iter();
    let Some(iterable) = positional.next() else {
        return Err(ExcType::type_error_missing("enumerate", "positional", &["iterable"]));
    };
    let start = match (positional.next(), start_kwarg) {
        (Some(_), Some(_)) => return Err(ExcType::type_error_multiple_values("enumerate", "start")),
        (Some(start), None) | (None, Some(start)) => start.as_int().ok_or_else(|| {
            ExcType::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                start.type_name(vm.heap)
            ))
        })?,
        (None, None) => 0,
    };
    let inner = vm.get_iter(iterable)?;
    let id = vm.heap.allocate(HeapData::Iter(IterState::Enumerate { inner, count: start }))?;
    Ok(Value::Ref(id))
}

/// Implementation of the zip() builtin function.
///
/// Stops at the shortest input; `zip()` with no arguments is empty.
pub fn builtin_zip(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    args.check_no_kwargs("zip")?;
    let mut inners = Vec::with_capacity(args.positional.len());
    for iterable in args.positional {
        inners.push(vm.get_iter(iterable)?);
    }
    let id = vm.heap.allocate(HeapData::Iter(IterState::Zip { inners }))?;
    Ok(Value::Ref(id))
}
