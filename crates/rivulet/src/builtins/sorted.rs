//! Implementation of the sorted() builtin function.

use crate::{
    args::ArgValues,
    bytecode::vm::VM,
    exception::{ExcType, RunResult},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Implementation of the sorted() builtin function.
///
/// Returns a new list; the sort is stable and honours the `key` and `reverse` keywords.
pub fn builtin_sorted(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, mut args: ArgValues) -> RunResult<Value> {
    let key = args.take_kwarg("key").filter(|key| !key.is_none());
    let reverse = match args.take_kwarg("reverse") {
        Some(reverse) => vm.truthy(&reverse)?,
        None => false,
    };
    args.check_no_kwargs("sorted")?;
    let iterable = match <[Value; 1]>::try_from(args.positional) {
        Ok([iterable]) => iterable,
        Err(positional) => {
            return Err(ExcType::type_error(format!(
                "sorted expected 1 argument, got {}",
                positional.len()
            )));
        }
    };

    let items = vm.collect_iterable(iterable)?;
    let sorted = vm.sort_values(items, key, reverse)?;
    Ok(Value::Ref(vm.heap.allocate(HeapData::List(sorted))?))
}
