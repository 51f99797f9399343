//! Implementation of the min() and max() builtin functions.

use crate::{
    args::ArgValues,
    bytecode::{CompareKind, vm::VM},
    exception::{ExcType, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Implementation of the min() builtin function.
///
/// Accepts either one iterable or two or more positional arguments, plus the `key`
/// and `default` keywords.
pub fn builtin_min(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    extreme(vm, args, "min", CompareKind::Lt)
}

/// Implementation of the max() builtin function.
pub fn builtin_max(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    extreme(vm, args, "max", CompareKind::Gt)
}

/// Keeps the first item for which no later item compares `kind` against it.
fn extreme(
    vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>,
    mut args: ArgValues,
    name: &str,
    kind: CompareKind,
) -> RunResult<Value> {
    let key = args.take_kwarg("key").filter(|key| !key.is_none());
    let default = args.take_kwarg("default");
    args.check_no_kwargs(name)?;

    let items = match args.positional.len() {
        0 => return Err(ExcType::type_error_at_least(name, 1, 0)),
        1 => {
            let iterable = args.positional.swap_remove(0);
            vm.collect_iterable(iterable)?
        }
        _ if default.is_some() => {
            return Err(ExcType::type_error(format!(
                "Cannot specify a default for {name}() with multiple positional arguments"
            )));
        }
        _ => args.positional,
    };

    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let item_key = match &key {
            Some(func) => vm.call_sync(func.clone(), ArgValues::positional(vec![item.clone()]))?,
            None => item.clone(),
        };
        best = match best {
            Some((best_key, best_item)) if !vm.compare_order(kind, &item_key, &best_key)? => {
                Some((best_key, best_item))
            }
            _ => Some((item_key, item)),
        };
    }
    match best {
        Some((_, item)) => Ok(item),
        None => default.ok_or_else(|| ExcType::value_error(format!("{name}() iterable argument is empty"))),
    }
}
