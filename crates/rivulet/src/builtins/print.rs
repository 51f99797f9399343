//! Implementation of the print() builtin function.

use crate::{
    args::ArgValues,
    bytecode::vm::VM,
    exception::{ExcType, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Implementation of the print() builtin function.
///
/// Supports the `sep` and `end` keyword arguments; `None` selects the default. Every
/// argument is converted with `str()` before anything is written, so a failing
/// `__str__` prints nothing.
pub fn builtin_print(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, mut args: ArgValues) -> RunResult<Value> {
    let sep = string_kwarg(vm, args.take_kwarg("sep"), "sep")?;
    let end = string_kwarg(vm, args.take_kwarg("end"), "end")?;
    if let Some((key, _)) = args.kwargs.first() {
        return Err(ExcType::type_error(format!("'{key}' is an invalid keyword argument for print()")));
    }

    let mut parts = Vec::with_capacity(args.positional.len());
    for value in &args.positional {
        parts.push(vm.str(value)?);
    }

    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            match &sep {
                Some(sep) => sep.chars().for_each(|c| vm.print.push(c)),
                None => vm.print.push(' '),
            }
        }
        vm.print.write(part.into());
    }
    match end {
        Some(end) => end.chars().for_each(|c| vm.print.push(c)),
        None => vm.print.push('\n'),
    }
    Ok(Value::None)
}

/// `None` and absent both mean "use the default".
fn string_kwarg(
    vm: &VM<'_, impl ResourceTracker, impl PrintWriter>,
    value: Option<Value>,
    name: &str,
) -> RunResult<Option<String>> {
    match value {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.to_string())),
        Some(other) => Err(ExcType::type_error(format!(
            "{name} must be None or a string, not {}",
            other.type_name(vm.heap)
        ))),
    }
}
