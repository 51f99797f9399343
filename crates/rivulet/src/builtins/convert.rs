//! Implementation of the builtin types used as conversion constructors: bool(),
//! int(), float(), str(), list(), tuple(), dict(), set() and range().

use crate::{
    args::ArgValues,
    bytecode::vm::{VM, string_repr},
    exception::{ExcType, RunResult, SimpleException},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Dict, Range},
    value::Value,
};

/// Implementation of bool().
pub fn builtin_bool(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    match args.get_at_most("bool", 1)?.pop() {
        Some(value) => vm.truthy(&value).map(Value::Bool),
        None => Ok(Value::Bool(false)),
    }
}

/// Implementation of int().
///
/// Accepts numbers (floats truncate toward zero), strings in an optional base, and
/// instances defining `__int__`.
pub fn builtin_int(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, mut args: ArgValues) -> RunResult<Value> {
    let base_kwarg = args.take_kwarg("base");
    let mut positional = args.get_at_most("int", 2)?.into_iter();
    let value = positional.next();
    let base = match (positional.next(), base_kwarg) {
        (Some(_), Some(_)) => return Err(ExcType::type_error_multiple_values("int", "base")),
        (Some(base), None) | (None, Some(base)) => Some(base.as_index(vm.heap)?),
        (None, None) => None,
    };

    let Some(value) = value else {
        return match base {
            Some(_) => Err(ExcType::type_error("int() missing string argument")),
            None => Ok(Value::Int(0)),
        };
    };
    if let Some(base) = base {
        let Value::Str(text) = &value else {
            return Err(ExcType::type_error("int() can't convert non-string with explicit base"));
        };
        if base != 0 && !(2..=36).contains(&base) {
            return Err(ExcType::value_error("int() base must be >= 2 and <= 36, or 0"));
        }
        return parse_int(text, base as u32).map(Value::Int);
    }

    match &value {
        Value::Int(_) | Value::Bool(_) => Ok(Value::Int(value.as_int().unwrap_or_default())),
        Value::Float(f) => float_to_int(*f).map(Value::Int),
        Value::Str(text) => parse_int(text, 10).map(Value::Int),
        _ => match vm.call_dunder(&value, "__int__", Vec::new())? {
            Some(result @ Value::Int(_)) => Ok(result),
            Some(other) => Err(ExcType::type_error(format!(
                "__int__ returned non-int (type {})",
                other.type_name(vm.heap)
            ))),
            None => Err(ExcType::type_error(format!(
                "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                value.type_name(vm.heap)
            ))),
        },
    }
}

/// Implementation of float().
pub fn builtin_float(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let Some(value) = args.get_at_most("float", 1)?.pop() else {
        return Ok(Value::Float(0.0));
    };
    if let Some(f) = value.as_float() {
        return Ok(Value::Float(f));
    }
    match &value {
        Value::Str(text) => parse_float(text).map(Value::Float),
        _ => match vm.call_dunder(&value, "__float__", Vec::new())? {
            Some(result @ Value::Float(_)) => Ok(result),
            Some(other) => Err(ExcType::type_error(format!(
                "__float__ returned non-float (type {})",
                other.type_name(vm.heap)
            ))),
            None => Err(ExcType::type_error(format!(
                "float() argument must be a string or a real number, not '{}'",
                value.type_name(vm.heap)
            ))),
        },
    }
}

/// Implementation of str().
pub fn builtin_str(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    match args.get_at_most("str", 1)?.pop() {
        Some(value @ Value::Str(_)) => Ok(value),
        Some(value) => vm.str(&value).map(Value::from),
        None => Ok(Value::from("")),
    }
}

/// Implementation of list().
pub fn builtin_list(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let items = match args.get_at_most("list", 1)?.pop() {
        Some(iterable) => vm.collect_iterable(iterable)?,
        None => Vec::new(),
    };
    Ok(Value::Ref(vm.heap.allocate(HeapData::List(items))?))
}

/// Implementation of tuple(). A tuple argument is returned as is.
pub fn builtin_tuple(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let items = match args.get_at_most("tuple", 1)?.pop() {
        Some(Value::Ref(id)) if matches!(vm.heap.get(id), HeapData::Tuple(_)) => return Ok(Value::Ref(id)),
        Some(iterable) => vm.collect_iterable(iterable)?,
        None => Vec::new(),
    };
    Ok(Value::Ref(vm.heap.allocate(HeapData::Tuple(items))?))
}

/// Implementation of dict(): from a mapping or an iterable of pairs, then keyword
/// arguments.
pub fn builtin_dict(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, mut args: ArgValues) -> RunResult<Value> {
    let kwargs = std::mem::take(&mut args.kwargs);
    let source = args.get_at_most("dict", 1)?.pop();
    let dict = Value::Ref(vm.heap.allocate(HeapData::Dict(Dict::new()))?);
    if let Some(source) = source {
        vm.dict_update(&dict, source)?;
    }
    for (key, value) in kwargs {
        vm.dict_insert(&dict, Value::Str(key), value)?;
    }
    Ok(dict)
}

/// Implementation of set().
pub fn builtin_set(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let items = match args.get_at_most("set", 1)?.pop() {
        Some(iterable) => vm.collect_iterable(iterable)?,
        None => Vec::new(),
    };
    vm.new_set(items)
}

/// Implementation of range(): `range(stop)` or `range(start, stop[, step])`.
pub fn builtin_range(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    args.check_no_kwargs("range")?;
    let mut bounds = Vec::with_capacity(3);
    for value in &args.positional {
        bounds.push(value.as_int().ok_or_else(|| {
            ExcType::type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                value.type_name(vm.heap)
            ))
        })?);
    }
    let range = match bounds[..] {
        [stop] => Range::new(0, stop, 1)?,
        [start, stop] => Range::new(start, stop, 1)?,
        [start, stop, step] => Range::new(start, stop, step)?,
        [] => return Err(ExcType::type_error_at_least("range", 1, 0)),
        _ => return Err(ExcType::type_error_at_most("range", 3, bounds.len())),
    };
    Ok(Value::Ref(vm.heap.allocate(HeapData::Range(range))?))
}

fn float_to_int(f: f64) -> RunResult<i64> {
    if f.is_nan() {
        return Err(ExcType::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(SimpleException::new_msg(ExcType::OverflowError, "cannot convert float infinity to integer").into());
    }
    let truncated = f.trunc();
    // i64::MAX as f64 rounds up to 2^63, which is out of range.
    if truncated < -(2f64.powi(63)) || truncated >= 2f64.powi(63) {
        return Err(ExcType::overflow());
    }
    Ok(truncated as i64)
}

/// Parses an integer literal the way `int(text, base)` does: surrounding whitespace,
/// a sign, a base prefix when `base` is 0 or matches it, and single underscores
/// between digits.
fn parse_int(text: &str, base: u32) -> RunResult<i64> {
    let invalid = || {
        let mut literal = String::new();
        string_repr(text, &mut literal);
        ExcType::value_error(format!("invalid literal for int() with base {base}: {literal}"))
    };

    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let lower = unsigned.to_ascii_lowercase();
    let prefixed = |prefix: &str, radix: u32| (base == 0 || base == radix) && lower.starts_with(prefix);
    let (radix, digits) = if prefixed("0x", 16) {
        (16, &unsigned[2..])
    } else if prefixed("0o", 8) {
        (8, &unsigned[2..])
    } else if prefixed("0b", 2) {
        (2, &unsigned[2..])
    } else if base == 0 {
        // A base-0 literal with leading zeros must be zero itself.
        if unsigned.starts_with('0') && !unsigned.trim_start_matches(['0', '_']).is_empty() {
            return Err(invalid());
        }
        (10, unsigned)
    } else {
        (base, unsigned)
    };
    // An underscore may follow a base prefix.
    let digits = if digits.len() < unsigned.len() {
        digits.strip_prefix('_').unwrap_or(digits)
    } else {
        digits
    };

    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__") {
        return Err(invalid());
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    let magnitude = u64::from_str_radix(&cleaned, radix).map_err(|err| match err.kind() {
        std::num::IntErrorKind::PosOverflow => ExcType::overflow(),
        _ => invalid(),
    })?;
    if negative {
        0i64.checked_sub_unsigned(magnitude).ok_or_else(ExcType::overflow)
    } else {
        i64::try_from(magnitude).map_err(|_| ExcType::overflow())
    }
}

fn parse_float(text: &str) -> RunResult<f64> {
    let trimmed = text.trim();
    let valid_underscores = !trimmed.starts_with('_') && !trimmed.ends_with('_') && !trimmed.contains("__");
    let cleaned = trimmed.replace('_', "");
    match cleaned.parse::<f64>() {
        Ok(f) if valid_underscores && !trimmed.is_empty() => Ok(f),
        _ => {
            let mut literal = String::new();
            string_repr(text, &mut literal);
            Err(ExcType::value_error(format!("could not convert string to float: {literal}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_literals() {
        assert_eq!(parse_int(" 42\n", 10).unwrap(), 42);
        assert_eq!(parse_int("-1_000", 10).unwrap(), -1000);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert_eq!(parse_int("0x1F", 0).unwrap(), 31);
        assert_eq!(parse_int("0b101", 2).unwrap(), 5);
        assert_eq!(parse_int("-9223372036854775808", 10).unwrap(), i64::MIN);
        assert!(parse_int("9223372036854775808", 10).is_err());
        assert!(parse_int("1__0", 10).is_err());
        assert!(parse_int("abc", 10).is_err());
        assert!(parse_int("", 10).is_err());
        assert!(parse_int("012", 0).is_err());
        assert_eq!(parse_int("000", 0).unwrap(), 0);
    }

    #[test]
    fn float_literals() {
        assert_eq!(parse_float(" 1.5 ").unwrap(), 1.5);
        assert_eq!(parse_float("1e3").unwrap(), 1000.0);
        assert!(parse_float("inf").unwrap().is_infinite());
        assert!(parse_float("nan").unwrap().is_nan());
        assert!(parse_float("1.2.3").is_err());
        assert!(parse_float("").is_err());
    }

    #[test]
    fn float_truncation() {
        assert_eq!(float_to_int(-2.7).unwrap(), -2);
        assert!(float_to_int(f64::NAN).is_err());
        assert!(float_to_int(1e19).is_err());
    }
}
