//! Built-in functions and types.
//!
//! `Builtins` names every callable bound in the builtin namespace, plus a few
//! internal types that only appear as `type(x)` results. The implementations live in
//! one submodule per builtin (or per family) and receive the engine, since many of them
//! call back into user code: `sorted(key=...)`, `str()` on an instance with `__str__`,
//! `list()` over a generator.

mod attr;
mod convert;
mod isinstance;
mod iter;
mod min_max;
mod print;
mod sorted;
mod sum;
mod type_;

use std::{fmt, str::FromStr};

use strum::{EnumString, IntoStaticStr};

use crate::{
    args::ArgValues,
    bytecode::vm::{CallResult, VM},
    exception::{ExcType, RunResult},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Every builtin function and type.
///
/// Uses strum derives for `FromStr` and `Into<&'static str>`; the string form is the
/// name the builtin is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Builtins {
    // --- functions ---
    Print,
    Len,
    Iter,
    Next,
    Repr,
    Isinstance,
    Issubclass,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Hasattr,
    Getattr,
    Setattr,
    Id,
    Callable,
    #[strum(serialize = "__build_class__")]
    BuildClass,

    // --- types callable as constructors ---
    Object,
    Type,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    Range,
    Super,
    Reversed,
    Enumerate,
    Zip,

    // --- types that are never bound to a name ---
    #[strum(serialize = "NoneType")]
    NoneType,
    #[strum(serialize = "function")]
    Function,
    #[strum(serialize = "method")]
    Method,
    #[strum(serialize = "builtin_function_or_method")]
    BuiltinFunction,
    #[strum(serialize = "generator")]
    Generator,
    #[strum(serialize = "iterator")]
    Iterator,
}

impl Builtins {
    /// Resolves a name in the builtin namespace.
    pub fn lookup(name: &str) -> Option<Value> {
        if let Ok(builtin) = Self::from_str(name)
            && builtin.is_bound()
        {
            return Some(Value::Builtin(builtin));
        }
        ExcType::from_str(name).ok().map(Value::ExcType)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether this builtin is a type, i.e. `type(b)` is `type`.
    pub fn is_type(self) -> bool {
        !matches!(
            self,
            Self::Print
                | Self::Len
                | Self::Iter
                | Self::Next
                | Self::Repr
                | Self::Isinstance
                | Self::Issubclass
                | Self::Abs
                | Self::Min
                | Self::Max
                | Self::Sum
                | Self::Sorted
                | Self::Hasattr
                | Self::Getattr
                | Self::Setattr
                | Self::Id
                | Self::Callable
                | Self::BuildClass
        )
    }

    /// Whether the builtin namespace binds this variant to its name.
    fn is_bound(self) -> bool {
        !matches!(
            self,
            Self::NoneType | Self::Function | Self::Method | Self::BuiltinFunction | Self::Generator | Self::Iterator
        )
    }

    /// Calls this builtin. Only `__build_class__` produces a frame: the class body
    /// runs on the engine's frame stack.
    pub fn call(
        self,
        vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>,
        args: ArgValues,
    ) -> RunResult<CallResult> {
        let value = match self {
            Self::BuildClass => return type_::builtin_build_class(vm, args),
            Self::Print => print::builtin_print(vm, args)?,
            Self::Len => builtin_len(vm, args)?,
            Self::Iter => iter::builtin_iter(vm, args)?,
            Self::Next => iter::builtin_next(vm, args)?,
            Self::Repr => {
                let value = args.get_one_arg("repr")?;
                Value::from(vm.repr(&value)?)
            }
            Self::Isinstance => isinstance::builtin_isinstance(vm, args)?,
            Self::Issubclass => isinstance::builtin_issubclass(vm, args)?,
            Self::Abs => builtin_abs(vm, args)?,
            Self::Min => min_max::builtin_min(vm, args)?,
            Self::Max => min_max::builtin_max(vm, args)?,
            Self::Sum => sum::builtin_sum(vm, args)?,
            Self::Sorted => sorted::builtin_sorted(vm, args)?,
            Self::Hasattr => attr::builtin_hasattr(vm, args)?,
            Self::Getattr => attr::builtin_getattr(vm, args)?,
            Self::Setattr => attr::builtin_setattr(vm, args)?,
            Self::Id => builtin_id(vm, args)?,
            Self::Callable => {
                let value = args.get_one_arg("callable")?;
                Value::Bool(vm.is_callable(&value))
            }
            Self::Object => {
                args.check_zero_args("object")?;
                return Err(ExcType::type_error("cannot create 'object' instances"));
            }
            Self::Type => type_::builtin_type(vm, args)?,
            Self::Super => type_::builtin_super(vm, args)?,
            Self::Bool => convert::builtin_bool(vm, args)?,
            Self::Int => convert::builtin_int(vm, args)?,
            Self::Float => convert::builtin_float(vm, args)?,
            Self::Str => convert::builtin_str(vm, args)?,
            Self::List => convert::builtin_list(vm, args)?,
            Self::Tuple => convert::builtin_tuple(vm, args)?,
            Self::Dict => convert::builtin_dict(vm, args)?,
            Self::Set => convert::builtin_set(vm, args)?,
            Self::Range => convert::builtin_range(vm, args)?,
            Self::Reversed => iter::builtin_reversed(vm, args)?,
            Self::Enumerate => iter::builtin_enumerate(vm, args)?,
            Self::Zip => iter::builtin_zip(vm, args)?,
            Self::NoneType | Self::Function | Self::Method | Self::BuiltinFunction | Self::Generator | Self::Iterator => {
                return Err(ExcType::type_error(format!("cannot create '{}' instances", self.name())));
            }
        };
        Ok(CallResult::Value(value))
    }
}

impl fmt::Display for Builtins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_type() {
            write!(f, "<class '{}'>", self.name())
        } else {
            write!(f, "<built-in function {}>", self.name())
        }
    }
}

fn builtin_len(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let value = args.get_one_arg("len")?;
    let len = vm.len(&value)?;
    Ok(Value::Int(i64::try_from(len).map_err(|_| ExcType::overflow())?))
}

/// Absolute value of a number; `abs(i64::MIN)` overflows.
fn builtin_abs(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let value = args.get_one_arg("abs")?;
    match &value {
        Value::Int(n) => n.checked_abs().map(Value::Int).ok_or_else(ExcType::overflow),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => match vm.call_dunder(&value, "__abs__", Vec::new())? {
            Some(result) => Ok(result),
            None => Err(ExcType::type_error(format!(
                "bad operand type for abs(): '{}'",
                value.type_name(vm.heap)
            ))),
        },
    }
}

/// Identity of a value: the heap slot for references, a stable hash for immediates.
fn builtin_id(vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>, args: ArgValues) -> RunResult<Value> {
    let value = args.get_one_arg("id")?;
    let id = match &value {
        Value::Ref(id) => id.index() as i64,
        other => {
            // Immediates have no slot; offset past any plausible heap index.
            let text = vm.repr(other)?;
            let hash = text.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
            (hash >> 2) as i64 | (1 << 60)
        }
    };
    Ok(Value::Int(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_skips_internal_types() {
        assert!(matches!(Builtins::lookup("len"), Some(Value::Builtin(Builtins::Len))));
        assert!(matches!(
            Builtins::lookup("__build_class__"),
            Some(Value::Builtin(Builtins::BuildClass))
        ));
        assert!(matches!(
            Builtins::lookup("KeyError"),
            Some(Value::ExcType(ExcType::KeyError))
        ));
        assert!(Builtins::lookup("generator").is_none());
        assert!(Builtins::lookup("NoneType").is_none());
        assert!(Builtins::lookup("open").is_none());
    }

    #[test]
    fn display_distinguishes_types_and_functions() {
        assert_eq!(Builtins::Int.to_string(), "<class 'int'>");
        assert_eq!(Builtins::Print.to_string(), "<built-in function print>");
        assert_eq!(Builtins::NoneType.to_string(), "<class 'NoneType'>");
    }
}
