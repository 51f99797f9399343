//! The runtime value representation.

use std::{borrow::Cow, sync::Arc};

use crate::{
    builtins::Builtins,
    bytecode::{Code, Const, vm::Unwinder},
    exception::{ExcType, RunResult},
    heap::{Heap, HeapData, HeapId},
    resource::ResourceTracker,
};

/// A value on the operand stack, in a slot, or inside a container.
///
/// Immediates are stored inline; anything with identity or interior mutability lives in
/// the heap and is referenced through `Ref`. Cloning a `Value` never copies heap data.
#[derive(Debug, Clone)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Ellipsis,
    /// A builtin function or builtin type.
    Builtin(Builtins),
    /// A builtin exception class.
    ExcType(ExcType),
    /// A code object loaded as a constant, consumed by `MAKE_FUNCTION`.
    Code(Arc<Code>),
    Ref(HeapId),
    /// A pending non-local exit parked on the stack while a `finally` body runs.
    /// Never visible to programs.
    Unwind(Box<Unwinder>),
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl Value {
    pub fn from_const(value: &Const) -> Self {
        match value {
            Const::None => Self::None,
            Const::Bool(b) => Self::Bool(*b),
            Const::Int(i) => Self::Int(*i),
            Const::Float(f) => Self::Float(*f),
            Const::Str(s) => Self::Str(s.clone()),
            Const::Ellipsis => Self::Ellipsis,
            Const::Code(code) => Self::Code(code.clone()),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[inline]
    pub fn ref_id(&self) -> Option<HeapId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Integer view of ints and bools, the operand types of integer arithmetic.
    #[inline]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Float view of any real number.
    #[inline]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            Self::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    /// `is` semantics: heap values compare by identity, immediates by value.
    pub fn is_identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b),
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }

    /// Name of the value's type, e.g. `int`, `list` or a user class name.
    pub fn type_name(&self, heap: &Heap<impl ResourceTracker>) -> Cow<'static, str> {
        match self {
            Self::None => "NoneType".into(),
            Self::Bool(_) => "bool".into(),
            Self::Int(_) => "int".into(),
            Self::Float(_) => "float".into(),
            Self::Str(_) => "str".into(),
            Self::Ellipsis => "ellipsis".into(),
            Self::Builtin(b) if b.is_type() => "type".into(),
            Self::Builtin(_) => "builtin_function_or_method".into(),
            Self::ExcType(_) => "type".into(),
            Self::Code(_) => "code".into(),
            Self::Unwind(_) => "unwinder".into(),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Instance(instance) => match heap.get(instance.class) {
                    HeapData::Class(class) => class.name.to_string().into(),
                    other => other.type_name().into(),
                },
                HeapData::Exception(exc) => exc.class_name(heap).into(),
                other => other.type_name().into(),
            },
        }
    }

    /// The value's class as a value: what `type(x)` returns.
    pub fn class_of(&self, heap: &Heap<impl ResourceTracker>) -> Self {
        let builtin = match self {
            Self::None => Builtins::NoneType,
            Self::Bool(_) => Builtins::Bool,
            Self::Int(_) => Builtins::Int,
            Self::Float(_) => Builtins::Float,
            Self::Str(_) => Builtins::Str,
            Self::Ellipsis => Builtins::Object,
            Self::Builtin(b) if b.is_type() => Builtins::Type,
            Self::Builtin(_) => Builtins::BuiltinFunction,
            Self::ExcType(_) | Self::Code(_) | Self::Unwind(_) => Builtins::Type,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Instance(instance) => return Self::Ref(instance.class),
                HeapData::Exception(exc) => return exc.class.to_value(),
                HeapData::List(_) => Builtins::List,
                HeapData::Tuple(_) => Builtins::Tuple,
                HeapData::Dict(_) => Builtins::Dict,
                HeapData::Set(_) => Builtins::Set,
                HeapData::Range(_) => Builtins::Range,
                HeapData::Function(_) => Builtins::Function,
                HeapData::BoundMethod(_) => Builtins::Method,
                HeapData::BuiltinMethod(_) => Builtins::BuiltinFunction,
                HeapData::Class(_) => Builtins::Type,
                HeapData::Super(_) => Builtins::Super,
                HeapData::Generator(_) => Builtins::Generator,
                HeapData::Iter(_) | HeapData::Cell(_) => Builtins::Iterator,
            },
        };
        Self::Builtin(builtin)
    }

    /// Truthiness of values that don't need a dunder call; `None` for user instances.
    pub fn plain_truth(&self, heap: &Heap<impl ResourceTracker>) -> Option<bool> {
        let truth = match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::List(items) | HeapData::Tuple(items) => !items.is_empty(),
                HeapData::Dict(dict) => !dict.is_empty(),
                HeapData::Set(set) => !set.is_empty(),
                HeapData::Range(range) => range.len() > 0,
                HeapData::Instance(_) => return None,
                _ => true,
            },
            _ => true,
        };
        Some(truth)
    }

    /// Converts an index operand, accepting ints and bools.
    pub fn as_index(&self, heap: &Heap<impl ResourceTracker>) -> RunResult<i64> {
        self.as_int().ok_or_else(|| {
            ExcType::type_error(format!(
                "indices must be integers, not '{}'",
                self.type_name(heap)
            ))
        })
    }
}

/// Normalises a possibly negative index against `len`, `None` when out of range.
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_indices_wrap_once() {
        assert_eq!(normalize_index(-1, 3), Some(2));
        assert_eq!(normalize_index(-3, 3), Some(0));
        assert_eq!(normalize_index(-4, 3), None);
        assert_eq!(normalize_index(3, 3), None);
        assert_eq!(normalize_index(0, 0), None);
    }

    #[test]
    fn identity_of_immediates() {
        assert!(Value::None.is_identical(&Value::None));
        assert!(Value::Int(5).is_identical(&Value::Int(5)));
        assert!(!Value::Int(1).is_identical(&Value::Bool(true)));
        assert!(!Value::Float(0.0).is_identical(&Value::Float(-0.0)));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Bool(true).as_int(), Some(1));
        assert_eq!(Value::Int(3).as_float(), Some(3.0));
        assert_eq!(Value::from("x").as_int(), None);
    }
}
