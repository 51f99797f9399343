use std::fmt::{self, Write};

use ahash::AHashSet;

use crate::{
    bytecode::vm::{VM, float_repr, string_repr},
    exception::RunResult,
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    value::Value,
};

/// Heap data copied out before conversion recurses.
enum Shape {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    Exception,
    Other,
}

/// A value returned from the interpreter.
///
/// This is the public-facing form of a result. It owns all its data and can be freely
/// cloned, compared or serialized; unlike the internal `Value` it needs no heap.
///
/// Builtin containers convert structurally. Everything else (functions, classes,
/// instances, iterators) becomes `Repr`, holding the `repr()` the program would have
/// printed, so user `__repr__` methods take part.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Object {
    /// The `None` singleton.
    None,
    /// The `Ellipsis` singleton (`...`).
    Ellipsis,
    Bool(bool),
    /// Integer (64-bit signed).
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Self>),
    Tuple(Vec<Self>),
    /// Dictionary entries in insertion order.
    Dict(Vec<(Self, Self)>),
    /// Set members in insertion order.
    Set(Vec<Self>),
    /// An exception instance returned as a value (not raised).
    Exception {
        /// Class name, e.g. `ValueError` or a user class.
        type_name: String,
        /// `str()` of the exception, `None` when it has no arguments.
        message: Option<String>,
    },
    /// Fallback for values with no structural mapping: their `repr()`.
    Repr(String),
    /// A container reached again while converting itself, e.g. `a = []; a.append(a)`.
    ///
    /// Holds the placeholder the repr would show: `[...]`, `(...)` or `{...}`.
    Cycle(String),
}

impl Object {
    /// Converts a heap value, running user `__repr__`/`__str__` where a fallback needs them.
    pub(crate) fn new(value: &Value, vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>) -> RunResult<Self> {
        Self::from_value(value, vm, &mut AHashSet::new())
    }

    fn from_value(
        value: &Value,
        vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>,
        seen: &mut AHashSet<HeapId>,
    ) -> RunResult<Self> {
        let id = match value {
            Value::None => return Ok(Self::None),
            Value::Ellipsis => return Ok(Self::Ellipsis),
            Value::Bool(b) => return Ok(Self::Bool(*b)),
            Value::Int(i) => return Ok(Self::Int(*i)),
            Value::Float(f) => return Ok(Self::Float(*f)),
            Value::Str(s) => return Ok(Self::String(s.to_string())),
            Value::Ref(id) => *id,
            other => return vm.repr(other).map(Self::Repr),
        };

        let shape = match vm.heap.get(id) {
            HeapData::List(items) => Shape::List(items.clone()),
            HeapData::Tuple(items) => Shape::Tuple(items.clone()),
            HeapData::Dict(dict) => Shape::Dict(dict.items().map(|(k, v)| (k.clone(), v.clone())).collect()),
            HeapData::Set(set) => Shape::Set(set.values().cloned().collect()),
            HeapData::Exception(_) => Shape::Exception,
            _ => Shape::Other,
        };

        let placeholder = match &shape {
            Shape::List(_) => "[...]",
            Shape::Tuple(_) => "(...)",
            Shape::Dict(_) | Shape::Set(_) => "{...}",
            Shape::Exception | Shape::Other => "",
        };
        if !placeholder.is_empty() && !seen.insert(id) {
            return Ok(Self::Cycle(placeholder.to_owned()));
        }

        let object = match shape {
            Shape::List(items) => Self::List(Self::convert_all(&items, vm, seen)?),
            Shape::Tuple(items) => Self::Tuple(Self::convert_all(&items, vm, seen)?),
            Shape::Set(items) => Self::Set(Self::convert_all(&items, vm, seen)?),
            Shape::Dict(pairs) => {
                let mut converted = Vec::with_capacity(pairs.len());
                for (key, item) in &pairs {
                    converted.push((Self::from_value(key, vm, seen)?, Self::from_value(item, vm, seen)?));
                }
                Self::Dict(converted)
            }
            Shape::Exception => {
                let exc = vm.to_public_exception(value)?;
                Self::Exception {
                    type_name: exc.type_name().to_owned(),
                    message: exc.message().map(str::to_owned),
                }
            }
            Shape::Other => Self::Repr(vm.repr(value)?),
        };
        seen.remove(&id);
        Ok(object)
    }

    fn convert_all(
        items: &[Value],
        vm: &mut VM<'_, impl ResourceTracker, impl PrintWriter>,
        seen: &mut AHashSet<HeapId>,
    ) -> RunResult<Vec<Self>> {
        items.iter().map(|item| Self::from_value(item, vm, seen)).collect()
    }

    /// The `repr()` the program would produce for this value.
    #[must_use]
    pub fn py_repr(&self) -> String {
        let mut out = String::new();
        self.repr_into(&mut out);
        out
    }

    fn repr_into(&self, out: &mut String) {
        match self {
            Self::None => out.push_str("None"),
            Self::Ellipsis => out.push_str("Ellipsis"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Float(f) => out.push_str(&float_repr(*f)),
            Self::String(s) => string_repr(s, out),
            Self::List(items) => Self::seq_repr(items, "[", "]", out),
            Self::Tuple(items) => {
                Self::seq_repr(items, "(", "", out);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Self::Set(items) if items.is_empty() => out.push_str("set()"),
            Self::Set(items) => Self::seq_repr(items, "{", "}", out),
            Self::Dict(pairs) => {
                out.push('{');
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.repr_into(out);
                    out.push_str(": ");
                    value.repr_into(out);
                }
                out.push('}');
            }
            Self::Exception { type_name, message } => {
                out.push_str(type_name);
                out.push('(');
                if let Some(message) = message {
                    string_repr(message, out);
                }
                out.push(')');
            }
            Self::Repr(text) | Self::Cycle(text) => out.push_str(text),
        }
    }

    fn seq_repr(items: &[Self], open: &str, close: &str, out: &mut String) {
        out.push_str(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            item.repr_into(out);
        }
        out.push_str(close);
    }

    /// Truthiness with the language's rules for builtin values; `Repr` values are true.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(items) | Self::Tuple(items) | Self::Set(items) => !items.is_empty(),
            Self::Dict(pairs) => !pairs.is_empty(),
            Self::Ellipsis | Self::Exception { .. } | Self::Repr(_) | Self::Cycle(_) => true,
        }
    }
}

/// `str()` of the value: strings print without quotes, everything else as its repr.
impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => f.write_str(&other.py_repr()),
        }
    }
}

impl From<i64> for Object {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for Object {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Object {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_matches_python() {
        let value = Object::List(vec![
            Object::Int(1),
            Object::Float(2.5),
            Object::from("a"),
            Object::Tuple(vec![Object::None]),
            Object::Dict(vec![(Object::from("k"), Object::Bool(true))]),
            Object::Set(vec![]),
        ]);
        assert_eq!(value.py_repr(), "[1, 2.5, 'a', (None,), {'k': True}, set()]");
        assert_eq!(Object::from("a").to_string(), "a");
    }

    #[test]
    fn exceptions_and_cycles() {
        let exc = Object::Exception {
            type_name: "ValueError".to_owned(),
            message: Some("bad".to_owned()),
        };
        assert_eq!(exc.py_repr(), "ValueError('bad')");
        let cyclic = Object::List(vec![Object::Cycle("[...]".to_owned())]);
        assert_eq!(cyclic.py_repr(), "[[...]]");
    }

    #[test]
    fn truthiness() {
        assert!(!Object::Int(0).is_truthy());
        assert!(!Object::Tuple(vec![]).is_truthy());
        assert!(Object::Repr("<function f>".to_owned()).is_truthy());
    }
}
