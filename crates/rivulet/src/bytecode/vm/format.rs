//! `repr()`, `str()` and truthiness, the conversions that may call back into user
//! `__repr__`, `__str__`, `__bool__` and `__len__`.

use std::fmt::{self, Write};

use ahash::AHashSet;

use super::VM;
use crate::{
    exception::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{ExcClass, IterState},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// `repr(value)`
    pub(crate) fn repr(&mut self, value: &Value) -> RunResult<String> {
        let mut out = String::new();
        self.repr_into(value, &mut out, &mut AHashSet::new())?;
        Ok(out)
    }

    /// `str(value)`
    pub(crate) fn str(&mut self, value: &Value) -> RunResult<String> {
        match value {
            Value::Str(s) => Ok(s.to_string()),
            Value::Ref(id) => {
                if let Some(text) = self.call_dunder(value, "__str__", Vec::new())? {
                    return expect_str(text, "__str__", self);
                }
                if let HeapData::Exception(exc) = self.heap.get(*id) {
                    let (class, args) = (exc.class, exc.args.clone());
                    return self.exception_str(class, &args);
                }
                self.repr(value)
            }
            _ => self.repr(value),
        }
    }

    /// `str()` of an exception built from its arguments; a lone `KeyError` argument is
    /// shown as its repr.
    pub(super) fn exception_str(&mut self, class: ExcClass, args: &[Value]) -> RunResult<String> {
        match args {
            [] => Ok(String::new()),
            [single] if class.builtin_base(self.heap).is_subclass_of(ExcType::KeyError) => self.repr(single),
            [single] => self.str(single),
            _ => {
                let mut out = String::new();
                self.seq_repr(args, ("(", ")"), &mut out, &mut AHashSet::new())?;
                Ok(out)
            }
        }
    }

    /// Truthiness, consulting `__bool__` and then `__len__` on user instances.
    pub(crate) fn truthy(&mut self, value: &Value) -> RunResult<bool> {
        if let Some(truth) = value.plain_truth(self.heap) {
            return Ok(truth);
        }
        if let Some(result) = self.call_dunder(value, "__bool__", Vec::new())? {
            return match result {
                Value::Bool(b) => Ok(b),
                other => Err(ExcType::type_error(format!(
                    "__bool__ should return bool, returned {}",
                    other.type_name(self.heap)
                ))),
            };
        }
        if let Some(len) = self.call_dunder(value, "__len__", Vec::new())? {
            return match len.as_int() {
                Some(n) if n < 0 => Err(ExcType::value_error("__len__() should return >= 0")),
                Some(n) => Ok(n != 0),
                None => Err(ExcType::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    len.type_name(self.heap)
                ))),
            };
        }
        Ok(true)
    }

    fn repr_into(&mut self, value: &Value, out: &mut String, seen: &mut AHashSet<HeapId>) -> RunResult<()> {
        match value {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => write_fmt(out, format_args!("{i}")),
            Value::Float(f) => out.push_str(&float_repr(*f)),
            Value::Str(s) => string_repr(s, out),
            Value::Ellipsis => out.push_str("Ellipsis"),
            Value::Builtin(b) => write_fmt(out, format_args!("{b}")),
            Value::ExcType(t) => write_fmt(out, format_args!("<class '{t}'>")),
            Value::Code(code) => write_fmt(out, format_args!("<code object {}>", code.name())),
            Value::Unwind(why) => write_fmt(out, format_args!("<unwind {}>", why.kind())),
            Value::Ref(id) => self.heap_repr(*id, value, out, seen)?,
        }
        Ok(())
    }

    fn heap_repr(&mut self, id: HeapId, value: &Value, out: &mut String, seen: &mut AHashSet<HeapId>) -> RunResult<()> {
        if self.user_class(value).is_some()
            && let Some(text) = self.call_dunder(value, "__repr__", Vec::new())?
        {
            out.push_str(&expect_str(text, "__repr__", self)?);
            return Ok(());
        }

        match self.heap.get(id) {
            HeapData::List(items) => {
                if !seen.insert(id) {
                    out.push_str("[...]");
                    return Ok(());
                }
                let items = items.clone();
                self.seq_repr(&items, ("[", "]"), out, seen)?;
                seen.remove(&id);
            }
            HeapData::Tuple(items) => {
                if !seen.insert(id) {
                    out.push_str("(...)");
                    return Ok(());
                }
                let items = items.clone();
                self.seq_repr(&items, ("(", ")"), out, seen)?;
                seen.remove(&id);
            }
            HeapData::Dict(dict) => {
                if !seen.insert(id) {
                    out.push_str("{...}");
                    return Ok(());
                }
                let items: Vec<(Value, Value)> = dict.items().map(|(k, v)| (k.clone(), v.clone())).collect();
                out.push('{');
                for (i, (key, item)) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.repr_into(key, out, seen)?;
                    out.push_str(": ");
                    self.repr_into(item, out, seen)?;
                }
                out.push('}');
                seen.remove(&id);
            }
            HeapData::Set(set) => {
                if set.is_empty() {
                    out.push_str("set()");
                    return Ok(());
                }
                let items: Vec<Value> = set.values().cloned().collect();
                self.seq_repr(&items, ("{", "}"), out, seen)?;
            }
            HeapData::Exception(exc) => {
                let name = exc.class_name(self.heap);
                let args = exc.args.clone();
                out.push_str(&name);
                if args.len() == 1 {
                    out.push('(');
                    self.repr_into(&args[0], out, seen)?;
                    out.push(')');
                } else {
                    self.seq_repr(&args, ("(", ")"), out, seen)?;
                }
            }
            HeapData::Range(range) => {
                if range.step == 1 {
                    write_fmt(out, format_args!("range({}, {})", range.start, range.stop));
                } else {
                    write_fmt(out, format_args!("range({}, {}, {})", range.start, range.stop, range.step));
                }
            }
            HeapData::Function(func) => write_fmt(out, format_args!("<function {}>", func.qualname)),
            HeapData::BoundMethod(method) => {
                let (func, receiver) = (method.func.clone(), method.receiver.clone());
                let name = match func.ref_id().map(|f| self.heap.get(f)) {
                    Some(HeapData::Function(func)) => func.qualname.to_string(),
                    _ => "?".to_owned(),
                };
                write_fmt(out, format_args!("<bound method {name} of "));
                self.repr_into(&receiver, out, seen)?;
                out.push('>');
            }
            HeapData::BuiltinMethod(method) => {
                let type_name = method.receiver.type_name(self.heap);
                write_fmt(
                    out,
                    format_args!("<built-in method {} of {type_name} object>", method.method.name()),
                );
            }
            HeapData::Class(class) => write_fmt(out, format_args!("<class '__main__.{}'>", class.qualname)),
            HeapData::Instance(instance) => {
                let qualname = match self.heap.get(instance.class) {
                    HeapData::Class(class) => class.qualname.to_string(),
                    other => other.type_name().to_owned(),
                };
                write_fmt(out, format_args!("<__main__.{qualname} object at {id}>"));
            }
            HeapData::Generator(generator) => {
                write_fmt(out, format_args!("<generator object {} at {id}>", generator.name));
            }
            HeapData::Iter(IterState::Values { .. }) => write_fmt(out, format_args!("<iterator object at {id}>")),
            other => write_fmt(out, format_args!("<{} object at {id}>", other.type_name())),
        }
        Ok(())
    }

    /// Comma-separated reprs between `brackets`; a one-item tuple keeps its trailing comma.
    fn seq_repr(
        &mut self,
        items: &[Value],
        brackets: (&str, &str),
        out: &mut String,
        seen: &mut AHashSet<HeapId>,
    ) -> RunResult<()> {
        out.push_str(brackets.0);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.repr_into(item, out, seen)?;
        }
        if items.len() == 1 && brackets.0 == "(" {
            out.push(',');
        }
        out.push_str(brackets.1);
        Ok(())
    }
}

fn expect_str(value: Value, method: &str, vm: &VM<'_, impl ResourceTracker, impl PrintWriter>) -> RunResult<String> {
    match value {
        Value::Str(s) => Ok(s.to_string()),
        other => Err(ExcType::type_error(format!(
            "{method} returned non-string (type {})",
            other.type_name(vm.heap)
        ))),
    }
}

fn write_fmt(out: &mut String, args: fmt::Arguments<'_>) {
    // Writing into a String cannot fail.
    let _ = out.write_fmt(args);
}

/// Python's float repr: the shortest round-tripping digits, switching to exponent
/// notation outside `1e-4 <= |f| < 1e16`.
pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_owned();
    }
    let sci = format!("{f:e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        let plain = f.to_string();
        if plain.contains('.') { plain } else { format!("{plain}.0") }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

/// Writes a Python string literal: single quotes unless the text contains a single
/// quote and no double quote.
pub(crate) fn string_repr(s: &str, out: &mut String) {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => write_fmt(out, format_args!("\\x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out.push(quote);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_match_python() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-2.5), "-2.5");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1.5e-5), "1.5e-05");
        assert_eq!(float_repr(123_456.0), "123456.0");
        assert_eq!(float_repr(f64::INFINITY), "inf");
        assert_eq!(float_repr(-0.0), "-0.0");
    }

    #[test]
    fn string_quotes() {
        let repr = |s: &str| {
            let mut out = String::new();
            string_repr(s, &mut out);
            out
        };
        assert_eq!(repr("abc"), "'abc'");
        assert_eq!(repr("it's"), "\"it's\"");
        assert_eq!(repr("a'\"b"), "'a\\'\"b'");
        assert_eq!(repr("line\n"), "'line\\n'");
    }
}
