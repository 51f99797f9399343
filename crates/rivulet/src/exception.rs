use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{bytecode::vm::string_repr, resource::ResourceError, value::Value};

/// Result type alias for operations that can produce a runtime error.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// Built-in exception types.
///
/// Uses strum derives for `Display`, `FromStr` and `Into<&'static str>`; the string form
/// matches the variant name exactly, which is also the name the type is bound to in builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
pub enum ExcType {
    BaseException,
    Exception,

    // --- ArithmeticError hierarchy ---
    ArithmeticError,
    OverflowError,
    ZeroDivisionError,

    // --- LookupError hierarchy ---
    LookupError,
    IndexError,
    KeyError,

    // --- RuntimeError hierarchy ---
    RuntimeError,
    NotImplementedError,
    RecursionError,

    // --- NameError hierarchy ---
    NameError,
    UnboundLocalError,

    AttributeError,
    AssertionError,
    MemoryError,
    StopIteration,
    TimeoutError,
    TypeError,
    ValueError,
}

impl ExcType {
    /// The direct base class, `None` for `BaseException`.
    #[must_use]
    pub fn base(self) -> Option<Self> {
        match self {
            Self::BaseException => None,
            Self::Exception => Some(Self::BaseException),
            Self::OverflowError | Self::ZeroDivisionError => Some(Self::ArithmeticError),
            Self::IndexError | Self::KeyError => Some(Self::LookupError),
            Self::NotImplementedError | Self::RecursionError => Some(Self::RuntimeError),
            Self::UnboundLocalError => Some(Self::NameError),
            _ => Some(Self::Exception),
        }
    }

    /// Checks if this exception type is a subclass of another exception type.
    ///
    /// Returns true if `self` would be caught by `except handler_type:`.
    #[must_use]
    pub fn is_subclass_of(self, handler_type: Self) -> bool {
        let mut current = Some(self);
        while let Some(t) = current {
            if t == handler_type {
                return true;
            }
            current = t.base();
        }
        false
    }

    #[must_use]
    pub(crate) fn type_error(msg: impl Into<String>) -> RunError {
        SimpleException::new_msg(Self::TypeError, msg).into()
    }

    #[must_use]
    pub(crate) fn value_error(msg: impl Into<String>) -> RunError {
        SimpleException::new_msg(Self::ValueError, msg).into()
    }

    #[must_use]
    pub(crate) fn runtime_error(msg: impl Into<String>) -> RunError {
        SimpleException::new_msg(Self::RuntimeError, msg).into()
    }

    /// `KeyError` carries the missing key itself; its `str()` is the key's repr.
    #[must_use]
    pub(crate) fn key_error(key: Value) -> RunError {
        RunError::Exc(ExceptionRaise::Key(key))
    }

    /// `TypeError: 'x' object is not callable`
    #[must_use]
    pub(crate) fn type_error_not_callable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not callable"))
    }

    /// `TypeError: 'x' object is not iterable`
    #[must_use]
    pub(crate) fn type_error_not_iterable(type_name: &str) -> RunError {
        Self::type_error(format!("'{type_name}' object is not iterable"))
    }

    /// `TypeError: unsupported operand type(s) for +: 'int' and 'str'`
    #[must_use]
    pub(crate) fn type_error_operands(op: &str, left: &str, right: &str) -> RunError {
        Self::type_error(format!("unsupported operand type(s) for {op}: '{left}' and '{right}'"))
    }

    /// `TypeError: unhashable type: 'list'`
    #[must_use]
    pub(crate) fn type_error_unhashable(type_name: &str) -> RunError {
        Self::type_error(format!("unhashable type: '{type_name}'"))
    }

    /// `TypeError: f() takes 2 positional arguments but 3 were given`
    #[must_use]
    pub(crate) fn type_error_arg_count(name: &str, expected: usize, actual: usize) -> RunError {
        let plural = if expected == 1 { "" } else { "s" };
        let were = if actual == 1 { "was" } else { "were" };
        Self::type_error(format!(
            "{name}() takes {expected} positional argument{plural} but {actual} {were} given"
        ))
    }

    #[must_use]
    pub(crate) fn type_error_at_least(name: &str, expected: usize, actual: usize) -> RunError {
        let plural = if expected == 1 { "" } else { "s" };
        Self::type_error(format!("{name} expected at least {expected} argument{plural}, got {actual}"))
    }

    #[must_use]
    pub(crate) fn type_error_at_most(name: &str, expected: usize, actual: usize) -> RunError {
        let plural = if expected == 1 { "" } else { "s" };
        Self::type_error(format!("{name} expected at most {expected} argument{plural}, got {actual}"))
    }

    #[must_use]
    pub(crate) fn type_error_no_kwargs(name: &str) -> RunError {
        Self::type_error(format!("{name}() takes no keyword arguments"))
    }

    /// `TypeError: f() missing 1 required positional argument: 'a'`
    #[must_use]
    pub(crate) fn type_error_missing(name: &str, kind: &str, missing: &[&str]) -> RunError {
        let plural = if missing.len() == 1 { "" } else { "s" };
        Self::type_error(format!(
            "{name}() missing {} required {kind} argument{plural}: {}",
            missing.len(),
            format_param_names(missing)
        ))
    }

    /// `TypeError: f() got an unexpected keyword argument 'x'`
    #[must_use]
    pub(crate) fn type_error_unexpected_keyword(name: &str, key: &str) -> RunError {
        Self::type_error(format!("{name}() got an unexpected keyword argument '{key}'"))
    }

    /// `TypeError: f() got multiple values for argument 'x'`
    #[must_use]
    pub(crate) fn type_error_multiple_values(name: &str, key: &str) -> RunError {
        Self::type_error(format!("{name}() got multiple values for argument '{key}'"))
    }

    /// `AttributeError: 'int' object has no attribute 'foo'`
    #[must_use]
    pub(crate) fn attribute_error(type_name: &str, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
        .into()
    }

    /// `NameError: name 'x' is not defined`
    #[must_use]
    pub(crate) fn name_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::NameError, format!("name '{name}' is not defined")).into()
    }

    /// `UnboundLocalError: cannot access local variable 'x' where it is not associated with a value`
    #[must_use]
    pub(crate) fn unbound_local_error(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::UnboundLocalError,
            format!("cannot access local variable '{name}' where it is not associated with a value"),
        )
        .into()
    }

    /// `NameError: cannot access free variable 'x' where it is not associated with a value in enclosing scope`
    #[must_use]
    pub(crate) fn name_error_free_variable(name: &str) -> RunError {
        SimpleException::new_msg(
            Self::NameError,
            format!("cannot access free variable '{name}' where it is not associated with a value in enclosing scope"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn zero_division(msg: &'static str) -> RunError {
        SimpleException::new_msg(Self::ZeroDivisionError, msg).into()
    }

    #[must_use]
    pub(crate) fn overflow() -> RunError {
        SimpleException::new_msg(Self::OverflowError, "integer overflow").into()
    }

    #[must_use]
    pub(crate) fn index_error(type_name: &str) -> RunError {
        SimpleException::new_msg(Self::IndexError, format!("{type_name} index out of range")).into()
    }

    #[must_use]
    pub(crate) fn stop_iteration() -> RunError {
        SimpleException::new_none(Self::StopIteration).into()
    }
}

/// Formats a list of parameter names for error messages.
///
/// Examples:
/// - `["a"]` -> `'a'`
/// - `["a", "b"]` -> `'a' and 'b'`
/// - `["a", "b", "c"]` -> `'a', 'b' and 'c'`
fn format_param_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [one] => format!("'{one}'"),
        [rest @ .., last] => {
            let rest: Vec<_> = rest.iter().map(|n| format!("'{n}'")).collect();
            format!("{} and '{last}'", rest.join(", "))
        }
    }
}

/// An exception that has not been allocated on the heap yet.
///
/// Most errors raised by the object space start out like this; the engine turns them
/// into heap exception objects when they reach the instruction boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SimpleException {
    exc_type: ExcType,
    arg: Option<String>,
}

impl SimpleException {
    #[must_use]
    pub fn new_msg(exc_type: ExcType, arg: impl Into<String>) -> Self {
        Self {
            exc_type,
            arg: Some(arg.into()),
        }
    }

    #[must_use]
    pub fn new_none(exc_type: ExcType) -> Self {
        Self { exc_type, arg: None }
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn into_arg(self) -> Option<String> {
        self.arg
    }
}

/// A language exception in flight.
#[derive(Debug, Clone)]
pub(crate) enum ExceptionRaise {
    /// Not yet materialised on the heap.
    Simple(SimpleException),
    /// A `KeyError` for the given key, allocated with the key as its only argument.
    Key(Value),
    /// An exception instance already living on the heap.
    Object(Value),
}

impl From<SimpleException> for ExceptionRaise {
    fn from(exc: SimpleException) -> Self {
        Self::Simple(exc)
    }
}

/// Runtime error types that can occur during execution.
///
/// Three variants:
/// - `Internal`: a compiler/engine contract violation, never user error
/// - `Exc`: language exception that try/except can intercept
/// - `UncatchableExc`: resource-limit exception that unwinds every frame without running handlers
#[derive(Debug)]
pub(crate) enum RunError {
    Internal(Cow<'static, str>),
    Exc(ExceptionRaise),
    UncatchableExc(ExceptionRaise),
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(exc.into())
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        Self::UncatchableExc(SimpleException::new_msg(err.exc_type(), err.to_string()).into())
    }
}

/// One entry of a traceback: the function executing and the line it was on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub name: String,
    pub line: u32,
}

/// A language exception that escaped execution, as seen by the embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    type_name: String,
    message: Option<String>,
    /// Outermost frame first.
    traceback: Vec<StackFrame>,
}

impl Exception {
    pub(crate) fn new(type_name: impl Into<String>, message: Option<String>, traceback: Vec<StackFrame>) -> Self {
        Self {
            type_name: type_name.into(),
            message,
            traceback,
        }
    }

    /// Name of the exception's class, e.g. `ZeroDivisionError` or a user class name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }

    /// The built-in exception type, `None` for user-defined classes.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        self.type_name.parse().ok()
    }

    /// Python-style repr, e.g. `ValueError('bad')`.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("{}(", self.type_name);
        if let Some(msg) = &self.message {
            string_repr(msg, &mut out);
        }
        out.push(')');
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            for frame in &self.traceback {
                writeln!(f, "  line {}, in {}", frame.line, frame.name)?;
            }
        }
        match &self.message {
            Some(msg) => write!(f, "{}: {msg}", self.type_name),
            None => write!(f, "{}", self.type_name),
        }
    }
}

impl std::error::Error for Exception {}

/// Error raised while resolving scopes or generating code.
///
/// Compilation fails fast: no partially built code object is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("SyntaxError: {message} (line {line})")]
pub struct CompileError {
    message: Cow<'static, str>,
    line: u32,
}

impl CompileError {
    pub(crate) fn new(message: impl Into<Cow<'static, str>>, line: u32) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy() {
        assert!(ExcType::ZeroDivisionError.is_subclass_of(ExcType::ArithmeticError));
        assert!(ExcType::ZeroDivisionError.is_subclass_of(ExcType::Exception));
        assert!(ExcType::KeyError.is_subclass_of(ExcType::BaseException));
        assert!(!ExcType::KeyError.is_subclass_of(ExcType::ArithmeticError));
        assert!(!ExcType::Exception.is_subclass_of(ExcType::ValueError));
    }

    #[test]
    fn names_round_trip_through_strum() {
        assert_eq!(ExcType::StopIteration.to_string(), "StopIteration");
        assert_eq!("TypeError".parse::<ExcType>(), Ok(ExcType::TypeError));
        assert!("NotAnError".parse::<ExcType>().is_err());
    }

    #[test]
    fn param_name_lists() {
        assert_eq!(format_param_names(&["a"]), "'a'");
        assert_eq!(format_param_names(&["a", "b", "c"]), "'a', 'b' and 'c'");
    }

    #[test]
    fn summary_uses_single_quotes() {
        let exc = Exception::new("ValueError", Some("bad".into()), vec![]);
        assert_eq!(exc.summary(), "ValueError('bad')");
        assert_eq!(Exception::new("StopIteration", None, vec![]).summary(), "StopIteration()");
    }
}
