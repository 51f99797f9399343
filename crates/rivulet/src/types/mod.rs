//! Heap object types of the object space.
//!
//! These are plain data; the operations that may run user code (dunder dispatch,
//! iteration over generators, calls) live on the VM.

mod class;
mod dict;
mod exception;
mod function;
mod iter;
mod range;

pub(crate) use class::{Class, Instance, SuperProxy};
pub(crate) use dict::{Dict, DictKey, Set};
pub(crate) use exception::{ExcClass, ExceptionObject};
pub(crate) use function::{BoundMethod, BuiltinMethod, Function, Method, MethodTable};
pub(crate) use iter::IterState;
pub(crate) use range::Range;
