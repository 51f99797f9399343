//! Exception handling helpers for the VM.

use super::{VM, frame::BlockKind, frame::Unwinder};
use crate::{
    args::ArgValues,
    exception::{Exception, ExcType, ExceptionRaise, RunError, RunResult, StackFrame},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    types::{ExcClass, ExceptionObject},
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// Allocates a not-yet-materialised exception on the heap.
    pub(crate) fn materialize(&mut self, exc: ExceptionRaise) -> RunResult<Value> {
        match exc {
            ExceptionRaise::Object(value) => Ok(value),
            ExceptionRaise::Key(key) => {
                let exc = ExceptionObject::new(ExcClass::Builtin(ExcType::KeyError), vec![key]);
                Ok(Value::Ref(self.heap.allocate(HeapData::Exception(exc))?))
            }
            ExceptionRaise::Simple(simple) => {
                let exc_type = simple.exc_type();
                let args = simple.into_arg().map(Value::from).into_iter().collect();
                let id = self
                    .heap
                    .allocate(HeapData::Exception(ExceptionObject::new(ExcClass::Builtin(exc_type), args)))?;
                Ok(Value::Ref(id))
            }
        }
    }

    pub(crate) fn is_exception(&self, value: &Value) -> bool {
        value
            .ref_id()
            .is_some_and(|id| matches!(self.heap.get(id), HeapData::Exception(_)))
    }

    /// Whether an in-flight error is a catchable exception of (a subclass of) `target`.
    pub(crate) fn error_is(&self, err: &RunError, target: ExcType) -> bool {
        match err {
            RunError::Exc(ExceptionRaise::Simple(simple)) => simple.exc_type().is_subclass_of(target),
            RunError::Exc(ExceptionRaise::Key(_)) => ExcType::KeyError.is_subclass_of(target),
            RunError::Exc(ExceptionRaise::Object(value)) => match value.ref_id().map(|id| self.heap.get(id)) {
                Some(HeapData::Exception(exc)) => exc.class.builtin_base(self.heap).is_subclass_of(target),
                _ => false,
            },
            _ => false,
        }
    }

    /// `RAISE_VARARGS 0` re-raises the handled exception, `RAISE_VARARGS 1` raises TOS.
    pub(super) fn raise_varargs(&mut self, argc: u32) -> RunResult<Unwinder> {
        match argc {
            0 => match self.exc_info.clone() {
                Some(exc) => Ok(Unwinder::Raise(exc)),
                None => Err(ExcType::runtime_error("No active exception to reraise")),
            },
            1 => {
                let value = self.pop()?;
                let exc = self.make_exception(value)?;
                self.record_traceback(&exc);
                Ok(Unwinder::Raise(exc))
            }
            _ => Err(RunError::internal("RAISE_VARARGS supports at most one operand")),
        }
    }

    /// What `raise value` raises: instances as-is, classes instantiated without
    /// arguments.
    fn make_exception(&mut self, value: Value) -> RunResult<Value> {
        match &value {
            Value::ExcType(_) => self.call_sync(value, ArgValues::default()),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Exception(_) => Ok(value),
                HeapData::Class(class) if class.exc_base.is_some() => {
                    let exc = self.call_sync(value, ArgValues::default())?;
                    if self.is_exception(&exc) {
                        Ok(exc)
                    } else {
                        Err(ExcType::type_error("exceptions must derive from BaseException"))
                    }
                }
                _ => Err(ExcType::type_error("exceptions must derive from BaseException")),
            },
            _ => Err(ExcType::type_error("exceptions must derive from BaseException")),
        }
    }

    /// `except pattern:` matching; `pattern` is a class or a tuple of classes.
    pub(super) fn exception_matches(&self, exc: &Value, pattern: &Value) -> RunResult<bool> {
        let class = match exc.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Exception(exc)) => exc.class,
            _ => return Err(RunError::internal("exception match on a non-exception")),
        };
        match pattern {
            Value::ExcType(_) => Ok(class.is_subclass_of(pattern, self.heap)),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Tuple(options) => {
                    for option in options {
                        if self.exception_matches(exc, option)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                HeapData::Class(target) if target.exc_base.is_some() => Ok(class.is_subclass_of(pattern, self.heap)),
                _ => Err(catch_non_exception()),
            },
            _ => Err(catch_non_exception()),
        }
    }

    /// Prepends the current frame, at the instruction being executed, to the traceback
    /// of an exception that starts propagating through it.
    ///
    /// Re-raises (`raise` without an operand, `END_FINALLY` after an unmatched handler
    /// or a `finally` body) are not recorded, so each frame keeps the line where the
    /// exception entered it.
    pub(super) fn record_traceback(&mut self, exc: &Value) {
        let Some(frame) = self.frames.last() else { return };
        let entry = StackFrame {
            name: frame.code.name().to_owned(),
            line: frame.line(),
        };
        if let Some(id) = exc.ref_id()
            && let HeapData::Exception(exc) = self.heap.get_mut(id)
        {
            exc.traceback.insert(0, entry);
        }
    }

    /// Converts an escaped heap exception into the embedder-facing form.
    pub(crate) fn to_public_exception(&mut self, exc: &Value) -> RunResult<Exception> {
        let (class, args, traceback) = match exc.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Exception(obj)) => (obj.class, obj.args.clone(), obj.traceback.clone()),
            _ => return Err(RunError::internal("escaped value is not an exception")),
        };
        let type_name = class.name(self.heap);
        let message = if args.is_empty() {
            None
        } else {
            Some(self.exception_str(class, &args)?)
        };
        Ok(Exception::new(type_name, message, traceback))
    }

    /// `SETUP_WITH`: `[mgr] -> [exit, enter_result]`, with a finally block guarding
    /// the body.
    pub(super) fn setup_with(&mut self, handler: usize) -> RunResult<()> {
        let manager = self.pop()?;
        let exit = self.get_attr(&manager, "__exit__")?;
        let enter = self.get_attr(&manager, "__enter__")?;
        let frame = self.frame_mut()?;
        frame.stack.push(exit);
        frame.push_block(BlockKind::Finally, handler);
        self.call_and_push(enter, ArgValues::default())
    }

    /// `WITH_CLEANUP`: `[exit, why] -> [why']`. Calls `__exit__`; a true result
    /// swallows a pending exception, leaving `None` for `END_FINALLY`.
    pub(super) fn with_cleanup(&mut self) -> RunResult<()> {
        let why = self.pop()?;
        let exit = self.pop()?;
        let no_exc = || ArgValues::positional(vec![Value::None, Value::None, Value::None]);
        let result = match why {
            Value::None => {
                self.call_sync(exit, no_exc())?;
                Value::None
            }
            Value::Unwind(pending) => match *pending {
                Unwinder::Raise(exc) => {
                    let class = exc.class_of(self.heap);
                    let args = ArgValues::positional(vec![class, exc.clone(), Value::None]);
                    let suppress = self.call_sync(exit, args)?;
                    if self.truthy(&suppress)? {
                        Value::None
                    } else {
                        Value::Unwind(Box::new(Unwinder::Raise(exc)))
                    }
                }
                other => {
                    self.call_sync(exit, no_exc())?;
                    Value::Unwind(Box::new(other))
                }
            },
            other => {
                return Err(RunError::internal(format!(
                    "WITH_CLEANUP found '{}' on the stack",
                    other.type_name(self.heap)
                )));
            }
        };
        self.push(result)
    }
}

fn catch_non_exception() -> RunError {
    ExcType::type_error("catching classes that do not inherit from BaseException is not allowed")
}
