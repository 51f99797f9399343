//! Function call helpers for the VM: the call protocol, argument binding,
//! instantiation and class creation.

use std::sync::Arc;

use super::{FrameOutcome, VM, frame::Continuation, frame::Frame, generator::Generator};
use crate::{
    args::ArgValues,
    bytecode::CodeFlags,
    exception::{ExcType, RunError, RunResult},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Class, Dict, ExcClass, ExceptionObject, Instance, Method},
    value::Value,
};

/// Result of calling a callable.
///
/// Builtins return a value immediately; user functions produce a frame for the
/// dispatch loop to push, so calls never recurse on the host stack.
#[derive(Debug)]
pub(crate) enum CallResult {
    Value(Value),
    Frame(Box<Frame>),
}

/// What a heap callable turned out to be, copied out of the heap borrow.
enum Callee {
    Function,
    Bound { func: Value, receiver: Value },
    Builtin { receiver: Value, method: Method },
    Class,
    Instance,
    Other(&'static str),
}

impl<T: ResourceTracker, P: PrintWriter> VM<'_, T, P> {
    /// Calls a callable value with the given arguments.
    pub(crate) fn call(&mut self, callable: Value, args: ArgValues) -> RunResult<CallResult> {
        match &callable {
            Value::Builtin(builtin) => builtin.call(self, args),
            Value::ExcType(exc_type) => {
                args.check_no_kwargs(<&str>::from(*exc_type))?;
                let exc = ExceptionObject::new(ExcClass::Builtin(*exc_type), args.positional);
                let id = self.heap.allocate(HeapData::Exception(exc))?;
                Ok(CallResult::Value(Value::Ref(id)))
            }
            Value::Ref(id) => self.call_ref(*id, callable.clone(), args),
            other => Err(ExcType::type_error_not_callable(&other.type_name(self.heap))),
        }
    }

    fn call_ref(&mut self, id: HeapId, callable: Value, args: ArgValues) -> RunResult<CallResult> {
        let callee = match self.heap.get(id) {
            HeapData::Function(_) => Callee::Function,
            HeapData::BoundMethod(bound) => Callee::Bound {
                func: bound.func.clone(),
                receiver: bound.receiver.clone(),
            },
            HeapData::BuiltinMethod(bound) => Callee::Builtin {
                receiver: bound.receiver.clone(),
                method: bound.method,
            },
            HeapData::Class(_) => Callee::Class,
            HeapData::Instance(_) => Callee::Instance,
            other => Callee::Other(other.type_name()),
        };
        match callee {
            Callee::Function => self.call_function(id, args),
            Callee::Bound { func, receiver } => self.call(func, args.with_receiver(receiver)),
            Callee::Builtin { receiver, method } => self.call_method(receiver, method, args),
            Callee::Class => self.instantiate(id, args),
            Callee::Instance => match self.lookup_special(&callable, "__call__") {
                Some(func) => self.call(func, args.with_receiver(callable)),
                None => Err(ExcType::type_error_not_callable(&callable.type_name(self.heap))),
            },
            Callee::Other(type_name) => Err(ExcType::type_error_not_callable(type_name)),
        }
    }

    /// Calls from native code, running any frame the call produces to completion.
    pub(crate) fn call_sync(&mut self, callable: Value, args: ArgValues) -> RunResult<Value> {
        match self.call(callable, args)? {
            CallResult::Value(value) => Ok(value),
            CallResult::Frame(frame) => self.run_frame_sync(*frame),
        }
    }

    fn run_frame_sync(&mut self, mut frame: Frame) -> RunResult<Value> {
        frame.boundary = true;
        self.push_frame(frame)?;
        match self.run_nested()? {
            FrameOutcome::Return(value) => Ok(value),
            FrameOutcome::Yield(_) => Err(RunError::internal("plain frame yielded")),
        }
    }

    pub(crate) fn is_callable(&self, value: &Value) -> bool {
        match value {
            Value::Builtin(_) | Value::ExcType(_) => true,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Function(_) | HeapData::BoundMethod(_) | HeapData::BuiltinMethod(_) | HeapData::Class(_) => {
                    true
                }
                HeapData::Instance(_) => self.lookup_special(value, "__call__").is_some(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Calls a user function: binds arguments into a new frame, or wraps the frame in
    /// a generator object for generator code.
    fn call_function(&mut self, func_id: HeapId, args: ArgValues) -> RunResult<CallResult> {
        let frame = self.bind_frame(func_id, args, None)?;
        if frame.code.is_generator() {
            let generator = self.heap.allocate(HeapData::Generator(Generator::new(frame)))?;
            return Ok(CallResult::Value(Value::Ref(generator)));
        }
        Ok(CallResult::Frame(Box::new(frame)))
    }

    /// Builds the activation for a call: fast slots ordered positional params,
    /// keyword-only params, `*args`, `**kwargs`; then cells for cellvars followed by
    /// the closure.
    fn bind_frame(&mut self, func_id: HeapId, args: ArgValues, locals: Option<HeapId>) -> RunResult<Frame> {
        let HeapData::Function(func) = self.heap.get(func_id) else {
            return Err(RunError::internal("bind_frame: not a function"));
        };
        let code = func.code.clone();
        let defaults = func.defaults.clone();
        let kwdefaults = func.kwdefaults.clone();
        let closure = func.closure.clone();
        let mut frame = Frame::new(code.clone(), func.globals, locals);

        let name = code.name();
        let argcount = code.argcount() as usize;
        let kwonly = code.kwonlyargcount() as usize;
        let named = &code.varnames()[..argcount + kwonly];
        let flags = code.flags();

        let ArgValues { positional, kwargs } = args;
        if positional.len() > argcount && !flags.contains(CodeFlags::VARARGS) {
            return Err(ExcType::type_error_arg_count(name, argcount, positional.len()));
        }
        let mut positional = positional.into_iter();
        for slot in frame.fast.iter_mut().take(argcount) {
            match positional.next() {
                Some(value) => *slot = Some(value),
                None => break,
            }
        }

        let mut next_slot = argcount + kwonly;
        if flags.contains(CodeFlags::VARARGS) {
            let rest = self.heap.allocate(HeapData::Tuple(positional.collect()))?;
            frame.fast[next_slot] = Some(Value::Ref(rest));
            next_slot += 1;
        }

        let mut extra_kwargs = flags.contains(CodeFlags::VARKEYWORDS).then(Dict::new);
        for (key, value) in kwargs {
            if let Some(slot) = named.iter().position(|param| **param == *key) {
                if frame.fast[slot].is_some() {
                    return Err(ExcType::type_error_multiple_values(name, &key));
                }
                frame.fast[slot] = Some(value);
            } else if let Some(extra) = &mut extra_kwargs {
                extra.insert_str(&key, value);
            } else {
                return Err(ExcType::type_error_unexpected_keyword(name, &key));
            }
        }
        if let Some(extra) = extra_kwargs {
            let dict = self.heap.allocate(HeapData::Dict(extra))?;
            frame.fast[next_slot] = Some(Value::Ref(dict));
        }

        let first_default = argcount.saturating_sub(defaults.len());
        let mut missing = Vec::new();
        for (index, param) in named.iter().enumerate().take(argcount) {
            if frame.fast[index].is_none() {
                match index.checked_sub(first_default) {
                    Some(d) => frame.fast[index] = Some(defaults[d].clone()),
                    None => missing.push(param.as_str()),
                }
            }
        }
        if !missing.is_empty() {
            return Err(ExcType::type_error_missing(name, "positional", &missing));
        }
        for (index, param) in named.iter().enumerate().skip(argcount) {
            if frame.fast[index].is_none() {
                match kwdefaults.iter().find(|(key, _)| **key == **param) {
                    Some((_, value)) => frame.fast[index] = Some(value.clone()),
                    None => missing.push(param.as_str()),
                }
            }
        }
        if !missing.is_empty() {
            return Err(ExcType::type_error_missing(name, "keyword-only", &missing));
        }

        for cellvar in code.cellvars() {
            let initial = code
                .varnames()
                .iter()
                .position(|var| var == cellvar)
                .and_then(|slot| frame.fast[slot].clone());
            let cell = self.heap.allocate(HeapData::Cell(initial))?;
            frame.cells.push(cell);
        }
        frame.cells.extend(closure);
        Ok(frame)
    }

    /// Calling a class: allocates the instance and runs `__init__` on it.
    fn instantiate(&mut self, class_id: HeapId, args: ArgValues) -> RunResult<CallResult> {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            return Err(RunError::internal("instantiate: not a class"));
        };
        let is_exception = class.exc_base.is_some();
        let class_name = class.name.clone();

        let data = if is_exception {
            HeapData::Exception(ExceptionObject::new(ExcClass::User(class_id), args.positional.clone()))
        } else {
            HeapData::Instance(Instance {
                class: class_id,
                attrs: Dict::new(),
            })
        };
        let instance = Value::Ref(self.heap.allocate(data)?);

        match self.class_lookup(class_id, "__init__") {
            Some(init) => match self.call(init, args.with_receiver(instance.clone()))? {
                CallResult::Value(result) if result.is_none() => Ok(CallResult::Value(instance)),
                CallResult::Value(result) => Err(ExcType::type_error(format!(
                    "__init__() should return None, not '{}'",
                    result.type_name(self.heap)
                ))),
                CallResult::Frame(mut frame) => {
                    frame.continuation = Continuation::Init(instance);
                    Ok(CallResult::Frame(frame))
                }
            },
            None if !is_exception && (!args.positional.is_empty() || !args.kwargs.is_empty()) => {
                Err(ExcType::type_error(format!("{class_name}() takes no arguments")))
            }
            None => Ok(CallResult::Value(instance)),
        }
    }

    /// `__build_class__(func, name, *bases)`: runs the class body in a fresh namespace.
    /// The class itself is made when the body returns its namespace.
    pub(crate) fn class_body_frame(&mut self, func: &Value, name: Arc<str>, bases: Vec<Value>) -> RunResult<CallResult> {
        let func_id = match func {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Function(_)) => *id,
            _ => return Err(ExcType::type_error("__build_class__: func must be a function")),
        };
        let namespace = self.heap.allocate(HeapData::Dict(Dict::new()))?;
        let mut frame = self.bind_frame(func_id, ArgValues::default(), Some(namespace))?;
        frame.continuation = Continuation::BuildClass { name, bases };
        Ok(CallResult::Frame(Box::new(frame)))
    }

    /// Turns a finished class body's namespace into a class, filling the `__class__`
    /// cell used by zero-argument `super()`.
    pub(super) fn finish_class(&mut self, name: Arc<str>, bases: Vec<Value>, namespace: &Value) -> RunResult<Value> {
        let namespace = match namespace {
            Value::Ref(id) if matches!(self.heap.get(*id), HeapData::Dict(_)) => *id,
            _ => return Err(RunError::internal("class body did not return its namespace")),
        };
        let qualname = match self.dict_get_str(namespace, "__qualname__") {
            Some(Value::Str(qualname)) => qualname,
            _ => name.clone(),
        };
        let (ancestors, exc_base) = Class::linearize(&bases, self.heap)?;
        let class_id = self.heap.allocate(HeapData::Class(Class {
            name,
            qualname,
            bases,
            mro: Vec::new(),
            exc_base,
            namespace,
        }))?;
        if let HeapData::Class(class) = self.heap.get_mut(class_id) {
            class.mro.push(class_id);
            class.mro.extend(ancestors);
        }

        if let Some(Value::Ref(cell)) = self.dict_get_str(namespace, "__classcell__") {
            self.heap.set_cell(cell, Some(Value::Ref(class_id)))?;
            self.dict_del_str(namespace, "__classcell__")?;
        }
        tracing::trace!(class = %class_id, "class created");
        Ok(Value::Ref(class_id))
    }
}
