//! Frame execution engine.
//!
//! One dispatch loop runs every frame on `frames`: calls push frames rather than
//! recursing on the host stack. Abrupt exits travel as an [`Unwinder`] through each
//! frame's block stack, and a frame whose blocks are exhausted either hands its return
//! value to its [`Continuation`] or propagates a raise into the frame below.
//!
//! Native code that calls back into the language (builtins, dunder methods) re-enters
//! through [`VM::call_sync`]: the callee frame is marked as a boundary and a nested loop
//! runs until that frame finishes.

mod attr;
mod binary;
mod call;
mod collections;
mod compare;
mod exceptions;
mod format;
mod frame;
mod generator;
mod methods;

use std::sync::Arc;

pub(crate) use call::CallResult;
use frame::{BlockKind, Continuation, FrameBlock};
pub(crate) use format::{float_repr, string_repr};
pub(crate) use frame::{Frame, Unwinder};
use generator::Resumed;
pub(crate) use generator::Generator;

use crate::{
    args::ArgValues,
    builtins::Builtins,
    bytecode::{Code, CompareKind, Opcode},
    exception::{ExcType, ExceptionRaise, RunError, RunResult, StackFrame},
    heap::{Heap, HeapData, HeapId, Trace},
    io::PrintWriter,
    resource::ResourceTracker,
    types::{Dict, DictKey, Function},
    value::Value,
};

/// How a dispatch loop ended: its boundary frame returned or yielded.
#[derive(Debug)]
pub(crate) enum FrameOutcome {
    Return(Value),
    Yield(Value),
}

/// The bytecode interpreter.
pub(crate) struct VM<'a, T: ResourceTracker, P: PrintWriter> {
    pub(crate) heap: &'a mut Heap<T>,
    pub(crate) print: &'a mut P,
    frames: Vec<Frame>,
    /// The exception handled by the innermost running `except` body; what a bare
    /// `raise` re-raises.
    exc_info: Option<Value>,
    /// Dispatch loops entered from native code that have not finished yet.
    native_depth: usize,
    /// Frames live when an uncatchable error first left a dispatch loop.
    fatal_traceback: Option<Vec<StackFrame>>,
}

impl<'a, T: ResourceTracker, P: PrintWriter> VM<'a, T, P> {
    pub fn new(heap: &'a mut Heap<T>, print: &'a mut P) -> Self {
        Self {
            heap,
            print,
            frames: Vec::with_capacity(16),
            exc_info: None,
            native_depth: 0,
            fatal_traceback: None,
        }
    }

    /// Runs module code in a fresh `__main__` namespace, returning its result.
    pub fn run_module(&mut self, code: Arc<Code>) -> RunResult<Value> {
        let mut namespace = Dict::new();
        namespace.insert_str("__name__", Value::from("__main__"));
        let globals = self.heap.allocate(HeapData::Dict(namespace))?;

        let mut frame = Frame::new(code, globals, Some(globals));
        frame.boundary = true;
        self.push_frame(frame)?;
        match self.run_loop()? {
            FrameOutcome::Return(value) => Ok(value),
            FrameOutcome::Yield(_) => Err(RunError::internal("module code yielded")),
        }
    }

    /// Traceback captured for an uncatchable error, outermost frame first.
    pub fn take_fatal_traceback(&mut self) -> Vec<StackFrame> {
        self.fatal_traceback.take().unwrap_or_default()
    }

    /// Runs the frame on top of the stack, which must be a boundary frame, from
    /// native code.
    pub(super) fn run_nested(&mut self) -> RunResult<FrameOutcome> {
        self.native_depth += 1;
        let outcome = self.run_loop();
        self.native_depth -= 1;
        outcome
    }

    /// Main execution loop: runs until the boundary frame at the current top of the
    /// frame stack finishes.
    fn run_loop(&mut self) -> RunResult<FrameOutcome> {
        let base = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| RunError::internal("run_loop: no frame to run"))?;
        loop {
            if self.native_depth == 0 && self.heap.should_gc() {
                self.collect_garbage();
            }
            let why = match self.step() {
                Ok(None) => continue,
                Ok(Some(why)) => why,
                Err(RunError::Exc(exc)) => match self.materialize(exc) {
                    Ok(exc) => {
                        self.record_traceback(&exc);
                        Unwinder::Raise(exc)
                    }
                    Err(err) => return Err(self.abort(base, err)),
                },
                Err(err) => return Err(self.abort(base, err)),
            };
            match self.unwind(why) {
                Ok(None) => {}
                Ok(Some(outcome)) => return Ok(outcome),
                Err(err) => return Err(self.abort(base, err)),
            }
        }
    }

    /// Discards this loop's frames after an error that no handler may see.
    fn abort(&mut self, base: usize, err: RunError) -> RunError {
        if !matches!(err, RunError::Exc(_)) && self.fatal_traceback.is_none() {
            self.fatal_traceback = Some(
                self.frames
                    .iter()
                    .map(|frame| StackFrame {
                        name: frame.code.name().to_owned(),
                        line: frame.line(),
                    })
                    .collect(),
            );
        }
        if base < self.frames.len() {
            let discarded: Vec<Frame> = self.frames.drain(base..).collect();
            for frame in discarded {
                if let Some(gen_id) = frame.generator {
                    self.finish_generator(gen_id);
                }
            }
        }
        err
    }

    fn collect_garbage(&mut self) {
        let mut roots = Vec::new();
        self.frames.as_slice().mark_children(&mut roots);
        self.exc_info.mark_children(&mut roots);
        self.heap.collect_garbage(roots);
    }

    // ========================================================================
    // Frame and stack access
    // ========================================================================

    pub(super) fn push_frame(&mut self, frame: Frame) -> RunResult<()> {
        self.heap.tracker().check_recursion_depth(self.frames.len())?;
        tracing::trace!(code = frame.code.name(), depth = self.frames.len() + 1, "push frame");
        self.frames.push(frame);
        Ok(())
    }

    fn pop_frame(&mut self) -> RunResult<Frame> {
        let frame = self.frames.pop().ok_or_else(|| RunError::internal("pop_frame: no frame"))?;
        tracing::trace!(code = frame.code.name(), depth = self.frames.len(), "pop frame");
        Ok(frame)
    }

    fn frame(&self) -> RunResult<&Frame> {
        self.frames.last().ok_or_else(|| RunError::internal("no active frame"))
    }

    fn frame_mut(&mut self) -> RunResult<&mut Frame> {
        self.frames.last_mut().ok_or_else(|| RunError::internal("no active frame"))
    }

    fn push(&mut self, value: Value) -> RunResult<()> {
        self.frame_mut()?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.frame_mut()?.stack.pop().ok_or_else(stack_underflow)
    }

    /// Pops `n` values, returned in push order.
    fn pop_n(&mut self, n: usize) -> RunResult<Vec<Value>> {
        let stack = &mut self.frame_mut()?.stack;
        let start = stack.len().checked_sub(n).ok_or_else(stack_underflow)?;
        Ok(stack.split_off(start))
    }

    /// The top `n` stack slots, bottom first.
    fn top_n(&mut self, n: usize) -> RunResult<&mut [Value]> {
        let stack = &mut self.frame_mut()?.stack;
        let start = stack.len().checked_sub(n).ok_or_else(stack_underflow)?;
        Ok(&mut stack[start..])
    }

    fn peek(&mut self) -> RunResult<Value> {
        Ok(self.top_n(1)?[0].clone())
    }

    fn jump(&mut self, target: usize) -> RunResult<()> {
        self.frame_mut()?.pc = target;
        Ok(())
    }

    /// Absolute jump; backward jumps are loop iterations and count against the time limit.
    fn jump_absolute(&mut self, target: usize) -> RunResult<()> {
        let frame = self.frame_mut()?;
        let backward = target <= frame.last_pc;
        frame.pc = target;
        if backward {
            self.heap.tracker_mut().check_time()?;
        }
        Ok(())
    }

    fn name_operand(&self, index: u32) -> RunResult<Arc<str>> {
        self.frame()?
            .code
            .names()
            .get(index as usize)
            .map(|name| Arc::from(name.as_str()))
            .ok_or_else(|| RunError::internal("name operand out of range"))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Executes one instruction. Returns the unwind reason if it leaves the current
    /// region abruptly.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self) -> RunResult<Option<Unwinder>> {
        let (op, arg) = fetch(self.frame_mut()?)?;
        match op {
            Opcode::Nop => {}
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::RotTwo => self.top_n(2)?.swap(0, 1),
            Opcode::RotThree => self.top_n(3)?.rotate_right(1),
            Opcode::DupTop => {
                let value = self.peek()?;
                self.push(value)?;
            }
            Opcode::DupTopTwo => {
                let pair = self.top_n(2)?.to_vec();
                self.frame_mut()?.stack.extend(pair);
            }

            Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert => {
                let operand = self.pop()?;
                let result = self.unary_op(op, operand)?;
                self.push(result)?;
            }
            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplacePower
            | Opcode::InplaceMultiply
            | Opcode::InplaceModulo
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = self.binary_opcode(op, lhs, rhs)?;
                self.push(result)?;
            }

            Opcode::BinarySubscr => {
                let index = self.pop()?;
                let container = self.pop()?;
                let result = self.getitem(&container, &index)?;
                self.push(result)?;
            }
            Opcode::StoreSubscr => {
                let index = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.setitem(&container, index, value)?;
            }
            Opcode::DeleteSubscr => {
                let index = self.pop()?;
                let container = self.pop()?;
                self.delitem(&container, &index)?;
            }
            Opcode::StoreMap => {
                let value = self.pop()?;
                let key = self.pop()?;
                let dict = self.peek()?;
                self.dict_insert(&dict, key, value)?;
            }

            Opcode::GetIter => {
                let iterable = self.pop()?;
                let iter = self.get_iter(iterable)?;
                self.push(iter)?;
            }
            Opcode::ForIter => {
                let exit = self.frame()?.pc + arg as usize;
                self.for_iter(exit)?;
            }
            Opcode::UnpackSequence => {
                let sequence = self.pop()?;
                let items = self.unpack(sequence, arg as usize)?;
                self.frame_mut()?.stack.extend(items.into_iter().rev());
            }

            Opcode::LoadBuildClass => self.push(Value::Builtin(Builtins::BuildClass))?,
            Opcode::LoadLocals => {
                let locals = self
                    .frame()?
                    .locals
                    .ok_or_else(|| RunError::internal("LOAD_LOCALS without a namespace"))?;
                self.push(Value::Ref(locals))?;
            }

            Opcode::ReturnValue => return Ok(Some(Unwinder::Return(self.pop()?))),
            Opcode::YieldValue => return Ok(Some(Unwinder::Yield(self.pop()?))),
            Opcode::BreakLoop => return Ok(Some(Unwinder::Break)),
            Opcode::ContinueLoop => {
                self.heap.tracker_mut().check_time()?;
                return Ok(Some(Unwinder::Continue(arg as usize)));
            }

            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                let kind = match op {
                    Opcode::SetupLoop => BlockKind::Loop,
                    Opcode::SetupExcept => BlockKind::Except,
                    _ => BlockKind::Finally,
                };
                let frame = self.frame_mut()?;
                let handler = frame.pc + arg as usize;
                frame.push_block(kind, handler);
            }
            Opcode::PopBlock => {
                let frame = self.frame_mut()?;
                let block = frame
                    .blocks
                    .pop()
                    .ok_or_else(|| RunError::internal("POP_BLOCK with an empty block stack"))?;
                frame.stack.truncate(block.depth);
            }
            Opcode::PopExcept => {
                let frame = self.frame_mut()?;
                let block = frame
                    .blocks
                    .pop()
                    .ok_or_else(|| RunError::internal("POP_EXCEPT with an empty block stack"))?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(RunError::internal("POP_EXCEPT outside an except handler"));
                }
                frame.stack.truncate(block.depth);
                self.exc_info = block.saved_exc;
            }
            Opcode::EndFinally => return self.end_finally(),
            Opcode::SetupWith => {
                let handler = self.frame()?.pc + arg as usize;
                self.setup_with(handler)?;
            }
            Opcode::WithCleanup => self.with_cleanup()?,
            Opcode::RaiseVarargs => return self.raise_varargs(arg).map(Some),

            Opcode::LoadConst => {
                let value = self
                    .frame()?
                    .code
                    .consts()
                    .get(arg as usize)
                    .map(Value::from_const)
                    .ok_or_else(|| RunError::internal("constant operand out of range"))?;
                self.push(value)?;
            }
            Opcode::LoadName => {
                let name = self.name_operand(arg)?;
                let frame = self.frame()?;
                let value = match frame.locals.and_then(|locals| self.dict_get_str(locals, &name)) {
                    Some(value) => value,
                    None => self.load_global(frame.globals, &name)?,
                };
                self.push(value)?;
            }
            Opcode::StoreName => {
                let name = self.name_operand(arg)?;
                let value = self.pop()?;
                let frame = self.frame()?;
                let namespace = frame.locals.unwrap_or(frame.globals);
                self.dict_set_str(namespace, &name, value)?;
            }
            Opcode::DeleteName => {
                let name = self.name_operand(arg)?;
                let frame = self.frame()?;
                let namespace = frame.locals.unwrap_or(frame.globals);
                if !self.dict_del_str(namespace, &name)? {
                    return Err(ExcType::name_error(&name));
                }
            }
            Opcode::LoadGlobal => {
                let name = self.name_operand(arg)?;
                let globals = self.frame()?.globals;
                let value = self.load_global(globals, &name)?;
                self.push(value)?;
            }
            Opcode::StoreGlobal => {
                let name = self.name_operand(arg)?;
                let value = self.pop()?;
                let globals = self.frame()?.globals;
                self.dict_set_str(globals, &name, value)?;
            }
            Opcode::DeleteGlobal => {
                let name = self.name_operand(arg)?;
                let globals = self.frame()?.globals;
                if !self.dict_del_str(globals, &name)? {
                    return Err(ExcType::name_error(&name));
                }
            }

            Opcode::LoadFast => {
                let frame = self.frame()?;
                let value = match frame.fast.get(arg as usize) {
                    Some(Some(value)) => value.clone(),
                    Some(None) => return Err(ExcType::unbound_local_error(&frame.code.varnames()[arg as usize])),
                    None => return Err(RunError::internal("LOAD_FAST slot out of range")),
                };
                self.push(value)?;
            }
            Opcode::StoreFast => {
                let value = self.pop()?;
                let slot = self
                    .frame_mut()?
                    .fast
                    .get_mut(arg as usize)
                    .ok_or_else(|| RunError::internal("STORE_FAST slot out of range"))?;
                *slot = Some(value);
            }
            Opcode::DeleteFast => {
                let frame = self.frame_mut()?;
                match frame.fast.get_mut(arg as usize).map(Option::take) {
                    Some(Some(_)) => {}
                    Some(None) => return Err(ExcType::unbound_local_error(&frame.code.varnames()[arg as usize])),
                    None => return Err(RunError::internal("DELETE_FAST slot out of range")),
                }
            }

            Opcode::LoadClosure => {
                let cell = self.cell_operand(arg)?;
                self.push(Value::Ref(cell))?;
            }
            Opcode::LoadDeref => {
                let value = self.load_deref(arg)?;
                self.push(value)?;
            }
            Opcode::LoadClassDeref => {
                let frame = self.frame()?;
                let name = frame
                    .code
                    .deref_name(arg as usize)
                    .ok_or_else(|| RunError::internal("deref operand out of range"))?;
                let value = match frame.locals.and_then(|locals| self.dict_get_str(locals, name)) {
                    Some(value) => value,
                    None => self.load_deref(arg)?,
                };
                self.push(value)?;
            }
            Opcode::StoreDeref => {
                let value = self.pop()?;
                let cell = self.cell_operand(arg)?;
                self.heap.set_cell(cell, Some(value))?;
            }
            Opcode::DeleteDeref => {
                self.load_deref(arg)?;
                let cell = self.cell_operand(arg)?;
                self.heap.set_cell(cell, None)?;
            }

            Opcode::LoadAttr => {
                let name = self.name_operand(arg)?;
                let obj = self.pop()?;
                let value = self.get_attr(&obj, &name)?;
                self.push(value)?;
            }
            Opcode::StoreAttr => {
                let name = self.name_operand(arg)?;
                let obj = self.pop()?;
                let value = self.pop()?;
                self.set_attr(&obj, &name, value)?;
            }
            Opcode::DeleteAttr => {
                let name = self.name_operand(arg)?;
                let obj = self.pop()?;
                self.del_attr(&obj, &name)?;
            }

            Opcode::BuildTuple => {
                let items = self.pop_n(arg as usize)?;
                let tuple = self.heap.allocate(HeapData::Tuple(items))?;
                self.push(Value::Ref(tuple))?;
            }
            Opcode::BuildList => {
                let items = self.pop_n(arg as usize)?;
                let list = self.heap.allocate(HeapData::List(items))?;
                self.push(Value::Ref(list))?;
            }
            Opcode::BuildSet => {
                let items = self.pop_n(arg as usize)?;
                let set = self.new_set(items)?;
                self.push(set)?;
            }
            Opcode::BuildMap => {
                let dict = self.heap.allocate(HeapData::Dict(Dict::new()))?;
                self.push(Value::Ref(dict))?;
            }
            Opcode::ListAppend | Opcode::SetAdd | Opcode::MapAdd => self.comprehension_add(op, arg as usize)?,

            Opcode::CompareOp => {
                let kind = u8::try_from(arg)
                    .ok()
                    .and_then(CompareKind::from_repr)
                    .ok_or_else(|| RunError::internal("invalid comparison operand"))?;
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = self.compare_op(kind, lhs, rhs)?;
                self.push(result)?;
            }

            Opcode::JumpForward => {
                let frame = self.frame_mut()?;
                frame.pc += arg as usize;
            }
            Opcode::JumpAbsolute => self.jump_absolute(arg as usize)?,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let value = self.pop()?;
                if self.truthy(&value)? == (op == Opcode::PopJumpIfTrue) {
                    self.jump_absolute(arg as usize)?;
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                let value = self.peek()?;
                if self.truthy(&value)? == (op == Opcode::JumpIfTrueOrPop) {
                    self.jump(arg as usize)?;
                } else {
                    self.pop()?;
                }
            }

            Opcode::CallFunction => self.call_function_op(arg)?,
            Opcode::MakeFunction => self.make_function(arg, false)?,
            Opcode::MakeClosure => self.make_function(arg, true)?,

            Opcode::ExtendedArg => return Err(RunError::internal("EXTENDED_ARG reached dispatch")),
        }
        Ok(None)
    }

    // ========================================================================
    // Unwinding
    // ========================================================================

    /// Routes an abrupt exit through the block stacks until a block handles it, a
    /// frame finishes, or the loop's boundary frame is left.
    fn unwind(&mut self, mut why: Unwinder) -> RunResult<Option<FrameOutcome>> {
        loop {
            if let Unwinder::Yield(value) = why {
                return self.suspend_generator(value);
            }

            let frame = self.frames.last_mut().ok_or_else(|| RunError::internal("unwind: no frame"))?;
            while let Some(block) = frame.blocks.pop() {
                tracing::trace!(why = why.kind(), block = ?block.kind, "unwind step");
                // `continue` stays inside the loop: its block and the iterator above
                // the block's depth are kept.
                if let (BlockKind::Loop, Unwinder::Continue(target)) = (block.kind, &why) {
                    frame.pc = *target;
                    frame.blocks.push(block);
                    return Ok(None);
                }
                frame.stack.truncate(block.depth);
                if block.kind == BlockKind::ExceptHandler {
                    self.exc_info = block.saved_exc;
                    continue;
                }
                if !block.kind.handles(&why) {
                    continue;
                }
                match (block.kind, why) {
                    (BlockKind::Loop, Unwinder::Break) => frame.pc = block.handler,
                    (BlockKind::Except, Unwinder::Raise(exc)) => {
                        let saved_exc = self.exc_info.replace(exc.clone());
                        frame.blocks.push(FrameBlock {
                            kind: BlockKind::ExceptHandler,
                            handler: block.handler,
                            depth: block.depth,
                            saved_exc,
                        });
                        frame.stack.push(exc);
                        frame.pc = block.handler;
                    }
                    (BlockKind::Finally, why) => {
                        frame.stack.push(Value::Unwind(Box::new(why)));
                        frame.pc = block.handler;
                    }
                    (kind, why) => {
                        return Err(RunError::internal(format!(
                            "{kind:?} block cannot handle {}",
                            why.kind()
                        )));
                    }
                }
                return Ok(None);
            }

            let frame = self.pop_frame()?;
            match why {
                Unwinder::Return(value) => {
                    let boundary = frame.boundary;
                    match self.complete_frame(frame, value) {
                        Err(RunError::Exc(exc)) if !boundary => {
                            let exc = self.materialize(exc)?;
                            self.record_traceback(&exc);
                            why = Unwinder::Raise(exc);
                        }
                        other => return other,
                    }
                }
                Unwinder::Raise(exc) => {
                    if let Some(gen_id) = frame.generator {
                        self.finish_generator(gen_id);
                    }
                    if frame.boundary {
                        return Err(RunError::Exc(ExceptionRaise::Object(exc)));
                    }
                    // The caller's entry points at its call site.
                    self.record_traceback(&exc);
                    why = Unwinder::Raise(exc);
                }
                Unwinder::Break | Unwinder::Continue(_) => {
                    return Err(RunError::internal(format!(
                        "'{}' unwound past the end of {}",
                        why.kind(),
                        frame.code.name()
                    )));
                }
                Unwinder::Yield(_) => return Err(RunError::internal("yield reached frame exit")),
            }
        }
    }

    /// Delivers a finished frame's return value through its continuation.
    ///
    /// Errors are raised in the caller's context.
    fn complete_frame(&mut self, frame: Frame, value: Value) -> RunResult<Option<FrameOutcome>> {
        if let Some(gen_id) = frame.generator {
            self.finish_generator(gen_id);
            if frame.boundary {
                return Ok(Some(FrameOutcome::Return(value)));
            }
            return match frame.continuation {
                Continuation::ForIter { exit } => {
                    self.pop()?;
                    self.jump(exit)?;
                    Ok(None)
                }
                _ => Err(ExcType::stop_iteration()),
            };
        }

        let result = match frame.continuation {
            Continuation::Value => value,
            Continuation::Init(instance) => {
                if !value.is_none() {
                    return Err(ExcType::type_error(format!(
                        "__init__() should return None, not '{}'",
                        value.type_name(self.heap)
                    )));
                }
                instance
            }
            Continuation::BuildClass { name, bases } => self.finish_class(name, bases, &value)?,
            Continuation::ForIter { .. } | Continuation::Next => {
                return Err(RunError::internal("iteration continuation on a plain frame"));
            }
        };
        if frame.boundary {
            return Ok(Some(FrameOutcome::Return(result)));
        }
        self.push(result)?;
        Ok(None)
    }

    fn end_finally(&mut self) -> RunResult<Option<Unwinder>> {
        match self.pop()? {
            Value::None => Ok(None),
            Value::Unwind(why) => Ok(Some(*why)),
            exc @ Value::Ref(_) if self.is_exception(&exc) => Ok(Some(Unwinder::Raise(exc))),
            other => Err(RunError::internal(format!(
                "END_FINALLY found '{}' on the stack",
                other.type_name(self.heap)
            ))),
        }
    }

    // ========================================================================
    // Names, cells and iteration
    // ========================================================================

    fn load_global(&self, globals: HeapId, name: &str) -> RunResult<Value> {
        if let Some(value) = self.dict_get_str(globals, name) {
            return Ok(value);
        }
        Builtins::lookup(name).ok_or_else(|| ExcType::name_error(name))
    }

    fn dict_get_str(&self, dict: HeapId, name: &str) -> Option<Value> {
        match self.heap.get(dict) {
            HeapData::Dict(dict) => dict.get_str(name).cloned(),
            _ => None,
        }
    }

    pub(super) fn dict_set_str(&mut self, dict: HeapId, name: &str, value: Value) -> RunResult<()> {
        match self.heap.get_mut(dict) {
            HeapData::Dict(dict) => {
                dict.insert_str(name, value);
                Ok(())
            }
            _ => Err(RunError::internal("namespace is not a dict")),
        }
    }

    fn dict_del_str(&mut self, dict: HeapId, name: &str) -> RunResult<bool> {
        match self.heap.get_mut(dict) {
            HeapData::Dict(dict) => Ok(dict.remove(&DictKey::str(name)).is_some()),
            _ => Err(RunError::internal("namespace is not a dict")),
        }
    }

    fn cell_operand(&self, index: u32) -> RunResult<HeapId> {
        self.frame()?
            .cells
            .get(index as usize)
            .copied()
            .ok_or_else(|| RunError::internal("cell operand out of range"))
    }

    fn load_deref(&self, index: u32) -> RunResult<Value> {
        let cell = self.cell_operand(index)?;
        if let HeapData::Cell(Some(value)) = self.heap.get(cell) {
            return Ok(value.clone());
        }
        let code = &self.frame()?.code;
        let name = code.deref_name(index as usize).unwrap_or("?");
        if (index as usize) < code.cellvars().len() {
            Err(ExcType::unbound_local_error(name))
        } else {
            Err(ExcType::name_error_free_variable(name))
        }
    }

    /// `FOR_ITER`: pushes the next item, or pops the exhausted iterator and jumps.
    ///
    /// Generators are resumed on the frame stack; their yield lands on this frame's
    /// stack and their exhaustion performs the jump.
    fn for_iter(&mut self, exit: usize) -> RunResult<()> {
        let iter = self.peek()?;
        if let Value::Ref(id) = iter
            && matches!(self.heap.get(id), HeapData::Generator(_))
        {
            return match self.resume_generator(id, Value::None, Continuation::ForIter { exit }, false)? {
                Resumed::Pushed => Ok(()),
                Resumed::Exhausted => {
                    self.pop()?;
                    self.jump(exit)
                }
            };
        }
        match self.iter_next(&iter)? {
            Some(item) => self.push(item),
            None => {
                self.pop()?;
                self.jump(exit)
            }
        }
    }

    /// `LIST_APPEND`, `SET_ADD` and `MAP_ADD`: the target container sits `n` slots
    /// below the popped operands.
    fn comprehension_add(&mut self, op: Opcode, n: usize) -> RunResult<()> {
        let (key, value) = if op == Opcode::MapAdd {
            let value = self.pop()?;
            (Some(self.pop()?), value)
        } else {
            (None, self.pop()?)
        };
        let target = self.top_n(n)?[0].clone();
        match (op, key) {
            (Opcode::MapAdd, Some(key)) => self.dict_insert(&target, key, value),
            (Opcode::SetAdd, _) => self.set_add(&target, value),
            _ => match target.ref_id().map(|id| self.heap.get_mut(id)) {
                Some(HeapData::List(items)) => {
                    items.push(value);
                    Ok(())
                }
                _ => Err(RunError::internal("LIST_APPEND target is not a list")),
            },
        }
    }

    // ========================================================================
    // Calls and function objects
    // ========================================================================

    /// `CALL_FUNCTION`: keyword `(name, value)` pairs sit above the positionals.
    fn call_function_op(&mut self, arg: u32) -> RunResult<()> {
        let npos = (arg & 0xff) as usize;
        let nkw = ((arg >> 8) & 0xff) as usize;
        let kwargs = self.pop_keyword_pairs(nkw)?;
        let positional = self.pop_n(npos)?;
        let callable = self.pop()?;
        self.heap.tracker_mut().check_time()?;
        self.call_and_push(callable, ArgValues::new(positional, kwargs))
    }

    fn call_and_push(&mut self, callable: Value, args: ArgValues) -> RunResult<()> {
        match self.call(callable, args)? {
            CallResult::Value(value) => self.push(value),
            CallResult::Frame(frame) => self.push_frame(*frame),
        }
    }

    fn pop_keyword_pairs(&mut self, count: usize) -> RunResult<Vec<(Arc<str>, Value)>> {
        let flat = self.pop_n(count * 2)?;
        let mut pairs = Vec::with_capacity(count);
        let mut iter = flat.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let Value::Str(name) = key else {
                return Err(RunError::internal("keyword name is not a string constant"));
            };
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    /// `MAKE_FUNCTION` / `MAKE_CLOSURE`: stack is
    /// `[defaults..., kwonly pairs..., (closure tuple), code, qualname]`.
    fn make_function(&mut self, arg: u32, with_closure: bool) -> RunResult<()> {
        let ndefaults = (arg & 0xff) as usize;
        let nkwdefaults = ((arg >> 8) & 0xff) as usize;
        let Value::Str(qualname) = self.pop()? else {
            return Err(RunError::internal("MAKE_FUNCTION: qualname is not a string"));
        };
        let Value::Code(code) = self.pop()? else {
            return Err(RunError::internal("MAKE_FUNCTION: expected a code object"));
        };
        let closure = if with_closure {
            let cells = self.pop()?;
            match cells.ref_id().map(|id| self.heap.get(id)) {
                Some(HeapData::Tuple(items)) => items
                    .iter()
                    .map(|cell| cell.ref_id().ok_or_else(|| RunError::internal("closure item is not a cell")))
                    .collect::<RunResult<Vec<_>>>()?,
                _ => return Err(RunError::internal("MAKE_CLOSURE: expected a tuple of cells")),
            }
        } else {
            Vec::new()
        };
        let kwdefaults = self.pop_keyword_pairs(nkwdefaults)?;
        let defaults = self.pop_n(ndefaults)?;
        let globals = self.frame()?.globals;

        let func = self.heap.allocate(HeapData::Function(Function {
            code,
            qualname,
            globals,
            defaults,
            kwdefaults,
            closure,
        }))?;
        self.push(Value::Ref(func))
    }
}

/// Decodes the instruction at `frame.pc`, folding `EXTENDED_ARG` prefixes.
fn fetch(frame: &mut Frame) -> RunResult<(Opcode, u32)> {
    frame.last_pc = frame.pc;
    let mut extended = 0u32;
    loop {
        let bytecode = frame.code.bytecode();
        let byte = *bytecode
            .get(frame.pc)
            .ok_or_else(|| RunError::internal("pc ran past the end of the bytecode"))?;
        let op = Opcode::try_from(byte).map_err(|err| RunError::internal(err.to_string()))?;
        if !op.has_arg() {
            frame.pc += 1;
            return Ok((op, 0));
        }
        let operand = bytecode
            .get(frame.pc + 1..frame.pc + 3)
            .ok_or_else(|| RunError::internal("truncated operand"))?;
        let arg = (extended << 16) | u32::from(u16::from_le_bytes([operand[0], operand[1]]));
        frame.pc += 3;
        if op != Opcode::ExtendedArg {
            return Ok((op, arg));
        }
        extended = arg;
    }
}

fn stack_underflow() -> RunError {
    RunError::internal("value stack underflow")
}
