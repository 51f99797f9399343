//! Per-activation state: the frame, its block stack and the unwind reasons.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{
    bytecode::Code,
    heap::{HeapId, Trace},
    value::Value,
};

/// Why a region of code is being left abruptly.
#[derive(Debug, Clone)]
pub(crate) enum Unwinder {
    Return(Value),
    Break,
    /// Continue at an absolute loop start.
    Continue(usize),
    /// A heap exception instance.
    Raise(Value),
    Yield(Value),
}

impl Unwinder {
    /// Bit tested against a block's handling mask.
    pub fn mask(&self) -> u8 {
        match self {
            Self::Return(_) => WHY_RETURN,
            Self::Break => WHY_BREAK,
            Self::Continue(_) => WHY_CONTINUE,
            Self::Raise(_) => WHY_RAISE,
            Self::Yield(_) => WHY_YIELD,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Return(_) => "return",
            Self::Break => "break",
            Self::Continue(_) => "continue",
            Self::Raise(_) => "raise",
            Self::Yield(_) => "yield",
        }
    }
}

impl Trace for Unwinder {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        match self {
            Self::Return(value) | Self::Raise(value) | Self::Yield(value) => value.mark_children(work_list),
            Self::Break | Self::Continue(_) => {}
        }
    }
}

const WHY_RETURN: u8 = 1;
const WHY_BREAK: u8 = 1 << 1;
const WHY_CONTINUE: u8 = 1 << 2;
const WHY_RAISE: u8 = 1 << 3;
const WHY_YIELD: u8 = 1 << 4;

/// Kind of an open region on a frame's block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Loop,
    Except,
    Finally,
    /// An except handler body is running; popping it restores the previously
    /// handled exception.
    ExceptHandler,
}

impl BlockKind {
    /// Unwind reasons this block intercepts. Yields suspend the frame and never unwind.
    pub fn mask(self) -> u8 {
        match self {
            Self::Loop => WHY_BREAK | WHY_CONTINUE,
            Self::Except => WHY_RAISE,
            Self::Finally => WHY_RETURN | WHY_BREAK | WHY_CONTINUE | WHY_RAISE,
            Self::ExceptHandler => 0,
        }
    }

    pub fn handles(self, why: &Unwinder) -> bool {
        self.mask() & why.mask() != 0
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FrameBlock {
    pub kind: BlockKind,
    /// Absolute handler offset.
    pub handler: usize,
    /// Value-stack depth when the block was pushed.
    pub depth: usize,
    /// For `ExceptHandler`: the exception that was being handled before this one.
    pub saved_exc: Option<Value>,
}

impl FrameBlock {
    pub fn new(kind: BlockKind, handler: usize, depth: usize) -> Self {
        Self {
            kind,
            handler,
            depth,
            saved_exc: None,
        }
    }
}

/// What happens to a frame's result once it finishes.
#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    /// Push the return value onto the caller's stack.
    Value,
    /// Constructor call: `__init__` must return `None`; the instance is the result.
    Init(Value),
    /// Class body: the returned namespace becomes a class.
    BuildClass { name: Arc<str>, bases: Vec<Value> },
    /// Generator resumed by `FOR_ITER` in the caller; exhaustion pops the iterator
    /// and jumps to `exit`.
    ForIter { exit: usize },
    /// Generator resumed by `next()` or `send()`; exhaustion raises `StopIteration`.
    Next,
}

impl Trace for Continuation {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        match self {
            Self::Init(instance) => instance.mark_children(work_list),
            Self::BuildClass { bases, .. } => bases.mark_children(work_list),
            Self::Value | Self::ForIter { .. } | Self::Next => {}
        }
    }
}

/// The runtime activation of one code object.
#[derive(Debug)]
pub(crate) struct Frame {
    pub code: Arc<Code>,
    /// Offset of the next instruction.
    pub pc: usize,
    /// Offset of the instruction being executed, for tracebacks.
    pub last_pc: usize,
    pub stack: Vec<Value>,
    /// Fast-local slots, parallel to `code.varnames`.
    pub fast: Vec<Option<Value>>,
    /// Cellvars first, then the closure's freevars.
    pub cells: Vec<HeapId>,
    /// Nesting rarely goes past a few levels, so this stays inline.
    pub blocks: SmallVec<[FrameBlock; 4]>,
    pub globals: HeapId,
    /// Namespace dict of module and class bodies.
    pub locals: Option<HeapId>,
    pub continuation: Continuation,
    /// A native caller is waiting for this frame: its result leaves the dispatch loop
    /// instead of being delivered to the frame below.
    pub boundary: bool,
    /// The generator object this frame belongs to, while it runs.
    pub generator: Option<HeapId>,
}

impl Frame {
    pub fn new(code: Arc<Code>, globals: HeapId, locals: Option<HeapId>) -> Self {
        let nlocals = code.varnames().len();
        Self {
            stack: Vec::with_capacity(code.stack_size() as usize),
            fast: vec![None; nlocals],
            cells: Vec::new(),
            blocks: SmallVec::new(),
            pc: 0,
            last_pc: 0,
            code,
            globals,
            locals,
            continuation: Continuation::Value,
            boundary: false,
            generator: None,
        }
    }

    /// Source line of the instruction being executed.
    pub fn line(&self) -> u32 {
        self.code.line_for_offset(self.last_pc)
    }

    pub fn push_block(&mut self, kind: BlockKind, handler: usize) {
        let depth = self.stack.len();
        self.blocks.push(FrameBlock::new(kind, handler, depth));
    }
}

impl Trace for Frame {
    fn mark_children(&self, work_list: &mut Vec<HeapId>) {
        self.stack.mark_children(work_list);
        for slot in &self.fast {
            slot.mark_children(work_list);
        }
        work_list.extend_from_slice(&self.cells);
        for block in &self.blocks {
            block.saved_exc.mark_children(work_list);
        }
        work_list.push(self.globals);
        if let Some(locals) = self.locals {
            work_list.push(locals);
        }
        self.continuation.mark_children(work_list);
        if let Some(generator) = self.generator {
            work_list.push(generator);
        }
        self.code.mark_children(work_list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_route_each_reason() {
        assert!(BlockKind::Loop.handles(&Unwinder::Break));
        assert!(BlockKind::Loop.handles(&Unwinder::Continue(0)));
        assert!(!BlockKind::Loop.handles(&Unwinder::Raise(Value::None)));
        assert!(BlockKind::Except.handles(&Unwinder::Raise(Value::None)));
        assert!(!BlockKind::Except.handles(&Unwinder::Return(Value::None)));
        for why in [
            Unwinder::Return(Value::None),
            Unwinder::Break,
            Unwinder::Continue(3),
            Unwinder::Raise(Value::None),
        ] {
            assert!(BlockKind::Finally.handles(&why), "finally must intercept {}", why.kind());
            assert!(!BlockKind::ExceptHandler.handles(&why));
        }
        assert!(!BlockKind::Finally.handles(&Unwinder::Yield(Value::None)));
    }
}
