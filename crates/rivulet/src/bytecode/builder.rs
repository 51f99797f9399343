//! Instruction and block builder used by the compiler.
//!
//! Instructions are appended to the current [`CodeBlock`]. Jumps name a target block
//! rather than an offset: physical offsets only exist once the block chain has been
//! linearised, and they can still move when a jump operand grows past 16 bits and gains an
//! `ExtendedArg` prefix. [`CodeBuilder::build`] therefore iterates offset assignment and
//! operand patching until no instruction changes size.
//!
//! Blocks form a single chain in emission order (`use_next_block` links the current
//! block to a fresh one). They are never reordered or merged.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::{
    code::{Code, CodeFlags, Const},
    op::{JumpKind, Opcode},
};
use crate::exception::CompileError;

/// Index of a block in the builder's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(usize);

#[derive(Debug, Clone)]
struct Instruction {
    opcode: Opcode,
    arg: u32,
    /// Only the first instruction after a `set_lineno` carries a line.
    line: Option<u32>,
    target: Option<BlockId>,
    /// Sticky: once an instruction needs `ExtendedArg` it keeps it, so that the offset
    /// fixpoint only ever grows and therefore terminates.
    extended: bool,
}

impl Instruction {
    fn size(&self) -> usize {
        if !self.opcode.has_arg() {
            1
        } else if self.extended {
            6
        } else {
            3
        }
    }
}

#[derive(Debug, Default)]
struct CodeBlock {
    instructions: Vec<Instruction>,
    next: Option<BlockId>,
    /// Byte offset of the first instruction, valid after linearisation.
    offset: usize,
    /// Whether some other block's `next` already points here.
    linked: bool,
}

/// Key used to deduplicate the constants pool.
///
/// Variant tags keep `1`, `1.0` and `True` apart; floats compare by bit pattern so that
/// `0.0` and `-0.0` stay distinct. Code constants are never shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Ellipsis,
    Code(usize),
}

/// Accumulates the bytecode and pools of one code unit.
#[derive(Debug)]
pub(crate) struct CodeBuilder {
    name: String,
    filename: Arc<str>,
    first_line: u32,
    argcount: u32,
    kwonlyargcount: u32,
    flags: CodeFlags,

    blocks: Vec<CodeBlock>,
    first: BlockId,
    current: BlockId,

    line: u32,
    line_pending: bool,

    consts: IndexMap<ConstKey, Const>,
    names: IndexSet<String>,
    varnames: IndexSet<String>,
    cellvars: IndexSet<String>,
    freevars: IndexSet<String>,
}

impl CodeBuilder {
    pub fn new(name: impl Into<String>, filename: Arc<str>, first_line: u32) -> Self {
        Self {
            name: name.into(),
            filename,
            first_line,
            argcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::empty(),
            blocks: vec![CodeBlock {
                linked: true,
                ..CodeBlock::default()
            }],
            first: BlockId(0),
            current: BlockId(0),
            line: first_line,
            line_pending: true,
            consts: IndexMap::new(),
            names: IndexSet::new(),
            varnames: IndexSet::new(),
            cellvars: IndexSet::new(),
            freevars: IndexSet::new(),
        }
    }

    pub fn set_argcount(&mut self, argcount: u32, kwonlyargcount: u32) {
        self.argcount = argcount;
        self.kwonlyargcount = kwonlyargcount;
    }

    pub fn add_flags(&mut self, flags: CodeFlags) {
        self.flags.insert(flags);
    }

    /// Declares the source line of the code emitted next.
    ///
    /// Only the first instruction appended afterwards is tagged, keeping the line table sparse.
    pub fn set_lineno(&mut self, line: u32) {
        self.line = line;
        self.line_pending = true;
    }

    pub fn emit(&mut self, opcode: Opcode) {
        debug_assert!(!opcode.has_arg(), "{opcode} requires an operand");
        self.push(opcode, 0, None);
    }

    pub fn emit_arg(&mut self, opcode: Opcode, arg: u32) {
        debug_assert!(opcode.has_arg(), "{opcode} takes no operand");
        debug_assert!(opcode.jump_kind().is_none(), "use emit_jump for {opcode}");
        self.push(opcode, arg, None);
    }

    /// Emits a jump (or block setup) whose operand is resolved to `target` at build time.
    pub fn emit_jump(&mut self, opcode: Opcode, target: BlockId) {
        debug_assert!(opcode.jump_kind().is_some(), "{opcode} is not a jump");
        self.push(opcode, 0, Some(target));
    }

    fn push(&mut self, opcode: Opcode, arg: u32, target: Option<BlockId>) {
        let line = if self.line_pending {
            self.line_pending = false;
            Some(self.line)
        } else {
            None
        };
        self.blocks[self.current.0].instructions.push(Instruction {
            opcode,
            arg,
            line,
            target,
            extended: arg > u32::from(u16::MAX),
        });
    }

    /// Allocates a block that is not yet part of the chain.
    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(CodeBlock::default());
        BlockId(self.blocks.len() - 1)
    }

    /// Appends `block` to the chain and makes it the current block.
    pub fn use_next_block(&mut self, block: BlockId) {
        debug_assert!(!self.blocks[block.0].linked, "block placed twice");
        self.blocks[self.current.0].next = Some(block);
        self.blocks[block.0].linked = true;
        self.current = block;
    }

    /// Starts a new block right after the current one, e.g. for a loop head.
    pub fn next_block(&mut self) -> BlockId {
        let block = self.new_block();
        self.use_next_block(block);
        block
    }

    /// Redirects emission into a block that is never placed in the chain.
    ///
    /// Used for branches eliminated by a constant test: the code is still generated
    /// (so nested scopes are consumed in order) but never reaches the bytecode.
    pub fn detach(&mut self) -> BlockId {
        let saved = self.current;
        let scratch = self.new_block();
        self.blocks[scratch.0].linked = true;
        self.current = scratch;
        saved
    }

    /// Resumes emission at the block returned by [`detach`](Self::detach).
    pub fn reattach(&mut self, saved: BlockId) {
        self.current = saved;
    }

    // ========================================================================
    // Pools
    // ========================================================================

    pub fn const_index(&mut self, value: Const) -> u32 {
        let key = match &value {
            Const::None => ConstKey::None,
            Const::Bool(b) => ConstKey::Bool(*b),
            Const::Int(i) => ConstKey::Int(*i),
            Const::Float(f) => ConstKey::Float(f.to_bits()),
            Const::Str(s) => ConstKey::Str(s.clone()),
            Const::Ellipsis => ConstKey::Ellipsis,
            Const::Code(_) => ConstKey::Code(self.consts.len()),
        };
        let (index, _) = self.consts.insert_full(key, value);
        index as u32
    }

    pub fn name_index(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    pub fn varname_index(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    pub fn add_cellvar(&mut self, name: &str) {
        intern(&mut self.cellvars, name);
    }

    pub fn add_freevar(&mut self, name: &str) {
        intern(&mut self.freevars, name);
    }

    /// Index into the frame's cell array: cellvars first, then freevars.
    pub fn deref_index(&self, name: &str) -> Option<u32> {
        if let Some(index) = self.cellvars.get_index_of(name) {
            return Some(index as u32);
        }
        self.freevars
            .get_index_of(name)
            .map(|index| (self.cellvars.len() + index) as u32)
    }

    pub fn has_free_or_cell(&self) -> bool {
        !self.cellvars.is_empty() || !self.freevars.is_empty()
    }

    // ========================================================================
    // Assembly
    // ========================================================================

    /// Freezes the unit into an immutable [`Code`].
    ///
    /// Fails when a jump targets a block that was never placed in the chain, or when
    /// the stack simulation finds an underflow; both mean the compiler emitted bad code.
    pub fn build(mut self) -> Result<Code, CompileError> {
        let order = self.linearize()?;
        self.assign_offsets(&order);
        let stack_size = self.stack_depth()?;
        let bytecode = self.encode(&order);
        let lnotab = self.line_table(&order);

        let mut flags = self.flags;
        if self.cellvars.is_empty() && self.freevars.is_empty() {
            flags.insert(CodeFlags::NOFREE);
        }

        tracing::debug!(
            name = %self.name,
            bytes = bytecode.len(),
            stack_size,
            "compiled code unit"
        );

        Ok(Code {
            name: self.name,
            argcount: self.argcount,
            kwonlyargcount: self.kwonlyargcount,
            flags,
            bytecode,
            consts: self.consts.into_values().collect(),
            names: self.names.into_iter().collect(),
            varnames: self.varnames.into_iter().collect(),
            freevars: self.freevars.into_iter().collect(),
            cellvars: self.cellvars.into_iter().collect(),
            filename: self.filename,
            first_line: self.first_line,
            lnotab,
            stack_size,
        })
    }

    fn internal_error(&self, msg: &'static str) -> CompileError {
        CompileError::new(msg, self.first_line)
    }

    /// Follows `next` pointers from the first block.
    fn linearize(&self) -> Result<Vec<BlockId>, CompileError> {
        let mut order = Vec::new();
        let mut placed = vec![false; self.blocks.len()];
        let mut cursor = Some(self.first);
        while let Some(id) = cursor {
            placed[id.0] = true;
            order.push(id);
            cursor = self.blocks[id.0].next;
        }
        let dangling = order
            .iter()
            .flat_map(|id| &self.blocks[id.0].instructions)
            .filter_map(|inst| inst.target)
            .any(|target| !placed[target.0]);
        if dangling {
            return Err(self.internal_error("jump to a block outside the code chain"));
        }
        Ok(order)
    }

    /// Assigns block offsets and resolves jump operands until sizes are stable.
    fn assign_offsets(&mut self, order: &[BlockId]) {
        loop {
            let mut offset = 0;
            for id in order {
                let block = &mut self.blocks[id.0];
                block.offset = offset;
                offset += block.instructions.iter().map(Instruction::size).sum::<usize>();
            }

            let mut grew = false;
            for id in order {
                let mut offset = self.blocks[id.0].offset;
                for index in 0..self.blocks[id.0].instructions.len() {
                    let inst = &self.blocks[id.0].instructions[index];
                    let size = inst.size();
                    if let (Some(target), Some(kind)) = (inst.target, inst.opcode.jump_kind()) {
                        let target_offset = self.blocks[target.0].offset;
                        let arg = match kind {
                            JumpKind::Absolute => target_offset,
                            JumpKind::Relative => target_offset.saturating_sub(offset + size),
                        };
                        debug_assert!(
                            kind == JumpKind::Absolute || target_offset >= offset + size,
                            "relative jumps only go forward"
                        );
                        let inst = &mut self.blocks[id.0].instructions[index];
                        inst.arg = arg as u32;
                        if !inst.extended && inst.arg > u32::from(u16::MAX) {
                            inst.extended = true;
                            grew = true;
                        }
                    }
                    offset += size;
                }
            }
            if !grew {
                return;
            }
        }
    }

    /// Maximum value-stack depth over every reachable path.
    ///
    /// Entry depths propagate along fall-through and jump edges with a worklist. Every
    /// path into a block must agree on its entry depth; only handler entries (targets of
    /// the setup opcodes) keep the largest depth seen. `CONTINUE_LOOP` edges are skipped:
    /// the engine unwinds to the loop block, which restores the loop head's depth, and
    /// the head is always reached by fall-through first.
    fn stack_depth(&self) -> Result<u32, CompileError> {
        // Anything past this is certainly a compiler bug (e.g. a loop that pushes per
        // iteration) and would otherwise never converge.
        const LIMIT: i32 = 1 << 20;

        let mut handler_entry = vec![false; self.blocks.len()];
        for inst in self.blocks.iter().flat_map(|block| &block.instructions) {
            if let (Some(target), Opcode::SetupExcept | Opcode::SetupFinally | Opcode::SetupWith) =
                (inst.target, inst.opcode)
            {
                handler_entry[target.0] = true;
            }
        }

        let mut depths = EntryDepths {
            entry: vec![None; self.blocks.len()],
            handler_entry,
            worklist: Vec::new(),
        };
        depths.reach(self.first, 0).map_err(|msg| self.internal_error(msg))?;
        let mut max_depth = 0;

        while let Some(id) = depths.worklist.pop() {
            let block = &self.blocks[id.0];
            let Some(mut depth) = depths.entry[id.0] else { continue };
            max_depth = max_depth.max(depth);
            let mut falls_off_end = true;
            for inst in &block.instructions {
                if let Some(target) = inst.target
                    && inst.opcode != Opcode::ContinueLoop
                {
                    let jump_depth = depth + inst.opcode.stack_effect(inst.arg, true);
                    max_depth = max_depth.max(jump_depth);
                    depths.reach(target, jump_depth).map_err(|msg| self.internal_error(msg))?;
                }
                depth += inst.opcode.stack_effect(inst.arg, false);
                if depth < 0 {
                    return Err(self.internal_error("value stack underflow in generated code"));
                }
                if depth > LIMIT {
                    return Err(self.internal_error("value stack depth does not converge"));
                }
                max_depth = max_depth.max(depth);
                if !inst.opcode.falls_through() {
                    falls_off_end = false;
                    break;
                }
            }
            if falls_off_end && let Some(next) = block.next {
                depths.reach(next, depth).map_err(|msg| self.internal_error(msg))?;
            }
        }
        Ok(max_depth as u32)
    }

    fn encode(&self, order: &[BlockId]) -> Vec<u8> {
        let mut out = Vec::new();
        for inst in order.iter().flat_map(|id| &self.blocks[id.0].instructions) {
            if inst.extended {
                out.push(Opcode::ExtendedArg as u8);
                out.extend_from_slice(&((inst.arg >> 16) as u16).to_le_bytes());
            }
            out.push(inst.opcode as u8);
            if inst.opcode.has_arg() {
                out.extend_from_slice(&((inst.arg & 0xffff) as u16).to_le_bytes());
            }
        }
        out
    }

    /// Builds the (offset delta, line delta) table.
    ///
    /// Each component is clamped to 255 with continuation entries. Both deltas are
    /// unsigned, so an instruction whose line is lower than the last entry's reports
    /// that entry's line.
    fn line_table(&self, order: &[BlockId]) -> Vec<u8> {
        let mut table = Vec::new();
        let mut last_offset = 0usize;
        let mut last_line = self.first_line;
        let mut offset = 0usize;
        for inst in order.iter().flat_map(|id| &self.blocks[id.0].instructions) {
            if let Some(line) = inst.line
                && line > last_line
            {
                let mut addr_delta = offset - last_offset;
                let mut line_delta = line - last_line;
                while addr_delta > 255 {
                    table.extend_from_slice(&[255, 0]);
                    addr_delta -= 255;
                }
                while line_delta > 255 {
                    table.extend_from_slice(&[addr_delta as u8, 255]);
                    addr_delta = 0;
                    line_delta -= 255;
                }
                table.extend_from_slice(&[addr_delta as u8, line_delta as u8]);
                last_offset = offset;
                last_line = line;
            }
            offset += inst.size();
        }
        table
    }
}

/// Worklist state of the stack-depth pass.
struct EntryDepths {
    entry: Vec<Option<i32>>,
    handler_entry: Vec<bool>,
    worklist: Vec<BlockId>,
}

impl EntryDepths {
    /// Records that `target` is entered at `depth`, queueing it when that changes its
    /// entry depth.
    fn reach(&mut self, target: BlockId, depth: i32) -> Result<(), &'static str> {
        match self.entry[target.0] {
            None => {}
            Some(seen) if seen == depth => return Ok(()),
            Some(seen) if self.handler_entry[target.0] => {
                if depth < seen {
                    return Ok(());
                }
            }
            Some(_) => return Err("paths into a block disagree on the value stack depth"),
        }
        self.entry[target.0] = Some(depth);
        self.worklist.push(target);
        Ok(())
    }
}

fn intern(set: &mut IndexSet<String>, name: &str) -> u32 {
    if let Some(index) = set.get_index_of(name) {
        return index as u32;
    }
    set.insert_full(name.to_owned()).0 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CodeBuilder {
        CodeBuilder::new("<test>", Arc::from("<test>"), 1)
    }

    #[test]
    fn const_pool_deduplicates_by_type() {
        let mut b = builder();
        let one = b.const_index(Const::Int(1));
        assert_eq!(b.const_index(Const::Int(1)), one);
        assert_ne!(b.const_index(Const::Float(1.0)), one);
        assert_ne!(b.const_index(Const::Bool(true)), one);
        assert_ne!(b.const_index(Const::Float(-0.0)), b.const_index(Const::Float(0.0)));
        assert_eq!(b.const_index(Const::Str(Arc::from("a"))), b.const_index(Const::Str(Arc::from("a"))));
    }

    #[test]
    fn deref_index_spans_cells_then_frees() {
        let mut b = builder();
        b.add_cellvar("a");
        b.add_cellvar("b");
        b.add_freevar("z");
        assert_eq!(b.deref_index("b"), Some(1));
        assert_eq!(b.deref_index("z"), Some(2));
        assert_eq!(b.deref_index("q"), None);
    }

    #[test]
    fn wide_operand_gets_extended_arg() {
        let mut b = builder();
        b.emit_arg(Opcode::LoadConst, 0x0001_0002);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(
            code.bytecode,
            vec![
                Opcode::ExtendedArg as u8,
                1,
                0,
                Opcode::LoadConst as u8,
                2,
                0,
                Opcode::ReturnValue as u8
            ]
        );
    }

    #[test]
    fn forward_jump_widens_when_target_moves_past_u16() {
        let mut b = builder();
        let end = b.new_block();
        b.emit_jump(Opcode::JumpForward, end);
        let body = b.new_block();
        b.use_next_block(body);
        for _ in 0..70_000 {
            b.emit(Opcode::Nop);
        }
        b.use_next_block(end);
        let loop_back = b.new_block();
        b.emit_jump(Opcode::JumpAbsolute, loop_back);
        b.use_next_block(loop_back);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();

        let insts: Vec<_> = code.instructions().map(Result::unwrap).collect();
        assert_eq!(insts[0].opcode, Opcode::JumpForward);
        assert_eq!(insts[0].next_offset, 6);
        assert_eq!(insts[0].arg, Some(70_000));
        let jump = insts.iter().find(|i| i.opcode == Opcode::JumpAbsolute).unwrap();
        assert_eq!(jump.offset, 70_006);
        // target is right after the (extended) absolute jump itself
        assert_eq!(jump.arg, Some(70_012));
        assert_eq!(jump.next_offset, 70_012);
    }

    #[test]
    fn dangling_jump_is_rejected() {
        let mut b = builder();
        let nowhere = b.new_block();
        b.emit_jump(Opcode::JumpAbsolute, nowhere);
        assert!(b.build().is_err());
    }

    #[test]
    fn straight_line_depth() {
        let mut b = builder();
        for i in 0..3 {
            b.emit_arg(Opcode::LoadConst, i);
        }
        b.emit_arg(Opcode::BuildTuple, 3);
        b.emit(Opcode::ReturnValue);
        assert_eq!(b.build().unwrap().stack_size, 3);
    }

    #[test]
    fn handler_entry_counts_pushed_exception() {
        let mut b = builder();
        let handler = b.new_block();
        let end = b.new_block();
        b.emit_jump(Opcode::SetupExcept, handler);
        b.emit(Opcode::PopBlock);
        b.emit_jump(Opcode::JumpForward, end);
        b.use_next_block(handler);
        // [exc] -> DUP_TOP -> [exc, exc] -> LOAD_CONST -> 3
        b.emit(Opcode::DupTop);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit_arg(Opcode::CompareOp, 10);
        b.emit(Opcode::PopTop);
        b.emit(Opcode::PopTop);
        b.emit(Opcode::PopExcept);
        b.use_next_block(end);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::ReturnValue);
        assert_eq!(b.build().unwrap().stack_size, 3);
    }

    #[test]
    fn disagreeing_merge_is_an_error() {
        let mut b = builder();
        let join = b.new_block();
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit_jump(Opcode::PopJumpIfFalse, join);
        // falls into `join` one deeper than the jump does
        b.emit_arg(Opcode::LoadConst, 0);
        b.use_next_block(join);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::ReturnValue);
        let err = b.build().unwrap_err();
        assert_eq!(err.message(), "paths into a block disagree on the value stack depth");
    }

    #[test]
    fn continue_edge_does_not_raise_loop_head_depth() {
        let mut b = builder();
        let end = b.new_block();
        b.emit_jump(Opcode::SetupLoop, end);
        let head = b.next_block();
        // like `with` or a pending iterator: one extra value when `continue` fires
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit_jump(Opcode::ContinueLoop, head);
        b.use_next_block(end);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::ReturnValue);
        assert_eq!(b.build().unwrap().stack_size, 1);
    }

    #[test]
    fn underflow_is_an_error() {
        let mut b = builder();
        b.emit(Opcode::PopTop);
        assert!(b.build().is_err());
    }

    #[test]
    fn unreachable_tail_is_ignored() {
        let mut b = builder();
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::ReturnValue);
        // dead code after return would underflow if simulated
        b.emit(Opcode::PopTop);
        b.emit(Opcode::PopTop);
        assert_eq!(b.build().unwrap().stack_size, 1);
    }

    #[test]
    fn line_numbers_are_tagged_lazily() {
        let mut b = builder();
        b.set_lineno(1);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::PopTop);
        b.set_lineno(2);
        b.emit_arg(Opcode::LoadConst, 0);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.lnotab, vec![4, 1]);
        assert_eq!(code.line_for_offset(3), 1);
        assert_eq!(code.line_for_offset(4), 2);
    }

    #[test]
    fn backward_line_keeps_the_last_entry() {
        let mut b = builder();
        b.set_lineno(3);
        b.emit_arg(Opcode::LoadConst, 0);
        b.set_lineno(2);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.lnotab, vec![0, 2]);
        assert_eq!(code.line_for_offset(3), 3);
    }

    #[test]
    fn large_deltas_use_continuation_entries() {
        let mut b = builder();
        b.set_lineno(1);
        for _ in 0..100 {
            b.emit_arg(Opcode::LoadConst, 0);
        }
        b.set_lineno(3);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.lnotab, vec![255, 0, 45, 2]);
        assert_eq!(code.line_for_offset(300), 3);

        let mut b = builder();
        b.emit_arg(Opcode::LoadConst, 0);
        b.set_lineno(600);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.lnotab, vec![3, 255, 0, 255, 0, 89]);
        assert_eq!(code.line_for_offset(3), 600);
    }
}
