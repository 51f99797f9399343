//! The frozen code object produced by the compiler and executed by the VM.

use std::{
    fmt::{self, Write},
    ops::BitOr,
    sync::Arc,
};

use super::op::{CompareKind, JumpKind, Opcode};
use crate::heap::{HeapId, Trace};

/// Code object flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// Locals live in fast slots rather than a dictionary.
    pub const OPTIMIZED: Self = Self(0x1);
    /// A fresh locals namespace is created for each activation.
    pub const NEWLOCALS: Self = Self(0x2);
    pub const VARARGS: Self = Self(0x4);
    pub const VARKEYWORDS: Self = Self(0x8);
    /// Defined inside another function.
    pub const NESTED: Self = Self(0x10);
    pub const GENERATOR: Self = Self(0x20);
    /// No cell or free variables.
    pub const NOFREE: Self = Self(0x40);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A compile-time constant.
///
/// Constants never reference the runtime heap: strings are shared immutable buffers and
/// nested code objects are shared by `Arc`, so a finished `Code` can be handed to any
/// number of threads.
#[derive(Debug, Clone)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Ellipsis,
    Code(Arc<Code>),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Ellipsis => f.write_str("Ellipsis"),
            Self::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

/// Compiled bytecode and everything needed to execute it.
///
/// Immutable once built. A single `Code` is shared by every frame executing it:
/// recursive calls, repeated calls and multiple generator instances.
#[derive(Debug)]
pub struct Code {
    pub(crate) name: String,
    pub(crate) argcount: u32,
    pub(crate) kwonlyargcount: u32,
    pub(crate) flags: CodeFlags,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) consts: Vec<Const>,
    pub(crate) names: Vec<String>,
    /// Fast-local names; parameters come first.
    pub(crate) varnames: Vec<String>,
    pub(crate) freevars: Vec<String>,
    pub(crate) cellvars: Vec<String>,
    pub(crate) filename: Arc<str>,
    pub(crate) first_line: u32,
    /// (byte offset delta, line delta) pairs.
    pub(crate) lnotab: Vec<u8>,
    pub(crate) stack_size: u32,
}

impl Code {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn argcount(&self) -> u32 {
        self.argcount
    }

    #[must_use]
    pub fn kwonlyargcount(&self) -> u32 {
        self.kwonlyargcount
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.flags
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn consts(&self) -> &[Const] {
        &self.consts
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn varnames(&self) -> &[String] {
        &self.varnames
    }

    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.freevars
    }

    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.cellvars
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    #[must_use]
    pub fn lnotab(&self) -> &[u8] {
        &self.lnotab
    }

    #[must_use]
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    #[must_use]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    /// Name of the variable addressed by a deref operand: cellvars first, then freevars.
    #[must_use]
    pub fn deref_name(&self, index: usize) -> Option<&str> {
        match index.checked_sub(self.cellvars.len()) {
            None => self.cellvars.get(index).map(String::as_str),
            Some(free) => self.freevars.get(free).map(String::as_str),
        }
    }

    /// Source line of the instruction at `offset`, decoded from the line table.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut line = self.first_line;
        let mut addr = 0usize;
        for pair in self.lnotab.chunks_exact(2) {
            addr += usize::from(pair[0]);
            if addr > offset {
                break;
            }
            line += u32::from(pair[1]);
        }
        line
    }

    /// Decodes the bytecode into `(offset, opcode, operand)` triples.
    ///
    /// `ExtendedArg` prefixes are folded into the operand of the instruction they
    /// precede; the reported offset is that of the first prefix.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { code: self, pos: 0 }
    }

    /// Renders a human-readable listing, one instruction per line:
    /// `line  offset OPNAME  arg (resolved)`.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut last_line = None;
        for inst in self.instructions() {
            let Ok(inst) = inst else {
                let _ = writeln!(out, "<invalid bytecode>");
                break;
            };
            let line = self.line_for_offset(inst.offset);
            if last_line == Some(line) {
                out.push_str("     ");
            } else {
                let _ = write!(out, "{line:>4} ");
                last_line = Some(line);
            }
            let _ = write!(out, "{:>5} {}", inst.offset, inst.opcode);
            if let Some(arg) = inst.arg {
                let _ = write!(out, " {arg}");
                if let Some(detail) = self.describe_arg(inst) {
                    let _ = write!(out, " ({detail})");
                }
            }
            out.push('\n');
        }
        out
    }

    fn describe_arg(&self, inst: Instruction) -> Option<String> {
        let arg = inst.arg? as usize;
        match inst.opcode {
            Opcode::LoadConst => self.consts.get(arg).map(ToString::to_string),
            Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::DeleteGlobal
            | Opcode::LoadAttr
            | Opcode::StoreAttr
            | Opcode::DeleteAttr => self.names.get(arg).cloned(),
            Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => self.varnames.get(arg).cloned(),
            Opcode::LoadClosure
            | Opcode::LoadDeref
            | Opcode::StoreDeref
            | Opcode::DeleteDeref
            | Opcode::LoadClassDeref => self.deref_name(arg).map(str::to_owned),
            Opcode::CompareOp => CompareKind::from_repr(arg as u8).map(|k| k.to_string()),
            op => match op.jump_kind()? {
                JumpKind::Absolute => Some(format!("to {arg}")),
                JumpKind::Relative => Some(format!("to {}", inst.next_offset + arg)),
            },
        }
    }
}

impl Trace for Code {
    /// Constants are plain data; a code object owns no heap references.
    fn mark_children(&self, _work_list: &mut Vec<HeapId>) {}
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: Option<u32>,
    /// Offset just past the instruction, the base for relative jumps.
    pub next_offset: usize,
}

/// Iterator over decoded instructions, see [`Code::instructions`].
pub struct Instructions<'a> {
    code: &'a Code,
    pos: usize,
}

impl Iterator for Instructions<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = &self.code.bytecode;
        if self.pos >= bytes.len() {
            return None;
        }
        let offset = self.pos;
        let mut ext: u32 = 0;
        loop {
            let Some(&byte) = bytes.get(self.pos) else {
                self.pos = bytes.len();
                return Some(Err(DecodeError::Truncated(offset)));
            };
            let opcode = match Opcode::try_from(byte) {
                Ok(op) => op,
                Err(_) => {
                    self.pos = bytes.len();
                    return Some(Err(DecodeError::InvalidOpcode { offset, byte }));
                }
            };
            self.pos += 1;
            if !opcode.has_arg() {
                return Some(Ok(Instruction {
                    offset,
                    opcode,
                    arg: None,
                    next_offset: self.pos,
                }));
            }
            let (Some(&lo), Some(&hi)) = (bytes.get(self.pos), bytes.get(self.pos + 1)) else {
                self.pos = bytes.len();
                return Some(Err(DecodeError::Truncated(offset)));
            };
            self.pos += 2;
            let arg = (ext << 16) | u32::from(u16::from_le_bytes([lo, hi]));
            if opcode == Opcode::ExtendedArg {
                ext = arg;
                continue;
            }
            return Some(Ok(Instruction {
                offset,
                opcode,
                arg: Some(arg),
                next_offset: self.pos,
            }));
        }
    }
}

/// Malformed bytecode found while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode byte {byte} at offset {offset}")]
    InvalidOpcode { offset: usize, byte: u8 },
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_with(bytecode: Vec<u8>, lnotab: Vec<u8>) -> Code {
        Code {
            name: "<test>".to_owned(),
            argcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::empty(),
            bytecode,
            consts: vec![Const::None],
            names: vec!["x".to_owned()],
            varnames: Vec::new(),
            freevars: vec!["f".to_owned()],
            cellvars: vec!["c".to_owned()],
            filename: Arc::from("<test>"),
            first_line: 10,
            lnotab,
            stack_size: 1,
        }
    }

    #[test]
    fn decodes_extended_arg() {
        let code = code_with(
            vec![
                Opcode::ExtendedArg as u8,
                0x01,
                0x00,
                Opcode::LoadConst as u8,
                0x02,
                0x00,
                Opcode::ReturnValue as u8,
            ],
            vec![],
        );
        let insts: Vec<_> = code.instructions().map(Result::unwrap).collect();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].opcode, Opcode::LoadConst);
        assert_eq!(insts[0].arg, Some(0x0001_0002));
        assert_eq!(insts[0].offset, 0);
        assert_eq!(insts[0].next_offset, 6);
        assert_eq!(insts[1].offset, 6);
    }

    #[test]
    fn reports_truncation() {
        let code = code_with(vec![Opcode::LoadConst as u8, 0x00], vec![]);
        assert_eq!(code.instructions().next(), Some(Err(DecodeError::Truncated(0))));
    }

    #[test]
    fn line_lookup() {
        // offset 0 -> line 10, offset 4 -> line 11, offset 10 -> line 14
        let code = code_with(vec![Opcode::Nop as u8; 12], vec![4, 1, 6, 3]);
        assert_eq!(code.line_for_offset(0), 10);
        assert_eq!(code.line_for_offset(3), 10);
        assert_eq!(code.line_for_offset(4), 11);
        assert_eq!(code.line_for_offset(9), 11);
        assert_eq!(code.line_for_offset(11), 14);
    }

    #[test]
    fn deref_names_cover_cells_then_frees() {
        let code = code_with(vec![], vec![]);
        assert_eq!(code.deref_name(0), Some("c"));
        assert_eq!(code.deref_name(1), Some("f"));
        assert_eq!(code.deref_name(2), None);
    }

    #[test]
    fn flags() {
        let flags = CodeFlags::OPTIMIZED | CodeFlags::GENERATOR;
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(!flags.contains(CodeFlags::VARARGS));
        assert_eq!(flags.bits(), 0x21);
    }
}
