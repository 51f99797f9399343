//! Bytecode representation, compiler and virtual machine.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum, operand presence, stack effects and comparison kinds
//! - `code` - Code object containing bytecode and metadata
//! - `builder` - CodeBuilder for emitting bytecode during compilation
//! - `compiler` - syntax tree to bytecode compiler
//! - `vm` - frame-based virtual machine executing code objects

mod builder;
mod code;
mod compiler;
mod op;
pub(crate) mod vm;

pub use code::{Code, CodeFlags, Const, DecodeError, Instruction, Instructions};
pub use compiler::{compile, compile_with_scopes};
pub use op::{CompareKind, InvalidOpcodeError, JumpKind, Opcode};
