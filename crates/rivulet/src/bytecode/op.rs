//! Opcode definitions for the bytecode VM.
//!
//! Bytecode is stored as raw `Vec<u8>`. The `Opcode` enum is a pure discriminant with no
//! data - operands are fetched separately from the byte stream.
//!
//! # Operand Encoding
//!
//! - Opcodes below [`HAVE_ARGUMENT`] take no operand: 1 byte.
//! - Opcodes at or above it take a little-endian u16 operand: 3 bytes.
//! - Operands wider than 16 bits are prefixed by `ExtendedArg` carrying the high 16 bits:
//!   6 bytes in total. The dispatcher shifts the accumulated operand left by 16 for each
//!   `ExtendedArg` it meets.
//!
//! The static stack effect of every opcode lives here too, next to the encoding, so that
//! the builder's depth computation and the dispatcher stay in lockstep.

use strum::{Display, FromRepr};

/// Opcode discriminant - just identifies the instruction type.
///
/// With `#[repr(u8)]`, each opcode is exactly 1 byte. Uses `strum::FromRepr` for
/// byte-to-opcode conversion.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // === Stack Operations ===
    /// Discard top of stack.
    PopTop,
    /// Swap top two: [a, b] -> [b, a].
    RotTwo,
    /// Rotate top three: [a, b, c] -> [c, a, b].
    RotThree,
    /// Duplicate top of stack.
    DupTop,
    /// Duplicate top two: [a, b] -> [a, b, a, b].
    DupTopTwo,
    Nop,

    // === Unary Operations ===
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,

    // === Binary Operations: [left, right] -> [result] ===
    BinaryPower,
    BinaryMultiply,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    /// [container, index] -> [item].
    BinarySubscr,
    BinaryFloorDivide,
    BinaryTrueDivide,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,

    // === In-place Operations (augmented assignment) ===
    InplacePower,
    InplaceMultiply,
    InplaceModulo,
    InplaceAdd,
    InplaceSubtract,
    InplaceFloorDivide,
    InplaceTrueDivide,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,

    // === Containers ===
    /// [value, container, index] -> [].
    StoreSubscr,
    /// [container, index] -> [].
    DeleteSubscr,
    /// [dict, key, value] -> [dict].
    StoreMap,

    // === Iteration & Classes ===
    /// Replace TOS with `iter(TOS)`.
    GetIter,
    /// Push the class-building builtin.
    LoadBuildClass,
    /// Push the frame's locals dictionary (class bodies return it).
    LoadLocals,

    // === Block Stack & Control ===
    /// Unwind with `Break`.
    BreakLoop,
    /// Calls the context manager's `__exit__` for the pending unwinder at TOS.
    ///
    /// [exit, why] -> [why'] where `why'` is `None` when an exception was suppressed.
    WithCleanup,
    /// Unwind with `Return(TOS)`.
    ReturnValue,
    /// Suspend the frame, handing TOS to the resumer; the sent value replaces it.
    YieldValue,
    /// Pop the innermost block on normal exit from its region.
    PopBlock,
    /// Pop TOS: `None` falls through, a parked unwinder is re-driven, an exception is re-raised.
    EndFinally,
    /// Leave an except handler, restoring the previously handled exception.
    PopExcept,

    // === Names (operand: index into names) ===
    StoreName,
    DeleteName,
    /// Unpack TOS into N values, first item on top. Operand: N.
    UnpackSequence,
    /// Advance the iterator at TOS; on exhaustion pop it and jump. Operand: relative target.
    ForIter,
    /// [value, object] -> []. Operand: name index.
    StoreAttr,
    DeleteAttr,
    StoreGlobal,
    DeleteGlobal,
    /// Push constant from pool. Operand: const index.
    LoadConst,
    LoadName,

    // === Builders (operand: element count) ===
    BuildTuple,
    BuildList,
    BuildSet,
    /// Push an empty dict. Operand: size hint.
    BuildMap,
    LoadAttr,
    /// Operand: a [`CompareKind`] discriminant.
    CompareOp,

    // === Jumps ===
    /// Operand: relative target.
    JumpForward,
    /// If TOS is falsy jump keeping it, else pop. Operand: absolute target.
    JumpIfFalseOrPop,
    /// If TOS is truthy jump keeping it, else pop. Operand: absolute target.
    JumpIfTrueOrPop,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    LoadGlobal,
    /// Unwind with `Continue` to an absolute loop start.
    ContinueLoop,
    /// Push a loop block; operand is the relative loop exit.
    SetupLoop,
    /// Push an except block; operand is the relative handler.
    SetupExcept,
    /// Push a finally block; operand is the relative handler.
    SetupFinally,

    // === Fast Locals (operand: varnames index) ===
    LoadFast,
    StoreFast,
    DeleteFast,

    // === Calls & Functions ===
    /// Operand: number of values (0 re-raises the handled exception, 1 raises TOS).
    RaiseVarargs,
    /// Operand: `npos | nkw << 8`. Keyword arguments are (name, value) pairs above the positionals.
    CallFunction,
    /// Operand: `ndefaults | nkwdefaults << 8`. Pops qualified name and code.
    MakeFunction,
    /// Like `MakeFunction` with a tuple of cells below the code object.
    MakeClosure,

    // === Cells (operand: cellvars index, then freevars) ===
    /// Push the cell object itself.
    LoadClosure,
    LoadDeref,
    StoreDeref,
    DeleteDeref,
    /// Class-body read of a free variable: locals dict first, then the cell.
    LoadClassDeref,
    /// Enter a context manager; operand is the relative cleanup handler.
    SetupWith,

    // === Comprehensions (operand: stack distance to the container) ===
    ListAppend,
    SetAdd,
    MapAdd,

    /// Carries the high 16 bits of the following instruction's operand.
    ExtendedArg,
}

/// First opcode that takes an operand.
pub const HAVE_ARGUMENT: u8 = Opcode::StoreName as u8;

/// How a jump instruction encodes its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// Offset from the end of the instruction.
    Relative,
    /// Byte offset from the start of the code.
    Absolute,
}

impl Opcode {
    /// Whether the opcode is followed by a 2-byte operand.
    #[inline]
    #[must_use]
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    /// Target encoding for instructions whose operand is a code position.
    #[must_use]
    pub fn jump_kind(self) -> Option<JumpKind> {
        match self {
            Self::JumpForward
            | Self::ForIter
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally
            | Self::SetupWith => Some(JumpKind::Relative),
            Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::JumpAbsolute
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::ContinueLoop => Some(JumpKind::Absolute),
            _ => None,
        }
    }

    /// Whether execution can continue with the next instruction in sequence.
    #[must_use]
    pub fn falls_through(self) -> bool {
        !matches!(
            self,
            Self::JumpForward
                | Self::JumpAbsolute
                | Self::ContinueLoop
                | Self::ReturnValue
                | Self::RaiseVarargs
                | Self::BreakLoop
        )
    }

    /// Net change to the value stack.
    ///
    /// `jump` selects the effect along the jump edge (for opcodes that have one); the
    /// setup opcodes report what the handler finds on entry: the block's depth plus the
    /// one value the engine pushes when it routes an unwind there.
    #[must_use]
    pub fn stack_effect(self, arg: u32, jump: bool) -> i32 {
        let arg = arg as i32;
        match self {
            Self::PopTop => -1,
            Self::RotTwo | Self::RotThree | Self::Nop => 0,
            Self::DupTop => 1,
            Self::DupTopTwo => 2,

            Self::UnaryPositive | Self::UnaryNegative | Self::UnaryNot | Self::UnaryInvert => 0,

            Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinarySubscr
            | Self::BinaryFloorDivide
            | Self::BinaryTrueDivide
            | Self::BinaryLshift
            | Self::BinaryRshift
            | Self::BinaryAnd
            | Self::BinaryXor
            | Self::BinaryOr
            | Self::InplacePower
            | Self::InplaceMultiply
            | Self::InplaceModulo
            | Self::InplaceAdd
            | Self::InplaceSubtract
            | Self::InplaceFloorDivide
            | Self::InplaceTrueDivide
            | Self::InplaceLshift
            | Self::InplaceRshift
            | Self::InplaceAnd
            | Self::InplaceXor
            | Self::InplaceOr => -1,

            Self::StoreSubscr => -3,
            Self::DeleteSubscr | Self::StoreMap => -2,

            Self::GetIter => 0,
            Self::LoadBuildClass | Self::LoadLocals => 1,

            Self::BreakLoop | Self::PopBlock | Self::PopExcept | Self::YieldValue => 0,
            Self::WithCleanup | Self::ReturnValue | Self::EndFinally => -1,

            Self::StoreName | Self::StoreGlobal | Self::StoreFast | Self::StoreDeref => -1,
            Self::DeleteName | Self::DeleteGlobal | Self::DeleteFast | Self::DeleteDeref => 0,
            Self::UnpackSequence => arg - 1,
            Self::ForIter => {
                if jump {
                    -1
                } else {
                    1
                }
            }
            Self::StoreAttr => -2,
            Self::DeleteAttr => -1,
            Self::LoadConst
            | Self::LoadName
            | Self::LoadGlobal
            | Self::LoadFast
            | Self::LoadClosure
            | Self::LoadDeref
            | Self::LoadClassDeref => 1,
            Self::BuildTuple | Self::BuildList | Self::BuildSet => 1 - arg,
            Self::BuildMap => 1,
            Self::LoadAttr => 0,
            Self::CompareOp => -1,

            Self::JumpForward | Self::JumpAbsolute | Self::ContinueLoop | Self::SetupLoop => 0,
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => {
                if jump {
                    0
                } else {
                    -1
                }
            }
            Self::PopJumpIfFalse | Self::PopJumpIfTrue => -1,
            Self::SetupExcept | Self::SetupFinally => {
                if jump {
                    1
                } else {
                    0
                }
            }
            // [mgr] -> [exit, enter_result]; the handler sees [exit, why].
            Self::SetupWith => 1,

            Self::RaiseVarargs => -arg,
            Self::CallFunction => -((arg & 0xff) + 2 * ((arg >> 8) & 0xff)),
            Self::MakeFunction => -1 - ((arg & 0xff) + 2 * ((arg >> 8) & 0xff)),
            Self::MakeClosure => -2 - ((arg & 0xff) + 2 * ((arg >> 8) & 0xff)),

            Self::ListAppend | Self::SetAdd => -1,
            Self::MapAdd => -2,

            Self::ExtendedArg => 0,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = InvalidOpcodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(InvalidOpcodeError(byte))
    }
}

/// Error returned when attempting to convert an invalid byte to an Opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid opcode byte: {0}")]
pub struct InvalidOpcodeError(pub u8);

/// Operand of `CompareOp`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, Display)]
pub enum CompareKind {
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "not in")]
    NotIn,
    #[strum(serialize = "is")]
    Is,
    #[strum(serialize = "is not")]
    IsNot,
    /// `except T:` matching: TOS1 is the exception, TOS the type (or tuple of types).
    #[strum(serialize = "exception match")]
    ExcMatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=Opcode::ExtendedArg as u8 {
            let opcode = Opcode::try_from(byte).unwrap();
            assert_eq!(opcode as u8, byte, "opcode {opcode:?} has wrong discriminant");
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(Opcode::try_from(Opcode::ExtendedArg as u8 + 1).is_err());
        assert_eq!(Opcode::try_from(255u8), Err(InvalidOpcodeError(255)));
    }

    #[test]
    fn test_opcode_size() {
        assert_eq!(std::mem::size_of::<Opcode>(), 1);
    }

    #[test]
    fn operand_boundary() {
        assert!(!Opcode::PopExcept.has_arg());
        assert!(Opcode::StoreName.has_arg());
        assert!(Opcode::ExtendedArg.has_arg());
    }

    #[test]
    fn every_jump_is_classified() {
        let relative = [Opcode::JumpForward, Opcode::ForIter, Opcode::SetupExcept];
        assert!(relative.iter().all(|op| op.jump_kind() == Some(JumpKind::Relative)));
        assert_eq!(Opcode::PopJumpIfFalse.jump_kind(), Some(JumpKind::Absolute));
        assert_eq!(Opcode::LoadFast.jump_kind(), None);
    }

    #[test]
    fn argument_dependent_effects() {
        assert_eq!(Opcode::UnpackSequence.stack_effect(3, false), 2);
        assert_eq!(Opcode::BuildTuple.stack_effect(0, false), 1);
        // f(a, b, k=v): callable + 2 positional + one keyword pair -> result
        assert_eq!(Opcode::CallFunction.stack_effect(2 | (1 << 8), false), -4);
        assert_eq!(Opcode::ForIter.stack_effect(0, true), -1);
        assert_eq!(Opcode::SetupFinally.stack_effect(0, true), 1);
    }

    #[test]
    fn display_is_screaming_snake_case() {
        assert_eq!(Opcode::LoadName.to_string(), "LOAD_NAME");
        assert_eq!(Opcode::PopJumpIfFalse.to_string(), "POP_JUMP_IF_FALSE");
        assert_eq!(CompareKind::NotIn.to_string(), "not in");
    }
}
