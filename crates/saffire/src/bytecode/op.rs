//! Opcode definitions.
//!
//! The opcode byte encodes its own operand count: bytes below `0x80` take no
//! operand, `0x80..0xC0` take one little-endian u16 and `0xC0` and above take
//! two. `SETUP_EXCEPT` is the single exception and carries three.

use strum::{Display, EnumIter, FromRepr, IntoStaticStr};

/// Maximum nesting of loop and exception blocks within one frame.
pub const MAX_BLOCK_DEPTH: usize = 20;

/// What an operand slot refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Index into the frame's constant table.
    Constant,
    /// Index into the frame's identifier table.
    Identifier,
    /// Jump target; relative to the end of the instruction unless the opcode is absolute.
    Label,
    /// Small immediate count (arguments, elements, attributes).
    Count,
    /// `BinaryOp` code.
    Operator,
    /// `CompareOp` code.
    Compare,
    /// `AttribKind` code.
    AttribKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    // ========================================================================
    // No operand
    // ========================================================================
    Stop = 0x00,
    PopTop = 0x01,
    RotTwo = 0x02,
    RotThree = 0x03,
    DupTop = 0x04,
    RotFour = 0x05,
    Nop = 0x09,
    /// Pops an iterable, pushes an iterator over it.
    IterReset = 0x70,
    /// Peeks the iterator; pushes key, value and a "has item" boolean.
    IterFetch = 0x71,
    PopBlock = 0x72,
    Return = 0x73,
    BreakLoop = 0x74,
    BreakelseLoop = 0x75,
    Throw = 0x76,
    EndFinally = 0x77,
    Import = 0x7F,

    // ========================================================================
    // One operand
    // ========================================================================
    StoreId = 0x80,
    LoadConst = 0x81,
    LoadId = 0x82,
    JumpForward = 0x83,
    JumpIfTrue = 0x84,
    JumpIfFalse = 0x85,
    JumpAbsolute = 0x86,
    DupTopx = 0x87,
    LoadGlobal = 0x88,
    StoreGlobal = 0x89,
    DeleteGlobal = 0x8A,
    JumpIfFirstTrue = 0x8B,
    JumpIfFirstFalse = 0x8C,
    LoadAttrib = 0x8D,
    StoreAttrib = 0x8E,
    Operator = 0x8F,
    SetupLoop = 0x90,
    InplaceOpr = 0x91,
    ContinueLoop = 0x92,
    BuildTuple = 0x93,
    BuildDatastruct = 0x94,
    CompareOp = 0x95,
    Call = 0x97,

    // ========================================================================
    // Two or more operands
    // ========================================================================
    SetupElseLoop = 0xC0,
    BuildAttrib = 0xC1,
    SetupExcept = 0xC2,
    BuildClass = 0xC3,
    BuildInterface = 0xC4,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Self::from_repr(byte).ok_or(byte)
    }
}

impl Opcode {
    /// Operand slots in encoding order.
    #[must_use]
    pub fn operands(self) -> &'static [OperandKind] {
        use OperandKind::{AttribKind, Compare, Constant, Count, Identifier, Label, Operator};
        match self {
            Self::LoadConst | Self::LoadAttrib | Self::StoreAttrib => &[Constant],
            Self::StoreId | Self::LoadId | Self::LoadGlobal | Self::StoreGlobal | Self::DeleteGlobal => &[Identifier],
            Self::JumpForward
            | Self::JumpIfTrue
            | Self::JumpIfFalse
            | Self::JumpAbsolute
            | Self::JumpIfFirstTrue
            | Self::JumpIfFirstFalse
            | Self::SetupLoop
            | Self::ContinueLoop => &[Label],
            Self::SetupElseLoop => &[Label, Label],
            Self::SetupExcept => &[Label, Label, Label],
            Self::DupTopx | Self::BuildTuple | Self::BuildDatastruct | Self::Call => &[Count],
            Self::Operator | Self::InplaceOpr => &[Operator],
            Self::CompareOp => &[Compare],
            Self::BuildAttrib => &[AttribKind, Count],
            Self::BuildClass | Self::BuildInterface => &[Count, Count],
            _ => &[],
        }
    }

    /// Number of u16 operands following the opcode byte.
    #[must_use]
    pub fn operand_count(self) -> usize {
        self.operands().len()
    }

    /// Encoded size of the whole instruction in bytes.
    #[must_use]
    pub fn instruction_len(self) -> usize {
        1 + 2 * self.operand_count()
    }

    /// Label operands of these opcodes hold absolute code offsets; all other
    /// opcodes hold offsets relative to the end of the instruction.
    #[must_use]
    pub fn uses_absolute_target(self) -> bool {
        matches!(self, Self::BuildClass | Self::ContinueLoop | Self::JumpAbsolute)
    }

    /// Returns true if execution never falls through to the next instruction.
    #[must_use]
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Stop
                | Self::Return
                | Self::Throw
                | Self::BreakLoop
                | Self::BreakelseLoop
                | Self::ContinueLoop
                | Self::JumpForward
                | Self::JumpAbsolute
        )
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn test_operand_count_follows_encoding_bits() {
        for op in Opcode::iter() {
            let byte = op as u8;
            let expected = match byte {
                _ if op == Opcode::SetupExcept => 3,
                0xC0.. => 2,
                0x80.. => 1,
                _ => 0,
            };
            assert_eq!(op.operand_count(), expected, "{op} (0x{byte:02X}) has the wrong operand count");
        }
    }

    #[test]
    fn test_try_from_rejects_unknown_bytes() {
        assert_eq!(Opcode::try_from(0x81), Ok(Opcode::LoadConst));
        assert_eq!(Opcode::try_from(0xFF), Err(0xFF));
        assert_eq!(Opcode::try_from(0x96), Err(0x96));
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(Opcode::BreakelseLoop.to_string(), "BREAKELSE_LOOP");
        assert_eq!(Opcode::JumpIfFirstFalse.to_string(), "JUMP_IF_FIRST_FALSE");
        assert_eq!(Opcode::DupTopx.to_string(), "DUP_TOPX");
    }
}
