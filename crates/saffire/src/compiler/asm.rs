//! Symbolic instruction stream produced by lowering.
//!
//! Each frame is an ordered list of [`AsmLine`]s: label markers and code lines
//! whose operands are still symbolic (label names, literal constants, identifier
//! names). The assembler turns them into bytes.

use std::fmt;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{
    ast::{AttribKind, BinaryOp, CompareOp},
    bytecode::{OperandKind, Opcode},
};

/// A typed operand of a code line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// Jump target by label name.
    Label(String),
    /// String constant.
    Str(String),
    /// Numerical constant.
    Num(i64),
    /// Regex constant.
    Regex(String),
    /// Nested frame, by frame name.
    Code(String),
    /// Identifier name.
    Id(String),
    /// Small immediate.
    Imm(u16),
    Compare(CompareOp),
    Operator(BinaryOp),
    Kind(AttribKind),
}

impl Operand {
    /// Returns true if this operand can fill a slot of the given kind.
    #[must_use]
    pub fn fits(&self, kind: OperandKind) -> bool {
        matches!(
            (self, kind),
            (Self::Label(_), OperandKind::Label)
                | (
                    Self::Str(_) | Self::Num(_) | Self::Regex(_) | Self::Code(_),
                    OperandKind::Constant
                )
                | (Self::Id(_), OperandKind::Identifier)
                | (Self::Imm(_), OperandKind::Count)
                | (Self::Compare(_), OperandKind::Compare)
                | (Self::Operator(_), OperandKind::Operator)
                | (Self::Kind(_), OperandKind::AttribKind)
        )
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label(label) => write!(f, "#{label}"),
            Self::Str(s) => write!(f, "\"{}\"", s.escape_debug()),
            Self::Num(n) => write!(f, "{n}"),
            Self::Regex(r) => write!(f, "/{r}/"),
            Self::Code(frame) => write!(f, "@{frame}"),
            Self::Id(name) => write!(f, "{name}"),
            Self::Imm(n) => write!(f, "{n}"),
            Self::Compare(op) => write!(f, "{op}"),
            Self::Operator(op) => write!(f, "{op}"),
            Self::Kind(kind) => write!(f, "{kind}"),
        }
    }
}

/// One line of a frame's instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmLine {
    /// Marks the position of a jump target.
    Label(String),
    Code {
        opcode: Opcode,
        line: u32,
        operands: SmallVec<[Operand; 3]>,
    },
}

impl AsmLine {
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            Self::Label(_) => None,
            Self::Code { opcode, .. } => Some(*opcode),
        }
    }
}

/// The instruction stream of one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsmFrame {
    pub lines: Vec<AsmLine>,
}

impl AsmFrame {
    /// Code lines only, without label markers.
    pub fn code(&self) -> impl Iterator<Item = (Opcode, &[Operand])> {
        self.lines.iter().filter_map(|line| match line {
            AsmLine::Label(_) => None,
            AsmLine::Code { opcode, operands, .. } => Some((*opcode, operands.as_slice())),
        })
    }
}

/// Every frame of a compilation unit, keyed by frame name in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsmProgram {
    pub main: String,
    pub frames: IndexMap<String, AsmFrame>,
}

impl AsmProgram {
    #[must_use]
    pub fn main_frame(&self) -> Option<&AsmFrame> {
        self.frames.get(&self.main)
    }

    #[must_use]
    pub fn frame(&self, name: &str) -> Option<&AsmFrame> {
        self.frames.get(name)
    }
}

/// Textual listing: one block per frame, labels flush left, code indented.
impl fmt::Display for AsmProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, frame)) in self.frames.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            writeln!(f, "@{name}:")?;
            for line in &frame.lines {
                match line {
                    AsmLine::Label(label) => writeln!(f, "#{label}:")?,
                    AsmLine::Code {
                        opcode,
                        line,
                        operands,
                    } => {
                        write!(f, "    {line:>4}  {opcode}")?;
                        for (i, operand) in operands.iter().enumerate() {
                            let sep = if i == 0 { " " } else { ", " };
                            write!(f, "{sep}{operand}")?;
                        }
                        writeln!(f)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use smallvec::smallvec;

    use super::*;

    #[test]
    fn test_listing_format() {
        let mut program = AsmProgram {
            main: "main".to_owned(),
            frames: IndexMap::new(),
        };
        program.frames.insert(
            "main".to_owned(),
            AsmFrame {
                lines: vec![
                    AsmLine::Code {
                        opcode: Opcode::LoadConst,
                        line: 1,
                        operands: smallvec![Operand::Num(4660)],
                    },
                    AsmLine::Label("end".to_owned()),
                    AsmLine::Code {
                        opcode: Opcode::Return,
                        line: 2,
                        operands: smallvec![],
                    },
                ],
            },
        );
        let expected = "@main:\n       1  LOAD_CONST 4660\n#end:\n       2  RETURN\n";
        assert_eq!(program.to_string(), expected);
    }

    #[test]
    fn test_operand_kinds() {
        assert!(Operand::Str("x".to_owned()).fits(OperandKind::Constant));
        assert!(Operand::Code("frame_001".to_owned()).fits(OperandKind::Constant));
        assert!(!Operand::Id("x".to_owned()).fits(OperandKind::Constant));
        assert!(Operand::Imm(2).fits(OperandKind::Count));
        assert!(!Operand::Label("l".to_owned()).fits(OperandKind::Count));
    }
}
