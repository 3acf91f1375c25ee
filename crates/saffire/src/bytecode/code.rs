//! The in-memory bytecode unit and its load-time validation.

use std::{fmt::Write as _, io, sync::Arc};

use smallvec::SmallVec;

use super::{
    lineno::LineTable,
    op::{OperandKind, Opcode},
};
use crate::ast;

/// A typed entry of a frame's constant table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    String(String),
    Number(i64),
    /// Regex source; compiled when the owning codeframe is materialized.
    Regex(String),
    /// A nested frame, e.g. a method body.
    Code(Arc<Bytecode>),
}

impl Constant {
    /// Tag byte used by the binary container.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::String(_) => 0,
            Self::Number(_) => 1,
            Self::Code(_) => 2,
            Self::Regex(_) => 3,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One compiled frame: flat code buffer plus its tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytecode {
    pub(crate) code: Vec<u8>,
    pub(crate) stack_size: u32,
    pub(crate) constants: Vec<Constant>,
    pub(crate) identifiers: Vec<String>,
    pub(crate) lines: LineTable,
    pub(crate) source_file: Option<String>,
}

impl Bytecode {
    #[must_use]
    pub fn new(code: Vec<u8>, stack_size: u32, constants: Vec<Constant>, identifiers: Vec<String>) -> Self {
        Self {
            code,
            stack_size,
            constants,
            identifiers,
            lines: LineTable::default(),
            source_file: None,
        }
    }

    #[must_use]
    pub fn with_lines(mut self, lines: LineTable) -> Self {
        self.lines = lines;
        self
    }

    #[must_use]
    pub fn with_source_file(mut self, source_file: Option<String>) -> Self {
        self.source_file = source_file;
        self
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    #[must_use]
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    #[must_use]
    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    #[must_use]
    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    /// Source line of the instruction at `offset`, if the frame has a line table.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> Option<u32> {
        self.lines.line_for_offset(offset)
    }

    /// Decodes every instruction of the frame in order.
    pub fn instructions(&self) -> Result<Vec<Instruction>, LoadError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            let instr = Instruction::decode(&self.code, offset)?;
            offset = instr.end();
            out.push(instr);
        }
        Ok(out)
    }

    /// Checks the frame (and every nested frame) for structural soundness.
    ///
    /// Rejects unknown opcodes, truncated instructions, constant or identifier
    /// indices outside their tables, attribute names that are not string
    /// constants, and jumps that do not land on an instruction boundary.
    pub fn validate(&self) -> Result<(), LoadError> {
        let instructions = self.instructions()?;
        let boundaries: Vec<usize> = instructions.iter().map(|i| i.offset).collect();

        for instr in &instructions {
            for (slot, kind) in instr.opcode.operands().iter().enumerate() {
                let value = usize::from(instr.operands[slot]);
                match kind {
                    OperandKind::Constant => {
                        let Some(constant) = self.constants.get(value) else {
                            return Err(LoadError::ConstantIndex {
                                offset: instr.offset,
                                index: value,
                                len: self.constants.len(),
                            });
                        };
                        if matches!(instr.opcode, Opcode::LoadAttrib | Opcode::StoreAttrib)
                            && constant.as_str().is_none()
                        {
                            return Err(LoadError::AttributeName { offset: instr.offset });
                        }
                    }
                    OperandKind::Identifier if value >= self.identifiers.len() => {
                        return Err(LoadError::IdentifierIndex {
                            offset: instr.offset,
                            index: value,
                            len: self.identifiers.len(),
                        });
                    }
                    OperandKind::Label => {
                        let target = instr.jump_target(slot);
                        if target != self.code.len() && boundaries.binary_search(&target).is_err() {
                            return Err(LoadError::JumpTarget {
                                offset: instr.offset,
                                target,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        for constant in &self.constants {
            if let Constant::Code(child) = constant {
                child.validate()?;
            }
        }
        Ok(())
    }

    /// Human-readable listing of the frame and its nested frames.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, "main");
        out
    }

    fn disassemble_into(&self, out: &mut String, name: &str) {
        let _ = writeln!(out, "frame {name}: stack_size={}", self.stack_size);
        let mut last_line = None;
        match self.instructions() {
            Ok(instructions) => {
                for instr in instructions {
                    let line = self.line_for_offset(instr.offset);
                    let line_col = if line == last_line {
                        "     ".to_owned()
                    } else {
                        line.map_or_else(|| "     ".to_owned(), |l| format!("{l:>4} "))
                    };
                    last_line = line;
                    let _ = write!(out, "{line_col}{:>5}  {:<20}", instr.offset, instr.opcode.to_string());
                    let rendered: Vec<String> = instr
                        .opcode
                        .operands()
                        .iter()
                        .enumerate()
                        .map(|(slot, kind)| self.render_operand(&instr, slot, *kind))
                        .collect();
                    let _ = writeln!(out, "{}", rendered.join(", ").trim_end());
                }
            }
            Err(err) => {
                let _ = writeln!(out, "  <undecodable: {err}>");
            }
        }
        for (idx, constant) in self.constants.iter().enumerate() {
            if let Constant::Code(child) = constant {
                out.push('\n');
                child.disassemble_into(out, &format!("{name}#{idx}"));
            }
        }
    }

    fn render_operand(&self, instr: &Instruction, slot: usize, kind: OperandKind) -> String {
        let raw = instr.operands[slot];
        match kind {
            OperandKind::Constant => match self.constants.get(usize::from(raw)) {
                Some(Constant::String(s)) => format!("{raw} (\"{s}\")"),
                Some(Constant::Number(n)) => format!("{raw} ({n})"),
                Some(Constant::Regex(r)) => format!("{raw} (/{r}/)"),
                Some(Constant::Code(_)) => format!("{raw} (<code>)"),
                None => format!("{raw} (?)"),
            },
            OperandKind::Identifier => match self.identifiers.get(usize::from(raw)) {
                Some(name) => format!("{raw} ({name})"),
                None => format!("{raw} (?)"),
            },
            OperandKind::Label => format!("-> {}", instr.jump_target(slot)),
            OperandKind::Operator => u8::try_from(raw)
                .ok()
                .and_then(ast::BinaryOp::from_repr)
                .map_or_else(|| raw.to_string(), |op| op.to_string()),
            OperandKind::Compare => u8::try_from(raw)
                .ok()
                .and_then(ast::CompareOp::from_repr)
                .map_or_else(|| raw.to_string(), |op| op.to_string()),
            OperandKind::AttribKind => u8::try_from(raw)
                .ok()
                .and_then(ast::AttribKind::from_repr)
                .map_or_else(|| raw.to_string(), |kind| kind.to_string()),
            OperandKind::Count => raw.to_string(),
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: Opcode,
    pub operands: SmallVec<[u16; 3]>,
}

impl Instruction {
    /// Decodes the instruction starting at `offset`.
    pub fn decode(code: &[u8], offset: usize) -> Result<Self, LoadError> {
        let byte = *code.get(offset).ok_or(LoadError::TruncatedInstruction { offset })?;
        let opcode = Opcode::try_from(byte).map_err(|byte| LoadError::UnknownOpcode { offset, byte })?;
        let end = offset + opcode.instruction_len();
        if end > code.len() {
            return Err(LoadError::TruncatedInstruction { offset });
        }
        let operands = code[offset + 1..end]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self {
            offset,
            opcode,
            operands,
        })
    }

    /// Offset of the next instruction.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.opcode.instruction_len()
    }

    /// Resolves the label operand in `slot` to an absolute code offset.
    #[must_use]
    pub fn jump_target(&self, slot: usize) -> usize {
        resolve_target(self.opcode, self.end(), self.operands[slot])
    }
}

/// Resolves a raw label operand of `opcode`, whose instruction ends at `end`.
///
/// Absolute opcodes store the offset itself; every other opcode stores a
/// signed 16-bit displacement from `end`.
#[must_use]
pub fn resolve_target(opcode: Opcode, end: usize, raw: u16) -> usize {
    if opcode.uses_absolute_target() {
        usize::from(raw)
    } else {
        end.saturating_add_signed(isize::from(raw.cast_signed()))
    }
}

/// Errors raised while deserializing or validating bytecode.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("bad magic number 0x{0:08X}")]
    BadMagic(u32),
    #[error("unsupported bytecode version {0}")]
    Version(u32),
    #[error("bytecode stream is truncated")]
    Truncated,
    #[error("checksum mismatch: header says 0x{expected:08X}, body is 0x{actual:08X}")]
    Crc { expected: u32, actual: u32 },
    #[error("declared body size {declared} does not match actual size {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("cannot decompress body: {0}")]
    Decompress(#[source] io::Error),
    #[error("signature does not verify")]
    BadSignature,
    #[error("a verification key was supplied but the file is not signed")]
    Unsigned,
    #[error("nested code constants exceed the maximum depth")]
    TooDeep,
    #[error("unknown constant tag {0}")]
    UnknownConstant(u8),
    #[error("string is not valid UTF-8")]
    Utf8,
    #[error("constant index {index} out of range (table has {len}) at offset {offset}")]
    ConstantIndex { offset: usize, index: usize, len: usize },
    #[error("identifier index {index} out of range (table has {len}) at offset {offset}")]
    IdentifierIndex { offset: usize, index: usize, len: usize },
    #[error("attribute name at offset {offset} is not a string constant")]
    AttributeName { offset: usize },
    #[error("unknown opcode 0x{byte:02X} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },
    #[error("instruction at offset {offset} runs past the end of the code")]
    TruncatedInstruction { offset: usize },
    #[error("jump at offset {offset} targets {target}, which is not an instruction boundary")]
    JumpTarget { offset: usize, target: usize },
    #[error("invalid regex /{pattern}/: {message}")]
    Regex { pattern: String, message: String },
}
