//! Assembler: symbolic frames to flat bytecode.
//!
//! Each frame is laid out in a single pass. Operands are interned into the
//! frame's constant and identifier tables (first occurrence wins, so repeated
//! literals share one index). Jumps to labels that are not yet placed are
//! written as `0xFFFF` and recorded as backpatches, which are resolved once the
//! whole frame is laid out. Nested frames referenced as code constants are
//! assembled recursively and embedded as child units.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use super::{
    code::{Bytecode, Constant, resolve_target},
    lineno::LineTableBuilder,
    op::Opcode,
    stack::{StackError, max_stack_depth},
};
use crate::compiler::{AsmFrame, AsmLine, AsmProgram, Operand};

const FILLER: u16 = 0xFFFF;

/// Errors raised while turning symbolic frames into bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssembleError {
    #[error("frame '{frame}' defines label '{label}' twice")]
    DuplicateLabel { frame: String, label: String },
    #[error("frame '{frame}' jumps to undefined label '{label}'")]
    UndefinedLabel { frame: String, label: String },
    #[error("jump to '{label}' in frame '{frame}' does not fit in 16 bits")]
    JumpRange { frame: String, label: String },
    #[error("{opcode} on line {line} of frame '{frame}' has the wrong operands")]
    Operands { frame: String, opcode: Opcode, line: u32 },
    #[error("frame '{0}' does not exist")]
    UnknownFrame(String),
    #[error("frame '{0}' contains itself")]
    RecursiveFrame(String),
    #[error("frame '{frame}' has too many {what}")]
    TooLarge { frame: String, what: &'static str },
    #[error("frame '{frame}': {source}")]
    Stack {
        frame: String,
        #[source]
        source: StackError,
    },
}

/// Settings for the assembler.
#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    /// Record a line table for each frame.
    pub emit_lines: bool,
    /// Source file name stored in every frame.
    pub source_file: Option<String>,
}

/// Assembles `program`, returning the main frame with every nested frame embedded.
pub fn assemble(program: &AsmProgram, options: &AssembleOptions) -> Result<Bytecode, AssembleError> {
    let mut assembler = Assembler {
        program,
        options,
        done: AHashMap::new(),
        visiting: AHashSet::new(),
    };
    let main = assembler.frame(&program.main)?;
    Ok(Arc::unwrap_or_clone(main))
}

struct Assembler<'p> {
    program: &'p AsmProgram,
    options: &'p AssembleOptions,
    done: AHashMap<&'p str, Arc<Bytecode>>,
    visiting: AHashSet<&'p str>,
}

impl<'p> Assembler<'p> {
    fn frame(&mut self, name: &str) -> Result<Arc<Bytecode>, AssembleError> {
        let program = self.program;
        let (name, frame) = program
            .frames
            .get_key_value(name)
            .ok_or_else(|| AssembleError::UnknownFrame(name.to_owned()))?;
        let name = name.as_str();
        if let Some(done) = self.done.get(name) {
            return Ok(Arc::clone(done));
        }
        if !self.visiting.insert(name) {
            return Err(AssembleError::RecursiveFrame(name.to_owned()));
        }
        let bytecode = Arc::new(self.lay_out(name, frame)?);
        self.visiting.remove(name);
        self.done.insert(name, Arc::clone(&bytecode));
        Ok(bytecode)
    }

    fn lay_out(&mut self, name: &'p str, frame: &'p AsmFrame) -> Result<Bytecode, AssembleError> {
        let mut out = FrameAssembler::new(name);
        for line in &frame.lines {
            match line {
                AsmLine::Label(label) => out.place_label(label)?,
                AsmLine::Code {
                    opcode,
                    line,
                    operands,
                } => {
                    if self.options.emit_lines {
                        out.lines.record(out.code.len(), *line);
                    }
                    out.emit(self, *opcode, *line, operands)?;
                }
            }
        }
        out.patch()?;

        let stack_size = max_stack_depth(&out.code).map_err(|source| AssembleError::Stack {
            frame: name.to_owned(),
            source,
        })?;
        tracing::debug!(
            frame = name,
            code = out.code.len(),
            constants = out.constants.len(),
            identifiers = out.identifiers.len(),
            stack_size,
            "assembled frame"
        );
        Ok(Bytecode::new(out.code, stack_size, out.constants, out.identifiers)
            .with_lines(out.lines.finish())
            .with_source_file(self.options.source_file.clone()))
    }
}

/// Deduplication key of a constant-table entry.
#[derive(Debug, PartialEq, Eq)]
enum ConstKey<'a> {
    Str(&'a str),
    Num(i64),
    Regex(&'a str),
    Code(&'a str),
}

/// A jump operand waiting for its label.
#[derive(Debug)]
struct Backpatch<'a> {
    opcode_offset: usize,
    operand_offset: usize,
    label: &'a str,
}

/// Layout state of one frame.
struct FrameAssembler<'a> {
    name: &'a str,
    code: Vec<u8>,
    constants: Vec<Constant>,
    const_keys: Vec<ConstKey<'a>>,
    identifiers: Vec<String>,
    labels: AHashMap<&'a str, usize>,
    backpatches: Vec<Backpatch<'a>>,
    lines: LineTableBuilder,
}

impl<'a> FrameAssembler<'a> {
    fn new(name: &'a str) -> Self {
        Self {
            name,
            code: Vec::new(),
            constants: Vec::new(),
            const_keys: Vec::new(),
            identifiers: Vec::new(),
            labels: AHashMap::new(),
            backpatches: Vec::new(),
            lines: LineTableBuilder::default(),
        }
    }

    fn place_label(&mut self, label: &'a str) -> Result<(), AssembleError> {
        if self.labels.insert(label, self.code.len()).is_some() {
            return Err(AssembleError::DuplicateLabel {
                frame: self.name.to_owned(),
                label: label.to_owned(),
            });
        }
        Ok(())
    }

    fn emit(
        &mut self,
        assembler: &mut Assembler<'a>,
        opcode: Opcode,
        line: u32,
        operands: &'a [Operand],
    ) -> Result<(), AssembleError> {
        let kinds = opcode.operands();
        if kinds.len() != operands.len() || !operands.iter().zip(kinds).all(|(op, kind)| op.fits(*kind)) {
            return Err(AssembleError::Operands {
                frame: self.name.to_owned(),
                opcode,
                line,
            });
        }

        let opcode_offset = self.code.len();
        self.code.push(opcode as u8);
        for operand in operands {
            let value = match operand {
                Operand::Label(label) => {
                    self.backpatches.push(Backpatch {
                        opcode_offset,
                        operand_offset: self.code.len(),
                        label,
                    });
                    FILLER
                }
                Operand::Str(s) => self.constant(ConstKey::Str(s), || Constant::String(s.clone()))?,
                Operand::Num(n) => self.constant(ConstKey::Num(*n), || Constant::Number(*n))?,
                Operand::Regex(r) => self.constant(ConstKey::Regex(r), || Constant::Regex(r.clone()))?,
                Operand::Code(frame) => {
                    let key = ConstKey::Code(frame);
                    match self.const_keys.iter().position(|k| *k == key) {
                        Some(idx) => self.index(idx, "constants")?,
                        None => {
                            let child = assembler.frame(frame)?;
                            self.constant(key, || Constant::Code(child))?
                        }
                    }
                }
                Operand::Id(name) => self.identifier(name)?,
                Operand::Imm(n) => *n,
                Operand::Compare(op) => *op as u16,
                Operand::Operator(op) => *op as u16,
                Operand::Kind(kind) => *kind as u16,
            };
            self.code.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Index of the constant with `key`, adding it if this is its first use.
    fn constant(&mut self, key: ConstKey<'a>, make: impl FnOnce() -> Constant) -> Result<u16, AssembleError> {
        if let Some(idx) = self.const_keys.iter().position(|k| *k == key) {
            return self.index(idx, "constants");
        }
        self.const_keys.push(key);
        self.constants.push(make());
        self.index(self.constants.len() - 1, "constants")
    }

    fn identifier(&mut self, name: &str) -> Result<u16, AssembleError> {
        if let Some(idx) = self.identifiers.iter().position(|n| n == name) {
            return self.index(idx, "identifiers");
        }
        self.identifiers.push(name.to_owned());
        self.index(self.identifiers.len() - 1, "identifiers")
    }

    fn index(&self, idx: usize, what: &'static str) -> Result<u16, AssembleError> {
        u16::try_from(idx).map_err(|_| AssembleError::TooLarge {
            frame: self.name.to_owned(),
            what,
        })
    }

    /// Resolves every backpatch against the final label positions.
    fn patch(&mut self) -> Result<(), AssembleError> {
        for patch in &self.backpatches {
            let Some(&target) = self.labels.get(patch.label) else {
                return Err(AssembleError::UndefinedLabel {
                    frame: self.name.to_owned(),
                    label: patch.label.to_owned(),
                });
            };
            let range_err = || AssembleError::JumpRange {
                frame: self.name.to_owned(),
                label: patch.label.to_owned(),
            };
            let opcode = Opcode::try_from(self.code[patch.opcode_offset])
                .map_err(|_| range_err())?;
            let raw = if opcode.uses_absolute_target() {
                u16::try_from(target).map_err(|_| range_err())?
            } else {
                let end = patch.opcode_offset + opcode.instruction_len();
                let delta = isize::try_from(target).map_err(|_| range_err())?
                    - isize::try_from(end).map_err(|_| range_err())?;
                i16::try_from(delta).map_err(|_| range_err())?.cast_unsigned()
            };
            debug_assert_eq!(
                resolve_target(opcode, patch.opcode_offset + opcode.instruction_len(), raw),
                target
            );
            self.code[patch.operand_offset..patch.operand_offset + 2].copy_from_slice(&raw.to_le_bytes());
        }
        Ok(())
    }
}
