//! AST to bytecode compiler.
//!
//! Compilation runs in two stages: [`lower`] walks the tree and produces an
//! [`AsmProgram`] (one symbolic instruction list per frame), and the assembler
//! turns that into a [`Bytecode`] unit. [`compile`] runs both.

mod asm;
mod lower;

pub use asm::{AsmFrame, AsmLine, AsmProgram, Operand};

use crate::{
    ast::Node,
    bytecode::{AssembleError, AssembleOptions, Bytecode, assemble},
};

/// Settings for a compilation unit.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Source file name recorded in every frame.
    pub source_file: Option<String>,
    /// Emit an offset-to-line table so tracebacks carry line numbers.
    pub emit_lines: bool,
    /// Name of the top-level frame.
    pub main_frame: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            source_file: None,
            emit_lines: true,
            main_frame: "main".to_owned(),
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn source_file(mut self, name: impl Into<String>) -> Self {
        self.source_file = Some(name.into());
        self
    }

    #[must_use]
    pub fn without_lines(mut self) -> Self {
        self.emit_lines = false;
        self
    }
}

/// A fatal compile-time error. There is no partial output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("line {line}: expected a program or block at the root")]
    NotAProgram { line: u32 },
    #[error("line {line}: invalid assignment target")]
    InvalidTarget { line: u32 },
    #[error("line {line}: cannot assign {values} values to {targets} targets")]
    Destructure { line: u32, targets: usize, values: usize },
    #[error("line {line}: {what} cannot be used as an expression")]
    InvalidExpression { line: u32, what: &'static str },
    #[error("line {line}: empty subscript can only be assigned to")]
    EmptySubscript { line: u32 },
    #[error("line {line}: 'continue' outside of a loop")]
    ContinueOutsideLoop { line: u32 },
    #[error("line {line}: 'break' outside of a loop or switch")]
    BreakOutsideLoop { line: u32 },
    #[error("line {line}: label '{label}' is defined twice in the same block")]
    DuplicateLabel { line: u32, label: String },
    #[error("line {line}: no label '{label}' in scope")]
    UndefinedLabel { line: u32, label: String },
    #[error("line {line}: switch has more than one default clause")]
    DuplicateDefault { line: u32 },
    #[error("line {line}: loops and try blocks are nested too deeply")]
    BlockDepth { line: u32 },
    #[error("line {line}: '{name}' {reason}")]
    Modifiers { line: u32, name: String, reason: &'static str },
    #[error("line {line}: too many {what}")]
    TooMany { line: u32, what: &'static str },
    #[error("{0}")]
    Assemble(#[from] AssembleError),
}

impl CompileError {
    /// Source line of the offending construct, if the error has one.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        match self {
            Self::NotAProgram { line }
            | Self::InvalidTarget { line }
            | Self::Destructure { line, .. }
            | Self::InvalidExpression { line, .. }
            | Self::EmptySubscript { line }
            | Self::ContinueOutsideLoop { line }
            | Self::BreakOutsideLoop { line }
            | Self::DuplicateLabel { line, .. }
            | Self::UndefinedLabel { line, .. }
            | Self::DuplicateDefault { line }
            | Self::BlockDepth { line }
            | Self::Modifiers { line, .. }
            | Self::TooMany { line, .. } => Some(*line),
            Self::Assemble(_) => None,
        }
    }
}

/// Lowers `ast` to symbolic frames.
pub fn lower(ast: &Node, options: &CompileOptions) -> Result<AsmProgram, CompileError> {
    lower::lower_program(ast, &options.main_frame)
}

/// Lowers and assembles `ast`. Returns the listing alongside the bytecode.
pub fn compile(ast: &Node, options: &CompileOptions) -> Result<(AsmProgram, Bytecode), CompileError> {
    let program = lower(ast, options)?;
    let bytecode = assemble(
        &program,
        &AssembleOptions {
            emit_lines: options.emit_lines,
            source_file: options.source_file.clone(),
        },
    )?;
    Ok((program, bytecode))
}
