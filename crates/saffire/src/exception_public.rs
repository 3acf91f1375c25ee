use std::fmt;

use crate::{bytecode::LoadError, compiler::CompileError, exception_private::ExcType};

/// One entry of a traceback: the frame an exception unwound through and the
/// source line it was executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub frame_name: String,
    pub line: Option<u32>,
}

/// An exception that escaped the outermost frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    class_name: String,
    message: Option<String>,
    traceback: Vec<StackFrame>,
}

impl Exception {
    #[must_use]
    pub fn new(class_name: impl Into<String>, message: Option<String>, traceback: Vec<StackFrame>) -> Self {
        Self {
            class_name: class_name.into(),
            message,
            traceback,
        }
    }

    /// Name of the exception's class, e.g. `TypeException` or a user-defined class.
    #[must_use]
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// The builtin exception type, if the class is one of the VM's own.
    #[must_use]
    pub fn exc_type(&self) -> Option<ExcType> {
        self.class_name.parse().ok()
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Frames the exception unwound through, innermost first.
    #[must_use]
    pub fn traceback(&self) -> &[StackFrame] {
        &self.traceback
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.traceback.is_empty() {
            writeln!(f, "Traceback (innermost first):")?;
            for frame in &self.traceback {
                match frame.line {
                    Some(line) => writeln!(f, "  in {}, line {line}", frame.frame_name)?,
                    None => writeln!(f, "  in {}", frame.frame_name)?,
                }
            }
        }
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.class_name),
            None => write!(f, "{}", self.class_name),
        }
    }
}

impl std::error::Error for Exception {}

/// Everything that can go wrong between an AST and a finished run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("load error: {0}")]
    Load(#[from] LoadError),
    #[error("{0}")]
    Runtime(Exception),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Exception> for Error {
    fn from(exc: Exception) -> Self {
        Self::Runtime(exc)
    }
}
