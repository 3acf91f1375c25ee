use std::{borrow::Cow, fmt::Display};

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::heap::HeapId;

/// Result type alias for operations that can produce a runtime error.
pub type RunResult<T> = Result<T, RunError>;

/// Exception classes the VM itself raises.
///
/// Every variant exists at runtime as a builtin class object of the same name, so
/// user code can catch a VM-raised error with `catch (TypeException e)`.
/// All of them extend `Exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
pub enum ExcType {
    /// Root of the exception hierarchy.
    Exception,
    /// Operand types do not support an operator or comparison.
    TypeException,
    /// Missing attribute, or a store to a constant or read-only attribute.
    AttributeException,
    /// Private or protected attribute accessed from outside its class.
    VisibilityException,
    /// Identifier not found in any scope.
    IdentifierException,
    /// Illegal call: non-callable, abstract, constructor or static misuse.
    CallException,
    /// Wrong number of arguments.
    ArgumentException,
    /// Division by zero or overflow.
    ArithmeticException,
    /// A class does not conform to an interface it implements.
    InterfaceException,
    /// `import` named something that does not exist.
    ImportException,
    /// A resource limit was exceeded.
    ResourceException,
}

impl ExcType {
    #[must_use]
    pub(crate) fn type_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::TypeException, msg).into()
    }

    #[must_use]
    pub(crate) fn attribute_error(object: impl Display, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::AttributeException,
            format!("object '{object}' has no attribute '{attr}'"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn visibility_error(visibility: impl Display, class: &str, attr: &str) -> RunError {
        SimpleException::new_msg(
            Self::VisibilityException,
            format!("cannot access {visibility} attribute '{class}::{attr}' from this scope"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn identifier_error(name: &str) -> RunError {
        SimpleException::new_msg(Self::IdentifierException, format!("unknown identifier '{name}'")).into()
    }

    #[must_use]
    pub(crate) fn call_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::CallException, msg).into()
    }

    #[must_use]
    pub(crate) fn argument_error(callable: &str, expected: usize, got: usize) -> RunError {
        SimpleException::new_msg(
            Self::ArgumentException,
            format!("{callable}() takes at most {expected} arguments, {got} given"),
        )
        .into()
    }

    #[must_use]
    pub(crate) fn arithmetic_error(msg: impl Display) -> RunError {
        SimpleException::new_msg(Self::ArithmeticException, msg).into()
    }
}

/// An exception raised by the VM before it has been materialized as an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SimpleException {
    exc_type: ExcType,
    message: Option<String>,
}

impl SimpleException {
    #[must_use]
    pub fn new(exc_type: ExcType, message: Option<String>) -> Self {
        Self { exc_type, message }
    }

    #[must_use]
    pub fn new_msg(exc_type: ExcType, message: impl Display) -> Self {
        Self::new(exc_type, Some(message.to_string()))
    }

    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        self.exc_type
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn into_raise(self) -> ExceptionRaise {
        ExceptionRaise {
            raised: Raised::Simple(self),
            frames: Vec::new(),
        }
    }
}

/// The payload of a raised exception.
#[derive(Debug)]
pub(crate) enum Raised {
    /// Raised by the VM; becomes an instance of the matching builtin class when caught.
    Simple(SimpleException),
    /// A `throw`n exception instance. Holds one reference to the object.
    Object(HeapId),
}

/// A position recorded while an exception unwinds out of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawStackFrame {
    pub frame_name: String,
    pub line: Option<u32>,
}

/// An exception in flight, plus the frames it has unwound through (innermost first).
#[derive(Debug)]
pub(crate) struct ExceptionRaise {
    pub raised: Raised,
    pub frames: Vec<RawStackFrame>,
}

/// Runtime error type for the VM.
///
/// - `Internal`: malformed bytecode or a broken VM invariant; never catchable
/// - `Exc`: a user-level exception that try/catch can handle
/// - `Uncatchable`: a resource limit violation, which unwinds straight to the caller
#[derive(Debug)]
pub(crate) enum RunError {
    Internal(Cow<'static, str>),
    Exc(Box<ExceptionRaise>),
    Uncatchable(Box<ExceptionRaise>),
}

impl From<ExceptionRaise> for RunError {
    fn from(exc: ExceptionRaise) -> Self {
        Self::Exc(Box::new(exc))
    }
}

impl From<SimpleException> for RunError {
    fn from(exc: SimpleException) -> Self {
        Self::Exc(Box::new(exc.into_raise()))
    }
}

impl RunError {
    pub fn internal(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(msg.into())
    }

    /// Appends a traceback entry as the error leaves a frame.
    pub fn push_frame(&mut self, frame: RawStackFrame) {
        match self {
            Self::Exc(exc) | Self::Uncatchable(exc) => exc.frames.push(frame),
            Self::Internal(_) => {}
        }
    }
}
