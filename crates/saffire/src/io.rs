//! Output sinks for the builtin `print`.
//!
//! A `print` call renders each argument, separates them with single spaces and
//! ends the line. The VM never touches stdout directly; everything goes through
//! the [`PrintWriter`] handed to [`Runner::run`](crate::Runner::run).

use std::io::{self, Write};

/// Receives the output of `print`.
pub trait PrintWriter {
    /// Writes the rendering of one argument.
    fn write_text(&mut self, text: &str) -> io::Result<()>;

    /// Writes the separator between two arguments.
    fn write_separator(&mut self) -> io::Result<()> {
        self.write_text(" ")
    }

    /// Finishes one `print` call.
    fn end_line(&mut self) -> io::Result<()> {
        self.write_text("\n")
    }
}

/// Writes to the process's stdout, flushing at the end of every line.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        io::stdout().lock().write_all(text.as_bytes())
    }

    fn end_line(&mut self) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(b"\n")?;
        stdout.flush()
    }
}

/// Collects all output into a string.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.0.push_str(text);
        Ok(())
    }
}

/// Discards all output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_text(&mut self, _text: &str) -> io::Result<()> {
        Ok(())
    }
}
