//! Public interface for compiling and running Saffire programs.

use std::{io, sync::Arc};

use crate::{
    Error, Exception,
    ast::Node,
    bytecode::{Bytecode, MarshalOptions, deserialize, serialize},
    compiler::{AsmProgram, CompileOptions, compile},
    exception_private::ExcType,
    heap::HeapStats,
    io::{PrintWriter, StdPrint},
    resource::{NoLimitTracker, ResourceTracker},
    tracer::{NoopTracer, VmTracer},
    vm::{MaterializeError, Vm},
};

/// Primary interface for running Saffire code.
///
/// A `Runner` holds a compiled bytecode unit. It is created either from an AST
/// with [`Runner::new`] or from a serialized `.sfc` file with
/// [`Runner::from_bytecode`], and can be run any number of times; each run gets
/// a fresh heap.
///
/// # Example
/// ```
/// use saffire::{CollectStringPrint, CompileOptions, NoLimitTracker, Runner, ast::Node};
///
/// let ast = Node::from_json(
///     r#"{"line": 1, "node": "program", "body": [
///         {"line": 1, "node": "call",
///          "callee": {"line": 1, "node": "identifier", "name": "print"},
///          "args": [{"line": 1, "node": "number", "value": 42}]}
///     ]}"#,
/// )
/// .unwrap();
/// let runner = Runner::new(&ast, &CompileOptions::default()).unwrap();
/// let mut print = CollectStringPrint::new();
/// runner.run(NoLimitTracker, &mut print).unwrap();
/// assert_eq!(print.output(), "42\n");
/// ```
#[derive(Debug, Clone)]
pub struct Runner {
    /// The asm listing, when the runner was compiled from an AST.
    program: Option<AsmProgram>,
    bytecode: Arc<Bytecode>,
}

/// Result of [`Runner::run_with_stats`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i64,
    /// Heap state once builtins and constants are in place, before the first instruction.
    pub before: HeapStats,
    /// Heap state after the run released everything it held.
    pub after: HeapStats,
}

impl Runner {
    /// Compiles `ast`.
    ///
    /// # Errors
    /// Returns [`Error::Compile`] if the tree cannot be lowered or assembled.
    pub fn new(ast: &Node, options: &CompileOptions) -> Result<Self, Error> {
        let (program, bytecode) = compile(ast, options)?;
        tracing::debug!(
            frames = program.frames.len(),
            bytes = bytecode.code().len(),
            "compiled program"
        );
        Ok(Self {
            program: Some(program),
            bytecode: Arc::new(bytecode),
        })
    }

    /// Loads a serialized bytecode file, verifying its signature with `verify_key` when given.
    ///
    /// # Errors
    /// Returns [`Error::Load`] if the container is corrupt or the code is malformed.
    pub fn from_bytecode(bytes: &[u8], verify_key: Option<&[u8]>) -> Result<Self, Error> {
        let bytecode = deserialize(bytes, verify_key)?;
        bytecode.validate()?;
        Ok(Self {
            program: None,
            bytecode: Arc::new(bytecode),
        })
    }

    #[must_use]
    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// The asm listing when compiled from source, a disassembly otherwise.
    #[must_use]
    pub fn listing(&self) -> String {
        match &self.program {
            Some(program) => program.to_string(),
            None => self.bytecode.disassemble(),
        }
    }

    /// Serializes the bytecode into the `.sfc` container format.
    ///
    /// # Errors
    /// Returns an error if compression fails.
    pub fn serialize(&self, options: &MarshalOptions) -> io::Result<Vec<u8>> {
        serialize(&self.bytecode, options)
    }

    /// Runs the program to completion and returns its exit code.
    ///
    /// # Errors
    /// Returns [`Error::Runtime`] for an exception that escaped the program.
    pub fn run(&self, tracker: impl ResourceTracker, print: &mut impl PrintWriter) -> Result<i64, Error> {
        self.run_traced(tracker, print, &mut NoopTracer)
    }

    /// Runs with no resource limits, printing to stdout.
    ///
    /// # Errors
    /// See [`Runner::run`].
    pub fn run_no_limits(&self) -> Result<i64, Error> {
        self.run(NoLimitTracker, &mut StdPrint)
    }

    /// Like [`Runner::run`], reporting execution events to `tracer`.
    ///
    /// # Errors
    /// See [`Runner::run`].
    pub fn run_traced(
        &self,
        tracker: impl ResourceTracker,
        print: &mut impl PrintWriter,
        tracer: &mut impl VmTracer,
    ) -> Result<i64, Error> {
        self.execute(tracker, print, tracer).map(|outcome| outcome.exit_code)
    }

    /// Like [`Runner::run`], also returning heap snapshots from before and
    /// after the run.
    ///
    /// # Errors
    /// See [`Runner::run`].
    pub fn run_with_stats(&self, tracker: impl ResourceTracker, print: &mut impl PrintWriter) -> Result<RunOutcome, Error> {
        self.execute(tracker, print, &mut NoopTracer)
    }

    fn execute<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
        &self,
        tracker: T,
        print: &mut P,
        tracer: &mut Tr,
    ) -> Result<RunOutcome, Error> {
        let mut vm = Vm::new(Arc::clone(&self.bytecode), tracker, print, tracer).map_err(setup_error)?;
        let before = vm.heap.heap_stats();

        let result = match vm.run() {
            Ok(value) => {
                let exit_code = vm.exit_code(value);
                vm.release(value);
                Ok(exit_code)
            }
            Err(err) => Err(vm.into_public_error(err)),
        };
        vm.shutdown();
        let after = vm.heap.heap_stats();
        tracing::debug!(
            live = after.live_objects,
            frees = after.total_frees,
            "run finished"
        );

        result.map(|exit_code| RunOutcome {
            exit_code,
            before,
            after,
        })
    }
}

fn setup_error(err: MaterializeError) -> Error {
    match err {
        MaterializeError::Load(err) => Error::Load(err),
        MaterializeError::Resource(err) => Error::Runtime(Exception::new(
            ExcType::ResourceException.to_string(),
            Some(err.to_string()),
            Vec::new(),
        )),
    }
}
