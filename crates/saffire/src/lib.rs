#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_wrap, reason = "heap deltas are signed differences of slot counts")]
mod heap;

pub mod ast;
mod builtins;
pub mod bytecode;
pub mod compiler;
mod exception_private;
mod exception_public;
mod io;
mod object;
mod resource;
mod run;
pub mod tracer;
mod vm;

pub use crate::{
    bytecode::{LoadError, MarshalOptions},
    compiler::{CompileError, CompileOptions},
    exception_private::ExcType,
    exception_public::{Error, Exception, StackFrame},
    heap::{HeapDiff, HeapStats},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
    run::{RunOutcome, Runner},
    tracer::{
        CoverageTracer, NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent,
        VmTracer,
    },
};
