//! VM execution tracing.
//!
//! The VM carries its tracer as a type parameter, so [`NoopTracer`] compiles
//! every hook away, the same way [`NoLimitTracker`](crate::resource::NoLimitTracker)
//! removes resource accounting.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (default) |
//! | [`StderrTracer`] | Human-readable execution log on stderr |
//! | [`ProfilingTracer`] | Opcode frequencies, call counts and depth |
//! | [`CoverageTracer`] | Executed `(frame, offset)` pairs |
//! | [`RecordingTracer`] | Every event, in order |

use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::bytecode::Opcode;

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched.
    Instruction {
        frame: String,
        ip: usize,
        opcode: Opcode,
        stack_depth: usize,
    },
    /// A call pushed a new stack frame.
    Call { frame: String, depth: usize },
    /// A stack frame returned.
    Return { depth: usize },
    /// A `SETUP_EXCEPT` block was pushed; `depth` is the frame's block depth after the push.
    ExceptionPush { depth: usize },
    /// An exception block was popped.
    ExceptionPop { depth: usize },
}

/// Hooks the VM calls while it executes.
///
/// Every method defaults to a no-op; implementations override what they need.
pub trait VmTracer: fmt::Debug {
    /// Called before each opcode is dispatched.
    ///
    /// # Arguments
    /// * `frame` - Name of the executing stack frame
    /// * `ip` - Byte offset of the opcode
    /// * `opcode` - The opcode about to run
    /// * `stack_depth` - Values on the frame's stack
    /// * `frame_depth` - Frames on the call stack
    #[inline(always)]
    fn on_instruction(&mut self, _frame: &str, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called after a method or constructor frame is pushed.
    #[inline(always)]
    fn on_call(&mut self, _frame: &str, _depth: usize) {}

    /// Called after a frame returns and is popped.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when an exception block is pushed.
    #[inline(always)]
    fn on_exception_push(&mut self, _depth: usize) {}

    /// Called when an exception block is popped.
    #[inline(always)]
    fn on_exception_pop(&mut self, _depth: usize) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Prints one line per event to stderr.
///
/// ```text
/// [main      0] LOAD_CONST            stack=0  frames=1
///   >>> CALL Foo::bar              depth=2
///   <<< RETURN                     depth=1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops printing after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, frame: &str, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        let mnemonic: &'static str = opcode.into();
        eprintln!("[{frame} {ip:>5}] {mnemonic:<20}  stack={stack_depth}  frames={frame_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, frame: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {frame:<20} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN                     depth={depth}");
        }
    }

    fn on_exception_push(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  +++ TRY                        blocks={depth}");
        }
    }

    fn on_exception_pop(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  --- END TRY                    blocks={depth}");
        }
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Collects opcode frequencies and call statistics.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: AHashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    total_calls: u64,
    try_blocks: u64,
}

/// Summary produced by [`ProfilingTracer::report`].
#[derive(Debug)]
pub struct ProfilingReport {
    /// Opcode counts, most frequent first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    pub max_depth: usize,
    pub total_calls: u64,
    /// Number of `SETUP_EXCEPT` blocks entered.
    pub try_blocks: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            total_calls: self.total_calls,
            try_blocks: self.try_blocks,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _frame: &str, _ip: usize, opcode: Opcode, _stack_depth: usize, frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
        self.max_depth = self.max_depth.max(frame_depth);
    }

    fn on_call(&mut self, _frame: &str, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_exception_push(&mut self, _depth: usize) {
        self.try_blocks += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Try blocks:         {}", self.try_blocks)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions as f64) * 100.0;
            let mnemonic: &'static str = (*opcode).into();
            writeln!(f, "  {mnemonic:<20} {count:>10}  ({pct:>5.1}%)")?;
        }
        Ok(())
    }
}

// ============================================================================
// CoverageTracer
// ============================================================================

/// Records which `(frame, offset)` pairs executed.
#[derive(Debug, Default)]
pub struct CoverageTracer {
    covered: AHashSet<(String, usize)>,
}

impl CoverageTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_covered(&self, frame: &str, ip: usize) -> bool {
        self.covered.contains(&(frame.to_owned(), ip))
    }

    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.covered.len()
    }
}

impl VmTracer for CoverageTracer {
    #[inline]
    fn on_instruction(&mut self, frame: &str, ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        if !self.covered.contains(&(frame.to_owned(), ip)) {
            self.covered.insert((frame.to_owned(), ip));
        }
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Records every event; the most expensive tracer.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if !self.limit.is_some_and(|l| self.events.len() >= l) {
            self.events.push(event);
        }
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, frame: &str, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        self.record(TraceEvent::Instruction {
            frame: frame.to_owned(),
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_call(&mut self, frame: &str, depth: usize) {
        self.record(TraceEvent::Call {
            frame: frame.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_exception_push(&mut self, depth: usize) {
        self.record(TraceEvent::ExceptionPush { depth });
    }

    fn on_exception_pop(&mut self, depth: usize) {
        self.record(TraceEvent::ExceptionPop { depth });
    }
}
