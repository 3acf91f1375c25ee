//! The bytecode virtual machine.
//!
//! A fetch-decode-execute loop over the current [`Frame`]. Calls push frames
//! and returns pop them; the caller's frame is parked, not destroyed, while
//! the callee runs. Errors raised by an instruction are routed through
//! [`Vm::handle_exception`], which either finds a catch or finally handler or
//! unwinds the frame and tries the caller.
//!
//! # Module Structure
//!
//! - `codeframe` - Loaded bytecode units and their materialized constants
//! - `frame` - Stack frames and block records
//! - `attr` - Attribute loads and stores, class and attribute construction
//! - `binary` - Arithmetic operators
//! - `compare` - Comparisons, containment, instance-of and truthiness
//! - `call` - Calls, instantiation and method invocation
//! - `collections` - Tuples, datastructures, iteration and imports
//! - `exceptions` - Block unwinding and exception dispatch

mod attr;
mod binary;
mod call;
mod codeframe;
mod collections;
mod compare;
mod exceptions;
mod frame;

use std::sync::Arc;

pub(crate) use codeframe::{CodeframeCache, CodeframeId, MaterializeError};
pub(crate) use collections::hash_key;
use frame::{Block, BlockKind, Frame, Unwind};
use indexmap::IndexMap;

use crate::{
    ast::{BinaryOp, CompareOp},
    builtins::Builtins,
    bytecode::{Bytecode, Instruction, MAX_BLOCK_DEPTH, Opcode},
    exception_private::{ExcType, ExceptionRaise, Raised, RunError, RunResult},
    heap::{Heap, HeapId},
    io::PrintWriter,
    object::{Object, ObjectKind},
    resource::ResourceTracker,
    tracer::VmTracer,
};

/// Outcome of executing one instruction.
#[derive(Debug)]
pub(crate) enum Step {
    Continue,
    /// The main frame returned this value (one reference).
    Finished(HeapId),
}

/// The virtual machine.
///
/// Generic over the resource tracker, the print writer and the tracer so the
/// no-op variants cost nothing.
pub(crate) struct Vm<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> {
    pub(crate) heap: Heap<T>,
    pub(crate) codeframes: CodeframeCache,
    pub(crate) frames: Vec<Frame>,
    /// The main frame's identifiers.
    pub(crate) globals: IndexMap<String, HeapId>,
    pub(crate) builtins: Builtins,
    /// Every class and interface built during the run; keeps them alive until shutdown.
    pub(crate) user_objects: Vec<HeapId>,
    pub(crate) print: &'a mut P,
    pub(crate) tracer: &'a mut Tr,
}

impl<'a, T: ResourceTracker, P: PrintWriter, Tr: VmTracer> Vm<'a, T, P, Tr> {
    /// Sets up builtins, materializes every codeframe and prepares the main frame.
    pub fn new(
        bytecode: Arc<Bytecode>,
        tracker: T,
        print: &'a mut P,
        tracer: &'a mut Tr,
    ) -> Result<Self, MaterializeError> {
        let mut heap = Heap::new(tracker);
        let builtins = Builtins::new(&mut heap)?;
        let mut codeframes = CodeframeCache::default();
        let main = codeframes.load("main", &bytecode, &mut heap)?;
        Ok(Self {
            heap,
            codeframes,
            frames: vec![Frame::main(main, bytecode, "main")],
            globals: IndexMap::new(),
            builtins,
            user_objects: Vec::new(),
            print,
            tracer,
        })
    }

    /// Runs until the main frame returns. Returns the main frame's value.
    pub fn run(&mut self) -> RunResult<HeapId> {
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::Finished(value)) => return Ok(value),
                Err(err) => {
                    if let Some(err) = self.handle_exception(err) {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Converts the main frame's return value into a process exit code.
    #[must_use]
    pub fn exit_code(&self, value: HeapId) -> i64 {
        match self.heap.get(value).kind {
            ObjectKind::Numerical(n) => n,
            ObjectKind::Boolean(b) => i64::from(b),
            _ => 0,
        }
    }

    /// Releases everything the run still holds. Only static builtins survive.
    pub fn shutdown(&mut self) {
        self.discard_all_frames();
        let globals: Vec<HeapId> = self.globals.drain(..).map(|(_, id)| id).collect();
        self.release_all(globals);
        let classes = std::mem::take(&mut self.user_objects);
        self.release_all(classes);
        self.codeframes.release_all(&mut self.heap);
    }

    fn step(&mut self) -> RunResult<Step> {
        self.heap.tracker_mut().check_time()?;

        let depth = self.frames.len();
        let frame = self.frames.last_mut().ok_or_else(|| RunError::internal("no frame to execute"))?;
        let code = Arc::clone(&frame.code);
        if frame.ip >= code.code().len() {
            return Err(RunError::internal(format!(
                "frame '{}' ran past the end of its code",
                frame.name
            )));
        }
        let instr = Instruction::decode(code.code(), frame.ip).map_err(|err| RunError::internal(err.to_string()))?;
        frame.instr_start = instr.offset;
        frame.ip = instr.end();
        self.tracer
            .on_instruction(&frame.name, instr.offset, instr.opcode, frame.stack.len(), depth);

        self.execute(&code, &instr)
    }

    fn execute(&mut self, code: &Bytecode, instr: &Instruction) -> RunResult<Step> {
        let arg = |slot: usize| usize::from(instr.operands[slot]);
        match instr.opcode {
            // ================================================================
            // Stack shuffles
            // ================================================================
            Opcode::Stop => {
                self.discard_all_frames();
                return Ok(Step::Finished(self.null()));
            }
            Opcode::Nop => {}
            Opcode::PopTop => {
                let value = self.pop()?;
                self.release(value);
            }
            Opcode::RotTwo => self.rotate(2)?,
            Opcode::RotThree => self.rotate(3)?,
            Opcode::RotFour => self.rotate(4)?,
            Opcode::DupTop => {
                let value = self.peek()?;
                self.heap.inc_ref(value);
                self.push(value);
            }
            Opcode::DupTopx => {
                let n = arg(0);
                let stack = &mut self.frame_mut().stack;
                let len = stack.len();
                if n > len {
                    return Err(RunError::internal("stack underflow"));
                }
                stack.extend_from_within(len - n..);
                for i in len..len + n {
                    let id = self.frame().stack[i];
                    self.heap.inc_ref(id);
                }
            }

            // ================================================================
            // Constants and identifiers
            // ================================================================
            Opcode::LoadConst => {
                let codeframe = self.codeframes.get(self.frame().codeframe);
                let id = *codeframe
                    .constants
                    .get(arg(0))
                    .ok_or_else(|| RunError::internal("constant index out of range"))?;
                self.heap.inc_ref(id);
                self.push(id);
            }
            Opcode::LoadId => {
                let name = identifier(code, arg(0))?;
                let id = self.lookup(name).ok_or_else(|| ExcType::identifier_error(name))?;
                self.heap.inc_ref(id);
                self.push(id);
            }
            Opcode::StoreId => {
                let name = identifier(code, arg(0))?;
                let value = self.pop()?;
                let locals = self.frames.last_mut().and_then(|frame| frame.locals.as_mut());
                let old = match locals {
                    Some(locals) => locals.insert(name.to_owned(), value),
                    None => self.globals.insert(name.to_owned(), value),
                };
                if let Some(old) = old {
                    self.release(old);
                }
            }
            Opcode::LoadGlobal => {
                let name = identifier(code, arg(0))?;
                let id = *self.globals.get(name).ok_or_else(|| ExcType::identifier_error(name))?;
                self.heap.inc_ref(id);
                self.push(id);
            }
            Opcode::StoreGlobal => {
                let name = identifier(code, arg(0))?;
                let value = self.pop()?;
                if let Some(old) = self.globals.insert(name.to_owned(), value) {
                    self.release(old);
                }
            }
            Opcode::DeleteGlobal => {
                let name = identifier(code, arg(0))?;
                let old = self
                    .globals
                    .shift_remove(name)
                    .ok_or_else(|| ExcType::identifier_error(name))?;
                self.release(old);
            }

            // ================================================================
            // Attributes and builders
            // ================================================================
            Opcode::LoadAttrib => self.load_attrib(constant_str(code, arg(0))?)?,
            Opcode::StoreAttrib => self.store_attrib(constant_str(code, arg(0))?)?,
            Opcode::BuildAttrib => self.build_attrib(instr.operands[0], arg(1))?,
            Opcode::BuildClass => self.build_class(arg(0), arg(1), false)?,
            Opcode::BuildInterface => self.build_class(arg(0), arg(1), true)?,
            Opcode::BuildTuple => self.build_tuple(arg(0))?,
            Opcode::BuildDatastruct => self.build_datastruct(arg(0))?,

            // ================================================================
            // Operators
            // ================================================================
            Opcode::Operator | Opcode::InplaceOpr => {
                let op = u8::try_from(arg(0))
                    .ok()
                    .and_then(BinaryOp::from_repr)
                    .ok_or_else(|| RunError::internal(format!("unknown operator code {}", arg(0))))?;
                self.binary_op(op)?;
            }
            Opcode::CompareOp => {
                let op = u8::try_from(arg(0))
                    .ok()
                    .and_then(CompareOp::from_repr)
                    .ok_or_else(|| RunError::internal(format!("unknown comparison code {}", arg(0))))?;
                self.compare_op(op)?;
            }

            // ================================================================
            // Jumps
            // ================================================================
            Opcode::JumpForward | Opcode::JumpAbsolute => self.jump(instr.jump_target(0)),
            Opcode::JumpIfTrue | Opcode::JumpIfFalse => {
                let truthy = self.is_truthy(self.peek()?);
                if truthy == (instr.opcode == Opcode::JumpIfTrue) {
                    self.jump(instr.jump_target(0));
                }
            }
            Opcode::JumpIfFirstTrue | Opcode::JumpIfFirstFalse => {
                let truthy = self.is_truthy(self.peek()?);
                let frame = self.frame_mut();
                let index = frame
                    .innermost_loop()
                    .ok_or_else(|| RunError::internal("JUMP_IF_FIRST outside of a loop"))?;
                let block = &mut frame.blocks[index];
                let first = !block.visited;
                block.visited = true;
                if first && truthy == (instr.opcode == Opcode::JumpIfFirstTrue) {
                    self.jump(instr.jump_target(0));
                }
            }

            // ================================================================
            // Blocks
            // ================================================================
            Opcode::SetupLoop | Opcode::SetupElseLoop => {
                let otherwise = (instr.opcode == Opcode::SetupElseLoop).then(|| instr.jump_target(1));
                let kind = BlockKind::Loop {
                    head: instr.end(),
                    end: instr.jump_target(0),
                    otherwise,
                };
                self.push_block(kind)?;
            }
            Opcode::SetupExcept => {
                let kind = BlockKind::Exception {
                    catch: instr.jump_target(0),
                    finally: instr.jump_target(1),
                    end_finally: instr.jump_target(2),
                    in_finally: false,
                    resume: None,
                };
                self.push_block(kind)?;
                let depth = self.frame().blocks.len();
                self.tracer.on_exception_push(depth);
            }
            Opcode::PopBlock => {
                let block = self
                    .frame_mut()
                    .blocks
                    .pop()
                    .ok_or_else(|| RunError::internal("POP_BLOCK with no block"))?;
                self.discard_block(block);
            }
            Opcode::BreakLoop => return self.unwind(Unwind::Break),
            Opcode::BreakelseLoop => return self.unwind(Unwind::BreakElse),
            Opcode::ContinueLoop => return self.unwind(Unwind::Continue(instr.jump_target(0))),
            Opcode::Throw => {
                let value = self.pop()?;
                let exception = self.builtins.exception;
                if self.heap.get(value).is_instance() && self.is_instance_of(value, exception) {
                    return Err(ExceptionRaise {
                        raised: Raised::Object(value),
                        frames: Vec::new(),
                    }
                    .into());
                }
                let type_name = self.heap.get(value).type_name().to_owned();
                self.release(value);
                return Err(ExcType::type_error(format!(
                    "can only throw Exception instances, not '{type_name}'"
                )));
            }
            Opcode::EndFinally => return self.end_finally(),

            // ================================================================
            // Calls
            // ================================================================
            Opcode::Call => self.call(arg(0))?,
            Opcode::Return => {
                let value = self.pop()?;
                return self.unwind(Unwind::Return(value));
            }

            // ================================================================
            // Iteration and modules
            // ================================================================
            Opcode::IterReset => self.iter_reset()?,
            Opcode::IterFetch => self.iter_fetch()?,
            Opcode::Import => self.import()?,
        }
        Ok(Step::Continue)
    }

    // ========================================================================
    // Frame and stack helpers
    // ========================================================================

    pub(crate) fn frame(&self) -> &Frame {
        self.frames.last().expect("Vm::frame: no active frame")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("Vm::frame_mut: no active frame")
    }

    pub(crate) fn push(&mut self, id: HeapId) {
        self.frame_mut().stack.push(id);
    }

    pub(crate) fn pop(&mut self) -> RunResult<HeapId> {
        self.frame_mut()
            .stack
            .pop()
            .ok_or_else(|| RunError::internal("stack underflow"))
    }

    pub(crate) fn peek(&self) -> RunResult<HeapId> {
        self.frame()
            .stack
            .last()
            .copied()
            .ok_or_else(|| RunError::internal("stack underflow"))
    }

    /// Pops `n` values, returned in push order.
    pub(crate) fn pop_n(&mut self, n: usize) -> RunResult<Vec<HeapId>> {
        let stack = &mut self.frame_mut().stack;
        if n > stack.len() {
            return Err(RunError::internal("stack underflow"));
        }
        let at = stack.len() - n;
        Ok(stack.split_off(at))
    }

    /// Moves the top of the stack down `n - 1` places.
    fn rotate(&mut self, n: usize) -> RunResult<()> {
        let stack = &mut self.frame_mut().stack;
        let len = stack.len();
        if n > len {
            return Err(RunError::internal("stack underflow"));
        }
        stack[len - n..].rotate_right(1);
        Ok(())
    }

    /// Drops stack values above `sp`.
    pub(crate) fn truncate_stack(&mut self, sp: usize) {
        let stack = &mut self.frame_mut().stack;
        if stack.len() > sp {
            let dropped = stack.split_off(sp);
            self.release_all(dropped);
        }
    }

    pub(crate) fn jump(&mut self, target: usize) {
        self.frame_mut().ip = target;
    }

    fn push_block(&mut self, kind: BlockKind) -> RunResult<()> {
        let frame = self.frame_mut();
        if frame.blocks.len() >= MAX_BLOCK_DEPTH {
            return Err(RunError::internal("block stack overflow"));
        }
        let sp = frame.stack.len();
        frame.blocks.push(Block::new(kind, sp));
        Ok(())
    }

    /// Releases what a popped block still holds.
    pub(crate) fn discard_block(&mut self, block: Block) {
        if let BlockKind::Exception { resume, .. } = block.kind {
            let depth = self.frame().blocks.len();
            self.tracer.on_exception_pop(depth);
            if let Some(Unwind::Return(value)) = resume {
                self.release(value);
            }
        }
    }

    /// Pops the current frame and releases everything it holds.
    pub(crate) fn discard_frame(&mut self) {
        if let Some(mut frame) = self.frames.pop() {
            let mut refs = Vec::new();
            frame.drain_refs(&mut refs);
            self.release_all(refs);
            self.tracer.on_return(self.frames.len());
        }
    }

    pub(crate) fn discard_all_frames(&mut self) {
        while !self.frames.is_empty() {
            self.discard_frame();
        }
    }

    /// Resolves an identifier: locals, then globals, then builtins.
    fn lookup(&self, name: &str) -> Option<HeapId> {
        self.frame()
            .locals
            .as_ref()
            .and_then(|locals| locals.get(name))
            .or_else(|| self.globals.get(name))
            .copied()
            .or_else(|| self.builtins.get(name))
    }

    // ========================================================================
    // Heap helpers
    // ========================================================================

    pub(crate) fn alloc(&mut self, object: Object) -> RunResult<HeapId> {
        Ok(self.heap.allocate(object)?)
    }

    pub(crate) fn release(&mut self, id: HeapId) {
        self.heap.dec_ref(id);
    }

    pub(crate) fn release_all(&mut self, ids: impl IntoIterator<Item = HeapId>) {
        for id in ids {
            self.heap.dec_ref(id);
        }
    }

    /// A new reference to the `null` singleton.
    pub(crate) fn null(&self) -> HeapId {
        self.heap.inc_ref(self.builtins.null);
        self.builtins.null
    }

    /// A new reference to the `true` or `false` singleton.
    pub(crate) fn boolean(&self, value: bool) -> HeapId {
        let id = if value { self.builtins.true_ } else { self.builtins.false_ };
        self.heap.inc_ref(id);
        id
    }

    pub(crate) fn number(&mut self, value: i64) -> RunResult<HeapId> {
        self.alloc(Object::new("numerical", ObjectKind::Numerical(value)))
    }

    pub(crate) fn string(&mut self, value: String) -> RunResult<HeapId> {
        self.alloc(Object::new("string", ObjectKind::String(value)))
    }

    pub(crate) fn is_null(&self, id: HeapId) -> bool {
        matches!(self.heap.get(id).kind, ObjectKind::Null)
    }
}

fn identifier(code: &Bytecode, index: usize) -> RunResult<&str> {
    code.identifiers()
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| RunError::internal("identifier index out of range"))
}

fn constant_str(code: &Bytecode, index: usize) -> RunResult<&str> {
    code.constants()
        .get(index)
        .and_then(|constant| constant.as_str())
        .ok_or_else(|| RunError::internal("attribute name is not a string constant"))
}
