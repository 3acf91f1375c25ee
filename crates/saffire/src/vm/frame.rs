//! Stack frames and block records.

use std::sync::Arc;

use indexmap::IndexMap;

use super::codeframe::CodeframeId;
use crate::{bytecode::Bytecode, heap::HeapId};

/// Why a frame is leaving a block early.
#[derive(Debug)]
pub(crate) enum Unwind {
    Break,
    BreakElse,
    /// Jump to this absolute offset inside the nearest enclosing loop.
    Continue(usize),
    /// Leave the frame with this value. Holds one reference.
    Return(HeapId),
}

#[derive(Debug)]
pub(crate) enum BlockKind {
    Loop {
        /// First instruction after the setup opcode.
        head: usize,
        end: usize,
        /// Target of `BREAKELSE_LOOP`, when the loop has an else branch.
        otherwise: Option<usize>,
    },
    Exception {
        catch: usize,
        finally: usize,
        end_finally: usize,
        in_finally: bool,
        /// Unwind to continue once the finally body completes.
        resume: Option<Unwind>,
    },
}

/// A loop or exception region active in a frame.
#[derive(Debug)]
pub(crate) struct Block {
    pub kind: BlockKind,
    /// Stack depth to restore when the block is left early.
    pub sp: usize,
    /// Set by the first `JUMP_IF_FIRST_*` evaluated in the block.
    pub visited: bool,
}

impl Block {
    pub fn new(kind: BlockKind, sp: usize) -> Self {
        Self {
            kind,
            sp,
            visited: false,
        }
    }

    #[must_use]
    pub fn is_loop(&self) -> bool {
        matches!(self.kind, BlockKind::Loop { .. })
    }
}

/// What to hand the caller when the frame returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnReturn {
    /// Push the returned value.
    Push,
    /// Drop the returned value and push this freshly constructed instance.
    Construct(HeapId),
}

/// One activation of a codeframe.
#[derive(Debug)]
pub(crate) struct Frame {
    pub codeframe: CodeframeId,
    pub code: Arc<Bytecode>,
    /// `main`, or `Class::method` for method frames.
    pub name: String,
    /// Offset of the next instruction.
    pub ip: usize,
    /// Offset of the instruction being executed.
    pub instr_start: usize,
    pub stack: Vec<HeapId>,
    /// Local identifiers. `None` for the main frame, whose locals are the globals.
    pub locals: Option<IndexMap<String, HeapId>>,
    pub blocks: Vec<Block>,
    pub on_return: OnReturn,
    /// Class whose method is running; used for visibility checks.
    pub class_context: Option<HeapId>,
}

impl Frame {
    pub fn main(codeframe: CodeframeId, code: Arc<Bytecode>, name: &str) -> Self {
        let stack = Vec::with_capacity(code.stack_size() as usize);
        Self {
            codeframe,
            code,
            name: name.to_owned(),
            ip: 0,
            instr_start: 0,
            stack,
            locals: None,
            blocks: Vec::new(),
            on_return: OnReturn::Push,
            class_context: None,
        }
    }

    pub fn method(
        codeframe: CodeframeId,
        code: Arc<Bytecode>,
        name: String,
        locals: IndexMap<String, HeapId>,
        class_context: Option<HeapId>,
        on_return: OnReturn,
    ) -> Self {
        let stack = Vec::with_capacity(code.stack_size() as usize);
        Self {
            codeframe,
            code,
            name,
            ip: 0,
            instr_start: 0,
            stack,
            locals: Some(locals),
            blocks: Vec::new(),
            on_return,
            class_context,
        }
    }

    /// Source line of the instruction being executed.
    #[must_use]
    pub fn line(&self) -> Option<u32> {
        self.code.line_for_offset(self.instr_start)
    }

    /// Index of the innermost loop block.
    #[must_use]
    pub fn innermost_loop(&self) -> Option<usize> {
        self.blocks.iter().rposition(Block::is_loop)
    }

    /// Moves every reference the frame holds into `out`.
    pub fn drain_refs(&mut self, out: &mut Vec<HeapId>) {
        out.append(&mut self.stack);
        if let Some(locals) = self.locals.take() {
            out.extend(locals.into_values());
        }
        for block in self.blocks.drain(..) {
            if let BlockKind::Exception {
                resume: Some(Unwind::Return(value)),
                ..
            } = block.kind
            {
                out.push(value);
            }
        }
        if let OnReturn::Construct(instance) = self.on_return {
            out.push(instance);
            self.on_return = OnReturn::Push;
        }
    }
}
