//! Maximum stack depth computation.
//!
//! Walks every control-flow path of an assembled frame, carrying the stack
//! depth and a model of the block stack, and records the high-water mark. A
//! location is re-explored only when it is reached with a greater depth, so
//! loops terminate after one extra pass.

use ahash::AHashMap;

use super::{
    code::{Instruction, LoadError},
    op::Opcode,
};
use crate::ast::AttribKind;

/// Why the stack size of a frame could not be computed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("stack underflow at offset {offset}")]
    Underflow { offset: usize },
    #[error("{opcode} at offset {offset} has no enclosing block")]
    NoBlock { offset: usize, opcode: Opcode },
    #[error("stack grows without bound at offset {offset}")]
    Unbounded { offset: usize },
    #[error("cannot decode instruction at offset {offset}")]
    Decode { offset: usize },
}

#[derive(Debug, Clone, Copy)]
enum SimBlock {
    Loop {
        sp: usize,
        head: usize,
        end: usize,
        otherwise: Option<usize>,
    },
    Except { sp: usize },
}

impl SimBlock {
    fn sp(self) -> usize {
        match self {
            Self::Loop { sp, .. } | Self::Except { sp } => sp,
        }
    }
}

#[derive(Debug, Clone)]
struct State {
    ip: usize,
    depth: usize,
    blocks: Vec<SimBlock>,
}

/// Returns the deepest stack any path through `code` can reach.
pub fn max_stack_depth(code: &[u8]) -> Result<u32, StackError> {
    let mut best: AHashMap<usize, usize> = AHashMap::new();
    let mut work = vec![State {
        ip: 0,
        depth: 0,
        blocks: Vec::new(),
    }];
    let mut max_depth = 0;

    while let Some(state) = work.pop() {
        if state.ip >= code.len() {
            continue;
        }
        match best.get(&state.ip) {
            Some(&seen) if seen >= state.depth => continue,
            _ => {
                best.insert(state.ip, state.depth);
            }
        }
        max_depth = max_depth.max(state.depth);

        let instr = Instruction::decode(code, state.ip).map_err(|err| match err {
            LoadError::UnknownOpcode { offset, .. } | LoadError::TruncatedInstruction { offset } => {
                StackError::Decode { offset }
            }
            _ => StackError::Decode { offset: state.ip },
        })?;
        let depth = apply_effect(&instr, state.depth)?;
        if depth > usize::from(u16::MAX) {
            return Err(StackError::Unbounded { offset: instr.offset });
        }
        max_depth = max_depth.max(depth);
        step(&instr, depth, state.blocks, &mut work)?;
    }

    Ok(u32::try_from(max_depth).unwrap_or(u32::MAX))
}

/// Depth after executing `instr` on a stack of `depth` items.
fn apply_effect(instr: &Instruction, depth: usize) -> Result<usize, StackError> {
    let arg = |slot: usize| usize::from(instr.operands[slot]);
    let (pops, pushes) = match instr.opcode {
        Opcode::Stop
        | Opcode::Nop
        | Opcode::RotTwo
        | Opcode::RotThree
        | Opcode::RotFour
        | Opcode::JumpForward
        | Opcode::JumpAbsolute
        | Opcode::JumpIfTrue
        | Opcode::JumpIfFalse
        | Opcode::JumpIfFirstTrue
        | Opcode::JumpIfFirstFalse
        | Opcode::SetupLoop
        | Opcode::SetupElseLoop
        | Opcode::SetupExcept
        | Opcode::PopBlock
        | Opcode::BreakLoop
        | Opcode::BreakelseLoop
        | Opcode::ContinueLoop
        | Opcode::EndFinally
        | Opcode::DeleteGlobal => (0, 0),
        Opcode::LoadAttrib | Opcode::IterReset => (1, 1),
        Opcode::PopTop | Opcode::StoreId | Opcode::StoreGlobal | Opcode::Return | Opcode::Throw => (1, 0),
        Opcode::DupTop => (1, 2),
        Opcode::DupTopx => (arg(0), 2 * arg(0)),
        Opcode::LoadConst | Opcode::LoadId | Opcode::LoadGlobal => (0, 1),
        Opcode::StoreAttrib => (2, 0),
        Opcode::Operator | Opcode::InplaceOpr | Opcode::CompareOp | Opcode::Import => (2, 1),
        Opcode::Call => (arg(0) + 1, 1),
        Opcode::BuildTuple => (arg(0), 1),
        Opcode::BuildDatastruct => (arg(0) + 1, 1),
        Opcode::IterFetch => (1, 4),
        Opcode::BuildAttrib => {
            if instr.operands[0] == AttribKind::Method as u16 {
                (4 + 3 * arg(1), 1)
            } else {
                (3, 1)
            }
        }
        Opcode::BuildClass | Opcode::BuildInterface => (3 + arg(1) + 2 * arg(0), 1),
    };
    let base = depth.checked_sub(pops).ok_or(StackError::Underflow { offset: instr.offset })?;
    Ok(base + pushes)
}

/// Queues the successors of `instr`.
fn step(instr: &Instruction, depth: usize, mut blocks: Vec<SimBlock>, work: &mut Vec<State>) -> Result<(), StackError> {
    let next = instr.end();
    let no_block = || StackError::NoBlock {
        offset: instr.offset,
        opcode: instr.opcode,
    };
    match instr.opcode {
        Opcode::Stop | Opcode::Return | Opcode::Throw => {}
        Opcode::JumpForward | Opcode::JumpAbsolute => work.push(State {
            ip: instr.jump_target(0),
            depth,
            blocks,
        }),
        Opcode::JumpIfTrue | Opcode::JumpIfFalse | Opcode::JumpIfFirstTrue | Opcode::JumpIfFirstFalse => {
            work.push(State {
                ip: instr.jump_target(0),
                depth,
                blocks: blocks.clone(),
            });
            work.push(State { ip: next, depth, blocks });
        }
        Opcode::SetupLoop | Opcode::SetupElseLoop => {
            let end = instr.jump_target(0);
            let otherwise = (instr.opcode == Opcode::SetupElseLoop).then(|| instr.jump_target(1));
            work.push(State {
                ip: end,
                depth,
                blocks: blocks.clone(),
            });
            if let Some(otherwise) = otherwise {
                work.push(State {
                    ip: otherwise,
                    depth,
                    blocks: blocks.clone(),
                });
            }
            blocks.push(SimBlock::Loop {
                sp: depth,
                head: next,
                end,
                otherwise,
            });
            work.push(State { ip: next, depth, blocks });
        }
        Opcode::SetupExcept => {
            blocks.push(SimBlock::Except { sp: depth });
            for slot in [0, 1] {
                work.push(State {
                    ip: instr.jump_target(slot),
                    depth: depth + 1,
                    blocks: blocks.clone(),
                });
            }
            work.push(State { ip: next, depth, blocks });
        }
        Opcode::PopBlock => {
            blocks.pop().ok_or_else(no_block)?;
            work.push(State { ip: next, depth, blocks });
        }
        Opcode::EndFinally => {
            let block = blocks.pop().ok_or_else(no_block)?;
            work.push(State {
                ip: next,
                depth: block.sp(),
                blocks,
            });
        }
        Opcode::BreakLoop | Opcode::BreakelseLoop => {
            while let Some(block) = blocks.pop() {
                if let SimBlock::Loop { sp, end, otherwise, .. } = block {
                    let target = if instr.opcode == Opcode::BreakelseLoop {
                        otherwise.unwrap_or(end)
                    } else {
                        end
                    };
                    work.push(State {
                        ip: target,
                        depth: sp,
                        blocks,
                    });
                    return Ok(());
                }
            }
            return Err(no_block());
        }
        Opcode::ContinueLoop => {
            // The target loop is the innermost one whose body contains the target;
            // switch blocks in between are discarded.
            let target = instr.jump_target(0);
            let idx = blocks
                .iter()
                .rposition(|block| match block {
                    SimBlock::Loop { head, end, .. } => (*head..*end).contains(&target),
                    SimBlock::Except { .. } => false,
                })
                .ok_or_else(no_block)?;
            let sp = blocks[idx].sp();
            blocks.truncate(idx + 1);
            work.push(State {
                ip: target,
                depth: sp,
                blocks,
            });
        }
        _ => work.push(State { ip: next, depth, blocks }),
    }
    Ok(())
}
