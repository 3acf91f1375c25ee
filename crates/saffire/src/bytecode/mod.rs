//! Bytecode representation for Saffire.
//!
//! # Module Structure
//!
//! - `op` - Opcode enum definitions and operand layout
//! - `code` - The bytecode unit, instruction decoding and load-time validation
//! - `lineno` - Varint-encoded offset to line table
//! - `stack` - Max stack depth by control-flow simulation
//! - `assembler` - Symbolic frames to bytes, with label backpatching
//! - `marshal` - The binary `.sfc` container

pub use assembler::{AssembleError, AssembleOptions, assemble};
pub use code::{Bytecode, Constant, Instruction, LoadError, resolve_target};
pub use lineno::LineTable;
pub use marshal::{FLAG_COMPRESSED, FLAG_SIGNED, Header, MAGIC, MarshalOptions, VERSION, deserialize, read_header, serialize};
pub use op::{MAX_BLOCK_DEPTH, OperandKind, Opcode};
pub use stack::StackError;

mod assembler;
mod code;
mod lineno;
mod marshal;
mod op;
mod stack;
