//! Crate-wide error taxonomy.
//!
//! Disposition follows the policy table in the design doc: `DecodeFailure`
//! never reaches here (the unroller swallows it and returns what it has),
//! everything else is fatal and propagates with `?` up to `main`.

use thiserror::Error;

use crate::opcode::VirtualOpcode;

/// Errors surfaced by the core devirtualization pipeline.
#[derive(Debug, Error)]
pub enum DevirtError {
    /// No matcher predicate matched the handler routine at `vip`.
    #[error("unrecognized handler at vip 0x{vip:016x}")]
    UnrecognizedHandler { vip: u64 },

    /// `extract_jcc_key` could not find the expected `ror rax, cl` /
    /// `mov rcx, imm` anchor pair; the handler isn't the expected `Jnz` shape.
    #[error("malformed Jnz handler at vip 0x{vip:016x}: {reason}")]
    MalformedJcc { vip: u64, reason: &'static str },

    /// A matcher emulator popped an empty symbolic stack.
    #[error("operand stack underflow in {op:?} handler at vip 0x{vip:016x}")]
    OperandUnderflow { vip: u64, op: VirtualOpcode },

    /// The emitter was asked to branch to a vip it never created a label for.
    #[error("emitter requested a label for vip 0x{vip:016x} that was never created")]
    MissingLabel { vip: u64 },

    /// Reading the target image or writing the patched output failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DevirtError>;
