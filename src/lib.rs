//! Devirtualizer for a stack-based VM embedded in an obfuscated x86-64
//! binary: traces a handler dispatch loop, recovers its virtual instruction
//! stream, and re-emits it as either native machine code or LLVM IR.

pub mod config;
pub mod decode;
pub mod driver;
pub mod emit;
pub mod error;
pub mod image;
pub mod keys;
pub mod matcher;
pub mod opcode;
pub mod routine;
pub mod vmstate;

pub use config::TargetConfig;
pub use error::{DevirtError, Result};
pub use opcode::{VirtualInstruction, VirtualOpcode};
