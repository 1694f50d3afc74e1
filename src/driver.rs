//! Component G — driver loop.
//!
//! The only mutator in the pipeline: decrypts the next handler pointer,
//! unrolls it, extracts its keys, classifies it, feeds the result to an
//! emitter, and updates the rolling key for the next iteration. Halts on
//! `Exit`, on `Invalid` (logged, then returned as an error), or on a
//! propagated extractor/matcher error.

use crate::config::TargetConfig;
use crate::decode::MemoryReader;
use crate::emit::Emitter;
use crate::error::{DevirtError, Result};
use crate::keys::{extract_jcc_key, extract_ror_keys};
use crate::matcher::match_routine;
use crate::opcode::VirtualOpcode;
use crate::routine::unroll;
use crate::vmstate::VmState;

/// Runs the devirtualization loop against `reader`, feeding every recovered
/// virtual instruction to `emitter` in VIP-sequence order.
pub fn run(reader: &dyn MemoryReader, config: &TargetConfig, emitter: &mut dyn Emitter) -> Result<()> {
    let mut state = VmState::new(config.bytecode_base, config.initial_key);
    let mut ror_key = config.initial_ror_key;

    loop {
        let saved_vip = state.vip;
        let next_handler_addr = state.decrypt_vip(reader, ror_key);
        let routine = unroll(reader, next_handler_addr);

        let ror_keys = extract_ror_keys(&routine);

        let operand = if ror_keys.len() == 2 {
            state.decrypt_vip(reader, ror_keys[0])
        } else {
            0
        };

        let mut instr = match_routine(&mut state, &routine, operand)?;
        instr.vip = saved_vip;

        tracing::debug!(vip = format!("0x{saved_vip:016x}"), op = ?instr.op, operand = instr.operand, "matched handler");

        emitter.add(instr)?;

        match instr.op {
            VirtualOpcode::Invalid => {
                routine.dump();
                return Err(DevirtError::UnrecognizedHandler { vip: saved_vip });
            }
            VirtualOpcode::Jnz => {
                ror_key = extract_jcc_key(&routine)?;
            }
            VirtualOpcode::Exit => break,
            _ => {
                ror_key = *ror_keys
                    .last()
                    .expect("key-count law: non-terminal handlers carry at least one ROR key");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::Artifact;

    struct RecordingEmitter {
        ops: Vec<VirtualOpcode>,
    }

    impl Emitter for RecordingEmitter {
        fn add(&mut self, instr: crate::opcode::VirtualInstruction) -> Result<()> {
            self.ops.push(instr.op);
            Ok(())
        }

        fn compile(&mut self) -> Result<Artifact> {
            Ok(Artifact::Native(Vec::new()))
        }
    }

    struct WordMemory(Vec<u64>);

    impl MemoryReader for WordMemory {
        fn read(&self, address: u64, len: usize) -> Vec<u8> {
            let index = (address / 8) as usize;
            if index >= self.0.len() {
                return Vec::new();
            }
            self.0[index].to_le_bytes()[..len.min(8)].to_vec()
        }
    }

    #[test]
    fn halts_on_exit() {
        // Bytecode word 0 decrypts (ror_key=0, rkey=0) to the handler
        // address, which we also place at word index 1 onward: a routine
        // made entirely of 15 pops then ret, classified as Exit.
        let mut words = vec![8u64]; // handler lives right after the bytecode word
        let mut code: Vec<u8> = Vec::new();
        for _ in 0..15 {
            code.push(0x58); // pop rax (reused byte is fine, only mnemonic matters)
        }
        code.push(0xC3); // ret
        // Lay code out starting at byte address 8, i.e. word index 1.
        while words.len() * 8 < 8 + code.len() {
            words.push(0);
        }
        let mem_bytes_len = words.len() * 8;
        let mut flat = vec![0u8; mem_bytes_len];
        for (i, w) in words.iter().enumerate() {
            flat[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        flat[8..8 + code.len()].copy_from_slice(&code);

        struct FlatMemory(Vec<u8>);
        impl MemoryReader for FlatMemory {
            fn read(&self, address: u64, len: usize) -> Vec<u8> {
                let start = address as usize;
                if start >= self.0.len() {
                    return Vec::new();
                }
                let end = (start + len).min(self.0.len());
                self.0[start..end].to_vec()
            }
        }

        let mem = FlatMemory(flat);
        let config = TargetConfig {
            bytecode_base: 0,
            initial_key: 0,
            initial_ror_key: 0,
            vm_entry_offset: 0,
        };
        let mut emitter = RecordingEmitter { ops: Vec::new() };
        run(&mem, &config, &mut emitter).expect("should devirtualize to Exit");
        assert_eq!(emitter.ops, vec![VirtualOpcode::Exit]);
    }
}
