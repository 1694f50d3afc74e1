//! Component E — key extractor.

use zydis::{Mnemonic, Register};

use crate::decode::Operand;
use crate::error::{DevirtError, Result};
use crate::routine::Routine;

fn is_register(op: &Operand) -> bool {
    op.is_register()
}

fn is_immediate(op: &Operand) -> bool {
    op.immediate().is_some()
}

fn is_ror_reg_imm(instr: &crate::decode::DecodedInstruction) -> bool {
    instr.mnemonic == Mnemonic::ROR
        && instr.operand(0).is_register()
        && instr.operand(1).immediate().is_some()
}

/// Scans `routine` forward for its embedded ROR-based key updates: a
/// `ror reg, imm` whose immediate predecessor and successor are each any
/// `xor reg, reg`. That surrounding pattern is what distinguishes a
/// key-update site from an incidental `ror`.
///
/// Per the key-count law, the result has length 1 or 2 for any valid
/// non-terminal, non-branching handler (1 for `Jnz`/`Exit`, which don't
/// follow this path at all — see [`extract_jcc_key`]).
pub fn extract_ror_keys(routine: &Routine) -> Vec<u64> {
    let mut out = Vec::new();
    let mut from = 0;

    loop {
        let Some(index) = routine.next(&is_ror_reg_imm, from) else {
            break;
        };

        if index > 0 && index + 1 < routine.len() {
            let before = &routine[index - 1];
            let after = &routine[index + 1];
            let reg_reg = &[is_register as fn(&Operand) -> bool, is_register];
            if before.is(Mnemonic::XOR, reg_reg) && after.is(Mnemonic::XOR, reg_reg) {
                if let Some(imm) = routine[index].operand(1).immediate() {
                    out.push(imm);
                }
            }
        }

        from = index + 1;
    }

    out
}

/// Recovers the key used by a `Jnz` handler's conditional branch: from the
/// end of the routine, the last `ror rax, cl`, and just before that, the
/// nearest earlier `mov rcx, imm`.
pub fn extract_jcc_key(routine: &Routine) -> Result<u64> {
    let vip_hint = routine.get(0).map(|i| i.address).unwrap_or(0);

    let is_ror_rax_cl = |instr: &crate::decode::DecodedInstruction| {
        instr.mnemonic == Mnemonic::ROR
            && instr.operand(0).as_register() == Some(Register::RAX)
            && instr.operand(1).as_register() == Some(Register::CL)
    };
    let ror_index = routine.prev(&is_ror_rax_cl, None).ok_or(DevirtError::MalformedJcc {
        vip: vip_hint,
        reason: "missing `ror rax, cl`",
    })?;

    let is_mov_rcx_imm = |instr: &crate::decode::DecodedInstruction| {
        instr.mnemonic == Mnemonic::MOV
            && instr.operand(0).as_register() == Some(Register::RCX)
            && is_immediate(&instr.operand(1))
    };
    let load_index = if ror_index == 0 {
        None
    } else {
        routine.prev(&is_mov_rcx_imm, Some(ror_index - 1))
    }
    .ok_or(DevirtError::MalformedJcc {
        vip: vip_hint,
        reason: "missing `mov rcx, imm` before `ror rax, cl`",
    })?;

    routine[load_index]
        .operand(1)
        .immediate()
        .ok_or(DevirtError::MalformedJcc {
            vip: vip_hint,
            reason: "`mov rcx, imm` operand wasn't an immediate",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::MemoryReader;

    struct FixedMemory(Vec<u8>);

    impl MemoryReader for FixedMemory {
        fn read(&self, address: u64, len: usize) -> Vec<u8> {
            let start = address as usize;
            if start >= self.0.len() {
                return Vec::new();
            }
            let end = (start + len).min(self.0.len());
            self.0[start..end].to_vec()
        }
    }

    fn build_routine(bytes: &[u8]) -> Routine {
        let mem = FixedMemory(bytes.to_vec());
        crate::routine::unroll(&mem, 0)
    }

    #[test]
    fn single_key_update_site() {
        // xor rcx, rcx ; ror rcx, 0x17 ; xor r10, rcx ; ret
        let bytes = [
            0x48, 0x31, 0xC9, // xor rcx, rcx
            0x48, 0xC1, 0xC9, 0x17, // ror rcx, 0x17
            0x4C, 0x31, 0xD1, // xor rcx, r10  (order swapped vs spec comment, still xor reg,reg)
            0xC3, // ret
        ];
        let routine = build_routine(&bytes);
        let keys = extract_ror_keys(&routine);
        assert_eq!(keys, vec![0x17]);
    }

    #[test]
    fn incidental_ror_without_xor_bracket_is_excluded() {
        // ror rcx, 5 with no surrounding xor reg,reg
        let bytes = [0x48, 0xC1, 0xC9, 0x05, 0xC3];
        let routine = build_routine(&bytes);
        assert!(extract_ror_keys(&routine).is_empty());
    }

    #[test]
    fn jcc_key_requires_both_anchors() {
        let bytes = [0xC3]; // just ret, no ror rax,cl anywhere
        let routine = build_routine(&bytes);
        assert!(extract_jcc_key(&routine).is_err());
    }
}
