//! Component F — opcode matcher.
//!
//! A fixed, ordered table of `(opcode, structural predicate, stack
//! emulator)` triples. `match_routine` returns the first opcode whose
//! predicate holds, then runs its emulator against the symbolic stack.
//! Declaration order is the tie-break and must match spec.md §4.F exactly —
//! this is implemented as a `Vec` built in that order (not a hash map, as
//! the original C++ used) so iteration order is a structural guarantee
//! rather than an incidental one. See DESIGN.md for the open-question
//! resolution this enables.

use crate::config::roles;
use crate::decode::{DecodedInstruction, Operand};
use crate::error::{DevirtError, Result};
use crate::opcode::{VirtualInstruction, VirtualOpcode};
use crate::routine::Routine;
use crate::vmstate::VmState;

type Predicate = fn(&Routine) -> bool;
type Emulator = fn(&mut VmState, &mut VirtualInstruction) -> Result<()>;

fn is_register(op: &Operand) -> bool {
    op.is_register()
}

fn is_pop_reg(instr: &DecodedInstruction) -> bool {
    instr.mnemonic == zydis::Mnemonic::POP && instr.operand(0).is_register()
}

fn is_push_reg(instr: &DecodedInstruction) -> bool {
    instr.mnemonic == zydis::Mnemonic::PUSH && instr.operand(0).is_register()
}

fn nth_pop(routine: &Routine, n: usize) -> Option<usize> {
    let mut from = 0;
    let mut found = None;
    for _ in 0..n {
        found = routine.next(&is_pop_reg, from);
        from = found? + 1;
    }
    found
}

fn pop_stack(state: &mut VmState, instr: &VirtualInstruction) -> Result<()> {
    state.stack.pop().map(|_| ()).ok_or(DevirtError::OperandUnderflow {
        vip: instr.vip,
        op: instr.op,
    })
}

// --- PopVreg ---
// mov rcx, [r8] ; add r8, 8 ; xor rcx, r10 ; ror rcx, imm ; xor r10, rcx
// pop qword ptr [r9+rcx*8]
fn pred_pop_vreg(routine: &Routine) -> bool {
    routine
        .next(
            &|instr| {
                instr.mnemonic == zydis::Mnemonic::POP
                    && instr.operand(0).memory_base() == Some(roles::VREG_BASE)
            },
            0,
        )
        .is_some()
}

fn emu_pop_vreg(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    pop_stack(state, instr)
}

// --- PushVreg ---
// same decrypt prologue, then push qword ptr [r9+rcx*8]
fn pred_push_vreg(routine: &Routine) -> bool {
    routine
        .next(
            &|instr| {
                instr.mnemonic == zydis::Mnemonic::PUSH
                    && instr.operand(0).memory_base() == Some(roles::VREG_BASE)
            },
            0,
        )
        .is_some()
}

fn emu_push_vreg(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    state.stack.push(instr.operand);
    Ok(())
}

// --- PushConst ---
// same prologue, then push reg, whose predecessor is `xor reg, reg` and
// whose successor is not `ret` — that pair of constraints is what tells
// PushConst apart from PushVreg/Exit (both also end in pushes/pops of a
// plain register).
fn pred_push_const(routine: &Routine) -> bool {
    let Some(index) = routine.next(&is_push_reg, 0) else {
        return false;
    };
    if index == 0 {
        return false;
    }
    let reg_reg: &[fn(&Operand) -> bool] = &[is_register, is_register];
    let predecessor_is_xor = routine[index - 1].is(zydis::Mnemonic::XOR, reg_reg);
    let successor_is_ret = routine
        .get(index + 1)
        .map(|i| i.mnemonic == zydis::Mnemonic::RET)
        .unwrap_or(false);
    predecessor_is_xor && !successor_is_ret
}

fn emu_push_const(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    state.stack.push(instr.operand);
    Ok(())
}

// --- Read8 ---
// pop rax ; movzx rax, byte ptr [rax] ; push rax
fn pred_read8(routine: &Routine) -> bool {
    routine
        .next(
            &|instr| {
                instr.mnemonic == zydis::Mnemonic::MOVZX
                    && instr.operand(1).memory_base() == Some(zydis::Register::RAX)
            },
            0,
        )
        .is_some()
}

fn emu_read8(_state: &mut VmState, _instr: &mut VirtualInstruction) -> Result<()> {
    // Net stack effect of a load handler is zero: pop address, push value.
    Ok(())
}

// --- Read64 ---
// pop rax ; mov rax, [rax] ; push rax
fn pred_read64(routine: &Routine) -> bool {
    routine
        .next(
            &|instr| {
                instr.mnemonic == zydis::Mnemonic::MOV
                    && instr.operand(1).memory_base() == Some(zydis::Register::RAX)
                    && instr.operand(0).as_register() == Some(zydis::Register::RAX)
            },
            0,
        )
        .is_some()
}

fn emu_read64(_state: &mut VmState, _instr: &mut VirtualInstruction) -> Result<()> {
    Ok(())
}

fn two_pops_then(routine: &Routine, mnemonic: zydis::Mnemonic, operand_count: usize) -> bool {
    let Some(first) = nth_pop(routine, 1) else {
        return false;
    };
    let Some(second) = nth_pop(routine, 2) else {
        return false;
    };
    debug_assert!(second > first);
    let reg_reg: &[fn(&Operand) -> bool] = &[is_register, is_register];
    match routine.get(second + 1) {
        Some(instr) => instr.is(mnemonic, &reg_reg[..operand_count]),
        None => false,
    }
}

// --- Add ---
// pop rax ; pop rbx ; add rax, rbx ; push rax
fn pred_add(routine: &Routine) -> bool {
    two_pops_then(routine, zydis::Mnemonic::ADD, 2)
}

fn emu_add(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    pop_stack(state, instr)
}

// --- Nand ---
// pop rax ; pop rbx ; and rax, rbx ; not rax ; push rax
fn pred_nand(routine: &Routine) -> bool {
    two_pops_then(routine, zydis::Mnemonic::AND, 2)
}

fn emu_nand(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    pop_stack(state, instr)
}

// --- Mul ---
// pop rax ; pop rbx ; mul rbx ; push rax
fn pred_mul(routine: &Routine) -> bool {
    two_pops_then(routine, zydis::Mnemonic::MUL, 1)
}

fn emu_mul(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    pop_stack(state, instr)
}

// --- Jnz ---
// pop rax ; pop rbx ; pop rdx ; pop rdi ; pop rsi ; cmp rax, rbx
// mov rcx, imm ; cmovnz r10, rdx ; cmovnz r8, rdi ; cmovnz rcx, rsi
fn pred_jnz(routine: &Routine) -> bool {
    if nth_pop(routine, 4).is_none() {
        return false;
    }
    routine
        .next(&|instr| instr.mnemonic == zydis::Mnemonic::CMOVNZ, 0)
        .is_some()
}

fn emu_jnz(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    let underflow = || DevirtError::OperandUnderflow {
        vip: instr.vip,
        op: instr.op,
    };
    state.stack.pop().ok_or_else(underflow)?;
    state.stack.pop().ok_or_else(underflow)?;
    state.stack.pop().ok_or_else(underflow)?;
    instr.operand = *state.stack.last().ok_or_else(underflow)?;
    state.stack.pop();
    state.stack.pop().ok_or_else(underflow)?;
    Ok(())
}

// --- Exit ---
// 15 consecutive pops followed by ret.
fn pred_exit(routine: &Routine) -> bool {
    nth_pop(routine, crate::config::REGISTER_SLOT_COUNT).is_some()
}

fn emu_exit(state: &mut VmState, instr: &mut VirtualInstruction) -> Result<()> {
    for _ in 0..crate::config::REGISTER_SLOT_COUNT {
        pop_stack(state, instr)?;
    }
    Ok(())
}

fn table() -> Vec<(VirtualOpcode, Predicate, Emulator)> {
    vec![
        (VirtualOpcode::PopVreg, pred_pop_vreg, emu_pop_vreg),
        (VirtualOpcode::PushVreg, pred_push_vreg, emu_push_vreg),
        (VirtualOpcode::PushConst, pred_push_const, emu_push_const),
        (VirtualOpcode::Read8, pred_read8, emu_read8),
        (VirtualOpcode::Read64, pred_read64, emu_read64),
        (VirtualOpcode::Add, pred_add, emu_add),
        (VirtualOpcode::Nand, pred_nand, emu_nand),
        (VirtualOpcode::Mul, pred_mul, emu_mul),
        (VirtualOpcode::Jnz, pred_jnz, emu_jnz),
        (VirtualOpcode::Exit, pred_exit, emu_exit),
    ]
}

/// Classifies `routine` as one of the closed opcode set, running the
/// winning emulator against `state.stack` as a side effect. Returns an
/// `Invalid`-opcode instruction if no predicate holds — that's not an
/// error by itself (the driver decides what to do with it).
pub fn match_routine(state: &mut VmState, routine: &Routine, operand: u64) -> Result<VirtualInstruction> {
    for (op, predicate, emulator) in table() {
        if predicate(routine) {
            let mut instr = VirtualInstruction { op, vip: 0, operand };
            emulator(state, &mut instr)?;
            return Ok(instr);
        }
    }
    Ok(VirtualInstruction::invalid(operand))
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
    fn matches_add_and_reduces_stack() {
        // pop rax ; pop rbx ; add rax, rbx ; push rax ; ret
        let bytes = [
            0x58, // pop rax
            0x5B, // pop rbx
            0x48, 0x01, 0xD8, // add rax, rbx
            0x50, // push rax
            0xC3, // ret
        ];
        let routine = build_routine(&bytes);
        let mut state = VmState::new(0, 0);
        let depth_before = state.stack.len();
        let instr = match_routine(&mut state, &routine, 0).unwrap();
        assert_eq!(instr.op, VirtualOpcode::Add);
        assert_eq!(state.stack.len(), depth_before - 1);
    }

    #[test]
    fn exit_vs_jnz_disambiguation() {
        // 15 pops then ret -> Exit
        let mut bytes = Vec::new();
        for reg in [
            0x5F_u8, 0x5E, 0x5D, 0x5C, 0x5B, 0x59, 0x58, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41,
            0x41,
        ] {
            // A loose mix of single-byte pops (58..5F) and REX-prefixed pops
            // (41 5x) is enough to give us fifteen `pop reg` instructions.
            if reg == 0x41 {
                bytes.push(0x41);
                bytes.push(0x58);
            } else {
                bytes.push(reg);
            }
        }
        bytes.push(0xC3);
        let routine = build_routine(&bytes);
        let mut state = VmState::new(0, 0);
        state.stack = vec![0; 15];
        let instr = match_routine(&mut state, &routine, 0).unwrap();
        assert_eq!(instr.op, VirtualOpcode::Exit);
    }

    #[test]
    fn no_match_yields_invalid() {
        let bytes = [0x90, 0xC3]; // nop ; ret
        let routine = build_routine(&bytes);
        let mut state = VmState::new(0, 0);
        let instr = match_routine(&mut state, &routine, 0).unwrap();
        assert_eq!(instr.op, VirtualOpcode::Invalid);
    }

    #[test]
    fn underflow_is_reported() {
        // `add` structural shape with an empty symbolic stack must error,
        // not panic.
        let bytes = [0x58, 0x5B, 0x48, 0x01, 0xD8, 0x50, 0xC3];
        let routine = build_routine(&bytes);
        let mut state = VmState::new(0, 0);
        state.stack.clear();
        assert!(match_routine(&mut state, &routine, 0).is_err());
    }
}
