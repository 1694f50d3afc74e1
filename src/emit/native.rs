//! Native x86-64 backend — grounded on `vm_jit/jitter/jitter.cpp`'s
//! asmjit-based compiler, adapted to hand-rolled encoding (no asmjit
//! equivalent is available in the dependency set).
//!
//! The original leans on asmjit's `x86::Compiler` for both virtual-register
//! allocation and instruction encoding; neither exists here, so this backend
//! takes the simplest allocator that's still correct: every symbolic stack
//! value lives in its own 8-byte slot of a fixed-size frame addressed
//! `[rsp + disp32]`, and a pair of scratch GPRs do the actual arithmetic.
//! `RSP` is deliberately never one of the fifteen virtualized physical
//! registers (see `ENTRY_ORDER` below), so it's the one register safe to use
//! as a frame base without colliding with the VM's own register file — no
//! save/restore dance is needed the way it would be for any of the fifteen.
//!
//! Compilation happens in two passes: `add` just appends pseudo-ops (every
//! op has a fixed, address-independent byte length, `Jnz` included, since it
//! always takes the 6-byte `0F 85 rel32` form); `compile` sizes the whole
//! stream to learn every label's offset, then encodes, patching `Jnz`
//! displacements against the now-known offsets. A `Jnz` target whose vip
//! never appears as its own instruction is a dead branch — trapped with
//! `int3`, exactly as `jitter::compile()` does for branches into code this
//! single dynamic trace never reached.

use std::collections::HashSet;

use crate::config::REGISTER_SLOT_COUNT;
use crate::emit::{Artifact, Emitter, LabelTable, SymbolicStack};
use crate::error::Result;
use crate::opcode::{VirtualInstruction, VirtualOpcode};

/// Frame size in bytes reserved for VREGs + spill slots. Bounds how many
/// distinct symbolic values a single devirtualized routine can carry;
/// asmjit's compiler has no such bound since it allocates virtual registers
/// on demand, but a fixed generous frame is simpler and the handler shapes
/// this crate targets don't come close to exhausting it.
const FRAME_SIZE: i32 = 0x1_0000;

mod reg {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const R13: u8 = 13;
    pub const R14: u8 = 14;
    pub const R15: u8 = 15;
}

fn rex_w(r: u8, x: u8, b: u8) -> u8 {
    0x48 | (((r >> 3) & 1) << 2) | (((x >> 3) & 1) << 1) | ((b >> 3) & 1)
}

fn modrm(md: u8, reg_field: u8, rm: u8) -> u8 {
    (md << 6) | ((reg_field & 7) << 3) | (rm & 7)
}

/// `[base + disp32]`, with the SIB byte RSP/R12 addressing requires.
fn mem_disp32(reg_field: u8, base: u8, disp: i32) -> Vec<u8> {
    let mut out = vec![modrm(2, reg_field, base)];
    if base & 7 == 4 {
        out.push(0x24); // scale=0, index=none, base=rsp/r12
    }
    out.extend_from_slice(&disp.to_le_bytes());
    out
}

/// `[base]`, disp8=0 form — used for pointer dereferences where `base` is
/// whatever scratch register is holding a VM-level pointer value, not the
/// frame.
fn mem_disp8_zero(reg_field: u8, base: u8) -> Vec<u8> {
    let mut out = vec![modrm(1, reg_field, base)];
    if base & 7 == 4 {
        out.push(0x24);
    }
    out.push(0x00);
    out
}

fn mov_reg_reg(dst: u8, src: u8) -> Vec<u8> {
    vec![rex_w(src, 0, dst), 0x89, modrm(3, src, dst)]
}

fn frame_load(dst: u8, disp: i32) -> Vec<u8> {
    let mut out = vec![rex_w(dst, 0, reg::RSP), 0x8B];
    out.extend(mem_disp32(dst, reg::RSP, disp));
    out
}

fn frame_store(disp: i32, src: u8) -> Vec<u8> {
    let mut out = vec![rex_w(src, 0, reg::RSP), 0x89];
    out.extend(mem_disp32(src, reg::RSP, disp));
    out
}

fn load_indirect(dst: u8, base: u8) -> Vec<u8> {
    let mut out = vec![rex_w(dst, 0, base), 0x8B];
    out.extend(mem_disp8_zero(dst, base));
    out
}

fn movzx_byte_indirect(dst: u8, base: u8) -> Vec<u8> {
    let mut out = vec![rex_w(dst, 0, base), 0x0F, 0xB6];
    out.extend(mem_disp8_zero(dst, base));
    out
}

fn mov_imm64(dst: u8, imm: u64) -> Vec<u8> {
    let mut out = vec![rex_w(0, 0, dst), 0xB8 | (dst & 7)];
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

fn add_reg_reg(dst: u8, src: u8) -> Vec<u8> {
    vec![rex_w(src, 0, dst), 0x01, modrm(3, src, dst)]
}

fn and_reg_reg(dst: u8, src: u8) -> Vec<u8> {
    vec![rex_w(src, 0, dst), 0x21, modrm(3, src, dst)]
}

fn not_reg(r: u8) -> Vec<u8> {
    vec![rex_w(0, 0, r), 0xF7, modrm(3, 2, r)]
}

/// `mul r`: `RDX:RAX = RAX * r`.
fn mul_reg(r: u8) -> Vec<u8> {
    vec![rex_w(0, 0, r), 0xF7, modrm(3, 4, r)]
}

fn cmp_reg_reg(a: u8, b: u8) -> Vec<u8> {
    vec![rex_w(b, 0, a), 0x39, modrm(3, b, a)]
}

fn ret() -> Vec<u8> {
    vec![0xC3]
}

fn int3() -> Vec<u8> {
    vec![0xCC]
}

/// `sub rsp, imm32` (ext=5) / `add rsp, imm32` (ext=0).
fn rsp_imm32(opcode_ext: u8, imm: i32) -> Vec<u8> {
    let mut out = vec![rex_w(0, 0, reg::RSP), 0x81, modrm(3, opcode_ext, reg::RSP)];
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

const JNZ_LEN: i32 = 6;

enum PseudoOp {
    /// Binds a label to the offset this op occupies — the first instruction
    /// of every recovered handler gets one.
    Label(u64),
    Load { dst: u8, disp: i32 },
    Store { disp: i32, src: u8 },
    LoadIndirect { dst: u8, base: u8 },
    MovzxByteIndirect { dst: u8, base: u8 },
    Imm64 { dst: u8, imm: u64 },
    AddRegReg(u8, u8),
    AndRegReg(u8, u8),
    NotReg(u8),
    MulReg(u8),
    CmpRegReg(u8, u8),
    SubRsp,
    AddRsp,
    Jnz(u64),
    Int3,
    Ret,
}

impl PseudoOp {
    /// Byte length, independent of final label offsets — every op (`Jnz`
    /// included, always the 6-byte `rel32` form) has a fixed size.
    fn len(&self) -> i32 {
        match self {
            PseudoOp::Label(_) => 0,
            PseudoOp::Jnz(_) => JNZ_LEN,
            PseudoOp::Int3 => 1,
            PseudoOp::Ret => 1,
            PseudoOp::SubRsp | PseudoOp::AddRsp => rsp_imm32(5, FRAME_SIZE).len() as i32,
            PseudoOp::Load { dst, disp } => frame_load(*dst, *disp).len() as i32,
            PseudoOp::Store { disp, src } => frame_store(*disp, *src).len() as i32,
            PseudoOp::LoadIndirect { dst, base } => load_indirect(*dst, *base).len() as i32,
            PseudoOp::MovzxByteIndirect { dst, base } => movzx_byte_indirect(*dst, *base).len() as i32,
            PseudoOp::Imm64 { dst, imm } => mov_imm64(*dst, *imm).len() as i32,
            PseudoOp::AddRegReg(dst, src) => add_reg_reg(*dst, *src).len() as i32,
            PseudoOp::AndRegReg(dst, src) => and_reg_reg(*dst, *src).len() as i32,
            PseudoOp::NotReg(r) => not_reg(*r).len() as i32,
            PseudoOp::MulReg(r) => mul_reg(*r).len() as i32,
            PseudoOp::CmpRegReg(a, b) => cmp_reg_reg(*a, *b).len() as i32,
        }
    }

    /// Encodes everything except `Jnz`, whose displacement is filled in by
    /// the caller once every label's final offset is known.
    fn encode(&self) -> Vec<u8> {
        match *self {
            PseudoOp::Label(_) => Vec::new(),
            PseudoOp::Load { dst, disp } => frame_load(dst, disp),
            PseudoOp::Store { disp, src } => frame_store(disp, src),
            PseudoOp::LoadIndirect { dst, base } => load_indirect(dst, base),
            PseudoOp::MovzxByteIndirect { dst, base } => movzx_byte_indirect(dst, base),
            PseudoOp::Imm64 { dst, imm } => mov_imm64(dst, imm),
            PseudoOp::AddRegReg(dst, src) => add_reg_reg(dst, src),
            PseudoOp::AndRegReg(dst, src) => and_reg_reg(dst, src),
            PseudoOp::NotReg(r) => not_reg(r),
            PseudoOp::MulReg(r) => mul_reg(r),
            PseudoOp::CmpRegReg(a, b) => cmp_reg_reg(a, b),
            PseudoOp::SubRsp => rsp_imm32(5, FRAME_SIZE),
            PseudoOp::AddRsp => rsp_imm32(0, FRAME_SIZE),
            PseudoOp::Int3 => int3(),
            PseudoOp::Ret => ret(),
            PseudoOp::Jnz(_) => unreachable!("Jnz is encoded specially in compile()"),
        }
    }
}

/// Scratch physical registers used to shuttle values through memory. `RAX`
/// and `RDX` are reserved for `Mul`'s hardware semantics; these two are free
/// picks that don't double as the frame base (`RSP`).
const SCRATCH_0: u8 = reg::RBX;
const SCRATCH_1: u8 = reg::RCX;

/// Order the entry-state snapshot is captured in, mirroring
/// `jitter::jitter()`'s fifteen `virtual_push` calls exactly.
const ENTRY_ORDER: [u8; REGISTER_SLOT_COUNT] = [
    reg::RAX,
    reg::RBX,
    reg::RCX,
    reg::RDX,
    reg::RDI,
    reg::RSI,
    reg::RBP,
    reg::R8,
    reg::R9,
    reg::R10,
    reg::R11,
    reg::R12,
    reg::R13,
    reg::R14,
    reg::R15,
];

/// `Exit`'s physical destinations, in the order `jitter.cpp`'s `Exit`
/// handler assigns them — r15 down to rbx; the fifteenth (and last) pop
/// becomes the return value, loaded into `rax` immediately after.
const EXIT_ORDER: [u8; REGISTER_SLOT_COUNT - 1] = [
    reg::R15,
    reg::R14,
    reg::R13,
    reg::R12,
    reg::R11,
    reg::R10,
    reg::R9,
    reg::R8,
    reg::RBP,
    reg::RSI,
    reg::RDI,
    reg::RDX,
    reg::RCX,
    reg::RBX,
];

/// Register-allocating native-code emitter: lowers the recovered virtual
/// instruction stream directly to x86-64 machine code.
pub struct NativeEmitter {
    ops: Vec<PseudoOp>,
    stack: SymbolicStack<usize>,
    next_slot: usize,
    bound_vips: HashSet<u64>,
}

impl NativeEmitter {
    pub fn new() -> Self {
        let mut emitter = NativeEmitter {
            ops: Vec::new(),
            stack: SymbolicStack::new(),
            next_slot: REGISTER_SLOT_COUNT,
            bound_vips: HashSet::new(),
        };
        emitter.emit_entry();
        emitter
    }

    fn frame_offset(slot: usize) -> i32 {
        (slot as i32) * 8
    }

    fn vreg_offset(index: u64) -> i32 {
        Self::frame_offset(index as usize)
    }

    fn alloc_slot(&mut self) -> usize {
        let slot = self.next_slot;
        self.next_slot += 1;
        slot
    }

    /// `sub rsp, FRAME_SIZE`, then snapshot the fifteen live physical
    /// registers straight into frame slots 0..15 — the same slots `PopVreg`/
    /// `PushVreg` index by VREG number, matching the original, where the
    /// VM's 15 registers and the entry snapshot share one address space.
    fn emit_entry(&mut self) {
        self.ops.push(PseudoOp::SubRsp);
        for (slot, &physical) in ENTRY_ORDER.iter().enumerate() {
            self.ops.push(PseudoOp::Store {
                disp: Self::frame_offset(slot),
                src: physical,
            });
            self.stack.push(slot);
        }
    }

    fn pop_to(&mut self, instr: &VirtualInstruction, dst: u8) -> Result<()> {
        let slot = self.stack.pop(instr.vip, instr.op)?;
        self.ops.push(PseudoOp::Load {
            dst,
            disp: Self::frame_offset(slot),
        });
        Ok(())
    }

    fn push_from(&mut self, src: u8) {
        let slot = self.alloc_slot();
        self.ops.push(PseudoOp::Store {
            disp: Self::frame_offset(slot),
            src,
        });
        self.stack.push(slot);
    }
}

impl Default for NativeEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for NativeEmitter {
    fn add(&mut self, instr: VirtualInstruction) -> Result<()> {
        debug_assert!(
            self.bound_vips.insert(instr.vip),
            "handler at vip 0x{:016x} visited twice by the driver — this backend \
             binds one label per vip and can't devirtualize looping bytecode",
            instr.vip
        );
        self.ops.push(PseudoOp::Label(instr.vip));

        match instr.op {
            VirtualOpcode::PopVreg => {
                self.pop_to(&instr, SCRATCH_0)?;
                self.ops.push(PseudoOp::Store {
                    disp: Self::vreg_offset(instr.operand),
                    src: SCRATCH_0,
                });
            }
            VirtualOpcode::PushVreg => {
                self.ops.push(PseudoOp::Load {
                    dst: SCRATCH_0,
                    disp: Self::vreg_offset(instr.operand),
                });
                self.push_from(SCRATCH_0);
            }
            VirtualOpcode::PushConst => {
                self.ops.push(PseudoOp::Imm64 {
                    dst: SCRATCH_0,
                    imm: instr.operand,
                });
                self.push_from(SCRATCH_0);
            }
            VirtualOpcode::Read8 => {
                self.pop_to(&instr, SCRATCH_0)?;
                self.ops.push(PseudoOp::MovzxByteIndirect {
                    dst: SCRATCH_1,
                    base: SCRATCH_0,
                });
                self.push_from(SCRATCH_1);
            }
            VirtualOpcode::Read64 => {
                self.pop_to(&instr, SCRATCH_0)?;
                self.ops.push(PseudoOp::LoadIndirect {
                    dst: SCRATCH_1,
                    base: SCRATCH_0,
                });
                self.push_from(SCRATCH_1);
            }
            VirtualOpcode::Add => {
                self.pop_to(&instr, SCRATCH_0)?;
                self.pop_to(&instr, SCRATCH_1)?;
                self.ops.push(PseudoOp::AddRegReg(SCRATCH_0, SCRATCH_1));
                self.push_from(SCRATCH_0);
            }
            VirtualOpcode::Nand => {
                self.pop_to(&instr, SCRATCH_0)?;
                self.pop_to(&instr, SCRATCH_1)?;
                self.ops.push(PseudoOp::AndRegReg(SCRATCH_0, SCRATCH_1));
                self.ops.push(PseudoOp::NotReg(SCRATCH_0));
                self.push_from(SCRATCH_0);
            }
            VirtualOpcode::Mul => {
                // Preserve rax/rdx around the hardware `mul`, mirroring
                // jitter.cpp's t1/t2 save-and-restore.
                let save_rax = self.alloc_slot();
                self.ops.push(PseudoOp::Store {
                    disp: Self::frame_offset(save_rax),
                    src: reg::RAX,
                });
                let save_rdx = self.alloc_slot();
                self.ops.push(PseudoOp::Store {
                    disp: Self::frame_offset(save_rdx),
                    src: reg::RDX,
                });

                self.pop_to(&instr, reg::RAX)?;
                self.pop_to(&instr, SCRATCH_0)?;
                self.ops.push(PseudoOp::MulReg(SCRATCH_0));
                self.push_from(reg::RAX);

                self.ops.push(PseudoOp::Load {
                    dst: reg::RAX,
                    disp: Self::frame_offset(save_rax),
                });
                self.ops.push(PseudoOp::Load {
                    dst: reg::RDX,
                    disp: Self::frame_offset(save_rdx),
                });
            }
            VirtualOpcode::Jnz => {
                self.pop_to(&instr, SCRATCH_0)?; // cmp_r1
                self.pop_to(&instr, SCRATCH_1)?; // cmp_r2
                self.ops.push(PseudoOp::CmpRegReg(SCRATCH_0, SCRATCH_1));
                // new_rkey, new_bytecode, new_ror_key: popped for their
                // stack effect only, same as jitter.cpp's unused locals.
                self.pop_to(&instr, SCRATCH_0)?;
                self.pop_to(&instr, SCRATCH_0)?;
                self.pop_to(&instr, SCRATCH_0)?;
                self.ops.push(PseudoOp::Jnz(instr.operand));
            }
            VirtualOpcode::Exit => {
                for &dest in EXIT_ORDER.iter() {
                    self.pop_to(&instr, dest)?;
                }
                self.pop_to(&instr, reg::RAX)?;
                self.ops.push(PseudoOp::AddRsp);
                self.ops.push(PseudoOp::Ret);
            }
            VirtualOpcode::Invalid => {
                self.ops.push(PseudoOp::Int3);
            }
        }

        Ok(())
    }

    fn compile(&mut self) -> Result<Artifact> {
        let mut labels: LabelTable<i32> = LabelTable::new();
        let mut offset = 0i32;
        for op in &self.ops {
            if let PseudoOp::Label(vip) = op {
                labels.create_resolved(*vip, offset);
                labels.mark_resolved(*vip);
            }
            offset += op.len();
        }
        let code_len = offset;

        let mut next_dead_offset = code_len;
        for op in &self.ops {
            if let PseudoOp::Jnz(target) = op {
                if labels.get(*target).is_none() {
                    labels.create(*target, next_dead_offset);
                    next_dead_offset += 1;
                }
            }
        }

        let mut buffer = Vec::with_capacity(next_dead_offset as usize);
        let mut cursor = 0i32;
        for op in &self.ops {
            match op {
                PseudoOp::Jnz(target) => {
                    let target_offset = labels.get_or_err(*target)?;
                    let rel = target_offset - (cursor + JNZ_LEN);
                    buffer.extend_from_slice(&[0x0F, 0x85]);
                    buffer.extend_from_slice(&rel.to_le_bytes());
                }
                other => buffer.extend(other.encode()),
            }
            cursor += op.len();
        }

        for _ in labels.dead_labels() {
            buffer.push(0xCC);
        }

        Ok(Artifact::Native(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(op: VirtualOpcode, vip: u64, operand: u64) -> VirtualInstruction {
        VirtualInstruction { op, vip, operand }
    }

    #[test]
    fn exit_lowers_to_rsp_restore_and_ret() {
        let mut emitter = NativeEmitter::new();
        emitter.add(instr(VirtualOpcode::Exit, 0x10, 0)).unwrap();
        let Artifact::Native(code) = emitter.compile().unwrap() else {
            panic!("expected native artifact");
        };
        assert_eq!(code.last(), Some(&0xC3));
    }

    #[test]
    fn push_const_then_pop_vreg_round_trips_through_memory() {
        let mut emitter = NativeEmitter::new();
        emitter.add(instr(VirtualOpcode::PushConst, 0x10, 0xAB)).unwrap();
        emitter.add(instr(VirtualOpcode::PopVreg, 0x20, 3)).unwrap();
        emitter.add(instr(VirtualOpcode::Exit, 0x30, 0)).unwrap();
        let Artifact::Native(code) = emitter.compile().unwrap() else {
            panic!("expected native artifact");
        };
        assert!(!code.is_empty());
    }

    #[test]
    fn dead_jnz_target_is_trapped() {
        let mut emitter = NativeEmitter::new();
        for i in 0..5 {
            emitter.add(instr(VirtualOpcode::PushConst, i as u64 * 8, 0)).unwrap();
        }
        emitter.add(instr(VirtualOpcode::Jnz, 0x40, 0xDEAD_BEEF)).unwrap();
        let Artifact::Native(code) = emitter.compile().unwrap() else {
            panic!("expected native artifact");
        };
        assert_eq!(code.last(), Some(&0xCC));
    }

    #[test]
    fn underflow_propagates_as_error() {
        let mut emitter = NativeEmitter::new();
        for i in 0..REGISTER_SLOT_COUNT {
            emitter.add(instr(VirtualOpcode::PopVreg, i as u64 * 8, 0)).unwrap();
        }
        assert!(emitter
            .add(instr(VirtualOpcode::PopVreg, REGISTER_SLOT_COUNT as u64 * 8, 0))
            .is_err());
    }
}
