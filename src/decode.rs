//! Component A — native-instruction decoder.
//!
//! A thin wrapper around [`zydis::Decoder`] configured for 64-bit long mode.
//! Decoded instructions are copied out into an owned [`DecodedInstruction`]
//! immediately (mirroring `x86::instruction_t` in the original source, which
//! copies `raw` into its own `std::vector<uint8_t>`), so a [`Routine`] never
//! borrows from the target image.
//!
//! [`Routine`]: crate::routine::Routine

use zydis::{Decoder, MachineMode, Mnemonic, Register, StackWidth};

/// Longest possible x86-64 instruction encoding; the window we ask a
/// [`MemoryReader`] for on every decode.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Supplies raw bytes from the mapped target image.
///
/// This is the seam between the core (which only ever asks "give me up to N
/// bytes at this address") and the out-of-scope collaborator that actually
/// maps the target binary into the process (see [`crate::image`]).
pub trait MemoryReader {
    /// Returns up to `len` bytes starting at `address`, or fewer if that
    /// many aren't readable/mapped. An empty result means "not readable".
    fn read(&self, address: u64, len: usize) -> Vec<u8>;
}

/// One decoded operand, reduced to what the higher layers need: its kind,
/// and either the register it names, the base register of the memory
/// operand, or the immediate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Unused,
    Register(Register),
    Memory { base: Register },
    Pointer,
    Immediate(u64),
}

impl Operand {
    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register(_))
    }

    pub fn as_register(&self) -> Option<Register> {
        match self {
            Operand::Register(r) => Some(*r),
            _ => None,
        }
    }

    pub fn memory_base(&self) -> Option<Register> {
        match self {
            Operand::Memory { base } => Some(*base),
            _ => None,
        }
    }

    pub fn immediate(&self) -> Option<u64> {
        match self {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }
}

/// One decoded native x86-64 instruction. Immutable after construction,
/// owned by the [`crate::routine::Routine`] it belongs to.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub address: u64,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    pub raw_bytes: Vec<u8>,
}

impl DecodedInstruction {
    pub fn length(&self) -> usize {
        self.raw_bytes.len()
    }

    pub fn operand(&self, index: usize) -> Operand {
        self.operands.get(index).copied().unwrap_or(Operand::Unused)
    }

    /// True for every conditional jump mnemonic and the unconditional `jmp`
    /// (component B's definition of "branch").
    pub fn is_jmp(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::JB
                | Mnemonic::JBE
                | Mnemonic::JCXZ
                | Mnemonic::JECXZ
                | Mnemonic::JKNZD
                | Mnemonic::JKZD
                | Mnemonic::JL
                | Mnemonic::JLE
                | Mnemonic::JNB
                | Mnemonic::JNBE
                | Mnemonic::JMP
                | Mnemonic::JNL
                | Mnemonic::JNLE
                | Mnemonic::JNO
                | Mnemonic::JNP
                | Mnemonic::JNS
                | Mnemonic::JNZ
                | Mnemonic::JO
                | Mnemonic::JP
                | Mnemonic::JRCXZ
                | Mnemonic::JS
                | Mnemonic::JZ
        )
    }

    /// Whether this instruction is `mnemonic` with at least `kinds.len()`
    /// leading operands matching `kinds` by discriminant.
    pub fn is(&self, mnemonic: Mnemonic, kinds: &[fn(&Operand) -> bool]) -> bool {
        if self.mnemonic != mnemonic || self.operands.len() < kinds.len() {
            return false;
        }
        kinds
            .iter()
            .enumerate()
            .all(|(i, matches_kind)| matches_kind(&self.operands[i]))
    }
}

/// Decodes one instruction at `address` using bytes supplied by `reader`.
///
/// Returns `None` on decode failure (component A never panics on bad
/// bytes — the caller, [`crate::routine::unroll`], treats that as the soft
/// `DecodeFailure` condition from the error taxonomy).
pub fn decode(reader: &dyn MemoryReader, address: u64) -> Option<DecodedInstruction> {
    let window = reader.read(address, MAX_INSTRUCTION_LENGTH);
    if window.is_empty() {
        return None;
    }

    let decoder = Decoder::new(MachineMode::LONG_64, StackWidth::_64).ok()?;
    let insn = decoder.decode_first::<zydis::AllOperands>(&window).ok()??;

    let length = insn.length as usize;
    let operands = insn
        .operands()
        .iter()
        .map(|op| match op.ty {
            zydis::OperandType::REGISTER => Operand::Register(op.reg.value),
            zydis::OperandType::MEMORY => Operand::Memory { base: op.mem.base },
            zydis::OperandType::POINTER => Operand::Pointer,
            zydis::OperandType::IMMEDIATE => Operand::Immediate(op.imm.value.u),
            zydis::OperandType::UNUSED => Operand::Unused,
        })
        .collect();

    Some(DecodedInstruction {
        address,
        mnemonic: insn.mnemonic,
        operands,
        raw_bytes: window[..length].to_vec(),
    })
}

/// Largest enclosing GPR for `reg` (e.g. `AL` -> `RAX`).
pub fn extend(reg: Register) -> Register {
    use Register::*;
    match reg {
        AL | AH | AX | EAX | RAX => RAX,
        BL | BH | BX | EBX | RBX => RBX,
        CL | CH | CX | ECX | RCX => RCX,
        DL | DH | DX | EDX | RDX => RDX,
        SIL | SI | ESI | RSI => RSI,
        DIL | DI | EDI | RDI => RDI,
        BPL | BP | EBP | RBP => RBP,
        SPL | SP | ESP | RSP => RSP,
        R8B | R8W | R8D | R8 => R8,
        R9B | R9W | R9D | R9 => R9,
        R10B | R10W | R10D | R10 => R10,
        R11B | R11W | R11D | R11 => R11,
        R12B | R12W | R12D | R12 => R12,
        R13B | R13W | R13D | R13 => R13,
        R14B | R14W | R14D | R14 => R14,
        R15B | R15W | R15D | R15 => R15,
        other => other,
    }
}

/// True for `CS`/`DS`/`ES`/`FS`/`GS`/`SS`.
pub fn is_segment_selector(reg: Register) -> bool {
    matches!(
        reg,
        Register::CS | Register::DS | Register::ES | Register::FS | Register::GS | Register::SS
    )
}

/// Size in bytes of `reg`.
pub fn register_size_bytes(reg: Register) -> u16 {
    use Register::*;
    match reg {
        AL | BL | CL | DL | AH | BH | CH | DH | SIL | DIL | BPL | SPL | R8B | R9B | R10B
        | R11B | R12B | R13B | R14B | R15B => 1,
        AX | BX | CX | DX | SI | DI | BP | SP | R8W | R9W | R10W | R11W | R12W | R13W | R14W
        | R15W => 2,
        EAX | EBX | ECX | EDX | ESI | EDI | EBP | ESP | R8D | R9D | R10D | R11D | R12D | R13D
        | R14D | R15D => 4,
        RAX | RBX | RCX | RDX | RSI | RDI | RBP | RSP | R8 | R9 | R10 | R11 | R12 | R13 | R14
        | R15 => 8,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn decodes_ret() {
        let mem = FixedMemory(vec![0xC3]);
        let insn = decode(&mem, 0).expect("ret should decode");
        assert_eq!(insn.mnemonic, Mnemonic::RET);
        assert_eq!(insn.length(), 1);
    }

    #[test]
    fn decode_failure_returns_none() {
        let mem = FixedMemory(vec![]);
        assert!(decode(&mem, 0).is_none());
    }

    #[test]
    fn extend_returns_largest_enclosing_gpr() {
        assert_eq!(extend(Register::AL), Register::RAX);
        assert_eq!(extend(Register::R9D), Register::R9);
    }

    #[test]
    fn segment_selectors_are_recognized() {
        assert!(is_segment_selector(Register::FS));
        assert!(!is_segment_selector(Register::RAX));
    }

    #[test]
    fn register_sizes_match_width() {
        assert_eq!(register_size_bytes(Register::RAX), 8);
        assert_eq!(register_size_bytes(Register::EAX), 4);
        assert_eq!(register_size_bytes(Register::AL), 1);
    }
}
