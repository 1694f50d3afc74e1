//! Per-target tuning constants.
//!
//! The handler shape, matcher table, and opcode set are fixed by the VM
//! family this crate targets (spec.md's "non-goal: support for VM variants
//! other than the specific handler shape"). What *does* vary target to
//! target is where the bytecode stream starts, what key it starts under,
//! and where the VM entrypoint lives in the image file — those are
//! collected here instead of being baked into the driver loop.

/// Fixed physical-register role assignment used by the VM's dispatcher.
///
/// These are conventions fixed by the target VM, not configurable per the
/// design doc — unlike [`TargetConfig`], there is no CLI override for them.
pub mod roles {
    use zydis::Register;

    /// Carries the virtual instruction pointer.
    pub const VIP: Register = Register::R8;
    /// Base register for the 15-slot VREG array.
    pub const VREG_BASE: Register = Register::R9;
    /// Carries the rolling decryption key.
    pub const RKEY: Register = Register::R10;
}

/// Number of VREG slots / physical registers carried through the VM.
pub const REGISTER_SLOT_COUNT: usize = 15;

/// Tuning constants for one target binary.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    /// Virtual address of the first encrypted bytecode word.
    pub bytecode_base: u64,
    /// Rolling key the bytecode stream starts under.
    pub initial_key: u64,
    /// ROR key used to decrypt the very first handler pointer.
    pub initial_ror_key: u64,
    /// File offset of the VM entrypoint to overwrite in the native backend.
    pub vm_entry_offset: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            bytecode_base: 0x1400_6705_0,
            initial_key: 0x1337_DEAD_6969_CAFE,
            initial_ror_key: 5,
            vm_entry_offset: 0x2C07C,
        }
    }
}
