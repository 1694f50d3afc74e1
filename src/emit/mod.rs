//! Component H — emitter.
//!
//! Two interchangeable backends share this module's scaffolding: a
//! `vip -> label` table for branch targets (with forward references
//! tracked as dead branches until resolved), and a symbolic stack of
//! backend-specific value handles. Both backends implement [`Emitter`] and
//! perform the same stack-to-register virtualization-inverse transform,
//! differing only in what a "value" and a "label" are.

pub mod native;

#[cfg(feature = "ir-backend")]
pub mod ir;

use std::collections::HashMap;

use crate::error::{DevirtError, Result};
use crate::opcode::VirtualInstruction;

/// What `compile()` produces.
pub enum Artifact {
    /// Raw native code buffer, ready to be overlaid into the target image.
    Native(Vec<u8>),
    /// Textual LLVM IR module.
    Ir(String),
}

/// Shared emitter operation set. `add` is called once per recovered virtual
/// instruction, in VIP-sequence order; `compile` is called once at the end.
pub trait Emitter {
    fn add(&mut self, instr: VirtualInstruction) -> Result<()>;
    fn compile(&mut self) -> Result<Artifact>;
}

/// `vip -> label` bookkeeping shared by both backends. Labels created ahead
/// of the instruction that owns them (forward `Jnz` targets) are tracked in
/// `dead` until [`LabelTable::mark_resolved`] is called for that vip, so
/// `compile()` can terminate whatever of them are still unresolved.
pub struct LabelTable<L> {
    labels: HashMap<u64, L>,
    dead: Vec<u64>,
}

impl<L: Clone> LabelTable<L> {
    pub fn new() -> Self {
        LabelTable { labels: HashMap::new(), dead: Vec::new() }
    }

    pub fn get(&self, vip: u64) -> Option<L> {
        self.labels.get(&vip).cloned()
    }

    /// Creates and remembers a label for `vip`, marking it dead (a forward
    /// reference placeholder) until `mark_resolved(vip)` is called.
    pub fn create(&mut self, vip: u64, label: L) {
        self.labels.insert(vip, label.clone());
        self.dead.push(vip);
    }

    /// Creates and remembers a label for `vip` that is *not* a placeholder
    /// (this is the real instruction at that vip, not a forward reference).
    pub fn create_resolved(&mut self, vip: u64, label: L) {
        self.labels.insert(vip, label);
    }

    pub fn mark_resolved(&mut self, vip: u64) {
        self.dead.retain(|&v| v != vip);
    }

    pub fn get_or_err(&self, vip: u64) -> Result<L> {
        self.get(vip).ok_or(DevirtError::MissingLabel { vip })
    }

    pub fn dead_labels(&self) -> impl Iterator<Item = L> + '_ {
        self.dead.iter().filter_map(move |vip| self.labels.get(vip).cloned())
    }
}

/// A LIFO stack of backend-specific value handles — register names, SSA
/// value ids, whatever `H` is for that backend. Ownership is simple: the
/// stack owns the handles, `pop` transfers ownership to the caller for one
/// use.
pub struct SymbolicStack<H> {
    values: Vec<H>,
}

impl<H> SymbolicStack<H> {
    pub fn new() -> Self {
        SymbolicStack { values: Vec::new() }
    }

    pub fn push(&mut self, value: H) {
        self.values.push(value);
    }

    pub fn pop(&mut self, vip: u64, op: crate::opcode::VirtualOpcode) -> Result<H> {
        self.values.pop().ok_or(DevirtError::OperandUnderflow { vip, op })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

impl<H> Default for SymbolicStack<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Clone> Default for LabelTable<L> {
    fn default() -> Self {
        Self::new()
    }
}
