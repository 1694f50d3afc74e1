//! LLVM IR backend — grounded on `vm_jit/lifter/lifter.cpp`, using
//! `inkwell` in place of raw LLVM C++ APIs (the `inkwell`-based lifter in
//! `tomusdrw-wasm-pvm/src/llvm_backend/emitter.rs` is the model for how that
//! translation reads in idiomatic Rust).
//!
//! Values round-trip through module-level `i64` globals exactly as the
//! original does (`temp_reg()`/`vreg_N`), relying on the same `mem2reg` pass
//! at `compile()` to turn them back into SSA registers. Branch targets use
//! [`LabelTable`] keyed by vip, with `inkwell`'s `BasicBlock` as the label
//! type — a vip not yet seen gets a placeholder block and is tracked as a
//! dead branch, self-looped at `compile()` instead of trapped, matching
//! `lifter.cpp`'s `CreateBr(br)` terminator for unreached branches.
//!
//! The persisted register file is modelled as `lifter.cpp` models it:
//! `ContextTy { [15 x RegisterR { i64 }] }`, GEP'd with `(0, index, 0)`
//! rather than a flat `i64` array, so the module's incoming/outgoing
//! calling convention matches what the host expects.

use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::passes::PassManager;
use inkwell::types::StructType;
use inkwell::values::{FunctionValue, GlobalValue, IntValue, PointerValue};
use inkwell::{AddressSpace, IntPredicate};

use crate::config::REGISTER_SLOT_COUNT;
use crate::emit::{Artifact, Emitter, LabelTable, SymbolicStack};
use crate::error::Result;
use crate::opcode::{VirtualInstruction, VirtualOpcode};

/// LLVM IR emitter: lifts the recovered virtual instruction stream into a
/// single `main(ctx: ContextTy*)` function.
pub struct IrEmitter<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    function: FunctionValue<'ctx>,
    context_ty: StructType<'ctx>,
    vregs: Vec<GlobalValue<'ctx>>,
    stack: SymbolicStack<GlobalValue<'ctx>>,
    labels: LabelTable<BasicBlock<'ctx>>,
    temp_counter: usize,
    current_vip: Option<u64>,
}

impl<'ctx> IrEmitter<'ctx> {
    pub fn new(context: &'ctx Context, module_name: &str) -> Self {
        let module = context.create_module(module_name);
        let builder = context.create_builder();

        let i64_ty = context.i64_type();
        // RegisterR { i64 }
        let register_ty = context.struct_type(&[i64_ty.into()], false);
        // ContextTy { [15 x RegisterR] }
        let context_ty = context.struct_type(&[register_ty.array_type(REGISTER_SLOT_COUNT as u32).into()], false);
        let ctx_ptr_ty = context_ty.ptr_type(AddressSpace::default());
        let fn_ty = context.void_type().fn_type(&[ctx_ptr_ty.into()], false);
        let function = module.add_function("main", fn_ty, None);

        let entry = context.append_basic_block(function, "loc_0");
        builder.position_at_end(entry);

        let mut vregs = Vec::with_capacity(REGISTER_SLOT_COUNT);
        for i in 0..REGISTER_SLOT_COUNT {
            let global = module.add_global(i64_ty, None, &format!("vreg_{i}"));
            global.set_initializer(&i64_ty.const_zero());
            vregs.push(global);
        }

        let mut emitter = IrEmitter {
            context,
            module,
            builder,
            function,
            context_ty,
            vregs,
            stack: SymbolicStack::new(),
            labels: LabelTable::new(),
            temp_counter: 0,
            current_vip: None,
        };
        emitter.emit_entry();
        emitter
    }

    fn i64(&self) -> inkwell::types::IntType<'ctx> {
        self.context.i64_type()
    }

    fn temp_global(&mut self) -> GlobalValue<'ctx> {
        let name = format!("temp_{}", self.temp_counter);
        self.temp_counter += 1;
        let global = self.module.add_global(self.i64(), None, &name);
        global.set_initializer(&self.i64().const_zero());
        global
    }

    fn push_value(&mut self, value: inkwell::values::BasicValueEnum<'ctx>) {
        let slot = self.temp_global();
        self.builder
            .build_store(slot.as_pointer_value(), value)
            .expect("store to a freshly created global cannot fail");
        self.stack.push(slot);
    }

    fn pop_value(&mut self, instr: &VirtualInstruction) -> Result<IntValue<'ctx>> {
        let slot = self.stack.pop(instr.vip, instr.op)?;
        let loaded = self
            .builder
            .build_load(self.i64(), slot.as_pointer_value(), "pop")
            .expect("load from a global cannot fail");
        Ok(loaded.into_int_value())
    }

    fn ctx_ptr(&self) -> PointerValue<'ctx> {
        self.function.get_nth_param(0).unwrap().into_pointer_value()
    }

    /// GEPs `(0, index, 0)` into the context struct: array index `index`,
    /// then field 0 of the `RegisterR` it names.
    fn preg_ptr(&self, index: usize) -> PointerValue<'ctx> {
        let zero = self.context.i32_type().const_zero();
        let idx = self.context.i32_type().const_int(index as u64, false);
        unsafe {
            self.builder
                .build_gep(self.context_ty, self.ctx_ptr(), &[zero, idx, zero], "preg")
                .expect("constant in-bounds GEP cannot fail")
        }
    }

    /// Snapshots the fifteen incoming physical-register slots of `ctx` onto
    /// the symbolic stack, mirroring `lifter::lifter`'s constructor loop.
    fn emit_entry(&mut self) {
        for i in 0..REGISTER_SLOT_COUNT {
            let ptr = self.preg_ptr(i);
            let value = self
                .builder
                .build_load(self.i64(), ptr, "preg_val")
                .expect("load from context field cannot fail");
            self.push_value(value);
        }
    }

    fn set_preg(&mut self, index: usize, value: IntValue<'ctx>) {
        let ptr = self.preg_ptr(index);
        self.builder
            .build_store(ptr, value)
            .expect("store to context field cannot fail");
    }

    /// A basic block for `vip`, reused if one already exists (a backward
    /// `Jnz` target), created as a placeholder otherwise.
    fn block_for(&mut self, vip: u64) -> BasicBlock<'ctx> {
        if let Some(block) = self.labels.get(vip) {
            return block;
        }
        let block = self.context.append_basic_block(self.function, &format!("loc_{vip:x}"));
        self.labels.create(vip, block);
        block
    }
}

impl<'ctx> Emitter for IrEmitter<'ctx> {
    fn add(&mut self, instr: VirtualInstruction) -> Result<()> {
        self.current_vip = Some(instr.vip);
        let block = self.block_for(instr.vip);
        self.labels.mark_resolved(instr.vip);
        // A block may already be the active insertion point (straight-line
        // fallthrough); otherwise branch into it before switching, so every
        // block this function builds stays terminated exactly once.
        if self.builder.get_insert_block() != Some(block) {
            if self
                .builder
                .get_insert_block()
                .and_then(|b| b.get_terminator())
                .is_none()
            {
                self.builder
                    .build_unconditional_branch(block)
                    .expect("unconditional branch cannot fail");
            }
            self.builder.position_at_end(block);
        }

        // Anchor marker: gives every handler's IR a distinguishable leading
        // instruction, mirroring lifter.cpp's `CreateAdd(1337, 1337)` nop.
        let marker_ty = self.context.i32_type();
        self.builder
            .build_int_add(marker_ty.const_int(1337, false), marker_ty.const_int(1337, false), "anchor")
            .expect("constant add cannot fail");

        match instr.op {
            VirtualOpcode::PopVreg => {
                let v = self.pop_value(&instr)?;
                self.builder
                    .build_store(self.vregs[instr.operand as usize].as_pointer_value(), v)
                    .expect("store to vreg global cannot fail");
            }
            VirtualOpcode::PushVreg => {
                let global = self.vregs[instr.operand as usize];
                let v = self
                    .builder
                    .build_load(self.i64(), global.as_pointer_value(), "vreg_val")
                    .expect("load from vreg global cannot fail");
                self.push_value(v);
            }
            VirtualOpcode::PushConst => {
                let v = self.i64().const_int(instr.operand, false);
                self.push_value(v.into());
            }
            VirtualOpcode::Read8 => {
                let addr = self.pop_value(&instr)?;
                let ptr = self
                    .builder
                    .build_int_to_ptr(addr, self.context.i8_type().ptr_type(AddressSpace::default()), "read8_ptr")
                    .expect("int-to-ptr cannot fail");
                let byte = self
                    .builder
                    .build_load(self.context.i8_type(), ptr, "read8_val")
                    .expect("load through recovered pointer cannot fail");
                let extended = self
                    .builder
                    .build_int_z_extend(byte.into_int_value(), self.i64(), "read8_ext")
                    .expect("zext cannot fail");
                self.push_value(extended.into());
            }
            VirtualOpcode::Read64 => {
                let addr = self.pop_value(&instr)?;
                let ptr = self
                    .builder
                    .build_int_to_ptr(addr, self.i64().ptr_type(AddressSpace::default()), "read64_ptr")
                    .expect("int-to-ptr cannot fail");
                let v = self
                    .builder
                    .build_load(self.i64(), ptr, "read64_val")
                    .expect("load through recovered pointer cannot fail");
                self.push_value(v);
            }
            VirtualOpcode::Add => {
                let r1 = self.pop_value(&instr)?;
                let r2 = self.pop_value(&instr)?;
                let sum = self.builder.build_int_add(r1, r2, "add").expect("int add cannot fail");
                self.push_value(sum.into());
            }
            VirtualOpcode::Nand => {
                let r1 = self.pop_value(&instr)?;
                let r2 = self.pop_value(&instr)?;
                let anded = self.builder.build_and(r1, r2, "and").expect("and cannot fail");
                let notted = self.builder.build_not(anded, "nand").expect("not cannot fail");
                self.push_value(notted.into());
            }
            VirtualOpcode::Mul => {
                let r1 = self.pop_value(&instr)?;
                let r2 = self.pop_value(&instr)?;
                let product = self.builder.build_int_mul(r1, r2, "mul").expect("int mul cannot fail");
                self.push_value(product.into());
            }
            VirtualOpcode::Jnz => {
                let cmp_r1 = self.pop_value(&instr)?;
                let cmp_r2 = self.pop_value(&instr)?;
                let _new_rkey = self.pop_value(&instr)?;
                let _new_bytecode = self.pop_value(&instr)?;
                let _new_ror_key = self.pop_value(&instr)?;

                // `cmp + jnz` branches on not-equal; matched here with
                // `icmp_ne` rather than the original's `icmp_eq` +
                // swapped-arm layout, so the taken/fallthrough arms read the
                // same way in both backends (see DESIGN.md).
                let cond = self
                    .builder
                    .build_int_compare(IntPredicate::NE, cmp_r1, cmp_r2, "jnz_cond")
                    .expect("int compare cannot fail");

                let taken = self.block_for(instr.operand);
                let fallthrough = self
                    .context
                    .append_basic_block(self.function, &format!("loc_{:x}_fallthrough", instr.vip));
                self.builder
                    .build_conditional_branch(cond, taken, fallthrough)
                    .expect("conditional branch cannot fail");
                self.builder.position_at_end(fallthrough);
            }
            VirtualOpcode::Exit => {
                for i in (0..REGISTER_SLOT_COUNT).rev() {
                    let v = self.pop_value(&instr)?;
                    self.set_preg(i, v);
                }
                self.builder.build_return(None).expect("void return cannot fail");
            }
            VirtualOpcode::Invalid => {
                self.builder.build_unreachable().expect("unreachable terminator cannot fail");
            }
        }

        Ok(())
    }

    fn compile(&mut self) -> Result<Artifact> {
        for dead in self.labels.dead_labels() {
            if dead.get_terminator().is_none() {
                self.builder.position_at_end(dead);
                self.builder
                    .build_unconditional_branch(dead)
                    .expect("self-loop branch cannot fail");
            }
        }
        if let Some(last) = self.function.get_last_basic_block() {
            if last.get_terminator().is_none() {
                self.builder.position_at_end(last);
                self.builder.build_return(None).expect("void return cannot fail");
            }
        }

        let fpm = PassManager::create(&self.module);
        fpm.add_promote_memory_to_register_pass();
        fpm.add_new_gvn_pass();
        fpm.add_reassociate_pass();
        fpm.add_dead_store_elimination_pass();
        fpm.add_dead_code_elimination_pass();
        fpm.add_instruction_combining_pass();
        fpm.initialize();
        fpm.run_on(&self.function);
        fpm.finalize();

        Ok(Artifact::Ir(self.module.print_to_string().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(op: VirtualOpcode, vip: u64, operand: u64) -> VirtualInstruction {
        VirtualInstruction { op, vip, operand }
    }

    #[test]
    fn exit_emits_a_void_return() {
        let context = Context::create();
        let mut emitter = IrEmitter::new(&context, "test");
        emitter.add(instr(VirtualOpcode::Exit, 0x10, 0)).unwrap();
        let Artifact::Ir(ir) = emitter.compile().unwrap() else {
            panic!("expected IR artifact");
        };
        assert!(ir.contains("ret void"));
    }

    #[test]
    fn push_const_pop_vreg_round_trips() {
        let context = Context::create();
        let mut emitter = IrEmitter::new(&context, "test");
        emitter.add(instr(VirtualOpcode::PushConst, 0x10, 42)).unwrap();
        emitter.add(instr(VirtualOpcode::PopVreg, 0x20, 2)).unwrap();
        emitter.add(instr(VirtualOpcode::Exit, 0x30, 0)).unwrap();
        let Artifact::Ir(ir) = emitter.compile().unwrap() else {
            panic!("expected IR artifact");
        };
        assert!(ir.contains("@vreg_2"));
    }

    #[test]
    fn dead_jnz_target_self_loops() {
        let context = Context::create();
        let mut emitter = IrEmitter::new(&context, "test");
        for i in 0..5 {
            emitter.add(instr(VirtualOpcode::PushConst, i as u64 * 8, 0)).unwrap();
        }
        emitter.add(instr(VirtualOpcode::Jnz, 0x40, 0xDEAD_BEEF)).unwrap();
        let Artifact::Ir(ir) = emitter.compile().unwrap() else {
            panic!("expected IR artifact");
        };
        assert!(ir.contains("br label"));
    }
}
