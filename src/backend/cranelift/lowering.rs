//! IR → Cranelift IR lowering
//!
//! Registers become Cranelift frontend variables so the SSA construction in
//! cranelift-frontend handles cross-block merges; blocks are sealed as soon
//! as all predecessors are known, deferring loop headers. Symbolic references
//! (calls and global addresses) are materialized through `symbol_value` so
//! every external reference surfaces as an absolute relocation against a
//! named symbol, regardless of where the linker places the code.

use cranelift_codegen::ir::immediates::Imm64;
use cranelift_codegen::ir::{
    self, condcodes, types, AbiParam, ExternalName, GlobalValueData, InstBuilder, MemFlags,
    UserExternalName,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Variable};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::{BlockId, FloatCond, Function, Instr, IntCond, Reg, Signature, Terminator, Type};

/// Namespace for user external names referring to session symbols
const SYMBOL_NAMESPACE: u32 = 0;

/// Map an IR type onto a Cranelift value type
fn cl_type(ty: Type, ptr: ir::Type) -> ir::Type {
    match ty {
        Type::I32 => types::I32,
        Type::I64 => types::I64,
        Type::F64 => types::F64,
        Type::Bool => types::I8,
        Type::Ptr => ptr,
    }
}

/// Build the native signature for an IR function signature
pub fn abi_signature(sig: &Signature, call_conv: CallConv, ptr: ir::Type) -> ir::Signature {
    let mut out = ir::Signature::new(call_conv);
    for param in &sig.params {
        out.params.push(AbiParam::new(cl_type(*param, ptr)));
    }
    if let Some(ret) = sig.ret {
        out.returns.push(AbiParam::new(cl_type(ret, ptr)));
    }
    out
}

/// State maintained while lowering a single function
pub struct LoweringContext<'a> {
    func: &'a Function,
    reg_vars: FxHashMap<Reg, Variable>,
    block_map: FxHashMap<BlockId, ir::Block>,
    /// Symbols referenced so far; a relocation's user name index points here
    symbols: Vec<String>,
    symbol_gvs: FxHashMap<String, ir::GlobalValue>,
    ptr_ty: ir::Type,
    call_conv: CallConv,
}

impl<'a> LoweringContext<'a> {
    /// Lower an entire function. Consumes the builder (finalize does) and
    /// returns the table of referenced symbol names, indexed by the user
    /// external name index recorded in the emitted relocations.
    pub fn lower(
        func: &'a Function,
        mut builder: FunctionBuilder<'_>,
        ptr_ty: ir::Type,
        call_conv: CallConv,
    ) -> Vec<String> {
        let mut block_map = FxHashMap::default();
        for block in &func.blocks {
            block_map.insert(block.id, builder.create_block());
        }

        // Lower the entry first; Cranelift takes the first filled block as
        // the function entry.
        let mut order = vec![func.entry];
        order.extend(func.blocks.iter().map(|b| b.id).filter(|id| *id != func.entry));
        let pos: FxHashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        // A block is a loop header if some branch to it comes from a block
        // lowered at the same position or later. Sealing those is deferred
        // until every predecessor has been emitted.
        let mut loop_headers = FxHashSet::default();
        for block in &func.blocks {
            for succ in block.terminator.successors() {
                if pos[&succ] <= pos[&block.id] {
                    loop_headers.insert(succ);
                }
            }
        }

        let entry_block = block_map[&func.entry];
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        if !loop_headers.contains(&func.entry) {
            builder.seal_block(entry_block);
        }

        let mut ctx = LoweringContext {
            func,
            reg_vars: FxHashMap::default(),
            block_map,
            symbols: vec![],
            symbol_gvs: FxHashMap::default(),
            ptr_ty,
            call_conv,
        };
        ctx.declare_all_regs(&mut builder);

        // Bind function parameters to their pre-allocated registers.
        let param_vals: Vec<ir::Value> = builder.block_params(entry_block).to_vec();
        for (i, val) in param_vals.iter().enumerate() {
            ctx.def_reg(&mut builder, ctx.func.param(i), *val);
        }

        for (idx, block_id) in order.iter().enumerate() {
            let cl_block = ctx.block_map[block_id];
            if idx > 0 {
                builder.switch_to_block(cl_block);
                if !loop_headers.contains(block_id) {
                    builder.seal_block(cl_block);
                }
            }
            ctx.lower_block(*block_id, &mut builder);
        }

        for header in &loop_headers {
            builder.seal_block(ctx.block_map[header]);
        }

        builder.finalize();
        ctx.symbols
    }

    fn declare_all_regs(&mut self, builder: &mut FunctionBuilder<'_>) {
        for idx in 0..self.func.next_reg {
            let reg = Reg(idx);
            let ty = cl_type(self.func.reg_type(reg), self.ptr_ty);
            let var = builder.declare_var(ty);
            self.reg_vars.insert(reg, var);
        }
    }

    fn use_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg) -> ir::Value {
        builder.use_var(self.reg_vars[&reg])
    }

    fn def_reg(&self, builder: &mut FunctionBuilder<'_>, reg: Reg, val: ir::Value) {
        builder.def_var(self.reg_vars[&reg], val);
    }

    fn reg_cl_type(&self, reg: Reg) -> ir::Type {
        cl_type(self.func.reg_type(reg), self.ptr_ty)
    }

    /// Global value holding the address of a named symbol, created on first
    /// use and memoized per function.
    fn symbol_gv(&mut self, builder: &mut FunctionBuilder<'_>, name: &str) -> ir::GlobalValue {
        if let Some(gv) = self.symbol_gvs.get(name) {
            return *gv;
        }
        let index = self.symbols.len() as u32;
        self.symbols.push(name.to_string());
        let name_ref = builder
            .func
            .declare_imported_user_function(UserExternalName { namespace: SYMBOL_NAMESPACE, index });
        let gv = builder.func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::User(name_ref),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        });
        self.symbol_gvs.insert(name.to_string(), gv);
        gv
    }

    fn lower_block(&mut self, block_id: BlockId, builder: &mut FunctionBuilder<'_>) {
        let block = self.func.block(block_id);
        let instrs = block.instrs.clone();
        let terminator = block.terminator.clone();
        for instr in &instrs {
            self.lower_instr(instr, builder);
        }
        self.lower_terminator(&terminator, builder);
    }

    fn lower_instr(&mut self, instr: &Instr, builder: &mut FunctionBuilder<'_>) {
        match instr {
            // ===== Constants =====
            Instr::ConstI32 { dest, value } => {
                let val = builder.ins().iconst(types::I32, *value as i64);
                self.def_reg(builder, *dest, val);
            }
            Instr::ConstI64 { dest, value } => {
                let val = builder.ins().iconst(types::I64, *value);
                self.def_reg(builder, *dest, val);
            }
            Instr::ConstF64 { dest, value } => {
                let val = builder.ins().f64const(*value);
                self.def_reg(builder, *dest, val);
            }
            Instr::ConstBool { dest, value } => {
                let val = builder.ins().iconst(types::I8, *value as i64);
                self.def_reg(builder, *dest, val);
            }

            // ===== Integer arithmetic =====
            Instr::IAdd { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().iadd(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::ISub { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().isub(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IMul { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().imul(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IDiv { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().sdiv(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IRem { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().srem(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::INeg { dest, operand } => {
                let v = self.use_reg(builder, *operand);
                let result = builder.ins().ineg(v);
                self.def_reg(builder, *dest, result);
            }

            // ===== Integer bitwise =====
            Instr::IAnd { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().band(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IOr { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().bor(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IXor { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().bxor(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IShl { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().ishl(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::IShr { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().sshr(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::INot { dest, operand } => {
                let v = self.use_reg(builder, *operand);
                let result = builder.ins().bnot(v);
                self.def_reg(builder, *dest, result);
            }

            // ===== Float arithmetic =====
            Instr::FAdd { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().fadd(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::FSub { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().fsub(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::FMul { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().fmul(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::FDiv { dest, left, right } => {
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().fdiv(l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::FNeg { dest, operand } => {
                let v = self.use_reg(builder, *operand);
                let result = builder.ins().fneg(v);
                self.def_reg(builder, *dest, result);
            }

            // ===== Comparison =====
            Instr::ICmp { dest, cond, left, right } => {
                let cc = match cond {
                    IntCond::Eq => condcodes::IntCC::Equal,
                    IntCond::Ne => condcodes::IntCC::NotEqual,
                    IntCond::Lt => condcodes::IntCC::SignedLessThan,
                    IntCond::Le => condcodes::IntCC::SignedLessThanOrEqual,
                    IntCond::Gt => condcodes::IntCC::SignedGreaterThan,
                    IntCond::Ge => condcodes::IntCC::SignedGreaterThanOrEqual,
                };
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().icmp(cc, l, r);
                self.def_reg(builder, *dest, result);
            }
            Instr::FCmp { dest, cond, left, right } => {
                let cc = match cond {
                    FloatCond::Eq => condcodes::FloatCC::Equal,
                    FloatCond::Ne => condcodes::FloatCC::NotEqual,
                    FloatCond::Lt => condcodes::FloatCC::LessThan,
                    FloatCond::Le => condcodes::FloatCC::LessThanOrEqual,
                    FloatCond::Gt => condcodes::FloatCC::GreaterThan,
                    FloatCond::Ge => condcodes::FloatCC::GreaterThanOrEqual,
                };
                let (l, r) = (self.use_reg(builder, *left), self.use_reg(builder, *right));
                let result = builder.ins().fcmp(cc, l, r);
                self.def_reg(builder, *dest, result);
            }

            // ===== Register copy =====
            Instr::Move { dest, src } => {
                let v = self.use_reg(builder, *src);
                self.def_reg(builder, *dest, v);
            }

            // ===== Symbolic references =====
            Instr::Call { dest, callee, args } => {
                let mut sig = ir::Signature::new(self.call_conv);
                for arg in args {
                    sig.params.push(AbiParam::new(self.reg_cl_type(*arg)));
                }
                if let Some(dest) = dest {
                    sig.returns.push(AbiParam::new(self.reg_cl_type(*dest)));
                }
                let sig_ref = builder.import_signature(sig);

                // The callee address is materialized from an absolute
                // relocation, so the call works at any distance between the
                // call site and the target.
                let gv = self.symbol_gv(builder, callee);
                let callee_val = builder.ins().symbol_value(self.ptr_ty, gv);
                let arg_vals: Vec<ir::Value> =
                    args.iter().map(|a| self.use_reg(builder, *a)).collect();
                let call = builder.ins().call_indirect(sig_ref, callee_val, &arg_vals);
                if let Some(dest) = dest {
                    let result = builder.inst_results(call)[0];
                    self.def_reg(builder, *dest, result);
                }
            }
            Instr::GlobalAddr { dest, name } => {
                let gv = self.symbol_gv(builder, name);
                let val = builder.ins().symbol_value(self.ptr_ty, gv);
                self.def_reg(builder, *dest, val);
            }

            // ===== Memory =====
            Instr::Load { dest, ty, addr, offset } => {
                let base = self.use_reg(builder, *addr);
                let val =
                    builder.ins().load(cl_type(*ty, self.ptr_ty), MemFlags::trusted(), base, *offset);
                self.def_reg(builder, *dest, val);
            }
            Instr::Store { addr, value, offset } => {
                let base = self.use_reg(builder, *addr);
                let v = self.use_reg(builder, *value);
                builder.ins().store(MemFlags::trusted(), v, base, *offset);
            }
        }
    }

    fn lower_terminator(&self, term: &Terminator, builder: &mut FunctionBuilder<'_>) {
        match term {
            Terminator::Return(Some(reg)) => {
                let val = self.use_reg(builder, *reg);
                builder.ins().return_(&[val]);
            }
            Terminator::Return(None) => {
                builder.ins().return_(&[]);
            }
            Terminator::Jump(target) => {
                let cl_target = self.block_map[target];
                builder.ins().jump(cl_target, &[]);
            }
            Terminator::Branch { cond, then_block, else_block } => {
                let cond_val = self.use_reg(builder, *cond);
                let then_cl = self.block_map[then_block];
                let else_cl = self.block_map[else_block];
                builder.ins().brif(cond_val, then_cl, &[], else_cl, &[]);
            }
            Terminator::Unreachable => {
                builder.ins().trap(ir::TrapCode::user(0).unwrap());
            }
            Terminator::None => {
                // Verification rejects this; trap if it slips through.
                builder.ins().trap(ir::TrapCode::user(1).unwrap());
            }
        }
    }
}
