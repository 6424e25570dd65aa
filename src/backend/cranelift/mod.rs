//! Cranelift code generation backend
//!
//! Compiles IR functions to native code for x86-64 and AArch64. Symbolic
//! references come out as absolute relocations against named symbols; the
//! linking layer patches them once addresses are known.

pub mod lowering;

use std::sync::Arc;

use cranelift_codegen::binemit::Reloc;
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::{self, ExternalName};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{Context, FinalizedRelocTarget};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use target_lexicon::Architecture;

use self::lowering::{abi_signature, LoweringContext};
use crate::backend::traits::*;
use crate::ir::Function;

/// Cranelift-based code generation backend
pub struct CraneliftBackend {
    isa: Arc<dyn TargetIsa>,
}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::Backend(format!("failed to set opt_level: {e}")))?;
        // Addresses are patched in absolute form, so position independence
        // is not needed.
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CodegenError::Backend(format!("failed to set is_pic: {e}")))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::Backend(format!("failed to create native ISA builder: {e}")))?
            .finish(flags)
            .map_err(|e| CodegenError::Backend(format!("failed to finish ISA: {e}")))?;
        Ok(CraneliftBackend { isa })
    }

    /// Create a backend with a specific ISA
    pub fn from_isa(isa: Arc<dyn TargetIsa>) -> Self {
        CraneliftBackend { isa }
    }

    /// The target ISA this backend compiles for
    pub fn isa(&self) -> &Arc<dyn TargetIsa> {
        &self.isa
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn compile_function(&self, func: &Function) -> Result<CompiledCode, CodegenError> {
        let mut codegen_ctx = Context::new();
        let mut func_builder_ctx = FunctionBuilderContext::new();

        let call_conv = self.isa.default_call_conv();
        let ptr_ty = self.isa.pointer_type();
        codegen_ctx.func.signature = abi_signature(&func.sig, call_conv, ptr_ty);
        codegen_ctx.func.name = ir::UserFuncName::user(0, 0);

        // lower() takes ownership of the builder (finalize() consumes it)
        let symbols = {
            let builder = FunctionBuilder::new(&mut codegen_ctx.func, &mut func_builder_ctx);
            LoweringContext::lower(func, builder, ptr_ty, call_conv)
        };

        let mut ctrl_plane = ControlPlane::default();
        let (code, raw_relocs) = {
            let compiled = codegen_ctx.compile(&*self.isa, &mut ctrl_plane).map_err(|e| {
                CodegenError::Backend(format!("compilation of {} failed: {e:?}", func.name))
            })?;
            (compiled.code_buffer().to_vec(), compiled.buffer.relocs().to_vec())
        };

        let named = codegen_ctx.func.params.user_named_funcs();
        let mut relocations = Vec::with_capacity(raw_relocs.len());
        for reloc in &raw_relocs {
            let kind = match reloc.kind {
                Reloc::Abs8 => RelocKind::Abs8,
                Reloc::Abs4 => RelocKind::Abs4,
                Reloc::X86CallPCRel4 => RelocKind::CallPcRel4,
                Reloc::Arm64Call => RelocKind::Arm64Call,
                other => {
                    return Err(CodegenError::Backend(format!(
                        "unsupported relocation {other:?} in {}",
                        func.name
                    )))
                }
            };
            let target = match &reloc.target {
                FinalizedRelocTarget::ExternalName(ExternalName::User(name_ref)) => {
                    let user = &named[*name_ref];
                    symbols.get(user.index as usize).cloned().ok_or_else(|| {
                        CodegenError::Backend(format!(
                            "relocation against unknown symbol index {} in {}",
                            user.index, func.name
                        ))
                    })?
                }
                other => {
                    return Err(CodegenError::Backend(format!(
                        "unsupported relocation target {other:?} in {}",
                        func.name
                    )))
                }
            };
            relocations.push(Relocation {
                offset: reloc.offset,
                kind,
                target,
                addend: reloc.addend,
            });
        }

        Ok(CompiledCode { code, relocations, alignment: 16 })
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::X86_64,
        };
        TargetInfo { arch, pointer_bytes: self.isa.pointer_bytes() as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::module::Linkage;
    use crate::ir::{FuncBuilder, IntCond, Signature, Type};

    fn host() -> CraneliftBackend {
        CraneliftBackend::host().unwrap()
    }

    #[test]
    fn test_backend_creation() {
        let backend = host();
        assert_eq!(backend.name(), "cranelift");
        assert_eq!(backend.target_info().pointer_bytes, 8);
    }

    #[test]
    fn test_compile_constant_return() {
        let mut func = Function::new("answer", Signature::returning(Type::I32), Linkage::Export);
        let mut b = FuncBuilder::new(&mut func);
        let v = b.const_i32(42);
        b.ret(Some(v));

        let compiled = host().compile_function(&func).unwrap();
        assert!(!compiled.code.is_empty());
        assert!(compiled.relocations.is_empty());
    }

    #[test]
    fn test_compile_branch_and_params() {
        // fn max(a: i64, b: i64) -> i64
        let sig = Signature { params: vec![Type::I64, Type::I64], ret: Some(Type::I64) };
        let mut func = Function::new("max", sig, Linkage::Export);
        let (a, b_reg) = (func.param(0), func.param(1));
        let mut b = FuncBuilder::new(&mut func);
        let then_block = b.create_block();
        let else_block = b.create_block();
        let cond = b.icmp(IntCond::Gt, a, b_reg);
        b.branch(cond, then_block, else_block);
        b.switch_to_block(then_block);
        b.ret(Some(a));
        b.switch_to_block(else_block);
        b.ret(Some(b_reg));

        let compiled = host().compile_function(&func).unwrap();
        assert!(compiled.code.len() > 4);
    }

    #[test]
    fn test_call_produces_absolute_relocation() {
        let mut func = Function::new("caller", Signature::returning(Type::I64), Linkage::Export);
        let mut b = FuncBuilder::new(&mut func);
        let v = b.call("callee", vec![], Type::I64);
        b.ret(Some(v));

        let compiled = host().compile_function(&func).unwrap();
        let reloc = compiled
            .relocations
            .iter()
            .find(|r| r.target == "callee")
            .expect("call should leave a relocation");
        assert_eq!(reloc.kind, RelocKind::Abs8);
    }

    #[test]
    fn test_global_addr_relocation() {
        let mut func = Function::new("read_global", Signature::returning(Type::I32), Linkage::Export);
        let mut b = FuncBuilder::new(&mut func);
        let addr = b.global_addr("counter");
        let v = b.load(Type::I32, addr, 0);
        b.ret(Some(v));

        let compiled = host().compile_function(&func).unwrap();
        assert!(compiled.relocations.iter().any(|r| r.target == "counter"));
    }

    #[test]
    fn test_compile_loop() {
        // sum 0..n with a back-edge
        let sig = Signature { params: vec![Type::I64], ret: Some(Type::I64) };
        let mut func = Function::new("sum_to", sig, Linkage::Export);
        let n = func.param(0);
        let mut b = FuncBuilder::new(&mut func);
        let header = b.create_block();
        let body = b.create_block();
        let exit = b.create_block();

        let i = b.alloc_reg(Type::I64);
        let acc = b.alloc_reg(Type::I64);
        let zero = b.const_i64(0);
        b.emit(crate::ir::Instr::Move { dest: i, src: zero });
        b.emit(crate::ir::Instr::Move { dest: acc, src: zero });
        b.jump(header);

        b.switch_to_block(header);
        let done = b.icmp(IntCond::Ge, i, n);
        b.branch(done, exit, body);

        b.switch_to_block(body);
        let acc2 = b.iadd(acc, i);
        b.emit(crate::ir::Instr::Move { dest: acc, src: acc2 });
        let one = b.const_i64(1);
        let i2 = b.iadd(i, one);
        b.emit(crate::ir::Instr::Move { dest: i, src: i2 });
        b.jump(header);

        b.switch_to_block(exit);
        b.ret(Some(acc));

        let compiled = host().compile_function(&func).unwrap();
        assert!(!compiled.code.is_empty());
    }
}
