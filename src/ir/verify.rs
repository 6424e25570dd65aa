//! Structural verification of IR modules
//!
//! Catches malformed modules before they reach the backend: unterminated
//! blocks, dangling block references, type mismatches on terminators, and
//! duplicate definitions within one module. Whether a failure rejects the
//! module or is merely reported is decided by [`VerifyPolicy`] on the engine
//! configuration.

use rustc_hash::FxHashSet;
use thiserror::Error;

use super::instr::{Function, Instr, Terminator};
use super::module::Module;
use super::types::Type;

/// What to do when verification fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyPolicy {
    /// Reject the module before compilation
    #[default]
    Strict,
    /// Report the failure to the session error sink and compile anyway
    Permissive,
}

/// A structural defect found during verification
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("module {module}: duplicate definition of symbol '{name}'")]
    DuplicateDefinition { module: String, name: String },
    #[error("function {func}: has no blocks")]
    EmptyFunction { func: String },
    #[error("function {func}, {block}: block not terminated")]
    MissingTerminator { func: String, block: String },
    #[error("function {func}, {block}: terminator references unknown block bb{target}")]
    DanglingBlockRef { func: String, block: String, target: u32 },
    #[error("function {func}, {block}: branch condition {reg} is {ty}, expected bool")]
    BranchCondNotBool { func: String, block: String, reg: String, ty: Type },
    #[error("function {func}, {block}: return value does not match signature")]
    ReturnMismatch { func: String, block: String },
    #[error("function {func}, {block}: {instr} references unallocated register")]
    UnknownRegister { func: String, block: String, instr: String },
    #[error("function {func}, {block}: operand types of '{instr}' do not agree")]
    OperandTypeMismatch { func: String, block: String, instr: String },
}

/// Verify every function of a module. Returns the first defect found.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    let mut seen = FxHashSet::default();
    for name in module.defined_names() {
        if !seen.insert(name) {
            return Err(VerifyError::DuplicateDefinition {
                module: module.name.clone(),
                name: name.to_string(),
            });
        }
    }
    for func in &module.functions {
        verify_function(func)?;
    }
    Ok(())
}

fn verify_function(func: &Function) -> Result<(), VerifyError> {
    if func.blocks.is_empty() {
        return Err(VerifyError::EmptyFunction { func: func.name.clone() });
    }

    let block_count = func.blocks.len() as u32;
    for block in &func.blocks {
        let ctx = || (func.name.clone(), block.id.to_string());

        for instr in &block.instrs {
            // Every referenced register must have been allocated.
            let mut bad_reg = false;
            instr.visit_uses(|reg| {
                if reg.0 >= func.next_reg {
                    bad_reg = true;
                }
            });
            if let Some(dest) = instr.dest() {
                if dest.0 >= func.next_reg {
                    bad_reg = true;
                }
            }
            if bad_reg {
                let (f, b) = ctx();
                return Err(VerifyError::UnknownRegister {
                    func: f,
                    block: b,
                    instr: instr.to_string(),
                });
            }
            verify_instr_types(func, block.id.to_string(), instr)?;
        }

        match &block.terminator {
            Terminator::None => {
                let (f, b) = ctx();
                return Err(VerifyError::MissingTerminator { func: f, block: b });
            }
            Terminator::Jump(target) => {
                if target.0 >= block_count {
                    let (f, b) = ctx();
                    return Err(VerifyError::DanglingBlockRef { func: f, block: b, target: target.0 });
                }
            }
            Terminator::Branch { cond, then_block, else_block } => {
                for target in [then_block, else_block] {
                    if target.0 >= block_count {
                        let (f, b) = ctx();
                        return Err(VerifyError::DanglingBlockRef {
                            func: f,
                            block: b,
                            target: target.0,
                        });
                    }
                }
                let ty = func.reg_type(*cond);
                if ty != Type::Bool {
                    let (f, b) = ctx();
                    return Err(VerifyError::BranchCondNotBool {
                        func: f,
                        block: b,
                        reg: cond.to_string(),
                        ty,
                    });
                }
            }
            Terminator::Return(value) => {
                let ok = match (value, func.sig.ret) {
                    (None, None) => true,
                    (Some(reg), Some(ret_ty)) => func.reg_type(*reg) == ret_ty,
                    _ => false,
                };
                if !ok {
                    let (f, b) = ctx();
                    return Err(VerifyError::ReturnMismatch { func: f, block: b });
                }
            }
            Terminator::Unreachable => {}
        }
    }
    Ok(())
}

fn verify_instr_types(func: &Function, block: String, instr: &Instr) -> Result<(), VerifyError> {
    let mismatch = |instr: &Instr| VerifyError::OperandTypeMismatch {
        func: func.name.clone(),
        block,
        instr: instr.to_string(),
    };
    match instr {
        Instr::IAdd { left, right, .. }
        | Instr::ISub { left, right, .. }
        | Instr::IMul { left, right, .. }
        | Instr::IDiv { left, right, .. }
        | Instr::IRem { left, right, .. }
        | Instr::IAnd { left, right, .. }
        | Instr::IOr { left, right, .. }
        | Instr::IXor { left, right, .. }
        | Instr::IShl { left, right, .. }
        | Instr::IShr { left, right, .. }
        | Instr::ICmp { left, right, .. } => {
            let (lt, rt) = (func.reg_type(*left), func.reg_type(*right));
            if !lt.is_int() || lt != rt {
                return Err(mismatch(instr));
            }
        }
        Instr::FAdd { left, right, .. }
        | Instr::FSub { left, right, .. }
        | Instr::FMul { left, right, .. }
        | Instr::FDiv { left, right, .. }
        | Instr::FCmp { left, right, .. } => {
            if !func.reg_type(*left).is_float() || !func.reg_type(*right).is_float() {
                return Err(mismatch(instr));
            }
        }
        Instr::INeg { operand, .. } | Instr::INot { operand, .. } => {
            if !func.reg_type(*operand).is_int() {
                return Err(mismatch(instr));
            }
        }
        Instr::FNeg { operand, .. } => {
            if !func.reg_type(*operand).is_float() {
                return Err(mismatch(instr));
            }
        }
        Instr::Load { addr, .. } | Instr::Store { addr, .. } => {
            if func.reg_type(*addr) != Type::Ptr {
                return Err(mismatch(instr));
            }
        }
        _ => {}
    }
    Ok(())
}
