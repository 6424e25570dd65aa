//! Code generation backend abstraction
//!
//! A [`CodegenBackend`] turns one IR function into position-dependent machine
//! code plus a list of symbolic relocations. Backends know nothing about
//! sessions, dylibs, or symbol resolution; every external reference is left as
//! a named [`Relocation`] for the linking layer to patch.

use thiserror::Error;

use crate::ir::{Function, Linkage, Type};

/// Machine architecture of a backend target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// Target description reported by a backend
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_bytes: usize,
}

/// Relocation kinds the linking layer knows how to patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 64-bit absolute address
    Abs8,
    /// 32-bit absolute address
    Abs4,
    /// x86-64 call with 32-bit PC-relative displacement
    CallPcRel4,
    /// AArch64 `bl` with 26-bit PC-relative displacement
    Arm64Call,
}

/// A symbolic reference left in compiled code for the linker to patch
#[derive(Debug, Clone)]
pub struct Relocation {
    /// Byte offset of the patch site within the function's code
    pub offset: u32,
    pub kind: RelocKind,
    /// Unmangled IR symbol name this site refers to
    pub target: String,
    pub addend: i64,
}

/// Machine code for one function, before linking
#[derive(Debug, Clone)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub alignment: u32,
}

/// A compiled function ready for layout
#[derive(Debug, Clone)]
pub struct ObjectFunction {
    pub name: String,
    pub linkage: Linkage,
    pub code: CompiledCode,
}

/// An initialized data definition ready for layout
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub name: String,
    pub linkage: Linkage,
    pub bytes: Vec<u8>,
    pub alignment: u32,
    pub ty: Type,
}

/// Everything a compiled module contributes to the linking layer
#[derive(Debug, Clone, Default)]
pub struct CompiledObject {
    pub name: String,
    pub functions: Vec<ObjectFunction>,
    pub data: Vec<ObjectData>,
}

impl CompiledObject {
    /// Names defined by this object, functions then data
    pub fn defined_names(&self) -> impl Iterator<Item = &str> {
        self.functions
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.data.iter().map(|d| d.name.as_str()))
    }
}

/// Code generation failed
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("lowering failed for function {func}: {reason}")]
    Lowering { func: String, reason: String },
    #[error("backend error: {0}")]
    Backend(String),
}

/// A machine code generator for IR functions
pub trait CodegenBackend: Send + Sync {
    /// Backend name, for logs and diagnostics
    fn name(&self) -> &str;

    /// Compile one function to unlinked machine code
    fn compile_function(&self, func: &Function) -> Result<CompiledCode, CodegenError>;

    /// Architecture and pointer width of the target
    fn target_info(&self) -> TargetInfo;
}
