//! Trap-only stub backend for tests
//!
//! Emits a single trap byte per function and records no relocations. Lets the
//! layer stack, linker, and dylib machinery be tested without generating (or
//! executing) real machine code.

use super::traits::*;
use crate::ir::Function;

/// Backend that emits one trap instruction per function
pub struct StubBackend;

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile_function(&self, _func: &Function) -> Result<CompiledCode, CodegenError> {
        // int3 on x86-64; never executed by tests that use this backend
        Ok(CompiledCode { code: vec![0xCC], relocations: vec![], alignment: 16 })
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::X86_64, pointer_bytes: 8 }
    }
}
