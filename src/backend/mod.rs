//! Code generation backends

pub mod cranelift;
pub mod stub;
pub mod traits;

pub use cranelift::CraneliftBackend;
pub use stub::StubBackend;
pub use traits::{
    CodegenBackend, CodegenError, CompiledCode, CompiledObject, ObjectData, ObjectFunction,
    RelocKind, Relocation, TargetArch, TargetInfo,
};
