//! Layered module pipeline
//!
//! Modules submitted to the engine flow through a chain of [`Layer`]s: the
//! transform layer runs the configured IR optimizations, the compile layer
//! turns functions into machine code and globals into data definitions, and
//! hands the result to the object linking layer. Each layer owns the
//! materialization guard while it works; on failure it marks the claims
//! failed instead of leaving lookups hanging.

pub mod optimize;

use std::sync::Arc;

use thiserror::Error;

use crate::backend::{
    CodegenBackend, CodegenError, CompiledObject, ObjectData, ObjectFunction,
};
use crate::dylib::{MaterializationGuard, MaterializeError};
use crate::ir::{Module, VerifyError};
use crate::link::{LinkError, ObjectLinkingLayer};
use crate::session::ExecutionSession;
use optimize::{ModuleTransform, TransformError};

/// Adding a module to the engine failed
#[derive(Debug, Error)]
pub enum AddModuleError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Compile(#[from] CodegenError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl From<MaterializeError> for AddModuleError {
    fn from(err: MaterializeError) -> Self {
        AddModuleError::Link(LinkError::Materialize(err))
    }
}

/// One stage of the module pipeline. Takes ownership of the module and the
/// guard; on success the guard has been published downstream.
pub trait Layer: Send + Sync {
    fn emit(&self, guard: MaterializationGuard, module: Module) -> Result<(), AddModuleError>;
}

/// Runs the configured IR transform, then forwards to the next layer
pub struct TransformLayer {
    transform: Arc<dyn ModuleTransform>,
    next: Arc<dyn Layer>,
}

impl TransformLayer {
    pub fn new(transform: Arc<dyn ModuleTransform>, next: Arc<dyn Layer>) -> Self {
        TransformLayer { transform, next }
    }
}

impl Layer for TransformLayer {
    fn emit(&self, guard: MaterializationGuard, mut module: Module) -> Result<(), AddModuleError> {
        if let Err(err) = self.transform.transform(&mut module) {
            guard.fail(err.to_string());
            return Err(err.into());
        }
        self.next.emit(guard, module)
    }
}

/// Compiles functions and globals into an object and links it
pub struct CompileLayer {
    session: Arc<ExecutionSession>,
    backend: Arc<dyn CodegenBackend>,
    linker: Arc<ObjectLinkingLayer>,
}

impl CompileLayer {
    pub fn new(
        session: Arc<ExecutionSession>,
        backend: Arc<dyn CodegenBackend>,
        linker: Arc<ObjectLinkingLayer>,
    ) -> Self {
        CompileLayer { session, backend, linker }
    }

    /// Compile every function and global of a module. Defined names and
    /// relocation targets come out mangled, matching the dylib symbol table.
    fn compile(&self, module: &Module) -> Result<CompiledObject, CodegenError> {
        let mut object = CompiledObject {
            name: module.name.clone(),
            functions: Vec::with_capacity(module.functions.len()),
            data: Vec::with_capacity(module.globals.len()),
        };
        for func in &module.functions {
            let mut code = self.backend.compile_function(func)?;
            for reloc in &mut code.relocations {
                reloc.target = self.session.mangle(&reloc.target).to_string();
            }
            object.functions.push(ObjectFunction {
                name: self.session.mangle(&func.name).to_string(),
                linkage: func.linkage,
                code,
            });
        }
        for global in &module.globals {
            let size = global.ty.byte_size() as usize;
            object.data.push(ObjectData {
                name: self.session.mangle(&global.name).to_string(),
                linkage: global.linkage,
                bytes: global.init.to_le_bytes()[..size].to_vec(),
                alignment: size as u32,
                ty: global.ty,
            });
        }
        Ok(object)
    }
}

impl Layer for CompileLayer {
    fn emit(&self, guard: MaterializationGuard, module: Module) -> Result<(), AddModuleError> {
        match self.compile(&module) {
            Ok(object) => Ok(self.linker.link(guard, object)?),
            Err(err) => {
                guard.fail(err.to_string());
                Err(err.into())
            }
        }
    }
}
