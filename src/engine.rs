//! JIT engine facade
//!
//! Wires the session, the main dylib, and the layer stack together behind a
//! small API: submit IR modules, look up symbols, and manage resource
//! trackers. Modules are consumed on submission; once handed to the engine
//! they belong to the pipeline.

use std::sync::Arc;

use crate::backend::CraneliftBackend;
use crate::dylib::{JitDylib, LookupError, RemoveError, ResourceTracker, SymbolDef};
use crate::generator::ProcessSymbolGenerator;
use crate::ir::{verify_module, DataLayout, Module, VerifyPolicy};
use crate::link::ObjectLinkingLayer;
use crate::pipeline::optimize::{ModuleTransform, Optimizer};
use crate::pipeline::{AddModuleError, CompileLayer, Layer, TransformLayer};
use crate::session::{ExecutionSession, InitError};

/// Engine construction options
pub struct JitConfig {
    /// What to do with modules that fail structural verification
    pub verify: VerifyPolicy,
    /// Transform strategy; `None` means the standard optimizer pipeline
    pub transform: Option<Arc<dyn ModuleTransform>>,
    /// Install the process-symbol generator on the main dylib
    pub expose_process_symbols: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig { verify: VerifyPolicy::Strict, transform: None, expose_process_symbols: true }
    }
}

/// An in-process JIT: compile IR modules, link them, call into them
pub struct JitEngine {
    session: Arc<ExecutionSession>,
    main: Arc<JitDylib>,
    entry: Arc<dyn Layer>,
    verify: VerifyPolicy,
}

impl JitEngine {
    /// Engine with default configuration for the host machine
    pub fn create() -> Result<Self, InitError> {
        Self::with_config(JitConfig::default())
    }

    pub fn with_config(config: JitConfig) -> Result<Self, InitError> {
        let session = ExecutionSession::new()?;
        let backend = Arc::new(CraneliftBackend::from_isa(Arc::clone(session.isa())));
        let linker = Arc::new(ObjectLinkingLayer::new());
        if session.target().is_coff {
            linker.set_autoclaim_exports(true);
        }

        let main = session.create_dylib("main");
        if config.expose_process_symbols {
            main.add_generator(Box::new(ProcessSymbolGenerator::new(
                session.target().global_prefix,
            )));
        }

        let compile = Arc::new(CompileLayer::new(Arc::clone(&session), backend, linker));
        let transform =
            config.transform.unwrap_or_else(|| Arc::new(Optimizer::new()) as Arc<dyn ModuleTransform>);
        let entry: Arc<dyn Layer> = Arc::new(TransformLayer::new(transform, compile));

        Ok(JitEngine { session, main, entry, verify: config.verify })
    }

    /// Compile and link a module into the main dylib under its default
    /// tracker
    pub fn add_module(&self, module: Module) -> Result<(), AddModuleError> {
        self.add_module_with_tracker(&self.main.default_tracker(), module)
    }

    /// Compile and link a module, with its definitions owned by `tracker`.
    /// Exported names are claimed before compilation starts, so a
    /// conflicting add is rejected here rather than at link time.
    pub fn add_module_with_tracker(
        &self,
        tracker: &ResourceTracker,
        mut module: Module,
    ) -> Result<(), AddModuleError> {
        match (verify_module(&module), self.verify) {
            (Err(err), VerifyPolicy::Strict) => return Err(err.into()),
            (Err(err), VerifyPolicy::Permissive) => self.session.report_error(&err),
            (Ok(()), _) => {}
        }

        let target = self.session.target();
        module.layout =
            Some(DataLayout { pointer_bytes: target.pointer_bytes, little_endian: true });

        let names: Vec<String> = module
            .exported_names()
            .iter()
            .map(|name| self.session.mangle(name).to_string())
            .collect();
        let guard = self.main.begin_materialization(tracker, names)?;
        self.entry.emit(guard, module)
    }

    /// Look up an exported symbol by its IR name, blocking while it is
    /// still materializing
    pub fn lookup(&self, name: &str) -> Result<SymbolDef, LookupError> {
        let mangled = self.session.mangle(name);
        self.session.lookup(std::slice::from_ref(&self.main), &mangled)
    }

    /// Create a tracker for a removable batch of modules
    pub fn create_resource_tracker(&self) -> ResourceTracker {
        self.main.create_tracker()
    }

    /// Remove a tracker: its symbols vanish and its memory is unmapped
    pub fn remove_tracker(&self, tracker: &ResourceTracker) -> Result<(), RemoveError> {
        self.main.remove_tracker(tracker)
    }

    pub fn session(&self) -> &Arc<ExecutionSession> {
        &self.session
    }

    pub fn main_dylib(&self) -> &Arc<JitDylib> {
        &self.main
    }

    /// Render every dylib's symbol table for diagnostics
    pub fn dump(&self) -> String {
        self.session.dump()
    }
}
