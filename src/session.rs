//! Execution session: shared state behind all dylibs of one JIT instance
//!
//! Owns the host ISA (initialized exactly once per process), the target
//! descriptor derived from it, the symbol mangler, the dylib registry, and
//! the error sink that collects failures reported by permissive verification
//! and background materialization.

use std::sync::Arc;

use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use target_lexicon::{BinaryFormat, Triple};
use thiserror::Error;

use crate::dylib::{JitDylib, LookupError, SymbolDef};

/// Session construction failed
#[derive(Debug, Error)]
pub enum InitError {
    #[error("host target is not supported: {0}")]
    UnsupportedHost(String),
    #[error("invalid codegen flags: {0}")]
    Flags(String),
}

static HOST_ISA: OnceCell<Arc<dyn TargetIsa>> = OnceCell::new();

/// The host ISA, built on first use and shared by every session in the
/// process. Construction failures are returned to each caller rather than
/// poisoning the process.
pub fn host_isa() -> Result<Arc<dyn TargetIsa>, InitError> {
    HOST_ISA
        .get_or_try_init(|| {
            let mut flag_builder = settings::builder();
            flag_builder
                .set("opt_level", "speed")
                .map_err(|e| InitError::Flags(e.to_string()))?;
            // Linking patches absolute addresses, so PIC buys nothing here.
            flag_builder
                .set("is_pic", "false")
                .map_err(|e| InitError::Flags(e.to_string()))?;
            let flags = settings::Flags::new(flag_builder);

            cranelift_native::builder()
                .map_err(|e| InitError::UnsupportedHost(e.to_string()))?
                .finish(flags)
                .map_err(|e| InitError::UnsupportedHost(e.to_string()))
        })
        .cloned()
}

/// Facts about the compilation target that affect symbol handling
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub triple: Triple,
    pub pointer_bytes: u8,
    /// Prefix the target's object format puts on global symbols
    pub global_prefix: Option<char>,
    /// COFF targets need exported-definition auto-claim in the linker
    pub is_coff: bool,
}

impl TargetDescriptor {
    pub fn from_isa(isa: &dyn TargetIsa) -> Self {
        let triple = isa.triple().clone();
        let format = triple.binary_format;
        TargetDescriptor {
            pointer_bytes: isa.pointer_bytes(),
            global_prefix: (format == BinaryFormat::Macho).then_some('_'),
            is_coff: format == BinaryFormat::Coff,
            triple,
        }
    }
}

/// Shared JIT state: ISA, mangler, dylib registry, error sink
pub struct ExecutionSession {
    isa: Arc<dyn TargetIsa>,
    target: TargetDescriptor,
    mangled: Mutex<FxHashMap<String, Arc<str>>>,
    dylibs: Mutex<Vec<Arc<JitDylib>>>,
    errors: Mutex<Vec<String>>,
}

impl ExecutionSession {
    /// Create a session for the host machine
    pub fn new() -> Result<Arc<Self>, InitError> {
        Ok(Self::with_isa(host_isa()?))
    }

    /// Create a session with an explicit ISA
    pub fn with_isa(isa: Arc<dyn TargetIsa>) -> Arc<Self> {
        let target = TargetDescriptor::from_isa(&*isa);
        Arc::new(ExecutionSession {
            isa,
            target,
            mangled: Mutex::new(FxHashMap::default()),
            dylibs: Mutex::new(vec![]),
            errors: Mutex::new(vec![]),
        })
    }

    pub fn isa(&self) -> &Arc<dyn TargetIsa> {
        &self.isa
    }

    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    /// Mangle an IR symbol name for the target. Memoized; mangling the same
    /// input always yields the same interned string.
    pub fn mangle(&self, name: &str) -> Arc<str> {
        let mut mangled = self.mangled.lock();
        if let Some(interned) = mangled.get(name) {
            return Arc::clone(interned);
        }
        let out: Arc<str> = match self.target.global_prefix {
            Some(prefix) => format!("{prefix}{name}").into(),
            None => name.into(),
        };
        mangled.insert(name.to_string(), Arc::clone(&out));
        out
    }

    /// Create and register a named dylib
    pub fn create_dylib(&self, name: impl Into<String>) -> Arc<JitDylib> {
        let dylib = JitDylib::new(name);
        self.dylibs.lock().push(Arc::clone(&dylib));
        dylib
    }

    /// Find a registered dylib by name
    pub fn dylib(&self, name: &str) -> Option<Arc<JitDylib>> {
        self.dylibs.lock().iter().find(|d| d.name() == name).cloned()
    }

    /// Search an ordered list of dylibs for a mangled name. Blocks while a
    /// hit is still materializing; a miss moves on to the next dylib.
    pub fn lookup(
        &self,
        search: &[Arc<JitDylib>],
        mangled: &str,
    ) -> Result<SymbolDef, LookupError> {
        for dylib in search {
            if let Some(def) = dylib.resolve_blocking(mangled)? {
                return Ok(def);
            }
        }
        Err(LookupError::Unresolved { name: mangled.to_string() })
    }

    /// Record a background failure for later collection
    pub fn report_error(&self, error: impl std::fmt::Display) {
        self.errors.lock().push(error.to_string());
    }

    /// Drain every error reported since the last call
    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.lock())
    }

    /// Render every registered dylib's symbol table
    pub fn dump(&self) -> String {
        let dylibs = self.dylibs.lock();
        dylibs.iter().map(|d| d.dump()).collect::<Vec<_>>().join("")
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        // Errors nobody collected still deserve to be seen.
        for error in self.errors.get_mut().drain(..) {
            eprintln!("uncollected JIT error: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dylib::SymbolFlags;

    #[test]
    fn test_mangle_is_idempotent_and_interned() {
        let session = ExecutionSession::new().unwrap();
        let a = session.mangle("testFun");
        let b = session.mangle("testFun");
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a, &b));
        match session.target().global_prefix {
            Some(prefix) => assert_eq!(&*a, format!("{prefix}testFun")),
            None => assert_eq!(&*a, "testFun"),
        }
    }

    #[test]
    fn test_lookup_searches_dylibs_in_order() {
        let session = ExecutionSession::new().unwrap();
        let first = session.create_dylib("first");
        let second = session.create_dylib("second");
        first.define_absolute("x", 0x100, SymbolFlags::code()).unwrap();
        second.define_absolute("x", 0x200, SymbolFlags::code()).unwrap();
        second.define_absolute("y", 0x300, SymbolFlags::code()).unwrap();

        let search = [Arc::clone(&first), Arc::clone(&second)];
        assert_eq!(session.lookup(&search, "x").unwrap().address, 0x100);
        assert_eq!(session.lookup(&search, "y").unwrap().address, 0x300);
        let err = session.lookup(&search, "z").unwrap_err();
        assert!(matches!(err, LookupError::Unresolved { .. }));
    }

    #[test]
    fn test_error_sink_drains() {
        let session = ExecutionSession::new().unwrap();
        session.report_error("first failure");
        session.report_error("second failure");
        let errors = session.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(session.take_errors().is_empty());
    }

    #[test]
    fn test_host_isa_is_shared() {
        let a = host_isa().unwrap();
        let b = host_isa().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
