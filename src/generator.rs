//! Definition generators
//!
//! A generator is a fallback consulted when a dylib lookup misses the symbol
//! table. The main use is exposing symbols of the host process (libc and
//! friends) to JIT code without declaring them one by one.

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::dylib::{SymbolDef, SymbolFlags};

/// A generator failed while searching for a definition
#[derive(Debug, Error)]
#[error("{0}")]
pub struct GeneratorError(pub String);

/// Fallback source of symbol definitions for a dylib
pub trait DefinitionGenerator: Send + Sync {
    /// Try to produce a definition for a mangled name. `Ok(None)` means the
    /// generator does not know the symbol and the search continues.
    fn try_generate(&self, name: &str) -> Result<Option<SymbolDef>, GeneratorError>;
}

/// Exposes the exported symbols of the current process
pub struct ProcessSymbolGenerator {
    /// Mangling prefix of the target, stripped before the OS lookup
    global_prefix: Option<char>,
}

impl ProcessSymbolGenerator {
    pub fn new(global_prefix: Option<char>) -> Self {
        ProcessSymbolGenerator { global_prefix }
    }

    fn unmangle<'a>(&self, name: &'a str) -> &'a str {
        match self.global_prefix {
            Some(prefix) => name.strip_prefix(prefix).unwrap_or(name),
            None => name,
        }
    }
}

impl DefinitionGenerator for ProcessSymbolGenerator {
    #[cfg(unix)]
    fn try_generate(&self, name: &str) -> Result<Option<SymbolDef>, GeneratorError> {
        let raw = self.unmangle(name);
        let c_name = std::ffi::CString::new(raw)
            .map_err(|_| GeneratorError(format!("symbol name '{raw}' contains a NUL byte")))?;
        // Safety: dlsym against RTLD_DEFAULT searches the global namespace
        let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
        if addr.is_null() {
            return Ok(None);
        }
        Ok(Some(SymbolDef {
            address: addr as usize,
            flags: SymbolFlags { exported: true, callable: true, weak: false },
        }))
    }

    #[cfg(not(unix))]
    fn try_generate(&self, name: &str) -> Result<Option<SymbolDef>, GeneratorError> {
        let _ = self.unmangle(name);
        Ok(None)
    }
}

/// Serves definitions out of a fixed map; useful in tests and for exposing a
/// hand-picked set of host functions.
pub struct StaticSymbolGenerator {
    symbols: FxHashMap<String, SymbolDef>,
}

impl StaticSymbolGenerator {
    pub fn new() -> Self {
        StaticSymbolGenerator { symbols: FxHashMap::default() }
    }

    pub fn with_symbol(mut self, name: impl Into<String>, def: SymbolDef) -> Self {
        self.symbols.insert(name.into(), def);
        self
    }
}

impl Default for StaticSymbolGenerator {
    fn default() -> Self {
        StaticSymbolGenerator::new()
    }
}

impl DefinitionGenerator for StaticSymbolGenerator {
    fn try_generate(&self, name: &str) -> Result<Option<SymbolDef>, GeneratorError> {
        Ok(self.symbols.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_generator() {
        let def = SymbolDef { address: 0xABCD, flags: SymbolFlags::code() };
        let generator = StaticSymbolGenerator::new().with_symbol("helper", def);
        assert_eq!(generator.try_generate("helper").unwrap().unwrap().address, 0xABCD);
        assert!(generator.try_generate("other").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_generator_finds_libc() {
        let generator = ProcessSymbolGenerator::new(None);
        let found = generator.try_generate("strlen").unwrap();
        assert!(found.is_some());
        assert!(generator.try_generate("definitely_not_a_real_symbol_xyz").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_generator_strips_prefix() {
        let generator = ProcessSymbolGenerator::new(Some('_'));
        assert_eq!(generator.unmangle("_strlen"), "strlen");
        assert_eq!(generator.unmangle("strlen"), "strlen");
    }
}
