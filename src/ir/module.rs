//! IR modules and global data
//!
//! A module is the unit handed to `add_module`: functions plus global data
//! definitions. The facade stamps the session's data layout onto the module
//! before submission so the backend compiles against the right target widths.

use super::instr::Function;
use super::types::Type;

/// Symbol visibility of a function or global
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Published into the dynamic library; resolvable via lookup
    Export,
    /// Resolvable only from within the defining module
    Local,
}

/// A global data definition
#[derive(Debug, Clone)]
pub struct Global {
    /// Symbol name this global is published under
    pub name: String,
    /// Stored type; determines the byte size of the definition
    pub ty: Type,
    /// Initial value, truncated to the type's width
    pub init: i64,
    /// Symbol visibility
    pub linkage: Linkage,
}

/// Target data layout stamped onto a module at submission time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    /// Pointer size in bytes
    pub pointer_bytes: u8,
    /// Byte order of the target
    pub little_endian: bool,
}

/// An owned, self-contained IR module
#[derive(Debug, Clone)]
pub struct Module {
    /// Module name (diagnostics only; symbols are not namespaced by it)
    pub name: String,
    /// Function definitions
    pub functions: Vec<Function>,
    /// Global data definitions
    pub globals: Vec<Global>,
    /// Target layout; `None` until the facade stamps it
    pub layout: Option<DataLayout>,
}

impl Module {
    /// Create an empty module
    pub fn new(name: impl Into<String>) -> Self {
        Module { name: name.into(), functions: vec![], globals: vec![], layout: None }
    }

    /// Add a function definition
    pub fn push_function(&mut self, func: Function) {
        self.functions.push(func);
    }

    /// Add a global data definition
    pub fn push_global(&mut self, global: Global) {
        self.globals.push(global);
    }

    /// Names of all exported symbols this module defines
    pub fn exported_names(&self) -> Vec<&str> {
        self.functions
            .iter()
            .filter(|f| f.linkage == Linkage::Export)
            .map(|f| f.name.as_str())
            .chain(
                self.globals
                    .iter()
                    .filter(|g| g.linkage == Linkage::Export)
                    .map(|g| g.name.as_str()),
            )
            .collect()
    }

    /// Names of all symbols this module defines, exported or local
    pub fn defined_names(&self) -> Vec<&str> {
        self.functions
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.globals.iter().map(|g| g.name.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instr::Signature;

    #[test]
    fn test_exported_names() {
        let mut module = Module::new("m");
        module.push_function(Function::new("pub_fn", Signature::void(), Linkage::Export));
        module.push_function(Function::new("helper", Signature::void(), Linkage::Local));
        module.push_global(Global {
            name: "counter".into(),
            ty: Type::I64,
            init: 0,
            linkage: Linkage::Export,
        });
        assert_eq!(module.exported_names(), vec!["pub_fn", "counter"]);
        assert_eq!(module.defined_names(), vec!["pub_fn", "helper", "counter"]);
    }
}
