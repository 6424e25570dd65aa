//! Kiln: an in-process JIT compile-and-link engine
//!
//! Modules of a small typed IR are optimized, compiled to native code with
//! Cranelift, linked into executable memory, and published into a symbol
//! table that can be queried by name:
//! - **IR**: typed registers, blocks, and a builder (`ir` module)
//! - **Pipeline**: transform and compile layers (`pipeline` module)
//! - **Linking**: layout, relocation patching, page protection (`link` module)
//! - **Dylibs**: symbol tables, generators, resource trackers (`dylib` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln::{FuncBuilder, Function, JitEngine, Linkage, Module, Signature, Type};
//!
//! let mut func = Function::new("answer", Signature::returning(Type::I32), Linkage::Export);
//! let mut b = FuncBuilder::new(&mut func);
//! let v = b.const_i32(42);
//! b.ret(Some(v));
//!
//! let mut module = Module::new("demo");
//! module.push_function(func);
//!
//! let engine = JitEngine::create()?;
//! engine.add_module(module)?;
//!
//! let sym = engine.lookup("answer")?;
//! let answer: extern "C" fn() -> i32 = unsafe { std::mem::transmute(sym.address) };
//! assert_eq!(answer(), 42);
//! ```

#![warn(rust_2018_idioms)]

pub mod backend;
pub mod dylib;
pub mod engine;
pub mod generator;
pub mod ir;
pub mod link;
pub mod pipeline;
pub mod session;

pub use dylib::{
    JitDylib, LookupError, MaterializationGuard, MaterializeError, RemoveError, ResourceTracker,
    SymbolDef, SymbolFlags,
};
pub use engine::{JitConfig, JitEngine};
pub use generator::{DefinitionGenerator, ProcessSymbolGenerator, StaticSymbolGenerator};
pub use ir::{
    FuncBuilder, Function, Instr, Linkage, Module, Signature, Type, VerifyPolicy,
};
pub use pipeline::optimize::{ModuleTransform, Optimizer, TransformPass};
pub use pipeline::AddModuleError;
pub use session::{ExecutionSession, InitError, TargetDescriptor};
