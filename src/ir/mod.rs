//! Typed register IR accepted by the engine.
//!
//! A [`Module`] is the unit of submission: a set of functions (basic blocks of
//! instructions over virtual registers, with explicit terminators) plus global
//! data definitions. Modules are owned values; `add_module` consumes them.

pub mod builder;
pub mod display;
pub mod instr;
pub mod module;
pub mod types;
pub mod verify;

pub use builder::FuncBuilder;
pub use instr::{Block, BlockId, FloatCond, Function, Instr, IntCond, Reg, Signature, Terminator};
pub use module::{DataLayout, Global, Linkage, Module};
pub use types::Type;
pub use verify::{verify_module, VerifyError, VerifyPolicy};
