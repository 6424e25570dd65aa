//! IR construction helper
//!
//! Thin convenience layer for building functions instruction by instruction.

use super::instr::{BlockId, FloatCond, Function, Instr, IntCond, Reg, Terminator};
use super::types::Type;

/// Builder that simplifies IR construction
pub struct FuncBuilder<'a> {
    func: &'a mut Function,
    current_block: BlockId,
}

impl<'a> FuncBuilder<'a> {
    /// Create a builder targeting a function; creates the entry block if the
    /// function has none yet.
    pub fn new(func: &'a mut Function) -> Self {
        if func.blocks.is_empty() {
            func.add_block();
        }
        let entry = func.entry;
        FuncBuilder { func, current_block: entry }
    }

    /// Create a new basic block
    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    /// Switch to emitting into a different block
    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    /// Get the current block ID
    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Allocate a new virtual register with the given type
    pub fn alloc_reg(&mut self, ty: Type) -> Reg {
        self.func.alloc_reg(ty)
    }

    /// Emit an instruction into the current block
    pub fn emit(&mut self, instr: Instr) {
        self.func.block_mut(self.current_block).instrs.push(instr);
    }

    /// Set the terminator for the current block
    pub fn terminate(&mut self, term: Terminator) {
        self.func.block_mut(self.current_block).terminator = term;
    }

    pub fn const_i32(&mut self, value: i32) -> Reg {
        let dest = self.alloc_reg(Type::I32);
        self.emit(Instr::ConstI32 { dest, value });
        dest
    }

    pub fn const_i64(&mut self, value: i64) -> Reg {
        let dest = self.alloc_reg(Type::I64);
        self.emit(Instr::ConstI64 { dest, value });
        dest
    }

    pub fn const_f64(&mut self, value: f64) -> Reg {
        let dest = self.alloc_reg(Type::F64);
        self.emit(Instr::ConstF64 { dest, value });
        dest
    }

    pub fn const_bool(&mut self, value: bool) -> Reg {
        let dest = self.alloc_reg(Type::Bool);
        self.emit(Instr::ConstBool { dest, value });
        dest
    }

    pub fn iadd(&mut self, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(self.func.reg_type(left));
        self.emit(Instr::IAdd { dest, left, right });
        dest
    }

    pub fn isub(&mut self, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(self.func.reg_type(left));
        self.emit(Instr::ISub { dest, left, right });
        dest
    }

    pub fn imul(&mut self, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(self.func.reg_type(left));
        self.emit(Instr::IMul { dest, left, right });
        dest
    }

    pub fn fadd(&mut self, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(Type::F64);
        self.emit(Instr::FAdd { dest, left, right });
        dest
    }

    pub fn icmp(&mut self, cond: IntCond, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(Type::Bool);
        self.emit(Instr::ICmp { dest, cond, left, right });
        dest
    }

    pub fn fcmp(&mut self, cond: FloatCond, left: Reg, right: Reg) -> Reg {
        let dest = self.alloc_reg(Type::Bool);
        self.emit(Instr::FCmp { dest, cond, left, right });
        dest
    }

    /// Call a named symbol returning a value of type `ret`
    pub fn call(&mut self, callee: impl Into<String>, args: Vec<Reg>, ret: Type) -> Reg {
        let dest = self.alloc_reg(ret);
        self.emit(Instr::Call { dest: Some(dest), callee: callee.into(), args });
        dest
    }

    /// Call a named symbol with no return value
    pub fn call_void(&mut self, callee: impl Into<String>, args: Vec<Reg>) {
        self.emit(Instr::Call { dest: None, callee: callee.into(), args });
    }

    /// Materialize the address of a named symbol
    pub fn global_addr(&mut self, name: impl Into<String>) -> Reg {
        let dest = self.alloc_reg(Type::Ptr);
        self.emit(Instr::GlobalAddr { dest, name: name.into() });
        dest
    }

    pub fn load(&mut self, ty: Type, addr: Reg, offset: i32) -> Reg {
        let dest = self.alloc_reg(ty);
        self.emit(Instr::Load { dest, ty, addr, offset });
        dest
    }

    pub fn store(&mut self, addr: Reg, value: Reg, offset: i32) {
        self.emit(Instr::Store { addr, value, offset });
    }

    pub fn ret(&mut self, value: Option<Reg>) {
        self.terminate(Terminator::Return(value));
    }

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump(target));
    }

    pub fn branch(&mut self, cond: Reg, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::Branch { cond, then_block, else_block });
    }

    /// Access the underlying function
    pub fn func(&self) -> &Function {
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::module::Linkage;
    use crate::ir::Signature;

    #[test]
    fn test_builder_const_return() {
        let mut func = Function::new("answer", Signature::returning(Type::I32), Linkage::Export);
        let mut b = FuncBuilder::new(&mut func);
        let v = b.const_i32(42);
        b.ret(Some(v));

        assert_eq!(func.blocks.len(), 1);
        assert_eq!(func.instr_count(), 1);
        assert!(matches!(func.blocks[0].terminator, Terminator::Return(Some(_))));
    }

    #[test]
    fn test_builder_branch() {
        let mut func = Function::new("pick", Signature::returning(Type::I32), Linkage::Export);
        let mut b = FuncBuilder::new(&mut func);
        let then_block = b.create_block();
        let else_block = b.create_block();
        let c = b.const_bool(true);
        b.branch(c, then_block, else_block);
        b.switch_to_block(then_block);
        let one = b.const_i32(1);
        b.ret(Some(one));
        b.switch_to_block(else_block);
        let two = b.const_i32(2);
        b.ret(Some(two));

        assert_eq!(func.blocks.len(), 3);
        assert!(matches!(func.blocks[0].terminator, Terminator::Branch { .. }));
    }
}
