//! IR instructions, blocks, and functions
//!
//! Instructions operate on virtual registers and are grouped into basic blocks
//! with explicit terminators, in the style of a lightweight SSA form: each
//! register should be assigned once, and cross-block merges are expressed by
//! re-assigning through `Move` in predecessor blocks.

use rustc_hash::FxHashMap;

use super::types::Type;

/// Virtual register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Integer comparison condition (signed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Float comparison condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Function signature: parameter types and optional return type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Option<Type>,
}

impl Signature {
    /// Signature with no parameters and no return value
    pub fn void() -> Self {
        Signature { params: vec![], ret: None }
    }

    /// Signature returning a single value with no parameters
    pub fn returning(ty: Type) -> Self {
        Signature { params: vec![], ret: Some(ty) }
    }
}

/// An IR instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // ===== Constants =====
    ConstI32 { dest: Reg, value: i32 },
    ConstI64 { dest: Reg, value: i64 },
    ConstF64 { dest: Reg, value: f64 },
    ConstBool { dest: Reg, value: bool },

    // ===== Integer arithmetic =====
    IAdd { dest: Reg, left: Reg, right: Reg },
    ISub { dest: Reg, left: Reg, right: Reg },
    IMul { dest: Reg, left: Reg, right: Reg },
    IDiv { dest: Reg, left: Reg, right: Reg },
    IRem { dest: Reg, left: Reg, right: Reg },
    INeg { dest: Reg, operand: Reg },

    // ===== Integer bitwise =====
    IAnd { dest: Reg, left: Reg, right: Reg },
    IOr { dest: Reg, left: Reg, right: Reg },
    IXor { dest: Reg, left: Reg, right: Reg },
    IShl { dest: Reg, left: Reg, right: Reg },
    IShr { dest: Reg, left: Reg, right: Reg },
    INot { dest: Reg, operand: Reg },

    // ===== Float arithmetic =====
    FAdd { dest: Reg, left: Reg, right: Reg },
    FSub { dest: Reg, left: Reg, right: Reg },
    FMul { dest: Reg, left: Reg, right: Reg },
    FDiv { dest: Reg, left: Reg, right: Reg },
    FNeg { dest: Reg, operand: Reg },

    // ===== Comparison =====
    ICmp { dest: Reg, cond: IntCond, left: Reg, right: Reg },
    FCmp { dest: Reg, cond: FloatCond, left: Reg, right: Reg },

    // ===== Register copy =====
    Move { dest: Reg, src: Reg },

    // ===== Symbolic references =====
    /// Call a named symbol (intra-module, another module, or a process symbol).
    /// The callee signature is derived from the argument and destination types.
    Call { dest: Option<Reg>, callee: String, args: Vec<Reg> },
    /// Materialize the address of a named data or code symbol
    GlobalAddr { dest: Reg, name: String },

    // ===== Memory =====
    Load { dest: Reg, ty: Type, addr: Reg, offset: i32 },
    Store { addr: Reg, value: Reg, offset: i32 },
}

impl Instr {
    /// Destination register, if this instruction produces a value
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Instr::ConstI32 { dest, .. }
            | Instr::ConstI64 { dest, .. }
            | Instr::ConstF64 { dest, .. }
            | Instr::ConstBool { dest, .. }
            | Instr::IAdd { dest, .. }
            | Instr::ISub { dest, .. }
            | Instr::IMul { dest, .. }
            | Instr::IDiv { dest, .. }
            | Instr::IRem { dest, .. }
            | Instr::INeg { dest, .. }
            | Instr::IAnd { dest, .. }
            | Instr::IOr { dest, .. }
            | Instr::IXor { dest, .. }
            | Instr::IShl { dest, .. }
            | Instr::IShr { dest, .. }
            | Instr::INot { dest, .. }
            | Instr::FAdd { dest, .. }
            | Instr::FSub { dest, .. }
            | Instr::FMul { dest, .. }
            | Instr::FDiv { dest, .. }
            | Instr::FNeg { dest, .. }
            | Instr::ICmp { dest, .. }
            | Instr::FCmp { dest, .. }
            | Instr::Move { dest, .. }
            | Instr::GlobalAddr { dest, .. }
            | Instr::Load { dest, .. } => Some(*dest),
            Instr::Call { dest, .. } => *dest,
            Instr::Store { .. } => None,
        }
    }

    /// Whether this instruction has side effects (can't be removed or merged)
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Instr::Call { .. } | Instr::Store { .. })
    }

    /// Visit every register this instruction reads
    pub fn visit_uses(&self, mut f: impl FnMut(Reg)) {
        match self {
            Instr::ConstI32 { .. }
            | Instr::ConstI64 { .. }
            | Instr::ConstF64 { .. }
            | Instr::ConstBool { .. }
            | Instr::GlobalAddr { .. } => {}

            Instr::IAdd { left, right, .. }
            | Instr::ISub { left, right, .. }
            | Instr::IMul { left, right, .. }
            | Instr::IDiv { left, right, .. }
            | Instr::IRem { left, right, .. }
            | Instr::IAnd { left, right, .. }
            | Instr::IOr { left, right, .. }
            | Instr::IXor { left, right, .. }
            | Instr::IShl { left, right, .. }
            | Instr::IShr { left, right, .. }
            | Instr::FAdd { left, right, .. }
            | Instr::FSub { left, right, .. }
            | Instr::FMul { left, right, .. }
            | Instr::FDiv { left, right, .. }
            | Instr::ICmp { left, right, .. }
            | Instr::FCmp { left, right, .. } => {
                f(*left);
                f(*right);
            }

            Instr::INeg { operand, .. }
            | Instr::INot { operand, .. }
            | Instr::FNeg { operand, .. } => f(*operand),

            Instr::Move { src, .. } => f(*src),

            Instr::Call { args, .. } => {
                for arg in args {
                    f(*arg);
                }
            }

            Instr::Load { addr, .. } => f(*addr),
            Instr::Store { addr, value, .. } => {
                f(*addr);
                f(*value);
            }
        }
    }

    /// Rewrite every register this instruction reads
    pub fn visit_uses_mut(&mut self, mut f: impl FnMut(&mut Reg)) {
        match self {
            Instr::ConstI32 { .. }
            | Instr::ConstI64 { .. }
            | Instr::ConstF64 { .. }
            | Instr::ConstBool { .. }
            | Instr::GlobalAddr { .. } => {}

            Instr::IAdd { left, right, .. }
            | Instr::ISub { left, right, .. }
            | Instr::IMul { left, right, .. }
            | Instr::IDiv { left, right, .. }
            | Instr::IRem { left, right, .. }
            | Instr::IAnd { left, right, .. }
            | Instr::IOr { left, right, .. }
            | Instr::IXor { left, right, .. }
            | Instr::IShl { left, right, .. }
            | Instr::IShr { left, right, .. }
            | Instr::FAdd { left, right, .. }
            | Instr::FSub { left, right, .. }
            | Instr::FMul { left, right, .. }
            | Instr::FDiv { left, right, .. }
            | Instr::ICmp { left, right, .. }
            | Instr::FCmp { left, right, .. } => {
                f(left);
                f(right);
            }

            Instr::INeg { operand, .. }
            | Instr::INot { operand, .. }
            | Instr::FNeg { operand, .. } => f(operand),

            Instr::Move { src, .. } => f(src),

            Instr::Call { args, .. } => {
                for arg in args {
                    f(arg);
                }
            }

            Instr::Load { addr, .. } => f(addr),
            Instr::Store { addr, value, .. } => {
                f(addr);
                f(value);
            }
        }
    }
}

/// How a block terminates
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Unconditional jump to target block
    Jump(BlockId),
    /// Conditional branch on a boolean register
    Branch { cond: Reg, then_block: BlockId, else_block: BlockId },
    /// Return with an optional value
    Return(Option<Reg>),
    /// Trap: control must never reach here
    Unreachable,
    /// Placeholder terminator (not yet assigned)
    None,
}

impl Terminator {
    /// Visit every register this terminator reads
    pub fn visit_uses(&self, mut f: impl FnMut(Reg)) {
        match self {
            Terminator::Branch { cond, .. } => f(*cond),
            Terminator::Return(Some(reg)) => f(*reg),
            _ => {}
        }
    }

    /// Successor blocks of this terminator
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(t) => vec![*t],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            _ => vec![],
        }
    }
}

/// A basic block
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

/// A complete IR function
#[derive(Debug, Clone)]
pub struct Function {
    /// Symbol name this function is published under
    pub name: String,
    /// Parameter and return types
    pub sig: Signature,
    /// Whether the symbol is visible outside its module
    pub linkage: super::module::Linkage,
    /// Basic blocks; `BlockId(i)` indexes `blocks[i]`
    pub blocks: Vec<Block>,
    /// Entry block
    pub entry: BlockId,
    /// Next available register number
    pub next_reg: u32,
    /// Type of each register
    pub reg_types: FxHashMap<Reg, Type>,
}

impl Function {
    /// Create a new function. Parameters are pre-bound to registers
    /// `Reg(0)..Reg(n)` in declaration order; see [`Function::param`].
    pub fn new(name: impl Into<String>, sig: Signature, linkage: super::module::Linkage) -> Self {
        let mut func = Function {
            name: name.into(),
            sig: sig.clone(),
            linkage,
            blocks: vec![],
            entry: BlockId(0),
            next_reg: 0,
            reg_types: FxHashMap::default(),
        };
        for ty in &sig.params {
            func.alloc_reg(*ty);
        }
        func
    }

    /// Register bound to the `i`-th parameter
    pub fn param(&self, i: usize) -> Reg {
        debug_assert!(i < self.sig.params.len());
        Reg(i as u32)
    }

    /// Allocate a fresh virtual register with a given type
    pub fn alloc_reg(&mut self, ty: Type) -> Reg {
        let reg = Reg(self.next_reg);
        self.next_reg += 1;
        self.reg_types.insert(reg, ty);
        reg
    }

    /// Type of a register; defaults to I64 for untyped registers
    pub fn reg_type(&self, reg: Reg) -> Type {
        self.reg_types.get(&reg).copied().unwrap_or(Type::I64)
    }

    /// Get a block by ID
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Get a mutable block by ID
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    /// Add a new block and return its ID
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block { id, instrs: vec![], terminator: Terminator::None });
        id
    }

    /// Total number of instructions across all blocks
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Names of symbols this function refers to (callees and global addresses)
    pub fn referenced_symbols(&self) -> Vec<&str> {
        let mut names = vec![];
        for block in &self.blocks {
            for instr in &block.instrs {
                match instr {
                    Instr::Call { callee, .. } => names.push(callee.as_str()),
                    Instr::GlobalAddr { name, .. } => names.push(name.as_str()),
                    _ => {}
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::module::Linkage;

    #[test]
    fn test_param_regs_preallocated() {
        let sig = Signature { params: vec![Type::I64, Type::F64], ret: Some(Type::I64) };
        let func = Function::new("f", sig, Linkage::Export);
        assert_eq!(func.param(0), Reg(0));
        assert_eq!(func.param(1), Reg(1));
        assert_eq!(func.reg_type(Reg(1)), Type::F64);
        assert_eq!(func.next_reg, 2);
    }

    #[test]
    fn test_referenced_symbols() {
        let mut func = Function::new("f", Signature::returning(Type::I64), Linkage::Export);
        let entry = func.add_block();
        let r0 = func.alloc_reg(Type::Ptr);
        let r1 = func.alloc_reg(Type::I64);
        func.block_mut(entry).instrs.push(Instr::GlobalAddr { dest: r0, name: "counter".into() });
        func.block_mut(entry)
            .instrs
            .push(Instr::Call { dest: Some(r1), callee: "helper".into(), args: vec![] });
        func.block_mut(entry).terminator = Terminator::Return(Some(r1));
        assert_eq!(func.referenced_symbols(), vec!["counter", "helper"]);
    }

    #[test]
    fn test_side_effects() {
        let store = Instr::Store { addr: Reg(0), value: Reg(1), offset: 0 };
        let add = Instr::IAdd { dest: Reg(2), left: Reg(0), right: Reg(1) };
        assert!(store.has_side_effects());
        assert!(!add.has_side_effects());
    }
}
