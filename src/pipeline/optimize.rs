//! IR-to-IR transform passes
//!
//! The default pipeline runs a fixed sequence over every function of a
//! module: instruction combining, reassociation, local value numbering, and
//! control-flow simplification. The whole pipeline sits behind the
//! [`ModuleTransform`] trait so an engine can be configured with a different
//! strategy (or none at all) without touching the layer stack.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::ir::{Block, BlockId, Function, Instr, IntCond, FloatCond, Module, Reg, Terminator, Type};

/// A transform pipeline failed
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform '{pass}' failed on function {func}: {reason}")]
    PassFailed { pass: String, func: String, reason: String },
}

/// A module-level transform strategy, applied before compilation
pub trait ModuleTransform: Send + Sync {
    fn transform(&self, module: &mut Module) -> Result<(), TransformError>;
}

/// Identity transform: passes modules through untouched
pub struct NoTransform;

impl ModuleTransform for NoTransform {
    fn transform(&self, _module: &mut Module) -> Result<(), TransformError> {
        Ok(())
    }
}

/// A single function-level optimization pass
pub trait TransformPass: Send + Sync {
    fn name(&self) -> &str;
    /// Run over one function. Returns true if anything changed.
    fn run(&self, func: &mut Function) -> bool;
}

/// The default optimizer: a fixed sequence of [`TransformPass`]es
pub struct Optimizer {
    passes: Vec<Box<dyn TransformPass>>,
}

impl Optimizer {
    /// Standard pipeline: combine, reassociate, value-number, simplify CFG
    pub fn new() -> Self {
        Optimizer {
            passes: vec![
                Box::new(InstCombine),
                Box::new(Reassociate),
                Box::new(ValueNumbering),
                Box::new(SimplifyCfg),
            ],
        }
    }

    /// Pipeline with no passes
    pub fn empty() -> Self {
        Optimizer { passes: vec![] }
    }

    /// Append a pass to the sequence
    pub fn add_pass(&mut self, pass: Box<dyn TransformPass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    /// Run every pass, in order, over one function
    pub fn run_function(&self, func: &mut Function) -> bool {
        let mut changed = false;
        for pass in &self.passes {
            changed |= pass.run(func);
        }
        changed
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::new()
    }
}

impl ModuleTransform for Optimizer {
    fn transform(&self, module: &mut Module) -> Result<(), TransformError> {
        for func in &mut module.functions {
            self.run_function(func);
        }
        Ok(())
    }
}

/// Constant value tracked within one block
#[derive(Debug, Clone, Copy, PartialEq)]
enum ConstVal {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ConstVal {
    fn as_int(self) -> Option<i64> {
        match self {
            ConstVal::Int(v) => Some(v),
            _ => None,
        }
    }
}

fn record_const(consts: &mut FxHashMap<Reg, ConstVal>, instr: &Instr) {
    match instr {
        Instr::ConstI32 { dest, value } => {
            consts.insert(*dest, ConstVal::Int(*value as i64));
        }
        Instr::ConstI64 { dest, value } => {
            consts.insert(*dest, ConstVal::Int(*value));
        }
        Instr::ConstF64 { dest, value } => {
            consts.insert(*dest, ConstVal::Float(*value));
        }
        Instr::ConstBool { dest, value } => {
            consts.insert(*dest, ConstVal::Bool(*value));
        }
        Instr::Move { dest, src } => {
            if let Some(v) = consts.get(src).copied() {
                consts.insert(*dest, v);
            } else {
                consts.remove(dest);
            }
        }
        _ => {
            if let Some(dest) = instr.dest() {
                consts.remove(&dest);
            }
        }
    }
}

fn make_int_const(dest: Reg, ty: Type, value: i64) -> Instr {
    match ty {
        Type::I32 => Instr::ConstI32 { dest, value: value as i32 },
        _ => Instr::ConstI64 { dest, value },
    }
}

fn int_cmp(cond: IntCond, a: i64, b: i64) -> bool {
    match cond {
        IntCond::Eq => a == b,
        IntCond::Ne => a != b,
        IntCond::Lt => a < b,
        IntCond::Le => a <= b,
        IntCond::Gt => a > b,
        IntCond::Ge => a >= b,
    }
}

fn float_cmp(cond: FloatCond, a: f64, b: f64) -> bool {
    match cond {
        FloatCond::Eq => a == b,
        FloatCond::Ne => a != b,
        FloatCond::Lt => a < b,
        FloatCond::Le => a <= b,
        FloatCond::Gt => a > b,
        FloatCond::Ge => a >= b,
    }
}

/// Instruction combining: constant folding and algebraic identities
pub struct InstCombine;

impl InstCombine {
    /// Fold an instruction whose operands are all known constants
    fn fold(func: &Function, consts: &FxHashMap<Reg, ConstVal>, instr: &Instr) -> Option<Instr> {
        let cv = |r: &Reg| consts.get(r).copied();
        let wrap = |dest: Reg, v: i64| {
            let ty = func.reg_type(dest);
            let v = if ty == Type::I32 { (v as i32) as i64 } else { v };
            make_int_const(dest, ty, v)
        };
        match instr {
            Instr::IAdd { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a.wrapping_add(b)))
            }
            Instr::ISub { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a.wrapping_sub(b)))
            }
            Instr::IMul { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a.wrapping_mul(b)))
            }
            Instr::IDiv { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                if b == 0 {
                    return None;
                }
                Some(wrap(*dest, a.wrapping_div(b)))
            }
            Instr::IRem { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                if b == 0 {
                    return None;
                }
                Some(wrap(*dest, a.wrapping_rem(b)))
            }
            Instr::IAnd { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a & b))
            }
            Instr::IOr { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a | b))
            }
            Instr::IXor { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a ^ b))
            }
            Instr::IShl { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a.wrapping_shl(b as u32 & 63)))
            }
            Instr::IShr { dest, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(wrap(*dest, a.wrapping_shr(b as u32 & 63)))
            }
            Instr::INeg { dest, operand } => {
                let a = cv(operand)?.as_int()?;
                Some(wrap(*dest, a.wrapping_neg()))
            }
            Instr::INot { dest, operand } => {
                let a = cv(operand)?.as_int()?;
                Some(wrap(*dest, !a))
            }
            Instr::ICmp { dest, cond, left, right } => {
                let (a, b) = (cv(left)?.as_int()?, cv(right)?.as_int()?);
                Some(Instr::ConstBool { dest: *dest, value: int_cmp(*cond, a, b) })
            }
            Instr::FAdd { dest, left, right } => match (cv(left)?, cv(right)?) {
                (ConstVal::Float(a), ConstVal::Float(b)) => {
                    Some(Instr::ConstF64 { dest: *dest, value: a + b })
                }
                _ => None,
            },
            Instr::FSub { dest, left, right } => match (cv(left)?, cv(right)?) {
                (ConstVal::Float(a), ConstVal::Float(b)) => {
                    Some(Instr::ConstF64 { dest: *dest, value: a - b })
                }
                _ => None,
            },
            Instr::FMul { dest, left, right } => match (cv(left)?, cv(right)?) {
                (ConstVal::Float(a), ConstVal::Float(b)) => {
                    Some(Instr::ConstF64 { dest: *dest, value: a * b })
                }
                _ => None,
            },
            Instr::FDiv { dest, left, right } => match (cv(left)?, cv(right)?) {
                (ConstVal::Float(a), ConstVal::Float(b)) => {
                    Some(Instr::ConstF64 { dest: *dest, value: a / b })
                }
                _ => None,
            },
            Instr::FNeg { dest, operand } => match cv(operand)? {
                ConstVal::Float(a) => Some(Instr::ConstF64 { dest: *dest, value: -a }),
                _ => None,
            },
            Instr::FCmp { dest, cond, left, right } => match (cv(left)?, cv(right)?) {
                (ConstVal::Float(a), ConstVal::Float(b)) => {
                    Some(Instr::ConstBool { dest: *dest, value: float_cmp(*cond, a, b) })
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Rewrite single-constant algebraic identities
    fn simplify(
        func: &Function,
        consts: &FxHashMap<Reg, ConstVal>,
        instr: &Instr,
    ) -> Option<Instr> {
        let cv = |r: &Reg| consts.get(r).and_then(|v| v.as_int());
        match instr {
            Instr::IAdd { dest, left, right } | Instr::IOr { dest, left, right }
            | Instr::IXor { dest, left, right } => {
                if cv(right) == Some(0) {
                    Some(Instr::Move { dest: *dest, src: *left })
                } else if cv(left) == Some(0) {
                    Some(Instr::Move { dest: *dest, src: *right })
                } else {
                    None
                }
            }
            Instr::ISub { dest, left, right }
            | Instr::IShl { dest, left, right }
            | Instr::IShr { dest, left, right } => {
                if cv(right) == Some(0) {
                    Some(Instr::Move { dest: *dest, src: *left })
                } else {
                    None
                }
            }
            Instr::IMul { dest, left, right } => {
                if cv(right) == Some(1) {
                    Some(Instr::Move { dest: *dest, src: *left })
                } else if cv(left) == Some(1) {
                    Some(Instr::Move { dest: *dest, src: *right })
                } else if cv(right) == Some(0) || cv(left) == Some(0) {
                    Some(make_int_const(*dest, func.reg_type(*dest), 0))
                } else {
                    None
                }
            }
            Instr::IAnd { dest, left, right } => {
                if cv(right) == Some(0) || cv(left) == Some(0) {
                    Some(make_int_const(*dest, func.reg_type(*dest), 0))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl TransformPass for InstCombine {
    fn name(&self) -> &str {
        "instcombine"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut changed = false;
        for bi in 0..func.blocks.len() {
            let mut consts: FxHashMap<Reg, ConstVal> = FxHashMap::default();
            let instrs = std::mem::take(&mut func.blocks[bi].instrs);
            let mut out = Vec::with_capacity(instrs.len());
            for instr in instrs {
                let rewritten = Self::fold(func, &consts, &instr)
                    .or_else(|| Self::simplify(func, &consts, &instr));
                let instr = match rewritten {
                    Some(new) => {
                        changed = true;
                        new
                    }
                    None => instr,
                };
                record_const(&mut consts, &instr);
                out.push(instr);
            }
            func.blocks[bi].instrs = out;
        }
        changed
    }
}

/// Reassociation: canonicalize constants to the right-hand side of
/// commutative integer operations, and fold chains like (x + c1) + c2.
pub struct Reassociate;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ChainOp {
    Add,
    Mul,
}

impl TransformPass for Reassociate {
    fn name(&self) -> &str {
        "reassociate"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut changed = false;
        for bi in 0..func.blocks.len() {
            let mut consts: FxHashMap<Reg, ConstVal> = FxHashMap::default();
            // dest -> (op, non-const operand, folded constant)
            let mut chains: FxHashMap<Reg, (ChainOp, Reg, i64)> = FxHashMap::default();
            let instrs = std::mem::take(&mut func.blocks[bi].instrs);
            let mut out = Vec::with_capacity(instrs.len());
            for mut instr in instrs {
                let cv = |consts: &FxHashMap<Reg, ConstVal>, r: &Reg| {
                    consts.get(r).and_then(|v| v.as_int())
                };

                // Constant on the left of a commutative op moves right.
                match &mut instr {
                    Instr::IAdd { left, right, .. }
                    | Instr::IMul { left, right, .. }
                    | Instr::IAnd { left, right, .. }
                    | Instr::IOr { left, right, .. }
                    | Instr::IXor { left, right, .. } => {
                        if cv(&consts, left).is_some() && cv(&consts, right).is_none() {
                            std::mem::swap(left, right);
                            changed = true;
                        }
                    }
                    _ => {}
                }

                let chain_op = match &instr {
                    Instr::IAdd { .. } => Some(ChainOp::Add),
                    Instr::IMul { .. } => Some(ChainOp::Mul),
                    _ => None,
                };
                if let (Some(op), Instr::IAdd { dest, left, right } | Instr::IMul { dest, left, right }) =
                    (chain_op, &instr)
                {
                    if let Some(c2) = cv(&consts, right) {
                        if let Some((prev_op, base, c1)) = chains.get(left).copied() {
                            if prev_op == op {
                                let folded = match op {
                                    ChainOp::Add => c1.wrapping_add(c2),
                                    ChainOp::Mul => c1.wrapping_mul(c2),
                                };
                                let ty = func.reg_type(*right);
                                let c_reg = func.alloc_reg(ty);
                                let (dest, base) = (*dest, base);
                                out.push(make_int_const(c_reg, ty, folded));
                                consts.insert(c_reg, ConstVal::Int(folded));
                                instr = match op {
                                    ChainOp::Add => {
                                        Instr::IAdd { dest, left: base, right: c_reg }
                                    }
                                    ChainOp::Mul => {
                                        Instr::IMul { dest, left: base, right: c_reg }
                                    }
                                };
                                changed = true;
                            }
                        }
                    }
                }

                // Record folding state for this definition.
                if let (Some(op), Instr::IAdd { dest, left, right } | Instr::IMul { dest, left, right }) =
                    (chain_op, &instr)
                {
                    match cv(&consts, right) {
                        Some(c) if cv(&consts, left).is_none() => {
                            chains.insert(*dest, (op, *left, c));
                        }
                        _ => {
                            chains.remove(dest);
                        }
                    }
                } else if let Some(dest) = instr.dest() {
                    chains.remove(&dest);
                }
                record_const(&mut consts, &instr);
                out.push(instr);
            }
            func.blocks[bi].instrs = out;
        }
        changed
    }
}

/// Local value numbering: within each block, a pure instruction identical to
/// an earlier one is replaced with a copy of the earlier result.
pub struct ValueNumbering;

/// Structural identity of a pure instruction, ignoring its destination.
/// Floats key on their bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ValueKey {
    ConstI32(i32),
    ConstI64(i64),
    ConstF64(u64),
    ConstBool(bool),
    Binary(&'static str, Reg, Reg),
    Unary(&'static str, Reg),
    ICmp(IntCond, Reg, Reg),
    FCmp(FloatCond, Reg, Reg),
    GlobalAddr(String),
}

impl ValueKey {
    /// Key for an instruction, or `None` if it must not be merged (side
    /// effects, memory reads, plain copies).
    fn of(instr: &Instr) -> Option<ValueKey> {
        let key = match instr {
            Instr::ConstI32 { value, .. } => ValueKey::ConstI32(*value),
            Instr::ConstI64 { value, .. } => ValueKey::ConstI64(*value),
            Instr::ConstF64 { value, .. } => ValueKey::ConstF64(value.to_bits()),
            Instr::ConstBool { value, .. } => ValueKey::ConstBool(*value),
            Instr::IAdd { left, right, .. } => ValueKey::Binary("iadd", *left, *right),
            Instr::ISub { left, right, .. } => ValueKey::Binary("isub", *left, *right),
            Instr::IMul { left, right, .. } => ValueKey::Binary("imul", *left, *right),
            Instr::IDiv { left, right, .. } => ValueKey::Binary("idiv", *left, *right),
            Instr::IRem { left, right, .. } => ValueKey::Binary("irem", *left, *right),
            Instr::IAnd { left, right, .. } => ValueKey::Binary("iand", *left, *right),
            Instr::IOr { left, right, .. } => ValueKey::Binary("ior", *left, *right),
            Instr::IXor { left, right, .. } => ValueKey::Binary("ixor", *left, *right),
            Instr::IShl { left, right, .. } => ValueKey::Binary("ishl", *left, *right),
            Instr::IShr { left, right, .. } => ValueKey::Binary("ishr", *left, *right),
            Instr::FAdd { left, right, .. } => ValueKey::Binary("fadd", *left, *right),
            Instr::FSub { left, right, .. } => ValueKey::Binary("fsub", *left, *right),
            Instr::FMul { left, right, .. } => ValueKey::Binary("fmul", *left, *right),
            Instr::FDiv { left, right, .. } => ValueKey::Binary("fdiv", *left, *right),
            Instr::INeg { operand, .. } => ValueKey::Unary("ineg", *operand),
            Instr::INot { operand, .. } => ValueKey::Unary("inot", *operand),
            Instr::FNeg { operand, .. } => ValueKey::Unary("fneg", *operand),
            Instr::ICmp { cond, left, right, .. } => ValueKey::ICmp(*cond, *left, *right),
            Instr::FCmp { cond, left, right, .. } => ValueKey::FCmp(*cond, *left, *right),
            Instr::GlobalAddr { name, .. } => ValueKey::GlobalAddr(name.clone()),
            Instr::Move { .. } | Instr::Call { .. } | Instr::Load { .. } | Instr::Store { .. } => {
                return None;
            }
        };
        Some(key)
    }
}

impl TransformPass for ValueNumbering {
    fn name(&self) -> &str {
        "value-numbering"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut changed = false;
        for block in &mut func.blocks {
            let mut table: FxHashMap<ValueKey, Reg> = FxHashMap::default();
            let mut defined: FxHashSet<Reg> = FxHashSet::default();
            for instr in &mut block.instrs {
                let dest = match instr.dest() {
                    Some(d) => d,
                    None => continue,
                };
                // A re-definition invalidates everything recorded so far.
                if !defined.insert(dest) {
                    table.clear();
                }
                let key = match ValueKey::of(instr) {
                    Some(key) => key,
                    None => continue,
                };
                match table.get(&key) {
                    Some(prev) => {
                        *instr = Instr::Move { dest, src: *prev };
                        changed = true;
                    }
                    None => {
                        table.insert(key, dest);
                    }
                }
            }
        }
        changed
    }
}

/// Control-flow simplification: fold constant branches, collapse branches
/// with identical targets, thread jumps through empty blocks, and drop
/// blocks unreachable from the entry.
pub struct SimplifyCfg;

impl SimplifyCfg {
    /// Last constant-bool assignment of a register within a block
    fn block_const_bool(block: &Block, reg: Reg) -> Option<bool> {
        let mut value = None;
        for instr in &block.instrs {
            match instr {
                Instr::ConstBool { dest, value: v } if *dest == reg => value = Some(*v),
                other if other.dest() == Some(reg) => value = None,
                _ => {}
            }
        }
        value
    }

    /// Follow chains of empty forwarding blocks
    fn resolve(func: &Function, mut target: BlockId) -> BlockId {
        let mut seen = FxHashSet::default();
        while seen.insert(target) {
            let block = func.block(target);
            match block.terminator {
                Terminator::Jump(next) if block.instrs.is_empty() && next != target => {
                    target = next;
                }
                _ => break,
            }
        }
        target
    }
}

impl TransformPass for SimplifyCfg {
    fn name(&self) -> &str {
        "simplify-cfg"
    }

    fn run(&self, func: &mut Function) -> bool {
        let mut changed = false;

        // Constant and same-target branches become jumps.
        for bi in 0..func.blocks.len() {
            let new_term = match &func.blocks[bi].terminator {
                Terminator::Branch { cond, then_block, else_block } => {
                    if then_block == else_block {
                        Some(Terminator::Jump(*then_block))
                    } else {
                        match Self::block_const_bool(&func.blocks[bi], *cond) {
                            Some(true) => Some(Terminator::Jump(*then_block)),
                            Some(false) => Some(Terminator::Jump(*else_block)),
                            None => None,
                        }
                    }
                }
                _ => None,
            };
            if let Some(term) = new_term {
                func.blocks[bi].terminator = term;
                changed = true;
            }
        }

        // Thread jumps through empty forwarding blocks.
        func.entry = Self::resolve(func, func.entry);
        for bi in 0..func.blocks.len() {
            let term = func.blocks[bi].terminator.clone();
            let threaded = match term {
                Terminator::Jump(t) => {
                    let r = Self::resolve(func, t);
                    (r != t).then_some(Terminator::Jump(r))
                }
                Terminator::Branch { cond, then_block, else_block } => {
                    let (rt, re) = (Self::resolve(func, then_block), Self::resolve(func, else_block));
                    (rt != then_block || re != else_block)
                        .then_some(Terminator::Branch { cond, then_block: rt, else_block: re })
                }
                _ => None,
            };
            if let Some(term) = threaded {
                func.blocks[bi].terminator = term;
                changed = true;
            }
        }

        // Drop blocks unreachable from the entry, compacting IDs.
        let mut reachable = FxHashSet::default();
        let mut stack = vec![func.entry];
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            for succ in func.block(id).terminator.successors() {
                stack.push(succ);
            }
        }
        if reachable.len() < func.blocks.len() {
            let mut remap: FxHashMap<BlockId, BlockId> = FxHashMap::default();
            let mut kept: Vec<Block> = Vec::with_capacity(reachable.len());
            for block in func.blocks.drain(..) {
                if reachable.contains(&block.id) {
                    let new_id = BlockId(kept.len() as u32);
                    remap.insert(block.id, new_id);
                    let mut block = block;
                    block.id = new_id;
                    kept.push(block);
                }
            }
            for block in &mut kept {
                match &mut block.terminator {
                    Terminator::Jump(t) => *t = remap[t],
                    Terminator::Branch { then_block, else_block, .. } => {
                        *then_block = remap[then_block];
                        *else_block = remap[else_block];
                    }
                    _ => {}
                }
            }
            func.entry = remap[&func.entry];
            func.blocks = kept;
            changed = true;
        }
        changed
    }
}
