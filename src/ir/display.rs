//! Textual form of the IR, for diagnostics and tests.

use std::fmt;

use super::instr::{FloatCond, Function, Instr, IntCond, Terminator};

impl fmt::Display for IntCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntCond::Eq => "eq",
            IntCond::Ne => "ne",
            IntCond::Lt => "lt",
            IntCond::Le => "le",
            IntCond::Gt => "gt",
            IntCond::Ge => "ge",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for FloatCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FloatCond::Eq => "eq",
            FloatCond::Ne => "ne",
            FloatCond::Lt => "lt",
            FloatCond::Le => "le",
            FloatCond::Gt => "gt",
            FloatCond::Ge => "ge",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::ConstI32 { dest, value } => write!(f, "{dest} = const.i32 {value}"),
            Instr::ConstI64 { dest, value } => write!(f, "{dest} = const.i64 {value}"),
            Instr::ConstF64 { dest, value } => write!(f, "{dest} = const.f64 {value}"),
            Instr::ConstBool { dest, value } => write!(f, "{dest} = const.bool {value}"),
            Instr::IAdd { dest, left, right } => write!(f, "{dest} = iadd {left}, {right}"),
            Instr::ISub { dest, left, right } => write!(f, "{dest} = isub {left}, {right}"),
            Instr::IMul { dest, left, right } => write!(f, "{dest} = imul {left}, {right}"),
            Instr::IDiv { dest, left, right } => write!(f, "{dest} = idiv {left}, {right}"),
            Instr::IRem { dest, left, right } => write!(f, "{dest} = irem {left}, {right}"),
            Instr::INeg { dest, operand } => write!(f, "{dest} = ineg {operand}"),
            Instr::IAnd { dest, left, right } => write!(f, "{dest} = iand {left}, {right}"),
            Instr::IOr { dest, left, right } => write!(f, "{dest} = ior {left}, {right}"),
            Instr::IXor { dest, left, right } => write!(f, "{dest} = ixor {left}, {right}"),
            Instr::IShl { dest, left, right } => write!(f, "{dest} = ishl {left}, {right}"),
            Instr::IShr { dest, left, right } => write!(f, "{dest} = ishr {left}, {right}"),
            Instr::INot { dest, operand } => write!(f, "{dest} = inot {operand}"),
            Instr::FAdd { dest, left, right } => write!(f, "{dest} = fadd {left}, {right}"),
            Instr::FSub { dest, left, right } => write!(f, "{dest} = fsub {left}, {right}"),
            Instr::FMul { dest, left, right } => write!(f, "{dest} = fmul {left}, {right}"),
            Instr::FDiv { dest, left, right } => write!(f, "{dest} = fdiv {left}, {right}"),
            Instr::FNeg { dest, operand } => write!(f, "{dest} = fneg {operand}"),
            Instr::ICmp { dest, cond, left, right } => {
                write!(f, "{dest} = icmp.{cond} {left}, {right}")
            }
            Instr::FCmp { dest, cond, left, right } => {
                write!(f, "{dest} = fcmp.{cond} {left}, {right}")
            }
            Instr::Move { dest, src } => write!(f, "{dest} = move {src}"),
            Instr::Call { dest: Some(dest), callee, args } => {
                write!(f, "{dest} = call @{callee}(")?;
                write_regs(f, args)?;
                write!(f, ")")
            }
            Instr::Call { dest: None, callee, args } => {
                write!(f, "call @{callee}(")?;
                write_regs(f, args)?;
                write!(f, ")")
            }
            Instr::GlobalAddr { dest, name } => write!(f, "{dest} = global_addr @{name}"),
            Instr::Load { dest, ty, addr, offset } => {
                write!(f, "{dest} = load.{ty} {addr}+{offset}")
            }
            Instr::Store { addr, value, offset } => write!(f, "store {value} -> {addr}+{offset}"),
        }
    }
}

fn write_regs(f: &mut fmt::Formatter<'_>, regs: &[super::instr::Reg]) -> fmt::Result {
    for (i, reg) in regs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{reg}")?;
    }
    Ok(())
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jump {target}"),
            Terminator::Branch { cond, then_block, else_block } => {
                write!(f, "branch {cond}, {then_block}, {else_block}")
            }
            Terminator::Return(Some(reg)) => write!(f, "return {reg}"),
            Terminator::Return(None) => write!(f, "return"),
            Terminator::Unreachable => write!(f, "unreachable"),
            Terminator::None => write!(f, "<no terminator>"),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn @{}(", self.name)?;
        for (i, ty) in self.sig.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "r{i}: {ty}")?;
        }
        write!(f, ")")?;
        if let Some(ret) = self.sig.ret {
            write!(f, " -> {ret}")?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.id)?;
            for instr in &block.instrs {
                writeln!(f, "    {instr}")?;
            }
            writeln!(f, "    {}", block.terminator)?;
        }
        write!(f, "}}")
    }
}
