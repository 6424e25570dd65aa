//! IR type system
//!
//! Value types for registers, function signatures, and global data. All types
//! lower to plain machine types; there is no boxed or polymorphic value.

/// Type of an IR register or global
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 64-bit IEEE float
    F64,
    /// Boolean (lowered as an 8-bit integer)
    Bool,
    /// Target-width pointer
    Ptr,
}

impl Type {
    /// Whether this type is an integer (participates in integer arithmetic)
    pub fn is_int(&self) -> bool {
        matches!(self, Type::I32 | Type::I64)
    }

    /// Whether this type is a float
    pub fn is_float(&self) -> bool {
        matches!(self, Type::F64)
    }

    /// Size in bytes when stored as global data (pointer assumed 8 bytes)
    pub fn byte_size(&self) -> usize {
        match self {
            Type::Bool => 1,
            Type::I32 => 4,
            Type::I64 | Type::F64 | Type::Ptr => 8,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::F64 => write!(f, "f64"),
            Type::Bool => write!(f, "bool"),
            Type::Ptr => write!(f, "ptr"),
        }
    }
}
