//! IR value and memory types.

use std::fmt;

/// Types carried by variables and memory operands.
///
/// Variables are `I64`, `F`, `D`, `LD` or `P`; arguments may also be `Blk` (address of a
/// caller-owned aggregate copy) or `RBlk` (address of the aggregate result). Narrow
/// integer types only describe memory elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F,
    D,
    LD,
    P,
    Blk(u64),
    RBlk(u64),
    Undef,
}

/// Register class a value of some type lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueClass {
    /// General-purpose register (all integers and pointers).
    Int,
    /// Single precision in an SSE register.
    Float,
    /// Double precision in an SSE register.
    Double,
    /// 80-bit extended precision, kept in memory and loaded onto the x87 stack.
    LDouble,
}

impl Type {
    /// Size in bytes of a memory element of this type.
    pub fn size(&self) -> u64 {
        match self {
            Type::I8 | Type::U8 => 1,
            Type::I16 | Type::U16 => 2,
            Type::I32 | Type::U32 | Type::F => 4,
            Type::I64 | Type::U64 | Type::D | Type::P => 8,
            Type::LD => 16,
            Type::Blk(_) | Type::RBlk(_) => 8,
            Type::Undef => 0,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(
            self,
            Type::I8
                | Type::U8
                | Type::I16
                | Type::U16
                | Type::I32
                | Type::U32
                | Type::I64
                | Type::U64
                | Type::P
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Type::I8 | Type::I16 | Type::I32 | Type::I64)
    }

    pub fn is_fp(&self) -> bool {
        matches!(self, Type::F | Type::D | Type::LD)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Type::Blk(_) | Type::RBlk(_))
    }

    /// Register class of values of this type. Aggregates travel as addresses.
    pub fn class(&self) -> ValueClass {
        match self {
            Type::F => ValueClass::Float,
            Type::D => ValueClass::Double,
            Type::LD => ValueClass::LDouble,
            _ => ValueClass::Int,
        }
    }

    /// Whether a variable may be declared with this type.
    pub fn is_var_type(&self) -> bool {
        matches!(
            self,
            Type::I64 | Type::U64 | Type::P | Type::F | Type::D | Type::LD
        ) || self.is_block()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::I8 => write!(f, "i8"),
            Type::U8 => write!(f, "u8"),
            Type::I16 => write!(f, "i16"),
            Type::U16 => write!(f, "u16"),
            Type::I32 => write!(f, "i32"),
            Type::U32 => write!(f, "u32"),
            Type::I64 => write!(f, "i64"),
            Type::U64 => write!(f, "u64"),
            Type::F => write!(f, "f"),
            Type::D => write!(f, "d"),
            Type::LD => write!(f, "ld"),
            Type::P => write!(f, "p"),
            Type::Blk(n) => write!(f, "blk:{n}"),
            Type::RBlk(n) => write!(f, "rblk:{n}"),
            Type::Undef => write!(f, "undef"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_and_classes() {
        assert_eq!(Type::U16.size(), 2);
        assert_eq!(Type::LD.size(), 16);
        assert_eq!(Type::Blk(40).size(), 8);
        assert_eq!(Type::P.class(), ValueClass::Int);
        assert_eq!(Type::F.class(), ValueClass::Float);
        assert!(Type::I8.is_signed() && !Type::U8.is_signed());
        assert!(!Type::I32.is_var_type());
        assert!(Type::RBlk(16).is_var_type());
        assert_eq!(Type::RBlk(16).to_string(), "rblk:16");
    }
}
