// This module defines the closed opcode set of the IR and the classification helpers the
// backend dispatches on. Opcodes follow the MIR naming scheme: an "S" suffix marks a
// 32-bit integer operation whose result is zero-extended, a "U" prefix marks unsigned
// compares and divisions, and F/D/LD prefixes select float, double and extended
// precision. The helpers fold the many spellings back into a handful of semantic forms
// (integer binop with width, fp binop with precision, compare kind with operand class)
// so lowering code matches on meaning rather than on every variant.

//! IR opcodes.

use super::types::ValueClass;

macro_rules! opcodes {
    ($($name:ident => $text:literal),* $(,)?) => {
        /// IR operation codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            /// Textual name used by the IR printer.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => $text),*
                }
            }
        }
    };
}

opcodes! {
    Mov => "mov", FMov => "fmov", DMov => "dmov", LDMov => "ldmov",
    Ext8 => "ext8", Ext16 => "ext16", Ext32 => "ext32",
    UExt8 => "uext8", UExt16 => "uext16", UExt32 => "uext32",
    I2F => "i2f", I2D => "i2d", I2LD => "i2ld",
    UI2F => "ui2f", UI2D => "ui2d", UI2LD => "ui2ld",
    F2I => "f2i", D2I => "d2i", LD2I => "ld2i",
    F2D => "f2d", F2LD => "f2ld", D2F => "d2f", D2LD => "d2ld", LD2F => "ld2f", LD2D => "ld2d",
    Neg => "neg", NegS => "negs", FNeg => "fneg", DNeg => "dneg", LDNeg => "ldneg",
    Add => "add", AddS => "adds", FAdd => "fadd", DAdd => "dadd", LDAdd => "ldadd",
    Sub => "sub", SubS => "subs", FSub => "fsub", DSub => "dsub", LDSub => "ldsub",
    Mul => "mul", MulS => "muls", FMul => "fmul", DMul => "dmul", LDMul => "ldmul",
    Div => "div", DivS => "divs", UDiv => "udiv", UDivS => "udivs",
    FDiv => "fdiv", DDiv => "ddiv", LDDiv => "lddiv",
    Mod => "mod", ModS => "mods", UMod => "umod", UModS => "umods",
    And => "and", AndS => "ands", Or => "or", OrS => "ors", Xor => "xor", XorS => "xors",
    Lsh => "lsh", LshS => "lshs", Rsh => "rsh", RshS => "rshs", URsh => "ursh", URshS => "urshs",
    Eq => "eq", EqS => "eqs", FEq => "feq", DEq => "deq", LDEq => "ldeq",
    Ne => "ne", NeS => "nes", FNe => "fne", DNe => "dne", LDNe => "ldne",
    Lt => "lt", LtS => "lts", ULt => "ult", ULtS => "ults", FLt => "flt", DLt => "dlt", LDLt => "ldlt",
    Le => "le", LeS => "les", ULe => "ule", ULeS => "ules", FLe => "fle", DLe => "dle", LDLe => "ldle",
    Gt => "gt", GtS => "gts", UGt => "ugt", UGtS => "ugts", FGt => "fgt", DGt => "dgt", LDGt => "ldgt",
    Ge => "ge", GeS => "ges", UGe => "uge", UGeS => "uges", FGe => "fge", DGe => "dge", LDGe => "ldge",
    AddO => "addo", AddOS => "addos", SubO => "subo", SubOS => "subos",
    MulO => "mulo", MulOS => "mulos", UMulO => "umulo", UMulOS => "umulos",
    Jmp => "jmp", Bt => "bt", BtS => "bts", Bf => "bf", BfS => "bfs",
    BEq => "beq", BEqS => "beqs", FBEq => "fbeq", DBEq => "dbeq", LDBEq => "ldbeq",
    BNe => "bne", BNeS => "bnes", FBNe => "fbne", DBNe => "dbne", LDBNe => "ldbne",
    BLt => "blt", BLtS => "blts", UBLt => "ublt", UBLtS => "ublts", FBLt => "fblt", DBLt => "dblt", LDBLt => "ldblt",
    BLe => "ble", BLeS => "bles", UBLe => "uble", UBLeS => "ubles", FBLe => "fble", DBLe => "dble", LDBLe => "ldble",
    BGt => "bgt", BGtS => "bgts", UBGt => "ubgt", UBGtS => "ubgts", FBGt => "fbgt", DBGt => "dbgt", LDBGt => "ldbgt",
    BGe => "bge", BGeS => "bges", UBGe => "ubge", UBGeS => "ubges", FBGe => "fbge", DBGe => "dbge", LDBGe => "ldbge",
    Bo => "bo", UBo => "ubo", Bno => "bno", UBno => "ubno",
    Call => "call", Inline => "inline", Switch => "switch", Ret => "ret",
    Alloca => "alloca", BStart => "bstart", BEnd => "bend",
    VaArg => "va_arg", VaStart => "va_start", VaEnd => "va_end",
    Label => "label", Use => "use", Phi => "phi",
}

/// Integer binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Lsh,
    Rsh,
    URsh,
    Div,
    UDiv,
    Mod,
    UMod,
}

impl IntOp {
    pub fn is_commutative(self) -> bool {
        matches!(self, IntOp::Add | IntOp::Mul | IntOp::And | IntOp::Or | IntOp::Xor)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, IntOp::Lsh | IntOp::Rsh | IntOp::URsh)
    }

    pub fn is_division(self) -> bool {
        matches!(self, IntOp::Div | IntOp::UDiv | IntOp::Mod | IntOp::UMod)
    }
}

/// Floating-point binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Relation tested by a compare or compare-and-branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operand interpretation of a compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpClass {
    I64,
    I32,
    U64,
    U32,
    F,
    D,
    LD,
}

impl CmpClass {
    pub fn is_fp(self) -> bool {
        matches!(self, CmpClass::F | CmpClass::D | CmpClass::LD)
    }

    pub fn is_32(self) -> bool {
        matches!(self, CmpClass::I32 | CmpClass::U32)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, CmpClass::U64 | CmpClass::U32)
    }
}

/// Overflow-checking arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowOp {
    Add,
    Sub,
    Mul,
    UMul,
}

impl Opcode {
    /// Integer binop and whether it is the 32-bit form.
    pub fn int_binop(self) -> Option<(IntOp, bool)> {
        use Opcode::*;
        Some(match self {
            Add => (IntOp::Add, false),
            AddS => (IntOp::Add, true),
            Sub => (IntOp::Sub, false),
            SubS => (IntOp::Sub, true),
            Mul => (IntOp::Mul, false),
            MulS => (IntOp::Mul, true),
            And => (IntOp::And, false),
            AndS => (IntOp::And, true),
            Or => (IntOp::Or, false),
            OrS => (IntOp::Or, true),
            Xor => (IntOp::Xor, false),
            XorS => (IntOp::Xor, true),
            Lsh => (IntOp::Lsh, false),
            LshS => (IntOp::Lsh, true),
            Rsh => (IntOp::Rsh, false),
            RshS => (IntOp::Rsh, true),
            URsh => (IntOp::URsh, false),
            URshS => (IntOp::URsh, true),
            Div => (IntOp::Div, false),
            DivS => (IntOp::Div, true),
            UDiv => (IntOp::UDiv, false),
            UDivS => (IntOp::UDiv, true),
            Mod => (IntOp::Mod, false),
            ModS => (IntOp::Mod, true),
            UMod => (IntOp::UMod, false),
            UModS => (IntOp::UMod, true),
            _ => return None,
        })
    }

    /// Floating-point binop and its precision class.
    pub fn fp_binop(self) -> Option<(FpOp, ValueClass)> {
        use Opcode::*;
        use ValueClass::{Double, Float, LDouble};
        Some(match self {
            FAdd => (FpOp::Add, Float),
            DAdd => (FpOp::Add, Double),
            LDAdd => (FpOp::Add, LDouble),
            FSub => (FpOp::Sub, Float),
            DSub => (FpOp::Sub, Double),
            LDSub => (FpOp::Sub, LDouble),
            FMul => (FpOp::Mul, Float),
            DMul => (FpOp::Mul, Double),
            LDMul => (FpOp::Mul, LDouble),
            FDiv => (FpOp::Div, Float),
            DDiv => (FpOp::Div, Double),
            LDDiv => (FpOp::Div, LDouble),
            _ => return None,
        })
    }

    /// Value-producing compare.
    pub fn compare(self) -> Option<(CmpKind, CmpClass)> {
        use CmpClass as C;
        use CmpKind as K;
        use Opcode::*;
        Some(match self {
            Eq => (K::Eq, C::I64),
            EqS => (K::Eq, C::I32),
            FEq => (K::Eq, C::F),
            DEq => (K::Eq, C::D),
            LDEq => (K::Eq, C::LD),
            Ne => (K::Ne, C::I64),
            NeS => (K::Ne, C::I32),
            FNe => (K::Ne, C::F),
            DNe => (K::Ne, C::D),
            LDNe => (K::Ne, C::LD),
            Lt => (K::Lt, C::I64),
            LtS => (K::Lt, C::I32),
            ULt => (K::Lt, C::U64),
            ULtS => (K::Lt, C::U32),
            FLt => (K::Lt, C::F),
            DLt => (K::Lt, C::D),
            LDLt => (K::Lt, C::LD),
            Le => (K::Le, C::I64),
            LeS => (K::Le, C::I32),
            ULe => (K::Le, C::U64),
            ULeS => (K::Le, C::U32),
            FLe => (K::Le, C::F),
            DLe => (K::Le, C::D),
            LDLe => (K::Le, C::LD),
            Gt => (K::Gt, C::I64),
            GtS => (K::Gt, C::I32),
            UGt => (K::Gt, C::U64),
            UGtS => (K::Gt, C::U32),
            FGt => (K::Gt, C::F),
            DGt => (K::Gt, C::D),
            LDGt => (K::Gt, C::LD),
            Ge => (K::Ge, C::I64),
            GeS => (K::Ge, C::I32),
            UGe => (K::Ge, C::U64),
            UGeS => (K::Ge, C::U32),
            FGe => (K::Ge, C::F),
            DGe => (K::Ge, C::D),
            LDGe => (K::Ge, C::LD),
            _ => return None,
        })
    }

    /// Compare-and-branch.
    pub fn branch_compare(self) -> Option<(CmpKind, CmpClass)> {
        use Opcode::*;
        let value_form = match self {
            BEq => Eq,
            BEqS => EqS,
            FBEq => FEq,
            DBEq => DEq,
            LDBEq => LDEq,
            BNe => Ne,
            BNeS => NeS,
            FBNe => FNe,
            DBNe => DNe,
            LDBNe => LDNe,
            BLt => Lt,
            BLtS => LtS,
            UBLt => ULt,
            UBLtS => ULtS,
            FBLt => FLt,
            DBLt => DLt,
            LDBLt => LDLt,
            BLe => Le,
            BLeS => LeS,
            UBLe => ULe,
            UBLeS => ULeS,
            FBLe => FLe,
            DBLe => DLe,
            LDBLe => LDLe,
            BGt => Gt,
            BGtS => GtS,
            UBGt => UGt,
            UBGtS => UGtS,
            FBGt => FGt,
            DBGt => DGt,
            LDBGt => LDGt,
            BGe => Ge,
            BGeS => GeS,
            UBGe => UGe,
            UBGeS => UGeS,
            FBGe => FGe,
            DBGe => DGe,
            LDBGe => LDGe,
            _ => return None,
        };
        value_form.compare()
    }

    /// Compare-and-branch opcode testing the same relation as a value compare.
    pub fn fused_branch(self) -> Option<Opcode> {
        let target = self.compare()?;
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.branch_compare() == Some(target))
    }

    /// Overflow arithmetic and whether it is the 32-bit form.
    pub fn overflow_op(self) -> Option<(OverflowOp, bool)> {
        use Opcode::*;
        Some(match self {
            AddO => (OverflowOp::Add, false),
            AddOS => (OverflowOp::Add, true),
            SubO => (OverflowOp::Sub, false),
            SubOS => (OverflowOp::Sub, true),
            MulO => (OverflowOp::Mul, false),
            MulOS => (OverflowOp::Mul, true),
            UMulO => (OverflowOp::UMul, false),
            UMulOS => (OverflowOp::UMul, true),
            _ => return None,
        })
    }

    /// Transfers control somewhere other than the next instruction.
    pub fn is_branch(self) -> bool {
        use Opcode::*;
        matches!(self, Jmp | Bt | BtS | Bf | BfS | Bo | UBo | Bno | UBno | Switch)
            || self.branch_compare().is_some()
    }

    /// Control never falls through to the next instruction.
    pub fn ends_flow(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Ret | Opcode::Switch)
    }

    pub fn is_call(self) -> bool {
        matches!(self, Opcode::Call | Opcode::Inline)
    }

    /// Plain data move of one of the four value classes.
    pub fn move_class(self) -> Option<ValueClass> {
        match self {
            Opcode::Mov => Some(ValueClass::Int),
            Opcode::FMov => Some(ValueClass::Float),
            Opcode::DMov => Some(ValueClass::Double),
            Opcode::LDMov => Some(ValueClass::LDouble),
            _ => None,
        }
    }

    /// Whether operand 0 is written (for the opcodes that have a result at position 0).
    pub fn has_result(self) -> bool {
        use Opcode::*;
        if self == Phi {
            return true;
        }
        !(self.is_branch()
            || matches!(self, Call | Inline | Ret | BEnd | VaStart | VaEnd | Label | Use))
    }

    /// Class of the result produced at operand 0.
    pub fn result_class(self) -> Option<ValueClass> {
        use Opcode::*;
        use ValueClass::*;
        if let Some(c) = self.move_class() {
            return Some(c);
        }
        if let Some((_, c)) = self.fp_binop() {
            return Some(c);
        }
        Some(match self {
            I2F | UI2F | D2F | LD2F | FNeg => Float,
            I2D | UI2D | F2D | LD2D | DNeg => Double,
            I2LD | UI2LD | F2LD | D2LD | LDNeg => LDouble,
            _ if self.has_result() && self != Phi => Int,
            _ => return None,
        })
    }

    /// Class of the (non-result) source operands.
    pub fn source_class(self) -> Option<ValueClass> {
        use Opcode::*;
        use ValueClass::*;
        if let Some((_, class)) = self.compare().or_else(|| self.branch_compare()) {
            return Some(match class {
                CmpClass::F => Float,
                CmpClass::D => Double,
                CmpClass::LD => LDouble,
                _ => Int,
            });
        }
        Some(match self {
            F2I | F2D | F2LD | FNeg => Float,
            D2I | D2F | D2LD | DNeg => Double,
            LD2I | LD2F | LD2D | LDNeg => LDouble,
            _ => return self.result_class(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<_> = Opcode::ALL.iter().map(|o| o.name()).collect();
        names.sort();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn test_fused_branch_for_every_compare() {
        for op in Opcode::ALL {
            if op.compare().is_some() {
                let fused = op.fused_branch().expect("compare has a branch form");
                assert_eq!(fused.branch_compare(), op.compare());
                assert!(fused.is_branch());
            }
        }
        assert_eq!(Opcode::ULtS.fused_branch(), Some(Opcode::UBLtS));
    }

    #[test]
    fn test_classes() {
        assert_eq!(Opcode::DivS.int_binop(), Some((IntOp::Div, true)));
        assert_eq!(Opcode::D2I.result_class(), Some(ValueClass::Int));
        assert_eq!(Opcode::D2I.source_class(), Some(ValueClass::Double));
        assert_eq!(Opcode::FLt.result_class(), Some(ValueClass::Int));
        assert_eq!(Opcode::FLt.source_class(), Some(ValueClass::Float));
        assert!(Opcode::Phi.has_result());
        assert!(!Opcode::Ret.has_result());
        assert!(Opcode::Switch.ends_flow() && Opcode::Switch.is_branch());
    }
}
