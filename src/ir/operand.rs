//! IR operands, handles and memory aliasing rules.

use super::types::Type;

/// Function-local variable handle (index into `Func::vars`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Function-local label handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

/// Module-local item handle (index into `Module::items`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

impl ItemId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Module-local string literal handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(pub u32);

/// Interned alias-set name; 0 means "no alias information".
pub type AliasId = u32;

/// Memory reference `[base + index * scale + disp]` of element type `ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemOp {
    pub ty: Type,
    pub disp: i64,
    pub base: Option<VarId>,
    pub index: Option<VarId>,
    pub scale: u8,
    /// Accesses with different non-zero alias ids never overlap.
    pub alias: AliasId,
    /// Accesses sharing a non-zero non-alias id never overlap.
    pub nonalias: AliasId,
}

impl MemOp {
    pub fn new(ty: Type, disp: i64, base: Option<VarId>, index: Option<VarId>, scale: u8) -> Self {
        Self {
            ty,
            disp,
            base,
            index,
            scale,
            alias: 0,
            nonalias: 0,
        }
    }

    /// `[base + disp]`.
    pub fn based(ty: Type, base: VarId, disp: i64) -> Self {
        Self::new(ty, disp, Some(base), None, 1)
    }

    pub fn with_alias(mut self, alias: AliasId) -> Self {
        self.alias = alias;
        self
    }

    pub fn with_nonalias(mut self, nonalias: AliasId) -> Self {
        self.nonalias = nonalias;
        self
    }

    /// Whether `var` participates in the address computation.
    pub fn uses_var(&self, var: VarId) -> bool {
        self.base == Some(var) || self.index == Some(var)
    }

    /// Conservative overlap test between two accesses in the same module.
    ///
    /// Returns false only when the accesses provably touch disjoint bytes: different
    /// alias sets, a shared non-alias set, or the same address expression with
    /// non-overlapping displacement ranges.
    pub fn may_alias(&self, other: &MemOp) -> bool {
        if self.alias != 0 && other.alias != 0 && self.alias != other.alias {
            return false;
        }
        if self.nonalias != 0 && self.nonalias == other.nonalias {
            return false;
        }
        let same_address = self.base == other.base
            && self.index == other.index
            && (self.index.is_none() || self.scale == other.scale);
        if same_address {
            let (a0, a1) = (self.disp, self.disp + self.ty.size() as i64);
            let (b0, b1) = (other.disp, other.disp + other.ty.size() as i64);
            return a0 < b1 && b0 < a1;
        }
        true
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Var(VarId),
    Int(i64),
    Uint(u64),
    Float(f32),
    Double(f64),
    /// Extended-precision immediate; the value is carried at double precision.
    LDouble(f64),
    /// Address of another item.
    Ref(ItemId),
    /// Address of a NUL-terminated string literal.
    Str(StrId),
    Mem(MemOp),
    Label(LabelId),
}

impl Operand {
    pub fn var(&self) -> Option<VarId> {
        match self {
            Operand::Var(v) => Some(*v),
            _ => None,
        }
    }

    pub fn label(&self) -> Option<LabelId> {
        match self {
            Operand::Label(l) => Some(*l),
            _ => None,
        }
    }

    pub fn mem(&self) -> Option<&MemOp> {
        match self {
            Operand::Mem(m) => Some(m),
            _ => None,
        }
    }

    /// Integer immediate value, if this is one.
    pub fn int_imm(&self) -> Option<i64> {
        match self {
            Operand::Int(i) => Some(*i),
            Operand::Uint(u) => Some(*u as i64),
            _ => None,
        }
    }

    /// Variables read when this operand is used as a source.
    pub fn read_vars(&self) -> impl Iterator<Item = VarId> {
        let (a, b) = match self {
            Operand::Var(v) => (Some(*v), None),
            Operand::Mem(m) => (m.base, m.index),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

impl From<VarId> for Operand {
    fn from(v: VarId) -> Self {
        Operand::Var(v)
    }
}

impl From<LabelId> for Operand {
    fn from(l: LabelId) -> Self {
        Operand::Label(l)
    }
}

impl From<MemOp> for Operand {
    fn from(m: MemOp) -> Self {
        Operand::Mem(m)
    }
}

impl From<ItemId> for Operand {
    fn from(i: ItemId) -> Self {
        Operand::Ref(i)
    }
}

impl From<i64> for Operand {
    fn from(i: i64) -> Self {
        Operand::Int(i)
    }
}
