//! Syntax tree of a translation unit.
//!
//! The parser fills in declared types and leaves expression types as `void`; the
//! semantic checker then resolves names to [`SymId`]s, types every expression, makes
//! implicit conversions explicit as [`ExprKind::Cast`] nodes and rewrites a few forms
//! (subscripts, `->`, `sizeof`) into simpler ones, so IR generation only sees the
//! normalized shapes documented on each variant.

use super::ctype::{CType, FuncType, RecordTable};
use crate::core::diagnostics::SourcePos;
use std::rc::Rc;

/// Index into the checker's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(pub u32);

impl SymId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    BitNot,
    Not,
    Deref,
    AddrOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    LogAnd,
    LogOr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogAnd | BinaryOp::LogOr)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    /// Operator spelling for diagnostics.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::LogAnd => "&&",
            BinaryOp::LogOr => "||",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: CType,
    pub pos: SourcePos,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: CType, pos: SourcePos) -> Self {
        Self { kind, ty, pos }
    }

    pub fn int(value: i64, ty: CType, pos: SourcePos) -> Self {
        Self::new(ExprKind::Int(value), ty, pos)
    }

    /// Integer constant value, if this is an integer literal.
    pub fn int_value(&self) -> Option<i64> {
        match self.kind {
            ExprKind::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Null pointer constant: an integer literal zero, possibly cast to `void *`.
    pub fn is_null_constant(&self) -> bool {
        match &self.kind {
            ExprKind::Int(0) => self.ty.is_integer(),
            ExprKind::Cast(inner) => {
                matches!(&self.ty, CType::Pointer(p) if p.is_void()) && inner.is_null_constant()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    /// String literal bytes without the terminating NUL.
    Str(Rc<[u8]>),
    /// Unresolved name; replaced by `Sym` during checking.
    Ident(String),
    Sym(SymId),
    Unary(UnaryOp, Box<Expr>),
    IncDec {
        inc: bool,
        prefix: bool,
        expr: Box<Expr>,
    },
    /// After checking, both operands of arithmetic and comparisons have the common
    /// type, except pointer arithmetic (pointer and `long`, or two pointers for `-`)
    /// and shifts (each operand promoted on its own).
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `lhs op= rhs`: the value of `lhs` converted to `op_ty`, combined with `rhs`
    /// (already of `op_ty`, or `long` for pointer steps), converted back and stored.
    Assign {
        op: Option<BinaryOp>,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        op_ty: CType,
    },
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Comma(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    /// Rewritten to `*(base + index)` during checking.
    Index(Box<Expr>, Box<Expr>),
    /// After checking `arrow` is false, `base` is a record lvalue and `offset` is set.
    Member {
        base: Box<Expr>,
        name: String,
        arrow: bool,
        offset: u64,
    },
    /// Conversion of the operand to the node's type.
    Cast(Box<Expr>),
    /// Address of an array or function designator.
    Decay(Box<Expr>),
    SizeofExpr(Box<Expr>),
    SizeofType(CType),
    VaStart(Box<Expr>),
    /// Next variadic argument of the node's type.
    VaArg(Box<Expr>),
    VaEnd(Box<Expr>),
    VaCopy(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub pos: SourcePos,
}

impl Stmt {
    pub fn new(kind: StmtKind, pos: SourcePos) -> Self {
        Self { kind, pos }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Null,
    Expr(Expr),
    Decl(Vec<Declaration>),
    Block(Vec<Stmt>),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    While(Expr, Box<Stmt>),
    DoWhile(Box<Stmt>, Expr),
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Switch(Expr, Box<Stmt>),
    /// `value` is filled in by the checker.
    Case {
        expr: Expr,
        value: i64,
        body: Box<Stmt>,
    },
    Default(Box<Stmt>),
    Label(String, Box<Stmt>),
    Goto(String),
    Break,
    Continue,
    Return(Option<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Auto,
    Static,
    Extern,
    Typedef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Expr(Expr),
    List(Vec<Initializer>, SourcePos),
}

/// Constant value of a static initializer element.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    /// Address of a symbol or string literal plus a byte displacement.
    Addr { target: AddrTarget, disp: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AddrTarget {
    Sym(SymId),
    Str(Rc<[u8]>),
}

/// One element of a flattened initializer.
#[derive(Debug, Clone, PartialEq)]
pub enum InitItem {
    /// A scalar or whole-record store at `offset`, converted to the element type.
    /// `value` is set for objects with static storage.
    Scalar {
        offset: u64,
        expr: Expr,
        value: Option<ConstValue>,
    },
    /// Characters of a string literal initializing a char array.
    Bytes { offset: u64, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub ty: CType,
    pub storage: Storage,
    pub init: Option<Initializer>,
    pub pos: SourcePos,
    /// Filled in by the checker.
    pub sym: Option<SymId>,
    /// Flattened `init`, filled in by the checker.
    pub flat_init: Vec<InitItem>,
}

impl Declaration {
    pub fn new(name: String, ty: CType, storage: Storage, init: Option<Initializer>, pos: SourcePos) -> Self {
        Self {
            name,
            ty,
            storage,
            init,
            pos,
            sym: None,
            flat_init: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Option<String>,
    pub ty: CType,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub ty: Rc<FuncType>,
    pub params: Vec<Param>,
    pub storage: Storage,
    pub body: Stmt,
    pub pos: SourcePos,
    pub sym: Option<SymId>,
    pub param_syms: Vec<SymId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExternalDecl {
    Decl(Declaration),
    Func(FunctionDef),
}

#[derive(Debug, Default)]
pub struct TranslationUnit {
    pub items: Vec<ExternalDecl>,
    pub records: RecordTable,
}
