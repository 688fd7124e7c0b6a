// C types as the front-end sees them. Qualifiers are dropped at parse time, enums are
// plain ints, and struct/union types are referred to by id into a RecordTable so that
// self-referential and incomplete types work. Layout follows the x86-64 System V data
// model: char 1, short 2, int 4, long and pointers 8, long double 16 bytes with 16-byte
// alignment, and record fields at their natural alignment. The helpers at the bottom
// implement the integer promotions and the usual arithmetic conversions, and map C
// types onto IR memory and variable types.

//! C type representation, layout and conversions.

use crate::ir::Type;
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntKind {
    Bool,
    Char,
    Short,
    Int,
    Long,
    LongLong,
}

/// Handle of a struct or union in the [`RecordTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum CType {
    Void,
    Int { kind: IntKind, signed: bool },
    Float,
    Double,
    LongDouble,
    Pointer(Rc<CType>),
    Array(Rc<CType>, Option<u64>),
    Function(Rc<FuncType>),
    Record(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncType {
    pub ret: CType,
    pub params: Vec<CType>,
    pub variadic: bool,
    /// False for old-style `f()` declarations, which accept any arguments.
    pub prototyped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: Option<String>,
    pub ty: CType,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tag: Option<String>,
    pub is_union: bool,
    pub fields: Vec<Field>,
    pub size: u64,
    pub align: u64,
    pub complete: bool,
}

/// Every struct and union of one translation unit.
#[derive(Debug, Default, Clone)]
pub struct RecordTable {
    records: Vec<Record>,
}

impl RecordTable {
    pub fn declare(&mut self, tag: Option<String>, is_union: bool) -> RecordId {
        self.records.push(Record {
            tag,
            is_union,
            fields: Vec::new(),
            size: 0,
            align: 1,
            complete: false,
        });
        RecordId(self.records.len() as u32 - 1)
    }

    pub fn get(&self, id: RecordId) -> &Record {
        &self.records[id.0 as usize]
    }

    /// Lay out the members of `id`. Returns the name of a member with incomplete type.
    pub fn complete(&mut self, id: RecordId, members: Vec<(Option<String>, CType)>) -> Result<(), String> {
        let is_union = self.get(id).is_union;
        let mut fields = Vec::with_capacity(members.len());
        let (mut size, mut align) = (0u64, 1u64);
        for (name, ty) in members {
            let (fsize, falign) = match (self.size_of(&ty), self.align_of(&ty)) {
                (Some(s), Some(a)) => (s, a),
                _ => return Err(name.unwrap_or_else(|| "<anonymous>".into())),
            };
            align = align.max(falign);
            let offset = if is_union { 0 } else { size.next_multiple_of(falign) };
            size = if is_union { size.max(fsize) } else { offset + fsize };
            fields.push(Field { name, ty, offset });
        }
        let record = &mut self.records[id.0 as usize];
        record.fields = fields;
        record.align = align;
        record.size = size.next_multiple_of(align);
        record.complete = true;
        Ok(())
    }

    /// Member `name` of record `id`, searching anonymous members too.
    pub fn field(&self, id: RecordId, name: &str) -> Option<(u64, CType)> {
        for f in &self.get(id).fields {
            match (&f.name, &f.ty) {
                (Some(n), _) if n == name => return Some((f.offset, f.ty.clone())),
                (None, CType::Record(inner)) => {
                    if let Some((off, ty)) = self.field(*inner, name) {
                        return Some((f.offset + off, ty));
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn size_of(&self, ty: &CType) -> Option<u64> {
        Some(match ty {
            CType::Void | CType::Function(_) => return None,
            CType::Int { kind, .. } => match kind {
                IntKind::Bool | IntKind::Char => 1,
                IntKind::Short => 2,
                IntKind::Int => 4,
                IntKind::Long | IntKind::LongLong => 8,
            },
            CType::Float => 4,
            CType::Double | CType::Pointer(_) => 8,
            CType::LongDouble => 16,
            CType::Array(elem, n) => self.size_of(elem)? * (*n)?,
            CType::Record(id) => {
                let r = self.get(*id);
                if !r.complete {
                    return None;
                }
                r.size
            }
        })
    }

    pub fn align_of(&self, ty: &CType) -> Option<u64> {
        match ty {
            CType::Array(elem, _) => self.align_of(elem),
            CType::Record(id) => {
                let r = self.get(*id);
                r.complete.then_some(r.align)
            }
            other => self.size_of(other),
        }
    }
}

impl CType {
    pub const INT: CType = CType::Int { kind: IntKind::Int, signed: true };
    pub const UINT: CType = CType::Int { kind: IntKind::Int, signed: false };
    pub const LONG: CType = CType::Int { kind: IntKind::Long, signed: true };
    pub const ULONG: CType = CType::Int { kind: IntKind::Long, signed: false };
    pub const CHAR: CType = CType::Int { kind: IntKind::Char, signed: true };

    pub fn pointer_to(ty: CType) -> CType {
        CType::Pointer(Rc::new(ty))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, CType::Void)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, CType::Int { .. })
    }

    pub fn is_floating(&self) -> bool {
        matches!(self, CType::Float | CType::Double | CType::LongDouble)
    }

    pub fn is_arithmetic(&self) -> bool {
        self.is_integer() || self.is_floating()
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer(_))
    }

    pub fn is_scalar(&self) -> bool {
        self.is_arithmetic() || self.is_pointer()
    }

    pub fn is_record(&self) -> bool {
        matches!(self, CType::Record(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, CType::Array(..))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, CType::Function(_))
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, CType::Int { signed: true, .. })
    }

    /// Pointed-to type of a pointer, or element type of an array.
    pub fn pointee(&self) -> Option<&CType> {
        match self {
            CType::Pointer(t) | CType::Array(t, _) => Some(t),
            _ => None,
        }
    }

    pub fn func(&self) -> Option<&FuncType> {
        match self {
            CType::Function(f) => Some(f),
            CType::Pointer(t) => match &**t {
                CType::Function(f) => Some(f),
                _ => None,
            },
            _ => None,
        }
    }

    /// Array-to-pointer and function-to-pointer conversion.
    pub fn decay(&self) -> CType {
        match self {
            CType::Array(elem, _) => CType::Pointer(elem.clone()),
            CType::Function(_) => CType::pointer_to(self.clone()),
            other => other.clone(),
        }
    }

    /// Integer promotion.
    pub fn promote(&self) -> CType {
        match self {
            CType::Int { kind, .. } if *kind < IntKind::Int => CType::INT,
            other => other.clone(),
        }
    }

    /// Whether the type is a 64-bit integer or pointer.
    pub fn is_wide(&self) -> bool {
        matches!(
            self,
            CType::Int {
                kind: IntKind::Long | IntKind::LongLong,
                ..
            } | CType::Pointer(_)
        )
    }

    /// IR element type of a memory access of this type.
    pub fn mem_type(&self) -> Type {
        match self {
            CType::Int { kind, signed } => match (kind, signed) {
                (IntKind::Bool, _) => Type::U8,
                (IntKind::Char, true) => Type::I8,
                (IntKind::Char, false) => Type::U8,
                (IntKind::Short, true) => Type::I16,
                (IntKind::Short, false) => Type::U16,
                (IntKind::Int, true) => Type::I32,
                (IntKind::Int, false) => Type::U32,
                (_, true) => Type::I64,
                (_, false) => Type::U64,
            },
            CType::Float => Type::F,
            CType::Double => Type::D,
            CType::LongDouble => Type::LD,
            _ => Type::P,
        }
    }

    /// IR type of a variable holding a value of this type.
    pub fn var_type(&self) -> Type {
        match self {
            CType::Float => Type::F,
            CType::Double => Type::D,
            CType::LongDouble => Type::LD,
            _ => Type::I64,
        }
    }
}

/// Common type of two arithmetic operands after the usual arithmetic conversions.
pub fn usual_arithmetic(a: &CType, b: &CType) -> CType {
    if matches!(a, CType::LongDouble) || matches!(b, CType::LongDouble) {
        return CType::LongDouble;
    }
    if matches!(a, CType::Double) || matches!(b, CType::Double) {
        return CType::Double;
    }
    if matches!(a, CType::Float) || matches!(b, CType::Float) {
        return CType::Float;
    }
    let (a, b) = (a.promote(), b.promote());
    let (CType::Int { kind: ka, signed: sa }, CType::Int { kind: kb, signed: sb }) = (&a, &b) else {
        return CType::INT;
    };
    // long and long long have the same size here, so rank by width only.
    let wide = |k: &IntKind| *k >= IntKind::Long;
    let kind = if wide(ka) || wide(kb) { IntKind::Long } else { IntKind::Int };
    let both_wide = wide(ka) == wide(kb);
    let signed = if both_wide {
        *sa && *sb
    } else if wide(ka) {
        *sa
    } else {
        *sb
    };
    CType::Int { kind, signed }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CType::Void => write!(f, "void"),
            CType::Int { kind, signed } => {
                let name = match kind {
                    IntKind::Bool => return write!(f, "_Bool"),
                    IntKind::Char => "char",
                    IntKind::Short => "short",
                    IntKind::Int => "int",
                    IntKind::Long => "long",
                    IntKind::LongLong => "long long",
                };
                if *signed {
                    write!(f, "{name}")
                } else {
                    write!(f, "unsigned {name}")
                }
            }
            CType::Float => write!(f, "float"),
            CType::Double => write!(f, "double"),
            CType::LongDouble => write!(f, "long double"),
            CType::Pointer(t) => write!(f, "{t} *"),
            CType::Array(t, Some(n)) => write!(f, "{t} [{n}]"),
            CType::Array(t, None) => write!(f, "{t} []"),
            CType::Function(ft) => {
                let params: Vec<String> = ft.params.iter().map(|p| p.to_string()).collect();
                write!(f, "{} ({}{})", ft.ret, params.join(", "), if ft.variadic { ", ..." } else { "" })
            }
            CType::Record(id) => write!(f, "struct #{}", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let mut table = RecordTable::default();
        let id = table.declare(Some("s".into()), false);
        table
            .complete(
                id,
                vec![
                    (Some("c".into()), CType::CHAR),
                    (Some("d".into()), CType::Double),
                    (Some("i".into()), CType::INT),
                ],
            )
            .unwrap();
        let rec = CType::Record(id);
        assert_eq!(table.size_of(&rec), Some(24));
        assert_eq!(table.align_of(&rec), Some(8));
        assert_eq!(table.field(id, "i").map(|f| f.0), Some(16));

        let u = table.declare(None, true);
        table.complete(u, vec![(Some("a".into()), CType::CHAR), (Some("b".into()), CType::LONG)]).unwrap();
        assert_eq!(table.size_of(&CType::Record(u)), Some(8));
    }

    #[test]
    fn test_incomplete_member_is_rejected() {
        let mut table = RecordTable::default();
        let inner = table.declare(Some("later".into()), false);
        let outer = table.declare(Some("outer".into()), false);
        let err = table.complete(outer, vec![(Some("x".into()), CType::Record(inner))]);
        assert_eq!(err, Err("x".to_string()));
    }

    #[test]
    fn test_usual_arithmetic_conversions() {
        let uchar = CType::Int { kind: IntKind::Char, signed: false };
        assert_eq!(usual_arithmetic(&uchar, &CType::CHAR), CType::INT);
        assert_eq!(usual_arithmetic(&CType::UINT, &CType::INT), CType::UINT);
        assert_eq!(usual_arithmetic(&CType::UINT, &CType::LONG), CType::LONG);
        assert_eq!(usual_arithmetic(&CType::ULONG, &CType::LONG), CType::ULONG);
        assert_eq!(usual_arithmetic(&CType::Float, &CType::LONG), CType::Float);
        assert_eq!(usual_arithmetic(&CType::Float, &CType::Double), CType::Double);
    }

    #[test]
    fn test_ir_type_mapping() {
        assert_eq!(CType::CHAR.mem_type(), Type::I8);
        assert_eq!(CType::UINT.mem_type(), Type::U32);
        assert_eq!(CType::pointer_to(CType::INT).mem_type(), Type::P);
        assert_eq!(CType::INT.var_type(), Type::I64);
        assert_eq!(CType::Float.var_type(), Type::F);
        assert!(CType::pointer_to(CType::Void).is_wide());
        assert!(!CType::INT.is_wide());
    }
}
