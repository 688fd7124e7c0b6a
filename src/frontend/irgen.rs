// IR generation. A checked unit becomes one IR module: every defined function and object
// first gets a placeholder item so bodies and initializers can refer to anything in the
// unit, static data is laid out from the flattened constant initializers, and each
// function body is then lowered statement by statement through a FuncBuilder.
//
// Scalars whose address is never taken live in IR variables; arrays, records and
// address-taken locals live in one frame block allocated at function entry (the Alloca
// is dropped again when nothing needed it, which keeps small leaf functions inlinable).
// Integer values use 64-bit variables: `int` and narrower values are computed with the
// 32-bit "S" opcodes and only their low 32 bits are meaningful, while values of types
// narrower than `int` are kept properly extended in those bits. Records are handled by
// address, and copied with plain loads and stores. Typed memory accesses carry an alias
// set per access width so the backend can keep unrelated values cached across stores.

//! Lowering of checked translation units to IR.

use super::ast::*;
use super::ctype::{CType, IntKind};
use super::sema::{eval_int, truncate, CheckedUnit, SymKind};
use crate::codegen::f64_to_x87;
use crate::core::context::Context;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{ir_vec, AliasId, FuncBuilder, ItemId, ItemKind, LabelId, MemOp, Module, Opcode, Operand, Type, VarId};
use hashbrown::HashMap;

/// Operation class selected by an operand type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// `int` and narrower; the flag is signedness.
    W32(bool),
    /// `long` and pointers.
    W64(bool),
    F,
    D,
    LD,
}

fn kind(ty: &CType) -> Kind {
    match ty {
        CType::Float => Kind::F,
        CType::Double => Kind::D,
        CType::LongDouble => Kind::LD,
        CType::Int { kind, signed } if *kind >= IntKind::Long => Kind::W64(*signed),
        CType::Int { signed, .. } => Kind::W32(*signed),
        _ => Kind::W64(false),
    }
}

/// Pick the opcode for `k` from signed/unsigned 32-bit, signed/unsigned 64-bit and
/// float/double/long double variants.
fn select(k: Kind, int: [Opcode; 4], fp: Option<[Opcode; 3]>) -> Option<Opcode> {
    Some(match k {
        Kind::W32(true) => int[0],
        Kind::W32(false) => int[1],
        Kind::W64(true) => int[2],
        Kind::W64(false) => int[3],
        Kind::F => fp?[0],
        Kind::D => fp?[1],
        Kind::LD => fp?[2],
    })
}

fn binop_code(op: BinaryOp, k: Kind) -> Option<Opcode> {
    use Opcode::*;
    match op {
        BinaryOp::Add => select(k, [AddS, AddS, Add, Add], Some([FAdd, DAdd, LDAdd])),
        BinaryOp::Sub => select(k, [SubS, SubS, Sub, Sub], Some([FSub, DSub, LDSub])),
        BinaryOp::Mul => select(k, [MulS, MulS, Mul, Mul], Some([FMul, DMul, LDMul])),
        BinaryOp::Div => select(k, [DivS, UDivS, Div, UDiv], Some([FDiv, DDiv, LDDiv])),
        BinaryOp::Mod => select(k, [ModS, UModS, Mod, UMod], None),
        BinaryOp::Shl => select(k, [LshS, LshS, Lsh, Lsh], None),
        BinaryOp::Shr => select(k, [RshS, URshS, Rsh, URsh], None),
        BinaryOp::BitAnd => select(k, [AndS, AndS, And, And], None),
        BinaryOp::BitOr => select(k, [OrS, OrS, Or, Or], None),
        BinaryOp::BitXor => select(k, [XorS, XorS, Xor, Xor], None),
        BinaryOp::Eq => select(k, [EqS, EqS, Eq, Eq], Some([FEq, DEq, LDEq])),
        BinaryOp::Ne => select(k, [NeS, NeS, Ne, Ne], Some([FNe, DNe, LDNe])),
        BinaryOp::Lt => select(k, [LtS, ULtS, Lt, ULt], Some([FLt, DLt, LDLt])),
        BinaryOp::Le => select(k, [LeS, ULeS, Le, ULe], Some([FLe, DLe, LDLe])),
        BinaryOp::Gt => select(k, [GtS, UGtS, Gt, UGt], Some([FGt, DGt, LDGt])),
        BinaryOp::Ge => select(k, [GeS, UGeS, Ge, UGe], Some([FGe, DGe, LDGe])),
        BinaryOp::LogAnd | BinaryOp::LogOr => None,
    }
}

fn mov_op(ty: Type) -> Opcode {
    match ty {
        Type::F => Opcode::FMov,
        Type::D => Opcode::DMov,
        Type::LD => Opcode::LDMov,
        _ => Opcode::Mov,
    }
}

fn fconst(ty: &CType, value: f64) -> Operand {
    match ty {
        CType::Float => Operand::Float(value as f32),
        CType::LongDouble => Operand::LDouble(value),
        _ => Operand::Double(value),
    }
}

fn zero(ty: &CType) -> Operand {
    if ty.is_floating() {
        fconst(ty, 0.0)
    } else {
        Operand::Int(0)
    }
}

/// Extension that normalizes a value of a type narrower than `int`.
fn narrow_ext(ty: &CType) -> Option<Opcode> {
    match ty {
        CType::Int { kind: IntKind::Char, signed } => Some(if *signed { Opcode::Ext8 } else { Opcode::UExt8 }),
        CType::Int { kind: IntKind::Short, signed } => Some(if *signed { Opcode::Ext16 } else { Opcode::UExt16 }),
        _ => None,
    }
}

fn unexpected(what: &str) -> CompileError {
    CompileError::internal(format!("unexpected {what} in checked tree"))
}

/// Unit-wide state shared by all function generators. Kept apart from the module so a
/// FuncBuilder can hold the module borrow while these tables are updated.
struct Tables<'u> {
    unit: &'u CheckedUnit,
    items: HashMap<SymId, ItemId>,
    imports: HashMap<String, ItemId>,
    protos: HashMap<(Vec<Type>, Vec<Type>, bool), ItemId>,
    aliases: HashMap<Type, AliasId>,
    anon: u32,
}

impl<'u> Tables<'u> {
    fn size(&self, ty: &CType) -> CompileResult<u64> {
        self.unit
            .records
            .size_of(ty)
            .ok_or_else(|| CompileError::internal(format!("size of incomplete type {ty}")))
    }

    fn import(&mut self, m: &mut Module, name: &str) -> ItemId {
        if let Some(&id) = self.imports.get(name) {
            return id;
        }
        let id = m.add_import(name);
        self.imports.insert(name.to_string(), id);
        id
    }

    /// Item backing a symbol: the unit's own definition, or an import by link name.
    fn sym_item(&mut self, m: &mut Module, id: SymId) -> ItemId {
        if let Some(&item) = self.items.get(&id) {
            return item;
        }
        let unit = self.unit;
        self.import(m, &unit.symbol(id).link_name)
    }

    fn proto(&mut self, m: &mut Module, res: Vec<Type>, args: Vec<Type>, vararg: bool) -> ItemId {
        let key = (res, args, vararg);
        if let Some(&id) = self.protos.get(&key) {
            return id;
        }
        let name = format!("proto{}", self.protos.len());
        let id = m.add_proto(&name, key.0.clone(), key.1.clone(), vararg);
        self.protos.insert(key, id);
        id
    }

    /// Data item holding a NUL-terminated copy of a string literal.
    fn string_data(&mut self, m: &mut Module, s: &[u8]) -> ItemId {
        let mut bytes = s.to_vec();
        bytes.push(0);
        self.anon += 1;
        m.add_data(&format!(".str{}", self.anon), Type::U8, &bytes)
    }

    fn addr_target(&mut self, m: &mut Module, target: &AddrTarget) -> ItemId {
        match target {
            AddrTarget::Sym(id) => self.sym_item(m, *id),
            AddrTarget::Str(s) => self.string_data(m, s),
        }
    }

    /// Fill the placeholder `item` with the object's storage and initial value.
    fn define_object(&mut self, m: &mut Module, item: ItemId, ty: &CType, init: &[InitItem]) -> CompileResult<()> {
        let size = self.size(ty)?;
        let align = self.unit.records.align_of(ty).unwrap_or(1);
        let kind = if ty.is_scalar() {
            let value = match init.first() {
                Some(InitItem::Scalar { value, .. }) => value.clone(),
                _ => None,
            };
            let mem = ty.mem_type();
            match value {
                None => ItemKind::Global { ty: mem, init: None },
                Some(ConstValue::Int(v)) => ItemKind::Global {
                    ty: mem,
                    init: Some(Operand::Int(v)),
                },
                Some(ConstValue::Float(f)) => ItemKind::Global {
                    ty: mem,
                    init: Some(fconst(ty, f)),
                },
                Some(ConstValue::Addr { target, disp }) => {
                    let target = self.addr_target(m, &target);
                    ItemKind::RefData { target, disp }
                }
            }
        } else if init.is_empty() {
            ItemKind::Bss { size, align }
        } else {
            let mut bytes = vec![0u8; size as usize];
            let mut refs = Vec::new();
            for elem in init {
                let (offset, encoded) = match elem {
                    InitItem::Bytes { offset, bytes: text } => (*offset, text.clone()),
                    InitItem::Scalar {
                        offset,
                        expr,
                        value: Some(value),
                    } => match value {
                        ConstValue::Int(v) => {
                            let width = self.size(&expr.ty)?.min(8) as usize;
                            (*offset, v.to_le_bytes()[..width].to_vec())
                        }
                        ConstValue::Float(f) => {
                            let encoded = match expr.ty {
                                CType::Float => (*f as f32).to_le_bytes().to_vec(),
                                CType::LongDouble => f64_to_x87(*f).to_vec(),
                                _ => f.to_le_bytes().to_vec(),
                            };
                            (*offset, encoded)
                        }
                        ConstValue::Addr { target, disp } => {
                            refs.push((*offset, target.clone(), *disp));
                            continue;
                        }
                    },
                    InitItem::Scalar { value: None, .. } => {
                        return Err(CompileError::internal("non-constant initializer of a static object"))
                    }
                };
                let start = (offset as usize).min(bytes.len());
                let end = (start + encoded.len()).min(bytes.len());
                bytes[start..end].copy_from_slice(&encoded[..end - start]);
            }
            let data_ty = match align {
                1 => Type::U8,
                2 => Type::U16,
                4 => Type::U32,
                8 => Type::U64,
                _ => Type::LD,
            };
            for (offset, target, disp) in refs {
                let target = self.addr_target(m, &target);
                m.add_item(
                    "",
                    ItemKind::DataRef {
                        data: item,
                        offset,
                        target,
                        disp,
                    },
                );
            }
            ItemKind::Data {
                ty: data_ty,
                bytes: ir_vec(m.alloc(), bytes),
            }
        };
        if let Some(slot) = m.item_mut(item) {
            slot.kind = kind;
        }
        Ok(())
    }
}

/// Lower a checked unit into a fresh module of `ctx`.
pub fn generate_ir(unit: &CheckedUnit, ctx: &mut Context, name: &str) -> CompileResult<Module> {
    let mut module = ctx.new_module(name);
    let mut aliases = HashMap::new();
    let classes: [(&[Type], &str); 7] = [
        (&[Type::I16, Type::U16], "short"),
        (&[Type::I32, Type::U32], "int"),
        (&[Type::I64, Type::U64], "long"),
        (&[Type::P], "pointer"),
        (&[Type::F], "float"),
        (&[Type::D], "double"),
        (&[Type::LD], "long double"),
    ];
    for (tys, alias_name) in classes {
        let id = ctx.alias(alias_name);
        for ty in tys {
            aliases.insert(*ty, id);
        }
    }
    let mut t = Tables {
        unit,
        items: HashMap::new(),
        imports: HashMap::new(),
        protos: HashMap::new(),
        aliases,
        anon: 0,
    };

    // The declaration carrying the initializer wins over tentative ones.
    let mut defs: HashMap<SymId, &Declaration> = HashMap::new();
    for item in &unit.items {
        if let ExternalDecl::Decl(d) = item {
            let Some(id) = d.sym else { continue };
            let sym = unit.symbol(id);
            if sym.kind == SymKind::Global && sym.defined {
                let slot = defs.entry(id).or_insert(d);
                if d.init.is_some() {
                    *slot = d;
                }
            }
        }
    }
    for d in &unit.static_locals {
        if let Some(id) = d.sym {
            defs.insert(id, d);
        }
    }

    for (i, sym) in unit.symbols.iter().enumerate() {
        let id = SymId(i as u32);
        let placeholder = match sym.kind {
            SymKind::Func if sym.defined => ItemKind::Forward,
            SymKind::Global if defs.contains_key(&id) => ItemKind::Bss { size: 0, align: 1 },
            _ => continue,
        };
        let item = module.add_item(&sym.link_name, placeholder);
        t.items.insert(id, item);
    }
    for (i, sym) in unit.symbols.iter().enumerate() {
        let id = SymId(i as u32);
        if let (Some(d), Some(&item)) = (defs.get(&id), t.items.get(&id)) {
            t.define_object(&mut module, item, &sym.ty, &d.flat_init)?;
        }
    }
    for item in &unit.items {
        if let ExternalDecl::Func(f) = item {
            FuncGen::generate(&mut t, &mut module, f)?;
        }
    }
    log::debug!("generated module {} with {} items", name, module.items.len());
    Ok(module)
}

/// Where a local object lives.
#[derive(Debug, Clone, Copy)]
enum Home {
    Var(VarId),
    /// Offset into the frame block.
    Frame(i64),
    /// Record parameter: the variable holds the address of the callee's copy.
    Indirect(VarId),
}

/// An lvalue after its address computation has been emitted.
#[derive(Debug, Clone, Copy)]
enum Place {
    Var(VarId),
    Mem { base: VarId, disp: i64, typed: bool },
}

#[derive(Debug, Default)]
struct SwitchCases {
    cases: Vec<(i64, LabelId)>,
    default: Option<LabelId>,
}

struct FuncGen<'a, 'u> {
    t: &'a mut Tables<'u>,
    b: FuncBuilder<'a>,
    homes: HashMap<SymId, Home>,
    frame: VarId,
    frame_size: u64,
    ret_ty: CType,
    sret: Option<VarId>,
    breaks: Vec<LabelId>,
    continues: Vec<LabelId>,
    switches: Vec<SwitchCases>,
    goto_labels: HashMap<String, LabelId>,
    var_names: HashMap<String, u32>,
    temps: u32,
}

impl<'a, 'u> FuncGen<'a, 'u> {
    fn generate(t: &'a mut Tables<'u>, module: &'a mut Module, f: &FunctionDef) -> CompileResult<()> {
        let unit = t.unit;
        let missing = || CompileError::internal(format!("function {} has no item", f.name));
        let sym = f.sym.ok_or_else(missing)?;
        let item = t.items.get(&sym).copied().ok_or_else(missing)?;
        let ret_ty = f.ty.ret.clone();

        let mut args: Vec<(String, Type)> = Vec::new();
        if ret_ty.is_record() {
            args.push((".ret".to_string(), Type::RBlk(t.size(&ret_ty)?)));
        }
        for (p, &sid) in f.params.iter().zip(&f.param_syms) {
            let ty = if p.ty.is_record() {
                Type::Blk(t.size(&p.ty)?)
            } else {
                p.ty.var_type()
            };
            args.push((unit.symbol(sid).name.clone(), ty));
        }
        let arg_refs: Vec<(&str, Type)> = args.iter().map(|(n, ty)| (n.as_str(), *ty)).collect();
        let res_types = if ret_ty.is_void() || ret_ty.is_record() {
            Vec::new()
        } else {
            vec![ret_ty.var_type()]
        };

        let mut b = FuncBuilder::new(module, &unit.symbol(sym).link_name, res_types, &arg_refs, f.ty.variadic);
        let frame = b.var("frame", Type::I64);
        let frame_insn = b.emit(Opcode::Alloca, [frame.into(), Operand::Int(0)]);
        let mut g = FuncGen {
            t,
            b,
            homes: HashMap::new(),
            frame,
            frame_size: 0,
            ret_ty,
            sret: None,
            breaks: Vec::new(),
            continues: Vec::new(),
            switches: Vec::new(),
            goto_labels: HashMap::new(),
            var_names: HashMap::new(),
            temps: 0,
        };
        g.params(f)?;
        g.stmt(&f.body)?;
        if g.b.func().insns.last().map(|i| i.code) != Some(Opcode::Ret) {
            g.default_return();
        }

        let frame_size = g.frame_size;
        let mut b = g.b;
        if frame_size == 0 {
            b.remove(frame_insn);
        } else {
            b.patch(frame_insn, 1, Operand::Int(frame_size.next_multiple_of(16) as i64));
        }
        b.finish_into(item);
        Ok(())
    }

    fn params(&mut self, f: &FunctionDef) -> CompileResult<()> {
        let unit = self.t.unit;
        let first = if self.ret_ty.is_record() {
            self.sret = Some(self.b.arg(0));
            1
        } else {
            0
        };
        for (i, (p, &sid)) in f.params.iter().zip(&f.param_syms).enumerate() {
            let var = self.b.arg(first + i as u32);
            let home = if p.ty.is_record() {
                Home::Indirect(var)
            } else if unit.symbol(sid).addr_taken {
                let off = self.slot(&p.ty)?;
                let place = self.frame_place(off);
                self.store(place, &p.ty, var.into())?;
                Home::Frame(off)
            } else {
                // Callers only guarantee the low bits of narrow arguments.
                if let Some(ext) = narrow_ext(&p.ty) {
                    self.emit(ext, [var.into(), var.into()]);
                }
                Home::Var(var)
            };
            self.homes.insert(sid, home);
        }
        Ok(())
    }

    fn emit<const N: usize>(&mut self, code: Opcode, ops: [Operand; N]) {
        self.b.emit(code, ops);
    }

    fn temp(&mut self, ty: Type) -> VarId {
        self.temps += 1;
        let name = format!("t{}", self.temps);
        self.b.var(&name, ty)
    }

    fn local_var(&mut self, name: &str, ty: Type) -> VarId {
        let count = self.var_names.entry(name.to_string()).or_insert(0);
        *count += 1;
        let unique = if *count == 1 { name.to_string() } else { format!("{name}.{count}") };
        self.b.var(&unique, ty)
    }

    /// Reserve frame space for an object of `ty`.
    fn slot(&mut self, ty: &CType) -> CompileResult<i64> {
        let size = self.t.size(ty)?;
        let align = self.t.unit.records.align_of(ty).unwrap_or(8).max(1);
        let off = self.frame_size.next_multiple_of(align);
        self.frame_size = off + size.max(1);
        Ok(off as i64)
    }

    fn frame_place(&self, off: i64) -> Place {
        Place::Mem {
            base: self.frame,
            disp: off,
            typed: true,
        }
    }

    fn mem(&self, ty: Type, base: VarId, disp: i64, typed: bool) -> MemOp {
        let alias = if typed { self.t.aliases.get(&ty).copied().unwrap_or(0) } else { 0 };
        MemOp::based(ty, base, disp).with_alias(alias)
    }

    fn goto_label(&mut self, name: &str) -> LabelId {
        if let Some(&l) = self.goto_labels.get(name) {
            return l;
        }
        let l = self.b.new_label();
        self.goto_labels.insert(name.to_string(), l);
        l
    }

    /// Copy a non-variable operand into a fresh variable.
    fn materialize(&mut self, v: Operand) -> VarId {
        if let Operand::Var(var) = v {
            return var;
        }
        let ty = match v {
            Operand::Float(_) => Type::F,
            Operand::Double(_) => Type::D,
            Operand::LDouble(_) => Type::LD,
            _ => Type::I64,
        };
        let t = self.temp(ty);
        self.emit(mov_op(ty), [t.into(), v]);
        t
    }

    fn value_var(&mut self, e: &Expr) -> CompileResult<VarId> {
        let v = self.expr(e)?;
        Ok(self.materialize(v))
    }

    fn op1(&mut self, code: Opcode, ty: &CType, v: Operand) -> Operand {
        let src = self.materialize(v);
        let t = self.temp(ty.var_type());
        self.emit(code, [t.into(), src.into()]);
        t.into()
    }

    fn op2(&mut self, code: Opcode, ty: &CType, a: Operand, b: Operand) -> Operand {
        let a = self.materialize(a);
        let t = self.temp(ty.var_type());
        self.emit(code, [t.into(), a.into(), b]);
        t.into()
    }

    fn pointee_size(&self, ty: &CType) -> CompileResult<u64> {
        match ty.pointee() {
            Some(p) if p.is_void() || p.is_function() => Ok(1),
            Some(p) => self.t.size(p),
            None => Err(unexpected("pointer arithmetic on a non-pointer")),
        }
    }

    fn scale(&mut self, v: Operand, size: u64) -> Operand {
        match v {
            Operand::Int(c) => Operand::Int(c.wrapping_mul(size as i64)),
            _ if size == 1 => v,
            _ => self.op2(Opcode::Mul, &CType::LONG, v, Operand::Int(size as i64)),
        }
    }

    fn string_addr(&mut self, s: &[u8]) -> VarId {
        let mut bytes = s.to_vec();
        bytes.push(0);
        let sid = self.b.module().add_string(&bytes);
        let t = self.temp(Type::I64);
        self.emit(Opcode::Mov, [t.into(), Operand::Str(sid)]);
        t
    }

    // ---- places ----

    fn sym_place(&mut self, id: SymId) -> CompileResult<Place> {
        if let Some(home) = self.homes.get(&id).copied() {
            return Ok(match home {
                Home::Var(v) => Place::Var(v),
                Home::Frame(off) => self.frame_place(off),
                Home::Indirect(v) => Place::Mem {
                    base: v,
                    disp: 0,
                    typed: true,
                },
            });
        }
        let unit = self.t.unit;
        let sym = unit.symbol(id);
        if sym.kind != SymKind::Global {
            return Err(CompileError::internal(format!("'{}' has no storage", sym.name)));
        }
        let item = self.t.sym_item(self.b.module(), id);
        let a = self.temp(Type::I64);
        self.emit(Opcode::Mov, [a.into(), Operand::Ref(item)]);
        Ok(Place::Mem {
            base: a,
            disp: 0,
            typed: true,
        })
    }

    fn place(&mut self, e: &Expr) -> CompileResult<Place> {
        match &e.kind {
            ExprKind::Sym(id) => self.sym_place(*id),
            ExprKind::Unary(UnaryOp::Deref, inner) => {
                let base = self.value_var(inner)?;
                Ok(Place::Mem {
                    base,
                    disp: 0,
                    typed: true,
                })
            }
            ExprKind::Member { base, offset, .. } => {
                let unit = self.t.unit;
                let in_union = matches!(base.ty, CType::Record(id) if unit.records.get(id).is_union);
                match self.place(base)? {
                    Place::Mem { base, disp, typed } => Ok(Place::Mem {
                        base,
                        disp: disp + *offset as i64,
                        typed: typed && !in_union,
                    }),
                    Place::Var(_) => Err(unexpected("member of a register variable")),
                }
            }
            ExprKind::Str(s) => {
                let base = self.string_addr(s);
                Ok(Place::Mem {
                    base,
                    disp: 0,
                    typed: false,
                })
            }
            _ if e.ty.is_record() || e.ty.is_array() => {
                let base = self.value_var(e)?;
                Ok(Place::Mem {
                    base,
                    disp: 0,
                    typed: true,
                })
            }
            _ => Err(unexpected("non-lvalue operand")),
        }
    }

    fn address(&mut self, p: Place) -> CompileResult<VarId> {
        match p {
            Place::Var(_) => Err(unexpected("address of a register variable")),
            Place::Mem { base, disp: 0, .. } => Ok(base),
            Place::Mem { base, disp, .. } => {
                let t = self.temp(Type::I64);
                self.emit(Opcode::Add, [t.into(), base.into(), Operand::Int(disp)]);
                Ok(t)
            }
        }
    }

    fn load(&mut self, p: Place, ty: &CType) -> CompileResult<Operand> {
        if ty.is_record() || ty.is_array() || ty.is_function() {
            return Ok(self.address(p)?.into());
        }
        match p {
            Place::Var(v) => Ok(v.into()),
            Place::Mem { base, disp, typed } => {
                let m = self.mem(ty.mem_type(), base, disp, typed);
                let t = self.temp(ty.var_type());
                self.emit(mov_op(ty.var_type()), [t.into(), m.into()]);
                Ok(t.into())
            }
        }
    }

    fn store(&mut self, p: Place, ty: &CType, value: Operand) -> CompileResult<()> {
        if ty.is_record() {
            let dst = self.address(p)?;
            let src = self.materialize(value);
            let size = self.t.size(ty)?;
            self.copy(dst, 0, src, size);
            return Ok(());
        }
        let code = mov_op(ty.var_type());
        match p {
            Place::Var(v) => self.emit(code, [v.into(), value]),
            Place::Mem { base, disp, typed } => {
                let m = self.mem(ty.mem_type(), base, disp, typed);
                self.emit(code, [m.into(), value]);
            }
        }
        Ok(())
    }

    /// Widest chunk not exceeding `left` bytes.
    fn chunk(left: u64) -> (Type, u64) {
        match left {
            8.. => (Type::U64, 8),
            4..=7 => (Type::U32, 4),
            2..=3 => (Type::U16, 2),
            _ => (Type::U8, 1),
        }
    }

    fn copy(&mut self, dst: VarId, dst_disp: i64, src: VarId, size: u64) {
        let mut off = 0;
        while off < size {
            let (ty, n) = Self::chunk(size - off);
            let t = self.temp(Type::I64);
            self.emit(Opcode::Mov, [t.into(), MemOp::based(ty, src, off as i64).into()]);
            self.emit(
                Opcode::Mov,
                [MemOp::based(ty, dst, dst_disp + off as i64).into(), t.into()],
            );
            off += n;
        }
    }

    fn zero_fill(&mut self, base: VarId, disp: i64, size: u64) {
        let mut off = 0;
        while off < size {
            let (ty, n) = Self::chunk(size - off);
            self.emit(
                Opcode::Mov,
                [MemOp::based(ty, base, disp + off as i64).into(), Operand::Int(0)],
            );
            off += n;
        }
    }

    fn store_bytes(&mut self, base: VarId, disp: i64, bytes: &[u8]) {
        let mut off = 0;
        while off < bytes.len() {
            let (ty, n) = Self::chunk((bytes.len() - off) as u64);
            let mut word = [0u8; 8];
            word[..n as usize].copy_from_slice(&bytes[off..off + n as usize]);
            self.emit(
                Opcode::Mov,
                [
                    MemOp::based(ty, base, disp + off as i64).into(),
                    Operand::Int(i64::from_le_bytes(word)),
                ],
            );
            off += n as usize;
        }
    }

    // ---- expressions ----

    fn expr(&mut self, e: &Expr) -> CompileResult<Operand> {
        if e.ty.is_integer() && matches!(e.kind, ExprKind::Binary(..) | ExprKind::Unary(..) | ExprKind::Cond(..)) {
            if let Some(v) = eval_int(e) {
                return Ok(Operand::Int(v));
            }
        }
        match &e.kind {
            ExprKind::Int(v) => Ok(Operand::Int(*v)),
            ExprKind::Float(f) => Ok(fconst(&e.ty, *f)),
            ExprKind::Str(s) => Ok(self.string_addr(s).into()),
            ExprKind::Sym(_) | ExprKind::Member { .. } | ExprKind::Unary(UnaryOp::Deref, _) => {
                let p = self.place(e)?;
                self.load(p, &e.ty)
            }
            ExprKind::Unary(UnaryOp::AddrOf, inner) | ExprKind::Decay(inner) => self.address_of(inner),
            ExprKind::Unary(UnaryOp::Plus, x) => self.expr(x),
            ExprKind::Unary(UnaryOp::Neg, x) => {
                let v = self.expr(x)?;
                let code = match kind(&e.ty) {
                    Kind::W32(_) => Opcode::NegS,
                    Kind::W64(_) => Opcode::Neg,
                    Kind::F => Opcode::FNeg,
                    Kind::D => Opcode::DNeg,
                    Kind::LD => Opcode::LDNeg,
                };
                Ok(self.op1(code, &e.ty, v))
            }
            ExprKind::Unary(UnaryOp::BitNot, x) => {
                let v = self.expr(x)?;
                let code = if e.ty.is_wide() { Opcode::Xor } else { Opcode::XorS };
                Ok(self.op2(code, &e.ty, v, Operand::Int(-1)))
            }
            ExprKind::Unary(UnaryOp::Not, x) => {
                let v = self.expr(x)?;
                let code = binop_code(BinaryOp::Eq, kind(&x.ty)).ok_or_else(|| unexpected("operand of !"))?;
                Ok(self.op2(code, &CType::INT, v, zero(&x.ty)))
            }
            ExprKind::IncDec { inc, prefix, expr } => self.inc_dec(*inc, *prefix, expr),
            ExprKind::Binary(op, a, b) => self.binary(e, *op, a, b),
            ExprKind::Assign { op, lhs, rhs, op_ty } => self.assign(*op, lhs, rhs, op_ty),
            ExprKind::Cond(c, a, b) => self.conditional(e, c, a, b),
            ExprKind::Comma(a, b) => {
                self.expr(a)?;
                self.expr(b)
            }
            ExprKind::Call(callee, args) => self.call(e, callee, args),
            ExprKind::Cast(inner) => {
                let v = self.expr(inner)?;
                self.convert(v, &inner.ty, &e.ty)
            }
            ExprKind::VaStart(list) => {
                let l = self.value_var(list)?;
                self.emit(Opcode::VaStart, [l.into()]);
                Ok(Operand::Int(0))
            }
            ExprKind::VaArg(list) => {
                let l = self.value_var(list)?;
                let arg_ty = if e.ty.is_record() {
                    Type::Blk(self.t.size(&e.ty)?)
                } else {
                    e.ty.mem_type()
                };
                let addr = self.temp(Type::I64);
                self.emit(
                    Opcode::VaArg,
                    [addr.into(), l.into(), MemOp::new(arg_ty, 0, None, None, 1).into()],
                );
                let p = Place::Mem {
                    base: addr,
                    disp: 0,
                    typed: false,
                };
                self.load(p, &e.ty)
            }
            ExprKind::VaEnd(list) => {
                let l = self.value_var(list)?;
                self.emit(Opcode::VaEnd, [l.into()]);
                Ok(Operand::Int(0))
            }
            ExprKind::VaCopy(dst, src) => {
                let d = self.value_var(dst)?;
                let s = self.value_var(src)?;
                self.copy(d, 0, s, 24);
                Ok(Operand::Int(0))
            }
            ExprKind::Ident(_) | ExprKind::Index(..) | ExprKind::SizeofExpr(_) | ExprKind::SizeofType(_) => {
                Err(unexpected("unchecked expression"))
            }
        }
    }

    fn address_of(&mut self, inner: &Expr) -> CompileResult<Operand> {
        if inner.ty.is_function() {
            return match &inner.kind {
                ExprKind::Sym(id) => {
                    let item = self.t.sym_item(self.b.module(), *id);
                    let t = self.temp(Type::I64);
                    self.emit(Opcode::Mov, [t.into(), Operand::Ref(item)]);
                    Ok(t.into())
                }
                ExprKind::Unary(UnaryOp::Deref, ptr) => self.expr(ptr),
                _ => Err(unexpected("function designator")),
            };
        }
        let p = self.place(inner)?;
        Ok(self.address(p)?.into())
    }

    fn binary(&mut self, e: &Expr, op: BinaryOp, a: &Expr, b: &Expr) -> CompileResult<Operand> {
        if op.is_logical() {
            return self.bool_value(e);
        }
        let va = self.expr(a)?;
        let vb = self.expr(b)?;
        if a.ty.is_pointer() && matches!(op, BinaryOp::Add | BinaryOp::Sub) {
            let size = self.pointee_size(&a.ty)?;
            if b.ty.is_pointer() {
                let diff = self.op2(Opcode::Sub, &CType::LONG, va, vb);
                if size <= 1 {
                    return Ok(diff);
                }
                return Ok(self.op2(Opcode::Div, &CType::LONG, diff, Operand::Int(size as i64)));
            }
            let step = self.scale(vb, size);
            let code = if op == BinaryOp::Add { Opcode::Add } else { Opcode::Sub };
            return Ok(self.op2(code, &e.ty, va, step));
        }
        let code = binop_code(op, kind(&a.ty)).ok_or_else(|| unexpected("binary operand types"))?;
        Ok(self.op2(code, &e.ty, va, vb))
    }

    /// 0/1 value of a logical expression.
    fn bool_value(&mut self, e: &Expr) -> CompileResult<Operand> {
        let t = self.temp(Type::I64);
        let is_false = self.b.new_label();
        let end = self.b.new_label();
        self.branch_if(e, is_false, false)?;
        self.emit(Opcode::Mov, [t.into(), Operand::Int(1)]);
        self.emit(Opcode::Jmp, [end.into()]);
        self.b.label(is_false);
        self.emit(Opcode::Mov, [t.into(), Operand::Int(0)]);
        self.b.label(end);
        Ok(t.into())
    }

    fn conditional(&mut self, e: &Expr, c: &Expr, a: &Expr, b: &Expr) -> CompileResult<Operand> {
        let is_false = self.b.new_label();
        let end = self.b.new_label();
        self.branch_if(c, is_false, false)?;
        if e.ty.is_void() {
            self.expr(a)?;
            self.emit(Opcode::Jmp, [end.into()]);
            self.b.label(is_false);
            self.expr(b)?;
            self.b.label(end);
            return Ok(Operand::Int(0));
        }
        let vty = if e.ty.is_scalar() { e.ty.var_type() } else { Type::I64 };
        let t = self.temp(vty);
        let va = self.expr(a)?;
        self.emit(mov_op(vty), [t.into(), va]);
        self.emit(Opcode::Jmp, [end.into()]);
        self.b.label(is_false);
        let vb = self.expr(b)?;
        self.emit(mov_op(vty), [t.into(), vb]);
        self.b.label(end);
        Ok(t.into())
    }

    fn assign(&mut self, op: Option<BinaryOp>, lhs: &Expr, rhs: &Expr, op_ty: &CType) -> CompileResult<Operand> {
        let p = self.place(lhs)?;
        let Some(op) = op else {
            let v = self.expr(rhs)?;
            self.store(p, &lhs.ty, v)?;
            if lhs.ty.is_record() {
                return Ok(self.address(p)?.into());
            }
            return Ok(v);
        };
        let cur = self.load(p, &lhs.ty)?;
        let rv = self.expr(rhs)?;
        let result = if lhs.ty.is_pointer() {
            let size = self.pointee_size(&lhs.ty)?;
            let step = self.scale(rv, size);
            let code = if op == BinaryOp::Add { Opcode::Add } else { Opcode::Sub };
            self.op2(code, &lhs.ty, cur, step)
        } else {
            let cur = self.convert(cur, &lhs.ty, op_ty)?;
            let code = binop_code(op, kind(op_ty)).ok_or_else(|| unexpected("compound assignment"))?;
            let r = self.op2(code, op_ty, cur, rv);
            self.convert(r, op_ty, &lhs.ty)?
        };
        self.store(p, &lhs.ty, result)?;
        Ok(result)
    }

    fn inc_dec(&mut self, inc: bool, prefix: bool, target: &Expr) -> CompileResult<Operand> {
        let ty = &target.ty;
        let p = self.place(target)?;
        let mut cur = self.load(p, ty)?;
        if !prefix && matches!(p, Place::Var(_)) {
            // The variable itself is about to change.
            let old = self.temp(ty.var_type());
            self.emit(mov_op(ty.var_type()), [old.into(), cur]);
            cur = old.into();
        }
        let (op_ty, step) = if ty.is_pointer() {
            (ty.clone(), Operand::Int(self.pointee_size(ty)? as i64))
        } else if ty.is_floating() {
            (ty.clone(), fconst(ty, 1.0))
        } else {
            (ty.promote(), Operand::Int(1))
        };
        let op = if inc { BinaryOp::Add } else { BinaryOp::Sub };
        let code = binop_code(op, kind(&op_ty)).ok_or_else(|| unexpected("increment operand"))?;
        let next = self.op2(code, &op_ty, cur, step);
        let next = self.convert(next, &op_ty, ty)?;
        self.store(p, ty, next)?;
        Ok(if prefix { next } else { cur })
    }

    fn call(&mut self, e: &Expr, callee: &Expr, args: &[Expr]) -> CompileResult<Operand> {
        let unit = self.t.unit;
        let fty = callee.ty.func().ok_or_else(|| unexpected("call of a non-function"))?;
        let vararg = fty.variadic || !fty.prototyped;
        let ret = &e.ty;

        let target = match &callee.kind {
            ExprKind::Decay(inner) => match inner.kind {
                ExprKind::Sym(id) if unit.symbol(id).kind == SymKind::Func => {
                    Operand::Ref(self.t.sym_item(self.b.module(), id))
                }
                _ => self.value_var(callee)?.into(),
            },
            _ => self.value_var(callee)?.into(),
        };

        let mut arg_ops = Vec::with_capacity(args.len() + 1);
        let mut arg_types = Vec::with_capacity(args.len() + 1);
        let mut sret = None;
        if ret.is_record() {
            let off = self.slot(ret)?;
            let addr = self.address(self.frame_place(off))?;
            arg_ops.push(addr.into());
            arg_types.push(Type::RBlk(self.t.size(ret)?));
            sret = Some(addr);
        }
        for arg in args {
            let v = self.expr(arg)?;
            let ty = if arg.ty.is_record() {
                Type::Blk(self.t.size(&arg.ty)?)
            } else {
                arg.ty.var_type()
            };
            arg_ops.push(v);
            arg_types.push(ty);
        }

        let res_types = if ret.is_void() || ret.is_record() {
            Vec::new()
        } else {
            vec![ret.var_type()]
        };
        let result = res_types.first().map(|&ty| self.temp(ty));
        let proto = self.t.proto(self.b.module(), res_types, arg_types, vararg);
        let mut ops = vec![Operand::Ref(proto), target];
        ops.extend(result.map(Operand::Var));
        ops.extend(arg_ops);
        self.b.emit(Opcode::Call, ops);

        if let Some(addr) = sret {
            return Ok(addr.into());
        }
        match result {
            Some(r) => {
                // Only the low bits of a narrow return value are defined.
                if let Some(ext) = narrow_ext(ret) {
                    self.emit(ext, [r.into(), r.into()]);
                }
                Ok(r.into())
            }
            None => Ok(Operand::Int(0)),
        }
    }

    fn convert(&mut self, v: Operand, from: &CType, to: &CType) -> CompileResult<Operand> {
        if to.is_void() || to.is_record() || from == to {
            return Ok(v);
        }
        let int_like = |t: &CType| t.is_integer() || t.is_pointer();
        if int_like(from) && int_like(to) {
            return Ok(self.int_convert(v, from, to));
        }
        use Opcode::*;
        let code = match (kind(from), kind(to)) {
            (Kind::W32(_) | Kind::W64(_), tk) => {
                let unsigned_wide = from.is_wide() && !from.is_signed();
                let wide_ty = if from.is_signed() { CType::LONG } else { CType::ULONG };
                let wide = if from.is_wide() { v } else { self.int_convert(v, from, &wide_ty) };
                let code = match (tk, unsigned_wide) {
                    (Kind::F, false) => I2F,
                    (Kind::F, true) => UI2F,
                    (Kind::D, false) => I2D,
                    (Kind::D, true) => UI2D,
                    (Kind::LD, false) => I2LD,
                    (Kind::LD, true) => UI2LD,
                    _ => return Err(unexpected("integer conversion")),
                };
                return Ok(self.op1(code, to, wide));
            }
            (fk, Kind::W32(_) | Kind::W64(_)) => {
                if matches!(to, CType::Int { kind: IntKind::Bool, .. }) {
                    let ne = binop_code(BinaryOp::Ne, fk).ok_or_else(|| unexpected("conversion to _Bool"))?;
                    return Ok(self.op2(ne, &CType::INT, v, zero(from)));
                }
                let code = match fk {
                    Kind::F => F2I,
                    Kind::D => D2I,
                    _ => LD2I,
                };
                let wide = self.op1(code, &CType::LONG, v);
                return Ok(self.int_convert(wide, &CType::LONG, to));
            }
            (Kind::F, Kind::D) => F2D,
            (Kind::F, Kind::LD) => F2LD,
            (Kind::D, Kind::F) => D2F,
            (Kind::D, Kind::LD) => D2LD,
            (Kind::LD, Kind::F) => LD2F,
            (Kind::LD, Kind::D) => LD2D,
            _ => return Ok(v),
        };
        Ok(self.op1(code, to, v))
    }

    fn int_convert(&mut self, v: Operand, from: &CType, to: &CType) -> Operand {
        if let Operand::Int(c) = v {
            return Operand::Int(truncate(c, to));
        }
        if matches!(to, CType::Int { kind: IntKind::Bool, .. }) {
            let code = if from.is_wide() { Opcode::Ne } else { Opcode::NeS };
            return self.op2(code, &CType::INT, v, Operand::Int(0));
        }
        let code = match narrow_ext(to) {
            Some(ext) => ext,
            None if !to.is_wide() || from.is_wide() => return v,
            None if from.is_signed() => Opcode::Ext32,
            None => Opcode::UExt32,
        };
        self.op1(code, to, v)
    }

    // ---- control flow ----

    /// Jump to `target` when `e` evaluates to `when`; fall through otherwise.
    fn branch_if(&mut self, e: &Expr, target: LabelId, when: bool) -> CompileResult<()> {
        match &e.kind {
            ExprKind::Unary(UnaryOp::Not, inner) => return self.branch_if(inner, target, !when),
            ExprKind::Binary(op @ (BinaryOp::LogAnd | BinaryOp::LogOr), a, b) => {
                // `a && b` is true only when both are; `a || b` false only when both are.
                let all = (*op == BinaryOp::LogAnd) == when;
                if all {
                    let skip = self.b.new_label();
                    self.branch_if(a, skip, !when)?;
                    self.branch_if(b, target, when)?;
                    self.b.label(skip);
                } else {
                    self.branch_if(a, target, when)?;
                    self.branch_if(b, target, when)?;
                }
                return Ok(());
            }
            _ => {}
        }
        if e.ty.is_integer() {
            if let Some(v) = eval_int(e) {
                if (v != 0) == when {
                    self.emit(Opcode::Jmp, [target.into()]);
                }
                return Ok(());
            }
        }
        let is_compare = matches!(&e.kind, ExprKind::Binary(op, ..) if op.is_comparison());
        let (cond, wide) = if is_compare {
            (self.expr(e)?, true)
        } else if e.ty.is_floating() {
            let v = self.expr(e)?;
            let ne = binop_code(BinaryOp::Ne, kind(&e.ty)).ok_or_else(|| unexpected("condition"))?;
            (self.op2(ne, &CType::INT, v, zero(&e.ty)), true)
        } else {
            (self.expr(e)?, e.ty.is_wide())
        };
        let cond = self.materialize(cond);
        let code = match (when, wide) {
            (true, true) => Opcode::Bt,
            (true, false) => Opcode::BtS,
            (false, true) => Opcode::Bf,
            (false, false) => Opcode::BfS,
        };
        self.emit(code, [target.into(), cond.into()]);
        Ok(())
    }

    fn default_return(&mut self) {
        if self.ret_ty.is_void() || self.ret_ty.is_record() {
            self.emit(Opcode::Ret, []);
        } else {
            let z = zero(&self.ret_ty);
            self.emit(Opcode::Ret, [z]);
        }
    }

    fn loop_body(&mut self, body: &Stmt, brk: LabelId, cont: LabelId) -> CompileResult<()> {
        self.breaks.push(brk);
        self.continues.push(cont);
        let r = self.stmt(body);
        self.breaks.pop();
        self.continues.pop();
        r
    }

    fn stmt(&mut self, s: &Stmt) -> CompileResult<()> {
        match &s.kind {
            StmtKind::Null => {}
            StmtKind::Expr(e) => {
                self.expr(e)?;
            }
            StmtKind::Decl(decls) => {
                for d in decls {
                    self.local(d)?;
                }
            }
            StmtKind::Block(body) => {
                for s in body {
                    self.stmt(s)?;
                }
            }
            StmtKind::If(cond, then, otherwise) => {
                let else_l = self.b.new_label();
                self.branch_if(cond, else_l, false)?;
                self.stmt(then)?;
                match otherwise {
                    Some(other) => {
                        let end = self.b.new_label();
                        self.emit(Opcode::Jmp, [end.into()]);
                        self.b.label(else_l);
                        self.stmt(other)?;
                        self.b.label(end);
                    }
                    None => self.b.label(else_l),
                }
            }
            StmtKind::While(cond, body) => {
                let (test, top, end) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
                self.emit(Opcode::Jmp, [test.into()]);
                self.b.label(top);
                self.loop_body(body, end, test)?;
                self.b.label(test);
                self.branch_if(cond, top, true)?;
                self.b.label(end);
            }
            StmtKind::DoWhile(body, cond) => {
                let (top, test, end) = (self.b.new_label(), self.b.new_label(), self.b.new_label());
                self.b.label(top);
                self.loop_body(body, end, test)?;
                self.b.label(test);
                self.branch_if(cond, top, true)?;
                self.b.label(end);
            }
            StmtKind::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let (test, top, next, end) = (
                    self.b.new_label(),
                    self.b.new_label(),
                    self.b.new_label(),
                    self.b.new_label(),
                );
                self.emit(Opcode::Jmp, [test.into()]);
                self.b.label(top);
                self.loop_body(body, end, next)?;
                self.b.label(next);
                if let Some(step) = step {
                    self.expr(step)?;
                }
                self.b.label(test);
                match cond {
                    Some(c) => self.branch_if(c, top, true)?,
                    None => self.emit(Opcode::Jmp, [top.into()]),
                }
                self.b.label(end);
            }
            StmtKind::Switch(cond, body) => self.switch(cond, body)?,
            StmtKind::Case { value, body, .. } => {
                let l = self.b.new_label();
                self.b.label(l);
                if let Some(sw) = self.switches.last_mut() {
                    sw.cases.push((*value, l));
                }
                self.stmt(body)?;
            }
            StmtKind::Default(body) => {
                let l = self.b.new_label();
                self.b.label(l);
                if let Some(sw) = self.switches.last_mut() {
                    sw.default = Some(l);
                }
                self.stmt(body)?;
            }
            StmtKind::Label(name, body) => {
                let l = self.goto_label(name);
                self.b.label(l);
                self.stmt(body)?;
            }
            StmtKind::Goto(name) => {
                let l = self.goto_label(name);
                self.emit(Opcode::Jmp, [l.into()]);
            }
            StmtKind::Break => {
                let l = self.breaks.last().copied().ok_or_else(|| unexpected("break"))?;
                self.emit(Opcode::Jmp, [l.into()]);
            }
            StmtKind::Continue => {
                let l = self.continues.last().copied().ok_or_else(|| unexpected("continue"))?;
                self.emit(Opcode::Jmp, [l.into()]);
            }
            StmtKind::Return(value) => self.ret(value.as_ref())?,
        }
        Ok(())
    }

    fn ret(&mut self, value: Option<&Expr>) -> CompileResult<()> {
        let Some(e) = value else {
            self.default_return();
            return Ok(());
        };
        if self.ret_ty.is_record() {
            let src = self.value_var(e)?;
            let dst = self.sret.ok_or_else(|| unexpected("record return"))?;
            let size = self.t.size(&self.ret_ty)?;
            self.copy(dst, 0, src, size);
            self.emit(Opcode::Ret, []);
        } else if self.ret_ty.is_void() {
            self.expr(e)?;
            self.emit(Opcode::Ret, []);
        } else {
            let v = self.expr(e)?;
            self.emit(Opcode::Ret, [v]);
        }
        Ok(())
    }

    /// Dense case sets become a jump table; anything else a compare chain.
    fn switch(&mut self, cond: &Expr, body: &Stmt) -> CompileResult<()> {
        let v = self.value_var(cond)?;
        let k = kind(&cond.ty);
        let dispatch = self.b.new_label();
        let end = self.b.new_label();
        self.emit(Opcode::Jmp, [dispatch.into()]);

        self.switches.push(SwitchCases::default());
        self.breaks.push(end);
        let r = self.stmt(body);
        self.breaks.pop();
        let cases = self.switches.pop().unwrap_or_default();
        r?;
        self.emit(Opcode::Jmp, [end.into()]);
        self.b.label(dispatch);

        let fallback = cases.default.unwrap_or(end);
        let mut sorted = cases.cases.clone();
        sorted.sort_by_key(|c| c.0);
        let span = match (sorted.first(), sorted.last()) {
            (Some(lo), Some(hi)) => hi.0 as i128 - lo.0 as i128 + 1,
            _ => 0,
        };
        let dense = sorted.len() >= 4 && span <= 3 * sorted.len() as i128 && span <= 256;
        if dense {
            let min = sorted[0].0;
            let idx = self.temp(Type::I64);
            match k {
                Kind::W32(true) => self.emit(Opcode::Ext32, [idx.into(), v.into()]),
                Kind::W32(false) => self.emit(Opcode::UExt32, [idx.into(), v.into()]),
                _ => self.emit(Opcode::Mov, [idx.into(), v.into()]),
            }
            self.emit(Opcode::Sub, [idx.into(), idx.into(), Operand::Int(min)]);
            let mut table = vec![fallback; span as usize];
            for (value, l) in &sorted {
                table[(*value as i128 - min as i128) as usize] = *l;
            }
            let mut ops = vec![Operand::Var(idx)];
            ops.extend(table.into_iter().map(Operand::Label));
            ops.push(Operand::Label(fallback));
            self.b.emit(Opcode::Switch, ops);
        } else {
            let eq = if matches!(k, Kind::W32(_)) { Opcode::EqS } else { Opcode::Eq };
            for (value, l) in &cases.cases {
                let t = self.op2(eq, &CType::INT, v.into(), Operand::Int(*value));
                let t = self.materialize(t);
                self.emit(Opcode::Bt, [(*l).into(), t.into()]);
            }
            self.emit(Opcode::Jmp, [fallback.into()]);
        }
        self.b.label(end);
        Ok(())
    }

    fn local(&mut self, d: &Declaration) -> CompileResult<()> {
        let unit = self.t.unit;
        let id = d.sym.ok_or_else(|| unexpected("unresolved declaration"))?;
        let sym = unit.symbol(id);
        if sym.kind != SymKind::Local {
            return Ok(());
        }
        let ty = &sym.ty;
        if ty.is_scalar() && !sym.addr_taken {
            let v = self.local_var(&d.name, ty.var_type());
            self.homes.insert(id, Home::Var(v));
            if let Some(InitItem::Scalar { expr, .. }) = d.flat_init.first() {
                let value = self.expr(expr)?;
                self.emit(mov_op(ty.var_type()), [v.into(), value]);
            }
            return Ok(());
        }

        let off = self.slot(ty)?;
        self.homes.insert(id, Home::Frame(off));
        if d.init.is_none() {
            return Ok(());
        }
        if !ty.is_scalar() {
            let size = self.t.size(ty)?;
            self.zero_fill(self.frame, off, size);
        }
        for item in &d.flat_init {
            match item {
                InitItem::Scalar { offset, expr, .. } => {
                    let value = self.expr(expr)?;
                    let place = self.frame_place(off + *offset as i64);
                    self.store(place, &expr.ty, value)?;
                }
                InitItem::Bytes { offset, bytes } => self.store_bytes(self.frame, off + *offset as i64, bytes),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::{Diagnostics, MessageSink};
    use crate::frontend::{lexer::tokenize, parser::parse, sema::check};
    use crate::ir::{validate_module, Func};

    fn lower(src: &str) -> (Context, Module) {
        let sink = MessageSink::capture();
        let mut diag = Diagnostics::new(sink.clone(), "t.c", false, false);
        let unit = parse(tokenize(src, "t.c").unwrap()).unwrap();
        let checked = check(unit, &mut diag).unwrap_or_else(|| panic!("{}", sink.contents()));
        let mut ctx = Context::default();
        let module = generate_ir(&checked, &mut ctx, "t").unwrap();
        validate_module(&module).unwrap();
        (ctx, module)
    }

    fn func<'m>(m: &'m Module, name: &str) -> &'m Func {
        m.find_func(name).and_then(|id| m.item(id)).and_then(|it| it.func()).unwrap()
    }

    fn kind_of<'m>(m: &'m Module, name: &str) -> &'m ItemKind {
        let id = m.find(name, |_| true).unwrap();
        &m.item(id).unwrap().kind
    }

    fn codes(f: &Func) -> Vec<Opcode> {
        f.insns.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_frame_only_when_needed() {
        let (_ctx, m) = lower(
            "int sq(int x) { return x * x; }
             int main(void) { int a[4]; a[1] = sq(3); return a[1]; }",
        );
        let sq = func(&m, "sq");
        assert!(!codes(sq).contains(&Opcode::Alloca));
        assert_eq!(codes(sq), vec![Opcode::MulS, Opcode::Ret]);

        let main = func(&m, "main");
        assert_eq!(main.insns[0].code, Opcode::Alloca);
        assert_eq!(main.insns[0].ops[1], Operand::Int(16));
    }

    #[test]
    fn test_static_data_layout() {
        let (_ctx, m) = lower(
            "int counter = 7;
             double ratio = 0.5;
             char *greeting = \"hi\";
             int table[3] = {1, 2, 3};
             int zeros[100];
             int *cursor = &table[2];",
        );
        assert!(matches!(
            kind_of(&m, "counter"),
            ItemKind::Global { ty: Type::I32, init: Some(Operand::Int(7)) }
        ));
        assert!(matches!(
            kind_of(&m, "ratio"),
            ItemKind::Global { ty: Type::D, init: Some(Operand::Double(d)) } if *d == 0.5
        ));
        assert!(matches!(kind_of(&m, "greeting"), ItemKind::RefData { disp: 0, .. }));
        match kind_of(&m, "table") {
            ItemKind::Data { ty, bytes } => {
                assert_eq!(*ty, Type::U32);
                assert_eq!(bytes.as_slice(), &[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(kind_of(&m, "zeros"), ItemKind::Bss { size: 400, align: 4 }));
        assert!(matches!(kind_of(&m, "cursor"), ItemKind::RefData { disp: 8, .. }));
    }

    #[test]
    fn test_external_calls_use_imports_and_protos() {
        let (_ctx, m) = lower(
            "int printf(const char *, ...);
             int main(void) { printf(\"%d\\n\", 42); return 0; }",
        );
        assert!(matches!(kind_of(&m, "printf"), ItemKind::Import));
        let proto = m.items.iter().find_map(|it| it.proto()).unwrap();
        assert!(proto.vararg);
        assert_eq!(proto.args[..], [Type::I64, Type::I64]);
        assert_eq!(proto.res_types[..], [Type::I64]);
        assert!(m.strings.iter().any(|s| s.as_slice() == b"%d\n\0"));
    }

    #[test]
    fn test_falling_off_main_returns_zero() {
        let (_ctx, m) = lower("int main(void) { int x = 1; x += 2; }");
        let main = func(&m, "main");
        let last = main.insns.last().unwrap();
        assert_eq!(last.code, Opcode::Ret);
        assert_eq!(last.ops.as_slice(), &[Operand::Int(0)]);
    }

    #[test]
    fn test_switch_lowering() {
        let (_ctx, m) = lower(
            "int dense(int x) { switch (x) { case 1: return 10; case 2: return 20;
                 case 3: return 30; case 5: return 50; default: return 0; } }
             int sparse(int x) { switch (x) { case 1: return 1; case 1000: return 2; } return 3; }",
        );
        let dense = func(&m, "dense");
        let sw = dense.insns.iter().find(|i| i.code == Opcode::Switch).unwrap();
        // index, five table entries (4 is a gap), default
        assert_eq!(sw.ops.len(), 7);
        assert!(codes(dense).contains(&Opcode::Ext32));

        let sparse = func(&m, "sparse");
        assert!(!codes(sparse).contains(&Opcode::Switch));
        assert_eq!(codes(sparse).iter().filter(|c| **c == Opcode::EqS).count(), 2);
    }

    #[test]
    fn test_narrow_and_unsigned_conversions() {
        let (_ctx, m) = lower(
            "long widen(unsigned u) { return u; }
             char narrow(int x) { return x; }
             double to_double(unsigned long v) { return v; }",
        );
        assert!(codes(func(&m, "widen")).contains(&Opcode::UExt32));
        assert!(codes(func(&m, "narrow")).contains(&Opcode::Ext8));
        assert!(codes(func(&m, "to_double")).contains(&Opcode::UI2D));
    }

    #[test]
    fn test_record_return_and_argument() {
        let (_ctx, m) = lower(
            "struct pair { long a; long b; };
             struct pair make(long a) { struct pair p; p.a = a; p.b = a + 1; return p; }
             long sum(struct pair p) { return p.a + p.b; }
             long main(void) { return sum(make(4)); }",
        );
        let make = func(&m, "make");
        assert_eq!(make.arg_types().collect::<Vec<_>>(), vec![Type::RBlk(16), Type::I64]);
        assert!(make.res_types.is_empty());
        let sum = func(&m, "sum");
        assert_eq!(sum.arg_types().collect::<Vec<_>>(), vec![Type::Blk(16)]);
        let main = func(&m, "main");
        assert_eq!(codes(main).iter().filter(|c| **c == Opcode::Call).count(), 2);
    }

    #[test]
    fn test_short_circuit_branches() {
        let (_ctx, m) = lower("int both(int a, int b) { if (a && b) return 1; return 0; }");
        let both = func(&m, "both");
        assert_eq!(codes(both).iter().filter(|c| **c == Opcode::BfS).count(), 2);
    }
}
