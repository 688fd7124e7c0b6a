// This module defines the IR containers: a Module owns an ordered arena of Items plus
// its string literal table, and each Item is a tagged entity (function, prototype,
// import, export, forward declaration, initialized data, bss, reference cell or scalar
// global). Functions own their variable table and instruction list. All container
// storage is drawn from the context allocator through allocator_api2 vectors, and
// items, variables, labels and strings are addressed by small integer handles rather
// than pointers, so a module can be cloned for inlining or dropped wholesale.

//! Modules, items, functions and instructions.

use super::opcode::Opcode;
use super::operand::{ItemId, LabelId, Operand, StrId, VarId};
use super::types::Type;
use crate::core::alloc::{AllocStr, ContextAlloc};

/// Vector backed by the context allocator.
pub type IrVec<T> = allocator_api2::vec::Vec<T, ContextAlloc>;

/// Collect an iterator into an [`IrVec`].
pub fn ir_vec<T>(alloc: &ContextAlloc, items: impl IntoIterator<Item = T>) -> IrVec<T> {
    let mut v = IrVec::new_in(alloc.clone());
    v.extend(items);
    v
}

/// One instruction: opcode plus ordered operands.
#[derive(Debug, Clone)]
pub struct Insn {
    pub code: Opcode,
    pub ops: IrVec<Operand>,
}

impl Insn {
    pub fn new(alloc: &ContextAlloc, code: Opcode, ops: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            code,
            ops: ir_vec(alloc, ops),
        }
    }
}

/// Variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    pub name: AllocStr,
    pub ty: Type,
}

/// Function body.
#[derive(Debug, Clone)]
pub struct Func {
    pub res_types: IrVec<Type>,
    /// The first `nargs` variables are the arguments, in order.
    pub nargs: u32,
    pub vararg: bool,
    pub vars: IrVec<VarInfo>,
    pub insns: IrVec<Insn>,
    pub next_label: u32,
}

impl Func {
    pub fn new(alloc: &ContextAlloc, res_types: Vec<Type>, args: &[(&str, Type)], vararg: bool) -> Self {
        let vars = ir_vec(
            alloc,
            args.iter().map(|(name, ty)| VarInfo {
                name: AllocStr::new(alloc, name),
                ty: *ty,
            }),
        );
        Self {
            res_types: ir_vec(alloc, res_types),
            nargs: args.len() as u32,
            vararg,
            vars,
            insns: IrVec::new_in(alloc.clone()),
            next_label: 0,
        }
    }

    pub fn new_var(&mut self, name: &str, ty: Type) -> VarId {
        let id = VarId(self.vars.len() as u32);
        let name = AllocStr::new(self.vars.allocator(), name);
        self.vars.push(VarInfo { name, ty });
        id
    }

    pub fn new_label(&mut self) -> LabelId {
        let l = LabelId(self.next_label);
        self.next_label += 1;
        l
    }

    pub fn arg(&self, i: u32) -> VarId {
        VarId(i)
    }

    pub fn var(&self, v: VarId) -> Option<&VarInfo> {
        self.vars.get(v.index())
    }

    pub fn var_type(&self, v: VarId) -> Type {
        self.vars.get(v.index()).map_or(Type::Undef, |vi| vi.ty)
    }

    pub fn arg_types(&self) -> impl Iterator<Item = Type> + '_ {
        self.vars.iter().take(self.nargs as usize).map(|v| v.ty)
    }
}

/// Call signature referenced by call instructions.
#[derive(Debug, Clone, PartialEq)]
pub struct Proto {
    pub res_types: IrVec<Type>,
    pub args: IrVec<Type>,
    pub vararg: bool,
}

/// Item payloads.
#[derive(Debug, Clone)]
pub enum ItemKind {
    Func(Func),
    Proto(Proto),
    /// Symbol provided by the host or an earlier module.
    Import,
    /// Makes the function of the same name visible to later modules and lookups.
    Export,
    /// Declares a function defined later in the module.
    Forward,
    Data {
        ty: Type,
        bytes: IrVec<u8>,
    },
    Bss {
        size: u64,
        align: u64,
    },
    /// Pointer-sized cell holding the address of `target` plus `disp`.
    RefData {
        target: ItemId,
        disp: i64,
    },
    /// Address of `target` plus `disp` stored at `offset` inside the data item `data`.
    DataRef {
        data: ItemId,
        offset: u64,
        target: ItemId,
        disp: i64,
    },
    /// Scalar cell with an optional constant initializer.
    Global {
        ty: Type,
        init: Option<Operand>,
    },
}

#[derive(Debug, Clone)]
pub struct Item {
    pub name: AllocStr,
    pub kind: ItemKind,
}

impl Item {
    pub fn func(&self) -> Option<&Func> {
        match &self.kind {
            ItemKind::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn proto(&self) -> Option<&Proto> {
        match &self.kind {
            ItemKind::Proto(p) => Some(p),
            _ => None,
        }
    }
}

/// Ordered collection of items compiled as one unit.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: AllocStr,
    pub items: IrVec<Item>,
    pub strings: IrVec<IrVec<u8>>,
    alloc: ContextAlloc,
}

impl Module {
    pub fn new(name: &str, alloc: &ContextAlloc) -> Self {
        Self {
            name: AllocStr::new(alloc, name),
            items: IrVec::new_in(alloc.clone()),
            strings: IrVec::new_in(alloc.clone()),
            alloc: alloc.clone(),
        }
    }

    pub fn alloc(&self) -> &ContextAlloc {
        &self.alloc
    }

    pub fn add_item(&mut self, name: &str, kind: ItemKind) -> ItemId {
        let id = ItemId(self.items.len() as u32);
        self.items.push(Item {
            name: AllocStr::new(&self.alloc, name),
            kind,
        });
        id
    }

    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.items.get(id.index())
    }

    pub fn item_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        self.items.get_mut(id.index())
    }

    pub fn add_proto(&mut self, name: &str, res_types: Vec<Type>, args: Vec<Type>, vararg: bool) -> ItemId {
        self.add_item(
            name,
            ItemKind::Proto(Proto {
                res_types: ir_vec(&self.alloc, res_types),
                args: ir_vec(&self.alloc, args),
                vararg,
            }),
        )
    }

    pub fn add_import(&mut self, name: &str) -> ItemId {
        self.add_item(name, ItemKind::Import)
    }

    pub fn add_data(&mut self, name: &str, ty: Type, bytes: &[u8]) -> ItemId {
        let bytes = ir_vec(&self.alloc, bytes.iter().copied());
        self.add_item(name, ItemKind::Data { ty, bytes })
    }

    /// Intern a string literal; `bytes` should include the terminating NUL.
    pub fn add_string(&mut self, bytes: &[u8]) -> StrId {
        if let Some(pos) = self.strings.iter().position(|s| s.as_slice() == bytes) {
            return StrId(pos as u32);
        }
        self.strings.push(ir_vec(&self.alloc, bytes.iter().copied()));
        StrId(self.strings.len() as u32 - 1)
    }

    pub fn string(&self, id: StrId) -> Option<&[u8]> {
        self.strings.get(id.0 as usize).map(|s| s.as_slice())
    }

    /// First item with `name` whose kind satisfies `pred`.
    pub fn find(&self, name: &str, pred: impl Fn(&ItemKind) -> bool) -> Option<ItemId> {
        self.items
            .iter()
            .position(|it| &*it.name == name && pred(&it.kind))
            .map(|i| ItemId(i as u32))
    }

    /// Function item with `name`.
    pub fn find_func(&self, name: &str) -> Option<ItemId> {
        self.find(name, |k| matches!(k, ItemKind::Func(_)))
    }

    /// Resolve a forward declaration or export to the function it names.
    pub fn resolve_func(&self, id: ItemId) -> Option<ItemId> {
        let item = self.item(id)?;
        match item.kind {
            ItemKind::Func(_) => Some(id),
            ItemKind::Forward | ItemKind::Export => self.find_func(&item.name),
            _ => None,
        }
    }

    pub fn funcs(&self) -> impl Iterator<Item = (ItemId, &Item, &Func)> {
        self.items.iter().enumerate().filter_map(|(i, it)| match &it.kind {
            ItemKind::Func(f) => Some((ItemId(i as u32), it, f)),
            _ => None,
        })
    }
}

/// Incremental construction of a function item.
pub struct FuncBuilder<'m> {
    module: &'m mut Module,
    name: AllocStr,
    func: Func,
}

impl<'m> FuncBuilder<'m> {
    pub fn new(
        module: &'m mut Module,
        name: &str,
        res_types: Vec<Type>,
        args: &[(&str, Type)],
        vararg: bool,
    ) -> Self {
        let func = Func::new(module.alloc(), res_types, args, vararg);
        let name = AllocStr::new(module.alloc(), name);
        Self { module, name, func }
    }

    pub fn module(&mut self) -> &mut Module {
        &mut *self.module
    }

    pub fn func(&self) -> &Func {
        &self.func
    }

    pub fn arg(&self, i: u32) -> VarId {
        self.func.arg(i)
    }

    pub fn var(&mut self, name: &str, ty: Type) -> VarId {
        self.func.new_var(name, ty)
    }

    pub fn new_label(&mut self) -> LabelId {
        self.func.new_label()
    }

    pub fn emit(&mut self, code: Opcode, ops: impl IntoIterator<Item = Operand>) -> usize {
        let insn = Insn::new(self.module.alloc(), code, ops);
        self.func.insns.push(insn);
        self.func.insns.len() - 1
    }

    pub fn label(&mut self, l: LabelId) {
        self.emit(Opcode::Label, [Operand::Label(l)]);
    }

    /// Replace operand `op` of an already emitted instruction.
    pub fn patch(&mut self, insn: usize, op: usize, value: Operand) {
        if let Some(slot) = self.func.insns.get_mut(insn).and_then(|i| i.ops.get_mut(op)) {
            *slot = value;
        }
    }

    /// Drop an emitted instruction; later instruction indices shift down by one.
    pub fn remove(&mut self, insn: usize) {
        if insn < self.func.insns.len() {
            self.func.insns.remove(insn);
        }
    }

    pub fn finish(self) -> ItemId {
        self.module.add_item(&self.name, ItemKind::Func(self.func))
    }

    /// Store the body into an existing item slot (created earlier as a placeholder).
    pub fn finish_into(self, id: ItemId) -> ItemId {
        if let Some(item) = self.module.item_mut(id) {
            item.kind = ItemKind::Func(self.func);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_function() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let mut b = FuncBuilder::new(&mut m, "add1", vec![Type::I64], &[("x", Type::I64)], false);
        let x = b.arg(0);
        let r = b.var("r", Type::I64);
        b.emit(Opcode::Add, [r.into(), x.into(), Operand::Int(1)]);
        b.emit(Opcode::Ret, [r.into()]);
        let id = b.finish();

        let func = m.item(id).and_then(|it| it.func()).unwrap();
        assert_eq!(func.nargs, 1);
        assert_eq!(func.insns.len(), 2);
        assert_eq!(func.var_type(r), Type::I64);
        assert_eq!(m.find_func("add1"), Some(id));
    }

    #[test]
    fn test_forward_resolution_and_strings() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let fwd = m.add_item("later", ItemKind::Forward);
        let f = FuncBuilder::new(&mut m, "later", vec![], &[], false).finish();
        assert_eq!(m.resolve_func(fwd), Some(f));

        let s1 = m.add_string(b"hi\0");
        let s2 = m.add_string(b"hi\0");
        assert_eq!(s1, s2);
        assert_eq!(m.string(s1), Some(&b"hi\0"[..]));
    }
}
