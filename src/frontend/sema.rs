// Semantic checking. The checker walks the parsed unit once, in source order, keeping a
// stack of scopes that map names to entries of one symbol table shared by the whole
// unit. Every expression gets its type; conversions the language applies implicitly
// (integer promotions, the usual arithmetic conversions, assignment conversions, array
// and function decay, default argument promotions) become explicit Cast and Decay nodes,
// and subscripts, `->` and `sizeof` are rewritten into simpler forms. Integer constant
// casts are folded as they are built. Initializers are flattened into (offset, element)
// lists, with constants evaluated for objects of static storage duration.
//
// Errors are reported to the Diagnostics and abandon only the statement or declaration
// they occur in, so one run reports every independent problem. Constructs accepted as
// extensions (implicit function declarations, incompatible pointer assignments,
// pointer/integer comparisons, arithmetic on `void *`) are reported through
// `Diagnostics::extension`, which makes them errors under -pedantic.

//! Semantic checks and type annotation.

use super::ast::*;
use super::ctype::{usual_arithmetic, CType, FuncType, IntKind, RecordTable};
use crate::core::diagnostics::{Diagnostics, SourcePos};
use std::collections::{HashMap, HashSet};
use std::iter::Peekable;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    /// Object with static storage duration.
    Global,
    Func,
    Local,
    /// Parameter at the given position.
    Param(u32),
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Name of the module item backing a global, unique within the unit.
    pub link_name: String,
    pub ty: CType,
    pub kind: SymKind,
    /// Defined in this unit (functions with a body, objects not merely `extern`).
    pub defined: bool,
    pub addr_taken: bool,
    pub pos: SourcePos,
}

/// A translation unit that passed checking.
#[derive(Debug)]
pub struct CheckedUnit {
    pub items: Vec<ExternalDecl>,
    pub records: RecordTable,
    pub symbols: Vec<Symbol>,
    /// Block-scope `static` objects, emitted like globals.
    pub static_locals: Vec<Declaration>,
}

impl CheckedUnit {
    pub fn symbol(&self, id: SymId) -> &Symbol {
        &self.symbols[id.index()]
    }
}

/// Marker for an error that was already reported.
#[derive(Debug)]
struct Reported;

type Checked<T = ()> = Result<T, Reported>;

fn int_bits(kind: IntKind) -> u32 {
    match kind {
        IntKind::Bool => 1,
        IntKind::Char => 8,
        IntKind::Short => 16,
        IntKind::Int => 32,
        IntKind::Long | IntKind::LongLong => 64,
    }
}

/// Reduce `v` to the value range of the integer type `ty`.
pub fn truncate(v: i64, ty: &CType) -> i64 {
    match ty {
        CType::Int { kind: IntKind::Bool, .. } => (v != 0) as i64,
        CType::Int { kind, signed } => match (int_bits(*kind), signed) {
            (8, true) => v as i8 as i64,
            (8, false) => v as u8 as i64,
            (16, true) => v as i16 as i64,
            (16, false) => v as u16 as i64,
            (32, true) => v as i32 as i64,
            (32, false) => v as u32 as i64,
            _ => v,
        },
        _ => v,
    }
}

/// Evaluate an integer constant expression.
///
/// Works on both parsed and checked trees: untyped operators compute in `i64`, and
/// checked operators honour the signedness of their operand type.
pub fn eval_int(e: &Expr) -> Option<i64> {
    let v = match &e.kind {
        ExprKind::Int(v) => *v,
        ExprKind::Float(f) if e.ty.is_integer() => *f as i64,
        ExprKind::Cast(inner) => {
            if !(e.ty.is_integer() || e.ty.is_pointer()) {
                return None;
            }
            match inner.kind {
                ExprKind::Float(f) => f as i64,
                _ => eval_int(inner)?,
            }
        }
        ExprKind::Unary(op, x) => {
            let x = eval_int(x)?;
            match op {
                UnaryOp::Neg => x.wrapping_neg(),
                UnaryOp::Plus => x,
                UnaryOp::BitNot => !x,
                UnaryOp::Not => (x == 0) as i64,
                _ => return None,
            }
        }
        ExprKind::Binary(op, a, b) => {
            let x = eval_int(a)?;
            if *op == BinaryOp::LogAnd && x == 0 {
                return Some(0);
            }
            if *op == BinaryOp::LogOr && x != 0 {
                return Some(1);
            }
            let y = eval_int(b)?;
            let unsigned = matches!(a.ty, CType::Int { signed: false, .. }) || a.ty.is_pointer();
            let (ux, uy) = (x as u64, y as u64);
            match op {
                BinaryOp::Add => x.wrapping_add(y),
                BinaryOp::Sub => x.wrapping_sub(y),
                BinaryOp::Mul => x.wrapping_mul(y),
                BinaryOp::Div | BinaryOp::Mod if y == 0 => return None,
                BinaryOp::Div if unsigned => (ux / uy) as i64,
                BinaryOp::Div => x.wrapping_div(y),
                BinaryOp::Mod if unsigned => (ux % uy) as i64,
                BinaryOp::Mod => x.wrapping_rem(y),
                BinaryOp::Shl => x.wrapping_shl(y as u32),
                BinaryOp::Shr if unsigned => (ux.wrapping_shr(y as u32)) as i64,
                BinaryOp::Shr => x.wrapping_shr(y as u32),
                BinaryOp::BitAnd => x & y,
                BinaryOp::BitOr => x | y,
                BinaryOp::BitXor => x ^ y,
                BinaryOp::Lt if unsigned => (ux < uy) as i64,
                BinaryOp::Gt if unsigned => (ux > uy) as i64,
                BinaryOp::Le if unsigned => (ux <= uy) as i64,
                BinaryOp::Ge if unsigned => (ux >= uy) as i64,
                BinaryOp::Lt => (x < y) as i64,
                BinaryOp::Gt => (x > y) as i64,
                BinaryOp::Le => (x <= y) as i64,
                BinaryOp::Ge => (x >= y) as i64,
                BinaryOp::Eq => (x == y) as i64,
                BinaryOp::Ne => (x != y) as i64,
                BinaryOp::LogAnd | BinaryOp::LogOr => (y != 0) as i64,
            }
        }
        ExprKind::Cond(c, a, b) => {
            if eval_int(c)? != 0 {
                eval_int(a)?
            } else {
                eval_int(b)?
            }
        }
        _ => return None,
    };
    Some(truncate(v, &e.ty))
}

/// Bytes of a string literal, checked (decayed) or not.
fn string_literal(e: &Expr) -> Option<Rc<[u8]>> {
    match &e.kind {
        ExprKind::Str(s) => Some(s.clone()),
        ExprKind::Decay(inner) => match &inner.kind {
            ExprKind::Str(s) => Some(s.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn take(e: &mut Expr) -> Expr {
    let pos = e.pos.clone();
    std::mem::replace(e, Expr::int(0, CType::INT, pos))
}

/// Whether values of `a` and `b` may be assigned to each other's pointers silently.
fn compatible(a: &CType, b: &CType) -> bool {
    match (a, b) {
        (CType::Pointer(x), CType::Pointer(y)) => compatible(x, y),
        (CType::Array(x, _), CType::Array(y, _)) => compatible(x, y),
        (CType::Function(f), CType::Function(g)) => {
            compatible(&f.ret, &g.ret)
                && (!f.prototyped
                    || !g.prototyped
                    || (f.variadic == g.variadic
                        && f.params.len() == g.params.len()
                        && f.params.iter().zip(&g.params).all(|(p, q)| compatible(p, q))))
        }
        // Plain char and signed char are interchangeable here.
        (CType::Int { kind: ka, signed: sa }, CType::Int { kind: kb, signed: sb }) => {
            ka == kb && (sa == sb || *ka == IntKind::Char)
        }
        _ => a == b,
    }
}

struct SwitchCtx {
    ty: CType,
    values: HashSet<i64>,
    has_default: bool,
}

struct Checker<'d> {
    diag: &'d mut Diagnostics,
    records: RecordTable,
    symbols: Vec<Symbol>,
    scopes: Vec<HashMap<String, SymId>>,
    static_locals: Vec<Declaration>,
    static_counter: u32,
    /// Globals whose definition carried an initializer.
    initialized: HashSet<SymId>,
    // Per-function state.
    func_name: String,
    ret_ty: CType,
    variadic: bool,
    loop_depth: u32,
    switches: Vec<SwitchCtx>,
    labels: HashSet<String>,
    gotos: Vec<(String, SourcePos)>,
}

/// Check `unit`, reporting problems to `diag`. Returns None when errors were reported.
pub fn check(unit: TranslationUnit, diag: &mut Diagnostics) -> Option<CheckedUnit> {
    let errors_before = diag.error_count();
    let mut checker = Checker {
        diag,
        records: unit.records,
        symbols: Vec::new(),
        scopes: vec![HashMap::new()],
        static_locals: Vec::new(),
        static_counter: 0,
        initialized: HashSet::new(),
        func_name: String::new(),
        ret_ty: CType::Void,
        variadic: false,
        loop_depth: 0,
        switches: Vec::new(),
        labels: HashSet::new(),
        gotos: Vec::new(),
    };
    let mut items = unit.items;
    for item in items.iter_mut() {
        // Errors were reported where they occurred.
        let _ = match item {
            ExternalDecl::Decl(d) => checker.file_decl(d),
            ExternalDecl::Func(f) => checker.function(f),
        };
    }
    log::debug!("checked unit: {} symbols", checker.symbols.len());
    if checker.diag.error_count() > errors_before {
        return None;
    }
    Some(CheckedUnit {
        items,
        records: checker.records,
        symbols: checker.symbols,
        static_locals: checker.static_locals,
    })
}

impl Checker<'_> {
    fn error<T>(&mut self, pos: &SourcePos, msg: impl std::fmt::Display) -> Checked<T> {
        self.diag.error(pos, msg);
        Err(Reported)
    }

    fn size_of(&self, ty: &CType) -> Option<u64> {
        self.records.size_of(ty)
    }

    fn lookup(&self, name: &str) -> Option<SymId> {
        self.scopes.iter().rev().find_map(|s| s.get(name)).copied()
    }

    fn add_symbol(&mut self, sym: Symbol) -> SymId {
        let id = SymId(self.symbols.len() as u32);
        let name = sym.name.clone();
        self.symbols.push(sym);
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, id);
        }
        id
    }

    fn sym(&self, id: SymId) -> &Symbol {
        &self.symbols[id.index()]
    }

    // --- File scope ---

    /// Declare or redeclare a file-scope name.
    fn declare_global(&mut self, name: &str, ty: &CType, kind: SymKind, pos: &SourcePos) -> Checked<SymId> {
        if let Some(&id) = self.scopes[0].get(name) {
            let prev = self.sym(id).clone();
            if prev.kind != kind || !compatible(&prev.ty, ty) {
                let pos_note = prev.pos.clone();
                self.diag.error(pos, format!("conflicting types for '{name}'"));
                self.diag.note(format!("{pos_note}: note: previous declaration of '{name}' was here"));
                return Err(Reported);
            }
            // Prefer the more complete type (prototype, array bound).
            let merged = match (&prev.ty, ty) {
                (CType::Function(f), CType::Function(g)) if !f.prototyped && g.prototyped => ty.clone(),
                (CType::Array(_, None), CType::Array(_, Some(_))) => ty.clone(),
                _ => prev.ty.clone(),
            };
            self.symbols[id.index()].ty = merged;
            return Ok(id);
        }
        let id = SymId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.to_string(),
            link_name: name.to_string(),
            ty: ty.clone(),
            kind,
            defined: false,
            addr_taken: false,
            pos: pos.clone(),
        });
        self.scopes[0].insert(name.to_string(), id);
        Ok(id)
    }

    fn file_decl(&mut self, d: &mut Declaration) -> Checked {
        if d.ty.is_function() {
            if d.init.is_some() {
                return self.error(&d.pos, format!("function '{}' is initialized like a variable", d.name));
            }
            d.sym = Some(self.declare_global(&d.name, &d.ty, SymKind::Func, &d.pos)?);
            return Ok(());
        }
        if d.ty.is_void() {
            return self.error(&d.pos, format!("variable '{}' declared void", d.name));
        }
        let id = self.declare_global(&d.name, &d.ty, SymKind::Global, &d.pos)?;
        d.sym = Some(id);
        if d.storage == Storage::Extern && d.init.is_none() {
            return Ok(());
        }
        if d.init.is_some() && !self.initialized.insert(id) {
            return self.error(&d.pos, format!("redefinition of '{}'", d.name));
        }
        self.symbols[id.index()].defined = true;
        self.object_init(d, true)?;
        self.symbols[id.index()].ty = d.ty.clone();
        if self.size_of(&d.ty).is_none() && !matches!(d.ty, CType::Array(_, None)) {
            return self.error(&d.pos, format!("storage size of '{}' isn't known", d.name));
        }
        Ok(())
    }

    fn function(&mut self, f: &mut FunctionDef) -> Checked {
        let ty = CType::Function(f.ty.clone());
        let id = self.declare_global(&f.name, &ty, SymKind::Func, &f.pos)?;
        if self.sym(id).defined {
            return self.error(&f.pos, format!("redefinition of '{}'", f.name));
        }
        self.symbols[id.index()].defined = true;
        f.sym = Some(id);

        self.func_name = f.name.clone();
        self.ret_ty = f.ty.ret.clone();
        self.variadic = f.ty.variadic;
        self.loop_depth = 0;
        self.switches.clear();
        self.labels.clear();
        self.gotos.clear();

        if f.ty.ret.is_record() && self.size_of(&f.ty.ret).is_none() {
            return self.error(&f.pos, "return type is an incomplete type");
        }

        self.scopes.push(HashMap::new());
        f.param_syms.clear();
        let mut result = Ok(());
        for (i, p) in f.params.iter().enumerate() {
            if p.ty.is_void() || (p.ty.is_record() && self.size_of(&p.ty).is_none()) {
                self.diag.error(&p.pos, "parameter has incomplete type");
                result = Err(Reported);
            }
            let name = match &p.name {
                Some(n) => n.clone(),
                None => {
                    self.diag.error(&p.pos, "parameter name omitted");
                    result = Err(Reported);
                    format!(".param{i}")
                }
            };
            if self.scopes.last().is_some_and(|s| s.contains_key(&name)) {
                self.diag.error(&p.pos, format!("redefinition of parameter '{name}'"));
                result = Err(Reported);
            }
            let sid = self.add_symbol(Symbol {
                link_name: name.clone(),
                name,
                ty: p.ty.clone(),
                kind: SymKind::Param(i as u32),
                defined: true,
                addr_taken: false,
                pos: p.pos.clone(),
            });
            f.param_syms.push(sid);
        }
        self.stmt(&mut f.body);
        self.scopes.pop();

        let gotos = std::mem::take(&mut self.gotos);
        for (label, pos) in gotos {
            if !self.labels.contains(&label) {
                self.diag.error(&pos, format!("label '{label}' used but not defined"));
                result = Err(Reported);
            }
        }
        result
    }

    // --- Statements ---

    fn stmt(&mut self, s: &mut Stmt) {
        // Errors abandon the statement; they were already reported.
        let _ = self.stmt_inner(s);
    }

    fn condition(&mut self, e: &mut Expr) -> Checked {
        self.value(e)?;
        if !e.ty.is_scalar() {
            return self.error(&e.pos, "used a value where a scalar is required");
        }
        Ok(())
    }

    fn stmt_inner(&mut self, s: &mut Stmt) -> Checked {
        let pos = s.pos.clone();
        match &mut s.kind {
            StmtKind::Null => Ok(()),
            StmtKind::Expr(e) => self.rvalue(e),
            StmtKind::Decl(decls) => {
                let mut result = Ok(());
                for d in decls.iter_mut() {
                    if self.local_decl(d).is_err() {
                        result = Err(Reported);
                    }
                }
                result
            }
            StmtKind::Block(body) => {
                self.scopes.push(HashMap::new());
                for s in body.iter_mut() {
                    self.stmt(s);
                }
                self.scopes.pop();
                Ok(())
            }
            StmtKind::If(cond, then, otherwise) => {
                let r = self.condition(cond);
                self.stmt(then);
                if let Some(o) = otherwise {
                    self.stmt(o);
                }
                r
            }
            StmtKind::While(cond, body) => {
                let r = self.condition(cond);
                self.loop_body(body);
                r
            }
            StmtKind::DoWhile(body, cond) => {
                self.loop_body(body);
                self.condition(cond)
            }
            StmtKind::For { init, cond, step, body } => {
                self.scopes.push(HashMap::new());
                if let Some(i) = init {
                    self.stmt(i);
                }
                let mut r = Ok(());
                if let Some(c) = cond {
                    r = self.condition(c);
                }
                if let Some(st) = step {
                    if self.rvalue(st).is_err() {
                        r = Err(Reported);
                    }
                }
                self.loop_body(body);
                self.scopes.pop();
                r
            }
            StmtKind::Switch(cond, body) => {
                self.value(cond)?;
                if !cond.ty.is_integer() {
                    return self.error(&cond.pos, "switch quantity not an integer");
                }
                let ty = cond.ty.promote();
                self.convert(cond, &ty);
                self.switches.push(SwitchCtx {
                    ty,
                    values: HashSet::new(),
                    has_default: false,
                });
                self.stmt(body);
                self.switches.pop();
                Ok(())
            }
            StmtKind::Case { expr, value, body } => {
                let r = self.case_label(expr, value, &pos);
                self.stmt(body);
                r
            }
            StmtKind::Default(body) => {
                let r = match self.switches.last().map(|sw| sw.has_default) {
                    None => self.error(&pos, "'default' label not within a switch statement"),
                    Some(true) => self.error(&pos, "multiple default labels in one switch"),
                    Some(false) => {
                        if let Some(sw) = self.switches.last_mut() {
                            sw.has_default = true;
                        }
                        Ok(())
                    }
                };
                self.stmt(body);
                r
            }
            StmtKind::Label(name, body) => {
                let r = if self.labels.insert(name.clone()) {
                    Ok(())
                } else {
                    let msg = format!("duplicate label '{name}'");
                    self.error(&pos, msg)
                };
                self.stmt(body);
                r
            }
            StmtKind::Goto(label) => {
                self.gotos.push((label.clone(), pos));
                Ok(())
            }
            StmtKind::Break => {
                if self.loop_depth == 0 && self.switches.is_empty() {
                    return self.error(&pos, "break statement not within loop or switch");
                }
                Ok(())
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return self.error(&pos, "continue statement not within a loop");
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                let ret = self.ret_ty.clone();
                match value {
                    Some(e) if ret.is_void() => {
                        self.rvalue(e)?;
                        if !e.ty.is_void() {
                            let msg = format!("'return' with a value, in function '{}' returning void", self.func_name);
                            return self.error(&pos, msg);
                        }
                        Ok(())
                    }
                    Some(e) => {
                        self.value(e)?;
                        self.assign_convert(e, &ret, "return")
                    }
                    None => {
                        if !ret.is_void() {
                            let msg = format!("'return' with no value, in function '{}' returning non-void", self.func_name);
                            self.diag.warning(&pos, msg);
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    fn loop_body(&mut self, body: &mut Stmt) {
        self.loop_depth += 1;
        // A switch inside the loop must not capture `continue`, which is fine since
        // `continue` only checks loop depth; `break` binds to the innermost construct.
        let saved = std::mem::take(&mut self.switches);
        self.stmt(body);
        self.switches = saved;
        self.loop_depth -= 1;
    }

    fn case_label(&mut self, expr: &mut Expr, value: &mut i64, pos: &SourcePos) -> Checked {
        let Some(sw_ty) = self.switches.last().map(|sw| sw.ty.clone()) else {
            return self.error(pos, "case label not within a switch statement");
        };
        self.value(expr)?;
        let Some(v) = eval_int(expr).filter(|_| expr.ty.is_integer()) else {
            return self.error(&expr.pos, "case label does not reduce to an integer constant");
        };
        *value = truncate(v, &sw_ty);
        let fresh = self.switches.last_mut().is_some_and(|sw| sw.values.insert(*value));
        if !fresh {
            return self.error(pos, "duplicate case value");
        }
        Ok(())
    }

    fn local_decl(&mut self, d: &mut Declaration) -> Checked {
        if self.scopes.last().is_some_and(|s| s.contains_key(&d.name)) && d.storage != Storage::Extern {
            return self.error(&d.pos, format!("redefinition of '{}'", d.name));
        }
        if d.ty.is_function() || d.storage == Storage::Extern {
            if d.init.is_some() {
                return self.error(&d.pos, format!("'{}' has both 'extern' and initializer", d.name));
            }
            let kind = if d.ty.is_function() { SymKind::Func } else { SymKind::Global };
            let id = self.declare_global(&d.name, &d.ty, kind, &d.pos)?;
            if let Some(scope) = self.scopes.last_mut() {
                scope.insert(d.name.clone(), id);
            }
            d.sym = Some(id);
            return Ok(());
        }
        if d.ty.is_void() {
            return self.error(&d.pos, format!("variable '{}' declared void", d.name));
        }

        if d.storage == Storage::Static {
            self.static_counter += 1;
            let id = self.add_symbol(Symbol {
                name: d.name.clone(),
                link_name: format!("{}.{}", d.name, self.static_counter),
                ty: d.ty.clone(),
                kind: SymKind::Global,
                defined: true,
                addr_taken: false,
                pos: d.pos.clone(),
            });
            d.sym = Some(id);
            self.object_init(d, true)?;
            self.symbols[id.index()].ty = d.ty.clone();
            self.static_locals.push(d.clone());
            return Ok(());
        }

        let id = self.add_symbol(Symbol {
            name: d.name.clone(),
            link_name: d.name.clone(),
            ty: d.ty.clone(),
            kind: SymKind::Local,
            defined: true,
            addr_taken: false,
            pos: d.pos.clone(),
        });
        d.sym = Some(id);
        self.object_init(d, false)?;
        self.symbols[id.index()].ty = d.ty.clone();
        if self.size_of(&d.ty).is_none() {
            return self.error(&d.pos, format!("storage size of '{}' isn't known", d.name));
        }
        Ok(())
    }

    // --- Initializers ---

    /// Flatten the initializer of `d`, completing an unsized array type from it.
    fn object_init(&mut self, d: &mut Declaration, is_static: bool) -> Checked {
        let Some(mut init) = d.init.take() else {
            return Ok(());
        };
        let checked = self.init_exprs(&mut init);
        d.init = Some(init.clone());
        checked?;
        let mut out = Vec::new();
        let count = self.init_object(&d.ty, init, 0, is_static, &mut out)?;
        if let CType::Array(elem, None) = &d.ty {
            d.ty = CType::Array(elem.clone(), Some(count));
        }
        d.flat_init = out;
        Ok(())
    }

    /// Check every element expression of an initializer as a value.
    fn init_exprs(&mut self, init: &mut Initializer) -> Checked {
        match init {
            Initializer::Expr(e) => self.value(e),
            Initializer::List(items, _) => {
                let mut result = Ok(());
                for item in items.iter_mut() {
                    if self.init_exprs(item).is_err() {
                        result = Err(Reported);
                    }
                }
                result
            }
        }
    }

    /// Initialize one object at `offset`. Returns the element count for arrays.
    fn init_object(
        &mut self,
        ty: &CType,
        init: Initializer,
        offset: u64,
        is_static: bool,
        out: &mut Vec<InitItem>,
    ) -> Checked<u64> {
        // A string literal, possibly braced, initializes a char array.
        if let CType::Array(elem, n) = ty {
            if elem.is_integer() && self.size_of(elem) == Some(1) {
                let s = match &init {
                    Initializer::Expr(e) => string_literal(e),
                    Initializer::List(items, _) => match items.as_slice() {
                        [Initializer::Expr(e)] => string_literal(e),
                        _ => None,
                    },
                };
                if let Some(s) = s {
                    let mut bytes = s.to_vec();
                    bytes.push(0);
                    if let Some(n) = n {
                        if bytes.len() as u64 > *n + 1 {
                            let pos = match &init {
                                Initializer::Expr(e) => e.pos.clone(),
                                Initializer::List(_, p) => p.clone(),
                            };
                            self.diag.warning(&pos, "initializer-string for array of chars is too long");
                        }
                        bytes.truncate(*n as usize);
                    }
                    let len = bytes.len() as u64;
                    out.push(InitItem::Bytes { offset, bytes });
                    return Ok(n.unwrap_or(len));
                }
            }
        }

        match init {
            Initializer::List(items, pos) => {
                if ty.is_scalar() {
                    let mut it = items.into_iter();
                    let Some(first) = it.next() else {
                        return self.error(&pos, "empty scalar initializer");
                    };
                    if it.next().is_some() {
                        self.diag.warning(&pos, "excess elements in scalar initializer");
                    }
                    return self.init_object(ty, first, offset, is_static, out);
                }
                let mut it = items.into_iter().peekable();
                let count = self.init_aggregate(ty, &mut it, offset, is_static, out)?;
                if it.peek().is_some() {
                    self.diag.warning(&pos, "excess elements in initializer");
                }
                Ok(count)
            }
            Initializer::Expr(e) => {
                if ty.is_array() {
                    return self.error(&e.pos, "array initializer must be an initializer list");
                }
                if ty.is_record() && !compatible(&e.ty, ty) {
                    let mut it = vec![Initializer::Expr(e)].into_iter().peekable();
                    return self.init_aggregate(ty, &mut it, offset, is_static, out);
                }
                self.scalar_init(ty, e, offset, is_static, out).map(|_| 1)
            }
        }
    }

    fn init_aggregate(
        &mut self,
        ty: &CType,
        it: &mut Peekable<std::vec::IntoIter<Initializer>>,
        offset: u64,
        is_static: bool,
        out: &mut Vec<InitItem>,
    ) -> Checked<u64> {
        let members: Vec<(u64, CType)> = match ty {
            CType::Array(elem, n) => {
                let size = self.size_of(elem).unwrap_or(0);
                let mut count = 0u64;
                while it.peek().is_some() && n.map_or(true, |n| count < n) {
                    self.init_member(elem, it, offset + count * size, is_static, out)?;
                    count += 1;
                }
                return Ok(n.unwrap_or(count));
            }
            CType::Record(id) => {
                let rec = self.records.get(*id);
                let fields = rec.fields.iter().map(|f| (f.offset, f.ty.clone()));
                if rec.is_union {
                    fields.take(1).collect()
                } else {
                    fields.collect()
                }
            }
            _ => return Ok(0),
        };
        for (off, fty) in members {
            if it.peek().is_none() {
                break;
            }
            self.init_member(&fty, it, offset + off, is_static, out)?;
        }
        Ok(1)
    }

    /// Initialize one member from the front of `it`, eliding braces when needed.
    fn init_member(
        &mut self,
        ty: &CType,
        it: &mut Peekable<std::vec::IntoIter<Initializer>>,
        offset: u64,
        is_static: bool,
        out: &mut Vec<InitItem>,
    ) -> Checked {
        // Braces may be elided for nested aggregates; a string literal still
        // initializes a whole char array and a record value a whole record.
        let takes_whole = match it.peek() {
            Some(Initializer::List(..)) => true,
            Some(Initializer::Expr(e)) => match ty {
                CType::Array(..) => string_literal(e).is_some(),
                CType::Record(_) => compatible(&e.ty, ty),
                _ => true,
            },
            None => return Ok(()),
        };
        if takes_whole {
            if let Some(init) = it.next() {
                self.init_object(ty, init, offset, is_static, out)?;
            }
            return Ok(());
        }
        self.init_aggregate(ty, it, offset, is_static, out).map(|_| ())
    }

    fn scalar_init(&mut self, ty: &CType, mut e: Expr, offset: u64, is_static: bool, out: &mut Vec<InitItem>) -> Checked {
        self.assign_convert(&mut e, ty, "initialization")?;
        let value = if is_static {
            match self.const_value(&e) {
                Some(v) => Some(v),
                None => return self.error(&e.pos, "initializer element is not constant"),
            }
        } else {
            None
        };
        out.push(InitItem::Scalar { offset, expr: e, value });
        Ok(())
    }

    /// Constant value of a checked static initializer element.
    fn const_value(&self, e: &Expr) -> Option<ConstValue> {
        match &e.kind {
            ExprKind::Float(f) => Some(ConstValue::Float(*f)),
            ExprKind::Decay(inner) => self.const_address(inner),
            ExprKind::Unary(UnaryOp::AddrOf, inner) => self.const_address(inner),
            ExprKind::Cast(inner) if e.ty.is_floating() => match self.const_value(inner)? {
                ConstValue::Int(v) => {
                    let f = if inner.ty.is_signed() { v as f64 } else { v as u64 as f64 };
                    Some(ConstValue::Float(f))
                }
                ConstValue::Float(f) => Some(ConstValue::Float(f)),
                ConstValue::Addr { .. } => None,
            },
            ExprKind::Cast(inner) => match self.const_value(inner)? {
                ConstValue::Float(f) if e.ty.is_integer() => Some(ConstValue::Int(truncate(f as i64, &e.ty))),
                ConstValue::Int(v) => Some(ConstValue::Int(truncate(v, &e.ty))),
                addr @ ConstValue::Addr { .. } if e.ty.is_wide() => Some(addr),
                _ => None,
            },
            ExprKind::Binary(op @ (BinaryOp::Add | BinaryOp::Sub), a, b) if e.ty.is_pointer() => {
                let step = e.ty.pointee().and_then(|t| self.size_of(t)).unwrap_or(1) as i64;
                let (base, n) = match (self.const_value(a)?, eval_int(b)) {
                    (ConstValue::Addr { target, disp }, Some(n)) => ((target, disp), n),
                    _ => return None,
                };
                let delta = if *op == BinaryOp::Add { n * step } else { -n * step };
                Some(ConstValue::Addr {
                    target: base.0,
                    disp: base.1 + delta,
                })
            }
            _ => eval_int(e).map(ConstValue::Int),
        }
    }

    /// Address constant of an lvalue or function designator.
    fn const_address(&self, e: &Expr) -> Option<ConstValue> {
        match &e.kind {
            ExprKind::Sym(id) => {
                let sym = self.sym(*id);
                matches!(sym.kind, SymKind::Global | SymKind::Func).then(|| ConstValue::Addr {
                    target: AddrTarget::Sym(*id),
                    disp: 0,
                })
            }
            ExprKind::Str(s) => Some(ConstValue::Addr {
                target: AddrTarget::Str(s.clone()),
                disp: 0,
            }),
            ExprKind::Member { base, offset, .. } => match self.const_address(base)? {
                ConstValue::Addr { target, disp } => Some(ConstValue::Addr {
                    target,
                    disp: disp + *offset as i64,
                }),
                _ => None,
            },
            ExprKind::Unary(UnaryOp::Deref, inner) => self.const_value(inner),
            _ => None,
        }
    }

    // --- Conversions ---

    /// Convert `e` to `ty`, folding integer and floating constants.
    fn convert(&self, e: &mut Expr, ty: &CType) {
        if e.ty == *ty {
            return;
        }
        if ty.is_void() {
            let inner = take(e);
            *e = Expr::new(ExprKind::Cast(Box::new(inner)), CType::Void, e.pos.clone());
            return;
        }
        match e.kind {
            ExprKind::Int(v) if ty.is_integer() || ty.is_pointer() => {
                e.kind = ExprKind::Int(truncate(v, ty));
                e.ty = ty.clone();
                return;
            }
            ExprKind::Int(v) if ty.is_floating() && e.ty.is_integer() => {
                let f = if e.ty.is_signed() { v as f64 } else { v as u64 as f64 };
                e.kind = ExprKind::Float(if *ty == CType::Float { f as f32 as f64 } else { f });
                e.ty = ty.clone();
                return;
            }
            ExprKind::Float(f) if ty.is_floating() => {
                e.kind = ExprKind::Float(if *ty == CType::Float { f as f32 as f64 } else { f });
                e.ty = ty.clone();
                return;
            }
            ExprKind::Float(f) if ty.is_integer() => {
                e.kind = ExprKind::Int(truncate(f as i64, ty));
                e.ty = ty.clone();
                return;
            }
            _ => {}
        }
        let pos = e.pos.clone();
        let inner = take(e);
        *e = Expr::new(ExprKind::Cast(Box::new(inner)), ty.clone(), pos);
    }

    /// Check that a value of `e`'s type may be assigned to `ty` and convert it.
    fn assign_convert(&mut self, e: &mut Expr, ty: &CType, what: &str) -> Checked {
        let from = e.ty.clone();
        let ok = match (ty, &from) {
            (t, f) if t.is_arithmetic() && f.is_arithmetic() => true,
            (CType::Int { kind: IntKind::Bool, .. }, f) if f.is_pointer() => true,
            (CType::Pointer(_), _) if e.is_null_constant() => true,
            (CType::Pointer(to), CType::Pointer(fr)) => {
                if !(to.is_void() || fr.is_void() || compatible(to, fr)) {
                    self.diag.extension(
                        &e.pos,
                        format!("incompatible pointer types in {what} ('{from}' to '{ty}')"),
                    );
                }
                true
            }
            (CType::Pointer(_), f) if f.is_integer() => {
                return self.error(&e.pos, format!("{what} makes pointer from integer without a cast"));
            }
            (t, CType::Pointer(_)) if t.is_integer() => {
                return self.error(&e.pos, format!("{what} makes integer from pointer without a cast"));
            }
            (t @ CType::Record(_), f) => compatible(t, f),
            _ => false,
        };
        if !ok {
            return self.error(&e.pos, format!("incompatible types in {what} ('{from}' to '{ty}')"));
        }
        self.convert(e, ty);
        Ok(())
    }

    /// Default argument promotions for variadic and unprototyped calls.
    fn default_promote(&self, e: &mut Expr) {
        let ty = match &e.ty {
            CType::Float => CType::Double,
            t if t.is_integer() => t.promote(),
            _ => return,
        };
        self.convert(e, &ty);
    }

    // --- Expressions ---

    /// Check `e` and apply array and function decay.
    fn rvalue(&mut self, e: &mut Expr) -> Checked {
        self.expr(e)?;
        if e.ty.is_array() || e.ty.is_function() {
            let ty = e.ty.decay();
            let pos = e.pos.clone();
            let inner = take(e);
            if let ExprKind::Sym(id) = inner.kind {
                let sym = &mut self.symbols[id.index()];
                if sym.kind != SymKind::Func {
                    sym.addr_taken = true;
                }
            }
            *e = Expr::new(ExprKind::Decay(Box::new(inner)), ty, pos);
        }
        Ok(())
    }

    /// An rvalue that must not be void.
    fn value(&mut self, e: &mut Expr) -> Checked {
        self.rvalue(e)?;
        if e.ty.is_void() {
            return self.error(&e.pos, "void value not ignored as it ought to be");
        }
        Ok(())
    }

    fn arith(&mut self, e: &mut Expr, what: &str) -> Checked {
        self.value(e)?;
        if !e.ty.is_arithmetic() {
            return self.error(&e.pos, format!("invalid operand to {what} (have '{}')", e.ty));
        }
        Ok(())
    }

    fn integer(&mut self, e: &mut Expr, what: &str) -> Checked {
        self.value(e)?;
        if !e.ty.is_integer() {
            return self.error(&e.pos, format!("invalid operand to {what} (have '{}')", e.ty));
        }
        Ok(())
    }

    fn is_lvalue(&self, e: &Expr) -> bool {
        match &e.kind {
            ExprKind::Sym(id) => self.sym(*id).kind != SymKind::Func,
            ExprKind::Unary(UnaryOp::Deref, _) | ExprKind::Str(_) => true,
            ExprKind::Member { base, .. } => self.is_lvalue(base),
            _ => false,
        }
    }

    fn modifiable(&mut self, e: &Expr, what: &str) -> Checked {
        if !self.is_lvalue(e) || e.ty.is_array() || e.ty.is_function() || matches!(e.kind, ExprKind::Str(_)) {
            return self.error(&e.pos, format!("lvalue required as {what}"));
        }
        Ok(())
    }

    fn pointee_size(&mut self, ptr: &CType, pos: &SourcePos) -> Checked<u64> {
        let Some(pointee) = ptr.pointee() else {
            return Ok(1);
        };
        if pointee.is_void() {
            self.diag.extension(pos, "pointer of type 'void *' used in arithmetic");
            return Ok(1);
        }
        match self.size_of(pointee) {
            Some(n) => Ok(n),
            None => self.error(pos, format!("arithmetic on a pointer to an incomplete type '{pointee}'")),
        }
    }

    fn expr(&mut self, e: &mut Expr) -> Checked {
        let pos = e.pos.clone();
        match &mut e.kind {
            ExprKind::Int(_) | ExprKind::Float(_) | ExprKind::Str(_) => Ok(()),
            ExprKind::Sym(id) => {
                e.ty = self.sym(*id).ty.clone();
                Ok(())
            }
            ExprKind::Ident(name) => {
                let Some(id) = self.lookup(name) else {
                    let msg = format!("'{name}' undeclared");
                    return self.error(&pos, msg);
                };
                e.kind = ExprKind::Sym(id);
                e.ty = self.sym(id).ty.clone();
                Ok(())
            }
            ExprKind::Unary(op, operand) => {
                let op = *op;
                let ty = self.unary(op, operand, &pos)?;
                let folded = match (op, &operand.kind) {
                    (UnaryOp::Neg, ExprKind::Int(v)) => Some(ExprKind::Int(truncate(v.wrapping_neg(), &ty))),
                    (UnaryOp::Neg, ExprKind::Float(f)) => Some(ExprKind::Float(-f)),
                    _ => None,
                };
                if let Some(kind) = folded {
                    e.kind = kind;
                }
                e.ty = ty;
                Ok(())
            }
            ExprKind::IncDec { expr, .. } => {
                self.expr(expr)?;
                self.modifiable(expr, "increment/decrement operand")?;
                if !expr.ty.is_scalar() {
                    return self.error(&pos, "wrong type argument to increment/decrement");
                }
                if expr.ty.is_pointer() {
                    let ty = expr.ty.clone();
                    self.pointee_size(&ty, &pos)?;
                }
                e.ty = expr.ty.clone();
                Ok(())
            }
            ExprKind::Binary(op, a, b) => {
                let op = *op;
                let ty = self.binary(op, a, b, &pos)?;
                e.ty = ty;
                Ok(())
            }
            ExprKind::Assign { op, lhs, rhs, op_ty } => {
                let op = *op;
                self.expr(lhs)?;
                self.modifiable(lhs, "left operand of assignment")?;
                self.value(rhs)?;
                let lty = lhs.ty.clone();
                match op {
                    None => {
                        self.assign_convert(rhs, &lty, "assignment")?;
                        *op_ty = lty.clone();
                    }
                    Some(BinaryOp::Add | BinaryOp::Sub) if lty.is_pointer() => {
                        if !rhs.ty.is_integer() {
                            return self.error(&pos, "invalid operands to pointer compound assignment");
                        }
                        self.pointee_size(&lty, &pos)?;
                        self.convert(rhs, &CType::LONG);
                        *op_ty = lty.clone();
                    }
                    Some(op) => {
                        let needs_int = matches!(
                            op,
                            BinaryOp::Mod | BinaryOp::Shl | BinaryOp::Shr | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor
                        );
                        let ok = if needs_int {
                            lty.is_integer() && rhs.ty.is_integer()
                        } else {
                            lty.is_arithmetic() && rhs.ty.is_arithmetic()
                        };
                        if !ok {
                            let msg = format!("invalid operands to binary {}= ('{}' and '{}')", op.symbol(), lty, rhs.ty);
                            return self.error(&pos, msg);
                        }
                        let common = if op.is_shift() {
                            lty.promote()
                        } else {
                            usual_arithmetic(&lty, &rhs.ty)
                        };
                        self.convert(rhs, &common);
                        *op_ty = common;
                    }
                }
                e.ty = lty;
                Ok(())
            }
            ExprKind::Cond(c, a, b) => {
                self.condition(c)?;
                self.rvalue(a)?;
                self.rvalue(b)?;
                let ty = self.cond_type(a, b, &pos)?;
                self.convert(a, &ty);
                self.convert(b, &ty);
                e.ty = ty;
                Ok(())
            }
            ExprKind::Comma(a, b) => {
                self.rvalue(a)?;
                self.rvalue(b)?;
                e.ty = b.ty.clone();
                Ok(())
            }
            ExprKind::Call(callee, args) => {
                let ty = self.call(callee, args, &pos)?;
                e.ty = ty;
                Ok(())
            }
            ExprKind::Index(base, index) => {
                let sum = Expr::new(
                    ExprKind::Binary(BinaryOp::Add, Box::new(take(base)), Box::new(take(index))),
                    CType::Void,
                    pos.clone(),
                );
                *e = Expr::new(ExprKind::Unary(UnaryOp::Deref, Box::new(sum)), CType::Void, pos);
                self.expr(e)
            }
            ExprKind::Member { base, name, arrow, offset } => {
                if *arrow {
                    self.value(base)?;
                    if !base.ty.pointee().is_some_and(|t| t.is_record()) {
                        let msg = format!("invalid type argument of '->' (have '{}')", base.ty);
                        return self.error(&pos, msg);
                    }
                    let rec_ty = base.ty.pointee().cloned().unwrap_or(CType::Void);
                    let inner = take(base);
                    **base = Expr::new(ExprKind::Unary(UnaryOp::Deref, Box::new(inner)), rec_ty, pos.clone());
                    *arrow = false;
                } else {
                    self.expr(base)?;
                }
                let CType::Record(id) = base.ty else {
                    let msg = format!("request for member '{name}' in something not a structure or union");
                    return self.error(&pos, msg);
                };
                if !self.records.get(id).complete {
                    return self.error(&pos, format!("dereferencing pointer to incomplete type '{}'", base.ty));
                }
                let Some((off, fty)) = self.records.field(id, name) else {
                    let msg = format!("'{}' has no member named '{name}'", base.ty);
                    return self.error(&pos, msg);
                };
                *offset = off;
                e.ty = fty;
                Ok(())
            }
            ExprKind::Cast(inner) => {
                self.rvalue(inner)?;
                let to = e.ty.clone();
                let from = inner.ty.clone();
                let ok = to.is_void()
                    || (to.is_scalar()
                        && from.is_scalar()
                        && !(to.is_pointer() && from.is_floating())
                        && !(to.is_floating() && from.is_pointer()));
                if !ok {
                    if to.is_scalar() && from.is_void() {
                        return self.error(&pos, "void value not ignored as it ought to be");
                    }
                    return self.error(&pos, format!("invalid cast from '{from}' to '{to}'"));
                }
                let mut inner_expr = take(inner);
                self.convert(&mut inner_expr, &to);
                *e = inner_expr;
                e.pos = pos;
                Ok(())
            }
            ExprKind::Decay(_) => Ok(()),
            ExprKind::SizeofExpr(inner) => {
                self.expr(inner)?;
                let ty = inner.ty.clone();
                match (ty.is_function(), self.size_of(&ty)) {
                    (false, Some(n)) => {
                        *e = Expr::int(n as i64, CType::ULONG, pos);
                        Ok(())
                    }
                    _ => self.error(&pos, format!("invalid application of 'sizeof' to type '{ty}'")),
                }
            }
            ExprKind::SizeofType(ty) => match self.size_of(ty) {
                Some(n) => {
                    *e = Expr::int(n as i64, CType::ULONG, pos);
                    Ok(())
                }
                None => {
                    let msg = format!("invalid application of 'sizeof' to incomplete type '{ty}'");
                    self.error(&pos, msg)
                }
            },
            ExprKind::VaStart(list) => {
                if !self.variadic {
                    return self.error(&pos, "'va_start' used in function with fixed arguments");
                }
                self.va_list_operand(list)?;
                e.ty = CType::Void;
                Ok(())
            }
            ExprKind::VaArg(list) => {
                self.va_list_operand(list)?;
                if e.ty.is_void() || self.size_of(&e.ty).is_none() {
                    return self.error(&pos, "invalid type in va_arg");
                }
                Ok(())
            }
            ExprKind::VaEnd(list) => {
                self.va_list_operand(list)?;
                e.ty = CType::Void;
                Ok(())
            }
            ExprKind::VaCopy(dst, src) => {
                self.va_list_operand(dst)?;
                self.va_list_operand(src)?;
                e.ty = CType::Void;
                Ok(())
            }
        }
    }

    fn va_list_operand(&mut self, list: &mut Expr) -> Checked {
        self.value(list)?;
        let is_list = matches!(list.ty.pointee(), Some(CType::Record(id)) if self.records.get(*id).tag.as_deref() == Some("__va_list_tag"));
        if !is_list {
            return self.error(&list.pos, format!("expected 'va_list', have '{}'", list.ty));
        }
        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, operand: &mut Expr, pos: &SourcePos) -> Checked<CType> {
        match op {
            UnaryOp::Neg | UnaryOp::Plus => {
                self.arith(operand, "unary minus")?;
                let ty = operand.ty.promote();
                self.convert(operand, &ty);
                Ok(ty)
            }
            UnaryOp::BitNot => {
                self.integer(operand, "unary ~")?;
                let ty = operand.ty.promote();
                self.convert(operand, &ty);
                Ok(ty)
            }
            UnaryOp::Not => {
                self.condition(operand)?;
                Ok(CType::INT)
            }
            UnaryOp::Deref => {
                self.value(operand)?;
                match operand.ty.pointee() {
                    Some(t) if t.is_void() => self.error(pos, "dereferencing 'void *' pointer"),
                    Some(t) if operand.ty.is_pointer() => Ok(t.clone()),
                    _ => self.error(pos, format!("invalid type argument of unary '*' (have '{}')", operand.ty)),
                }
            }
            UnaryOp::AddrOf => {
                self.expr(operand)?;
                let is_func = operand.ty.is_function();
                if !is_func && !self.is_lvalue(operand) {
                    return self.error(pos, "lvalue required as unary '&' operand");
                }
                self.mark_address_taken(operand);
                Ok(CType::pointer_to(operand.ty.clone()))
            }
        }
    }

    fn mark_address_taken(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Sym(id) => self.symbols[id.index()].addr_taken = true,
            ExprKind::Member { base, .. } => self.mark_address_taken(base),
            _ => {}
        }
    }

    fn binary(&mut self, op: BinaryOp, a: &mut Expr, b: &mut Expr, pos: &SourcePos) -> Checked<CType> {
        if op.is_logical() {
            self.condition(a)?;
            self.condition(b)?;
            return Ok(CType::INT);
        }
        self.value(a)?;
        self.value(b)?;
        let (ta, tb) = (a.ty.clone(), b.ty.clone());
        let bad = |this: &mut Self| {
            let msg = format!("invalid operands to binary {} (have '{ta}' and '{tb}')", op.symbol());
            this.error(pos, msg)
        };

        match op {
            BinaryOp::Add | BinaryOp::Sub if ta.is_pointer() && tb.is_integer() => {
                self.pointee_size(&ta, pos)?;
                self.convert(b, &CType::LONG);
                Ok(ta)
            }
            BinaryOp::Add if ta.is_integer() && tb.is_pointer() => {
                // Canonical order: pointer on the left.
                std::mem::swap(a, b);
                self.pointee_size(&tb, pos)?;
                self.convert(b, &CType::LONG);
                Ok(tb)
            }
            BinaryOp::Sub if ta.is_pointer() && tb.is_pointer() => {
                let (pa, pb) = (ta.pointee().cloned(), tb.pointee().cloned());
                if !matches!((&pa, &pb), (Some(x), Some(y)) if compatible(x, y)) {
                    return bad(self);
                }
                self.pointee_size(&ta, pos)?;
                Ok(CType::LONG)
            }
            _ if op.is_comparison() && (ta.is_pointer() || tb.is_pointer()) => {
                if ta.is_pointer() && tb.is_pointer() {
                    let (pa, pb) = (ta.pointee(), tb.pointee());
                    let ok = matches!((pa, pb), (Some(x), Some(y)) if x.is_void() || y.is_void() || compatible(x, y));
                    if !ok {
                        self.diag.extension(pos, "comparison of distinct pointer types lacks a cast");
                    }
                    self.convert(b, &ta);
                } else if ta.is_pointer() {
                    if !b.is_null_constant() {
                        if !tb.is_integer() {
                            return bad(self);
                        }
                        self.diag.extension(pos, "comparison between pointer and integer");
                    }
                    self.convert(b, &ta);
                } else {
                    if !a.is_null_constant() {
                        if !ta.is_integer() {
                            return bad(self);
                        }
                        self.diag.extension(pos, "comparison between pointer and integer");
                    }
                    self.convert(a, &tb);
                }
                Ok(CType::INT)
            }
            _ if op.is_shift() => {
                if !(ta.is_integer() && tb.is_integer()) {
                    return bad(self);
                }
                let ty = ta.promote();
                self.convert(a, &ty);
                self.convert(b, &ty);
                Ok(ty)
            }
            BinaryOp::Mod | BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                if !(ta.is_integer() && tb.is_integer()) {
                    return bad(self);
                }
                let ty = usual_arithmetic(&ta, &tb);
                self.convert(a, &ty);
                self.convert(b, &ty);
                if op == BinaryOp::Mod && b.int_value() == Some(0) {
                    self.diag.warning(pos, "division by zero");
                }
                Ok(ty)
            }
            _ => {
                if !(ta.is_arithmetic() && tb.is_arithmetic()) {
                    return bad(self);
                }
                let ty = usual_arithmetic(&ta, &tb);
                self.convert(a, &ty);
                self.convert(b, &ty);
                if op == BinaryOp::Div && b.int_value() == Some(0) {
                    self.diag.warning(pos, "division by zero");
                }
                Ok(if op.is_comparison() { CType::INT } else { ty })
            }
        }
    }

    fn cond_type(&mut self, a: &Expr, b: &Expr, pos: &SourcePos) -> Checked<CType> {
        let (ta, tb) = (&a.ty, &b.ty);
        if ta.is_arithmetic() && tb.is_arithmetic() {
            return Ok(usual_arithmetic(ta, tb));
        }
        if ta.is_void() && tb.is_void() {
            return Ok(CType::Void);
        }
        if ta.is_pointer() && b.is_null_constant() {
            return Ok(ta.clone());
        }
        if tb.is_pointer() && a.is_null_constant() {
            return Ok(tb.clone());
        }
        if let (Some(pa), Some(pb)) = (ta.pointee(), tb.pointee()) {
            if pa.is_void() {
                return Ok(ta.clone());
            }
            if pb.is_void() {
                return Ok(tb.clone());
            }
            if !compatible(pa, pb) {
                self.diag.extension(pos, "pointer type mismatch in conditional expression");
            }
            return Ok(ta.clone());
        }
        if ta.is_record() && compatible(ta, tb) {
            return Ok(ta.clone());
        }
        self.error(pos, "type mismatch in conditional expression")
    }

    fn call(&mut self, callee: &mut Expr, args: &mut [Expr], pos: &SourcePos) -> Checked<CType> {
        if let ExprKind::Ident(name) = &callee.kind {
            if self.lookup(name).is_none() {
                let name = name.clone();
                self.diag
                    .extension(&callee.pos, format!("implicit declaration of function '{name}'"));
                let ty = CType::Function(Rc::new(FuncType {
                    ret: CType::INT,
                    params: Vec::new(),
                    variadic: false,
                    prototyped: false,
                }));
                let id = SymId(self.symbols.len() as u32);
                self.symbols.push(Symbol {
                    name: name.clone(),
                    link_name: name.clone(),
                    ty,
                    kind: SymKind::Func,
                    defined: false,
                    addr_taken: false,
                    pos: callee.pos.clone(),
                });
                self.scopes[0].insert(name, id);
            }
        }
        self.value(callee)?;
        let Some(fty) = callee.ty.func().cloned().filter(|_| callee.ty.is_pointer()) else {
            let msg = format!("called object is not a function (have '{}')", callee.ty);
            return self.error(pos, msg);
        };
        let name = match &callee.kind {
            ExprKind::Decay(inner) => match inner.kind {
                ExprKind::Sym(id) => self.sym(id).name.clone(),
                _ => "function".to_string(),
            },
            _ => "function pointer".to_string(),
        };

        let mut result = Ok(());
        for arg in args.iter_mut() {
            if self.value(arg).is_err() {
                result = Err(Reported);
            }
        }
        result?;

        if fty.prototyped {
            let n = fty.params.len();
            if args.len() < n || (!fty.variadic && args.len() > n) {
                let which = if args.len() < n { "few" } else { "many" };
                return self.error(pos, format!("too {which} arguments to function '{name}'"));
            }
        }
        for (i, arg) in args.iter_mut().enumerate() {
            match fty.params.get(i).filter(|_| fty.prototyped) {
                Some(pty) => {
                    let what = format!("passing argument {} of '{name}'", i + 1);
                    self.assign_convert(arg, pty, &what)?;
                }
                None => self.default_promote(arg),
            }
            if arg.ty.is_record() && self.size_of(&arg.ty).is_none() {
                return self.error(&arg.pos, "argument has incomplete type");
            }
        }
        if fty.ret.is_record() && self.size_of(&fty.ret).is_none() {
            return self.error(pos, "calling function with incomplete return type");
        }
        Ok(fty.ret.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::MessageSink;
    use crate::frontend::{lexer::tokenize, parser::parse};

    fn check_src(src: &str, pedantic: bool) -> (Option<CheckedUnit>, String) {
        let sink = MessageSink::capture();
        let mut diag = Diagnostics::new(sink.clone(), "t.c", false, pedantic);
        let unit = parse(tokenize(src, "t.c").unwrap()).unwrap();
        let checked = check(unit, &mut diag);
        (checked, sink.contents())
    }

    fn body(unit: &CheckedUnit, func: usize) -> &Vec<Stmt> {
        match &unit.items[func] {
            ExternalDecl::Func(FunctionDef {
                body: Stmt {
                    kind: StmtKind::Block(b), ..
                },
                ..
            }) => b,
            _ => panic!("expected a function"),
        }
    }

    #[test]
    fn test_pointer_to_int_assignment_is_an_error() {
        let (unit, msgs) = check_src("int main(void) { int x; int y = 1; x = &y; return x; }", false);
        assert!(unit.is_none());
        assert!(msgs.contains("t.c:1:40: error: assignment makes integer from pointer without a cast"), "{msgs}");
    }

    #[test]
    fn test_implicit_declaration_is_an_extension() {
        let src = "int main(void) { return helper(1); }";
        let (unit, msgs) = check_src(src, false);
        assert!(unit.is_some());
        assert!(msgs.contains("warning: implicit declaration of function 'helper'"));
        let (unit, msgs) = check_src(src, true);
        assert!(unit.is_none());
        assert!(msgs.contains("error: implicit declaration"));
    }

    #[test]
    fn test_statement_errors_are_all_reported() {
        let src = "void v(void) {}\n\
                   int f(int a) {\n\
                     break;\n\
                     int b = v();\n\
                     undeclared = 1;\n\
                     goto nowhere;\n\
                     return f(1, 2);\n\
                   }\n\
                   int f(int a) { return a; }";
        let (unit, msgs) = check_src(src, false);
        assert!(unit.is_none());
        for expected in [
            "t.c:3:1: error: break statement not within loop or switch",
            "void value not ignored",
            "'undeclared' undeclared",
            "label 'nowhere' used but not defined",
            "too many arguments to function 'f'",
            "redefinition of 'f'",
        ] {
            assert!(msgs.contains(expected), "missing {expected:?} in {msgs}");
        }
    }

    #[test]
    fn test_conversions_and_rewrites() {
        let src = "struct p { int x; long y; };\n\
                   long g(struct p *s, int *a, char c) { return s->y + a[2] + c; }";
        let (unit, msgs) = check_src(src, false);
        let unit = unit.unwrap_or_else(|| panic!("{msgs}"));
        let StmtKind::Return(Some(ret)) = &body(&unit, 0)[0].kind else {
            panic!("expected a return");
        };
        assert_eq!(ret.ty, CType::LONG);
        // (s->y + (long) a[2]) + (long) c
        let ExprKind::Binary(BinaryOp::Add, lhs, rhs) = &ret.kind else {
            panic!("expected an addition");
        };
        assert!(matches!(&rhs.kind, ExprKind::Cast(inner) if inner.ty == CType::CHAR));
        let ExprKind::Binary(BinaryOp::Add, member, index) = &lhs.kind else {
            panic!("expected an addition");
        };
        assert!(matches!(&member.kind, ExprKind::Member { offset: 8, arrow: false, .. }));
        assert!(matches!(&index.kind, ExprKind::Cast(inner) if matches!(inner.kind, ExprKind::Unary(UnaryOp::Deref, _))));
    }

    #[test]
    fn test_static_initializers() {
        let src = "int n = 2 + 3 * 4;\n\
                   char msg[] = \"hi\";\n\
                   int table[] = { 1, 2, 3 };\n\
                   int *p = &table[1];\n\
                   struct s { char *name; int v; } items[] = { { \"a\", 1 }, \"b\", 2 };\n\
                   int bad = n;";
        let (unit, msgs) = check_src(src, false);
        assert!(unit.is_none());
        assert!(msgs.contains("t.c:6:11: error: initializer element is not constant"), "{msgs}");

        let (unit, msgs) = check_src(&src.replace("int bad = n;", ""), false);
        let unit = unit.unwrap_or_else(|| panic!("{msgs}"));
        let decl = |i: usize| match &unit.items[i] {
            ExternalDecl::Decl(d) => d,
            _ => panic!("expected a declaration"),
        };
        assert!(matches!(decl(0).flat_init[0], InitItem::Scalar { value: Some(ConstValue::Int(14)), .. }));
        assert_eq!(decl(1).ty, CType::Array(Rc::new(CType::CHAR), Some(3)));
        assert_eq!(decl(2).ty, CType::Array(Rc::new(CType::INT), Some(3)));
        assert!(matches!(
            &decl(3).flat_init[0],
            InitItem::Scalar { value: Some(ConstValue::Addr { disp: 4, .. }), .. }
        ));
        let items = decl(4);
        assert_eq!(unit.records.size_of(&items.ty), Some(32));
        assert_eq!(items.flat_init.len(), 4);
        assert!(matches!(&items.flat_init[2], InitItem::Scalar { offset: 16, .. }));
    }

    #[test]
    fn test_switch_checks() {
        let src = "int f(int x) { switch (x) { case 1: case 2 - 1: return 0; default: default: ; } case 3: return 1; }";
        let (unit, msgs) = check_src(src, false);
        assert!(unit.is_none());
        assert!(msgs.contains("duplicate case value"));
        assert!(msgs.contains("multiple default labels"));
        assert!(msgs.contains("case label not within a switch"));
    }

    #[test]
    fn test_eval_int_respects_types() {
        let e = Expr::new(
            ExprKind::Binary(
                BinaryOp::Div,
                Box::new(Expr::int(-2i64 as u32 as i64, CType::UINT, SourcePos::default())),
                Box::new(Expr::int(2, CType::UINT, SourcePos::default())),
            ),
            CType::UINT,
            SourcePos::default(),
        );
        assert_eq!(eval_int(&e), Some(0x7fff_ffff));
        assert_eq!(truncate(300, &CType::CHAR), 44);
        assert_eq!(truncate(-1, &CType::UINT), 0xffff_ffff);
    }
}
