// Small-function inlining on the IR, before any function is analyzed. A call is
// expanded when its callee is a function of the same module (directly or through a
// forward declaration or export), is not the caller, is not variadic, stays within the
// size limit (larger for calls marked INLINE) and uses no stack-pointer or variadic
// operations, since those depend on the callee's own frame. Expansion appends the
// callee's variables to the caller under fresh ids, shifts its labels past the
// caller's, moves the arguments into the renamed parameters, and turns every RET into
// moves to the call's result variables followed by a jump to a label placed after the
// body. Only one level is expanded: calls inside an inlined body stay calls. Callers
// containing phis are left alone because the new label would change the predecessor
// their phis name.

//! Call expansion of small same-module functions.

use crate::core::alloc::AllocStr;
use crate::core::options::ActiveOpts;
use crate::core::session::{CompilationSession, StatEvent};
use crate::ir::{
    ir_vec, Func, Insn, IrVec, ItemId, ItemKind, LabelId, MemOp, Module, Opcode, Operand, Type, ValueClass, VarId, VarInfo,
};

/// Callee size limit for plain calls.
pub const INLINE_LIMIT: usize = 64;
/// Callee size limit for calls marked INLINE.
pub const INLINE_HINT_LIMIT: usize = 256;

fn move_code(ty: Type) -> Opcode {
    match ty.class() {
        ValueClass::Int => Opcode::Mov,
        ValueClass::Float => Opcode::FMov,
        ValueClass::Double => Opcode::DMov,
        ValueClass::LDouble => Opcode::LDMov,
    }
}

fn inlinable_body(func: &Func, limit: usize) -> bool {
    use Opcode::*;
    !func.vararg
        && func.insns.len() <= limit
        && !func.arg_types().any(|t| t.is_block())
        && !func
            .insns
            .iter()
            .any(|i| matches!(i.code, Alloca | BStart | BEnd | VaStart | VaArg | VaEnd))
}

/// Function to expand for `insn` in `caller`, if any.
fn inline_target<'m>(module: &'m Module, caller: ItemId, insn: &Insn) -> Option<&'m Func> {
    if !insn.code.is_call() {
        return None;
    }
    let Some(Operand::Ref(callee)) = insn.ops.get(1) else {
        return None;
    };
    let id = module.resolve_func(*callee)?;
    if id == caller {
        return None;
    }
    let func = module.item(id)?.func()?;
    let limit = if insn.code == Opcode::Inline { INLINE_HINT_LIMIT } else { INLINE_LIMIT };
    let nres = func.res_types.len();
    let shape_ok = insn.ops.len() == 2 + nres + func.nargs as usize;
    (shape_ok && inlinable_body(func, limit)).then_some(func)
}

/// Renaming of one expanded body.
struct Renamer {
    var_base: u32,
    label_base: u32,
}

impl Renamer {
    fn var(&self, v: VarId) -> VarId {
        VarId(v.0 + self.var_base)
    }

    fn operand(&self, op: &Operand) -> Operand {
        match *op {
            Operand::Var(v) => Operand::Var(self.var(v)),
            Operand::Label(l) => Operand::Label(LabelId(l.0 + self.label_base)),
            Operand::Mem(m) => Operand::Mem(MemOp {
                base: m.base.map(|b| self.var(b)),
                index: m.index.map(|i| self.var(i)),
                ..m
            }),
            other => other,
        }
    }
}

fn expand(module: &Module, caller: &mut Func, call: &Insn, callee: &Func, out: &mut IrVec<Insn>) {
    let alloc = module.alloc();
    let rn = Renamer {
        var_base: caller.vars.len() as u32,
        label_base: caller.next_label,
    };
    let end = LabelId(caller.next_label + callee.next_label);
    caller.next_label = end.0 + 1;
    let prefix = caller.vars.len();
    caller.vars.extend(callee.vars.iter().map(|v| VarInfo {
        name: AllocStr::format(alloc, format_args!("i{prefix}.{}", v.name)),
        ty: v.ty,
    }));

    let nres = callee.res_types.len();
    let results = &call.ops[2..2 + nres];
    for (k, arg) in call.ops[2 + nres..].iter().enumerate() {
        let param = rn.var(VarId(k as u32));
        out.push(Insn::new(alloc, move_code(callee.var_type(VarId(k as u32))), [param.into(), *arg]));
    }
    for insn in callee.insns.iter() {
        if insn.code == Opcode::Ret {
            for (dst, value) in results.iter().zip(insn.ops.iter()) {
                let ty = dst.var().map_or(Type::I64, |v| caller.var_type(v));
                out.push(Insn::new(alloc, move_code(ty), [*dst, rn.operand(value)]));
            }
            out.push(Insn::new(alloc, Opcode::Jmp, [end.into()]));
        } else {
            out.push(Insn {
                code: insn.code,
                ops: ir_vec(alloc, insn.ops.iter().map(|op| rn.operand(op))),
            });
        }
    }
    out.push(Insn::new(alloc, Opcode::Label, [end.into()]));
}

/// Expand eligible calls. Returns `None` when nothing was inlined.
pub fn inline_module(module: &Module, opts: &ActiveOpts, session: &CompilationSession) -> Option<Module> {
    if !opts.inline {
        return None;
    }
    let mut result: Option<Module> = None;
    for (id, item, func) in module.funcs() {
        if func.insns.iter().any(|i| i.code == Opcode::Phi) {
            continue;
        }
        if !func.insns.iter().any(|i| inline_target(module, id, i).is_some()) {
            continue;
        }

        let mut caller = func.clone();
        let mut insns = IrVec::with_capacity_in(func.insns.len(), module.alloc().clone());
        for insn in func.insns.iter() {
            match inline_target(module, id, insn) {
                Some(callee) => {
                    log::debug!("inlining a call in {} ({} insns)", item.name, callee.insns.len());
                    expand(module, &mut caller, insn, callee, &mut insns);
                    session.record(StatEvent::InlinedCall);
                }
                None => insns.push(insn.clone()),
            }
        }
        caller.insns = insns;

        let out = result.get_or_insert_with(|| module.clone());
        if let Some(slot) = out.item_mut(id) {
            slot.kind = ItemKind::Func(caller);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alloc::ContextAlloc;
    use crate::core::options::{OptFlags, TargetCaps};
    use crate::ir::FuncBuilder;

    fn opts(inline: bool) -> ActiveOpts {
        let mut flags = OptFlags::none();
        flags.inline = inline;
        flags.resolve(TargetCaps { x86_64: true, fma: false })
    }

    fn module_with_call(alloc: &ContextAlloc, body_len: usize) -> (Module, ItemId) {
        let mut m = Module::new("m", alloc);
        let proto = m.add_proto("p", vec![Type::I64], vec![Type::I64], false);
        let mut b = FuncBuilder::new(&mut m, "twice", vec![Type::I64], &[("x", Type::I64)], false);
        let x = b.arg(0);
        let r = b.var("r", Type::I64);
        b.emit(Opcode::Add, [r.into(), x.into(), x.into()]);
        for _ in 0..body_len {
            b.emit(Opcode::Mov, [r.into(), r.into()]);
        }
        b.emit(Opcode::Ret, [r.into()]);
        let twice = b.finish();

        let mut b = FuncBuilder::new(&mut m, "main", vec![Type::I64], &[("a", Type::I64)], false);
        let a = b.arg(0);
        let t = b.var("t", Type::I64);
        b.emit(Opcode::Call, [proto.into(), twice.into(), t.into(), a.into()]);
        b.emit(Opcode::Ret, [t.into()]);
        let main = b.finish();
        (m, main)
    }

    #[test]
    fn test_small_call_is_expanded() {
        let alloc = ContextAlloc::system();
        let (m, main) = module_with_call(&alloc, 0);
        let session = CompilationSession::new(&alloc);
        let out = inline_module(&m, &opts(true), &session).unwrap();
        let func = out.item(main).and_then(|it| it.func()).unwrap();
        let codes: Vec<_> = func.insns.iter().map(|i| i.code).collect();
        assert_eq!(
            codes,
            vec![Opcode::Mov, Opcode::Add, Opcode::Mov, Opcode::Jmp, Opcode::Label, Opcode::Ret]
        );
        // a, t, then the callee's x and r.
        assert_eq!(func.vars.len(), 4);
        assert_eq!(func.vars[2].name, "i2.x");
        assert_eq!(func.next_label, 1);
        assert_eq!(func.insns[1].ops[0], Operand::Var(VarId(3)));
        assert_eq!(session.stats().count(StatEvent::InlinedCall), 1);
        assert!(crate::ir::validate_module(&out).is_ok());
    }

    #[test]
    fn test_large_callee_and_disabled_flag_are_skipped() {
        let alloc = ContextAlloc::system();
        let session = CompilationSession::new(&alloc);
        let (m, _) = module_with_call(&alloc, INLINE_LIMIT);
        assert!(inline_module(&m, &opts(true), &session).is_none());
        let (m, _) = module_with_call(&alloc, 0);
        assert!(inline_module(&m, &opts(false), &session).is_none());
    }
}
