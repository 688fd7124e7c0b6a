//! Operand shape checks run before lowering.
//!
//! The front-end guarantees type legality; these checks only catch the structural
//! violations that would otherwise surface as nonsense machine code, and report them as
//! internal errors.

use super::module::{Func, ItemKind, Module};
use super::opcode::Opcode;
use super::operand::{LabelId, Operand};
use crate::core::error::{CompileError, CompileResult};

/// Check every function of `module`.
pub fn validate_module(module: &Module) -> CompileResult<()> {
    for (_, item, func) in module.funcs() {
        validate_func(module, &item.name, func)?;
    }
    Ok(())
}

fn malformed(function: &str, reason: impl Into<String>) -> CompileError {
    CompileError::MalformedIr {
        function: function.to_string(),
        reason: reason.into(),
    }
}

/// Check one function body.
pub fn validate_func(module: &Module, name: &str, func: &Func) -> CompileResult<()> {
    let mut defined = allocator_api2::vec![in module.alloc().clone(); false; func.next_label as usize];
    for insn in func.insns.iter() {
        if insn.code != Opcode::Label {
            continue;
        }
        let label = match insn.ops.first() {
            Some(Operand::Label(l)) if insn.ops.len() == 1 => *l,
            _ => return Err(malformed(name, "label instruction without a label operand")),
        };
        match defined.get_mut(label.0 as usize) {
            Some(seen) if !*seen => *seen = true,
            Some(_) => return Err(malformed(name, format!("label L{} defined twice", label.0))),
            None => return Err(malformed(name, format!("label L{} was never allocated", label.0))),
        }
    }
    let check_label = |l: LabelId| -> CompileResult<()> {
        if defined.get(l.0 as usize).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(CompileError::UnresolvedLabel {
                function: name.to_string(),
                label: l.0,
            })
        }
    };

    for (idx, insn) in func.insns.iter().enumerate() {
        let code = insn.code;
        let ops = &insn.ops;
        let at = |reason: &str| malformed(name, format!("{} at {}: {}", code.name(), idx, reason));

        let mut mem_count = 0;
        for op in ops.iter() {
            for v in op.read_vars() {
                if v.index() >= func.vars.len() {
                    return Err(at(&format!("variable %{} out of range", v.0)));
                }
            }
            if let Operand::Mem(m) = op {
                mem_count += 1;
                if !matches!(m.scale, 1 | 2 | 4 | 8) {
                    return Err(at(&format!("scale {} not in 1, 2, 4, 8", m.scale)));
                }
            }
            if let Operand::Ref(id) = op {
                if module.item(*id).is_none() {
                    return Err(at("reference to a missing item"));
                }
            }
        }
        if mem_count > 1 {
            return Err(at("more than one memory operand"));
        }

        if code.has_result() && code != Opcode::Phi {
            match ops.first() {
                Some(Operand::Var(_)) => {}
                Some(Operand::Mem(_)) if code.move_class().is_some() => {}
                _ => return Err(at("result must be a variable")),
            }
        }

        match code {
            Opcode::Label => {}
            Opcode::Switch => {
                if ops.len() < 2 || ops[0].label().is_some() {
                    return Err(at("expected an index followed by labels"));
                }
                for op in ops.iter().skip(1) {
                    check_label(op.label().ok_or_else(|| at("switch target is not a label"))?)?;
                }
            }
            Opcode::Call | Opcode::Inline => validate_call(module, func, ops, &at)?,
            Opcode::Ret => {
                if ops.len() != func.res_types.len() {
                    return Err(at("result count differs from the declaration"));
                }
            }
            Opcode::Phi => {
                if ops.len() < 3 || ops.len() % 2 == 0 || ops[0].var().is_none() {
                    return Err(at("expected a result and label/value pairs"));
                }
                for pair in ops[1..].chunks(2) {
                    check_label(pair[0].label().ok_or_else(|| at("phi predecessor is not a label"))?)?;
                }
            }
            _ if code.is_branch() => {
                let label = ops.first().and_then(|o| o.label()).ok_or_else(|| at("first operand must be a label"))?;
                check_label(label)?;
                let expected = match code {
                    Opcode::Jmp | Opcode::Bo | Opcode::UBo | Opcode::Bno | Opcode::UBno => 1,
                    Opcode::Bt | Opcode::BtS | Opcode::Bf | Opcode::BfS => 2,
                    _ => 3,
                };
                if ops.len() != expected {
                    return Err(at(&format!("expected {expected} operands")));
                }
            }
            _ => {
                if let Some(l) = ops.iter().find_map(|o| o.label()) {
                    return Err(at(&format!("unexpected label operand L{}", l.0)));
                }
            }
        }
    }
    Ok(())
}

fn validate_call(
    module: &Module,
    func: &Func,
    ops: &[Operand],
    at: &dyn Fn(&str) -> CompileError,
) -> CompileResult<()> {
    let proto = match ops.first() {
        Some(Operand::Ref(id)) => module.item(*id).and_then(|it| it.proto()),
        _ => None,
    }
    .ok_or_else(|| at("first operand must reference a prototype"))?;

    match ops.get(1) {
        Some(Operand::Var(v)) if v.index() < func.vars.len() => {}
        Some(Operand::Ref(id)) => {
            let kind = module.item(*id).map(|it| &it.kind);
            if !matches!(
                kind,
                Some(ItemKind::Func(_) | ItemKind::Import | ItemKind::Forward | ItemKind::Export)
            ) {
                return Err(at("callee is not a function"));
            }
        }
        _ => return Err(at("missing callee")),
    }

    let nres = proto.res_types.len();
    let nargs = ops.len().saturating_sub(2 + nres);
    if ops.len() < 2 + nres {
        return Err(at("missing result operands"));
    }
    if ops[2..2 + nres].iter().any(|o| o.var().is_none()) {
        return Err(at("call results must be variables"));
    }
    if nargs < proto.args.len() || (!proto.vararg && nargs != proto.args.len()) {
        return Err(at(&format!(
            "{} arguments for a prototype taking {}",
            nargs,
            proto.args.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alloc::ContextAlloc;
    use crate::ir::{FuncBuilder, MemOp, Type};

    #[test]
    fn test_accepts_well_formed() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let mut b = FuncBuilder::new(&mut m, "f", vec![Type::I64], &[("x", Type::I64)], false);
        let x = b.arg(0);
        let l = b.new_label();
        b.emit(Opcode::Bt, [l.into(), x.into()]);
        b.emit(Opcode::Mov, [x.into(), Operand::Int(1)]);
        b.label(l);
        b.emit(Opcode::Ret, [x.into()]);
        b.finish();
        assert!(validate_module(&m).is_ok());
    }

    #[test]
    fn test_rejects_undefined_label() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let mut b = FuncBuilder::new(&mut m, "f", vec![], &[], false);
        let l = b.new_label();
        b.emit(Opcode::Jmp, [l.into()]);
        b.emit(Opcode::Ret, []);
        b.finish();
        let err = validate_module(&m).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedLabel { label: 0, .. }));
        assert!(err.is_internal());
    }

    #[test]
    fn test_rejects_bad_scale_and_double_memory() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let mut b = FuncBuilder::new(&mut m, "f", vec![], &[("p", Type::P)], false);
        let p = b.arg(0);
        b.emit(
            Opcode::Mov,
            [
                MemOp::based(Type::I64, p, 0).into(),
                MemOp::new(Type::I64, 0, Some(p), Some(p), 3).into(),
            ],
        );
        b.emit(Opcode::Ret, []);
        b.finish();
        assert!(matches!(validate_module(&m), Err(CompileError::MalformedIr { .. })));
    }

    #[test]
    fn test_call_argument_count() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let proto = m.add_proto("p2", vec![Type::I64], vec![Type::I64, Type::I64], false);
        let callee = m.add_import("ext");
        let mut b = FuncBuilder::new(&mut m, "f", vec![], &[], false);
        let r = b.var("r", Type::I64);
        b.emit(Opcode::Call, [proto.into(), callee.into(), r.into(), Operand::Int(1)]);
        b.emit(Opcode::Ret, []);
        b.finish();
        assert!(validate_module(&m).is_err());
    }
}
