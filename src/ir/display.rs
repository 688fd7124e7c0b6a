//! Textual dump of IR modules, used by debug output.

use super::module::{Func, ItemKind, Module};
use super::operand::{MemOp, Operand};
use std::fmt;

struct OperandDisplay<'a> {
    module: &'a Module,
    func: &'a Func,
    op: &'a Operand,
}

impl fmt::Display for OperandDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let var_name = |v: super::operand::VarId| {
            self.func
                .var(v)
                .map_or_else(|| format!("%{}", v.0), |vi| vi.name.to_string())
        };
        match self.op {
            Operand::Var(v) => write!(f, "{}", var_name(*v)),
            Operand::Int(i) => write!(f, "{i}"),
            Operand::Uint(u) => write!(f, "{u}u"),
            Operand::Float(x) => write!(f, "{x:?}f"),
            Operand::Double(x) => write!(f, "{x:?}"),
            Operand::LDouble(x) => write!(f, "{x:?}L"),
            Operand::Ref(id) => match self.module.item(*id) {
                Some(item) => write!(f, "{}", item.name),
                None => write!(f, "<item {}>", id.0),
            },
            Operand::Str(s) => {
                let bytes = self.module.string(*s).unwrap_or(&[]);
                let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
                write!(f, "{:?}", String::from_utf8_lossy(text))
            }
            Operand::Label(l) => write!(f, "L{}", l.0),
            Operand::Mem(m) => {
                let MemOp {
                    ty,
                    disp,
                    base,
                    index,
                    scale,
                    alias,
                    nonalias,
                } = m;
                write!(f, "{ty}:{disp}(")?;
                if let Some(b) = base {
                    write!(f, "{}", var_name(*b))?;
                }
                if let Some(i) = index {
                    write!(f, ", {}, {scale}", var_name(*i))?;
                }
                write!(f, ")")?;
                if *alias != 0 {
                    write!(f, ":{alias}")?;
                }
                if *nonalias != 0 {
                    write!(f, ":!{nonalias}")?;
                }
                Ok(())
            }
        }
    }
}

/// Printer for one function body.
pub struct FuncDisplay<'a> {
    pub module: &'a Module,
    pub name: &'a str,
    pub func: &'a Func,
}

impl fmt::Display for FuncDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let res: Vec<String> = self.func.res_types.iter().map(|t| t.to_string()).collect();
        let args: Vec<String> = self
            .func
            .vars
            .iter()
            .take(self.func.nargs as usize)
            .map(|v| format!("{}:{}", v.ty, v.name))
            .collect();
        write!(f, "{}: func {}", self.name, res.join(", "))?;
        if !args.is_empty() {
            write!(f, ", {}", args.join(", "))?;
        }
        if self.func.vararg {
            write!(f, ", ...")?;
        }
        writeln!(f)?;
        for v in self.func.vars.iter().skip(self.func.nargs as usize) {
            writeln!(f, "  local {}:{}", v.ty, v.name)?;
        }
        for insn in self.func.insns.iter() {
            if insn.code == super::opcode::Opcode::Label {
                if let Some(Operand::Label(l)) = insn.ops.first() {
                    writeln!(f, "L{}:", l.0)?;
                    continue;
                }
            }
            write!(f, "  {}", insn.code.name())?;
            for (i, op) in insn.ops.iter().enumerate() {
                let sep = if i == 0 { " " } else { ", " };
                write!(
                    f,
                    "{sep}{}",
                    OperandDisplay {
                        module: self.module,
                        func: self.func,
                        op,
                    }
                )?;
            }
            writeln!(f)?;
        }
        writeln!(f, "  endfunc")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}: module", self.name)?;
        for item in self.items.iter() {
            match &item.kind {
                ItemKind::Func(func) => write!(
                    f,
                    "{}",
                    FuncDisplay {
                        module: self,
                        name: &item.name,
                        func,
                    }
                )?,
                ItemKind::Proto(p) => {
                    let args: Vec<String> = p.args.iter().map(|t| t.to_string()).collect();
                    let res: Vec<String> = p.res_types.iter().map(|t| t.to_string()).collect();
                    writeln!(
                        f,
                        "{}: proto ({}) -> ({}){}",
                        item.name,
                        args.join(", "),
                        res.join(", "),
                        if p.vararg { " ..." } else { "" }
                    )?
                }
                ItemKind::Import => writeln!(f, "import {}", item.name)?,
                ItemKind::Export => writeln!(f, "export {}", item.name)?,
                ItemKind::Forward => writeln!(f, "forward {}", item.name)?,
                ItemKind::Data { ty, bytes } => {
                    writeln!(f, "{}: {} data[{}]", item.name, ty, bytes.len())?
                }
                ItemKind::Bss { size, align } => {
                    writeln!(f, "{}: bss {} align {}", item.name, size, align)?
                }
                ItemKind::RefData { target, disp } => {
                    let target = self.item(*target).map_or("?", |t| &*t.name);
                    writeln!(f, "{}: ref {} + {}", item.name, target, disp)?
                }
                ItemKind::DataRef { data, offset, target, disp } => {
                    let data = self.item(*data).map_or("?", |t| &*t.name);
                    let target = self.item(*target).map_or("?", |t| &*t.name);
                    writeln!(f, "{}: {}+{} = ref {} + {}", item.name, data, offset, target, disp)?
                }
                ItemKind::Global { ty, init } => match init {
                    Some(Operand::Int(i)) => writeln!(f, "{}: global {} = {}", item.name, ty, i)?,
                    Some(Operand::Uint(u)) => writeln!(f, "{}: global {} = {}", item.name, ty, u)?,
                    Some(Operand::Float(x)) => writeln!(f, "{}: global {} = {:?}", item.name, ty, x)?,
                    Some(Operand::Double(x)) | Some(Operand::LDouble(x)) => {
                        writeln!(f, "{}: global {} = {:?}", item.name, ty, x)?
                    }
                    _ => writeln!(f, "{}: global {}", item.name, ty)?,
                },
            }
        }
        writeln!(f, "endmodule")
    }
}

#[cfg(test)]
mod tests {
    use crate::core::alloc::ContextAlloc;
    use crate::ir::{FuncBuilder, MemOp, Module, Opcode, Type};

    #[test]
    fn test_dump() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("demo", &alloc);
        let mut b = FuncBuilder::new(&mut m, "load", vec![Type::I64], &[("p", Type::P)], false);
        let p = b.arg(0);
        let r = b.var("r", Type::I64);
        let l = b.new_label();
        b.label(l);
        b.emit(Opcode::Mov, [r.into(), MemOp::based(Type::I32, p, 4).with_alias(2).into()]);
        b.emit(Opcode::Ret, [r.into()]);
        b.finish();

        let text = m.to_string();
        assert!(text.contains("load: func i64, p:p"));
        assert!(text.contains("L0:"));
        assert!(text.contains("mov r, i32:4(p):2"));
        assert!(text.contains("ret r"));
    }
}
