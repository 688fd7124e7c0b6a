// Calls follow the System V AMD64 convention. The block cache is flushed and emptied
// first, because its pools overlap the argument registers and none of it survives the
// call, and it stays disabled while the arguments are marshalled. Variables with XMM
// homes live in caller-saved registers, so they are stored to their slots around the
// call and reloaded after it. Stack arguments are written first, using RAX, R11 and
// XMM0 as temporaries; then the XMM arguments, whose float immediates also go through
// RAX; then the integer argument registers, which no variable occupies at this point.
// By-value aggregates are copied into the outgoing area. Variadic callees get the count
// of vector registers used in AL. Results are read back from RAX/RDX, XMM0/XMM1 and the
// x87 stack.

//! Call lowering.

use super::{precision, FunctionLowering, ItemAddr, RAX, R11, XMM0};
use crate::codegen::frame::RSP;
use crate::core::error::{CompileError, CompileResult};
use crate::ir::{ir_vec, Insn, IrVec, Operand, Type, ValueClass};
use crate::x64::calling_convention::{
    assign_args, assign_results, ArgAttribute, CCAssigner, CCAssignment, RegBank, SysVAssigner,
};
use crate::x64::encoder::{AluOp, GpSrc, MemRef, Width, X87Format};

/// Widths used to copy a by-value aggregate of `size` bytes, largest first.
fn copy_chunks(size: u32) -> impl Iterator<Item = (i32, Width)> {
    let mut off = 0u32;
    std::iter::from_fn(move || {
        let left = size.checked_sub(off).filter(|l| *l > 0)?;
        let w = match left {
            8.. => Width::W64,
            4..=7 => Width::W32,
            2..=3 => Width::W16,
            _ => Width::W8,
        };
        let chunk = (off as i32, w);
        off += w.bytes();
        Some(chunk)
    })
}

impl<'l> FunctionLowering<'l> {
    /// IR type an argument operand is passed as when the prototype does not name it.
    fn operand_type(&self, op: &Operand) -> Type {
        match *op {
            Operand::Var(v) => self.func.var_type(v),
            Operand::Mem(m) => m.ty,
            Operand::Float(_) => Type::F,
            Operand::Double(_) => Type::D,
            Operand::LDouble(_) => Type::LD,
            Operand::Ref(_) | Operand::Str(_) => Type::P,
            _ => Type::I64,
        }
    }

    fn store_xmm_homes(&mut self, reload: bool) -> CompileResult<()> {
        let homes = ir_vec(self.session.alloc(), self.frame.xmm_homes());
        for (v, reg) in homes {
            let prec = precision(self.func.var_type(v).class());
            let slot = self.frame.slot(v);
            if reload {
                self.enc.sse_load(prec, reg, &slot)?;
            } else {
                self.enc.sse_store(prec, &slot, reg)?;
            }
        }
        Ok(())
    }

    fn store_stack_arg(&mut self, op: &Operand, ty: Type, loc: &CCAssignment, off: i32) -> CompileResult<()> {
        let dst = MemRef::base(RSP, off);
        if let ArgAttribute::ByVal { size, .. } = loc.attribute {
            let p = self.int_reg(op, R11, Width::W64)?;
            for (chunk, w) in copy_chunks(size) {
                self.enc.load(w, RAX, &MemRef::base(p, chunk))?;
                self.enc.store(w, &dst.offset(chunk), GpSrc::Reg(RAX))?;
            }
            return Ok(());
        }
        match ty.class() {
            ValueClass::LDouble => {
                self.ld_push(op)?;
                self.enc.fstp(X87Format::F80, &dst)?;
            }
            ValueClass::Int => {
                let s = self.int_src(op, RAX, Width::W64, false, true)?;
                self.enc.store(Width::W64, &dst, s)?;
            }
            class => {
                let prec = precision(class);
                let r = self.fp_reg(op, prec, XMM0)?;
                self.enc.sse_store(prec, &dst, r)?;
            }
        }
        Ok(())
    }

    pub(super) fn lower_call(&mut self, insn: &Insn) -> CompileResult<()> {
        let module = self.module;
        let proto = match insn.ops.first() {
            Some(Operand::Ref(id)) => module.item(*id).and_then(|it| it.proto()),
            _ => None,
        }
        .ok_or_else(|| self.malformed("call without a prototype"))?;
        let callee = self.op(insn, 1)?;
        let nres = proto.res_types.len();
        let results = insn.ops.get(2..2 + nres).ok_or_else(|| self.unencodable(insn))?;
        let args = insn.ops.get(2 + nres..).unwrap_or(&[]);
        let alloc = self.session.alloc().clone();
        let arg_types = ir_vec(
            &alloc,
            args.iter()
                .enumerate()
                .map(|(k, op)| proto.args.get(k).copied().unwrap_or_else(|| self.operand_type(op))),
        );
        let res_locs = assign_results(&alloc, &proto.res_types);
        if res_locs.iter().any(Option::is_none) {
            return Err(self.unencodable(insn));
        }

        self.flush()?;
        self.cache.clear();
        self.chain_var = None;
        self.allow_cache = false;
        self.store_xmm_homes(false)?;

        let mut assigner = SysVAssigner::new();
        let locs = assign_args(&alloc, &mut assigner, arg_types.iter().copied());
        let stack_size = assigner.stack_size();
        if stack_size > 0 {
            self.enc
                .alu(AluOp::Sub, Width::W64, RSP, GpSrc::Imm(stack_size as i32))?;
        }

        for ((op, &ty), loc) in args.iter().zip(&arg_types).zip(&locs) {
            if let (None, Some(off)) = (loc.reg, loc.stack_off) {
                self.store_stack_arg(op, ty, loc, off)?;
            }
        }
        for ((op, &ty), loc) in args.iter().zip(&arg_types).zip(&locs) {
            if let (Some(target), RegBank::Xmm) = (loc.reg, loc.bank) {
                let prec = precision(ty.class());
                let s = self.fp_src(op, prec, target, true)?;
                self.enc.sse_move(prec, target, s)?;
            }
        }
        for (op, loc) in args.iter().zip(&locs) {
            if let (Some(target), RegBank::GeneralPurpose) = (loc.reg, loc.bank) {
                let s = self.int_src(op, target, Width::W64, true, true)?;
                self.mov_to(Width::W64, target, s)?;
            }
        }
        if proto.vararg {
            self.enc.mov_ri(RAX, assigner.xmm_used() as i64)?;
        }

        match callee {
            Operand::Ref(id) => match self.link.item_addr(module, id) {
                Some(ItemAddr::Label(l)) => self.enc.call_label(l)?,
                Some(ItemAddr::Abs(a)) => {
                    self.enc.mov_ri(R11, a as i64)?;
                    self.enc.call_reg(R11)?;
                }
                None => {
                    let name = module.item(id).map_or_else(String::new, |it| it.name.to_string());
                    return Err(CompileError::UndefinedSymbol { name });
                }
            },
            Operand::Var(_) => {
                let r = self.int_reg(&callee, R11, Width::W64)?;
                self.enc.call_reg(r)?;
            }
            _ => return Err(self.unencodable(insn)),
        }

        if stack_size > 0 {
            self.enc
                .alu(AluOp::Add, Width::W64, RSP, GpSrc::Imm(stack_size as i32))?;
        }
        self.store_xmm_homes(true)?;

        let mut x87 = IrVec::new_in(alloc.clone());
        for (op, loc) in results.iter().zip(res_locs.into_iter().flatten()) {
            let v = op.var().ok_or_else(|| self.unencodable(insn))?;
            match (loc.bank, loc.reg) {
                (RegBank::GeneralPurpose, Some(r)) => {
                    let d = self.begin_dest(v)?;
                    self.mov_to(Width::W64, d, GpSrc::Reg(r))?;
                    self.commit_dest(v, d)?;
                }
                (RegBank::Xmm, Some(r)) => {
                    let d = self.begin_fdest(v, self.cur)?;
                    self.enc.sse_mov_rr(d, r)?;
                    self.commit_dest(v, d)?;
                }
                _ => x87.push((loc.st_index, v)),
            }
        }
        x87.sort_by_key(|(st, _)| *st);
        for (_, v) in x87 {
            self.commit_ld(v)?;
        }

        self.allow_cache = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_copy_chunks() {
        let chunks: Vec<_> = copy_chunks(15).collect();
        assert_eq!(
            chunks,
            vec![(0, Width::W64), (8, Width::W32), (12, Width::W16), (14, Width::W8)]
        );
        assert_eq!(copy_chunks(16).count(), 2);
        assert_eq!(copy_chunks(0).count(), 0);
    }
}
