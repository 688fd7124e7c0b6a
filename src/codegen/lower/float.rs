// Float, double and long double instruction selection. Float and double values live in
// XMM registers and use the scalar SSE forms, with a memory right operand when direct
// memory operands are enabled. Long doubles are kept in 16-byte stack slots and computed
// on the x87 stack: every instruction pushes its operands, operates and pops the result
// back into the destination slot, so the x87 stack is empty between instructions.
// Conversions that have no single SSE instruction (unsigned 64-bit to float, and the
// long double forms) go through the frame's scratch slot. A multiply feeding only the
// following add is fused into one vfmadd231 when the target has FMA.

//! Float, double and long double instruction selection.

use super::{precision, x87_format, FunctionLowering, RAX, RCX, XMM0, XMM1, XMM2};
use crate::core::error::CompileResult;
use crate::core::session::StatEvent;
use crate::ir::{FpOp, Insn, Opcode, Operand, ValueClass};
use crate::x64::encoder::{AluOp, GpSrc, JumpCondition, Precision, ShiftAmount, ShiftOp, SseOp, Width, X87Format, XmmSrc};

/// 2^64 as an IEEE single.
const TWO_POW_64_F32: u32 = 0x5F80_0000;

fn sse_op(op: FpOp) -> SseOp {
    match op {
        FpOp::Add => SseOp::Add,
        FpOp::Sub => SseOp::Sub,
        FpOp::Mul => SseOp::Mul,
        FpOp::Div => SseOp::Div,
    }
}

fn sign_mask(prec: Precision) -> i64 {
    match prec {
        Precision::Single => 0x8000_0000,
        Precision::Double => i64::MIN,
    }
}

impl<'l> FunctionLowering<'l> {
    pub(super) fn lower_fp_move(&mut self, insn: &Insn, class: ValueClass) -> CompileResult<()> {
        let prec = precision(class);
        let src = self.op(insn, 1)?;
        match self.op(insn, 0)? {
            Operand::Var(v) => {
                let s = self.fp_src(&src, prec, XMM0, true)?;
                let d = self.begin_fdest(v, self.cur)?;
                self.enc.sse_move(prec, d, s)?;
                self.commit_dest(v, d)
            }
            Operand::Mem(m) => {
                let r = self.fp_reg(&src, prec, XMM0)?;
                let addr = self.mem_addr(&m)?;
                self.enc.sse_store(prec, &addr, r)?;
                self.invalidate_stored(&m);
                Ok(())
            }
            _ => Err(self.unencodable(insn)),
        }
    }

    pub(super) fn lower_ld_move(&mut self, insn: &Insn) -> CompileResult<()> {
        let src = self.op(insn, 1)?;
        match self.op(insn, 0)? {
            Operand::Var(v) => {
                self.ld_push(&src)?;
                self.commit_ld(v)
            }
            Operand::Mem(m) => {
                self.ld_push(&src)?;
                let addr = self.mem_addr(&m)?;
                self.enc.fstp(x87_format(m.ty), &addr)?;
                self.invalidate_stored(&m);
                Ok(())
            }
            _ => Err(self.unencodable(insn)),
        }
    }

    pub(super) fn lower_fp_binop(&mut self, insn: &Insn, op: FpOp, class: ValueClass) -> CompileResult<()> {
        let prec = precision(class);
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let b = self.op(insn, 2)?;
        let commutative = matches!(op, FpOp::Add | FpOp::Mul);

        let bs = self.fp_src(&b, prec, XMM1, true)?;
        let as_ = self.fp_src(&a, prec, XMM2, true)?;
        let d = self.begin_fdest(v, self.cur)?;
        if bs.uses(d) {
            if commutative && self.opts.commute && matches!(bs, XmmSrc::Reg(r) if r == d) {
                self.enc.sse_arith(sse_op(op), prec, d, as_)?;
                self.session.record(StatEvent::CommutedOperands);
            } else {
                self.enc.sse_move(prec, XMM2, as_)?;
                self.enc.sse_arith(sse_op(op), prec, XMM2, bs)?;
                self.enc.sse_move(prec, d, XmmSrc::Reg(XMM2))?;
            }
        } else {
            self.enc.sse_move(prec, d, as_)?;
            self.enc.sse_arith(sse_op(op), prec, d, bs)?;
        }
        self.commit_dest(v, d)
    }

    pub(super) fn lower_fneg(&mut self, insn: &Insn) -> CompileResult<()> {
        let prec = if insn.code == Opcode::FNeg { Precision::Single } else { Precision::Double };
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let s = self.fp_src(&a, prec, XMM0, true)?;
        let d = self.begin_fdest(v, self.cur)?;
        self.enc.sse_move(prec, d, s)?;
        self.enc.mov_ri(RAX, sign_mask(prec))?;
        self.enc.movq_to_xmm(prec, XMM1, RAX)?;
        self.enc.xorps(d, XMM1)?;
        self.commit_dest(v, d)
    }

    pub(super) fn lower_sse_convert(&mut self, insn: &Insn) -> CompileResult<()> {
        use Opcode::*;
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        match insn.code {
            I2F | I2D => {
                let prec = if insn.code == I2F { Precision::Single } else { Precision::Double };
                let s = self.int_src(&a, RAX, Width::W64, true, false)?;
                let d = self.begin_fdest(v, self.cur)?;
                self.enc.cvtsi2s(prec, d, s)?;
                self.commit_dest(v, d)
            }
            UI2F | UI2D => {
                let prec = if insn.code == UI2F { Precision::Single } else { Precision::Double };
                let s = self.int_src(&a, RAX, Width::W64, true, false)?;
                self.mov_to(Width::W64, RAX, s)?;
                let d = self.begin_fdest(v, self.cur)?;
                let mut big = self.enc.create_label();
                let mut done = self.enc.create_label();
                self.enc.test(Width::W64, RAX, RAX)?;
                self.enc.jcc(JumpCondition::Sign, big)?;
                self.enc.cvtsi2s(prec, d, GpSrc::Reg(RAX))?;
                self.enc.jmp(done)?;
                // Halve with the low bit kept sticky, convert, then double.
                self.enc.bind(&mut big)?;
                self.enc.mov_rr(Width::W64, RCX, RAX)?;
                self.enc.shift(ShiftOp::Shr, Width::W64, RCX, ShiftAmount::Imm(1))?;
                self.enc.alu(AluOp::And, Width::W32, RAX, GpSrc::Imm(1))?;
                self.enc.alu(AluOp::Or, Width::W64, RCX, GpSrc::Reg(RAX))?;
                self.enc.cvtsi2s(prec, d, GpSrc::Reg(RCX))?;
                self.enc.sse_arith(SseOp::Add, prec, d, XmmSrc::Reg(d))?;
                self.enc.bind(&mut done)?;
                self.commit_dest(v, d)
            }
            F2I | D2I => {
                let prec = if insn.code == F2I { Precision::Single } else { Precision::Double };
                let s = self.fp_src(&a, prec, XMM0, true)?;
                let d = self.begin_dest(v)?;
                self.enc.cvtts2si(prec, d, s)?;
                self.commit_dest(v, d)
            }
            F2D | D2F => {
                let (from, to) = if insn.code == F2D {
                    (Precision::Single, Precision::Double)
                } else {
                    (Precision::Double, Precision::Single)
                };
                let s = self.fp_src(&a, from, XMM0, true)?;
                let d = self.begin_fdest(v, self.cur)?;
                self.enc.cvt_precision(to, d, s)?;
                self.commit_dest(v, d)
            }
            _ => Err(self.unencodable(insn)),
        }
    }

    /// Push a float or double source onto the x87 stack, widening it exactly.
    fn fld_fp(&mut self, op: &Operand, prec: Precision) -> CompileResult<()> {
        let fmt = match prec {
            Precision::Single => X87Format::F32,
            Precision::Double => X87Format::F64,
        };
        match *op {
            Operand::Var(v) => {
                if let Some(r) = self.var_reg(v) {
                    let scratch = self.frame.scratch();
                    self.enc.sse_store(prec, &scratch, r)?;
                    self.enc.fld(fmt, &scratch)?;
                } else {
                    self.enc.fld(fmt, &self.frame.slot(v))?;
                }
                Ok(())
            }
            _ => self.ld_push(op),
        }
    }

    pub(super) fn lower_ld_convert(&mut self, insn: &Insn) -> CompileResult<()> {
        use Opcode::*;
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let scratch = self.frame.scratch();
        match insn.code {
            I2LD | UI2LD => {
                let r = self.int_reg(&a, RAX, Width::W64)?;
                self.enc.store(Width::W64, &scratch, GpSrc::Reg(r))?;
                self.enc.fild64(&scratch)?;
                if insn.code == UI2LD {
                    // fild reads the value as signed; add 2^64 back when the top bit was set.
                    let bias = scratch.offset(8);
                    let mut skip = self.enc.create_label();
                    self.enc.store(Width::W32, &bias, GpSrc::Imm(TWO_POW_64_F32 as i32))?;
                    self.enc.test(Width::W64, r, r)?;
                    self.enc.jcc(JumpCondition::NoSign, skip)?;
                    self.enc.fadd_f32(&bias)?;
                    self.enc.bind(&mut skip)?;
                }
                self.commit_ld(v)
            }
            LD2I => {
                self.ld_push(&a)?;
                self.enc.fisttp64(&scratch)?;
                let d = self.begin_dest(v)?;
                self.enc.load(Width::W64, d, &scratch)?;
                self.commit_dest(v, d)
            }
            F2LD | D2LD => {
                let prec = if insn.code == F2LD { Precision::Single } else { Precision::Double };
                self.fld_fp(&a, prec)?;
                self.commit_ld(v)
            }
            LD2F | LD2D => {
                let (prec, fmt) = if insn.code == LD2F {
                    (Precision::Single, X87Format::F32)
                } else {
                    (Precision::Double, X87Format::F64)
                };
                self.ld_push(&a)?;
                self.enc.fstp(fmt, &scratch)?;
                let d = self.begin_fdest(v, self.cur)?;
                self.enc.sse_load(prec, d, &scratch)?;
                self.commit_dest(v, d)
            }
            _ => Err(self.unencodable(insn)),
        }
    }

    pub(super) fn lower_ld_binop(&mut self, insn: &Insn, op: FpOp) -> CompileResult<()> {
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let b = self.op(insn, 2)?;
        self.ld_push(&a)?;
        self.ld_push(&b)?;
        self.enc.farith_pop(sse_op(op))?;
        self.commit_ld(v)
    }

    pub(super) fn lower_ld_neg(&mut self, insn: &Insn) -> CompileResult<()> {
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        self.ld_push(&a)?;
        self.enc.fchs()?;
        self.commit_ld(v)
    }

    /// `t = a * b; r = t + c` as one fused multiply-add.
    pub(super) fn lower_fmadd(&mut self, mul: &Insn, add: &Insn) -> CompileResult<()> {
        let Some((_, class)) = mul.code.fp_binop() else {
            return Err(self.unencodable(mul));
        };
        let prec = precision(class);
        let t = self.dst_var(mul, 0)?;
        let a = self.op(mul, 1)?;
        let b = self.op(mul, 2)?;
        let r = self.dst_var(add, 0)?;
        let c = if self.op(add, 1)? == Operand::Var(t) {
            self.op(add, 2)?
        } else {
            self.op(add, 1)?
        };

        let cs = self.fp_src(&c, prec, XMM0, true)?;
        self.enc.sse_move(prec, XMM0, cs)?;
        let ar = self.fp_reg(&a, prec, XMM1)?;
        let bs = self.fp_src(&b, prec, XMM2, true)?;
        self.enc.vfmadd231(prec, XMM0, ar, bs)?;
        let d = self.begin_fdest(r, self.cur + 1)?;
        self.enc.sse_move(prec, d, XmmSrc::Reg(XMM0))?;
        self.session.record(StatEvent::FusedMultiplyAdd);
        self.commit_dest(r, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_masks() {
        assert_eq!(sign_mask(Precision::Single), 0x8000_0000);
        assert_eq!(f64::from_bits(sign_mask(Precision::Double) as u64 ^ 2.5f64.to_bits()), -2.5);
        assert_eq!(f32::from_bits(TWO_POW_64_F32), 18_446_744_073_709_551_616.0);
    }

    #[test]
    fn test_fp_ops_map_to_sse() {
        assert_eq!(sse_op(FpOp::Div), SseOp::Div);
        assert_eq!(sse_op(FpOp::Add), SseOp::Add);
    }
}
