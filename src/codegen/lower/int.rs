// Integer instruction selection: moves, two-operand arithmetic in its register, memory
// and immediate forms, shifts, division, compares and overflow arithmetic. Results are
// computed straight into the destination register when the sources allow it; when the
// right operand lives in the destination the operation either commutes or goes through
// RAX. Constant right operands are strength-reduced: multiplies become moves, shifts or
// lea, divisions by powers of two become shift sequences that round toward zero, and
// other constant divisors use the magic number sequences. Signed division by a
// variable tests for -1 first so that MIN / -1 wraps instead of trapping.

//! Integer instruction selection.

use super::{
    mem_width, width, FlagTest, FunctionLowering, RAX, RCX, RDX, R11, XMM0, XMM1,
};
use crate::codegen::magic::{signed_magic, unsigned_magic};
use crate::core::error::CompileResult;
use crate::core::session::StatEvent;
use crate::ir::{CmpClass, CmpKind, Insn, IntOp, Operand, OverflowOp, VarId};
use crate::x64::encoder::{AluOp, GpSrc, JumpCondition, MemRef, Precision, ShiftAmount, ShiftOp, Width};
use crate::core::register_file::AsmReg;

fn alu_op(op: IntOp) -> Option<AluOp> {
    Some(match op {
        IntOp::Add => AluOp::Add,
        IntOp::Sub => AluOp::Sub,
        IntOp::And => AluOp::And,
        IntOp::Or => AluOp::Or,
        IntOp::Xor => AluOp::Xor,
        _ => return None,
    })
}

fn int_condition(kind: CmpKind, unsigned: bool) -> JumpCondition {
    use JumpCondition::*;
    match (kind, unsigned) {
        (CmpKind::Eq, _) => Equal,
        (CmpKind::Ne, _) => NotEqual,
        (CmpKind::Lt, false) => Less,
        (CmpKind::Le, false) => LessEqual,
        (CmpKind::Gt, false) => Greater,
        (CmpKind::Ge, false) => GreaterEqual,
        (CmpKind::Lt, true) => Below,
        (CmpKind::Le, true) => BelowEqual,
        (CmpKind::Gt, true) => Above,
        (CmpKind::Ge, true) => AboveEqual,
    }
}

/// Multiplier shapes cheaper than `imul`.
enum MulPlan {
    Zero,
    Copy,
    Neg,
    Shift(u8),
    /// `lea d, [x + x * scale]`.
    Lea(u8),
}

impl<'l> FunctionLowering<'l> {
    pub(super) fn lower_int_move(&mut self, insn: &Insn) -> CompileResult<()> {
        let src = self.op(insn, 1)?;
        match self.op(insn, 0)? {
            Operand::Var(v) => {
                let s = self.int_src(&src, RAX, Width::W64, true, true)?;
                let d = self.begin_dest(v)?;
                self.mov_to(Width::W64, d, s)?;
                self.commit_dest(v, d)
            }
            Operand::Mem(m) => {
                let w = mem_width(m.ty).ok_or_else(|| self.unencodable(insn))?;
                let s = self.int_src(&src, RAX, w, false, true)?;
                let addr = self.mem_addr(&m)?;
                self.enc.store(w, &addr, s)?;
                self.invalidate_stored(&m);
                Ok(())
            }
            _ => Err(self.unencodable(insn)),
        }
    }

    fn emit_int_op(&mut self, op: IntOp, w: Width, d: AsmReg, src: GpSrc) -> CompileResult<()> {
        match alu_op(op) {
            Some(alu) => self.enc.alu(alu, w, d, src)?,
            None if op == IntOp::Mul => self.enc.imul(w, d, src)?,
            None => return Err(self.bad_operand()),
        }
        Ok(())
    }

    pub(super) fn lower_int_binop(&mut self, insn: &Insn, op: IntOp, s: bool) -> CompileResult<()> {
        let w = width(s);
        let v = self.dst_var(insn, 0)?;
        let mut a = self.op(insn, 1)?;
        let mut b = self.op(insn, 2)?;
        if op.is_commutative() && self.opts.commute && a.int_imm().is_some() && b.int_imm().is_none() {
            std::mem::swap(&mut a, &mut b);
            self.session.record(StatEvent::CommutedOperands);
        }
        if op.is_shift() {
            return self.lower_shift(v, op, s, &a, &b);
        }
        if let Some(c) = b.int_imm() {
            if self.lower_const_binop(v, op, s, &a, c)? {
                return Ok(());
            }
        }
        if op.is_division() {
            return self.lower_division(v, op, s, &a, &b);
        }

        let bs = self.int_src(&b, RCX, w, true, true)?;
        let as_ = self.int_src(&a, RAX, w, true, true)?;
        let d = self.begin_dest(v)?;
        if bs.uses(d) {
            if op.is_commutative() && self.opts.commute && bs == GpSrc::Reg(d) {
                self.emit_int_op(op, w, d, as_)?;
                self.session.record(StatEvent::CommutedOperands);
            } else {
                self.mov_to(w, RAX, as_)?;
                self.emit_int_op(op, w, RAX, bs)?;
                self.mov_to(w, d, GpSrc::Reg(RAX))?;
            }
        } else {
            self.mov_to(w, d, as_)?;
            self.emit_int_op(op, w, d, bs)?;
        }
        self.commit_dest(v, d)
    }

    fn lower_shift(&mut self, v: VarId, op: IntOp, s: bool, a: &Operand, b: &Operand) -> CompileResult<()> {
        let w = width(s);
        let sop = match op {
            IntOp::Lsh => ShiftOp::Shl,
            IntOp::Rsh => ShiftOp::Sar,
            _ => ShiftOp::Shr,
        };
        let amount = match b.int_imm() {
            Some(c) => ShiftAmount::Imm((c & (w.bits() as i64 - 1)) as u8),
            None => {
                let bs = self.int_src(b, RCX, w, true, false)?;
                self.mov_to(Width::W32, RCX, bs)?;
                ShiftAmount::Cl
            }
        };
        let as_ = self.int_src(a, RAX, w, true, true)?;
        let d = self.begin_dest(v)?;
        self.mov_to(w, d, as_)?;
        self.enc.shift(sop, w, d, amount)?;
        self.commit_dest(v, d)
    }

    /// Strength-reduced forms of `a op c`. Returns false when none applies.
    fn lower_const_binop(&mut self, v: VarId, op: IntOp, s: bool, a: &Operand, c: i64) -> CompileResult<bool> {
        if op.is_division() {
            if self.opts.strength_reduce && self.lower_pow2_division(v, op, s, a, c)? {
                self.session.record(StatEvent::StrengthReduced);
                return Ok(true);
            }
            if self.opts.magic_div && self.lower_magic_division(v, op, s, a, c)? {
                self.session.record(StatEvent::MagicDivision);
                return Ok(true);
            }
            return Ok(false);
        }
        if op == IntOp::Mul && self.opts.strength_reduce && self.lower_const_mul(v, s, a, c)? {
            self.session.record(StatEvent::StrengthReduced);
            return Ok(true);
        }
        Ok(false)
    }

    fn lower_const_mul(&mut self, v: VarId, s: bool, a: &Operand, c: i64) -> CompileResult<bool> {
        let w = width(s);
        let c = if s { c as i32 as i64 } else { c };
        let plan = match c {
            0 => MulPlan::Zero,
            1 => MulPlan::Copy,
            -1 => MulPlan::Neg,
            3 => MulPlan::Lea(2),
            5 => MulPlan::Lea(4),
            9 => MulPlan::Lea(8),
            c if c > 0 && (c as u64).is_power_of_two() => MulPlan::Shift(c.trailing_zeros() as u8),
            _ => return Ok(false),
        };
        match plan {
            MulPlan::Zero => {
                let d = self.begin_dest(v)?;
                self.enc.mov_ri(d, 0)?;
                self.commit_dest(v, d)?;
            }
            MulPlan::Lea(scale) => {
                let r = self.int_reg(a, RAX, Width::W64)?;
                let d = self.begin_dest(v)?;
                self.enc.lea(d, &MemRef::indexed(r, r, scale, 0))?;
                if s {
                    self.enc.mov_rr(Width::W32, d, d)?;
                }
                self.commit_dest(v, d)?;
            }
            plan => {
                let as_ = self.int_src(a, RAX, w, true, true)?;
                let d = self.begin_dest(v)?;
                self.mov_to(w, d, as_)?;
                match plan {
                    MulPlan::Neg => self.enc.neg(w, d)?,
                    MulPlan::Shift(k) => self.enc.shift(ShiftOp::Shl, w, d, ShiftAmount::Imm(k))?,
                    _ => {}
                }
                self.commit_dest(v, d)?;
            }
        }
        Ok(true)
    }

    fn lower_pow2_division(&mut self, v: VarId, op: IntOp, s: bool, a: &Operand, c: i64) -> CompileResult<bool> {
        let w = width(s);
        let bits = w.bits() as u8;
        match op {
            IntOp::UDiv | IntOp::UMod => {
                let cu = if s { c as u32 as u64 } else { c as u64 };
                if !cu.is_power_of_two() {
                    return Ok(false);
                }
                let k = cu.trailing_zeros() as u8;
                let as_ = self.int_src(a, RAX, w, true, true)?;
                let d = self.begin_dest(v)?;
                self.mov_to(w, d, as_)?;
                if op == IntOp::UDiv {
                    if k > 0 {
                        self.enc.shift(ShiftOp::Shr, w, d, ShiftAmount::Imm(k))?;
                    }
                } else {
                    let mask = cu - 1;
                    let imm = if s { Some(mask as u32 as i32) } else { i32::try_from(mask).ok() };
                    match imm {
                        Some(i) => self.enc.alu(AluOp::And, w, d, GpSrc::Imm(i))?,
                        None => {
                            self.enc.mov_ri(RCX, mask as i64)?;
                            self.enc.alu(AluOp::And, w, d, GpSrc::Reg(RCX))?;
                        }
                    }
                }
                self.commit_dest(v, d)?;
            }
            _ => {
                let cs = if s { c as i32 as i64 } else { c };
                let abs = cs.unsigned_abs();
                if !abs.is_power_of_two() {
                    return Ok(false);
                }
                let k = abs.trailing_zeros() as u8;
                let as_ = self.int_src(a, RAX, w, true, true)?;
                let d = self.begin_dest(v)?;
                if k == 0 {
                    if op == IntOp::Mod {
                        self.enc.mov_ri(d, 0)?;
                    } else {
                        self.mov_to(w, d, as_)?;
                        if cs < 0 {
                            self.enc.neg(w, d)?;
                        }
                    }
                    self.commit_dest(v, d)?;
                    return Ok(true);
                }
                self.mov_to(w, d, as_)?;
                // Bias negative dividends by 2^k - 1 so the shift rounds toward zero.
                self.enc.mov_rr(w, RCX, d)?;
                self.enc.shift(ShiftOp::Sar, w, RCX, ShiftAmount::Imm(bits - 1))?;
                self.enc.shift(ShiftOp::Shr, w, RCX, ShiftAmount::Imm(bits - k))?;
                if op == IntOp::Div {
                    self.enc.alu(AluOp::Add, w, d, GpSrc::Reg(RCX))?;
                    self.enc.shift(ShiftOp::Sar, w, d, ShiftAmount::Imm(k))?;
                    if cs < 0 {
                        self.enc.neg(w, d)?;
                    }
                } else {
                    self.enc.alu(AluOp::Add, w, RCX, GpSrc::Reg(d))?;
                    let mask = -1i64 << k;
                    match i32::try_from(mask) {
                        Ok(i) => self.enc.alu(AluOp::And, w, RCX, GpSrc::Imm(i))?,
                        Err(_) => {
                            self.enc.mov_ri(R11, mask)?;
                            self.enc.alu(AluOp::And, w, RCX, GpSrc::Reg(R11))?;
                        }
                    }
                    self.enc.alu(AluOp::Sub, w, d, GpSrc::Reg(RCX))?;
                }
                self.commit_dest(v, d)?;
            }
        }
        Ok(true)
    }

    /// Dividend widened to 64 bits in R11.
    fn load_wide(&mut self, a: &Operand, s: bool, signed: bool) -> CompileResult<()> {
        let src = self.int_src(a, R11, Width::W64, true, false)?;
        match (s, signed) {
            (true, true) => self.enc.movsx(Width::W32, R11, src)?,
            (true, false) => self.enc.movzx(Width::W32, R11, src)?,
            (false, _) => self.mov_to(Width::W64, R11, src)?,
        }
        Ok(())
    }

    fn lower_magic_division(&mut self, v: VarId, op: IntOp, s: bool, a: &Operand, c: i64) -> CompileResult<bool> {
        let is_mod = matches!(op, IntOp::Mod | IntOp::UMod);
        let divisor = if matches!(op, IntOp::Div | IntOp::Mod) {
            let cs = if s { c as i32 as i64 } else { c };
            let Some(m) = signed_magic(cs) else {
                return Ok(false);
            };
            self.load_wide(a, s, true)?;
            self.enc.mov_ri(RAX, m.magic)?;
            self.enc.imul_wide(Width::W64, GpSrc::Reg(R11))?;
            if m.add {
                let fix = if m.negative { AluOp::Sub } else { AluOp::Add };
                self.enc.alu(fix, Width::W64, RDX, GpSrc::Reg(R11))?;
            }
            if m.shift > 0 {
                self.enc.shift(ShiftOp::Sar, Width::W64, RDX, ShiftAmount::Imm(m.shift))?;
            }
            self.enc.mov_rr(Width::W64, RAX, RDX)?;
            self.enc.shift(ShiftOp::Shr, Width::W64, RAX, ShiftAmount::Imm(63))?;
            self.enc.alu(AluOp::Add, Width::W64, RAX, GpSrc::Reg(RDX))?;
            cs
        } else {
            let cu = if s { c as u32 as u64 } else { c as u64 };
            let Some(m) = unsigned_magic(cu) else {
                return Ok(false);
            };
            self.load_wide(a, s, false)?;
            self.enc.mov_rr(Width::W64, RAX, R11)?;
            self.enc.mov_ri(RCX, m.magic as i64)?;
            self.enc.mul_wide(Width::W64, GpSrc::Reg(RCX))?;
            if m.add {
                self.enc.mov_rr(Width::W64, RAX, R11)?;
                self.enc.alu(AluOp::Sub, Width::W64, RAX, GpSrc::Reg(RDX))?;
                self.enc.shift(ShiftOp::Shr, Width::W64, RAX, ShiftAmount::Imm(1))?;
                self.enc.alu(AluOp::Add, Width::W64, RAX, GpSrc::Reg(RDX))?;
            } else {
                self.enc.mov_rr(Width::W64, RAX, RDX)?;
            }
            if m.shift > 0 {
                self.enc.shift(ShiftOp::Shr, Width::W64, RAX, ShiftAmount::Imm(m.shift))?;
            }
            cu as i64
        };
        if is_mod {
            match i32::try_from(divisor) {
                Ok(i) => self.enc.imul(Width::W64, RAX, GpSrc::Imm(i))?,
                Err(_) => {
                    self.enc.mov_ri(RCX, divisor)?;
                    self.enc.imul(Width::W64, RAX, GpSrc::Reg(RCX))?;
                }
            }
            self.enc.alu(AluOp::Sub, Width::W64, R11, GpSrc::Reg(RAX))?;
            self.enc.mov_rr(Width::W64, RAX, R11)?;
        }
        if s {
            self.enc.mov_rr(Width::W32, RAX, RAX)?;
        }
        let d = self.begin_dest(v)?;
        self.mov_to(Width::W64, d, GpSrc::Reg(RAX))?;
        self.commit_dest(v, d)?;
        Ok(true)
    }

    fn lower_division(&mut self, v: VarId, op: IntOp, s: bool, a: &Operand, b: &Operand) -> CompileResult<()> {
        let w = width(s);
        let is_mod = matches!(op, IntOp::Mod | IntOp::UMod);
        let bs = self.int_src(b, RCX, w, true, false)?;
        let as_ = self.int_src(a, RAX, w, true, true)?;
        self.mov_to(w, RAX, as_)?;
        if matches!(op, IntOp::Div | IntOp::Mod) {
            let mut normal = self.enc.create_label();
            let mut done = self.enc.create_label();
            match bs {
                GpSrc::Reg(r) => self.enc.alu(AluOp::Cmp, w, r, GpSrc::Imm(-1))?,
                GpSrc::Mem(m) => self.enc.alu_mem(AluOp::Cmp, w, &m, GpSrc::Imm(-1))?,
                GpSrc::Imm(_) => return Err(self.bad_operand()),
            }
            self.enc.jcc(JumpCondition::NotEqual, normal)?;
            if is_mod {
                self.enc.mov_ri(RDX, 0)?;
            } else {
                self.enc.neg(w, RAX)?;
            }
            self.enc.jmp(done)?;
            self.enc.bind(&mut normal)?;
            self.enc.sign_extend_acc(w)?;
            self.enc.div(true, w, bs)?;
            self.enc.bind(&mut done)?;
        } else {
            self.enc.mov_ri(RDX, 0)?;
            self.enc.div(false, w, bs)?;
        }
        let d = self.begin_dest(v)?;
        self.mov_to(w, d, GpSrc::Reg(if is_mod { RDX } else { RAX }))?;
        self.commit_dest(v, d)
    }

    pub(super) fn lower_neg(&mut self, insn: &Insn) -> CompileResult<()> {
        let w = width(insn.code == crate::ir::Opcode::NegS);
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let s = self.int_src(&a, RAX, w, true, true)?;
        let d = self.begin_dest(v)?;
        self.mov_to(w, d, s)?;
        self.enc.neg(w, d)?;
        self.commit_dest(v, d)
    }

    pub(super) fn lower_ext(&mut self, insn: &Insn) -> CompileResult<()> {
        use crate::ir::Opcode::*;
        let (from, signed) = match insn.code {
            Ext8 => (Width::W8, true),
            Ext16 => (Width::W16, true),
            Ext32 => (Width::W32, true),
            UExt8 => (Width::W8, false),
            UExt16 => (Width::W16, false),
            _ => (Width::W32, false),
        };
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let s = self.int_src(&a, RAX, Width::W64, true, false)?;
        let d = self.begin_dest(v)?;
        if signed {
            self.enc.movsx(from, d, s)?;
        } else {
            self.enc.movzx(from, d, s)?;
        }
        self.commit_dest(v, d)
    }

    /// Set the flags for `a kind b`.
    pub(super) fn compare_flags(&mut self, kind: CmpKind, class: CmpClass, a: &Operand, b: &Operand) -> CompileResult<FlagTest> {
        if class.is_fp() {
            // `a < b` is tested as `b > a` so that unordered operands compare false.
            let (x, y) = if matches!(kind, CmpKind::Lt | CmpKind::Le) { (b, a) } else { (a, b) };
            if class == CmpClass::LD {
                self.ld_push(y)?;
                self.ld_push(x)?;
                self.enc.fucomip()?;
                self.enc.fpop()?;
            } else {
                let prec = if class == CmpClass::F { Precision::Single } else { Precision::Double };
                let ys = self.fp_src(y, prec, XMM1, true)?;
                let xr = self.fp_reg(x, prec, XMM0)?;
                self.enc.ucomis(prec, xr, ys)?;
            }
            return Ok(match kind {
                CmpKind::Eq => FlagTest::FloatEq,
                CmpKind::Ne => FlagTest::FloatNe,
                CmpKind::Lt | CmpKind::Gt => FlagTest::Cond(JumpCondition::Above),
                CmpKind::Le | CmpKind::Ge => FlagTest::Cond(JumpCondition::AboveEqual),
            });
        }
        let w = width(class.is_32());
        let bs = self.int_src(b, RCX, w, true, true)?;
        let ar = self.int_reg(a, RDX, w)?;
        self.enc.alu(AluOp::Cmp, w, ar, bs)?;
        Ok(FlagTest::Cond(int_condition(kind, class.is_unsigned())))
    }

    /// Materialize a flag test as 0/1 in `d`.
    fn set_flag(&mut self, test: FlagTest, d: AsmReg) -> CompileResult<()> {
        match test {
            FlagTest::Cond(c) => self.enc.setcc(c, d)?,
            FlagTest::FloatEq => {
                self.enc.setcc(JumpCondition::Equal, d)?;
                self.enc.setcc(JumpCondition::NoParity, RCX)?;
                self.enc.alu(AluOp::And, Width::W8, d, GpSrc::Reg(RCX))?;
            }
            FlagTest::FloatNe => {
                self.enc.setcc(JumpCondition::NotEqual, d)?;
                self.enc.setcc(JumpCondition::Parity, RCX)?;
                self.enc.alu(AluOp::Or, Width::W8, d, GpSrc::Reg(RCX))?;
            }
        }
        self.enc.movzx(Width::W8, d, GpSrc::Reg(d))?;
        Ok(())
    }

    pub(super) fn lower_compare(&mut self, insn: &Insn, kind: CmpKind, class: CmpClass) -> CompileResult<()> {
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let b = self.op(insn, 2)?;
        let test = self.compare_flags(kind, class, &a, &b)?;
        let d = self.begin_dest(v)?;
        self.set_flag(test, d)?;
        self.commit_dest(v, d)
    }

    /// Overflow-checked arithmetic. The flags of the operation survive to the next
    /// instruction, so only flag-preserving moves follow it.
    pub(super) fn lower_overflow(&mut self, insn: &Insn, op: OverflowOp, s: bool) -> CompileResult<()> {
        let w = width(s);
        let v = self.dst_var(insn, 0)?;
        let a = self.op(insn, 1)?;
        let b = self.op(insn, 2)?;
        let bs = self.int_src(&b, RCX, w, true, op != OverflowOp::UMul)?;
        let as_ = self.int_src(&a, RAX, w, true, true)?;
        self.mov_to(w, RAX, as_)?;
        match op {
            OverflowOp::Add => self.enc.alu(AluOp::Add, w, RAX, bs)?,
            OverflowOp::Sub => self.enc.alu(AluOp::Sub, w, RAX, bs)?,
            OverflowOp::Mul => self.enc.imul(w, RAX, bs)?,
            OverflowOp::UMul => self.enc.mul_wide(w, bs)?,
        }
        let d = self.begin_dest(v)?;
        self.mov_to(w, d, GpSrc::Reg(RAX))?;
        self.commit_dest(v, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditions_follow_signedness() {
        assert_eq!(int_condition(CmpKind::Lt, false), JumpCondition::Less);
        assert_eq!(int_condition(CmpKind::Lt, true), JumpCondition::Below);
        assert_eq!(int_condition(CmpKind::Ge, true), JumpCondition::AboveEqual);
        assert_eq!(int_condition(CmpKind::Ne, true), JumpCondition::NotEqual);
    }

    #[test]
    fn test_only_plain_alu_ops_map() {
        assert_eq!(alu_op(IntOp::Xor), Some(AluOp::Xor));
        assert_eq!(alu_op(IntOp::Mul), None);
        assert_eq!(alu_op(IntOp::Div), None);
    }
}
