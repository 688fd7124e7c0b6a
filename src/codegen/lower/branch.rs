// Control flow: jumps, conditional branches, switches and returns. Every edge that
// leaves a block first stores the dirty cached variables back, since the block cache is
// empty at the start of every block. When the target block begins with phis, the copies
// for this edge are emitted only on the taken path: a conditional branch jumps over the
// copies with the inverted condition, so the fall-through path keeps its values. Float
// equality needs two flag tests because an unordered compare sets the parity flag.
// Returns place the results in the System V result locations and emit the epilogue.

//! Branch, switch and return lowering.

use super::{precision, width, FlagTest, FunctionLowering, RCX, RDX};
use crate::core::error::CompileResult;
use crate::core::session::StatEvent;
use crate::ir::{ir_vec, CmpClass, CmpKind, Insn, LabelId, Opcode, Operand};
use crate::x64::calling_convention::{assign_results, RegBank};
use crate::x64::encoder::{AluOp, GpSrc, JumpCondition, Width};
use iced_x86::code_asm::CodeLabel;

impl<'l> FunctionLowering<'l> {
    /// Jump to `label` when `test` holds.
    fn jump_if(&mut self, test: FlagTest, label: CodeLabel) -> CompileResult<()> {
        match test {
            FlagTest::Cond(c) => self.enc.jcc(c, label)?,
            FlagTest::FloatEq => {
                let mut skip = self.enc.create_label();
                self.enc.jcc(JumpCondition::Parity, skip)?;
                self.enc.jcc(JumpCondition::Equal, label)?;
                self.enc.bind(&mut skip)?;
            }
            FlagTest::FloatNe => {
                self.enc.jcc(JumpCondition::Parity, label)?;
                self.enc.jcc(JumpCondition::NotEqual, label)?;
            }
        }
        Ok(())
    }

    /// Conditional edge to `target`, with the phi copies of that edge.
    fn branch_to(&mut self, test: FlagTest, target: LabelId) -> CompileResult<()> {
        let label = self.code_label(target)?;
        let func = self.func;
        if self.analysis.block_phis(func, target.0).next().is_none() {
            return self.jump_if(test, label);
        }
        let mut skip = self.enc.create_label();
        self.jump_if(test.negate(), skip)?;
        self.phi_copies(target)?;
        self.enc.jmp(label)?;
        self.enc.bind(&mut skip)?;
        Ok(())
    }

    pub(super) fn lower_bool_branch(&mut self, insn: &Insn) -> CompileResult<()> {
        let target = self.label_op(insn, 0)?;
        let cond = self.op(insn, 1)?;
        let on_false = matches!(insn.code, Opcode::Bf | Opcode::BfS);
        let w = width(matches!(insn.code, Opcode::BtS | Opcode::BfS));
        self.flush()?;

        if let Some(c) = cond.int_imm() {
            let nonzero = if w == Width::W32 { c as i32 != 0 } else { c != 0 };
            if nonzero != on_false {
                self.phi_copies(target)?;
                let label = self.code_label(target)?;
                self.enc.jmp(label)?;
            }
            return Ok(());
        }

        match self.int_src(&cond, RCX, w, true, false)? {
            GpSrc::Reg(r) => self.enc.test(w, r, r)?,
            GpSrc::Mem(m) => self.enc.alu_mem(AluOp::Cmp, w, &m, GpSrc::Imm(0))?,
            GpSrc::Imm(_) => return Err(self.bad_operand()),
        }
        let c = if on_false { JumpCondition::Equal } else { JumpCondition::NotEqual };
        self.branch_to(FlagTest::Cond(c), target)
    }

    pub(super) fn lower_compare_branch(&mut self, insn: &Insn, kind: CmpKind, class: CmpClass) -> CompileResult<()> {
        let target = self.label_op(insn, 0)?;
        let a = self.op(insn, 1)?;
        let b = self.op(insn, 2)?;
        self.flush()?;
        let test = self.compare_flags(kind, class, &a, &b)?;
        self.branch_to(test, target)
    }

    /// A compare whose only use is the conditional branch right after it.
    pub(super) fn lower_fused_compare(&mut self, cmp: &Insn, br: &Insn) -> CompileResult<()> {
        let Some((kind, class)) = cmp.code.compare() else {
            return Err(self.unencodable(cmp));
        };
        let target = self.label_op(br, 0)?;
        let a = self.op(cmp, 1)?;
        let b = self.op(cmp, 2)?;
        self.flush()?;
        let mut test = self.compare_flags(kind, class, &a, &b)?;
        if matches!(br.code, Opcode::Bf | Opcode::BfS) {
            test = test.negate();
        }
        self.session.record(StatEvent::FusedBranch);
        self.branch_to(test, target)
    }

    /// Branch on the flags left by the preceding overflow-checked instruction.
    pub(super) fn lower_overflow_branch(&mut self, insn: &Insn) -> CompileResult<()> {
        let target = self.label_op(insn, 0)?;
        let c = match insn.code {
            Opcode::Bo => JumpCondition::Overflow,
            Opcode::Bno => JumpCondition::NoOverflow,
            Opcode::UBo => JumpCondition::Below,
            _ => JumpCondition::AboveEqual,
        };
        // Stores only; the flags survive.
        self.flush()?;
        self.branch_to(FlagTest::Cond(c), target)
    }

    pub(super) fn lower_jmp(&mut self, insn: &Insn) -> CompileResult<()> {
        let target = self.label_op(insn, 0)?;
        self.flush()?;
        self.phi_copies(target)?;
        let label = self.code_label(target)?;
        self.enc.jmp(label)?;
        self.cache.clear();
        Ok(())
    }

    /// Compare chain over the case labels; an index past the last case takes the last.
    pub(super) fn lower_switch(&mut self, insn: &Insn) -> CompileResult<()> {
        let index = self.op(insn, 0)?;
        let targets = ir_vec(self.session.alloc(), insn.ops.iter().skip(1).filter_map(Operand::label));
        let Some((&last, cases)) = targets.split_last() else {
            return Err(self.unencodable(insn));
        };
        self.flush()?;
        let r = self.int_reg(&index, RDX, Width::W64)?;
        for (k, &target) in cases.iter().enumerate() {
            self.enc.alu(AluOp::Cmp, Width::W64, r, GpSrc::Imm(k as i32))?;
            self.branch_to(FlagTest::Cond(JumpCondition::Equal), target)?;
        }
        self.phi_copies(last)?;
        let label = self.code_label(last)?;
        self.enc.jmp(label)?;
        self.cache.clear();
        Ok(())
    }

    pub(super) fn lower_ret(&mut self, insn: &Insn) -> CompileResult<()> {
        let func = self.func;
        let alloc = self.session.alloc().clone();
        let locations = assign_results(&alloc, &func.res_types);
        if locations.iter().any(Option::is_none) {
            return Err(self.unencodable(insn));
        }
        let results = ir_vec(
            &alloc,
            insn.ops
                .iter()
                .copied()
                .zip(func.res_types.iter().copied())
                .zip(locations.into_iter().flatten()),
        );

        // x87 results first, deepest stack entry first; then XMM, whose immediates go
        // through RAX; then the integer registers.
        let mut x87 = ir_vec(&alloc, results.iter().filter(|(_, loc)| loc.bank == RegBank::X87));
        x87.sort_by_key(|(_, loc)| std::cmp::Reverse(loc.st_index));
        for ((op, _), _) in x87 {
            self.ld_push(op)?;
        }
        for ((op, ty), loc) in results.iter().filter(|(_, loc)| loc.bank == RegBank::Xmm) {
            let Some(target) = loc.reg else { continue };
            let prec = precision(ty.class());
            let s = self.fp_src(op, prec, target, true)?;
            self.enc.sse_move(prec, target, s)?;
        }
        for ((op, _), loc) in results.iter().filter(|(_, loc)| loc.bank == RegBank::GeneralPurpose) {
            let Some(target) = loc.reg else { continue };
            let s = self.int_src(op, target, Width::W64, true, true)?;
            self.mov_to(Width::W64, target, s)?;
        }

        self.emit_epilogue()?;
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alloc::ContextAlloc;
    use crate::ir::Type;

    #[test]
    fn test_result_banks_follow_types() {
        let locs = assign_results(&ContextAlloc::system(), &[Type::I64, Type::D, Type::LD]);
        let banks: Vec<_> = locs.iter().flatten().map(|l| l.bank).collect();
        assert_eq!(banks, vec![RegBank::GeneralPurpose, RegBank::Xmm, RegBank::X87]);
    }

    #[test]
    fn test_float_tests_negate_into_each_other() {
        assert!(matches!(FlagTest::FloatEq.negate(), FlagTest::FloatNe));
        assert!(matches!(
            FlagTest::Cond(JumpCondition::Below).negate(),
            FlagTest::Cond(JumpCondition::AboveEqual)
        ));
    }
}
