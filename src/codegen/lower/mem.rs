// Stack allocation and variadic argument access. Alloca moves RSP down by the requested
// size rounded to 16 bytes, so outgoing call areas keep their alignment; BSTART/BEND
// save and restore RSP around a block-scoped allocation. VA_START fills a System V
// va_list (gp_offset, fp_offset, overflow_arg_area, reg_save_area) from the frame's
// register save area and the count of named arguments. VA_ARG yields the address of the
// next argument of the given type: integers and floats come from the save area while it
// lasts, and everything else (long double, aggregates, and register overflow) from the
// overflow area. Every one of these writes memory the float field cache may hold, so it
// is dropped afterwards.

//! Alloca and variadic argument lowering.

use super::{FunctionLowering, RAX, RDX, R11};
use crate::codegen::frame::{RBP, RSP, VARARG_SAVE_SIZE};
use crate::core::error::CompileResult;
use crate::ir::{Insn, Operand, Type, ValueClass};
use crate::x64::encoder::{AluOp, GpSrc, JumpCondition, MemRef, Width};

/// Bytes of the save area holding the six integer argument registers.
const GP_SAVE_SIZE: i32 = 48;

/// Where VA_ARG looks for an argument of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VaClass {
    /// va_list field tracking the save area offset, if register-passed at all.
    field: Option<i32>,
    limit: i32,
    reg_step: i32,
    /// Bytes taken from the overflow area.
    stack_step: i32,
    stack_align16: bool,
}

fn va_class(ty: Type) -> VaClass {
    match ty {
        Type::LD => VaClass {
            field: None,
            limit: 0,
            reg_step: 0,
            stack_step: 16,
            stack_align16: true,
        },
        Type::Blk(n) | Type::RBlk(n) => VaClass {
            field: None,
            limit: 0,
            reg_step: 0,
            stack_step: (n.div_ceil(8) * 8) as i32,
            stack_align16: false,
        },
        _ if ty.class() == ValueClass::Int => VaClass {
            field: Some(0),
            limit: GP_SAVE_SIZE,
            reg_step: 8,
            stack_step: 8,
            stack_align16: false,
        },
        _ => VaClass {
            field: Some(4),
            limit: VARARG_SAVE_SIZE,
            reg_step: 16,
            stack_step: 8,
            stack_align16: false,
        },
    }
}

impl<'l> FunctionLowering<'l> {
    fn drop_field_cache(&mut self) {
        self.cache.invalidate_fields(|_| true);
    }

    pub(super) fn lower_alloca(&mut self, insn: &Insn) -> CompileResult<()> {
        let v = self.dst_var(insn, 0)?;
        let size = self.op(insn, 1)?;
        match size.int_imm() {
            Some(c) => {
                let n = (c.max(0) + 15) & !15;
                match i32::try_from(n) {
                    Ok(i) => self.enc.alu(AluOp::Sub, Width::W64, RSP, GpSrc::Imm(i))?,
                    Err(_) => {
                        self.enc.mov_ri(RAX, n)?;
                        self.enc.alu(AluOp::Sub, Width::W64, RSP, GpSrc::Reg(RAX))?;
                    }
                }
            }
            None => {
                let s = self.int_src(&size, RAX, Width::W64, true, false)?;
                self.mov_to(Width::W64, RAX, s)?;
                self.enc.alu(AluOp::Add, Width::W64, RAX, GpSrc::Imm(15))?;
                self.enc.alu(AluOp::And, Width::W64, RAX, GpSrc::Imm(-16))?;
                self.enc.alu(AluOp::Sub, Width::W64, RSP, GpSrc::Reg(RAX))?;
            }
        }
        let d = self.begin_dest(v)?;
        self.enc.mov_rr(Width::W64, d, RSP)?;
        self.commit_dest(v, d)?;
        self.drop_field_cache();
        Ok(())
    }

    pub(super) fn lower_bstart(&mut self, insn: &Insn) -> CompileResult<()> {
        let v = self.dst_var(insn, 0)?;
        let d = self.begin_dest(v)?;
        self.enc.mov_rr(Width::W64, d, RSP)?;
        self.commit_dest(v, d)
    }

    pub(super) fn lower_bend(&mut self, insn: &Insn) -> CompileResult<()> {
        let saved = self.op(insn, 0)?;
        let r = self.int_reg(&saved, RAX, Width::W64)?;
        self.enc.mov_rr(Width::W64, RSP, r)?;
        self.drop_field_cache();
        Ok(())
    }

    pub(super) fn lower_va_start(&mut self, insn: &Insn) -> CompileResult<()> {
        let area = match (self.func.vararg, self.frame.vararg_area) {
            (true, Some(area)) => area,
            _ => return Err(self.malformed("va_start in a function without variadic arguments")),
        };
        let list = self.op(insn, 0)?;
        let p = self.int_reg(&list, RDX, Width::W64)?;
        let gp_offset = (8 * self.frame.named_gp as i32).min(GP_SAVE_SIZE);
        let fp_offset = (GP_SAVE_SIZE + 16 * self.frame.named_xmm as i32).min(VARARG_SAVE_SIZE);

        self.enc.store(Width::W32, &MemRef::base(p, 0), GpSrc::Imm(gp_offset))?;
        self.enc.store(Width::W32, &MemRef::base(p, 4), GpSrc::Imm(fp_offset))?;
        self.enc.lea(RAX, &self.frame.overflow_area())?;
        self.enc.store(Width::W64, &MemRef::base(p, 8), GpSrc::Reg(RAX))?;
        self.enc.lea(RAX, &MemRef::base(RBP, area))?;
        self.enc.store(Width::W64, &MemRef::base(p, 16), GpSrc::Reg(RAX))?;
        self.drop_field_cache();
        Ok(())
    }

    pub(super) fn lower_va_arg(&mut self, insn: &Insn) -> CompileResult<()> {
        let v = self.dst_var(insn, 0)?;
        let list = self.op(insn, 1)?;
        let ty = match self.op(insn, 2)? {
            Operand::Mem(m) => m.ty,
            _ => return Err(self.unencodable(insn)),
        };
        let class = va_class(ty);
        let p = self.int_reg(&list, R11, Width::W64)?;
        let mut over = self.enc.create_label();
        let mut done = self.enc.create_label();

        if let Some(field) = class.field {
            let offset = MemRef::base(p, field);
            self.enc.load(Width::W32, RAX, &offset)?;
            self.enc.alu(AluOp::Cmp, Width::W32, RAX, GpSrc::Imm(class.limit))?;
            self.enc.jcc(JumpCondition::AboveEqual, over)?;
            self.enc.load(Width::W64, RDX, &MemRef::base(p, 16))?;
            self.enc.alu(AluOp::Add, Width::W64, RDX, GpSrc::Reg(RAX))?;
            self.enc.alu(AluOp::Add, Width::W32, RAX, GpSrc::Imm(class.reg_step))?;
            self.enc.store(Width::W32, &offset, GpSrc::Reg(RAX))?;
            self.enc.jmp(done)?;
        }

        self.enc.bind(&mut over)?;
        self.enc.load(Width::W64, RDX, &MemRef::base(p, 8))?;
        if class.stack_align16 {
            self.enc.alu(AluOp::Add, Width::W64, RDX, GpSrc::Imm(15))?;
            self.enc.alu(AluOp::And, Width::W64, RDX, GpSrc::Imm(-16))?;
        }
        self.enc.lea(RAX, &MemRef::base(RDX, class.stack_step))?;
        self.enc.store(Width::W64, &MemRef::base(p, 8), GpSrc::Reg(RAX))?;
        self.enc.bind(&mut done)?;

        let d = self.begin_dest(v)?;
        self.enc.mov_rr(Width::W64, d, RDX)?;
        self.commit_dest(v, d)?;
        self.drop_field_cache();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_va_classes() {
        assert_eq!(va_class(Type::I32).field, Some(0));
        assert_eq!(va_class(Type::P).limit, 48);
        let d = va_class(Type::D);
        assert_eq!((d.field, d.limit, d.reg_step), (Some(4), 176, 16));
        assert!(va_class(Type::LD).stack_align16);
        assert_eq!(va_class(Type::Blk(12)).stack_step, 16);
        assert_eq!(va_class(Type::Blk(12)).field, None);
    }
}
