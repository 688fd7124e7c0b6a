// This module emits the ABI boundary code of a compiled function: the prologue that
// builds the frame and moves every incoming argument to its canonical home, and the
// epilogue emitted at each return. FunctionCodegen pairs the module-wide X64Encoder with
// one FunctionFrame. The prologue pushes RBP and the callee-saved registers used as
// variable homes, reserves the frame, spills the six GP and eight XMM argument registers
// into the register save area of a variadic function, then homes the named arguments:
// register arguments go to their home register or stack slot, stack arguments already
// sit in their slot and are only loaded when promoted, and a by-value aggregate argument
// receives the address of its incoming copy. The epilogue resets RSP from RBP so any
// dynamic allocation is discarded, restores the saved registers and returns.

//! Function prologue, argument homing and epilogue.

use crate::codegen::frame::{FunctionFrame, RBP, RSP};
use crate::core::register_file::{AsmReg, GP_BANK};
use crate::ir::{Func, Type, VarId};
use crate::x64::calling_convention::{ArgAttribute, SysVAssigner};
use crate::x64::encoder::{AluOp, EncodingError, GpSrc, Precision, Width, X64Encoder};

const RAX: AsmReg = AsmReg::gp(0);

/// Emits frame setup and teardown for one function.
pub struct FunctionCodegen<'e, 'f> {
    encoder: &'e mut X64Encoder,
    frame: &'f FunctionFrame,
}

impl<'e, 'f> FunctionCodegen<'e, 'f> {
    pub fn new(encoder: &'e mut X64Encoder, frame: &'f FunctionFrame) -> Self {
        Self { encoder, frame }
    }

    /// Emit the prologue of `func` and move its arguments to their homes.
    pub fn emit_prologue(&mut self, func: &Func) -> Result<(), EncodingError> {
        self.encoder.push(RBP)?;
        self.encoder.mov_rr(Width::W64, RBP, RSP)?;
        for &reg in self.frame.saved_registers.iter() {
            self.encoder.push(reg)?;
        }
        if self.frame.frame_size > 0 {
            self.encoder
                .alu(AluOp::Sub, Width::W64, RSP, GpSrc::Imm(self.frame.frame_size as i32))?;
        }

        if let Some(area) = self.frame.vararg_area {
            let base = crate::x64::encoder::MemRef::base(RBP, area);
            for (i, reg) in SysVAssigner::GP_ARG_REGS.iter().enumerate() {
                self.encoder.store(Width::W64, &base.offset(8 * i as i32), GpSrc::Reg(*reg))?;
            }
            for (i, reg) in SysVAssigner::XMM_ARG_REGS.iter().enumerate() {
                self.encoder
                    .sse_store(Precision::Double, &base.offset(48 + 16 * i as i32), *reg)?;
            }
        }

        for (i, assignment) in self.frame.arg_assignments.iter().enumerate() {
            let var = VarId(i as u32);
            let ty = func.var_type(var);
            let home = self.frame.home(var);
            let slot = self.frame.slot(var);
            match (assignment.reg, assignment.stack_off) {
                (Some(reg), _) if reg.bank == GP_BANK => match home {
                    Some(h) => self.encoder.mov_rr(Width::W64, h, reg)?,
                    None => self.encoder.store(Width::W64, &slot, GpSrc::Reg(reg))?,
                },
                (Some(reg), _) => {
                    let prec = precision(ty);
                    match home {
                        Some(h) => self.encoder.sse_mov_rr(h, reg)?,
                        None => self.encoder.sse_store(prec, &slot, reg)?,
                    }
                }
                (None, Some(off)) if matches!(assignment.attribute, ArgAttribute::ByVal { .. }) => {
                    self.encoder.lea(RAX, &self.frame.incoming(off))?;
                    match home {
                        Some(h) => self.encoder.mov_rr(Width::W64, h, RAX)?,
                        None => self.encoder.store(Width::W64, &slot, GpSrc::Reg(RAX))?,
                    }
                }
                (None, Some(_)) => match home {
                    Some(h) if h.bank == GP_BANK => self.encoder.load(Width::W64, h, &slot)?,
                    Some(h) => self.encoder.sse_load(precision(ty), h, &slot)?,
                    None => {}
                },
                (None, None) => {
                    log::warn!("argument {i} has no location");
                }
            }
        }
        log::trace!(
            "prologue: {} saved, frame {} bytes, vararg area {:?}",
            self.frame.saved_registers.len(),
            self.frame.frame_size,
            self.frame.vararg_area
        );
        Ok(())
    }

    /// Tear down the frame and return.
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        if self.frame.saved_registers.is_empty() {
            self.encoder.mov_rr(Width::W64, RSP, RBP)?;
        } else {
            self.encoder.lea(RSP, &self.frame.saved_area())?;
            for &reg in self.frame.saved_registers.iter().rev() {
                self.encoder.pop(reg)?;
            }
        }
        self.encoder.pop(RBP)?;
        self.encoder.ret()
    }
}

fn precision(ty: Type) -> Precision {
    if ty == Type::F {
        Precision::Single
    } else {
        Precision::Double
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alloc::ContextAlloc;

    fn emit(func: &Func, homes: &[Option<AsmReg>]) -> Vec<u8> {
        let alloc = ContextAlloc::system();
        let frame = FunctionFrame::build(&alloc, func, homes, 0);
        let mut enc = X64Encoder::new().unwrap();
        let mut cg = FunctionCodegen::new(&mut enc, &frame);
        cg.emit_prologue(func).unwrap();
        cg.emit_epilogue().unwrap();
        enc.finalize(&[]).unwrap().0
    }

    #[test]
    fn test_minimal_frame() {
        let alloc = ContextAlloc::system();
        let func = Func::new(&alloc, vec![], &[], false);
        let code = emit(&func, &[]);
        // push rbp; mov rbp, rsp
        assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(code.last(), Some(&0xc3));
    }

    #[test]
    fn test_saved_registers_are_restored() {
        let alloc = ContextAlloc::system();
        let func = Func::new(&alloc, vec![Type::I64], &[("x", Type::I64), ("y", Type::D)], false);
        let code = emit(&func, &[Some(AsmReg::gp(3)), Some(AsmReg::xmm(8))]);
        // push rbx follows the frame pointer setup; pop rbx; pop rbp; ret closes it.
        assert_eq!(code[4], 0x53);
        assert_eq!(&code[code.len() - 3..], &[0x5b, 0x5d, 0xc3]);
    }

    #[test]
    fn test_variadic_and_aggregate_arguments() {
        let alloc = ContextAlloc::system();
        let func = Func::new(
            &alloc,
            vec![],
            &[("s", Type::Blk(24)), ("n", Type::I32), ("x", Type::LD)],
            true,
        );
        let plain = Func::new(&alloc, vec![], &[("n", Type::I32)], false);
        assert!(emit(&func, &[]).len() > emit(&plain, &[]).len() + 6 * 4 + 8 * 5);
    }
}
