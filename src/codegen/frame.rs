// This module computes the stack frame of one function before any of its code is
// emitted. Every variable receives a canonical home: a function-wide register when the
// promotion passes picked it, and always a stack slot below the saved registers (16
// bytes for long double, 8 otherwise). Stack-passed arguments keep their incoming
// location above the return address as their slot. Variadic functions reserve the
// 176-byte register save area, and every function gets a scratch slot for x87 and
// conversion round trips plus one slot per parallel phi copy. The layout tables are
// drawn from the context allocator and released when the function is finished.

//! Per-function stack frame layout.

use crate::core::alloc::ContextAlloc;
use crate::core::register_file::{AsmReg, GP_BANK};
use crate::ir::{ir_vec, Func, IrVec, Type, VarId};
use crate::x64::calling_convention::{assign_args, CCAssignment, SysVAssigner};
use crate::x64::encoder::MemRef;

pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSP: AsmReg = AsmReg::gp(4);

/// Bytes of the variadic register save area (6 GP + 8 XMM registers).
pub const VARARG_SAVE_SIZE: i32 = 176;

/// Offset of the first incoming stack argument relative to RBP.
const INCOMING_ARGS: i32 = 16;

fn align_down(value: i32, align: i32) -> i32 {
    value & !(align - 1)
}

/// Stack layout of one function.
#[derive(Debug)]
pub struct FunctionFrame {
    /// Callee-saved registers pushed right after RBP, in push order.
    pub saved_registers: IrVec<AsmReg>,
    /// RBP-relative slot of every variable.
    slots: IrVec<i32>,
    /// Function-wide home register of every variable, if promoted.
    homes: IrVec<Option<AsmReg>>,
    /// Incoming argument placement.
    pub arg_assignments: IrVec<CCAssignment>,
    /// Bytes subtracted from RSP after the pushes.
    pub frame_size: u32,
    /// Start of the variadic register save area.
    pub vararg_area: Option<i32>,
    /// 16-byte scratch slot.
    pub scratch: i32,
    phi_scratch: i32,
    phi_slots: u32,
    /// GP/XMM registers and stack bytes consumed by the named arguments.
    pub named_gp: u32,
    pub named_xmm: u32,
    pub named_stack: u32,
}

impl FunctionFrame {
    /// Lay out `func` given the promotion decisions in `homes` (one entry per variable).
    pub fn build(alloc: &ContextAlloc, func: &Func, homes: &[Option<AsmReg>], phi_slots: usize) -> Self {
        let saved_registers = ir_vec(
            alloc,
            SysVAssigner::CALLEE_SAVED
                .into_iter()
                .filter(|reg| homes.iter().any(|h| *h == Some(*reg))),
        );

        let mut assigner = SysVAssigner::new();
        let arg_assignments = assign_args(alloc, &mut assigner, func.arg_types());
        let named_gp = assigner.gp_used() as u32;
        let named_xmm = assigner.xmm_used() as u32;
        let named_stack = arg_assignments
            .iter()
            .filter_map(|a| a.stack_off.map(|off| off as u32 + a.size.div_ceil(8) * 8))
            .max()
            .unwrap_or(0);

        let saved_bytes = 8 * saved_registers.len() as i32;
        let mut cursor = -saved_bytes;
        let mut slots = IrVec::with_capacity_in(func.vars.len(), alloc.clone());
        for (i, var) in func.vars.iter().enumerate() {
            let incoming = if var.ty.is_block() {
                None
            } else {
                arg_assignments.get(i).and_then(|a| a.stack_off)
            };
            let slot = match incoming {
                Some(off) => INCOMING_ARGS + off,
                None => {
                    let size = if var.ty == Type::LD { 16 } else { 8 };
                    cursor = align_down(cursor - size, size);
                    cursor
                }
            };
            slots.push(slot);
        }

        let vararg_area = func.vararg.then(|| {
            cursor = align_down(cursor - VARARG_SAVE_SIZE, 16);
            cursor
        });
        cursor = align_down(cursor - 16, 16);
        let scratch = cursor;
        cursor = align_down(cursor - 16 * phi_slots as i32, 16);
        let phi_scratch = cursor;

        // Keep RSP 16-byte aligned after `push rbp; push saved...; sub rsp, frame_size`.
        let total = (-cursor + 15) & !15;
        let frame_size = (total - saved_bytes) as u32;
        let frame_size = if (saved_bytes as u32 + frame_size) % 16 == 0 {
            frame_size
        } else {
            frame_size + 8
        };

        let home_vec = ir_vec(
            alloc,
            (0..func.vars.len()).map(|i| homes.get(i).copied().flatten()),
        );

        log::debug!(
            "frame: {} vars, {} saved regs, {} bytes",
            func.vars.len(),
            saved_registers.len(),
            frame_size
        );

        Self {
            saved_registers,
            slots,
            homes: home_vec,
            arg_assignments,
            frame_size,
            vararg_area,
            scratch,
            phi_scratch,
            phi_slots: phi_slots as u32,
            named_gp,
            named_xmm,
            named_stack,
        }
    }

    /// Canonical stack slot of `var`.
    pub fn slot(&self, var: VarId) -> MemRef {
        MemRef::base(RBP, self.slots.get(var.index()).copied().unwrap_or(self.scratch))
    }

    /// Home register of `var`, if it was promoted.
    pub fn home(&self, var: VarId) -> Option<AsmReg> {
        self.homes.get(var.index()).copied().flatten()
    }

    /// Variables living in general-purpose home registers.
    pub fn has_gp_homes(&self) -> bool {
        self.homes.iter().flatten().any(|r| r.bank == GP_BANK)
    }

    /// Promoted float variables with their home registers.
    pub fn xmm_homes(&self) -> impl Iterator<Item = (VarId, AsmReg)> + '_ {
        self.homes
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.filter(|r| r.bank != GP_BANK).map(|r| (VarId(i as u32), r)))
    }

    pub fn scratch(&self) -> MemRef {
        MemRef::base(RBP, self.scratch)
    }

    /// Scratch slot `i` used by parallel phi copies.
    pub fn phi_slot(&self, i: usize) -> Option<MemRef> {
        (i < self.phi_slots as usize).then(|| MemRef::base(RBP, self.phi_scratch + 16 * i as i32))
    }

    /// RBP offset of the saved-register area bottom, where RSP is reset before popping.
    pub fn saved_area(&self) -> MemRef {
        MemRef::base(RBP, -8 * self.saved_registers.len() as i32)
    }

    /// Address of the first variadic argument passed on the stack.
    pub fn overflow_area(&self) -> MemRef {
        MemRef::base(RBP, INCOMING_ARGS + self.named_stack as i32)
    }

    /// Incoming stack location of a by-value aggregate argument.
    pub fn incoming(&self, stack_off: i32) -> MemRef {
        MemRef::base(RBP, INCOMING_ARGS + stack_off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alloc::ContextAlloc;

    fn func(args: &[(&str, Type)], locals: &[Type], vararg: bool) -> Func {
        let alloc = ContextAlloc::system();
        let mut f = Func::new(&alloc, vec![Type::I64], args, vararg);
        for (i, ty) in locals.iter().enumerate() {
            f.new_var(&format!("l{i}"), *ty);
        }
        f
    }

    #[test]
    fn test_slots_are_distinct_and_aligned() {
        let alloc = ContextAlloc::system();
        let f = func(&[("a", Type::I64)], &[Type::LD, Type::D, Type::I64], false);
        let frame = FunctionFrame::build(&alloc, &f, &[], 2);
        let offs: Vec<i32> = (0..4).map(|i| frame.slot(VarId(i)).disp).collect();
        for (i, a) in offs.iter().enumerate() {
            assert!(*a < 0);
            for b in &offs[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(offs[1] % 16, 0);
        assert_eq!(frame.frame_size % 16, 0);
        assert!(frame.phi_slot(1).is_some());
        assert!(frame.phi_slot(2).is_none());
    }

    #[test]
    fn test_stack_arguments_stay_in_place() {
        let alloc = ContextAlloc::system();
        let args: Vec<(String, Type)> = (0..8).map(|i| (format!("a{i}"), Type::I64)).collect();
        let args: Vec<(&str, Type)> = args.iter().map(|(n, t)| (n.as_str(), *t)).collect();
        let f = func(&args, &[], false);
        let frame = FunctionFrame::build(&alloc, &f, &[], 0);
        assert_eq!(frame.slot(VarId(6)).disp, 16);
        assert_eq!(frame.slot(VarId(7)).disp, 24);
        assert!(frame.slot(VarId(5)).disp < 0);
        assert_eq!(frame.named_gp, 6);
        assert_eq!(frame.named_stack, 16);
    }

    #[test]
    fn test_block_argument_gets_local_slot() {
        let alloc = ContextAlloc::system();
        let f = func(&[("s", Type::Blk(24)), ("n", Type::I64)], &[], false);
        let frame = FunctionFrame::build(&alloc, &f, &[], 0);
        // The copy stays in the caller's area; the variable holds its address.
        assert_eq!(frame.arg_assignments[0].stack_off, Some(0));
        assert!(frame.slot(VarId(0)).disp < 0);
        assert_eq!(frame.incoming(0).disp, 16);
        assert_eq!(frame.named_stack, 24);
    }

    #[test]
    fn test_saved_registers_keep_alignment() {
        let alloc = ContextAlloc::system();
        let f = func(&[("x", Type::I64)], &[Type::I64], true);
        let homes = [Some(AsmReg::gp(3)), Some(AsmReg::gp(12))];
        let frame = FunctionFrame::build(&alloc, &f, &homes, 0);
        assert_eq!(frame.saved_registers.len(), 2);
        assert_eq!((16 + frame.frame_size) % 16, 0);
        assert!(frame.vararg_area.is_some());
        assert!(frame.has_gp_homes());
        assert_eq!(frame.home(VarId(1)), Some(AsmReg::gp(12)));
        // Slots live below the pushed registers.
        assert!(frame.slot(VarId(0)).disp <= -24);
    }

    #[test]
    fn test_odd_saved_count_pads_frame() {
        let alloc = ContextAlloc::system();
        let f = func(&[], &[Type::I64], false);
        let frame = FunctionFrame::build(&alloc, &f, &[Some(AsmReg::gp(3))], 0);
        assert_eq!((8 + frame.frame_size) % 16, 0);
    }
}
