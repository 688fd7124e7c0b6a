// This module implements the System V AMD64 calling convention used for every call the
// JIT emits and for the incoming arguments of every compiled function. SysVAssigner
// walks an argument list in order and places each value: integer and pointer classes in
// RDI, RSI, RDX, RCX, R8, R9, float and double in XMM0-XMM7, everything else (extended
// precision, by-value aggregates, and register overflow) in 8-byte-granular stack slots
// with 16-byte alignment for long double. The hidden aggregate-return pointer is the
// StructRet attribute and always takes RDI. Results use RAX/RDX, XMM0/XMM1, and the x87
// stack for long double. The callee-saved set (RBX, R12-R15) is where function-wide
// home registers come from. CCAssignment::for_type maps IR types onto banks and
// attributes so callers never hand-compute sizes.

//! System V AMD64 argument and result placement.

use crate::core::alloc::ContextAlloc;
use crate::core::register_file::AsmReg;
use crate::ir::{ir_vec, IrVec, Type, ValueClass};

/// Where a value of some class travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
    /// Passed in memory, returned on the x87 stack.
    X87 = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAttribute {
    None,
    /// Aggregate copied into the outgoing argument area.
    ByVal { size: u32, align: u32 },
    /// Hidden pointer to the caller's result buffer.
    StructRet,
}

/// Location of one argument or result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    pub bank: RegBank,
    pub size: u32,
    pub align: u32,
    pub reg: Option<AsmReg>,
    /// Byte offset in the outgoing argument area.
    pub stack_off: Option<i32>,
    /// x87 stack position of a long double result.
    pub st_index: Option<u8>,
    pub attribute: ArgAttribute,
}

impl CCAssignment {
    fn unplaced(bank: RegBank, size: u32, align: u32, attribute: ArgAttribute) -> Self {
        Self {
            bank,
            size,
            align,
            reg: None,
            stack_off: None,
            st_index: None,
            attribute,
        }
    }

    /// Unassigned slot for a value of IR type `ty`.
    pub fn for_type(ty: Type) -> Self {
        use ArgAttribute::{ByVal, StructRet};
        match ty {
            Type::Blk(size) => {
                let size = size as u32;
                Self::unplaced(RegBank::GeneralPurpose, size, 8, ByVal { size, align: 8 })
            }
            Type::RBlk(_) => Self::unplaced(RegBank::GeneralPurpose, 8, 8, StructRet),
            _ => match ty.class() {
                ValueClass::Int => Self::unplaced(RegBank::GeneralPurpose, 8, 8, ArgAttribute::None),
                ValueClass::Float => Self::unplaced(RegBank::Xmm, 4, 4, ArgAttribute::None),
                ValueClass::Double => Self::unplaced(RegBank::Xmm, 8, 8, ArgAttribute::None),
                ValueClass::LDouble => Self::unplaced(RegBank::X87, 16, 16, ArgAttribute::None),
            },
        }
    }

    pub fn in_memory(&self) -> bool {
        self.reg.is_none() && self.stack_off.is_some()
    }
}

/// Sequential placement of an argument list and its results.
pub trait CCAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    fn assign_ret(&mut self, ret: &mut CCAssignment);

    fn reset(&mut self);

    /// Outgoing argument area in bytes, rounded to the call alignment.
    fn stack_size(&self) -> u32;
}

/// Placement state for one System V call.
///
/// Integer class values take RDI, RSI, RDX, RCX, R8, R9 and float/double take
/// XMM0-XMM7; long doubles, aggregates and overflow go to 8-byte granular stack
/// slots. Results come back in RAX/RDX, XMM0/XMM1 or ST0/ST1.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    next_gp: usize,
    next_xmm: usize,
    stack: u32,
    ret_gp: usize,
    ret_xmm: usize,
    ret_st: u8,
}

impl SysVAssigner {
    pub const GP_ARG_REGS: [AsmReg; 6] = [
        AsmReg::gp(7), // rdi
        AsmReg::gp(6), // rsi
        AsmReg::gp(2), // rdx
        AsmReg::gp(1), // rcx
        AsmReg::gp(8),
        AsmReg::gp(9),
    ];

    pub const XMM_ARG_REGS: [AsmReg; 8] = [
        AsmReg::xmm(0),
        AsmReg::xmm(1),
        AsmReg::xmm(2),
        AsmReg::xmm(3),
        AsmReg::xmm(4),
        AsmReg::xmm(5),
        AsmReg::xmm(6),
        AsmReg::xmm(7),
    ];

    pub const RET_GP_REGS: [AsmReg; 2] = [AsmReg::gp(0), AsmReg::gp(2)];

    pub const RET_XMM_REGS: [AsmReg; 2] = [AsmReg::xmm(0), AsmReg::xmm(1)];

    /// RBX, R12-R15: the pool for function-wide integer homes.
    pub const CALLEE_SAVED: [AsmReg; 5] = [
        AsmReg::gp(3),
        AsmReg::gp(12),
        AsmReg::gp(13),
        AsmReg::gp(14),
        AsmReg::gp(15),
    ];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn gp_used(&self) -> usize {
        self.next_gp
    }

    /// XMM argument registers taken so far; AL for a variadic call.
    pub fn xmm_used(&self) -> usize {
        self.next_xmm
    }

    fn push_stack(&mut self, arg: &mut CCAssignment) {
        self.stack = self.stack.next_multiple_of(arg.align.max(8));
        arg.stack_off = Some(self.stack as i32);
        self.stack += arg.size.next_multiple_of(8);
    }

    fn take_gp(&mut self, arg: &mut CCAssignment) {
        match Self::GP_ARG_REGS.get(self.next_gp) {
            Some(&reg) => {
                arg.reg = Some(reg);
                self.next_gp += 1;
            }
            None => self.push_stack(arg),
        }
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        match (arg.attribute, arg.bank) {
            (ArgAttribute::ByVal { .. }, _) | (_, RegBank::X87) => self.push_stack(arg),
            (ArgAttribute::StructRet, _) => {
                if self.next_gp != 0 {
                    log::warn!("aggregate return pointer is not the first argument");
                }
                self.take_gp(arg);
            }
            (_, RegBank::GeneralPurpose) => self.take_gp(arg),
            (_, RegBank::Xmm) => match Self::XMM_ARG_REGS.get(self.next_xmm) {
                Some(&reg) => {
                    arg.reg = Some(reg);
                    self.next_xmm += 1;
                }
                None => self.push_stack(arg),
            },
        }
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        match ret.bank {
            RegBank::GeneralPurpose => {
                ret.reg = Self::RET_GP_REGS.get(self.ret_gp).copied();
                self.ret_gp += 1;
            }
            RegBank::Xmm => {
                ret.reg = Self::RET_XMM_REGS.get(self.ret_xmm).copied();
                self.ret_xmm += 1;
            }
            RegBank::X87 => {
                ret.st_index = (self.ret_st < 2).then_some(self.ret_st);
                self.ret_st = self.ret_st.saturating_add(1);
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn stack_size(&self) -> u32 {
        self.stack.next_multiple_of(16)
    }
}

/// Assign every type of `types` in order, starting from a fresh state.
pub fn assign_args(
    alloc: &ContextAlloc,
    assigner: &mut SysVAssigner,
    types: impl IntoIterator<Item = Type>,
) -> IrVec<CCAssignment> {
    assigner.reset();
    ir_vec(
        alloc,
        types.into_iter().map(|ty| {
            let mut a = CCAssignment::for_type(ty);
            assigner.assign_arg(&mut a);
            a
        }),
    )
}

/// Assign result locations for `types`. Results that do not fit are reported as `None`.
pub fn assign_results(alloc: &ContextAlloc, types: &[Type]) -> IrVec<Option<CCAssignment>> {
    let mut assigner = SysVAssigner::new();
    ir_vec(
        alloc,
        types.iter().map(|&ty| {
            let mut a = CCAssignment::for_type(ty);
            assigner.assign_ret(&mut a);
            (a.reg.is_some() || a.st_index.is_some()).then_some(a)
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_args_fill_registers_then_stack() {
        let mut assigner = SysVAssigner::new();
        let list = assign_args(&ContextAlloc::system(), &mut assigner, [Type::I64; 6].into_iter().chain([Type::P]));
        for (a, reg) in list.iter().zip(SysVAssigner::GP_ARG_REGS) {
            assert_eq!(a.reg, Some(reg));
        }
        assert!(list[6].in_memory());
        assert_eq!(list[6].stack_off, Some(0));
        assert_eq!(assigner.stack_size(), 16);
    }

    #[test]
    fn test_ninth_fp_arg_spills() {
        let mut assigner = SysVAssigner::new();
        let types = (0..9).map(|i| if i % 2 == 0 { Type::D } else { Type::F });
        let list = assign_args(&ContextAlloc::system(), &mut assigner, types);
        assert_eq!(list[7].reg, Some(AsmReg::xmm(7)));
        assert_eq!(assigner.xmm_used(), 8);
        assert!(list[8].in_memory());
    }

    #[test]
    fn test_long_double_and_aggregates_use_memory() {
        let mut assigner = SysVAssigner::new();
        let list = assign_args(&ContextAlloc::system(), &mut assigner, [Type::I64, Type::Blk(12), Type::LD, Type::D]);
        assert_eq!(list[0].reg, Some(SysVAssigner::GP_ARG_REGS[0]));
        assert_eq!(list[1].stack_off, Some(0));
        assert!(matches!(list[1].attribute, ArgAttribute::ByVal { size: 12, .. }));
        // 12 bytes round to 16; the long double is 16-aligned after that.
        assert_eq!(list[2].stack_off, Some(16));
        assert_eq!(list[3].reg, Some(AsmReg::xmm(0)));
        assert_eq!(assigner.stack_size(), 32);
    }

    #[test]
    fn test_struct_return_takes_rdi() {
        let mut assigner = SysVAssigner::new();
        let list = assign_args(&ContextAlloc::system(), &mut assigner, [Type::RBlk(24), Type::I64]);
        assert_eq!(list[0].reg, Some(AsmReg::gp(7)));
        assert_eq!(list[1].reg, Some(AsmReg::gp(6)));
        assert_eq!(assigner.gp_used(), 2);
    }

    #[test]
    fn test_result_locations() {
        let results = assign_results(&ContextAlloc::system(), &[Type::I64, Type::D, Type::P, Type::LD, Type::I64]);
        assert_eq!(results[0].unwrap().reg, Some(SysVAssigner::RET_GP_REGS[0]));
        assert_eq!(results[1].unwrap().reg, Some(SysVAssigner::RET_XMM_REGS[0]));
        assert_eq!(results[2].unwrap().reg, Some(SysVAssigner::RET_GP_REGS[1]));
        assert_eq!(results[3].unwrap().st_index, Some(0));
        assert!(results[4].is_none());
    }

    #[test]
    fn test_callee_saved_never_carry_arguments() {
        for reg in SysVAssigner::CALLEE_SAVED {
            assert!(!SysVAssigner::GP_ARG_REGS.contains(&reg));
            assert!(!SysVAssigner::RET_GP_REGS.contains(&reg));
        }
    }
}
