// This module wraps the iced-x86 code assembler as the machine code emission layer of the
// backend. X64Encoder converts AsmReg register references and MemRef address
// descriptions into iced operands and exposes one method per instruction family the
// lowering engine needs: integer moves with sign/zero extension, ALU operations in
// register, immediate and memory forms, multiplication and division, shifts, setcc and
// conditional jumps, SSE scalar arithmetic and conversions, FMA3, and the x87 subset
// used for extended precision. Labels are plain iced CodeLabels; binding two labels to
// the same position inserts a nop because iced attaches at most one label per
// instruction. finalize assembles everything at address zero and reports the offset of
// every requested label, which is all the position independent output needs.

//! x86-64 instruction encoding using iced-x86.

use crate::core::register_file::{AsmReg, GP_BANK, XMM_BANK};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};
use thiserror::Error;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    #[error("invalid register for operation")]
    InvalidRegister,
    /// Unsupported instruction or operand combination.
    #[error("unsupported instruction or operand combination")]
    UnsupportedInstruction,
    /// Assembly error from iced-x86.
    #[error("assembly error: {0}")]
    AssemblyError(String),
    /// Memory operand construction failed.
    #[error("invalid memory operand")]
    InvalidMemoryOperand,
}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Operand width of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    pub fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }
}

/// Memory address `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<AsmReg>,
    pub index: Option<AsmReg>,
    pub scale: u8,
    pub disp: i32,
}

impl MemRef {
    pub fn base(base: AsmReg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
        }
    }

    pub fn indexed(base: AsmReg, index: AsmReg, scale: u8, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
        }
    }

    /// Whether the address computation reads `reg`.
    pub fn uses(&self, reg: AsmReg) -> bool {
        self.base == Some(reg) || self.index == Some(reg)
    }

    /// Same address shifted by `off` bytes.
    pub fn offset(mut self, off: i32) -> Self {
        self.disp += off;
        self
    }
}

/// Integer source operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpSrc {
    Reg(AsmReg),
    Imm(i32),
    Mem(MemRef),
}

impl GpSrc {
    pub fn uses(&self, reg: AsmReg) -> bool {
        match self {
            GpSrc::Reg(r) => *r == reg,
            GpSrc::Mem(m) => m.uses(reg),
            GpSrc::Imm(_) => false,
        }
    }
}

/// SSE source operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmmSrc {
    Reg(AsmReg),
    Mem(MemRef),
}

impl XmmSrc {
    pub fn uses(&self, reg: AsmReg) -> bool {
        match self {
            XmmSrc::Reg(r) => *r == reg,
            XmmSrc::Mem(m) => m.uses(reg),
        }
    }
}

/// Two-operand integer ALU instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

/// Shift instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

/// Shift count: `cl` or an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftAmount {
    Cl,
    Imm(u8),
}

/// Scalar SSE arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Precision of a scalar SSE instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single,
    Double,
}

/// Memory format of an x87 load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum X87Format {
    F32,
    F64,
    F80,
}

/// Condition codes for jcc and setcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
    Overflow,
    NoOverflow,
    Parity,
    NoParity,
    Sign,
    NoSign,
}

impl JumpCondition {
    /// Condition true exactly when `self` is false.
    pub fn negate(self) -> Self {
        use JumpCondition::*;
        match self {
            Equal => NotEqual,
            NotEqual => Equal,
            Less => GreaterEqual,
            LessEqual => Greater,
            Greater => LessEqual,
            GreaterEqual => Less,
            Below => AboveEqual,
            BelowEqual => Above,
            Above => BelowEqual,
            AboveEqual => Below,
            Overflow => NoOverflow,
            NoOverflow => Overflow,
            Parity => NoParity,
            NoParity => Parity,
            Sign => NoSign,
            NoSign => Sign,
        }
    }
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];

const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];

const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];

const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

const XMM_REGS: [AsmRegisterXmm; 16] = [
    xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7, xmm8, xmm9, xmm10, xmm11, xmm12, xmm13,
    xmm14, xmm15,
];

fn gp64(reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
    if reg.bank != GP_BANK {
        return Err(EncodingError::InvalidRegister);
    }
    GP64_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn gp32(reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
    if reg.bank != GP_BANK {
        return Err(EncodingError::InvalidRegister);
    }
    GP32_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn gp16(reg: AsmReg) -> Result<AsmRegister16, EncodingError> {
    if reg.bank != GP_BANK {
        return Err(EncodingError::InvalidRegister);
    }
    GP16_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn gp8(reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
    if reg.bank != GP_BANK {
        return Err(EncodingError::InvalidRegister);
    }
    GP8_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn xmm(reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
    if reg.bank != XMM_BANK {
        return Err(EncodingError::InvalidRegister);
    }
    XMM_REGS.get(reg.id as usize).copied().ok_or(EncodingError::InvalidRegister)
}

fn mem_operand(m: &MemRef) -> Result<AsmMemoryOperand, EncodingError> {
    let scale = match m.scale {
        1 | 2 | 4 | 8 => m.scale as u32,
        _ => return Err(EncodingError::InvalidMemoryOperand),
    };
    Ok(match (m.base, m.index) {
        (Some(b), Some(i)) => gp64(b)? + gp64(i)? * scale + m.disp,
        (Some(b), None) => gp64(b)? + m.disp,
        (None, Some(i)) => gp64(i)? * scale + m.disp,
        (None, None) => return Err(EncodingError::InvalidMemoryOperand),
    })
}

fn sized_mem(w: Width, m: &MemRef) -> Result<AsmMemoryOperand, EncodingError> {
    let op = mem_operand(m)?;
    Ok(match w {
        Width::W8 => byte_ptr(op),
        Width::W16 => word_ptr(op),
        Width::W32 => dword_ptr(op),
        Width::W64 => qword_ptr(op),
    })
}

/// Dispatch a two-operand integer instruction over width and source kind.
macro_rules! gp_binary {
    ($asm:expr, $method:ident, $w:expr, $dst:expr, $src:expr) => {{
        let dst = $dst;
        match ($w, $src) {
            (Width::W64, GpSrc::Reg(s)) => $asm.$method(gp64(dst)?, gp64(s)?),
            (Width::W64, GpSrc::Imm(i)) => $asm.$method(gp64(dst)?, i),
            (Width::W64, GpSrc::Mem(m)) => $asm.$method(gp64(dst)?, qword_ptr(mem_operand(&m)?)),
            (Width::W32, GpSrc::Reg(s)) => $asm.$method(gp32(dst)?, gp32(s)?),
            (Width::W32, GpSrc::Imm(i)) => $asm.$method(gp32(dst)?, i),
            (Width::W32, GpSrc::Mem(m)) => $asm.$method(gp32(dst)?, dword_ptr(mem_operand(&m)?)),
            (Width::W16, GpSrc::Reg(s)) => $asm.$method(gp16(dst)?, gp16(s)?),
            (Width::W16, GpSrc::Imm(i)) => $asm.$method(gp16(dst)?, i),
            (Width::W16, GpSrc::Mem(m)) => $asm.$method(gp16(dst)?, word_ptr(mem_operand(&m)?)),
            (Width::W8, GpSrc::Reg(s)) => $asm.$method(gp8(dst)?, gp8(s)?),
            (Width::W8, GpSrc::Imm(i)) => $asm.$method(gp8(dst)?, i),
            (Width::W8, GpSrc::Mem(m)) => $asm.$method(gp8(dst)?, byte_ptr(mem_operand(&m)?)),
        }
        .map_err(asm_err)
    }};
}

/// Dispatch a memory-destination integer instruction over width and source kind.
macro_rules! gp_store {
    ($asm:expr, $method:ident, $w:expr, $m:expr, $src:expr) => {{
        let mem = sized_mem($w, $m)?;
        match ($w, $src) {
            (Width::W64, GpSrc::Reg(s)) => $asm.$method(mem, gp64(s)?),
            (Width::W32, GpSrc::Reg(s)) => $asm.$method(mem, gp32(s)?),
            (Width::W16, GpSrc::Reg(s)) => $asm.$method(mem, gp16(s)?),
            (Width::W8, GpSrc::Reg(s)) => $asm.$method(mem, gp8(s)?),
            (_, GpSrc::Imm(i)) => $asm.$method(mem, i),
            (_, GpSrc::Mem(_)) => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }};
}

/// Dispatch a single-operand integer instruction (register or memory).
macro_rules! gp_unary {
    ($asm:expr, $method:ident, $w:expr, $src:expr) => {{
        match ($w, $src) {
            (Width::W64, GpSrc::Reg(s)) => $asm.$method(gp64(s)?),
            (Width::W32, GpSrc::Reg(s)) => $asm.$method(gp32(s)?),
            (Width::W16, GpSrc::Reg(s)) => $asm.$method(gp16(s)?),
            (Width::W8, GpSrc::Reg(s)) => $asm.$method(gp8(s)?),
            (w, GpSrc::Mem(m)) => $asm.$method(sized_mem(w, &m)?),
            (_, GpSrc::Imm(_)) => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }};
}

/// Dispatch a scalar SSE instruction over precision and source kind.
macro_rules! sse_binary {
    ($asm:expr, $ss:ident, $sd:ident, $prec:expr, $dst:expr, $src:expr) => {{
        let dst = xmm($dst)?;
        match ($prec, $src) {
            (Precision::Single, XmmSrc::Reg(s)) => $asm.$ss(dst, xmm(s)?),
            (Precision::Single, XmmSrc::Mem(m)) => $asm.$ss(dst, dword_ptr(mem_operand(&m)?)),
            (Precision::Double, XmmSrc::Reg(s)) => $asm.$sd(dst, xmm(s)?),
            (Precision::Double, XmmSrc::Mem(m)) => $asm.$sd(dst, qword_ptr(mem_operand(&m)?)),
        }
        .map_err(asm_err)
    }};
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// A label was bound and no instruction has followed it yet.
    label_pending: bool,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self {
            assembler,
            label_pending: false,
        })
    }

    /// Assembler handle for emitting one instruction.
    fn asm(&mut self) -> &mut CodeAssembler {
        self.label_pending = false;
        &mut self.assembler
    }

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        if self.label_pending {
            self.nop()?;
        }
        self.assembler.set_label(label).map_err(asm_err)?;
        self.label_pending = true;
        Ok(())
    }

    /// Assemble at address zero, returning the code and the offset of each label.
    ///
    /// Every label in `labels` must have been bound.
    pub fn finalize(mut self, labels: &[CodeLabel]) -> Result<(Vec<u8>, Vec<u64>), EncodingError> {
        if self.label_pending {
            self.nop()?;
        }
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;
        let offsets = labels
            .iter()
            .map(|l| result.label_ip(l).map_err(asm_err))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((result.inner.code_buffer, offsets))
    }

    // ---- integer moves ----

    pub fn mov_rr(&mut self, w: Width, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let asm = self.asm();
        match w {
            Width::W64 => asm.mov(gp64(dst)?, gp64(src)?),
            Width::W32 => asm.mov(gp32(dst)?, gp32(src)?),
            Width::W16 => asm.mov(gp16(dst)?, gp16(src)?),
            Width::W8 => asm.mov(gp8(dst)?, gp8(src)?),
        }
        .map_err(asm_err)
    }

    /// Load a 64-bit immediate using the shortest mov form. Flags are untouched.
    pub fn mov_ri(&mut self, dst: AsmReg, imm: i64) -> Result<(), EncodingError> {
        if (0..=u32::MAX as i64).contains(&imm) {
            self.asm().mov(gp32(dst)?, imm as u32 as i32).map_err(asm_err)
        } else {
            self.asm().mov(gp64(dst)?, imm).map_err(asm_err)
        }
    }

    /// Plain load of `w` bytes; 32-bit loads zero the upper half.
    pub fn load(&mut self, w: Width, dst: AsmReg, m: &MemRef) -> Result<(), EncodingError> {
        let mem = sized_mem(w, m)?;
        let asm = self.asm();
        match w {
            Width::W64 => asm.mov(gp64(dst)?, mem),
            Width::W32 => asm.mov(gp32(dst)?, mem),
            Width::W16 => asm.mov(gp16(dst)?, mem),
            Width::W8 => asm.mov(gp8(dst)?, mem),
        }
        .map_err(asm_err)
    }

    pub fn store(&mut self, w: Width, m: &MemRef, src: GpSrc) -> Result<(), EncodingError> {
        gp_store!(self.asm(), mov, w, m, src)
    }

    /// Sign-extending move of a `from`-wide source into a 64-bit register.
    pub fn movsx(&mut self, from: Width, dst: AsmReg, src: GpSrc) -> Result<(), EncodingError> {
        let d = gp64(dst)?;
        let asm = self.asm();
        match (from, src) {
            (Width::W8, GpSrc::Reg(s)) => asm.movsx(d, gp8(s)?),
            (Width::W16, GpSrc::Reg(s)) => asm.movsx(d, gp16(s)?),
            (Width::W32, GpSrc::Reg(s)) => asm.movsxd(d, gp32(s)?),
            (Width::W64, GpSrc::Reg(s)) => asm.mov(d, gp64(s)?),
            (Width::W8, GpSrc::Mem(m)) => asm.movsx(d, byte_ptr(mem_operand(&m)?)),
            (Width::W16, GpSrc::Mem(m)) => asm.movsx(d, word_ptr(mem_operand(&m)?)),
            (Width::W32, GpSrc::Mem(m)) => asm.movsxd(d, dword_ptr(mem_operand(&m)?)),
            (Width::W64, GpSrc::Mem(m)) => asm.mov(d, qword_ptr(mem_operand(&m)?)),
            (_, GpSrc::Imm(_)) => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    /// Zero-extending move of a `from`-wide source into a 64-bit register.
    pub fn movzx(&mut self, from: Width, dst: AsmReg, src: GpSrc) -> Result<(), EncodingError> {
        let d32 = gp32(dst)?;
        let asm = self.asm();
        match (from, src) {
            (Width::W8, GpSrc::Reg(s)) => asm.movzx(d32, gp8(s)?),
            (Width::W16, GpSrc::Reg(s)) => asm.movzx(d32, gp16(s)?),
            (Width::W32, GpSrc::Reg(s)) => asm.mov(d32, gp32(s)?),
            (Width::W64, GpSrc::Reg(s)) => asm.mov(gp64(dst)?, gp64(s)?),
            (Width::W8, GpSrc::Mem(m)) => asm.movzx(d32, byte_ptr(mem_operand(&m)?)),
            (Width::W16, GpSrc::Mem(m)) => asm.movzx(d32, word_ptr(mem_operand(&m)?)),
            (Width::W32, GpSrc::Mem(m)) => asm.mov(d32, dword_ptr(mem_operand(&m)?)),
            (Width::W64, GpSrc::Mem(m)) => asm.mov(gp64(dst)?, qword_ptr(mem_operand(&m)?)),
            (_, GpSrc::Imm(_)) => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    pub fn lea(&mut self, dst: AsmReg, m: &MemRef) -> Result<(), EncodingError> {
        let op = mem_operand(m)?;
        self.asm().lea(gp64(dst)?, ptr(op)).map_err(asm_err)
    }

    /// RIP-relative address of a label.
    pub fn lea_label(&mut self, dst: AsmReg, label: CodeLabel) -> Result<(), EncodingError> {
        self.asm().lea(gp64(dst)?, ptr(label)).map_err(asm_err)
    }

    // ---- integer arithmetic ----

    pub fn alu(&mut self, op: AluOp, w: Width, dst: AsmReg, src: GpSrc) -> Result<(), EncodingError> {
        let asm = self.asm();
        match op {
            AluOp::Add => gp_binary!(asm, add, w, dst, src),
            AluOp::Sub => gp_binary!(asm, sub, w, dst, src),
            AluOp::And => gp_binary!(asm, and, w, dst, src),
            AluOp::Or => gp_binary!(asm, or, w, dst, src),
            AluOp::Xor => gp_binary!(asm, xor, w, dst, src),
            AluOp::Cmp => gp_binary!(asm, cmp, w, dst, src),
        }
    }

    /// ALU operation with a memory destination (or left operand, for cmp).
    pub fn alu_mem(&mut self, op: AluOp, w: Width, m: &MemRef, src: GpSrc) -> Result<(), EncodingError> {
        let asm = self.asm();
        match op {
            AluOp::Add => gp_store!(asm, add, w, m, src),
            AluOp::Sub => gp_store!(asm, sub, w, m, src),
            AluOp::And => gp_store!(asm, and, w, m, src),
            AluOp::Or => gp_store!(asm, or, w, m, src),
            AluOp::Xor => gp_store!(asm, xor, w, m, src),
            AluOp::Cmp => gp_store!(asm, cmp, w, m, src),
        }
    }

    pub fn test(&mut self, w: Width, a: AsmReg, b: AsmReg) -> Result<(), EncodingError> {
        let asm = self.asm();
        match w {
            Width::W64 => asm.test(gp64(a)?, gp64(b)?),
            Width::W32 => asm.test(gp32(a)?, gp32(b)?),
            Width::W16 => asm.test(gp16(a)?, gp16(b)?),
            Width::W8 => asm.test(gp8(a)?, gp8(b)?),
        }
        .map_err(asm_err)
    }

    /// Two-operand signed multiply; an immediate source uses the three-operand form.
    pub fn imul(&mut self, w: Width, dst: AsmReg, src: GpSrc) -> Result<(), EncodingError> {
        let asm = self.asm();
        match (w, src) {
            (Width::W64, GpSrc::Reg(s)) => asm.imul_2(gp64(dst)?, gp64(s)?),
            (Width::W64, GpSrc::Mem(m)) => asm.imul_2(gp64(dst)?, qword_ptr(mem_operand(&m)?)),
            (Width::W64, GpSrc::Imm(i)) => asm.imul_3(gp64(dst)?, gp64(dst)?, i),
            (Width::W32, GpSrc::Reg(s)) => asm.imul_2(gp32(dst)?, gp32(s)?),
            (Width::W32, GpSrc::Mem(m)) => asm.imul_2(gp32(dst)?, dword_ptr(mem_operand(&m)?)),
            (Width::W32, GpSrc::Imm(i)) => asm.imul_3(gp32(dst)?, gp32(dst)?, i),
            _ => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    /// Widening unsigned multiply of rax/eax by `src` into rdx:rax.
    pub fn mul_wide(&mut self, w: Width, src: GpSrc) -> Result<(), EncodingError> {
        gp_unary!(self.asm(), mul, w, src)
    }

    /// Widening signed multiply of rax/eax by `src` into rdx:rax.
    pub fn imul_wide(&mut self, w: Width, src: GpSrc) -> Result<(), EncodingError> {
        gp_unary!(self.asm(), imul, w, src)
    }

    /// Divide rdx:rax (or edx:eax) by `src`.
    pub fn div(&mut self, signed: bool, w: Width, src: GpSrc) -> Result<(), EncodingError> {
        if signed {
            gp_unary!(self.asm(), idiv, w, src)
        } else {
            gp_unary!(self.asm(), div, w, src)
        }
    }

    /// Sign-extend rax into rdx (`cqo`) or eax into edx (`cdq`).
    pub fn sign_extend_acc(&mut self, w: Width) -> Result<(), EncodingError> {
        match w {
            Width::W64 => self.asm().cqo().map_err(asm_err),
            _ => self.asm().cdq().map_err(asm_err),
        }
    }

    pub fn shift(&mut self, op: ShiftOp, w: Width, dst: AsmReg, amount: ShiftAmount) -> Result<(), EncodingError> {
        let asm = self.asm();
        macro_rules! emit {
            ($method:ident) => {
                match (w, amount) {
                    (Width::W64, ShiftAmount::Cl) => asm.$method(gp64(dst)?, cl),
                    (Width::W64, ShiftAmount::Imm(n)) => asm.$method(gp64(dst)?, n as i32),
                    (Width::W32, ShiftAmount::Cl) => asm.$method(gp32(dst)?, cl),
                    (Width::W32, ShiftAmount::Imm(n)) => asm.$method(gp32(dst)?, n as i32),
                    _ => return Err(EncodingError::UnsupportedInstruction),
                }
                .map_err(asm_err)
            };
        }
        match op {
            ShiftOp::Shl => emit!(shl),
            ShiftOp::Shr => emit!(shr),
            ShiftOp::Sar => emit!(sar),
        }
    }

    pub fn neg(&mut self, w: Width, dst: AsmReg) -> Result<(), EncodingError> {
        gp_unary!(self.asm(), neg, w, GpSrc::Reg(dst))
    }

    pub fn not(&mut self, w: Width, dst: AsmReg) -> Result<(), EncodingError> {
        gp_unary!(self.asm(), not, w, GpSrc::Reg(dst))
    }

    /// Set the low byte of `dst` to the condition.
    pub fn setcc(&mut self, cond: JumpCondition, dst: AsmReg) -> Result<(), EncodingError> {
        let d = gp8(dst)?;
        let asm = self.asm();
        use JumpCondition::*;
        match cond {
            Equal => asm.sete(d),
            NotEqual => asm.setne(d),
            Less => asm.setl(d),
            LessEqual => asm.setle(d),
            Greater => asm.setg(d),
            GreaterEqual => asm.setge(d),
            Below => asm.setb(d),
            BelowEqual => asm.setbe(d),
            Above => asm.seta(d),
            AboveEqual => asm.setae(d),
            Overflow => asm.seto(d),
            NoOverflow => asm.setno(d),
            Parity => asm.setp(d),
            NoParity => asm.setnp(d),
            Sign => asm.sets(d),
            NoSign => asm.setns(d),
        }
        .map_err(asm_err)
    }

    // ---- control flow ----

    pub fn jcc(&mut self, cond: JumpCondition, label: CodeLabel) -> Result<(), EncodingError> {
        let asm = self.asm();
        use JumpCondition::*;
        match cond {
            Equal => asm.je(label),
            NotEqual => asm.jne(label),
            Less => asm.jl(label),
            LessEqual => asm.jle(label),
            Greater => asm.jg(label),
            GreaterEqual => asm.jge(label),
            Below => asm.jb(label),
            BelowEqual => asm.jbe(label),
            Above => asm.ja(label),
            AboveEqual => asm.jae(label),
            Overflow => asm.jo(label),
            NoOverflow => asm.jno(label),
            Parity => asm.jp(label),
            NoParity => asm.jnp(label),
            Sign => asm.js(label),
            NoSign => asm.jns(label),
        }
        .map_err(asm_err)
    }

    pub fn jmp(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.asm().jmp(label).map_err(asm_err)
    }

    pub fn call_label(&mut self, label: CodeLabel) -> Result<(), EncodingError> {
        self.asm().call(label).map_err(asm_err)
    }

    pub fn call_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.asm().call(gp64(reg)?).map_err(asm_err)
    }

    pub fn push(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.asm().push(gp64(reg)?).map_err(asm_err)
    }

    pub fn pop(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        self.asm().pop(gp64(reg)?).map_err(asm_err)
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.asm().ret().map_err(asm_err)
    }

    pub fn nop(&mut self) -> Result<(), EncodingError> {
        self.asm().nop().map_err(asm_err)
    }

    // ---- SSE scalar ----

    /// Register to register copy of a full xmm register.
    pub fn sse_mov_rr(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        if dst == src {
            return Ok(());
        }
        self.asm().movaps(xmm(dst)?, xmm(src)?).map_err(asm_err)
    }

    pub fn sse_load(&mut self, prec: Precision, dst: AsmReg, m: &MemRef) -> Result<(), EncodingError> {
        let d = xmm(dst)?;
        let op = mem_operand(m)?;
        match prec {
            Precision::Single => self.asm().movss(d, dword_ptr(op)),
            Precision::Double => self.asm().movsd_2(d, qword_ptr(op)),
        }
        .map_err(asm_err)
    }

    pub fn sse_store(&mut self, prec: Precision, m: &MemRef, src: AsmReg) -> Result<(), EncodingError> {
        let s = xmm(src)?;
        let op = mem_operand(m)?;
        match prec {
            Precision::Single => self.asm().movss(dword_ptr(op), s),
            Precision::Double => self.asm().movsd_2(qword_ptr(op), s),
        }
        .map_err(asm_err)
    }

    /// Load a scalar from a register or memory into `dst`.
    pub fn sse_move(&mut self, prec: Precision, dst: AsmReg, src: XmmSrc) -> Result<(), EncodingError> {
        match src {
            XmmSrc::Reg(r) => self.sse_mov_rr(dst, r),
            XmmSrc::Mem(m) => self.sse_load(prec, dst, &m),
        }
    }

    pub fn sse_arith(&mut self, op: SseOp, prec: Precision, dst: AsmReg, src: XmmSrc) -> Result<(), EncodingError> {
        let asm = self.asm();
        match op {
            SseOp::Add => sse_binary!(asm, addss, addsd, prec, dst, src),
            SseOp::Sub => sse_binary!(asm, subss, subsd, prec, dst, src),
            SseOp::Mul => sse_binary!(asm, mulss, mulsd, prec, dst, src),
            SseOp::Div => sse_binary!(asm, divss, divsd, prec, dst, src),
        }
    }

    /// Unordered compare of `a` with `b`, setting ZF/PF/CF.
    pub fn ucomis(&mut self, prec: Precision, a: AsmReg, b: XmmSrc) -> Result<(), EncodingError> {
        sse_binary!(self.asm(), ucomiss, ucomisd, prec, a, b)
    }

    /// Convert between single and double precision; `to` is the result precision.
    pub fn cvt_precision(&mut self, to: Precision, dst: AsmReg, src: XmmSrc) -> Result<(), EncodingError> {
        match to {
            Precision::Double => sse_binary!(self.asm(), cvtss2sd, cvtss2sd, Precision::Single, dst, src),
            Precision::Single => sse_binary!(self.asm(), cvtsd2ss, cvtsd2ss, Precision::Double, dst, src),
        }
    }

    /// Signed 64-bit integer to float.
    pub fn cvtsi2s(&mut self, prec: Precision, dst: AsmReg, src: GpSrc) -> Result<(), EncodingError> {
        let d = xmm(dst)?;
        let asm = self.asm();
        match (prec, src) {
            (Precision::Single, GpSrc::Reg(s)) => asm.cvtsi2ss(d, gp64(s)?),
            (Precision::Single, GpSrc::Mem(m)) => asm.cvtsi2ss(d, qword_ptr(mem_operand(&m)?)),
            (Precision::Double, GpSrc::Reg(s)) => asm.cvtsi2sd(d, gp64(s)?),
            (Precision::Double, GpSrc::Mem(m)) => asm.cvtsi2sd(d, qword_ptr(mem_operand(&m)?)),
            (_, GpSrc::Imm(_)) => return Err(EncodingError::UnsupportedInstruction),
        }
        .map_err(asm_err)
    }

    /// Truncating float to signed 64-bit integer.
    pub fn cvtts2si(&mut self, prec: Precision, dst: AsmReg, src: XmmSrc) -> Result<(), EncodingError> {
        let d = gp64(dst)?;
        let asm = self.asm();
        match (prec, src) {
            (Precision::Single, XmmSrc::Reg(s)) => asm.cvttss2si(d, xmm(s)?),
            (Precision::Single, XmmSrc::Mem(m)) => asm.cvttss2si(d, dword_ptr(mem_operand(&m)?)),
            (Precision::Double, XmmSrc::Reg(s)) => asm.cvttsd2si(d, xmm(s)?),
            (Precision::Double, XmmSrc::Mem(m)) => asm.cvttsd2si(d, qword_ptr(mem_operand(&m)?)),
        }
        .map_err(asm_err)
    }

    /// Copy raw bits from a general register into an xmm register.
    pub fn movq_to_xmm(&mut self, prec: Precision, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let d = xmm(dst)?;
        match prec {
            Precision::Single => self.asm().movd(d, gp32(src)?),
            Precision::Double => self.asm().movq(d, gp64(src)?),
        }
        .map_err(asm_err)
    }

    pub fn xorps(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        self.asm().xorps(xmm(dst)?, xmm(src)?).map_err(asm_err)
    }

    /// `dst = a * b + dst` with a single rounding.
    pub fn vfmadd231(&mut self, prec: Precision, dst: AsmReg, a: AsmReg, b: XmmSrc) -> Result<(), EncodingError> {
        let d = xmm(dst)?;
        let x = xmm(a)?;
        let asm = self.asm();
        match (prec, b) {
            (Precision::Single, XmmSrc::Reg(r)) => asm.vfmadd231ss(d, x, xmm(r)?),
            (Precision::Single, XmmSrc::Mem(m)) => asm.vfmadd231ss(d, x, dword_ptr(mem_operand(&m)?)),
            (Precision::Double, XmmSrc::Reg(r)) => asm.vfmadd231sd(d, x, xmm(r)?),
            (Precision::Double, XmmSrc::Mem(m)) => asm.vfmadd231sd(d, x, qword_ptr(mem_operand(&m)?)),
        }
        .map_err(asm_err)
    }

    // ---- x87 ----

    pub fn fld(&mut self, fmt: X87Format, m: &MemRef) -> Result<(), EncodingError> {
        let op = mem_operand(m)?;
        match fmt {
            X87Format::F32 => self.asm().fld(dword_ptr(op)),
            X87Format::F64 => self.asm().fld(qword_ptr(op)),
            X87Format::F80 => self.asm().fld(tword_ptr(op)),
        }
        .map_err(asm_err)
    }

    pub fn fstp(&mut self, fmt: X87Format, m: &MemRef) -> Result<(), EncodingError> {
        let op = mem_operand(m)?;
        match fmt {
            X87Format::F32 => self.asm().fstp(dword_ptr(op)),
            X87Format::F64 => self.asm().fstp(qword_ptr(op)),
            X87Format::F80 => self.asm().fstp(tword_ptr(op)),
        }
        .map_err(asm_err)
    }

    /// Discard st(0).
    pub fn fpop(&mut self) -> Result<(), EncodingError> {
        self.asm().fstp(st0).map_err(asm_err)
    }

    /// Push a signed 64-bit integer from memory.
    pub fn fild64(&mut self, m: &MemRef) -> Result<(), EncodingError> {
        let op = mem_operand(m)?;
        self.asm().fild(qword_ptr(op)).map_err(asm_err)
    }

    /// Pop st(0) into memory as a truncated signed 64-bit integer.
    pub fn fisttp64(&mut self, m: &MemRef) -> Result<(), EncodingError> {
        let op = mem_operand(m)?;
        self.asm().fisttp(qword_ptr(op)).map_err(asm_err)
    }

    /// `st(1) = st(1) op st(0)`, then pop.
    pub fn farith_pop(&mut self, op: SseOp) -> Result<(), EncodingError> {
        let asm = self.asm();
        match op {
            SseOp::Add => asm.faddp(st1, st0),
            SseOp::Sub => asm.fsubp(st1, st0),
            SseOp::Mul => asm.fmulp(st1, st0),
            SseOp::Div => asm.fdivp(st1, st0),
        }
        .map_err(asm_err)
    }

    /// Add a single-precision memory operand to st(0).
    pub fn fadd_f32(&mut self, m: &MemRef) -> Result<(), EncodingError> {
        let op = mem_operand(m)?;
        self.asm().fadd(dword_ptr(op)).map_err(asm_err)
    }

    pub fn fchs(&mut self) -> Result<(), EncodingError> {
        self.asm().fchs().map_err(asm_err)
    }

    /// Compare st(0) with st(1) into ZF/PF/CF and pop once.
    pub fn fucomip(&mut self) -> Result<(), EncodingError> {
        self.asm().fucomip(st0, st1).map_err(asm_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAX: AsmReg = AsmReg::gp(0);
    const RCX: AsmReg = AsmReg::gp(1);
    const RBP: AsmReg = AsmReg::gp(5);
    const R11: AsmReg = AsmReg::gp(11);
    const XMM0: AsmReg = AsmReg::xmm(0);
    const XMM9: AsmReg = AsmReg::xmm(9);

    #[test]
    fn test_basic_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.mov_rr(Width::W64, RAX, RCX).unwrap();
        encoder.alu(AluOp::Add, Width::W64, RAX, GpSrc::Imm(42)).unwrap();
        encoder.mov_ri(RCX, 0x1234_5678_9abc).unwrap();
        encoder.ret().unwrap();
        let (code, _) = encoder.finalize(&[]).unwrap();
        // mov rax, rcx = 48 89 c8
        assert_eq!(&code[..3], &[0x48, 0x89, 0xc8]);
        assert_eq!(*code.last().unwrap(), 0xc3);
    }

    #[test]
    fn test_memory_operands() {
        let mut encoder = X64Encoder::new().unwrap();
        let slot = MemRef::base(RBP, -16);
        encoder.store(Width::W64, &slot, GpSrc::Reg(RAX)).unwrap();
        encoder.load(Width::W32, RCX, &slot).unwrap();
        encoder.movsx(Width::W8, RAX, GpSrc::Mem(MemRef::indexed(R11, RCX, 4, 8))).unwrap();
        encoder.lea(RAX, &MemRef::indexed(RAX, RAX, 2, 0)).unwrap();
        encoder.sse_load(Precision::Double, XMM9, &slot).unwrap();
        encoder.fld(X87Format::F80, &slot).unwrap();
        encoder.fpop().unwrap();
        let bad = MemRef::indexed(RAX, RCX, 3, 0);
        assert_eq!(encoder.lea(RAX, &bad), Err(EncodingError::InvalidMemoryOperand));
        assert!(encoder.finalize(&[]).is_ok());
    }

    #[test]
    fn test_moves_and_tests_at_every_width() {
        let mut encoder = X64Encoder::new().unwrap();
        let slot = MemRef::base(RBP, -16);
        for w in [Width::W64, Width::W32, Width::W16, Width::W8] {
            encoder.mov_rr(w, RAX, RCX).unwrap();
            encoder.load(w, RCX, &slot).unwrap();
            encoder.test(w, RAX, RCX).unwrap();
        }
        let (code, _) = encoder.finalize(&[]).unwrap();
        #[rustfmt::skip]
        let want: &[u8] = &[
            0x48, 0x89, 0xc8, 0x48, 0x8b, 0x4d, 0xf0, 0x48, 0x85, 0xc8,
            0x89, 0xc8, 0x8b, 0x4d, 0xf0, 0x85, 0xc8,
            0x66, 0x89, 0xc8, 0x66, 0x8b, 0x4d, 0xf0, 0x66, 0x85, 0xc8,
            0x88, 0xc8, 0x8a, 0x4d, 0xf0, 0x84, 0xc8,
        ];
        assert_eq!(code, want);
    }

    #[test]
    fn test_wrong_bank_is_rejected() {
        let mut encoder = X64Encoder::new().unwrap();
        assert_eq!(encoder.mov_rr(Width::W64, XMM0, RAX), Err(EncodingError::InvalidRegister));
        assert_eq!(
            encoder.sse_arith(SseOp::Add, Precision::Double, RAX, XmmSrc::Reg(XMM0)),
            Err(EncodingError::InvalidRegister)
        );
    }

    #[test]
    fn test_labels_and_offsets() {
        let mut encoder = X64Encoder::new().unwrap();
        let mut entry = encoder.create_label();
        let mut other = encoder.create_label();
        encoder.bind(&mut entry).unwrap();
        // Two labels at one position must still assemble.
        encoder.bind(&mut other).unwrap();
        encoder.mov_ri(RAX, 1).unwrap();
        encoder.jcc(JumpCondition::NotEqual, other).unwrap();
        encoder.ret().unwrap();
        let (code, offsets) = encoder.finalize(&[entry, other]).unwrap();
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[1], 1); // after the separating nop
        assert_eq!(code[0], 0x90);
    }

    #[test]
    fn test_condition_negation() {
        for cond in [
            JumpCondition::Equal,
            JumpCondition::Less,
            JumpCondition::BelowEqual,
            JumpCondition::Overflow,
            JumpCondition::Parity,
        ] {
            assert_eq!(cond.negate().negate(), cond);
            assert_ne!(cond.negate(), cond);
        }
    }
}
