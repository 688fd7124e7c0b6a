// The lowering engine turns one IR function into x86-64 code in a single forward pass.
// FunctionLowering owns the per-function state: the code labels of the function's IR
// labels, the block register cache, the label of the block being emitted (phi copies
// pick their source by it) and the chain register owner. Operands are resolved here
// into encoder operands: a variable is found in its home register, the chain register
// or the block cache, and otherwise either cached, used straight from its stack slot or
// loaded into a scratch register, depending on the active toggles. Memory operands are
// turned into MemRefs, possibly through cached addresses. Destinations are picked and
// committed here as well, which is where deferred store-back happens. The opcode
// families are lowered by the submodules. RAX, RCX, RDX and R11 plus XMM0-XMM2 are pure
// scratch registers that never hold a variable across instructions, and a memory
// operand handed out for direct use never depends on R11, so an instruction may always
// compute one more address into R11.

//! Per-function instruction selection.

mod branch;
mod call;
mod float;
mod int;
mod mem;

use crate::codegen::analysis::FunctionAnalysis;
use crate::codegen::frame::FunctionFrame;
use crate::codegen::regcache::{BlockCache, CacheKey};
use crate::core::alloc::ContextAlloc;
use crate::core::error::{CompileError, CompileResult};
use crate::core::options::ActiveOpts;
use crate::core::register_file::{AsmReg, Evicted, RegBank, GP_BANK, XMM_BANK};
use crate::core::session::{CompilationSession, StatEvent};
use crate::ir::{ir_vec, Func, Insn, IrVec, ItemId, LabelId, MemOp, Module, Opcode, Operand, Type, ValueClass, VarId};
use crate::x64::encoder::{
    AluOp, GpSrc, JumpCondition, MemRef, Precision, ShiftAmount, ShiftOp, Width, X64Encoder, X87Format,
    XmmSrc,
};
use crate::x64::FunctionCodegen;
use iced_x86::code_asm::CodeLabel;

const RAX: AsmReg = AsmReg::gp(0);
const RCX: AsmReg = AsmReg::gp(1);
const RDX: AsmReg = AsmReg::gp(2);
const R11: AsmReg = AsmReg::gp(11);
const XMM0: AsmReg = AsmReg::xmm(0);
const XMM1: AsmReg = AsmReg::xmm(1);
const XMM2: AsmReg = AsmReg::xmm(2);
/// Holds a float temporary consumed by the very next instruction.
const XMM15: AsmReg = AsmReg::xmm(15);

/// Location of an item once the module is linked.
#[derive(Debug, Clone, Copy)]
pub enum ItemAddr {
    /// Function emitted into the same code buffer.
    Label(CodeLabel),
    Abs(u64),
}

/// Addresses every function of a module may refer to.
#[derive(Debug)]
pub struct LinkTable {
    /// Code label of each function item, by item index.
    pub func_labels: IrVec<Option<CodeLabel>>,
    /// Absolute address of data, imports and resolved declarations, by item index.
    pub addresses: IrVec<Option<u64>>,
    /// Address of each string literal, by string index.
    pub strings: IrVec<u64>,
}

impl LinkTable {
    /// Empty table for a module of `items` items.
    pub fn new(alloc: &ContextAlloc, items: usize) -> Self {
        Self {
            func_labels: allocator_api2::vec![in alloc.clone(); None; items],
            addresses: allocator_api2::vec![in alloc.clone(); None; items],
            strings: IrVec::new_in(alloc.clone()),
        }
    }

    pub fn item_addr(&self, module: &Module, id: ItemId) -> Option<ItemAddr> {
        let local = module.resolve_func(id).unwrap_or(id);
        if let Some(label) = self.func_labels.get(local.index()).copied().flatten() {
            return Some(ItemAddr::Label(label));
        }
        self.addresses.get(id.index()).copied().flatten().map(ItemAddr::Abs)
    }
}

/// Flag condition left behind by a compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagTest {
    Cond(JumpCondition),
    /// ZF set and PF clear after `ucomis`/`fucomip`.
    FloatEq,
    /// ZF clear or PF set.
    FloatNe,
}

impl FlagTest {
    fn negate(self) -> Self {
        match self {
            FlagTest::Cond(c) => FlagTest::Cond(c.negate()),
            FlagTest::FloatEq => FlagTest::FloatNe,
            FlagTest::FloatNe => FlagTest::FloatEq,
        }
    }
}

fn width(s: bool) -> Width {
    if s {
        Width::W32
    } else {
        Width::W64
    }
}

fn precision(class: ValueClass) -> Precision {
    if class == ValueClass::Float {
        Precision::Single
    } else {
        Precision::Double
    }
}

/// Width of an integer memory element.
fn mem_width(ty: Type) -> Option<Width> {
    match ty {
        Type::I8 | Type::U8 => Some(Width::W8),
        Type::I16 | Type::U16 => Some(Width::W16),
        Type::I32 | Type::U32 => Some(Width::W32),
        Type::I64 | Type::U64 | Type::P | Type::Blk(_) | Type::RBlk(_) => Some(Width::W64),
        _ => None,
    }
}

/// x87 memory format of a float element.
fn x87_format(ty: Type) -> X87Format {
    match ty {
        Type::F => X87Format::F32,
        Type::D => X87Format::F64,
        _ => X87Format::F80,
    }
}

/// Lowers one function into the shared encoder.
pub struct FunctionLowering<'l> {
    module: &'l Module,
    func: &'l Func,
    name: &'l str,
    enc: &'l mut X64Encoder,
    frame: &'l FunctionFrame,
    analysis: &'l FunctionAnalysis,
    opts: &'l ActiveOpts,
    session: &'l CompilationSession,
    link: &'l LinkTable,
    labels: IrVec<CodeLabel>,
    cache: BlockCache,
    /// Cleared while marshalling calls and copying phis.
    allow_cache: bool,
    /// Label heading the block being emitted.
    block_label: Option<LabelId>,
    /// Variable currently living in XMM15.
    chain_var: Option<VarId>,
    cur: usize,
    /// Instructions consumed by the current step (2 for fused pairs).
    span: usize,
}

impl<'l> FunctionLowering<'l> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        module: &'l Module,
        func: &'l Func,
        name: &'l str,
        enc: &'l mut X64Encoder,
        frame: &'l FunctionFrame,
        analysis: &'l FunctionAnalysis,
        opts: &'l ActiveOpts,
        session: &'l CompilationSession,
        link: &'l LinkTable,
    ) -> Self {
        let labels = ir_vec(session.alloc(), (0..func.next_label).map(|_| enc.create_label()));
        Self {
            module,
            func,
            name,
            enc,
            frame,
            analysis,
            opts,
            session,
            link,
            labels,
            cache: BlockCache::new(session.alloc(), func.vars.len()),
            allow_cache: true,
            block_label: None,
            chain_var: None,
            cur: 0,
            span: 1,
        }
    }

    /// Emit the whole function. The caller binds the function's entry label.
    pub fn lower(mut self) -> CompileResult<()> {
        FunctionCodegen::new(&mut *self.enc, self.frame).emit_prologue(self.func)?;
        self.recount_block(0);

        let func = self.func;
        let mut i = 0;
        while i < func.insns.len() {
            let insn = &func.insns[i];
            self.cur = i;
            self.session.record_instruction_compiled(insn.code);
            log::trace!("{}: lowering {} {:?}", self.name, insn.code.name(), &insn.ops[..]);
            let fused = self.analysis.fused_cmp.get(i).copied().unwrap_or(false)
                || self.analysis.fmadd.get(i).copied().unwrap_or(false);
            self.span = if fused && i + 1 < func.insns.len() { 2 } else { 1 };
            let span = self.span;

            self.lower_insn(i, insn)?;

            for j in i..i + span {
                self.cache.consume(self.analysis.insn_reads(j));
            }
            self.cache.unlock_all();
            self.chain_var = if span == 1 && self.analysis.chained.get(i).copied().unwrap_or(false) {
                insn.ops.first().and_then(Operand::var)
            } else {
                None
            };
            i += span;
        }

        if !func.insns.last().is_some_and(|insn| insn.code.ends_flow()) {
            self.emit_epilogue()?;
        }
        Ok(())
    }

    fn lower_insn(&mut self, i: usize, insn: &'l Insn) -> CompileResult<()> {
        use Opcode::*;
        if self.span == 2 {
            let func = self.func;
            let next = &func.insns[i + 1];
            return if self.analysis.fused_cmp.get(i).copied().unwrap_or(false) {
                self.lower_fused_compare(insn, next)
            } else {
                self.lower_fmadd(insn, next)
            };
        }
        match insn.code {
            Label => {
                let l = self.label_op(insn, 0)?;
                self.lower_label(i, l)
            }
            Phi | Use | VaEnd => Ok(()),
            Call | Inline => self.lower_call(insn),
            Ret => self.lower_ret(insn),
            Jmp => self.lower_jmp(insn),
            Switch => self.lower_switch(insn),
            Bt | BtS | Bf | BfS => self.lower_bool_branch(insn),
            Bo | Bno | UBo | UBno => self.lower_overflow_branch(insn),
            Alloca => self.lower_alloca(insn),
            BStart => self.lower_bstart(insn),
            BEnd => self.lower_bend(insn),
            VaStart => self.lower_va_start(insn),
            VaArg => self.lower_va_arg(insn),
            Neg | NegS => self.lower_neg(insn),
            FNeg | DNeg => self.lower_fneg(insn),
            LDNeg => self.lower_ld_neg(insn),
            Ext8 | Ext16 | Ext32 | UExt8 | UExt16 | UExt32 => self.lower_ext(insn),
            I2F | I2D | UI2F | UI2D | F2I | D2I | F2D | D2F => self.lower_sse_convert(insn),
            I2LD | UI2LD | LD2I | F2LD | D2LD | LD2F | LD2D => self.lower_ld_convert(insn),
            code => {
                if let Some(class) = code.move_class() {
                    return match class {
                        ValueClass::Int => self.lower_int_move(insn),
                        ValueClass::LDouble => self.lower_ld_move(insn),
                        _ => self.lower_fp_move(insn, class),
                    };
                }
                if let Some((op, s)) = code.int_binop() {
                    return self.lower_int_binop(insn, op, s);
                }
                if let Some((op, class)) = code.fp_binop() {
                    return if class == ValueClass::LDouble {
                        self.lower_ld_binop(insn, op)
                    } else {
                        self.lower_fp_binop(insn, op, class)
                    };
                }
                if let Some((kind, class)) = code.compare() {
                    return self.lower_compare(insn, kind, class);
                }
                if let Some((kind, class)) = code.branch_compare() {
                    return self.lower_compare_branch(insn, kind, class);
                }
                if let Some((op, s)) = code.overflow_op() {
                    return self.lower_overflow(insn, op, s);
                }
                Err(self.unencodable(insn))
            }
        }
    }

    // ---- errors and operand access ----

    fn malformed(&self, reason: impl Into<String>) -> CompileError {
        CompileError::MalformedIr {
            function: self.name.to_string(),
            reason: reason.into(),
        }
    }

    fn unencodable(&self, insn: &Insn) -> CompileError {
        let operands: Vec<String> = insn.ops.iter().map(|o| format!("{o:?}")).collect();
        CompileError::Unencodable {
            function: self.name.to_string(),
            opcode: insn.code.name().to_string(),
            operands: operands.join(", "),
        }
    }

    /// Unencodable error for the instruction being lowered.
    fn bad_operand(&self) -> CompileError {
        match self.func.insns.get(self.cur) {
            Some(insn) => self.unencodable(insn),
            None => CompileError::internal(format!("operand outside any instruction in {}", self.name)),
        }
    }

    fn op(&self, insn: &Insn, k: usize) -> CompileResult<Operand> {
        insn.ops
            .get(k)
            .copied()
            .ok_or_else(|| self.malformed(format!("{} is missing operand {k}", insn.code.name())))
    }

    fn dst_var(&self, insn: &Insn, k: usize) -> CompileResult<VarId> {
        match self.op(insn, k)? {
            Operand::Var(v) => Ok(v),
            _ => Err(self.unencodable(insn)),
        }
    }

    fn label_op(&self, insn: &Insn, k: usize) -> CompileResult<LabelId> {
        self.op(insn, k)?
            .label()
            .ok_or_else(|| self.malformed(format!("{} expects a label operand", insn.code.name())))
    }

    fn code_label(&self, l: LabelId) -> CompileResult<CodeLabel> {
        self.labels.get(l.0 as usize).copied().ok_or(CompileError::UnresolvedLabel {
            function: self.name.to_string(),
            label: l.0,
        })
    }

    fn emit_epilogue(&mut self) -> CompileResult<()> {
        FunctionCodegen::new(&mut *self.enc, self.frame).emit_epilogue()?;
        Ok(())
    }

    // ---- blocks ----

    /// Count the reads of the block starting at instruction `start`.
    fn recount_block(&mut self, start: usize) {
        let insns = &self.func.insns;
        let end = insns
            .get(start..)
            .and_then(|rest| rest.iter().position(|i| i.code == Opcode::Label))
            .map_or(insns.len(), |p| start + p);
        let analysis = self.analysis;
        self.cache
            .recount((start..end).flat_map(|j| analysis.insn_reads(j).iter().copied()));
    }

    fn lower_label(&mut self, i: usize, l: LabelId) -> CompileResult<()> {
        let falls_in = i > 0 && !self.func.insns[i - 1].code.ends_flow();
        if falls_in {
            self.flush()?;
            self.phi_copies(l)?;
        }
        self.cache.clear();
        self.chain_var = None;
        let label = self.labels.get_mut(l.0 as usize).ok_or(CompileError::UnresolvedLabel {
            function: self.name.to_string(),
            label: l.0,
        })?;
        self.enc.bind(label)?;
        self.block_label = Some(l);
        self.recount_block(i + 1);
        Ok(())
    }

    /// Copy the phi sources of `target` for an edge leaving the current block.
    fn phi_copies(&mut self, target: LabelId) -> CompileResult<()> {
        let func = self.func;
        let mut copies = IrVec::new_in(self.session.alloc().clone());
        for phi in self.analysis.block_phis(func, target.0) {
            let from = self
                .block_label
                .ok_or_else(|| self.malformed(format!("phi in L{} reached from the entry block", target.0)))?;
            let dst = self.dst_var(phi, 0)?;
            let src = phi
                .ops
                .get(1..)
                .unwrap_or(&[])
                .chunks(2)
                .find(|pair| pair.first().and_then(Operand::label) == Some(from))
                .and_then(|pair| pair.get(1).copied())
                .ok_or_else(|| self.malformed(format!("phi in L{} has no value for L{}", target.0, from.0)))?;
            if src != Operand::Var(dst) {
                copies.push((dst, src));
            }
        }
        if copies.is_empty() {
            return Ok(());
        }

        let saved = std::mem::replace(&mut self.allow_cache, false);
        let result = self.emit_phi_copies(&copies);
        self.allow_cache = saved;
        result
    }

    fn emit_phi_copies(&mut self, copies: &[(VarId, Operand)]) -> CompileResult<()> {
        if let [(dst, src)] = copies {
            return self.copy_into(*dst, src);
        }
        // Parallel semantics: read every source before writing any destination.
        for (k, (dst, src)) in copies.iter().enumerate() {
            let slot = self
                .frame
                .phi_slot(k)
                .ok_or_else(|| CompileError::internal("phi scratch slots exhausted"))?;
            match self.func.var_type(*dst).class() {
                ValueClass::Int => {
                    let r = self.int_reg(src, RAX, Width::W64)?;
                    self.enc.store(Width::W64, &slot, GpSrc::Reg(r))?;
                }
                ValueClass::LDouble => {
                    self.ld_push(src)?;
                    self.enc.fstp(X87Format::F80, &slot)?;
                }
                class => {
                    let prec = precision(class);
                    let r = self.fp_reg(src, prec, XMM0)?;
                    self.enc.sse_store(prec, &slot, r)?;
                }
            }
        }
        for (k, (dst, _)) in copies.iter().enumerate() {
            let slot = self
                .frame
                .phi_slot(k)
                .ok_or_else(|| CompileError::internal("phi scratch slots exhausted"))?;
            let dst = *dst;
            match self.func.var_type(dst).class() {
                ValueClass::Int => {
                    self.enc.load(Width::W64, RAX, &slot)?;
                    self.write_var(dst, RAX)?;
                }
                ValueClass::LDouble => {
                    self.enc.fld(X87Format::F80, &slot)?;
                    self.enc.fstp(X87Format::F80, &self.frame.slot(dst))?;
                }
                class => {
                    self.enc.sse_load(precision(class), XMM0, &slot)?;
                    self.write_var(dst, XMM0)?;
                }
            }
        }
        Ok(())
    }

    /// Assign `src` to `dst`'s home or slot without going through the cache.
    fn copy_into(&mut self, dst: VarId, src: &Operand) -> CompileResult<()> {
        match self.func.var_type(dst).class() {
            ValueClass::Int => {
                let r = self.int_reg(src, RAX, Width::W64)?;
                self.write_var(dst, r)
            }
            ValueClass::LDouble => {
                self.ld_push(src)?;
                self.enc.fstp(X87Format::F80, &self.frame.slot(dst))?;
                Ok(())
            }
            class => {
                let r = self.fp_reg(src, precision(class), XMM0)?;
                self.write_var(dst, r)
            }
        }
    }

    /// Move `reg` into the home register of `v`, or its slot.
    fn write_var(&mut self, v: VarId, reg: AsmReg) -> CompileResult<()> {
        match self.frame.home(v) {
            Some(h) if h.bank == GP_BANK => self.enc.mov_rr(Width::W64, h, reg)?,
            Some(h) => self.enc.sse_mov_rr(h, reg)?,
            None => self.store_slot(v, reg)?,
        }
        Ok(())
    }

    // ---- the block cache ----

    /// Register already holding `v`.
    fn var_reg(&mut self, v: VarId) -> Option<AsmReg> {
        if let Some(h) = self.frame.home(v) {
            return Some(h);
        }
        if self.chain_var == Some(v) {
            return Some(XMM15);
        }
        let reg = self.cache.lookup(&CacheKey::Var(v))?;
        self.session.record(StatEvent::CacheHit);
        Some(reg)
    }

    /// Claim a cache register, storing back whatever dirty variable it displaces.
    fn cache_alloc(&mut self, bank: RegBank, key: CacheKey) -> CompileResult<Option<AsmReg>> {
        match self.cache.allocate(bank, key) {
            Ok((reg, evicted)) => {
                if let Some(ev) = evicted {
                    self.spill(ev)?;
                }
                Ok(Some(reg))
            }
            Err(_) => Ok(None),
        }
    }

    fn spill(&mut self, ev: Evicted<CacheKey>) -> CompileResult<()> {
        if let (true, CacheKey::Var(v)) = (ev.dirty, &ev.key) {
            self.store_slot(*v, ev.reg)?;
            self.session.record(StatEvent::Spill);
        }
        Ok(())
    }

    fn store_slot(&mut self, v: VarId, reg: AsmReg) -> CompileResult<()> {
        let slot = self.frame.slot(v);
        match self.func.var_type(v).class() {
            ValueClass::Float => self.enc.sse_store(Precision::Single, &slot, reg)?,
            ValueClass::Double => self.enc.sse_store(Precision::Double, &slot, reg)?,
            _ => self.enc.store(Width::W64, &slot, GpSrc::Reg(reg))?,
        }
        Ok(())
    }

    /// Store every dirty cached variable back to its slot.
    fn flush(&mut self) -> CompileResult<()> {
        for (reg, v) in self.cache.dirty_vars() {
            self.store_slot(v, reg)?;
            self.cache.set_dirty(reg, false);
        }
        Ok(())
    }

    /// Reads of `v` left in the block after the current step.
    fn reads_after(&self, v: VarId) -> u32 {
        let here: usize = (self.cur..self.cur + self.span)
            .map(|j| self.analysis.insn_reads(j).iter().filter(|r| **r == v).count())
            .sum();
        self.cache.remaining(v).saturating_sub(here as u32)
    }

    /// Forget cached float fields a store to `m` may have overwritten.
    fn invalidate_stored(&mut self, m: &MemOp) {
        self.cache.invalidate_fields(|f| f.may_alias(m));
    }

    // ---- sources ----

    fn load_item_addr(&mut self, dst: AsmReg, id: ItemId) -> CompileResult<()> {
        match self.link.item_addr(self.module, id) {
            Some(ItemAddr::Label(l)) => self.enc.lea_label(dst, l)?,
            Some(ItemAddr::Abs(a)) => self.enc.mov_ri(dst, a as i64)?,
            None => {
                let name = self.module.item(id).map_or_else(|| format!("item {}", id.0), |it| it.name.to_string());
                return Err(CompileError::UndefinedSymbol { name });
            }
        }
        Ok(())
    }

    /// Load a memory element of type `ty` into `dst`, extending it to 64 bits.
    fn load_mem(&mut self, dst: AsmReg, ty: Type, addr: &MemRef) -> CompileResult<()> {
        let m = GpSrc::Mem(*addr);
        match ty {
            Type::I8 => self.enc.movsx(Width::W8, dst, m)?,
            Type::U8 => self.enc.movzx(Width::W8, dst, m)?,
            Type::I16 => self.enc.movsx(Width::W16, dst, m)?,
            Type::U16 => self.enc.movzx(Width::W16, dst, m)?,
            Type::I32 => self.enc.movsx(Width::W32, dst, m)?,
            Type::U32 | Type::F => self.enc.movzx(Width::W32, dst, m)?,
            _ => self.enc.load(Width::W64, dst, addr)?,
        }
        Ok(())
    }

    /// Resolve an integer source for an instruction of width `w`. `temp` receives the
    /// value when it has to be materialized.
    fn int_src(&mut self, op: &Operand, temp: AsmReg, w: Width, allow_mem: bool, allow_imm: bool) -> CompileResult<GpSrc> {
        match *op {
            Operand::Var(v) => {
                if let Some(r) = self.var_reg(v) {
                    return Ok(GpSrc::Reg(r));
                }
                let slot = self.frame.slot(v);
                if self.opts.reg_cache && self.allow_cache && self.cache.remaining(v) >= 2 {
                    if let Some(r) = self.cache_alloc(GP_BANK, CacheKey::Var(v))? {
                        self.enc.load(Width::W64, r, &slot)?;
                        return Ok(GpSrc::Reg(r));
                    }
                }
                if self.opts.mem_operands && allow_mem {
                    return Ok(GpSrc::Mem(slot));
                }
                self.enc.load(Width::W64, temp, &slot)?;
                Ok(GpSrc::Reg(temp))
            }
            Operand::Int(_) | Operand::Uint(_) => {
                let c = op.int_imm().unwrap_or_default();
                let imm = match w {
                    Width::W64 => i32::try_from(c).ok(),
                    Width::W32 => Some(c as i32),
                    Width::W16 => Some(c as i16 as i32),
                    Width::W8 => Some(c as i8 as i32),
                };
                match imm {
                    Some(i) if self.opts.mem_operands && allow_imm => Ok(GpSrc::Imm(i)),
                    _ => {
                        self.enc.mov_ri(temp, c)?;
                        Ok(GpSrc::Reg(temp))
                    }
                }
            }
            Operand::Ref(id) => {
                self.load_item_addr(temp, id)?;
                Ok(GpSrc::Reg(temp))
            }
            Operand::Str(s) => {
                let addr = self
                    .link
                    .strings
                    .get(s.0 as usize)
                    .copied()
                    .ok_or_else(|| self.malformed(format!("string {} does not exist", s.0)))?;
                self.enc.mov_ri(temp, addr as i64)?;
                Ok(GpSrc::Reg(temp))
            }
            Operand::Mem(m) => {
                let addr = self.mem_addr(&m)?;
                if mem_width(m.ty) == Some(w) && self.opts.mem_operands && allow_mem && !addr.uses(R11) {
                    return Ok(GpSrc::Mem(addr));
                }
                self.load_mem(temp, m.ty, &addr)?;
                Ok(GpSrc::Reg(temp))
            }
            _ => Err(self.bad_operand()),
        }
    }

    /// Integer source forced into a register.
    fn int_reg(&mut self, op: &Operand, temp: AsmReg, w: Width) -> CompileResult<AsmReg> {
        match self.int_src(op, temp, w, false, false)? {
            GpSrc::Reg(r) => Ok(r),
            other => {
                self.mov_to(w, temp, other)?;
                Ok(temp)
            }
        }
    }

    /// Resolve a float or double source.
    fn fp_src(&mut self, op: &Operand, prec: Precision, temp: AsmReg, allow_mem: bool) -> CompileResult<XmmSrc> {
        match *op {
            Operand::Var(v) => {
                if let Some(r) = self.var_reg(v) {
                    return Ok(XmmSrc::Reg(r));
                }
                let slot = self.frame.slot(v);
                if self.opts.float_cache && self.allow_cache && self.cache.remaining(v) >= 2 {
                    if let Some(r) = self.cache_alloc(XMM_BANK, CacheKey::Var(v))? {
                        self.enc.sse_load(prec, r, &slot)?;
                        return Ok(XmmSrc::Reg(r));
                    }
                }
                if self.opts.mem_operands && allow_mem {
                    return Ok(XmmSrc::Mem(slot));
                }
                self.enc.sse_load(prec, temp, &slot)?;
                Ok(XmmSrc::Reg(temp))
            }
            Operand::Float(_) | Operand::Double(_) | Operand::LDouble(_) => {
                let x = match *op {
                    Operand::Float(f) => f as f64,
                    Operand::Double(d) | Operand::LDouble(d) => d,
                    _ => 0.0,
                };
                let bits = match prec {
                    Precision::Single => (x as f32).to_bits() as i64,
                    Precision::Double => x.to_bits() as i64,
                };
                self.enc.mov_ri(RAX, bits)?;
                self.enc.movq_to_xmm(prec, temp, RAX)?;
                Ok(XmmSrc::Reg(temp))
            }
            Operand::Mem(m) => {
                if self.opts.float_field_cache && self.allow_cache {
                    let key = CacheKey::Field(m);
                    if let Some(r) = self.cache.lookup(&key) {
                        self.session.record(StatEvent::CacheHit);
                        return Ok(XmmSrc::Reg(r));
                    }
                    let addr = self.mem_addr(&m)?;
                    if let Some(r) = self.cache_alloc(XMM_BANK, key)? {
                        self.enc.sse_load(prec, r, &addr)?;
                        return Ok(XmmSrc::Reg(r));
                    }
                    self.enc.sse_load(prec, temp, &addr)?;
                    return Ok(XmmSrc::Reg(temp));
                }
                let addr = self.mem_addr(&m)?;
                if self.opts.mem_operands && allow_mem && !addr.uses(R11) {
                    return Ok(XmmSrc::Mem(addr));
                }
                self.enc.sse_load(prec, temp, &addr)?;
                Ok(XmmSrc::Reg(temp))
            }
            _ => Err(self.bad_operand()),
        }
    }

    /// Float source forced into a register.
    fn fp_reg(&mut self, op: &Operand, prec: Precision, temp: AsmReg) -> CompileResult<AsmReg> {
        match self.fp_src(op, prec, temp, false)? {
            XmmSrc::Reg(r) => Ok(r),
            src => {
                self.enc.sse_move(prec, temp, src)?;
                Ok(temp)
            }
        }
    }

    /// Push a long double source onto the x87 stack.
    fn ld_push(&mut self, op: &Operand) -> CompileResult<()> {
        match *op {
            Operand::Var(v) => self.enc.fld(X87Format::F80, &self.frame.slot(v))?,
            Operand::Mem(m) => {
                let addr = self.mem_addr(&m)?;
                self.enc.fld(x87_format(m.ty), &addr)?;
            }
            Operand::Float(f) => {
                let scratch = self.frame.scratch();
                self.enc.store(Width::W32, &scratch, GpSrc::Imm(f.to_bits() as i32))?;
                self.enc.fld(X87Format::F32, &scratch)?;
            }
            Operand::Double(d) | Operand::LDouble(d) => {
                let scratch = self.frame.scratch();
                self.enc.mov_ri(RAX, d.to_bits() as i64)?;
                self.enc.store(Width::W64, &scratch, GpSrc::Reg(RAX))?;
                self.enc.fld(X87Format::F64, &scratch)?;
            }
            Operand::Int(_) | Operand::Uint(_) => {
                let scratch = self.frame.scratch();
                self.enc.mov_ri(RAX, op.int_imm().unwrap_or_default())?;
                self.enc.store(Width::W64, &scratch, GpSrc::Reg(RAX))?;
                self.enc.fild64(&scratch)?;
            }
            _ => return Err(self.bad_operand()),
        }
        Ok(())
    }

    // ---- addresses ----

    /// Address of a memory operand.
    fn mem_addr(&mut self, m: &MemOp) -> CompileResult<MemRef> {
        if m.base.is_none() && m.index.is_none() {
            self.enc.mov_ri(R11, m.disp)?;
            return Ok(MemRef::base(R11, 0));
        }
        let disp = i32::try_from(m.disp).map_err(|_| self.bad_operand())?;
        match (m.base, m.index) {
            (Some(b), None) => {
                let r = self.addr_reg(b)?;
                Ok(MemRef::base(r, disp))
            }
            (Some(b), Some(ix)) if self.opts.ind_cache && self.allow_cache => {
                let key = CacheKey::Ind {
                    base: b,
                    index: ix,
                    scale: m.scale,
                };
                if let Some(r) = self.cache.lookup(&key) {
                    self.session.record(StatEvent::CacheHit);
                    return Ok(MemRef::base(r, disp));
                }
                let sum = self.index_addr(Some(b), ix, m.scale, 0)?;
                match self.cache_alloc(GP_BANK, key)? {
                    Some(r) => {
                        self.enc.lea(r, &sum)?;
                        Ok(MemRef::base(r, disp))
                    }
                    None => Ok(sum.offset(disp)),
                }
            }
            (b, Some(ix)) => self.index_addr(b, ix, m.scale, disp),
            (None, None) => Err(self.bad_operand()),
        }
    }

    /// Register holding the value of the base variable `b`.
    fn addr_reg(&mut self, b: VarId) -> CompileResult<AsmReg> {
        if let Some(r) = self.var_reg(b) {
            return Ok(r);
        }
        let slot = self.frame.slot(b);
        let cache_it = self.allow_cache
            && (self.opts.addr_cache || (self.opts.reg_cache && self.cache.remaining(b) >= 2));
        if cache_it {
            if let Some(r) = self.cache_alloc(GP_BANK, CacheKey::Var(b))? {
                self.enc.load(Width::W64, r, &slot)?;
                return Ok(r);
            }
        }
        self.enc.load(Width::W64, R11, &slot)?;
        Ok(R11)
    }

    fn index_addr(&mut self, base: Option<VarId>, index: VarId, scale: u8, disp: i32) -> CompileResult<MemRef> {
        let ir = self.var_reg(index);
        let Some(base) = base else {
            let ir = match ir {
                Some(r) => r,
                None => {
                    self.enc.load(Width::W64, R11, &self.frame.slot(index))?;
                    R11
                }
            };
            return Ok(MemRef {
                base: None,
                index: Some(ir),
                scale,
                disp,
            });
        };
        let br = self.var_reg(base);
        match (br, ir) {
            (Some(b), Some(i)) => Ok(MemRef::indexed(b, i, scale, disp)),
            (None, Some(i)) => {
                self.enc.load(Width::W64, R11, &self.frame.slot(base))?;
                Ok(MemRef::indexed(R11, i, scale, disp))
            }
            (Some(b), None) => {
                self.enc.load(Width::W64, R11, &self.frame.slot(index))?;
                Ok(MemRef::indexed(b, R11, scale, disp))
            }
            (None, None) => {
                self.enc.load(Width::W64, R11, &self.frame.slot(index))?;
                if scale > 1 {
                    self.enc
                        .shift(ShiftOp::Shl, Width::W64, R11, ShiftAmount::Imm(scale.trailing_zeros() as u8))?;
                }
                self.enc
                    .alu(AluOp::Add, Width::W64, R11, GpSrc::Mem(self.frame.slot(base)))?;
                Ok(MemRef::base(R11, disp))
            }
        }
    }

    // ---- destinations ----

    fn mov_to(&mut self, w: Width, d: AsmReg, src: GpSrc) -> CompileResult<()> {
        match src {
            GpSrc::Reg(r) if r == d && w == Width::W64 => {}
            GpSrc::Reg(r) => self.enc.mov_rr(w, d, r)?,
            GpSrc::Mem(m) => self.enc.load(w, d, &m)?,
            GpSrc::Imm(i) => {
                let value = if w == Width::W32 { i as u32 as i64 } else { i as i64 };
                self.enc.mov_ri(d, value)?;
            }
        }
        Ok(())
    }

    /// Register that will receive the integer result for `v`.
    fn begin_dest(&mut self, v: VarId) -> CompileResult<AsmReg> {
        if let Some(h) = self.frame.home(v) {
            return Ok(h);
        }
        let key = CacheKey::Var(v);
        if let Some(r) = self.cache.peek(&key) {
            self.cache.lock(r);
            return Ok(r);
        }
        if self.opts.reg_cache && self.allow_cache && self.reads_after(v) >= 1 {
            if let Some(r) = self.cache_alloc(GP_BANK, key)? {
                return Ok(r);
            }
        }
        Ok(RAX)
    }

    /// Register that will receive the float result for `v` produced by instruction `at`.
    fn begin_fdest(&mut self, v: VarId, at: usize) -> CompileResult<AsmReg> {
        if self.analysis.chained.get(at).copied().unwrap_or(false) {
            self.session.record(StatEvent::ChainedFloat);
            return Ok(XMM15);
        }
        if let Some(h) = self.frame.home(v) {
            return Ok(h);
        }
        let key = CacheKey::Var(v);
        if let Some(r) = self.cache.peek(&key) {
            self.cache.lock(r);
            return Ok(r);
        }
        if self.opts.float_cache && self.allow_cache && self.reads_after(v) >= 1 {
            if let Some(r) = self.cache_alloc(XMM_BANK, key)? {
                return Ok(r);
            }
        }
        Ok(XMM0)
    }

    /// Finish writing `v`, whose new value is in `d`.
    fn commit_dest(&mut self, v: VarId, d: AsmReg) -> CompileResult<()> {
        if d == XMM15 || self.frame.home(v) == Some(d) {
            // Lives in a register for its whole lifetime.
        } else if self.cache.key_of(d) == Some(&CacheKey::Var(v)) {
            if self.opts.defer_store {
                self.cache.set_dirty(d, true);
            } else {
                self.store_slot(v, d)?;
            }
        } else {
            let _stale = self.cache.forget_var(v);
            self.store_slot(v, d)?;
        }
        self.cache.invalidate_dependents(v);
        Ok(())
    }

    /// Pop st(0) into the slot of the long double `v`.
    fn commit_ld(&mut self, v: VarId) -> CompileResult<()> {
        self.enc.fstp(X87Format::F80, &self.frame.slot(v))?;
        self.cache.invalidate_dependents(v);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_test_negation() {
        assert_eq!(FlagTest::FloatEq.negate(), FlagTest::FloatNe);
        assert_eq!(
            FlagTest::Cond(JumpCondition::Above).negate(),
            FlagTest::Cond(JumpCondition::BelowEqual)
        );
    }

    #[test]
    fn test_memory_element_widths() {
        assert_eq!(mem_width(Type::U8), Some(Width::W8));
        assert_eq!(mem_width(Type::I32), Some(Width::W32));
        assert_eq!(mem_width(Type::P), Some(Width::W64));
        assert_eq!(mem_width(Type::D), None);
        assert_eq!(x87_format(Type::F), X87Format::F32);
        assert_eq!(x87_format(Type::LD), X87Format::F80);
    }

    #[test]
    fn test_link_table_prefers_local_functions() {
        let alloc = ContextAlloc::system();
        let mut m = Module::new("m", &alloc);
        let import = m.add_import("puts");
        let mut enc = X64Encoder::new().unwrap();
        let mut link = LinkTable::new(&alloc, 1);
        link.addresses[0] = Some(0x1000);
        assert!(matches!(link.item_addr(&m, import), Some(ItemAddr::Abs(0x1000))));
        let mut local = LinkTable::new(&alloc, 1);
        local.func_labels[0] = Some(enc.create_label());
        assert!(matches!(local.item_addr(&m, import), Some(ItemAddr::Label(_))));
        assert!(LinkTable::new(&alloc, 0).item_addr(&m, import).is_none());
    }
}
