// Pre-lowering analysis of one function. A single forward walk counts reads and writes
// of every variable, records which variables each instruction reads (the lowering
// engine replays these per block to know how many reads of a cached variable remain),
// locates labels and the phi instructions heading each block, and estimates loop depth
// from backward branches. On top of those facts it decides the instruction pairs the
// optimization toggles fuse: a compare whose only reader is the next conditional
// branch, a float multiply whose only reader is the next add, and a float temporary
// whose only reader is the next instruction (kept in the chain register). Finally it
// ranks variables by loop-weighted use counts and assigns function-wide home
// registers to the hottest integer and float variables.

//! Variable use counts, fusion candidates and home register promotion.

use crate::core::options::ActiveOpts;
use crate::core::register_file::AsmReg;
use crate::ir::{ir_vec, Func, FpOp, Insn, IrVec, Module, Opcode, Operand, ValueClass, VarId};
use crate::x64::calling_convention::SysVAssigner;

/// Home registers for promoted float variables.
pub const FLOAT_HOMES: [AsmReg; 7] = [
    AsmReg::xmm(8),
    AsmReg::xmm(9),
    AsmReg::xmm(10),
    AsmReg::xmm(11),
    AsmReg::xmm(12),
    AsmReg::xmm(13),
    AsmReg::xmm(14),
];

const MAX_LOOP_DEPTH: u32 = 5;

/// Number of result operands of a call instruction.
pub fn call_result_count(module: &Module, insn: &Insn) -> usize {
    match insn.ops.first() {
        Some(Operand::Ref(id)) => module
            .item(*id)
            .and_then(|it| it.proto())
            .map_or(0, |p| p.res_types.len()),
        _ => 0,
    }
}

fn read_sources(ops: &[Operand], f: &mut impl FnMut(VarId)) {
    for op in ops {
        op.read_vars().for_each(&mut *f);
    }
}

/// Variables read by `insn`, excluding phi sources.
pub fn for_each_read(module: &Module, insn: &Insn, mut f: impl FnMut(VarId)) {
    let ops = &insn.ops;
    match insn.code {
        Opcode::Label | Opcode::Phi => {}
        Opcode::Call | Opcode::Inline => {
            let nres = call_result_count(module, insn);
            read_sources(ops.get(1..2).unwrap_or(&[]), &mut f);
            read_sources(ops.get(2 + nres..).unwrap_or(&[]), &mut f);
        }
        code if code.is_branch() && code != Opcode::Switch => {
            read_sources(ops.get(1..).unwrap_or(&[]), &mut f)
        }
        code if code.has_result() => {
            if let Some(Operand::Mem(m)) = ops.first() {
                m.base.into_iter().chain(m.index).for_each(&mut f);
            }
            read_sources(ops.get(1..).unwrap_or(&[]), &mut f);
        }
        _ => read_sources(ops, &mut f),
    }
}

/// Variables written by `insn`.
pub fn for_each_write(module: &Module, insn: &Insn, mut f: impl FnMut(VarId)) {
    match insn.code {
        Opcode::Call | Opcode::Inline => {
            let nres = call_result_count(module, insn);
            insn.ops
                .iter()
                .skip(2)
                .take(nres)
                .filter_map(Operand::var)
                .for_each(f);
        }
        code if code.has_result() => {
            if let Some(v) = insn.ops.first().and_then(Operand::var) {
                f(v);
            }
        }
        _ => {}
    }
}

/// Facts about one function consumed by the lowering engine.
#[derive(Debug)]
pub struct FunctionAnalysis {
    pub reads: IrVec<u32>,
    pub writes: IrVec<u32>,
    /// Loop-depth-weighted use counts.
    pub weights: IrVec<u64>,
    read_offsets: IrVec<u32>,
    read_vars: IrVec<VarId>,
    /// Instruction index of each label, by label id.
    pub label_pos: IrVec<Option<usize>>,
    /// Compare at `i` folded into the branch at `i + 1`.
    pub fused_cmp: IrVec<bool>,
    /// Multiply at `i` folded with the add at `i + 1`.
    pub fmadd: IrVec<bool>,
    /// Result of `i` stays in the chain register for `i + 1`.
    pub chained: IrVec<bool>,
    /// Function-wide home register of each variable.
    pub homes: IrVec<Option<AsmReg>>,
    /// Largest number of phis heading one block.
    pub max_phis: usize,
    pub has_calls: bool,
}

impl FunctionAnalysis {
    /// Variables read by instruction `i` (phi sources excluded).
    pub fn insn_reads(&self, i: usize) -> &[VarId] {
        let start = self.read_offsets.get(i).copied().unwrap_or(0) as usize;
        let end = self.read_offsets.get(i + 1).copied().unwrap_or(start as u32) as usize;
        self.read_vars.get(start..end).unwrap_or(&[])
    }

    pub fn reads_of(&self, v: VarId) -> u32 {
        self.reads.get(v.index()).copied().unwrap_or(0)
    }

    pub fn home(&self, v: VarId) -> Option<AsmReg> {
        self.homes.get(v.index()).copied().flatten()
    }

    /// Phi instructions heading the block labelled `label`.
    pub fn block_phis<'f>(&self, func: &'f Func, label: u32) -> impl Iterator<Item = &'f Insn> + 'f {
        let start = self
            .label_pos
            .get(label as usize)
            .copied()
            .flatten()
            .map_or(func.insns.len(), |p| p + 1);
        func.insns[start..]
            .iter()
            .take_while(|i| i.code == Opcode::Phi || i.code == Opcode::Use)
            .filter(|i| i.code == Opcode::Phi)
    }
}

fn single_use(a: &FunctionAnalysis, v: VarId, nargs: u32) -> bool {
    v.0 >= nargs && a.reads_of(v) == 1 && a.writes.get(v.index()).copied() == Some(1)
}

/// Analyze `func` under the active toggles.
pub fn analyze(module: &Module, func: &Func, opts: &ActiveOpts) -> FunctionAnalysis {
    let nvars = func.vars.len();
    let ninsns = func.insns.len();
    let alloc = module.alloc();
    let mut a = FunctionAnalysis {
        reads: allocator_api2::vec![in alloc.clone(); 0; nvars],
        writes: allocator_api2::vec![in alloc.clone(); 0; nvars],
        weights: allocator_api2::vec![in alloc.clone(); 0; nvars],
        read_offsets: IrVec::with_capacity_in(ninsns + 1, alloc.clone()),
        read_vars: IrVec::new_in(alloc.clone()),
        label_pos: allocator_api2::vec![in alloc.clone(); None; func.next_label as usize],
        fused_cmp: allocator_api2::vec![in alloc.clone(); false; ninsns],
        fmadd: allocator_api2::vec![in alloc.clone(); false; ninsns],
        chained: allocator_api2::vec![in alloc.clone(); false; ninsns],
        homes: allocator_api2::vec![in alloc.clone(); None; nvars],
        max_phis: 0,
        has_calls: false,
    };

    let mut phis_in_block = 0usize;
    for (i, insn) in func.insns.iter().enumerate() {
        a.read_offsets.push(a.read_vars.len() as u32);
        match insn.code {
            Opcode::Label => {
                if let Some(l) = insn.ops.first().and_then(Operand::label) {
                    if let Some(slot) = a.label_pos.get_mut(l.0 as usize) {
                        *slot = Some(i);
                    }
                }
                phis_in_block = 0;
            }
            Opcode::Phi => {
                phis_in_block += 1;
                a.max_phis = a.max_phis.max(phis_in_block);
                for pair in insn.ops.get(1..).unwrap_or(&[]).chunks(2) {
                    if let Some(v) = pair.get(1).and_then(Operand::var) {
                        a.reads[v.index()] += 1;
                    }
                }
            }
            code if code.is_call() => a.has_calls = true,
            _ => {}
        }
        let read_vars = &mut a.read_vars;
        let reads = &mut a.reads;
        for_each_read(module, insn, |v| {
            if let Some(r) = reads.get_mut(v.index()) {
                *r += 1;
                read_vars.push(v);
            }
        });
        let writes = &mut a.writes;
        for_each_write(module, insn, |v| {
            if let Some(w) = writes.get_mut(v.index()) {
                *w += 1;
            }
        });
    }
    a.read_offsets.push(a.read_vars.len() as u32);

    // Loop depth: every backward branch covers [target, branch].
    let mut depth = allocator_api2::vec![in alloc.clone(); 0u32; ninsns];
    for (j, insn) in func.insns.iter().enumerate() {
        if !insn.code.is_branch() {
            continue;
        }
        for l in insn.ops.iter().filter_map(Operand::label) {
            if let Some(p) = a.label_pos.get(l.0 as usize).copied().flatten() {
                if p <= j {
                    depth[p..=j].iter_mut().for_each(|d| *d += 1);
                }
            }
        }
    }
    for (i, insn) in func.insns.iter().enumerate() {
        let w = 8u64.pow(depth[i].min(MAX_LOOP_DEPTH));
        let weights = &mut a.weights;
        for_each_read(module, insn, |v| {
            if let Some(x) = weights.get_mut(v.index()) {
                *x += w;
            }
        });
        for_each_write(module, insn, |v| {
            if let Some(x) = weights.get_mut(v.index()) {
                *x += w;
            }
        });
    }

    promote(&mut a, func, opts);
    find_fusions(&mut a, func, opts);

    log::debug!(
        "analysis: {} vars, {} insns, {} fused compares, {} fmadds, {} chained",
        nvars,
        ninsns,
        a.fused_cmp.iter().filter(|x| **x).count(),
        a.fmadd.iter().filter(|x| **x).count(),
        a.chained.iter().filter(|x| **x).count()
    );
    a
}

fn promote(a: &mut FunctionAnalysis, func: &Func, opts: &ActiveOpts) {
    let rank = |class: fn(ValueClass) -> bool| {
        let mut candidates = ir_vec(
            func.vars.allocator(),
            func.vars
                .iter()
                .enumerate()
                .filter(|(i, v)| class(v.ty.class()) && a.weights[*i] > 0)
                .map(|(i, _)| (a.weights[i], i)),
        );
        candidates.sort_by(|x, y| y.0.cmp(&x.0).then(x.1.cmp(&y.1)));
        candidates
    };
    if opts.smart_regs {
        let ints = rank(|c| c == ValueClass::Int);
        for ((_, var), reg) in ints.into_iter().zip(SysVAssigner::CALLEE_SAVED) {
            a.homes[var] = Some(reg);
        }
    }
    if opts.float_promote {
        let floats = rank(|c| matches!(c, ValueClass::Float | ValueClass::Double));
        for ((_, var), reg) in floats.into_iter().zip(FLOAT_HOMES) {
            a.homes[var] = Some(reg);
        }
    }
}

fn is_float_class(func: &Func, v: VarId) -> bool {
    matches!(func.var_type(v).class(), ValueClass::Float | ValueClass::Double)
}

fn find_fusions(a: &mut FunctionAnalysis, func: &Func, opts: &ActiveOpts) {
    let insns = &func.insns;
    for i in 0..insns.len().saturating_sub(1) {
        let (cur, next) = (&insns[i], &insns[i + 1]);
        let Some(t) = cur.ops.first().and_then(Operand::var) else {
            continue;
        };

        if opts.cmp_branch
            && cur.code.compare().is_some()
            && matches!(next.code, Opcode::Bt | Opcode::BtS | Opcode::Bf | Opcode::BfS)
            && next.ops.get(1) == Some(&Operand::Var(t))
            && single_use(a, t, func.nargs)
        {
            a.fused_cmp[i] = true;
        }

        if opts.fmadd {
            if let (Some((FpOp::Mul, c1)), Some((FpOp::Add, c2))) =
                (cur.code.fp_binop(), next.code.fp_binop())
            {
                let uses_t = next.ops.get(1..3).is_some_and(|s| {
                    (s[0] == Operand::Var(t)) != (s[1] == Operand::Var(t))
                });
                if c1 == c2 && c1 != ValueClass::LDouble && uses_t && single_use(a, t, func.nargs) {
                    a.fmadd[i] = true;
                }
            }
        }
    }

    if !opts.float_chain {
        return;
    }
    for i in 0..insns.len().saturating_sub(1) {
        let (cur, next) = (&insns[i], &insns[i + 1]);
        let Some(t) = cur.ops.first().and_then(Operand::var) else {
            continue;
        };
        let fused = a.fmadd[i] || (i > 0 && a.fmadd[i - 1]) || a.fmadd[i + 1];
        if fused || !is_float_class(func, t) || a.home(t).is_some() || !single_use(a, t, func.nargs) {
            continue;
        }
        if !produces_float(cur.code) || !consumes_float(next.code) {
            continue;
        }
        let reads_t = next
            .ops
            .iter()
            .skip(1)
            .any(|o| *o == Operand::Var(t));
        if reads_t && next.ops.first() != Some(&Operand::Var(t)) {
            a.chained[i] = true;
        }
    }
}

fn produces_float(code: Opcode) -> bool {
    use Opcode::*;
    matches!(code.result_class(), Some(ValueClass::Float | ValueClass::Double))
        && (code.fp_binop().is_some()
            || matches!(code, FNeg | DNeg | FMov | DMov | I2F | I2D | UI2F | UI2D | F2D | D2F | LD2F | LD2D))
}

fn consumes_float(code: Opcode) -> bool {
    use Opcode::*;
    let fp_source = matches!(code.source_class(), Some(ValueClass::Float | ValueClass::Double));
    fp_source
        && (code.fp_binop().is_some()
            || code.compare().is_some()
            || matches!(code, FNeg | DNeg | FMov | DMov | F2I | D2I | F2D | D2F | F2LD | D2LD))
}
