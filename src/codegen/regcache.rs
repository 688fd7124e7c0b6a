// Block-scoped register cache. Within one basic block, stack-homed variables, computed
// `base + index * scale` addresses and float loads from memory may be held in the cache
// pools (RSI, RDI, R8-R10 and XMM3-XMM7) instead of being reloaded at every use. The
// ownership table is a RegisterFile keyed by CacheKey; eviction prefers the entry with
// the fewest reads remaining in the block, which the cache tracks per variable and the
// lowering engine decrements after every instruction. Entries are forgotten at block
// boundaries and calls; dirty variable entries (deferred stores) are handed back to the
// caller for store-back whenever they leave the cache.

//! Per-block register caching of variables, addresses and float fields.

use crate::core::alloc::ContextAlloc;
use crate::core::register_file::{
    AsmReg, Evicted, RegAllocError, RegBank, RegBitSet, RegisterFile,
};
use crate::ir::{ir_vec, IrVec, MemOp, VarId};

/// Integer cache pool.
pub const GP_CACHE_REGS: [AsmReg; 5] = [
    AsmReg::gp(6),
    AsmReg::gp(7),
    AsmReg::gp(8),
    AsmReg::gp(9),
    AsmReg::gp(10),
];

/// Float cache pool.
pub const XMM_CACHE_REGS: [AsmReg; 5] = [
    AsmReg::xmm(3),
    AsmReg::xmm(4),
    AsmReg::xmm(5),
    AsmReg::xmm(6),
    AsmReg::xmm(7),
];

/// What a cache register holds.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheKey {
    /// Current value of a variable.
    Var(VarId),
    /// `base + index * scale`.
    Ind { base: VarId, index: VarId, scale: u8 },
    /// Float value loaded from memory.
    Field(MemOp),
}

impl CacheKey {
    /// Whether the cached value is derived from `v` (but is not `v` itself).
    fn depends_on(&self, v: VarId) -> bool {
        match self {
            CacheKey::Var(_) => false,
            CacheKey::Ind { base, index, .. } => *base == v || *index == v,
            CacheKey::Field(m) => m.uses_var(v),
        }
    }
}

/// Cache registers plus the per-block remaining-read counts.
#[derive(Debug)]
pub struct BlockCache {
    regs: RegisterFile<CacheKey>,
    remaining: IrVec<u32>,
    touched: IrVec<VarId>,
}

impl BlockCache {
    pub fn new(alloc: &ContextAlloc, nvars: usize) -> Self {
        let mut pool = RegBitSet::from_regs(&GP_CACHE_REGS);
        pool.union(&RegBitSet::from_regs(&XMM_CACHE_REGS));
        Self {
            regs: RegisterFile::new(pool),
            remaining: allocator_api2::vec![in alloc.clone(); 0; nvars],
            touched: IrVec::new_in(alloc.clone()),
        }
    }

    /// Reads of `v` left in the current block, including the current instruction.
    pub fn remaining(&self, v: VarId) -> u32 {
        self.remaining.get(v.index()).copied().unwrap_or(0)
    }

    /// Start counting a new block whose reads are `reads`.
    pub fn recount(&mut self, reads: impl IntoIterator<Item = VarId>) {
        for v in self.touched.drain(..) {
            if let Some(r) = self.remaining.get_mut(v.index()) {
                *r = 0;
            }
        }
        for v in reads {
            if let Some(r) = self.remaining.get_mut(v.index()) {
                if *r == 0 {
                    self.touched.push(v);
                }
                *r += 1;
            }
        }
    }

    /// Account for the reads of one finished instruction.
    pub fn consume(&mut self, reads: &[VarId]) {
        for v in reads {
            if let Some(r) = self.remaining.get_mut(v.index()) {
                *r = r.saturating_sub(1);
            }
        }
    }

    /// Register holding `key`, refreshing its LRU stamp and pinning it.
    pub fn lookup(&mut self, key: &CacheKey) -> Option<AsmReg> {
        let reg = self.regs.find(key)?;
        self.regs.touch(reg);
        self.regs.lock(reg);
        Some(reg)
    }

    /// Register holding `key` without touching it.
    pub fn peek(&self, key: &CacheKey) -> Option<AsmReg> {
        self.regs.find(key)
    }

    /// Claim a register of `bank` for `key`. The new register is pinned; a displaced
    /// entry is returned so a dirty variable can be stored back.
    pub fn allocate(
        &mut self,
        bank: RegBank,
        key: CacheKey,
    ) -> Result<(AsmReg, Option<Evicted<CacheKey>>), RegAllocError> {
        let remaining = &self.remaining;
        let (reg, evicted) = self.regs.allocate_reg(bank, key, |k| match k {
            CacheKey::Var(v) => remaining.get(v.index()).copied().unwrap_or(0),
            _ => 1,
        })?;
        self.regs.lock(reg);
        Ok((reg, evicted))
    }

    pub fn lock(&mut self, reg: AsmReg) {
        self.regs.lock(reg);
    }

    pub fn unlock_all(&mut self) {
        self.regs.unlock_all();
    }

    pub fn set_dirty(&mut self, reg: AsmReg, dirty: bool) {
        self.regs.set_dirty(reg, dirty);
    }

    pub fn key_of(&self, reg: AsmReg) -> Option<&CacheKey> {
        self.regs.key_of(reg)
    }

    /// Dirty variables and their registers.
    pub fn dirty_vars(&self) -> IrVec<(AsmReg, VarId)> {
        ir_vec(
            self.touched.allocator(),
            self.regs.dirty_entries().filter_map(|(reg, key)| match key {
                CacheKey::Var(v) => Some((reg, *v)),
                _ => None,
            }),
        )
    }

    /// Drop the entries computed from `v` after it was written.
    pub fn invalidate_dependents(&mut self, v: VarId) {
        self.regs.retain(|k| !k.depends_on(v));
    }

    /// Forget the cached copy of `v` itself, returning it when it was dirty.
    pub fn forget_var(&mut self, v: VarId) -> Option<Evicted<CacheKey>> {
        let reg = self.regs.find(&CacheKey::Var(v))?;
        self.regs.take(reg).ok().filter(|e| e.dirty)
    }

    /// Drop float field entries for which `clobbered` holds.
    pub fn invalidate_fields(&mut self, mut clobbered: impl FnMut(&MemOp) -> bool) {
        self.regs.retain(|k| match k {
            CacheKey::Field(m) => !clobbered(m),
            _ => true,
        });
    }

    /// Forget everything (block boundary or call). Dirty entries must have been flushed.
    pub fn clear(&mut self) {
        self.regs.reset();
    }

    pub fn usage(&self, bank: RegBank) -> (u32, u32, u32) {
        self.regs.bank_usage(bank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register_file::{GP_BANK, XMM_BANK};
    use crate::ir::Type;

    #[test]
    fn test_eviction_prefers_fewest_remaining_reads() {
        let mut cache = BlockCache::new(&ContextAlloc::system(), 8);
        let reads = [0, 0, 0, 1, 2, 2, 3, 4, 5, 5, 5].map(VarId);
        cache.recount(reads);
        assert_eq!(cache.remaining(VarId(0)), 3);
        for v in 0..5 {
            cache.allocate(GP_BANK, CacheKey::Var(VarId(v))).unwrap();
        }
        cache.unlock_all();
        let (_, evicted) = cache.allocate(GP_BANK, CacheKey::Var(VarId(5))).unwrap();
        let evicted = evicted.unwrap();
        // v1, v3 and v4 all have one read left; v1 is the least recently used.
        assert_eq!(evicted.key, CacheKey::Var(VarId(1)));
        assert_eq!(cache.usage(GP_BANK), (5, 1, 5));
    }

    #[test]
    fn test_locked_registers_are_never_evicted() {
        let mut cache = BlockCache::new(&ContextAlloc::system(), 8);
        for v in 0..5 {
            cache.allocate(GP_BANK, CacheKey::Var(VarId(v))).unwrap();
        }
        assert!(cache.allocate(GP_BANK, CacheKey::Var(VarId(6))).is_err());
        assert!(cache.allocate(XMM_BANK, CacheKey::Var(VarId(7))).is_ok());
    }

    #[test]
    fn test_dependents_and_dirty_tracking() {
        let mut cache = BlockCache::new(&ContextAlloc::system(), 4);
        let (a, b, c) = (VarId(0), VarId(1), VarId(2));
        let (r, _) = cache.allocate(GP_BANK, CacheKey::Var(a)).unwrap();
        cache.allocate(GP_BANK, CacheKey::Ind { base: a, index: b, scale: 8 }).unwrap();
        cache
            .allocate(XMM_BANK, CacheKey::Field(MemOp::based(Type::D, c, 8)))
            .unwrap();
        cache.set_dirty(r, true);
        assert_eq!(cache.dirty_vars()[..], [(r, a)]);

        cache.invalidate_dependents(b);
        assert!(cache.peek(&CacheKey::Ind { base: a, index: b, scale: 8 }).is_none());
        assert!(cache.peek(&CacheKey::Var(a)).is_some());

        let store = MemOp::based(Type::D, c, 8);
        cache.invalidate_fields(|m| m.may_alias(&store));
        assert!(cache.peek(&CacheKey::Field(store)).is_none());

        let evicted = cache.forget_var(a).unwrap();
        assert!(evicted.dirty);
        assert!(cache.dirty_vars().is_empty());
    }

    #[test]
    fn test_consume_counts_down() {
        let mut cache = BlockCache::new(&ContextAlloc::system(), 2);
        cache.recount([VarId(1), VarId(1)]);
        cache.consume(&[VarId(1)]);
        assert_eq!(cache.remaining(VarId(1)), 1);
        cache.recount([]);
        assert_eq!(cache.remaining(VarId(1)), 0);
    }
}
