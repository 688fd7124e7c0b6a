//! Register bookkeeping for block-local caching.
//!
//! The RegisterFile tracks which cache key owns each register of the cache pools, which
//! registers hold values not yet written back (dirty), which registers the current
//! instruction is using (locked), and a use clock for LRU ordering. Victims are chosen
//! by the fewest remaining uses in the current block, ties broken by least recent use.

/// Maximum number of register banks supported (GP, XMM).
pub const MAX_REGISTER_BANKS: usize = 2;

/// Number of registers per bank on x86-64.
pub const REGS_PER_BANK: usize = 16;

const TOTAL_REGS: usize = REGS_PER_BANK * MAX_REGISTER_BANKS;

/// Type for register bank indices.
pub type RegBank = u8;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Bank of general-purpose registers.
pub const GP_BANK: RegBank = 0;

/// Bank of SSE registers.
pub const XMM_BANK: RegBank = 1;

/// Combined register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: RegId) -> Self {
        Self::new(GP_BANK, id)
    }

    pub const fn xmm(id: RegId) -> Self {
        Self::new(XMM_BANK, id)
    }

    /// Get the linear register index for array indexing.
    pub fn linear_index(&self) -> usize {
        (self.bank as usize) * REGS_PER_BANK + (self.id as usize)
    }

    /// Create from linear index.
    pub fn from_linear_index(index: usize) -> Self {
        let bank = (index / REGS_PER_BANK) as RegBank;
        let id = (index % REGS_PER_BANK) as RegId;
        Self { bank, id }
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u32; MAX_REGISTER_BANKS],
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &r in regs {
            set.set(r);
        }
        set
    }

    pub fn contains(&self, reg: AsmReg) -> bool {
        (reg.bank as usize) < MAX_REGISTER_BANKS && self.banks[reg.bank as usize] & (1 << reg.id) != 0
    }

    pub fn set(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS {
            self.banks[reg.bank as usize] |= 1 << reg.id;
        }
    }

    pub fn clear(&mut self, reg: AsmReg) {
        if (reg.bank as usize) < MAX_REGISTER_BANKS {
            self.banks[reg.bank as usize] &= !(1 << reg.id);
        }
    }

    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..MAX_REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        self.banks.get(bank as usize).map_or(0, |b| b.count_ones())
    }

    /// Registers of `bank` in ascending id order.
    pub fn iter_bank(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        let bits = self.banks.get(bank as usize).copied().unwrap_or(0);
        (0..REGS_PER_BANK as RegId)
            .filter(move |id| bits & (1 << id) != 0)
            .map(move |id| AsmReg::new(bank, id))
    }

    pub fn clear_all(&mut self) {
        self.banks.fill(0);
    }
}

/// Error types for register allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAllocError {
    /// Every register of the bank is locked by the current instruction.
    NoRegistersAvailable,
    /// Register is not allocated.
    RegisterNotAllocated,
    /// Register outside the allocatable pool.
    InvalidRegister,
}

impl std::fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegAllocError::NoRegistersAvailable => write!(f, "no cache register available"),
            RegAllocError::RegisterNotAllocated => write!(f, "register is not allocated"),
            RegAllocError::InvalidRegister => write!(f, "register outside the cache pool"),
        }
    }
}

impl std::error::Error for RegAllocError {}

/// An entry pushed out of its register to make room for another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted<K> {
    pub reg: AsmReg,
    pub key: K,
    pub dirty: bool,
}

/// Ownership table for the cache registers of one function.
#[derive(Debug, Clone)]
pub struct RegisterFile<K> {
    allocatable: RegBitSet,
    used: RegBitSet,
    locked: RegBitSet,
    dirty: RegBitSet,
    assignments: [Option<K>; TOTAL_REGS],
    last_use: [u64; TOTAL_REGS],
    clock: u64,
}

impl<K: Clone + PartialEq> RegisterFile<K> {
    pub fn new(allocatable: RegBitSet) -> Self {
        Self {
            allocatable,
            used: RegBitSet::new(),
            locked: RegBitSet::new(),
            dirty: RegBitSet::new(),
            assignments: std::array::from_fn(|_| None),
            last_use: [0; TOTAL_REGS],
            clock: 0,
        }
    }

    /// Allocate a register of `bank` for `key`.
    ///
    /// A free register is preferred. Otherwise the unlocked register whose key has the
    /// fewest `remaining` uses is evicted, ties going to the least recently used one;
    /// the caller must store the evicted value back when it is dirty.
    pub fn allocate_reg(
        &mut self,
        bank: RegBank,
        key: K,
        remaining: impl Fn(&K) -> u32,
    ) -> Result<(AsmReg, Option<Evicted<K>>), RegAllocError> {
        let free = self
            .allocatable
            .iter_bank(bank)
            .find(|r| !self.used.contains(*r) && !self.locked.contains(*r));
        if let Some(reg) = free {
            self.assign(reg, key);
            return Ok((reg, None));
        }

        let victim = self
            .allocatable
            .iter_bank(bank)
            .filter(|r| !self.locked.contains(*r))
            .filter_map(|r| {
                let k = self.assignments[r.linear_index()].as_ref()?;
                Some((remaining(k), self.last_use[r.linear_index()], r))
            })
            .min_by_key(|&(uses, stamp, _)| (uses, stamp))
            .map(|(_, _, r)| r)
            .ok_or(RegAllocError::NoRegistersAvailable)?;

        let evicted = self.take(victim)?;
        self.assign(victim, key);
        Ok((victim, Some(evicted)))
    }

    fn assign(&mut self, reg: AsmReg, key: K) {
        let idx = reg.linear_index();
        self.used.set(reg);
        self.dirty.clear(reg);
        self.assignments[idx] = Some(key);
        self.touch(reg);
    }

    /// Remove the entry held by `reg`, returning it.
    pub fn take(&mut self, reg: AsmReg) -> Result<Evicted<K>, RegAllocError> {
        if !self.allocatable.contains(reg) {
            return Err(RegAllocError::InvalidRegister);
        }
        let key = self.assignments[reg.linear_index()]
            .take()
            .ok_or(RegAllocError::RegisterNotAllocated)?;
        let dirty = self.dirty.contains(reg);
        self.used.clear(reg);
        self.dirty.clear(reg);
        self.locked.clear(reg);
        Ok(Evicted { reg, key, dirty })
    }

    /// Register currently holding `key`.
    pub fn find(&self, key: &K) -> Option<AsmReg> {
        self.assignments
            .iter()
            .position(|a| a.as_ref() == Some(key))
            .map(AsmReg::from_linear_index)
    }

    pub fn key_of(&self, reg: AsmReg) -> Option<&K> {
        self.assignments.get(reg.linear_index())?.as_ref()
    }

    /// Record a use for LRU ordering.
    pub fn touch(&mut self, reg: AsmReg) {
        self.clock += 1;
        self.last_use[reg.linear_index()] = self.clock;
    }

    pub fn set_dirty(&mut self, reg: AsmReg, dirty: bool) {
        if dirty && self.used.contains(reg) {
            self.dirty.set(reg);
        } else {
            self.dirty.clear(reg);
        }
    }

    pub fn is_dirty(&self, reg: AsmReg) -> bool {
        self.dirty.contains(reg)
    }

    /// Pin `reg` for the current instruction.
    pub fn lock(&mut self, reg: AsmReg) {
        if self.allocatable.contains(reg) {
            self.locked.set(reg);
        }
    }

    pub fn unlock_all(&mut self) {
        self.locked.clear_all();
    }

    /// Dirty entries, in register order.
    pub fn dirty_entries(&self) -> impl Iterator<Item = (AsmReg, &K)> + '_ {
        (0..TOTAL_REGS)
            .map(AsmReg::from_linear_index)
            .filter(|r| self.dirty.contains(*r))
            .filter_map(|r| Some((r, self.assignments[r.linear_index()].as_ref()?)))
    }

    /// Drop every entry for which `keep` returns false, returning how many went.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let mut dropped = 0;
        for idx in 0..TOTAL_REGS {
            let remove = matches!(&self.assignments[idx], Some(k) if !keep(k));
            if remove && self.take(AsmReg::from_linear_index(idx)).is_ok() {
                dropped += 1;
            }
        }
        dropped
    }

    /// Get register usage statistics for a bank: (used, locked, total).
    pub fn bank_usage(&self, bank: RegBank) -> (u32, u32, u32) {
        (
            self.used.count_in_bank(bank),
            self.locked.count_in_bank(bank),
            self.allocatable.count_in_bank(bank),
        )
    }

    /// Forget every entry (block boundary).
    pub fn reset(&mut self) {
        self.used.clear_all();
        self.locked.clear_all();
        self.dirty.clear_all();
        self.assignments.fill(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_regfile() -> RegisterFile<u32> {
        // Three GP registers and two XMM registers
        let allocatable = RegBitSet::from_regs(&[
            AsmReg::gp(6),
            AsmReg::gp(7),
            AsmReg::gp(8),
            AsmReg::xmm(3),
            AsmReg::xmm(4),
        ]);
        RegisterFile::new(allocatable)
    }

    #[test]
    fn test_regbitset_operations() {
        let mut set = RegBitSet::new();
        let reg = AsmReg::new(0, 5);

        assert!(!set.contains(reg));
        set.set(reg);
        assert!(set.contains(reg));
        set.clear(reg);
        assert!(!set.contains(reg));
        assert_eq!(AsmReg::from_linear_index(AsmReg::xmm(9).linear_index()), AsmReg::xmm(9));
    }

    #[test]
    fn test_register_allocation() {
        let mut regfile = create_test_regfile();

        let (reg1, ev) = regfile.allocate_reg(GP_BANK, 100, |_| 0).unwrap();
        assert!(ev.is_none());
        assert_eq!(reg1, AsmReg::gp(6));
        let (reg2, _) = regfile.allocate_reg(GP_BANK, 101, |_| 0).unwrap();
        assert_ne!(reg1, reg2);
        let (x, _) = regfile.allocate_reg(XMM_BANK, 200, |_| 0).unwrap();
        assert_eq!(x, AsmReg::xmm(3));

        assert_eq!(regfile.find(&100), Some(reg1));
        assert_eq!(regfile.key_of(reg2), Some(&101));
        assert_eq!(regfile.bank_usage(GP_BANK), (2, 0, 3));
    }

    #[test]
    fn test_released_register_is_reused_first() {
        let mut regfile = create_test_regfile();
        let (a, _) = regfile.allocate_reg(GP_BANK, 1, |_| 0).unwrap();
        regfile.allocate_reg(GP_BANK, 2, |_| 0).unwrap();
        regfile.take(a).unwrap();
        let (again, evicted) = regfile.allocate_reg(GP_BANK, 3, |_| 0).unwrap();
        assert_eq!(again, a);
        assert!(evicted.is_none());
        assert_eq!(regfile.key_of(a), Some(&3));
    }

    #[test]
    fn test_victim_prefers_fewest_remaining_uses() {
        let mut regfile = create_test_regfile();
        for key in [1, 2, 3] {
            regfile.allocate_reg(GP_BANK, key, |_| 0).unwrap();
        }
        let reg2 = regfile.find(&2).unwrap();
        regfile.set_dirty(reg2, true);

        // Key 2 has no remaining uses; keys 1 and 3 are still needed.
        let (reg, evicted) = regfile
            .allocate_reg(GP_BANK, 4, |k| if *k == 2 { 0 } else { 5 })
            .unwrap();
        let evicted = evicted.unwrap();
        assert_eq!(reg, reg2);
        assert_eq!(evicted.key, 2);
        assert!(evicted.dirty);
        assert!(!regfile.is_dirty(reg));
    }

    #[test]
    fn test_lru_breaks_ties_and_locks_are_respected() {
        let mut regfile = create_test_regfile();
        for key in [1, 2, 3] {
            regfile.allocate_reg(GP_BANK, key, |_| 0).unwrap();
        }
        let r1 = regfile.find(&1).unwrap();
        let r2 = regfile.find(&2).unwrap();
        regfile.touch(r1);
        regfile.lock(r2);

        // Equal remaining uses: oldest unlocked entry is key 3.
        let (_, evicted) = regfile.allocate_reg(GP_BANK, 4, |_| 1).unwrap();
        assert_eq!(evicted.unwrap().key, 3);

        regfile.lock(r1);
        let r4 = regfile.find(&4).unwrap();
        regfile.lock(r4);
        assert_eq!(
            regfile.allocate_reg(GP_BANK, 5, |_| 1),
            Err(RegAllocError::NoRegistersAvailable)
        );
        regfile.unlock_all();
        assert!(regfile.allocate_reg(GP_BANK, 5, |_| 1).is_ok());
    }

    #[test]
    fn test_retain_and_dirty_entries() {
        let mut regfile = create_test_regfile();
        let (a, _) = regfile.allocate_reg(GP_BANK, 10, |_| 0).unwrap();
        let (b, _) = regfile.allocate_reg(GP_BANK, 11, |_| 0).unwrap();
        regfile.set_dirty(a, true);
        assert_eq!(regfile.dirty_entries().collect::<Vec<_>>(), vec![(a, &10)]);

        assert_eq!(regfile.retain(|k| *k != 11), 1);
        assert_eq!(regfile.find(&11), None);
        assert_eq!(regfile.key_of(b), None);

        regfile.reset();
        assert_eq!(regfile.dirty_entries().count(), 0);
        assert_eq!(regfile.take(a), Err(RegAllocError::RegisterNotAllocated));
    }
}
