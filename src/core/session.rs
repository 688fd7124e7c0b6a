// One code-generation run over a module. The session carries the context allocation
// handle that per-function scratch (frame layouts, analysis tables, cache state) is
// drawn from, so a custom ResourceAllocator sees and bounds everything lowering
// allocates, and it counts what happened while lowering: functions and code bytes, IR
// instructions per opcode, and one counter per StatEvent recording how often a cache or
// an optimization actually fired. The session is shared by reference between the
// module driver, the inliner and every function lowering, hence the interior
// mutability. The context folds each module's SessionStats into its running total,
// which verbose mode prints.

//! Code generation session and statistics.

use super::alloc::{AllocStr, ContextAlloc};
use crate::ir::Opcode;
use std::cell::RefCell;
use std::fmt;

macro_rules! stat_events {
    ($($event:ident => $label:literal),* $(,)?) => {
        /// Optimization and allocation events counted by the session.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum StatEvent {
            $($event),*
        }

        impl StatEvent {
            pub const ALL: &'static [StatEvent] = &[$(StatEvent::$event),*];

            pub fn label(self) -> &'static str {
                match self {
                    $(StatEvent::$event => $label),*
                }
            }
        }
    };
}

stat_events! {
    CacheHit => "cache hits",
    Spill => "dirty write-backs on eviction",
    FusedBranch => "fused compare-branches",
    StrengthReduced => "strength reductions",
    MagicDivision => "magic divisions",
    FusedMultiplyAdd => "fused multiply-adds",
    InlinedCall => "inlined calls",
    PromotedVar => "promoted variables",
    CommutedOperands => "commuted operands",
    ChainedFloat => "chained float results",
}

/// State shared by every function lowered in one module.
pub struct CompilationSession {
    alloc: ContextAlloc,
    stats: RefCell<SessionStats>,
    function: RefCell<Option<AllocStr>>,
}

impl CompilationSession {
    pub fn new(alloc: &ContextAlloc) -> Self {
        Self {
            alloc: alloc.clone(),
            stats: RefCell::new(SessionStats::default()),
            function: RefCell::new(None),
        }
    }

    /// Allocation handle for per-function scratch.
    pub fn alloc(&self) -> &ContextAlloc {
        &self.alloc
    }

    /// Note the function whose events follow.
    pub fn begin_function(&self, name: &str) {
        *self.function.borrow_mut() = Some(AllocStr::new(&self.alloc, name));
    }

    pub fn current_function(&self) -> AllocStr {
        self.function
            .borrow()
            .clone()
            .unwrap_or_else(|| AllocStr::new(&self.alloc, "<module>"))
    }

    pub fn record_function_compiled(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions += 1;
        stats.code_bytes += code_size;
        if stats.largest.as_ref().map_or(true, |(_, size)| *size < code_size) {
            stats.largest = Some((AllocStr::new(&self.alloc, name), code_size));
        }
    }

    pub fn record_instruction_compiled(&self, opcode: Opcode) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions += 1;
        stats.per_opcode[opcode as usize] += 1;
    }

    pub fn record(&self, event: StatEvent) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("{}: {}", self.current_function(), event.label());
        }
        self.stats.borrow_mut().events[event as usize] += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Counters of one or more code-generation runs.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub functions: usize,
    /// Machine code bytes placed.
    pub code_bytes: usize,
    /// IR instructions lowered.
    pub instructions: usize,
    /// Biggest function so far and its size in bytes.
    pub largest: Option<(AllocStr, usize)>,
    per_opcode: [usize; Opcode::ALL.len()],
    events: [usize; StatEvent::ALL.len()],
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            functions: 0,
            code_bytes: 0,
            instructions: 0,
            largest: None,
            per_opcode: [0; Opcode::ALL.len()],
            events: [0; StatEvent::ALL.len()],
        }
    }
}

impl SessionStats {
    pub fn count(&self, event: StatEvent) -> usize {
        self.events[event as usize]
    }

    /// Instructions lowered with `opcode`.
    pub fn lowered(&self, opcode: Opcode) -> usize {
        self.per_opcode[opcode as usize]
    }

    /// Fold another module's statistics into these.
    pub fn merge(&mut self, other: &SessionStats) {
        self.functions += other.functions;
        self.code_bytes += other.code_bytes;
        self.instructions += other.instructions;
        for (mine, theirs) in self.per_opcode.iter_mut().zip(other.per_opcode) {
            *mine += theirs;
        }
        if let Some((name, size)) = &other.largest {
            if self.largest.as_ref().map_or(true, |(_, mine)| mine < size) {
                self.largest = Some((name.clone(), *size));
            }
        }
        for (mine, theirs) in self.events.iter_mut().zip(other.events) {
            *mine += theirs;
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} functions, {} IR instructions, {} code bytes",
            self.functions, self.instructions, self.code_bytes
        )?;
        if let Some((name, size)) = &self.largest {
            writeln!(f, "  largest: {name} ({size} bytes)")?;
        }
        for &event in StatEvent::ALL {
            let n = self.count(event);
            if n > 0 {
                writeln!(f, "  {}: {n}", event.label())?;
            }
        }
        // Hottest opcodes first, by name within a count.
        let mut hottest = [(0usize, ""); 8];
        for &op in Opcode::ALL {
            let entry = (self.lowered(op), op.name());
            if entry.0 == 0 {
                continue;
            }
            if let Some(pos) = hottest.iter().position(|h| h.0 < entry.0 || (h.0 == entry.0 && h.1 > entry.1)) {
                hottest[pos..].rotate_right(1);
                hottest[pos] = entry;
            }
        }
        for (count, name) in hottest.iter().take_while(|h| h.0 > 0) {
            writeln!(f, "  {name:>10} x{count}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_attributed() {
        let alloc = ContextAlloc::system();
        let session = CompilationSession::new(&alloc);
        assert_eq!(session.current_function(), "<module>");
        session.begin_function("loop");
        assert_eq!(session.current_function(), "loop");

        session.record_instruction_compiled(Opcode::Add);
        session.record_instruction_compiled(Opcode::Lt);
        session.record_instruction_compiled(Opcode::Add);
        session.record(StatEvent::CacheHit);
        session.record(StatEvent::CacheHit);
        session.record(StatEvent::MagicDivision);

        let stats = session.stats();
        assert_eq!(stats.instructions, 3);
        assert_eq!(stats.lowered(Opcode::Add), 2);
        assert_eq!(stats.lowered(Opcode::Sub), 0);
        assert_eq!(stats.count(StatEvent::CacheHit), 2);
        assert_eq!(stats.count(StatEvent::MagicDivision), 1);
        assert_eq!(stats.count(StatEvent::Spill), 0);
    }

    #[test]
    fn test_merge_keeps_largest_and_sums() {
        let alloc = ContextAlloc::system();
        let a = CompilationSession::new(&alloc);
        a.record_function_compiled("small", 40);
        a.record_function_compiled("factorial", 256);
        a.record(StatEvent::InlinedCall);
        a.record_instruction_compiled(Opcode::Mul);
        let b = CompilationSession::new(&alloc);
        b.record_function_compiled("medium", 100);
        b.record(StatEvent::InlinedCall);
        b.record_instruction_compiled(Opcode::Mul);
        b.record_instruction_compiled(Opcode::Ret);

        let mut total = SessionStats::default();
        total.merge(&b.stats());
        total.merge(&a.stats());
        assert_eq!(total.functions, 3);
        assert_eq!(total.code_bytes, 396);
        assert_eq!(total.largest.as_ref().map(|(n, s)| (n.as_str(), *s)), Some(("factorial", 256)));
        assert_eq!(total.count(StatEvent::InlinedCall), 2);

        let text = total.to_string();
        assert!(text.starts_with("3 functions"));
        assert!(text.contains("factorial (256 bytes)"));
        assert!(text.contains("inlined calls: 2"));
        assert!(!text.contains("cache hits"));
        let mul = text.find("mul x2").unwrap();
        let ret = text.find("ret x1").unwrap();
        assert!(mul < ret);
    }
}
