// This module gathers the infrastructure every other part of the compiler leans on: the
// pluggable allocation strategy and the allocator handle threaded through all IR and
// table storage, the compilation context that owns modules and their native code, the
// diagnostics reporter and its shared message sink, the error taxonomy, compile options
// and the sixteen optimization toggles, the register bookkeeping shared by the frame
// layout and the block-local caches, and the per-module session that hands the
// allocator to per-function scratch and counts what lowering did.

//! Shared compiler infrastructure.
//!
//! ## Allocation (`alloc`)
//! - `ResourceAllocator` strategy objects, `SystemAllocator` as the default
//! - `ContextAlloc`, the `allocator_api2` handle with the non-returning error hook
//! - `AllocStr`, names stored in context memory
//!
//! ## Context (`context`)
//! - Module list, host symbols, alias interning, user data and statistics
//!
//! ## Register Bookkeeping (`register_file`)
//! - Per-bank bitsets and clock-based eviction for the register caches
//!
//! ## Session (`session`)
//! - Allocator handle for per-function scratch
//! - Statistics printed in verbose mode

pub mod alloc;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod options;
pub mod register_file;
pub mod session;

pub use alloc::{AllocStr, ContextAlloc, ErrorHandler, ResourceAllocator, ResourceError, SystemAllocator};
pub use context::{CompiledModule, Context, ModuleId};
pub use diagnostics::{Diagnostics, MessageSink, SourcePos};
pub use error::{CompileError, CompileResult};
pub use options::{ActiveOpts, CompileOptions, MacroCommand, OptFlags, TargetCaps};
pub use register_file::{AsmReg, RegBitSet, RegisterFile};
pub use session::{CompilationSession, SessionStats, StatEvent};
