//! c2jit - C to native x86-64 code, in memory.
//!
//! c2jit compiles a C subset straight into executable memory: a small front-end
//! produces a typed IR module, and a single-pass lowering engine turns each function
//! into machine code with sixteen independently selectable optimizations. Compiled
//! functions are called through plain function pointers; there is no object file and
//! no linker step.
//!
//! # Primary Usage
//!
//! ```ignore
//! use c2jit::{compile_str, get_entry, CompileOptions, Context, OptFlags};
//!
//! let mut ctx = Context::default();
//! let opts = CompileOptions { opt: OptFlags::standard(), ..Default::default() };
//! if compile_str(&mut ctx, &opts, "int main(void) { return 42; }", "answer.c") {
//!     let main = get_entry(&ctx, "main").expect("main is defined");
//!     assert_eq!(unsafe { main.call(0, std::ptr::null_mut()) }, 42);
//! }
//! ```
//!
//! # Architecture
//!
//! - [`frontend`] - Preprocessor, lexer, parser, semantic checks and IR generation
//! - [`ir`] - Modules, items, functions, instructions and operands
//! - [`codegen`] - Lowering engine, register caches, inlining and linking
//! - [`x64`] - Instruction encoding, calling convention and executable memory
//! - [`core`] - Context, allocation, diagnostics, options and statistics
//! - [`entry`] - Entry-point lookup

pub mod codegen;
pub mod compile;
pub mod core;
pub mod entry;
pub mod frontend;
pub mod ir;
pub mod x64;

pub use compile::{compile, compile_str};
pub use core::{
    // Session
    CompiledModule, Context, ModuleId, SessionStats, StatEvent,
    // Allocation
    AllocStr, ContextAlloc, ErrorHandler, ResourceAllocator, ResourceError, SystemAllocator,
    // Configuration
    CompileOptions, MacroCommand, OptFlags, TargetCaps,
    // Diagnostics and errors
    CompileError, CompileResult, MessageSink,
};
pub use entry::{get_entry, EntryPoint};
