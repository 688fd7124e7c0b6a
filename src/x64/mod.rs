// x86-64 target layer. Everything here knows about machine registers and bytes but not
// about the IR: the encoder places instructions through iced-x86, the calling convention
// decides where System V arguments and results live, function_codegen writes prologues
// and epilogues around a finished body, and exec_memory maps the result executable.

//! x86-64 encoding, ABI and executable memory.

pub mod calling_convention;
pub mod encoder;
pub mod exec_memory;
pub mod function_codegen;

pub use calling_convention::{CCAssigner, CCAssignment, RegBank, SysVAssigner};
pub use encoder::{EncodingError, JumpCondition, X64Encoder};
pub use exec_memory::ExecBuffer;
pub use function_codegen::FunctionCodegen;
