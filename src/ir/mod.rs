// This module holds the shared intermediate representation consumed by the code
// generator: typed operands, the closed opcode set, and the Module/Item/Func containers
// built by the front-end (or by hand in tests). Containers are owned arenas allocated
// through the context allocator and addressed by small integer handles. Validation of
// operand shapes lives here too, so the backend can classify contract violations as
// internal errors before any code is emitted.

//! Shared IR: types, opcodes, operands and module containers.

pub mod display;
pub mod module;
pub mod opcode;
pub mod operand;
pub mod types;
pub mod validate;

pub use display::FuncDisplay;
pub use module::{ir_vec, Func, FuncBuilder, Insn, IrVec, Item, ItemKind, Module, Proto, VarInfo};
pub use opcode::{CmpClass, CmpKind, FpOp, IntOp, Opcode, OverflowOp};
pub use operand::{AliasId, ItemId, LabelId, MemOp, Operand, StrId, VarId};
pub use types::{Type, ValueClass};
pub use validate::validate_module;
