// This module defines the error types of the c2jit backend using the thiserror crate.
// CompileError is the main enum for everything that can go wrong after the frontend has
// handed over IR: violations of the IR contract (malformed operands, unresolved labels),
// operand combinations with no legal x86-64 encoding, encoder failures, failure to map
// executable memory, and undefined symbols at link time. Only UndefinedSymbol is a
// user-facing diagnostic; the rest are internal compiler errors and is_internal()
// lets the driver format them distinctly. CompileResult<T> is the usual alias.

//! Error types for the c2jit backend.

use crate::x64::encoder::EncodingError;
use thiserror::Error;

/// Main error type for IR validation, code generation and linking.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("malformed IR in {function}: {reason}")]
    MalformedIr { function: String, reason: String },

    #[error("no encoding for {opcode} with operands {operands} in {function}")]
    Unencodable {
        function: String,
        opcode: String,
        operands: String,
    },

    #[error("unresolved label L{label} in {function}")]
    UnresolvedLabel { function: String, label: u32 },

    #[error("undefined symbol '{name}'")]
    UndefinedSymbol { name: String },

    #[error("encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("executable memory: {reason}")]
    ExecMemory { reason: String },

    #[error("{reason}")]
    Internal { reason: String },
}

impl CompileError {
    /// Whether this error signals a broken IR contract or backend bug rather than a
    /// problem in the user's program.
    pub fn is_internal(&self) -> bool {
        !matches!(self, CompileError::UndefinedSymbol { .. })
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        CompileError::Internal {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let user = CompileError::UndefinedSymbol {
            name: "frobnicate".into(),
        };
        assert!(!user.is_internal());
        assert_eq!(user.to_string(), "undefined symbol 'frobnicate'");

        let label = CompileError::UnresolvedLabel {
            function: "main".into(),
            label: 7,
        };
        assert!(label.is_internal());
        assert_eq!(label.to_string(), "unresolved label L7 in main");

        let enc: CompileError = EncodingError::InvalidMemoryOperand.into();
        assert!(enc.is_internal());
    }
}
