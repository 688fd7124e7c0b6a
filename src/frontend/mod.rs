// The C front-end: preprocessing, lexing, parsing, semantic checking and IR
// generation. Each stage consumes the previous stage's output and reports user errors
// to the compile call's Diagnostics; the parser stops at the first syntax error, while
// the preprocessor and the semantic checker keep going so that one run reports as many
// problems as possible. The IR generator only runs on a unit that passed the checker,
// so it never reports user errors of its own.

//! C front-end.

pub mod ast;
pub mod ctype;
pub mod headers;
pub mod irgen;
pub mod lexer;
pub mod parser;
pub mod preprocess;
pub mod sema;

use crate::core::diagnostics::SourcePos;
use thiserror::Error;

/// Errors raised while preprocessing.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PreprocessError {
    #[error("#include file \"{0}\" not found")]
    IncludeNotFound(String),
    #[error("#include nested too deeply")]
    IncludeDepth,
    #[error("#include expects \"FILENAME\" or <FILENAME>")]
    BadInclude,
    #[error("unterminated conditional directive")]
    UnterminatedConditional,
    #[error("{0} without #if")]
    Stray(String),
    #[error("#error {0}")]
    ErrorDirective(String),
    #[error("invalid preprocessing directive #{0}")]
    UnknownDirective(String),
    #[error("macro names must be identifiers")]
    BadDefine,
    #[error("invalid #if expression: {0}")]
    BadCondition(String),
}

/// A lexing or parsing error at a source position.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{msg}")]
pub struct SyntaxError {
    pub pos: SourcePos,
    pub msg: String,
}

impl SyntaxError {
    pub fn new(pos: SourcePos, msg: impl Into<String>) -> Self {
        Self { pos, msg: msg.into() }
    }
}

pub type SyntaxResult<T> = Result<T, SyntaxError>;
