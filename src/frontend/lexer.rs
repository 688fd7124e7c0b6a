// Tokens of preprocessed C source. The token enum is derived with logos: keywords are
// fixed tokens that win over the identifier pattern, literals carry their decoded value,
// and every C punctuator has its own variant. Line markers written by the preprocessor
// ("# 12 \"file.c\"") and newlines are tokens too, so the driver loop in `tokenize` can
// keep track of the file and line each token comes from; neither reaches the parser.

//! C lexer.

use super::{SyntaxError, SyntaxResult};
use crate::core::diagnostics::SourcePos;
use logos::Logos;
use std::fmt;
use std::sync::Arc;

/// Integer literal with its suffix flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLit {
    pub value: u64,
    pub unsigned: bool,
    pub long: bool,
    /// Written in hex or octal, which lets unsuffixed values become unsigned.
    pub radix_prefixed: bool,
}

/// Floating literal: `f` suffix makes it float, `l` long double.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatLit {
    pub value: f64,
    pub suffix: FloatSuffix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatSuffix {
    None,
    F,
    L,
}

fn parse_int(text: &str) -> Option<IntLit> {
    let digits_end = text
        .find(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'))
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(digits_end);
    let (value, radix_prefixed) = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (u64::from_str_radix(hex, 16).ok()?, true)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (u64::from_str_radix(&digits[1..], 8).ok()?, true)
    } else {
        (digits.parse().ok()?, false)
    };
    let lower = suffix.to_ascii_lowercase();
    if !matches!(lower.as_str(), "" | "u" | "l" | "ul" | "lu" | "ll" | "ull" | "llu") {
        return None;
    }
    Some(IntLit {
        value,
        unsigned: lower.contains('u'),
        long: lower.contains('l'),
        radix_prefixed,
    })
}

fn parse_float(text: &str) -> Option<FloatLit> {
    let (body, suffix) = match text.as_bytes().last() {
        Some(b'f' | b'F') => (&text[..text.len() - 1], FloatSuffix::F),
        Some(b'l' | b'L') => (&text[..text.len() - 1], FloatSuffix::L),
        _ => (text, FloatSuffix::None),
    };
    Some(FloatLit {
        value: body.parse().ok()?,
        suffix,
    })
}

/// Decode the escapes of a string or character literal body.
pub fn unescape(body: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        if b != b'\\' {
            out.push(b);
            continue;
        }
        let e = *bytes.get(i)?;
        i += 1;
        let v = match e {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'e' => 0x1b,
            b'\\' | b'\'' | b'"' | b'?' => e,
            b'x' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
                u32::from_str_radix(&body[start..i], 16).ok()? as u8
            }
            b'0'..=b'7' => {
                let start = i - 1;
                while i < bytes.len() && i - start < 3 && (b'0'..=b'7').contains(&bytes[i]) {
                    i += 1;
                }
                u32::from_str_radix(&body[start..i], 8).ok()? as u8
            }
            _ => return None,
        };
        out.push(v);
    }
    Some(out)
}

/// Value of a character constant such as `'a'` or `'\n'` (plain char is signed).
pub fn char_value(text: &str) -> Option<i64> {
    let body = text.strip_prefix('L').unwrap_or(text);
    let body = body.strip_prefix('\'')?.strip_suffix('\'')?;
    let bytes = unescape(body)?;
    match bytes.as_slice() {
        [] => None,
        [b] => Some(*b as i8 as i64),
        many => Some(many.iter().fold(0i64, |acc, b| (acc << 8) | *b as i64) as i32 as i64),
    }
}

fn parse_marker(text: &str) -> Option<(u32, String)> {
    let rest = text.trim_start_matches('#').trim_start();
    let (line, rest) = rest.split_once(|c: char| c == ' ' || c == '\t')?;
    let rest = rest.trim_start().strip_prefix('"')?;
    let file = &rest[..rest.find('"')?];
    Some((line.parse().ok()?, file.to_string()))
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\x0b\x0c]+")]
pub enum Token {
    #[token("\n")]
    Newline,
    #[regex(r#"#[ \t]*[0-9]+[ \t]+"[^"\n]*"[^\n]*"#, |lex| parse_marker(lex.slice()))]
    LineMarker((u32, String)),

    // --- Keywords ---
    #[token("auto")]
    Auto,
    #[token("break")]
    Break,
    #[token("case")]
    Case,
    #[token("char")]
    Char,
    #[token("const")]
    Const,
    #[token("continue")]
    Continue,
    #[token("default")]
    Default,
    #[token("do")]
    Do,
    #[token("double")]
    Double,
    #[token("else")]
    Else,
    #[token("enum")]
    Enum,
    #[token("extern")]
    Extern,
    #[token("float")]
    Float,
    #[token("for")]
    For,
    #[token("goto")]
    Goto,
    #[token("if")]
    If,
    #[token("inline")]
    #[token("__inline")]
    #[token("__inline__")]
    Inline,
    #[token("int")]
    Int,
    #[token("long")]
    Long,
    #[token("register")]
    Register,
    #[token("restrict")]
    #[token("__restrict")]
    Restrict,
    #[token("return")]
    Return,
    #[token("short")]
    Short,
    #[token("signed")]
    #[token("__signed__")]
    Signed,
    #[token("sizeof")]
    Sizeof,
    #[token("static")]
    Static,
    #[token("struct")]
    Struct,
    #[token("switch")]
    Switch,
    #[token("typedef")]
    Typedef,
    #[token("union")]
    Union,
    #[token("unsigned")]
    Unsigned,
    #[token("void")]
    Void,
    #[token("volatile")]
    Volatile,
    #[token("while")]
    While,
    #[token("_Bool")]
    Bool,

    // va_list support
    #[token("__builtin_va_list")]
    VaList,
    #[token("__builtin_va_start")]
    VaStart,
    #[token("__builtin_va_arg")]
    VaArg,
    #[token("__builtin_va_end")]
    VaEnd,
    #[token("__builtin_va_copy")]
    VaCopy,

    // --- Identifiers and literals ---
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"(0[xX][0-9a-fA-F]+|[0-9]+)[uUlL]*", |lex| parse_int(lex.slice()))]
    IntLit(IntLit),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?[fFlL]?", |lex| parse_float(lex.slice()))]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?[fFlL]?", |lex| parse_float(lex.slice()))]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+[fFlL]?", |lex| parse_float(lex.slice()))]
    FloatLit(FloatLit),

    #[regex(r"L?'([^'\\\n]|\\.)+'", |lex| char_value(lex.slice()))]
    CharLit(i64),

    #[regex(r#"L?"([^"\\\n]|\\.)*""#, |lex| {
        let s = lex.slice();
        let s = s.strip_prefix('L').unwrap_or(s);
        unescape(&s[1..s.len() - 1])
    })]
    StrLit(Vec<u8>),

    // --- Punctuators ---
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(".")]
    Dot,
    #[token("->")]
    Arrow,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("&")]
    Amp,
    #[token("*")]
    Star,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("~")]
    Tilde,
    #[token("!")]
    Bang,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,
    #[token("^")]
    Caret,
    #[token("|")]
    Pipe,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token("...")]
    Ellipsis,
    #[token("=")]
    Assign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,
    #[token("&=")]
    AmpAssign,
    #[token("^=")]
    CaretAssign,
    #[token("|=")]
    PipeAssign,
    #[token(",")]
    Comma,
    #[token("#")]
    Hash,

    /// End of input, appended by [`tokenize`].
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Ident(name) => return write!(f, "{name}"),
            Token::IntLit(lit) => return write!(f, "{}", lit.value),
            Token::FloatLit(lit) => return write!(f, "{}", lit.value),
            Token::CharLit(v) => return write!(f, "character constant {v}"),
            Token::StrLit(_) => "string literal",
            Token::Eof => "end of input",
            Token::Newline | Token::LineMarker(_) => "line marker",
            Token::Auto => "auto",
            Token::Break => "break",
            Token::Case => "case",
            Token::Char => "char",
            Token::Const => "const",
            Token::Continue => "continue",
            Token::Default => "default",
            Token::Do => "do",
            Token::Double => "double",
            Token::Else => "else",
            Token::Enum => "enum",
            Token::Extern => "extern",
            Token::Float => "float",
            Token::For => "for",
            Token::Goto => "goto",
            Token::If => "if",
            Token::Inline => "inline",
            Token::Int => "int",
            Token::Long => "long",
            Token::Register => "register",
            Token::Restrict => "restrict",
            Token::Return => "return",
            Token::Short => "short",
            Token::Signed => "signed",
            Token::Sizeof => "sizeof",
            Token::Static => "static",
            Token::Struct => "struct",
            Token::Switch => "switch",
            Token::Typedef => "typedef",
            Token::Union => "union",
            Token::Unsigned => "unsigned",
            Token::Void => "void",
            Token::Volatile => "volatile",
            Token::While => "while",
            Token::Bool => "_Bool",
            Token::VaList => "__builtin_va_list",
            Token::VaStart => "__builtin_va_start",
            Token::VaArg => "__builtin_va_arg",
            Token::VaEnd => "__builtin_va_end",
            Token::VaCopy => "__builtin_va_copy",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Dot => ".",
            Token::Arrow => "->",
            Token::PlusPlus => "++",
            Token::MinusMinus => "--",
            Token::Amp => "&",
            Token::Star => "*",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Tilde => "~",
            Token::Bang => "!",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::EqEq => "==",
            Token::Ne => "!=",
            Token::Caret => "^",
            Token::Pipe => "|",
            Token::AndAnd => "&&",
            Token::OrOr => "||",
            Token::Question => "?",
            Token::Colon => ":",
            Token::Semi => ";",
            Token::Ellipsis => "...",
            Token::Assign => "=",
            Token::StarAssign => "*=",
            Token::SlashAssign => "/=",
            Token::PercentAssign => "%=",
            Token::PlusAssign => "+=",
            Token::MinusAssign => "-=",
            Token::ShlAssign => "<<=",
            Token::ShrAssign => ">>=",
            Token::AmpAssign => "&=",
            Token::CaretAssign => "^=",
            Token::PipeAssign => "|=",
            Token::Comma => ",",
            Token::Hash => "#",
        };
        f.write_str(text)
    }
}

/// A token and where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub tok: Token,
    pub pos: SourcePos,
}

/// Split preprocessed `source` into tokens, ending with [`Token::Eof`].
pub fn tokenize(source: &str, source_name: &str) -> SyntaxResult<Vec<Spanned>> {
    let mut file: Arc<str> = Arc::from(source_name);
    let mut line = 1u32;
    let mut line_start = 0usize;
    let mut out = Vec::new();
    let mut lex = Token::lexer(source);

    while let Some(result) = lex.next() {
        let span = lex.span();
        let pos = SourcePos::new(file.clone(), line, (span.start - line_start) as u32 + 1);
        match result {
            Ok(Token::Newline) => {
                line += 1;
                line_start = span.end;
            }
            Ok(Token::LineMarker((marker_line, name))) => {
                if *file != *name {
                    file = Arc::from(name.as_str());
                }
                // The newline ending the marker advances to `marker_line`.
                line = marker_line.saturating_sub(1);
            }
            Ok(Token::Hash) => return Err(SyntaxError::new(pos, "stray '#' in program")),
            Ok(tok) => out.push(Spanned { tok, pos }),
            Err(()) => {
                let text = lex.slice();
                let msg = match text.chars().next() {
                    Some('\'') | Some('"') => format!("invalid literal {text}"),
                    Some(c) if c.is_ascii_digit() || c == '.' => format!("invalid number '{text}'"),
                    _ => format!("stray '{text}' in program"),
                };
                return Err(SyntaxError::new(pos, msg));
            }
        }
    }
    let pos = SourcePos::new(file, line, (source.len() - line_start) as u32 + 1);
    out.push(Spanned { tok: Token::Eof, pos });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src, "t.c").unwrap().into_iter().map(|s| s.tok).collect()
    }

    #[test]
    fn test_keywords_and_punctuators() {
        assert_eq!(
            kinds("int x>>=y...;"),
            vec![
                Token::Int,
                Token::Ident("x".into()),
                Token::ShrAssign,
                Token::Ident("y".into()),
                Token::Ellipsis,
                Token::Semi,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_literals() {
        let toks = kinds("0x1fUL 017 42 1.5f .5 1e3 'a' '\\n' \"a\\tb\\x41\"");
        assert_eq!(
            toks[0],
            Token::IntLit(IntLit {
                value: 31,
                unsigned: true,
                long: true,
                radix_prefixed: true
            })
        );
        assert!(matches!(toks[1], Token::IntLit(IntLit { value: 15, .. })));
        assert!(matches!(toks[2], Token::IntLit(IntLit { value: 42, unsigned: false, .. })));
        assert_eq!(
            toks[3],
            Token::FloatLit(FloatLit {
                value: 1.5,
                suffix: FloatSuffix::F
            })
        );
        assert!(matches!(toks[4], Token::FloatLit(FloatLit { value, .. }) if value == 0.5));
        assert!(matches!(toks[5], Token::FloatLit(FloatLit { value, .. }) if value == 1000.0));
        assert_eq!(toks[6], Token::CharLit(97));
        assert_eq!(toks[7], Token::CharLit(10));
        assert_eq!(toks[8], Token::StrLit(b"a\tbA".to_vec()));
    }

    #[test]
    fn test_positions_follow_line_markers() {
        let toks = tokenize("# 1 \"a.c\"\nx\n# 7 \"b.h\"\n  y", "in").unwrap();
        assert_eq!(toks[0].pos.to_string(), "a.c:1:1");
        assert_eq!(toks[1].pos.to_string(), "b.h:7:3");
    }

    #[test]
    fn test_errors() {
        let err = tokenize("int @x;", "t.c").unwrap_err();
        assert_eq!(err.pos.to_string(), "t.c:1:5");
        assert!(err.msg.contains("stray '@'"));
        assert!(tokenize("\"open", "t.c").is_err());
    }

    #[test]
    fn test_char_values() {
        assert_eq!(char_value("'\\xff'"), Some(-1));
        assert_eq!(char_value("'\\0'"), Some(0));
        assert_eq!(char_value("'\\101'"), Some(65));
        assert_eq!(char_value("''"), None);
    }
}
