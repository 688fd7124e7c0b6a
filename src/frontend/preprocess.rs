// The C preprocessor. Source text is first split into logical lines: backslash-newline
// pairs are spliced and comments become a single space, remembering how many physical
// lines each logical line covered. Lines starting with '#' are directives; everything
// else, while every enclosing conditional is active, is split into preprocessing tokens
// (a logos scanner), macro-expanded and written out. The output keeps one output line
// per physical input line and marks file boundaries with `# line "file"` markers, so
// the lexer can report positions in the original files. Macro expansion rescans
// replacement lists with the macro's own name disabled; function-like macros take their
// arguments fully expanded. Stringizing and token pasting are not supported. #if
// expressions are evaluated over 64-bit integers after `defined` is resolved and the
// remaining identifiers are replaced by 0.

//! Macro preprocessing.

use super::headers::builtin_header;
use super::PreprocessError;
use crate::core::diagnostics::{Diagnostics, SourcePos};
use crate::core::options::MacroCommand;
use logos::Logos;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAX_INCLUDE_DEPTH: usize = 200;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
enum PpKind {
    #[regex(r"[ \t\x0b\x0c\r]+")]
    Space,
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,
    #[regex(r"\.?[0-9]([0-9A-Za-z_.]|[eEpP][+-])*")]
    Number,
    #[regex(r#"L?"([^"\\\n]|\\.)*""#)]
    Str,
    #[regex(r"L?'([^'\\\n]|\\.)+'")]
    Char,
    #[token("...")]
    #[token("<<=")]
    #[token(">>=")]
    #[token("->")]
    #[token("++")]
    #[token("--")]
    #[token("<<")]
    #[token(">>")]
    #[token("<=")]
    #[token(">=")]
    #[token("==")]
    #[token("!=")]
    #[token("&&")]
    #[token("||")]
    #[token("+=")]
    #[token("-=")]
    #[token("*=")]
    #[token("/=")]
    #[token("%=")]
    #[token("&=")]
    #[token("|=")]
    #[token("^=")]
    #[token("##")]
    #[regex(r"[\[\](){}.&*+\-~!/%<>^|?:;=,#]")]
    Punct,
}

/// One preprocessing token.
#[derive(Debug, Clone, PartialEq)]
struct PpTok {
    kind: TokKind,
    text: String,
    space_before: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokKind {
    Ident,
    Number,
    Str,
    Char,
    Punct,
    Other,
}

impl PpTok {
    fn is(&self, text: &str) -> bool {
        self.kind == TokKind::Punct && self.text == text
    }

    fn number(value: i64) -> Self {
        PpTok {
            kind: TokKind::Number,
            text: value.to_string(),
            space_before: true,
        }
    }
}

fn tokenize(line: &str) -> Vec<PpTok> {
    let mut out = Vec::new();
    let mut space = false;
    let mut lex = PpKind::lexer(line);
    while let Some(kind) = lex.next() {
        let text = lex.slice();
        let kind = match kind {
            Ok(PpKind::Space) => {
                space = true;
                continue;
            }
            Ok(PpKind::Ident) => TokKind::Ident,
            Ok(PpKind::Number) => TokKind::Number,
            Ok(PpKind::Str) => TokKind::Str,
            Ok(PpKind::Char) => TokKind::Char,
            Ok(PpKind::Punct) => TokKind::Punct,
            Err(()) => TokKind::Other,
        };
        out.push(PpTok {
            kind,
            text: text.to_string(),
            space_before: space,
        });
        space = false;
    }
    out
}

fn render(toks: &[PpTok]) -> String {
    let mut s = String::new();
    for (i, t) in toks.iter().enumerate() {
        if i > 0 && t.space_before {
            s.push(' ');
        }
        s.push_str(&t.text);
    }
    s
}

/// A logical source line and the physical lines it spans.
#[derive(Debug, PartialEq)]
struct LogicalLine {
    text: String,
    line: u32,
    span: u32,
}

/// Splice continued lines and strip comments.
fn logical_lines(src: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut cur = String::new();
    let mut start = 1u32;
    let mut line = 1u32;
    let mut chars = src.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'\n') => {
                chars.next();
                line += 1;
            }
            '\\' if quote.is_some() => {
                cur.push(c);
                if let Some(n) = chars.next() {
                    if n == '\n' {
                        line += 1;
                    } else {
                        cur.push(n);
                    }
                }
            }
            '\n' => {
                line += 1;
                lines.push(LogicalLine {
                    text: std::mem::take(&mut cur),
                    line: start,
                    span: line - start,
                });
                start = line;
                quote = None;
            }
            '"' | '\'' => {
                match quote {
                    None => quote = Some(c),
                    Some(q) if q == c => quote = None,
                    _ => {}
                }
                cur.push(c);
            }
            '/' if quote.is_none() && chars.peek() == Some(&'/') => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '/' if quote.is_none() && chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for n in chars.by_ref() {
                    if n == '\n' {
                        line += 1;
                    }
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                cur.push(' ');
            }
            _ => cur.push(c),
        }
    }
    if !cur.is_empty() || line > start {
        lines.push(LogicalLine {
            text: cur,
            line: start,
            span: (line - start).max(1),
        });
    }
    lines
}

#[derive(Debug, Clone)]
enum Macro {
    Object(Vec<PpTok>),
    Function {
        params: Vec<String>,
        variadic: bool,
        body: Vec<PpTok>,
    },
}

#[derive(Debug)]
struct Cond {
    /// Whether the enclosing region is active.
    parent: bool,
    /// Whether some branch of this conditional was taken.
    taken: bool,
    active: bool,
    seen_else: bool,
}

/// Preprocessor state for one translation unit.
pub struct Preprocessor<'d> {
    macros: HashMap<String, Macro>,
    include_dirs: Vec<PathBuf>,
    diag: &'d mut Diagnostics,
    out: String,
    depth: usize,
    file: Arc<str>,
    line: u32,
}

impl<'d> Preprocessor<'d> {
    pub fn new(diag: &'d mut Diagnostics, include_dirs: &[PathBuf], commands: &[MacroCommand]) -> Self {
        let mut pp = Self {
            macros: HashMap::new(),
            include_dirs: include_dirs.to_vec(),
            diag,
            out: String::new(),
            depth: 0,
            file: Arc::from("<built-in>"),
            line: 0,
        };
        for (name, value) in [
            ("__STDC__", "1"),
            ("__STDC_VERSION__", "199901L"),
            ("__STDC_HOSTED__", "1"),
            ("__x86_64__", "1"),
            ("__x86_64", "1"),
            ("__LP64__", "1"),
            ("__linux__", "1"),
            ("__unix__", "1"),
            ("__c2jit__", "1"),
        ] {
            pp.macros.insert(name.to_string(), Macro::Object(tokenize(value)));
        }
        for cmd in commands {
            match cmd {
                MacroCommand::Define { name, value } => {
                    pp.macros.insert(name.clone(), Macro::Object(tokenize(value)));
                }
                MacroCommand::Undefine { name } => {
                    pp.macros.remove(name);
                }
            }
        }
        pp
    }

    /// Preprocess `source` named `name`, returning the expanded text.
    pub fn run(mut self, source: &str, name: &str) -> String {
        self.process_file(source, Arc::from(name), None);
        self.out
    }

    fn pos(&self) -> SourcePos {
        SourcePos::new(self.file.clone(), self.line, 1)
    }

    fn report(&mut self, err: PreprocessError) {
        let pos = self.pos();
        self.diag.error(&pos, err);
    }

    fn marker(&mut self, line: u32) {
        self.out.push_str(&format!("# {} \"{}\"\n", line, self.file));
    }

    fn process_file(&mut self, source: &str, file: Arc<str>, dir: Option<PathBuf>) {
        let saved = (std::mem::replace(&mut self.file, file), self.line);
        self.marker(1);
        log::trace!("preprocessing {}", self.file);

        let lines = logical_lines(source);
        let mut conds: Vec<Cond> = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            let ll = &lines[i];
            self.line = ll.line;
            let mut span = ll.span;
            let trimmed = ll.text.trim_start();
            let active = conds.last().map_or(true, |c| c.active);

            if let Some(directive) = trimmed.strip_prefix('#') {
                let included = self.directive(directive, active, &mut conds, dir.as_deref());
                if included {
                    self.marker(ll.line + ll.span);
                } else {
                    self.out.push_str(&"\n".repeat(span as usize));
                }
                i += 1;
                continue;
            }
            if !active {
                self.out.push_str(&"\n".repeat(span as usize));
                i += 1;
                continue;
            }

            let mut toks = tokenize(&ll.text);
            // Function-like macro calls may continue on the following lines.
            while self.needs_more(&toks) && i + 1 < lines.len() && !lines[i + 1].text.trim_start().starts_with('#') {
                i += 1;
                let mut more = tokenize(&lines[i].text);
                if let Some(first) = more.first_mut() {
                    first.space_before = true;
                }
                toks.extend(more);
                span += lines[i].span;
            }
            let expanded = self.expand(&toks, &mut Vec::new());
            self.out.push_str(&render(&expanded));
            self.out.push_str(&"\n".repeat(span as usize));
            i += 1;
        }
        if !conds.is_empty() {
            self.report(PreprocessError::UnterminatedConditional);
        }
        (self.file, self.line) = saved;
    }

    fn needs_more(&self, toks: &[PpTok]) -> bool {
        let depth: i32 = toks
            .iter()
            .map(|t| match t.text.as_str() {
                "(" if t.kind == TokKind::Punct => 1,
                ")" if t.kind == TokKind::Punct => -1,
                _ => 0,
            })
            .sum();
        depth > 0
            && toks
                .iter()
                .any(|t| t.kind == TokKind::Ident && matches!(self.macros.get(&t.text), Some(Macro::Function { .. })))
    }

    /// Handle one directive line. Returns true when a file was included.
    fn directive(&mut self, text: &str, active: bool, conds: &mut Vec<Cond>, dir: Option<&Path>) -> bool {
        let toks = tokenize(text);
        let Some(first) = toks.first() else {
            return false;
        };
        let name = first.text.clone();
        let rest = &toks[1..];
        match name.as_str() {
            "ifdef" | "ifndef" => {
                let defined = rest.first().is_some_and(|t| self.macros.contains_key(&t.text));
                let cond = if name == "ifdef" { defined } else { !defined };
                conds.push(Cond {
                    parent: active,
                    taken: active && cond,
                    active: active && cond,
                    seen_else: false,
                });
            }
            "if" => {
                let cond = active && self.eval_condition(rest);
                conds.push(Cond {
                    parent: active,
                    taken: cond,
                    active: cond,
                    seen_else: false,
                });
            }
            "elif" => {
                let Some(c) = conds.last() else {
                    self.report(PreprocessError::Stray("#elif".into()));
                    return false;
                };
                let (parent, taken) = (c.parent, c.taken);
                let cond = parent && !taken && self.eval_condition(rest);
                if let Some(c) = conds.last_mut() {
                    c.active = cond;
                    c.taken |= cond;
                }
            }
            "else" => match conds.last_mut() {
                Some(c) if !c.seen_else => {
                    c.seen_else = true;
                    c.active = c.parent && !c.taken;
                    c.taken = true;
                }
                _ => self.report(PreprocessError::Stray("#else".into())),
            },
            "endif" => {
                if conds.pop().is_none() {
                    self.report(PreprocessError::Stray("#endif".into()));
                }
            }
            _ if !active => {}
            "define" => self.define(rest),
            "undef" => {
                if let Some(t) = rest.first() {
                    self.macros.remove(&t.text);
                }
            }
            "include" => return self.include(rest, dir),
            "error" => self.report(PreprocessError::ErrorDirective(render(rest))),
            "warning" => {
                let pos = self.pos();
                self.diag.warning(&pos, format!("#warning {}", render(rest)));
            }
            "line" | "pragma" | "ident" => {}
            _ if first.kind == TokKind::Number => {}
            other => self.report(PreprocessError::UnknownDirective(other.to_string())),
        }
        false
    }

    fn define(&mut self, toks: &[PpTok]) {
        let Some(name) = toks.first().filter(|t| t.kind == TokKind::Ident) else {
            self.report(PreprocessError::BadDefine);
            return;
        };
        let function_like = toks.get(1).is_some_and(|t| t.is("(") && !t.space_before);
        if !function_like {
            self.macros.insert(name.text.clone(), Macro::Object(toks[1..].to_vec()));
            return;
        }
        let mut params = Vec::new();
        let mut variadic = false;
        let mut i = 2;
        loop {
            match toks.get(i) {
                Some(t) if t.is(")") => break,
                Some(t) if t.is(",") => {}
                Some(t) if t.is("...") => variadic = true,
                Some(t) if t.kind == TokKind::Ident => params.push(t.text.clone()),
                _ => {
                    self.report(PreprocessError::BadDefine);
                    return;
                }
            }
            i += 1;
        }
        self.macros.insert(
            name.text.clone(),
            Macro::Function {
                params,
                variadic,
                body: toks[i + 1..].to_vec(),
            },
        );
    }

    fn include(&mut self, toks: &[PpTok], dir: Option<&Path>) -> bool {
        let toks = if toks.first().is_some_and(|t| t.kind == TokKind::Ident) {
            self.expand(toks, &mut Vec::new())
        } else {
            toks.to_vec()
        };
        let (name, system) = match toks.first() {
            Some(t) if t.kind == TokKind::Str => (t.text.trim_matches('"').to_string(), false),
            Some(t) if t.is("<") => {
                let end = toks.iter().position(|t| t.is(">")).unwrap_or(toks.len());
                let name: String = toks[1..end].iter().map(|t| t.text.as_str()).collect();
                (name, true)
            }
            _ => {
                self.report(PreprocessError::BadInclude);
                return false;
            }
        };
        if self.depth >= MAX_INCLUDE_DEPTH {
            self.report(PreprocessError::IncludeDepth);
            return false;
        }

        let mut candidates = Vec::new();
        if !system {
            candidates.push(dir.map_or_else(|| PathBuf::from(&name), |d| d.join(&name)));
        }
        candidates.extend(self.include_dirs.iter().map(|d| d.join(&name)));
        let found = candidates
            .into_iter()
            .find_map(|p| std::fs::read_to_string(&p).ok().map(|text| (p, text)));

        self.depth += 1;
        match found {
            Some((path, text)) => {
                let parent = path.parent().map(Path::to_path_buf);
                self.process_file(&text, Arc::from(path.to_string_lossy().as_ref()), parent);
            }
            None => match builtin_header(&name) {
                Some(text) => self.process_file(text, Arc::from(format!("<{name}>")), None),
                None => {
                    self.depth -= 1;
                    self.report(PreprocessError::IncludeNotFound(name));
                    return false;
                }
            },
        }
        self.depth -= 1;
        true
    }

    fn expand(&self, toks: &[PpTok], disabled: &mut Vec<String>) -> Vec<PpTok> {
        let mut out = Vec::with_capacity(toks.len());
        let mut i = 0;
        while i < toks.len() {
            let t = &toks[i];
            if t.kind != TokKind::Ident || disabled.contains(&t.text) {
                out.push(t.clone());
                i += 1;
                continue;
            }
            match t.text.as_str() {
                "__LINE__" => {
                    out.push(PpTok {
                        space_before: t.space_before,
                        ..PpTok::number(self.line as i64)
                    });
                    i += 1;
                    continue;
                }
                "__FILE__" => {
                    out.push(PpTok {
                        kind: TokKind::Str,
                        text: format!("\"{}\"", self.file),
                        space_before: t.space_before,
                    });
                    i += 1;
                    continue;
                }
                _ => {}
            }
            match self.macros.get(&t.text) {
                Some(Macro::Object(body)) => {
                    disabled.push(t.text.clone());
                    let mut exp = self.expand(body, disabled);
                    disabled.pop();
                    if let Some(first) = exp.first_mut() {
                        first.space_before = t.space_before;
                    }
                    out.extend(exp);
                    i += 1;
                }
                Some(Macro::Function { params, variadic, body }) if toks.get(i + 1).is_some_and(|n| n.is("(")) => {
                    let Some((args, end)) = collect_args(toks, i + 2) else {
                        out.push(t.clone());
                        i += 1;
                        continue;
                    };
                    let args: Vec<Vec<PpTok>> = args.iter().map(|a| self.expand(a, disabled)).collect();
                    let substituted = substitute(body, params, *variadic, &args);
                    disabled.push(t.text.clone());
                    let mut exp = self.expand(&substituted, disabled);
                    disabled.pop();
                    if let Some(first) = exp.first_mut() {
                        first.space_before = t.space_before;
                    }
                    out.extend(exp);
                    i = end;
                }
                _ => {
                    out.push(t.clone());
                    i += 1;
                }
            }
        }
        out
    }

    fn eval_condition(&mut self, toks: &[PpTok]) -> bool {
        // Resolve `defined` before expansion so its operand is not replaced.
        let mut resolved = Vec::with_capacity(toks.len());
        let mut i = 0;
        while i < toks.len() {
            if toks[i].kind == TokKind::Ident && toks[i].text == "defined" {
                let (name, next) = match (toks.get(i + 1), toks.get(i + 2), toks.get(i + 3)) {
                    (Some(p), Some(n), Some(c)) if p.is("(") && c.is(")") => (n.text.as_str(), i + 4),
                    (Some(n), _, _) if n.kind == TokKind::Ident => (n.text.as_str(), i + 2),
                    _ => {
                        self.report(PreprocessError::BadCondition("malformed defined".into()));
                        return false;
                    }
                };
                resolved.push(PpTok::number(self.macros.contains_key(name) as i64));
                i = next;
            } else {
                resolved.push(toks[i].clone());
                i += 1;
            }
        }
        let expanded = self.expand(&resolved, &mut Vec::new());
        let mut eval = CondEval { toks: &expanded, pos: 0 };
        match eval.ternary().and_then(|v| match eval.toks.get(eval.pos) {
            None => Ok(v),
            Some(t) => Err(format!("unexpected '{}'", t.text)),
        }) {
            Ok(v) => v != 0,
            Err(msg) => {
                self.report(PreprocessError::BadCondition(msg));
                false
            }
        }
    }
}

/// Split macro arguments starting after the opening parenthesis at `start`.
/// Returns the arguments and the index after the closing parenthesis.
fn collect_args(toks: &[PpTok], start: usize) -> Option<(Vec<Vec<PpTok>>, usize)> {
    let mut args = vec![Vec::new()];
    let mut depth = 0;
    for (j, t) in toks.iter().enumerate().skip(start) {
        if t.is("(") {
            depth += 1;
        } else if t.is(")") {
            if depth == 0 {
                if args.len() == 1 && args[0].is_empty() {
                    args.clear();
                }
                return Some((args, j + 1));
            }
            depth -= 1;
        } else if t.is(",") && depth == 0 {
            args.push(Vec::new());
            continue;
        }
        args.last_mut()?.push(t.clone());
    }
    None
}

fn substitute(body: &[PpTok], params: &[String], variadic: bool, args: &[Vec<PpTok>]) -> Vec<PpTok> {
    let mut out = Vec::with_capacity(body.len());
    for t in body {
        let arg = match t.kind {
            TokKind::Ident if variadic && t.text == "__VA_ARGS__" => {
                let rest = args.get(params.len()..).unwrap_or(&[]);
                let mut joined = Vec::new();
                for (k, a) in rest.iter().enumerate() {
                    if k > 0 {
                        joined.push(PpTok {
                            kind: TokKind::Punct,
                            text: ",".into(),
                            space_before: false,
                        });
                    }
                    joined.extend(a.iter().cloned());
                }
                Some(joined)
            }
            TokKind::Ident => params
                .iter()
                .position(|p| *p == t.text)
                .map(|k| args.get(k).cloned().unwrap_or_default()),
            _ => None,
        };
        match arg {
            Some(mut a) => {
                if let Some(first) = a.first_mut() {
                    first.space_before = t.space_before;
                }
                out.extend(a);
            }
            None => out.push(t.clone()),
        }
    }
    out
}

/// Integer value of a preprocessing number or character constant.
fn pp_value(t: &PpTok) -> Result<i64, String> {
    match t.kind {
        TokKind::Number => {
            let digits = t.text.trim_end_matches(['u', 'U', 'l', 'L']);
            let parsed = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16)
            } else if digits.len() > 1 && digits.starts_with('0') {
                u64::from_str_radix(&digits[1..], 8)
            } else {
                digits.parse::<u64>()
            };
            parsed.map(|v| v as i64).map_err(|_| format!("invalid integer '{}'", t.text))
        }
        TokKind::Char => super::lexer::char_value(&t.text).ok_or_else(|| format!("invalid character constant {}", t.text)),
        TokKind::Ident => Ok(0),
        _ => Err(format!("unexpected '{}'", t.text)),
    }
}

/// Evaluator for #if expressions.
struct CondEval<'t> {
    toks: &'t [PpTok],
    pos: usize,
}

impl CondEval<'_> {
    fn peek(&self) -> Option<&PpTok> {
        self.toks.get(self.pos)
    }

    fn eat(&mut self, p: &str) -> bool {
        if self.peek().is_some_and(|t| t.is(p)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ternary(&mut self) -> Result<i64, String> {
        let c = self.binary(0)?;
        if !self.eat("?") {
            return Ok(c);
        }
        let a = self.ternary()?;
        if !self.eat(":") {
            return Err("expected ':'".into());
        }
        let b = self.ternary()?;
        Ok(if c != 0 { a } else { b })
    }

    fn binary(&mut self, min_prec: u8) -> Result<i64, String> {
        let mut lhs = self.unary()?;
        loop {
            let Some(op) = self.peek().filter(|t| t.kind == TokKind::Punct).map(|t| t.text.clone()) else {
                break;
            };
            let prec = match op.as_str() {
                "||" => 1,
                "&&" => 2,
                "|" => 3,
                "^" => 4,
                "&" => 5,
                "==" | "!=" => 6,
                "<" | ">" | "<=" | ">=" => 7,
                "<<" | ">>" => 8,
                "+" | "-" => 9,
                "*" | "/" | "%" => 10,
                _ => break,
            };
            if prec < min_prec.max(1) {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = match op.as_str() {
                "||" => (lhs != 0 || rhs != 0) as i64,
                "&&" => (lhs != 0 && rhs != 0) as i64,
                "|" => lhs | rhs,
                "^" => lhs ^ rhs,
                "&" => lhs & rhs,
                "==" => (lhs == rhs) as i64,
                "!=" => (lhs != rhs) as i64,
                "<" => (lhs < rhs) as i64,
                ">" => (lhs > rhs) as i64,
                "<=" => (lhs <= rhs) as i64,
                ">=" => (lhs >= rhs) as i64,
                "<<" => lhs.wrapping_shl(rhs as u32),
                ">>" => lhs.wrapping_shr(rhs as u32),
                "+" => lhs.wrapping_add(rhs),
                "-" => lhs.wrapping_sub(rhs),
                "*" => lhs.wrapping_mul(rhs),
                "/" | "%" if rhs == 0 => return Err("division by zero in #if".into()),
                "/" => lhs.wrapping_div(rhs),
                _ => lhs.wrapping_rem(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<i64, String> {
        if self.eat("-") {
            return Ok(self.unary()?.wrapping_neg());
        }
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("!") {
            return Ok((self.unary()? == 0) as i64);
        }
        if self.eat("~") {
            return Ok(!self.unary()?);
        }
        if self.eat("(") {
            let v = self.ternary()?;
            if !self.eat(")") {
                return Err("expected ')'".into());
            }
            return Ok(v);
        }
        let t = self.peek().ok_or_else(|| "unexpected end of #if expression".to_string())?;
        let v = pp_value(t)?;
        self.pos += 1;
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnostics::MessageSink;

    fn preprocess(src: &str, commands: &[MacroCommand]) -> (String, String) {
        let sink = MessageSink::capture();
        let mut diag = Diagnostics::new(sink.clone(), "t.c", false, false);
        let out = Preprocessor::new(&mut diag, &[], commands).run(src, "t.c");
        (out, sink.contents())
    }

    fn code_lines(out: &str) -> Vec<&str> {
        out.lines().filter(|l| !l.starts_with('#') && !l.trim().is_empty()).collect()
    }

    #[test]
    fn test_logical_lines() {
        let lines = logical_lines("a \\\nb // c\n/* x\ny */ d\n\"//s\"\n");
        assert_eq!(lines[0].text, "a b ");
        assert_eq!(lines[0].span, 2);
        assert_eq!(lines[1].text, "  d");
        assert_eq!(lines[1].span, 2);
        assert_eq!(lines[2].text, "\"//s\"");
    }

    #[test]
    fn test_object_and_function_macros() {
        let (out, _) = preprocess(
            "#define N 10\n#define SQ(x) ((x) * (x))\n#define SELF SELF\nint a = SQ(N + 1) + SELF;\n",
            &[],
        );
        assert_eq!(code_lines(&out), vec!["int a = ((10 + 1) * (10 + 1)) + SELF;"]);
    }

    #[test]
    fn test_conditionals() {
        let src = "#define A 2\n#if A > 1 && defined(A)\nyes\n#elif 1\nno\n#else\nno\n#endif\n#ifdef B\nno\n#endif\n";
        let (out, errs) = preprocess(src, &[]);
        assert_eq!(code_lines(&out), vec!["yes"]);
        assert!(errs.is_empty());
    }

    #[test]
    fn test_command_line_macros_apply_in_order() {
        let cmds = [
            MacroCommand::define("X=3"),
            MacroCommand::define("Y"),
            MacroCommand::undefine("X"),
        ];
        let (out, _) = preprocess("X Y\n", &cmds);
        assert_eq!(code_lines(&out), vec!["X 1"]);
    }

    #[test]
    fn test_line_count_is_preserved() {
        let (out, _) = preprocess("#define A 1\n\n#if 0\nskip\n#endif\nA\n", &[]);
        let lines: Vec<&str> = out.lines().collect();
        // Marker, then one line per source line.
        assert_eq!(lines[0], "# 1 \"t.c\"");
        assert_eq!(lines[6], "1");
    }

    #[test]
    fn test_builtin_include_and_errors() {
        let (out, errs) = preprocess("#include <stdint.h>\nint32_t x;\n#error stop here\n", &[]);
        assert!(out.contains("typedef int int32_t;"));
        assert!(out.contains("# 2 \"t.c\""));
        assert!(errs.contains("t.c:3:1: error: #error stop here"), "{errs}");

        let (_, errs) = preprocess("#include \"missing.h\"\n#if 1\n", &[]);
        assert!(errs.contains("missing.h"));
        assert!(errs.contains("unterminated"));
    }

    #[test]
    fn test_variadic_macro_and_multiline_call() {
        let (out, _) = preprocess("#define P(f, ...) call(f, __VA_ARGS__)\nP(a,\n  b, c);\n", &[]);
        assert_eq!(code_lines(&out), vec!["call(a, b, c);"]);
    }
}
