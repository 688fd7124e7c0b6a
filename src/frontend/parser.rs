// Recursive-descent parser for the supported C subset. The parser keeps just enough
// scope information to parse C at all: which identifiers currently name typedefs (the
// classic lexer hack, with ordinary declarations shadowing them), the values of enum
// constants, which are folded into integer literals on the spot, and struct/union tags,
// whose layouts are computed into the RecordTable as soon as their bodies close.
// Declarators are parsed inside-out: for a parenthesized declarator the suffixes that
// follow the parentheses are applied first and the inner declarator is then re-parsed
// against the resulting type. Integer constant expressions in array bounds and enum
// values are evaluated here; everything else about expressions is left to the checker.

//! C parser.

use super::ast::*;
use super::ctype::{CType, FuncType, IntKind, RecordId, RecordTable};
use super::lexer::{FloatSuffix, IntLit, Spanned, Token};
use super::sema::eval_int;
use super::{SyntaxError, SyntaxResult};
use crate::core::diagnostics::SourcePos;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
enum Ordinary {
    Typedef(CType),
    EnumConst(i64),
    Object,
}

#[derive(Debug, Clone, Copy)]
enum Tag {
    Record { id: RecordId, is_union: bool },
    Enum,
}

/// Result of parsing one declarator.
struct Declarator {
    name: Option<String>,
    ty: CType,
    pos: SourcePos,
    /// Named parameters when the outermost derivation is a function.
    params: Option<Vec<Param>>,
}

struct DeclSpec {
    storage: Storage,
    ty: CType,
}

/// Parse a token stream produced by [`super::lexer::tokenize`].
pub fn parse(toks: Vec<Spanned>) -> SyntaxResult<TranslationUnit> {
    Parser::new(toks).translation_unit()
}

pub struct Parser {
    toks: Vec<Spanned>,
    pos: usize,
    scopes: Vec<HashMap<String, Ordinary>>,
    tags: Vec<HashMap<String, Tag>>,
    records: RecordTable,
    va_list: Option<CType>,
}

impl Parser {
    pub fn new(mut toks: Vec<Spanned>) -> Self {
        if toks.last().map_or(true, |t| t.tok != Token::Eof) {
            let pos = toks.last().map(|t| t.pos.clone()).unwrap_or_default();
            toks.push(Spanned { tok: Token::Eof, pos });
        }
        Self {
            toks,
            pos: 0,
            scopes: vec![HashMap::new()],
            tags: vec![HashMap::new()],
            records: RecordTable::default(),
            va_list: None,
        }
    }

    // --- Token access ---

    fn peek(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)].tok
    }

    fn peek_at(&self, n: usize) -> &Token {
        &self.toks[(self.pos + n).min(self.toks.len() - 1)].tok
    }

    fn here(&self) -> SourcePos {
        self.toks[self.pos.min(self.toks.len() - 1)].pos.clone()
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn error<T>(&self, msg: impl Into<String>) -> SyntaxResult<T> {
        Err(SyntaxError::new(self.here(), msg))
    }

    fn expect(&mut self, tok: Token) -> SyntaxResult<()> {
        if self.eat(&tok) {
            Ok(())
        } else if *self.peek() == Token::Eof {
            self.error(format!("expected '{tok}' at end of input"))
        } else {
            self.error(format!("expected '{tok}' before '{}'", self.peek()))
        }
    }

    fn ident(&mut self) -> SyntaxResult<String> {
        match self.bump() {
            Token::Ident(name) => Ok(name),
            other => {
                self.pos -= 1;
                self.error(format!("expected identifier before '{other}'"))
            }
        }
    }

    // --- Scopes ---

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
        self.tags.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
        self.tags.pop();
    }

    fn declare(&mut self, name: &str, what: Ordinary) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), what);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Ordinary> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn typedef_type(&self, name: &str) -> Option<CType> {
        match self.lookup(name) {
            Some(Ordinary::Typedef(ty)) => Some(ty.clone()),
            _ => None,
        }
    }

    fn lookup_tag(&self, name: &str) -> Option<Tag> {
        self.tags.iter().rev().find_map(|s| s.get(name)).copied()
    }

    /// Whether `tok` can start declaration specifiers.
    fn starts_decl(&self, tok: &Token) -> bool {
        match tok {
            Token::Ident(name) => self.typedef_type(name).is_some(),
            Token::Void
            | Token::Bool
            | Token::Char
            | Token::Short
            | Token::Int
            | Token::Long
            | Token::Signed
            | Token::Unsigned
            | Token::Float
            | Token::Double
            | Token::Struct
            | Token::Union
            | Token::Enum
            | Token::Const
            | Token::Volatile
            | Token::Restrict
            | Token::Inline
            | Token::Typedef
            | Token::Extern
            | Token::Static
            | Token::Auto
            | Token::Register
            | Token::VaList => true,
            _ => false,
        }
    }

    fn va_list_type(&mut self) -> CType {
        if let Some(ty) = &self.va_list {
            return ty.clone();
        }
        let id = self.records.declare(Some("__va_list_tag".into()), false);
        let void_ptr = CType::pointer_to(CType::Void);
        // Layout is fixed by the ABI; completing it cannot fail.
        let _ = self.records.complete(
            id,
            vec![
                (Some("gp_offset".into()), CType::UINT),
                (Some("fp_offset".into()), CType::UINT),
                (Some("overflow_arg_area".into()), void_ptr.clone()),
                (Some("reg_save_area".into()), void_ptr),
            ],
        );
        let ty = CType::Array(Rc::new(CType::Record(id)), Some(1));
        self.va_list = Some(ty.clone());
        ty
    }

    // --- Declarations ---

    fn translation_unit(mut self) -> SyntaxResult<TranslationUnit> {
        let mut items = Vec::new();
        while *self.peek() != Token::Eof {
            if self.eat(&Token::Semi) {
                continue;
            }
            self.external_decl(&mut items)?;
        }
        Ok(TranslationUnit {
            items,
            records: self.records,
        })
    }

    fn external_decl(&mut self, items: &mut Vec<ExternalDecl>) -> SyntaxResult<()> {
        let spec = self.decl_specs(true)?;
        if self.eat(&Token::Semi) {
            return Ok(());
        }
        let mut first = true;
        loop {
            let d = self.declarator(spec.ty.clone())?;
            let name = match d.name {
                Some(n) => n,
                None => return Err(SyntaxError::new(d.pos, "declaration does not declare anything")),
            };
            if first && *self.peek() == Token::LBrace {
                if let CType::Function(fty) = &d.ty {
                    let def = self.function_body(name, fty.clone(), d.params.unwrap_or_default(), spec.storage, d.pos)?;
                    items.push(ExternalDecl::Func(def));
                    return Ok(());
                }
            }
            first = false;
            if let Some(decl) = self.finish_init_declarator(name, d.ty, spec.storage, d.pos)? {
                items.push(ExternalDecl::Decl(decl));
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::Semi)?;
            return Ok(());
        }
    }

    /// Record a declared name and parse its initializer. Typedefs yield no declaration.
    fn finish_init_declarator(
        &mut self,
        name: String,
        ty: CType,
        storage: Storage,
        pos: SourcePos,
    ) -> SyntaxResult<Option<Declaration>> {
        if storage == Storage::Typedef {
            if *self.peek() == Token::Assign {
                return self.error("typedef is initialized");
            }
            self.declare(&name, Ordinary::Typedef(ty));
            return Ok(None);
        }
        self.declare(&name, Ordinary::Object);
        let init = if self.eat(&Token::Assign) {
            Some(self.initializer()?)
        } else {
            None
        };
        Ok(Some(Declaration::new(name, ty, storage, init, pos)))
    }

    fn function_body(
        &mut self,
        name: String,
        ty: Rc<FuncType>,
        params: Vec<Param>,
        storage: Storage,
        pos: SourcePos,
    ) -> SyntaxResult<FunctionDef> {
        self.push_scope();
        for p in &params {
            if let Some(n) = &p.name {
                self.declare(n, Ordinary::Object);
            }
        }
        let body = self.compound()?;
        self.pop_scope();
        Ok(FunctionDef {
            name,
            ty,
            params,
            storage,
            body,
            pos,
            sym: None,
            param_syms: Vec::new(),
        })
    }

    fn initializer(&mut self) -> SyntaxResult<Initializer> {
        let pos = self.here();
        if !self.eat(&Token::LBrace) {
            return Ok(Initializer::Expr(self.assign_expr()?));
        }
        let mut list = Vec::new();
        while *self.peek() != Token::RBrace {
            if matches!(self.peek(), Token::Dot | Token::LBracket) {
                return self.error("designated initializers are not supported");
            }
            list.push(self.initializer()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RBrace)?;
        Ok(Initializer::List(list, pos))
    }

    fn decl_specs(&mut self, allow_storage: bool) -> SyntaxResult<DeclSpec> {
        let pos = self.here();
        let mut storage = Storage::Auto;
        let (mut void, mut boolean, mut char, mut short, mut int, mut long) = (0, 0, 0, 0, 0, 0);
        let (mut signed, mut unsigned, mut float, mut double) = (false, false, false, false);
        let mut explicit: Option<CType> = None;
        let mut any = false;

        loop {
            let tok = self.peek().clone();
            match tok {
                Token::Typedef | Token::Extern | Token::Static | Token::Auto | Token::Register => {
                    if !allow_storage {
                        return self.error(format!("storage class '{tok}' not allowed here"));
                    }
                    if storage != Storage::Auto {
                        return self.error("multiple storage classes in declaration specifiers");
                    }
                    storage = match tok {
                        Token::Typedef => Storage::Typedef,
                        Token::Extern => Storage::Extern,
                        Token::Static => Storage::Static,
                        _ => Storage::Auto,
                    };
                    self.bump();
                    continue;
                }
                Token::Const | Token::Volatile | Token::Restrict | Token::Inline => {
                    self.bump();
                    continue;
                }
                Token::Void => void += 1,
                Token::Bool => boolean += 1,
                Token::Char => char += 1,
                Token::Short => short += 1,
                Token::Int => int += 1,
                Token::Long => long += 1,
                Token::Signed => signed = true,
                Token::Unsigned => unsigned = true,
                Token::Float => float = true,
                Token::Double => double = true,
                Token::VaList => {
                    self.bump();
                    explicit = Some(self.va_list_type());
                    any = true;
                    continue;
                }
                Token::Struct | Token::Union => {
                    explicit = Some(self.record_spec()?);
                    any = true;
                    continue;
                }
                Token::Enum => {
                    self.enum_spec()?;
                    explicit = Some(CType::INT);
                    any = true;
                    continue;
                }
                Token::Ident(ref name) if !any && explicit.is_none() => match self.typedef_type(name) {
                    Some(ty) => {
                        self.bump();
                        explicit = Some(ty);
                        any = true;
                        continue;
                    }
                    None => break,
                },
                _ => break,
            }
            any = true;
            self.bump();
        }

        let basic = void + boolean + char + short + int + long + float as i32 + double as i32 + signed as i32 + unsigned as i32;
        let ty = match explicit {
            Some(ty) if basic == 0 => ty,
            Some(_) => return Err(SyntaxError::new(pos, "two or more data types in declaration specifiers")),
            None if !any => {
                if storage != Storage::Auto {
                    CType::INT
                } else {
                    return Err(SyntaxError::new(pos, format!("expected declaration specifiers before '{}'", self.peek())));
                }
            }
            None => {
                if signed && unsigned {
                    return Err(SyntaxError::new(pos, "both 'signed' and 'unsigned' in declaration specifiers"));
                }
                if float {
                    CType::Float
                } else if double {
                    if long > 0 {
                        CType::LongDouble
                    } else {
                        CType::Double
                    }
                } else if void > 0 {
                    CType::Void
                } else if boolean > 0 {
                    CType::Int { kind: IntKind::Bool, signed: false }
                } else {
                    let kind = if char > 0 {
                        IntKind::Char
                    } else if short > 0 {
                        IntKind::Short
                    } else if long >= 2 {
                        IntKind::LongLong
                    } else if long == 1 {
                        IntKind::Long
                    } else {
                        IntKind::Int
                    };
                    CType::Int { kind, signed: !unsigned }
                }
            }
        };
        Ok(DeclSpec { storage, ty })
    }

    fn record_spec(&mut self) -> SyntaxResult<CType> {
        let is_union = self.bump() == Token::Union;
        let pos = self.here();
        let tag = match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ => None,
        };
        if *self.peek() != Token::LBrace {
            let Some(name) = tag else {
                return self.error("expected '{' or tag name after struct/union");
            };
            let id = match self.lookup_tag(&name) {
                Some(Tag::Record { id, is_union: u }) if u == is_union => id,
                Some(_) => return Err(SyntaxError::new(pos, format!("'{name}' defined as wrong kind of tag"))),
                None => {
                    let id = self.records.declare(Some(name.clone()), is_union);
                    if let Some(scope) = self.tags.last_mut() {
                        scope.insert(name, Tag::Record { id, is_union });
                    }
                    id
                }
            };
            return Ok(CType::Record(id));
        }

        let existing = tag.as_ref().and_then(|t| match self.tags.last().and_then(|s| s.get(t)) {
            Some(Tag::Record { id, is_union: u }) if *u == is_union && !self.records.get(*id).complete => Some(*id),
            _ => None,
        });
        let id = match existing {
            Some(id) => id,
            None => {
                let id = self.records.declare(tag.clone(), is_union);
                if let (Some(t), Some(scope)) = (tag, self.tags.last_mut()) {
                    scope.insert(t, Tag::Record { id, is_union });
                }
                id
            }
        };

        self.expect(Token::LBrace)?;
        let mut members = Vec::new();
        while !self.eat(&Token::RBrace) {
            let spec = self.decl_specs(false)?;
            if self.eat(&Token::Semi) {
                if spec.ty.is_record() {
                    members.push((None, spec.ty));
                }
                continue;
            }
            loop {
                let d = self.declarator(spec.ty.clone())?;
                if *self.peek() == Token::Colon {
                    return self.error("bit-fields are not supported");
                }
                members.push((d.name, d.ty));
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::Semi)?;
        }
        if let Err(field) = self.records.complete(id, members) {
            return Err(SyntaxError::new(pos, format!("field '{field}' has incomplete type")));
        }
        Ok(CType::Record(id))
    }

    fn enum_spec(&mut self) -> SyntaxResult<()> {
        self.bump();
        let tag = match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ => None,
        };
        if let Some(t) = &tag {
            if let Some(scope) = self.tags.last_mut() {
                scope.insert(t.clone(), Tag::Enum);
            }
        }
        if !self.eat(&Token::LBrace) {
            if tag.is_none() {
                return self.error("expected '{' after enum");
            }
            return Ok(());
        }
        let mut next = 0i64;
        while !self.eat(&Token::RBrace) {
            let name = self.ident()?;
            if self.eat(&Token::Assign) {
                let pos = self.here();
                let e = self.cond_expr()?;
                next = eval_int(&e).ok_or_else(|| SyntaxError::new(pos, "enumerator value is not an integer constant"))?;
            }
            self.declare(&name, Ordinary::EnumConst(next));
            next = next.wrapping_add(1);
            if !self.eat(&Token::Comma) {
                self.expect(Token::RBrace)?;
                break;
            }
        }
        Ok(())
    }

    fn skip_qualifiers(&mut self) {
        while matches!(self.peek(), Token::Const | Token::Volatile | Token::Restrict) {
            self.bump();
        }
    }

    /// Whether the '(' at the cursor opens a nested declarator rather than parameters.
    fn nested_declarator_follows(&self) -> bool {
        match self.peek_at(1) {
            Token::Star | Token::LParen | Token::LBracket => true,
            Token::Ident(name) => self.typedef_type(name).is_none(),
            _ => false,
        }
    }

    fn declarator(&mut self, mut ty: CType) -> SyntaxResult<Declarator> {
        while self.eat(&Token::Star) {
            ty = CType::pointer_to(ty);
            self.skip_qualifiers();
        }
        let pos = self.here();
        if *self.peek() == Token::LParen && self.nested_declarator_follows() {
            let inner_start = self.pos + 1;
            self.skip_parens()?;
            let (outer, _) = self.type_suffix(ty)?;
            let end = self.pos;
            self.pos = inner_start;
            let inner = self.declarator(outer)?;
            self.expect(Token::RParen)?;
            self.pos = end;
            return Ok(Declarator { params: None, ..inner });
        }
        let name = match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ => None,
        };
        let (ty, params) = self.type_suffix(ty)?;
        Ok(Declarator { name, ty, pos, params })
    }

    fn skip_parens(&mut self) -> SyntaxResult<()> {
        let mut depth = 0;
        loop {
            match self.bump() {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Token::Eof => return self.error("unbalanced parentheses in declarator"),
                _ => {}
            }
        }
    }

    fn type_suffix(&mut self, ty: CType) -> SyntaxResult<(CType, Option<Vec<Param>>)> {
        if self.eat(&Token::LBracket) {
            self.skip_qualifiers();
            self.eat(&Token::Static);
            let size = if *self.peek() == Token::RBracket {
                None
            } else {
                let pos = self.here();
                let e = self.cond_expr()?;
                match eval_int(&e) {
                    Some(n) if n >= 0 => Some(n as u64),
                    Some(_) => return Err(SyntaxError::new(pos, "size of array is negative")),
                    None => return Err(SyntaxError::new(pos, "array size is not an integer constant")),
                }
            };
            self.expect(Token::RBracket)?;
            let (elem, _) = self.type_suffix(ty)?;
            if elem.is_function() {
                return self.error("declaration of array of functions");
            }
            return Ok((CType::Array(Rc::new(elem), size), None));
        }
        if self.eat(&Token::LParen) {
            let (params, variadic, prototyped) = self.param_list()?;
            let (ret, _) = self.type_suffix(ty)?;
            if ret.is_array() || ret.is_function() {
                return self.error("function cannot return an array or function");
            }
            let fty = FuncType {
                ret,
                params: params.iter().map(|p| p.ty.clone()).collect(),
                variadic,
                prototyped,
            };
            return Ok((CType::Function(Rc::new(fty)), Some(params)));
        }
        Ok((ty, None))
    }

    fn param_list(&mut self) -> SyntaxResult<(Vec<Param>, bool, bool)> {
        if self.eat(&Token::RParen) {
            return Ok((Vec::new(), false, false));
        }
        if *self.peek() == Token::Void && *self.peek_at(1) == Token::RParen {
            self.bump();
            self.bump();
            return Ok((Vec::new(), false, true));
        }
        let mut params = Vec::new();
        let mut variadic = false;
        self.push_scope();
        loop {
            if self.eat(&Token::Ellipsis) {
                variadic = true;
                break;
            }
            let spec = self.decl_specs(true)?;
            let d = self.declarator(spec.ty)?;
            let ty = match d.ty {
                CType::Array(elem, _) => CType::Pointer(elem),
                f @ CType::Function(_) => CType::pointer_to(f),
                other => other,
            };
            if let Some(n) = &d.name {
                self.declare(n, Ordinary::Object);
            }
            params.push(Param {
                name: d.name,
                ty,
                pos: d.pos,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.pop_scope();
        self.expect(Token::RParen)?;
        Ok((params, variadic, true))
    }

    /// Type name as used in casts, sizeof and va_arg.
    fn type_name(&mut self) -> SyntaxResult<CType> {
        let spec = self.decl_specs(false)?;
        let d = self.declarator(spec.ty)?;
        if let Some(name) = d.name {
            return Err(SyntaxError::new(d.pos, format!("unexpected identifier '{name}' in type name")));
        }
        Ok(d.ty)
    }

    // --- Statements ---

    fn compound(&mut self) -> SyntaxResult<Stmt> {
        let pos = self.here();
        self.expect(Token::LBrace)?;
        self.push_scope();
        let mut body = Vec::new();
        while !self.eat(&Token::RBrace) {
            if *self.peek() == Token::Eof {
                self.pop_scope();
                return self.error("expected '}' at end of input");
            }
            body.push(self.block_item()?);
        }
        self.pop_scope();
        Ok(Stmt::new(StmtKind::Block(body), pos))
    }

    fn block_item(&mut self) -> SyntaxResult<Stmt> {
        let starts_decl = self.starts_decl(&self.peek().clone()) && *self.peek_at(1) != Token::Colon;
        if starts_decl {
            self.local_declaration()
        } else {
            self.statement()
        }
    }

    fn local_declaration(&mut self) -> SyntaxResult<Stmt> {
        let pos = self.here();
        let spec = self.decl_specs(true)?;
        let mut decls = Vec::new();
        if !self.eat(&Token::Semi) {
            loop {
                let d = self.declarator(spec.ty.clone())?;
                let name = d
                    .name
                    .ok_or_else(|| SyntaxError::new(d.pos.clone(), "declaration does not declare anything"))?;
                if *self.peek() == Token::LBrace {
                    return self.error("function definition is not allowed here");
                }
                if let Some(decl) = self.finish_init_declarator(name, d.ty, spec.storage, d.pos)? {
                    decls.push(decl);
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::Semi)?;
        }
        Ok(Stmt::new(StmtKind::Decl(decls), pos))
    }

    fn statement(&mut self) -> SyntaxResult<Stmt> {
        let pos = self.here();
        let kind = match self.peek().clone() {
            Token::LBrace => return self.compound(),
            Token::Semi => {
                self.bump();
                StmtKind::Null
            }
            Token::If => {
                self.bump();
                self.expect(Token::LParen)?;
                let cond = self.expr()?;
                self.expect(Token::RParen)?;
                let then = Box::new(self.statement()?);
                let otherwise = if self.eat(&Token::Else) {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                StmtKind::If(cond, then, otherwise)
            }
            Token::While => {
                self.bump();
                self.expect(Token::LParen)?;
                let cond = self.expr()?;
                self.expect(Token::RParen)?;
                StmtKind::While(cond, Box::new(self.statement()?))
            }
            Token::Do => {
                self.bump();
                let body = Box::new(self.statement()?);
                self.expect(Token::While)?;
                self.expect(Token::LParen)?;
                let cond = self.expr()?;
                self.expect(Token::RParen)?;
                self.expect(Token::Semi)?;
                StmtKind::DoWhile(body, cond)
            }
            Token::For => {
                self.bump();
                self.expect(Token::LParen)?;
                self.push_scope();
                let init = if self.eat(&Token::Semi) {
                    None
                } else if self.starts_decl(&self.peek().clone()) {
                    Some(Box::new(self.local_declaration()?))
                } else {
                    let e_pos = self.here();
                    let e = self.expr()?;
                    self.expect(Token::Semi)?;
                    Some(Box::new(Stmt::new(StmtKind::Expr(e), e_pos)))
                };
                let cond = if *self.peek() == Token::Semi { None } else { Some(self.expr()?) };
                self.expect(Token::Semi)?;
                let step = if *self.peek() == Token::RParen { None } else { Some(self.expr()?) };
                self.expect(Token::RParen)?;
                let body = Box::new(self.statement()?);
                self.pop_scope();
                StmtKind::For { init, cond, step, body }
            }
            Token::Switch => {
                self.bump();
                self.expect(Token::LParen)?;
                let cond = self.expr()?;
                self.expect(Token::RParen)?;
                StmtKind::Switch(cond, Box::new(self.statement()?))
            }
            Token::Case => {
                self.bump();
                let expr = self.cond_expr()?;
                self.expect(Token::Colon)?;
                StmtKind::Case {
                    expr,
                    value: 0,
                    body: Box::new(self.statement()?),
                }
            }
            Token::Default => {
                self.bump();
                self.expect(Token::Colon)?;
                StmtKind::Default(Box::new(self.statement()?))
            }
            Token::Break => {
                self.bump();
                self.expect(Token::Semi)?;
                StmtKind::Break
            }
            Token::Continue => {
                self.bump();
                self.expect(Token::Semi)?;
                StmtKind::Continue
            }
            Token::Return => {
                self.bump();
                let value = if *self.peek() == Token::Semi { None } else { Some(self.expr()?) };
                self.expect(Token::Semi)?;
                StmtKind::Return(value)
            }
            Token::Goto => {
                self.bump();
                let label = self.ident()?;
                self.expect(Token::Semi)?;
                StmtKind::Goto(label)
            }
            Token::Ident(name) if *self.peek_at(1) == Token::Colon => {
                self.bump();
                self.bump();
                StmtKind::Label(name, Box::new(self.statement()?))
            }
            _ => {
                let e = self.expr()?;
                self.expect(Token::Semi)?;
                StmtKind::Expr(e)
            }
        };
        Ok(Stmt::new(kind, pos))
    }

    // --- Expressions ---

    pub fn expr(&mut self) -> SyntaxResult<Expr> {
        let mut e = self.assign_expr()?;
        while *self.peek() == Token::Comma {
            let pos = self.here();
            self.bump();
            let rhs = self.assign_expr()?;
            e = Expr::new(ExprKind::Comma(Box::new(e), Box::new(rhs)), CType::Void, pos);
        }
        Ok(e)
    }

    fn assign_expr(&mut self) -> SyntaxResult<Expr> {
        let lhs = self.cond_expr()?;
        let op = match self.peek() {
            Token::Assign => None,
            Token::StarAssign => Some(BinaryOp::Mul),
            Token::SlashAssign => Some(BinaryOp::Div),
            Token::PercentAssign => Some(BinaryOp::Mod),
            Token::PlusAssign => Some(BinaryOp::Add),
            Token::MinusAssign => Some(BinaryOp::Sub),
            Token::ShlAssign => Some(BinaryOp::Shl),
            Token::ShrAssign => Some(BinaryOp::Shr),
            Token::AmpAssign => Some(BinaryOp::BitAnd),
            Token::CaretAssign => Some(BinaryOp::BitXor),
            Token::PipeAssign => Some(BinaryOp::BitOr),
            _ => return Ok(lhs),
        };
        let pos = self.here();
        self.bump();
        let rhs = self.assign_expr()?;
        Ok(Expr::new(
            ExprKind::Assign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                op_ty: CType::Void,
            },
            CType::Void,
            pos,
        ))
    }

    fn cond_expr(&mut self) -> SyntaxResult<Expr> {
        let cond = self.binary_expr(1)?;
        if *self.peek() != Token::Question {
            return Ok(cond);
        }
        let pos = self.here();
        self.bump();
        let then = self.expr()?;
        self.expect(Token::Colon)?;
        let otherwise = self.cond_expr()?;
        Ok(Expr::new(
            ExprKind::Cond(Box::new(cond), Box::new(then), Box::new(otherwise)),
            CType::Void,
            pos,
        ))
    }

    fn binary_op(tok: &Token) -> Option<(BinaryOp, u8)> {
        Some(match tok {
            Token::OrOr => (BinaryOp::LogOr, 1),
            Token::AndAnd => (BinaryOp::LogAnd, 2),
            Token::Pipe => (BinaryOp::BitOr, 3),
            Token::Caret => (BinaryOp::BitXor, 4),
            Token::Amp => (BinaryOp::BitAnd, 5),
            Token::EqEq => (BinaryOp::Eq, 6),
            Token::Ne => (BinaryOp::Ne, 6),
            Token::Lt => (BinaryOp::Lt, 7),
            Token::Gt => (BinaryOp::Gt, 7),
            Token::Le => (BinaryOp::Le, 7),
            Token::Ge => (BinaryOp::Ge, 7),
            Token::Shl => (BinaryOp::Shl, 8),
            Token::Shr => (BinaryOp::Shr, 8),
            Token::Plus => (BinaryOp::Add, 9),
            Token::Minus => (BinaryOp::Sub, 9),
            Token::Star => (BinaryOp::Mul, 10),
            Token::Slash => (BinaryOp::Div, 10),
            Token::Percent => (BinaryOp::Mod, 10),
            _ => return None,
        })
    }

    fn binary_expr(&mut self, min_prec: u8) -> SyntaxResult<Expr> {
        let mut lhs = self.cast_expr()?;
        while let Some((op, prec)) = Self::binary_op(self.peek()) {
            if prec < min_prec {
                break;
            }
            let pos = self.here();
            self.bump();
            let rhs = self.binary_expr(prec + 1)?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), CType::Void, pos);
        }
        Ok(lhs)
    }

    fn cast_expr(&mut self) -> SyntaxResult<Expr> {
        if *self.peek() == Token::LParen && self.starts_decl(&self.peek_at(1).clone()) {
            let pos = self.here();
            self.bump();
            let ty = self.type_name()?;
            self.expect(Token::RParen)?;
            if *self.peek() == Token::LBrace {
                return self.error("compound literals are not supported");
            }
            let operand = self.cast_expr()?;
            return Ok(Expr::new(ExprKind::Cast(Box::new(operand)), ty, pos));
        }
        self.unary_expr()
    }

    fn unary_expr(&mut self) -> SyntaxResult<Expr> {
        let pos = self.here();
        let unary = |op, e: Expr| Expr::new(ExprKind::Unary(op, Box::new(e)), CType::Void, pos.clone());
        match self.peek().clone() {
            Token::PlusPlus | Token::MinusMinus => {
                let inc = self.bump() == Token::PlusPlus;
                let e = self.unary_expr()?;
                Ok(Expr::new(
                    ExprKind::IncDec {
                        inc,
                        prefix: true,
                        expr: Box::new(e),
                    },
                    CType::Void,
                    pos,
                ))
            }
            Token::Amp => {
                self.bump();
                Ok(unary(UnaryOp::AddrOf, self.cast_expr()?))
            }
            Token::Star => {
                self.bump();
                Ok(unary(UnaryOp::Deref, self.cast_expr()?))
            }
            Token::Minus => {
                self.bump();
                Ok(unary(UnaryOp::Neg, self.cast_expr()?))
            }
            Token::Plus => {
                self.bump();
                Ok(unary(UnaryOp::Plus, self.cast_expr()?))
            }
            Token::Tilde => {
                self.bump();
                Ok(unary(UnaryOp::BitNot, self.cast_expr()?))
            }
            Token::Bang => {
                self.bump();
                Ok(unary(UnaryOp::Not, self.cast_expr()?))
            }
            Token::Sizeof => {
                self.bump();
                if *self.peek() == Token::LParen && self.starts_decl(&self.peek_at(1).clone()) {
                    self.bump();
                    let ty = self.type_name()?;
                    self.expect(Token::RParen)?;
                    return match self.records.size_of(&ty) {
                        Some(size) => Ok(Expr::int(size as i64, CType::ULONG, pos)),
                        None => Ok(Expr::new(ExprKind::SizeofType(ty), CType::ULONG, pos)),
                    };
                }
                let e = self.unary_expr()?;
                Ok(Expr::new(ExprKind::SizeofExpr(Box::new(e)), CType::ULONG, pos))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> SyntaxResult<Expr> {
        let mut e = self.primary_expr()?;
        loop {
            let pos = self.here();
            match self.peek() {
                Token::LBracket => {
                    self.bump();
                    let index = self.expr()?;
                    self.expect(Token::RBracket)?;
                    e = Expr::new(ExprKind::Index(Box::new(e), Box::new(index)), CType::Void, pos);
                }
                Token::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.assign_expr()?);
                            if !self.eat(&Token::Comma) {
                                break;
                            }
                        }
                        self.expect(Token::RParen)?;
                    }
                    e = Expr::new(ExprKind::Call(Box::new(e), args), CType::Void, pos);
                }
                Token::Dot | Token::Arrow => {
                    let arrow = self.bump() == Token::Arrow;
                    let name = self.ident()?;
                    e = Expr::new(
                        ExprKind::Member {
                            base: Box::new(e),
                            name,
                            arrow,
                            offset: 0,
                        },
                        CType::Void,
                        pos,
                    );
                }
                Token::PlusPlus | Token::MinusMinus => {
                    let inc = self.bump() == Token::PlusPlus;
                    e = Expr::new(
                        ExprKind::IncDec {
                            inc,
                            prefix: false,
                            expr: Box::new(e),
                        },
                        CType::Void,
                        pos,
                    );
                }
                _ => return Ok(e),
            }
        }
    }

    fn int_literal_type(lit: IntLit) -> CType {
        let fits_int = lit.value <= i32::MAX as u64;
        let fits_uint = lit.value <= u32::MAX as u64;
        let fits_long = lit.value <= i64::MAX as u64;
        match (lit.unsigned, lit.long) {
            (false, false) if fits_int => CType::INT,
            (false, false) if lit.radix_prefixed && fits_uint => CType::UINT,
            (true, false) if fits_uint => CType::UINT,
            (false, _) if fits_long => CType::LONG,
            _ => CType::ULONG,
        }
    }

    fn primary_expr(&mut self) -> SyntaxResult<Expr> {
        let pos = self.here();
        match self.bump() {
            Token::IntLit(lit) => Ok(Expr::int(lit.value as i64, Self::int_literal_type(lit), pos)),
            Token::FloatLit(lit) => {
                let ty = match lit.suffix {
                    FloatSuffix::None => CType::Double,
                    FloatSuffix::F => CType::Float,
                    FloatSuffix::L => CType::LongDouble,
                };
                Ok(Expr::new(ExprKind::Float(lit.value), ty, pos))
            }
            Token::CharLit(v) => Ok(Expr::int(v, CType::INT, pos)),
            Token::StrLit(first) => {
                let mut bytes = first;
                while let Token::StrLit(more) = self.peek() {
                    bytes.extend_from_slice(more);
                    self.bump();
                }
                let ty = CType::Array(Rc::new(CType::CHAR), Some(bytes.len() as u64 + 1));
                Ok(Expr::new(ExprKind::Str(Rc::from(bytes)), ty, pos))
            }
            Token::Ident(name) => match self.lookup(&name) {
                Some(Ordinary::EnumConst(v)) => Ok(Expr::int(*v, CType::INT, pos)),
                Some(Ordinary::Typedef(_)) => Err(SyntaxError::new(pos, format!("unexpected type name '{name}'"))),
                _ => Ok(Expr::new(ExprKind::Ident(name), CType::Void, pos)),
            },
            Token::LParen => {
                let e = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(e)
            }
            Token::VaStart => {
                self.expect(Token::LParen)?;
                let list = self.assign_expr()?;
                if self.eat(&Token::Comma) {
                    self.assign_expr()?;
                }
                self.expect(Token::RParen)?;
                Ok(Expr::new(ExprKind::VaStart(Box::new(list)), CType::Void, pos))
            }
            Token::VaArg => {
                self.expect(Token::LParen)?;
                let list = self.assign_expr()?;
                self.expect(Token::Comma)?;
                let ty = self.type_name()?;
                self.expect(Token::RParen)?;
                Ok(Expr::new(ExprKind::VaArg(Box::new(list)), ty, pos))
            }
            Token::VaEnd => {
                self.expect(Token::LParen)?;
                let list = self.assign_expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::new(ExprKind::VaEnd(Box::new(list)), CType::Void, pos))
            }
            Token::VaCopy => {
                self.expect(Token::LParen)?;
                let dst = self.assign_expr()?;
                self.expect(Token::Comma)?;
                let src = self.assign_expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::new(ExprKind::VaCopy(Box::new(dst), Box::new(src)), CType::Void, pos))
            }
            Token::Eof => Err(SyntaxError::new(pos, "expected expression at end of input")),
            other => Err(SyntaxError::new(pos, format!("expected expression before '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::tokenize;

    fn parse_src(src: &str) -> SyntaxResult<TranslationUnit> {
        parse(tokenize(src, "t.c")?)
    }

    fn decl(unit: &TranslationUnit, i: usize) -> &Declaration {
        match &unit.items[i] {
            ExternalDecl::Decl(d) => d,
            other => panic!("expected a declaration, got {other:?}"),
        }
    }

    #[test]
    fn test_declarators() {
        let unit = parse_src("int (*fp)(int, char *); char *argv[4]; long **pp; int (*rows)[3];").unwrap();
        let fp = &decl(&unit, 0).ty;
        let f = fp.func().unwrap();
        assert!(fp.is_pointer());
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.ret, CType::INT);
        assert_eq!(decl(&unit, 1).ty, CType::Array(Rc::new(CType::pointer_to(CType::CHAR)), Some(4)));
        assert_eq!(decl(&unit, 2).ty, CType::pointer_to(CType::pointer_to(CType::LONG)));
        assert_eq!(
            decl(&unit, 3).ty,
            CType::pointer_to(CType::Array(Rc::new(CType::INT), Some(3)))
        );
    }

    #[test]
    fn test_typedefs_enums_and_records() {
        let src = "typedef struct node { int v; struct node *next; } Node;\n\
                   enum { A, B = 5, C };\n\
                   Node n; int arr[C]; unsigned long u;\n\
                   int f(void) { Node *p; int Node = 3; return Node * 2; }";
        let unit = parse_src(src).unwrap();
        let n = decl(&unit, 0);
        assert_eq!(unit.records.size_of(&n.ty), Some(16));
        assert_eq!(decl(&unit, 1).ty, CType::Array(Rc::new(CType::INT), Some(6)));
        assert_eq!(decl(&unit, 2).ty, CType::ULONG);
        let ExternalDecl::Func(f) = &unit.items[3] else {
            panic!("expected a function");
        };
        let StmtKind::Block(body) = &f.body.kind else {
            panic!("expected a block");
        };
        // `Node` as a variable shadows the typedef, so `Node * 2` is a multiplication.
        assert!(matches!(&body[2].kind, StmtKind::Return(Some(Expr { kind: ExprKind::Binary(BinaryOp::Mul, _, _), .. }))));
    }

    #[test]
    fn test_statements() {
        let src = "int main(int argc, char **argv) {\n\
                     int i, s = 0;\n\
                     for (i = 0; i < 10; i++) { if (i & 1) continue; s += i; }\n\
                     switch (s) { case 1: s = 2; break; default: ; }\n\
                     do s--; while (s > 100);\n\
                     goto out;\n\
                   out:\n\
                     return s ? s : -1;\n\
                   }";
        let unit = parse_src(src).unwrap();
        let ExternalDecl::Func(f) = &unit.items[0] else {
            panic!("expected a function");
        };
        assert_eq!(f.name, "main");
        assert_eq!(f.params.len(), 2);
        let StmtKind::Block(body) = &f.body.kind else {
            panic!("expected a block");
        };
        assert_eq!(body.len(), 6);
        assert!(matches!(body[5].kind, StmtKind::Label(ref l, _) if l == "out"));
    }

    #[test]
    fn test_literal_types() {
        let unit = parse_src("long a = 3000000000; unsigned b = 0xffffffff; int c = 'x'; double d = 1.0; float e = 2.0f;").unwrap();
        let init_ty = |i| match &decl(&unit, i).init {
            Some(Initializer::Expr(e)) => e.ty.clone(),
            _ => CType::Void,
        };
        assert_eq!(init_ty(0), CType::LONG);
        assert_eq!(init_ty(1), CType::UINT);
        assert_eq!(init_ty(2), CType::INT);
        assert_eq!(init_ty(3), CType::Double);
        assert_eq!(init_ty(4), CType::Float);
    }

    #[test]
    fn test_syntax_errors() {
        let err = parse_src("int main(void) { return 1 }").unwrap_err();
        assert_eq!(err.msg, "expected ';' before '}'");
        assert_eq!(err.pos.to_string(), "t.c:1:27");

        let err = parse_src("struct s { int x : 3; };").unwrap_err();
        assert!(err.msg.contains("bit-fields"));

        let err = parse_src("int f(void) { int a[] = { .x = 1 }; }").unwrap_err();
        assert!(err.msg.contains("designated"));
    }
}
