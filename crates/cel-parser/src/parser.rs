//! Recursive-descent parser for the CEL grammar.
//!
//! Produces `cel_core` ASTs with dense ids and per-node byte offsets.
//! Macros expand during parsing (see [`crate::macros`]); everything else
//! lowers onto the reserved operator function names.

use cel_core::ast::{
    factory::ExprFactory, Ast, Constant, Expr, ExprKind, MapEntry, SourceInfo, StructField,
};
use cel_core::operators;

use crate::{
    error::{ParseError, ParseErrors},
    lexer::{lex, Tok, Token},
    macros::{expand_bind, expand_comprehension, expand_has, MacroSet},
};

/// Maximum nesting depth for expressions during parsing. Prevents stack
/// overflow from pathological inputs like `((((…))))`.
#[cfg(not(debug_assertions))]
const MAX_NESTING_DEPTH: u32 = 200;
/// Lower in debug builds, where stack frames are much larger.
#[cfg(debug_assertions)]
const MAX_NESTING_DEPTH: u32 = 60;

/// A configured parser.
#[derive(Debug, Clone, Default)]
pub struct Parser {
    macros: MacroSet,
}

impl Parser {
    /// A parser with the standard macro set (including `cel.bind`).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_macros(macros: MacroSet) -> Self {
        Self { macros }
    }

    /// A parser expanding only the macros the environment has in scope.
    pub fn for_env(env: &cel_core::Env) -> Self {
        Self {
            macros: MacroSet::from_env(env),
        }
    }

    pub fn parse(&self, source: &str) -> Result<Ast, ParseErrors> {
        let tokens = lex(source)?;
        let mut parser = ParserImpl {
            tokens,
            pos: 0,
            fx: ExprFactory::new(1),
            source: SourceInfo {
                text: Some(source.to_string()),
                ..SourceInfo::default()
            },
            macros: &self.macros,
            depth: 0,
        };
        let root = parser
            .parse_expr()
            .map_err(|err| ParseErrors::single(err, source))?;
        if parser.pos < parser.tokens.len() {
            let err = ParseError {
                message: "unexpected trailing input".to_string(),
                offset: parser.tokens[parser.pos].offset,
            };
            return Err(ParseErrors::many(vec![err], source));
        }
        Ok(Ast::new(root, parser.source))
    }
}

/// Parses with the default macro set.
pub fn parse(source: &str) -> Result<Ast, ParseErrors> {
    Parser::new().parse(source)
}

struct ParserImpl<'a> {
    tokens: Vec<Token>,
    pos: usize,
    fx: ExprFactory,
    source: SourceInfo,
    macros: &'a MacroSet,
    depth: u32,
}

impl ParserImpl<'_> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + ahead).map(|t| &t.tok)
    }

    fn offset(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .map_or_else(|| self.source.text.as_deref().map_or(0, str::len) as u32, |t| t.offset)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), ParseError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            offset: self.offset(),
        }
    }

    fn register(&mut self, expr: Expr, offset: u32) -> Expr {
        self.source.positions.insert(expr.id, offset);
        expr
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(self.error("expression nesting too deep"));
        }
        let result = self.parse_ternary();
        self.depth -= 1;
        result
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let cond = self.parse_or()?;
        if !self.eat(&Tok::Question) {
            return Ok(cond);
        }
        let then = self.parse_or()?;
        self.expect(&Tok::Colon, "':' in conditional")?;
        let otherwise = self.parse_expr()?;
        let call = self
            .fx
            .global_call(operators::CONDITIONAL, vec![cond, then, otherwise]);
        Ok(self.register(call, offset))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.parse_and()?;
            let call = self.fx.global_call(operators::LOGICAL_OR, vec![lhs, rhs]);
            lhs = self.register(call, offset);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let mut lhs = self.parse_relation()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.parse_relation()?;
            let call = self.fx.global_call(operators::LOGICAL_AND, vec![lhs, rhs]);
            lhs = self.register(call, offset);
        }
        Ok(lhs)
    }

    fn parse_relation(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let mut lhs = self.parse_addition()?;
        loop {
            let function = match self.peek() {
                Some(Tok::EqEq) => operators::EQUALS,
                Some(Tok::NotEq) => operators::NOT_EQUALS,
                Some(Tok::Less) => operators::LESS,
                Some(Tok::LessEq) => operators::LESS_EQUALS,
                Some(Tok::Greater) => operators::GREATER,
                Some(Tok::GreaterEq) => operators::GREATER_EQUALS,
                Some(Tok::In) => operators::IN,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_addition()?;
            let call = self.fx.global_call(function, vec![lhs, rhs]);
            lhs = self.register(call, offset);
        }
        Ok(lhs)
    }

    fn parse_addition(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let mut lhs = self.parse_multiplication()?;
        loop {
            let function = match self.peek() {
                Some(Tok::Plus) => operators::ADD,
                Some(Tok::Minus) => operators::SUBTRACT,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplication()?;
            let call = self.fx.global_call(function, vec![lhs, rhs]);
            lhs = self.register(call, offset);
        }
        Ok(lhs)
    }

    fn parse_multiplication(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        let mut lhs = self.parse_unary()?;
        loop {
            let function = match self.peek() {
                Some(Tok::Star) => operators::MULTIPLY,
                Some(Tok::Slash) => operators::DIVIDE,
                Some(Tok::Percent) => operators::MODULO,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            let call = self.fx.global_call(function, vec![lhs, rhs]);
            lhs = self.register(call, offset);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(self.error("expression nesting too deep"));
        }
        let result = self.parse_unary_inner();
        self.depth -= 1;
        result
    }

    fn parse_unary_inner(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        if self.eat(&Tok::Not) {
            let operand = self.parse_unary()?;
            let call = self.fx.global_call(operators::LOGICAL_NOT, vec![operand]);
            return Ok(self.register(call, offset));
        }
        if self.peek() == Some(&Tok::Minus) {
            // fold the sign into a numeric literal so i64::MIN is reachable
            match self.peek_at(1) {
                Some(Tok::IntLit(raw)) => {
                    let raw = raw.clone();
                    self.pos += 2;
                    let value = parse_int_magnitude(&raw)
                        .map_err(|msg| ParseError { message: msg, offset })?;
                    let negated = -value;
                    if negated < i128::from(i64::MIN) {
                        return Err(ParseError {
                            message: "int literal out of range".to_string(),
                            offset,
                        });
                    }
                    let lit = self.fx.int(negated as i64);
                    return Ok(self.register(lit, offset));
                }
                Some(Tok::DoubleLit(raw)) => {
                    let raw = raw.clone();
                    self.pos += 2;
                    let value: f64 = raw
                        .parse()
                        .map_err(|_| ParseError {
                            message: "malformed double literal".to_string(),
                            offset,
                        })?;
                    let lit = self.fx.double(-value);
                    return Ok(self.register(lit, offset));
                }
                _ => {
                    self.pos += 1;
                    let operand = self.parse_unary()?;
                    let call = self.fx.global_call(operators::NEGATE, vec![operand]);
                    return Ok(self.register(call, offset));
                }
            }
        }
        self.parse_member()
    }

    fn parse_member(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            let offset = self.offset();
            if self.eat(&Tok::Dot) {
                if self.eat(&Tok::Question) {
                    let field = self.expect_ident("field name after '.?'")?;
                    let field_lit = self.fx.string(field);
                    let call = self
                        .fx
                        .global_call(operators::OPT_SELECT, vec![expr, field_lit]);
                    expr = self.register(call, offset);
                    continue;
                }
                let field = self.expect_ident("field or method name after '.'")?;
                if self.eat(&Tok::LParen) {
                    let args = self.parse_call_args()?;
                    expr = self.member_call(offset, expr, field, args)?;
                } else {
                    let select = self.fx.select(expr, field);
                    expr = self.register(select, offset);
                }
            } else if self.eat(&Tok::LBracket) {
                let optional = self.eat(&Tok::Question);
                let index = self.parse_expr()?;
                self.expect(&Tok::RBracket, "']' after index")?;
                let function = if optional {
                    operators::OPT_INDEX
                } else {
                    operators::INDEX
                };
                let call = self.fx.global_call(function, vec![expr, index]);
                expr = self.register(call, offset);
            } else if self.peek() == Some(&Tok::LBrace) {
                let Some(message_name) = chain_name(&expr) else {
                    break;
                };
                self.pos += 1;
                expr = self.parse_struct_literal(offset, message_name)?;
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn member_call(
        &mut self,
        offset: u32,
        target: Expr,
        function: String,
        args: Vec<Expr>,
    ) -> Result<Expr, ParseError> {
        if function == "bind"
            && matches!(&target.kind, ExprKind::Ident(name) if name == "cel")
            && args.len() == 3
            && self.macros.contains("cel.bind")
        {
            return expand_bind(&mut self.fx, &mut self.source, offset, target, args);
        }
        let is_macro = match function.as_str() {
            "all" | "exists" | "exists_one" | "filter" => args.len() == 2,
            "map" => args.len() == 2 || args.len() == 3,
            _ => false,
        };
        if is_macro && self.macros.contains(&function) {
            return expand_comprehension(&mut self.fx, &mut self.source, offset, &function, target, args);
        }
        let call = self.fx.member_call(target, function, args);
        Ok(self.register(call, offset))
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RParen, "')' after call arguments")?;
            return Ok(args);
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(self.error("expression nesting too deep"));
        }
        let result = self.parse_primary_inner();
        self.depth -= 1;
        result
    }

    fn parse_primary_inner(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.bump() {
            Some(Tok::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(expr)
            }
            Some(Tok::LBracket) => self.parse_list_literal(offset),
            Some(Tok::LBrace) => self.parse_map_literal(offset),
            Some(Tok::Dot) => {
                let name = self.expect_ident("identifier after leading '.'")?;
                let ident = self.fx.ident(format!(".{name}"));
                Ok(self.register(ident, offset))
            }
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::LParen) {
                    let args = self.parse_call_args()?;
                    if name == "has" && args.len() == 1 && self.macros.contains("has") {
                        let arg = args.into_iter().next().expect("one argument");
                        return expand_has(&mut self.fx, &mut self.source, offset, arg);
                    }
                    let call = self.fx.global_call(name, args);
                    return Ok(self.register(call, offset));
                }
                let ident = self.fx.ident(name);
                Ok(self.register(ident, offset))
            }
            Some(Tok::IntLit(raw)) => {
                let value = parse_int_magnitude(&raw)
                    .map_err(|msg| ParseError { message: msg, offset })?;
                if value > i128::from(i64::MAX) {
                    return Err(ParseError {
                        message: "int literal out of range".to_string(),
                        offset,
                    });
                }
                let lit = self.fx.int(value as i64);
                Ok(self.register(lit, offset))
            }
            Some(Tok::UintLit(raw)) => {
                let value = parse_uint(&raw).map_err(|msg| ParseError { message: msg, offset })?;
                let lit = self.fx.uint(value);
                Ok(self.register(lit, offset))
            }
            Some(Tok::DoubleLit(raw)) => {
                let value: f64 = raw.parse().map_err(|_| ParseError {
                    message: "malformed double literal".to_string(),
                    offset,
                })?;
                let lit = self.fx.double(value);
                Ok(self.register(lit, offset))
            }
            Some(Tok::StringLit(value)) => {
                let lit = self.fx.string(value);
                Ok(self.register(lit, offset))
            }
            Some(Tok::BytesLit(value)) => {
                let lit = self.fx.bytes(value);
                Ok(self.register(lit, offset))
            }
            Some(Tok::True) => {
                let lit = self.fx.bool(true);
                Ok(self.register(lit, offset))
            }
            Some(Tok::False) => {
                let lit = self.fx.bool(false);
                Ok(self.register(lit, offset))
            }
            Some(Tok::Null) => {
                let lit = self.fx.null();
                Ok(self.register(lit, offset))
            }
            Some(Tok::Reserved(word)) => Err(ParseError {
                message: format!("'{word}' is a reserved word"),
                offset,
            }),
            Some(other) => Err(ParseError {
                message: format!("unexpected token {other:?}"),
                offset,
            }),
            None => Err(ParseError {
                message: "unexpected end of expression".to_string(),
                offset,
            }),
        }
    }

    fn parse_list_literal(&mut self, offset: u32) -> Result<Expr, ParseError> {
        let mut elements = Vec::new();
        let mut optional_indices = Vec::new();
        if !self.eat(&Tok::RBracket) {
            loop {
                if self.eat(&Tok::Question) {
                    optional_indices.push(elements.len() as u32);
                }
                elements.push(self.parse_expr()?);
                if self.eat(&Tok::Comma) {
                    continue;
                }
                self.expect(&Tok::RBracket, "']' after list elements")?;
                break;
            }
        }
        let list = self.fx.list_with_optionals(elements, optional_indices);
        Ok(self.register(list, offset))
    }

    fn parse_map_literal(&mut self, offset: u32) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        if !self.eat(&Tok::RBrace) {
            loop {
                let optional = self.eat(&Tok::Question);
                let key = self.parse_expr()?;
                self.expect(&Tok::Colon, "':' after map key")?;
                let value = self.parse_expr()?;
                entries.push(MapEntry {
                    key,
                    value,
                    optional,
                });
                if self.eat(&Tok::Comma) {
                    continue;
                }
                self.expect(&Tok::RBrace, "'}' after map entries")?;
                break;
            }
        }
        let map = self.fx.map(entries);
        Ok(self.register(map, offset))
    }

    fn parse_struct_literal(&mut self, offset: u32, message_name: String) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        if !self.eat(&Tok::RBrace) {
            loop {
                let optional = self.eat(&Tok::Question);
                let field = self.expect_ident("field name")?;
                self.expect(&Tok::Colon, "':' after field name")?;
                let value = self.parse_expr()?;
                entries.push(StructField {
                    field,
                    value,
                    optional,
                });
                if self.eat(&Tok::Comma) {
                    continue;
                }
                self.expect(&Tok::RBrace, "'}' after fields")?;
                break;
            }
        }
        let strukt = self.fx.strukt(message_name, entries);
        Ok(self.register(strukt, offset))
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(Tok::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }
}

/// Renders a pure ident/select chain as a dotted name for struct
/// construction.
fn chain_name(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name.clone()),
        ExprKind::Select(sel) if !sel.test_only => {
            chain_name(&sel.operand).map(|prefix| format!("{prefix}.{}", sel.field))
        }
        _ => None,
    }
}

fn parse_int_magnitude(raw: &str) -> Result<i128, String> {
    let value = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16)
    } else {
        raw.parse()
    };
    value.map_err(|_| "malformed int literal".to_string())
}

fn parse_uint(raw: &str) -> Result<u64, String> {
    let value = if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        raw.parse()
    };
    value.map_err(|_| "uint literal out of range".to_string())
}
