//! Conditional expression syntax.
//!
//! Conditions and computed style values share one small grammar:
//!
//! ```text
//! ternary  := or ('?' ternary ':' ternary)?
//! or       := and ('||' and)*
//! and      := cmp ('&&' cmp)*
//! cmp      := add (('>' | '<' | '>=' | '<=' | '==' | '!=') add)?
//! add      := mul (('+' | '-') mul)*
//! mul      := unary (('*' | '/') unary)*
//! unary    := ('!' | '-') unary | primary
//! primary  := number unit? | string | bool | ident | ref | '{{' .. '}}' | '(' ternary ')'
//! ref      := '#' ident '.' prop | '.' ident '.' prop | tag '.' prop
//! ```

use crate::ast::Selector;
use crate::diagnostics::Span;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExprKind {
    Number { value: f64, unit: String },
    Str { value: String },
    Bool { value: bool },
    /// Bare property name of the enclosing element, or a CSS keyword.
    Ident { name: String },
    PropertyRef { selector: Selector, property: String },
    /// `{{ .. }}` operand, only known at runtime.
    Dynamic { code: String },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Ternary { cond: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BinaryOp {
    Or,
    And,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn as_js(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Gt => ">",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Le => "<=",
            BinaryOp::Eq => "===",
            BinaryOp::Ne => "!==",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

impl Expr {
    fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }

    pub fn is_dynamic(&self) -> bool {
        match &self.kind {
            ExprKind::Dynamic { .. } => true,
            ExprKind::Unary { operand, .. } => operand.is_dynamic(),
            ExprKind::Binary { lhs, rhs, .. } => lhs.is_dynamic() || rhs.is_dynamic(),
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => cond.is_dynamic() || then.is_dynamic() || otherwise.is_dynamic(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExprParseError {
    pub message: String,
    pub span: Span,
}

impl ExprParseError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        ExprParseError {
            message: message.into(),
            span,
        }
    }
}

lazy_static! {
    static ref LOGIC_RE: Regex = Regex::new(r"\?|>|<|==|!=|&&|\|\||\{\{").unwrap();
    static ref ARITHMETIC_RE: Regex = Regex::new(r"\s[-+*/]\s").unwrap();
    static ref OPERAND_RE: Regex =
        Regex::new(r"^\(*\s*(?:-?(?:\d+(?:\.\d+)?|\.\d+)([A-Za-z]+|%)?|([A-Za-z_][\w-]*))\s*\)*$").unwrap();
    static ref SELECTOR_REF_RE: Regex =
        Regex::new(r"(?:^|[\s(!])[#.][A-Za-z_][\w-]*\.[A-Za-z_]").unwrap();
}

/// CSS keywords that appear between slashes in shorthands like `grid-row`.
const CSS_KEYWORDS: &[&str] = &["auto", "span", "none", "inherit", "initial", "unset", "revert"];

/// Whether a style value reads like an expression rather than plain CSS.
/// Callers still fall back to literal text when parsing fails.
pub fn looks_like_expression(text: &str) -> bool {
    if LOGIC_RE.is_match(text) || SELECTOR_REF_RE.is_match(text) {
        return true;
    }
    ARITHMETIC_RE.is_match(text) && is_property_arithmetic(text)
}

/// Arithmetic counts only when an operand carries a unit or a number is
/// combined with a property name. `16 / 9` and `a / b` stay CSS.
fn is_property_arithmetic(text: &str) -> bool {
    let (mut unit, mut number, mut reference) = (false, false, false);
    for operand in ARITHMETIC_RE.split(text) {
        let Some(caps) = OPERAND_RE.captures(operand.trim()) else {
            return false;
        };
        match (caps.get(1), caps.get(2)) {
            (_, Some(name)) if CSS_KEYWORDS.contains(&name.as_str()) => return false,
            (_, Some(_)) => reference = true,
            (Some(_), None) => unit = true,
            (None, None) => number = true,
        }
    }
    unit || (reference && number)
}

// ═══════════════════════════════════════════════════════════════════════════════
// LEXER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(f64, String),
    Str(String),
    Ident(String),
    Hash(String),
    DotIdent(String),
    Dynamic(String),
    Op(&'static str),
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    span: Span,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
    base: usize,
}

impl<'a> Lexer<'a> {
    fn span(&self, start: usize) -> Span {
        Span::new(self.base + start, self.base + self.pos)
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.text[self.pos..].chars().nth(offset)
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.text[start..self.pos]
    }

    /// Identifier chars, without swallowing a trailing `-` that belongs to an
    /// operator.
    fn ident(&mut self) -> &'a str {
        let name = self.take_while(is_ident_char);
        let trimmed = name.trim_end_matches('-');
        self.pos -= name.len() - trimmed.len();
        trimmed
    }

    fn tokens(mut self) -> Result<Vec<Token>, ExprParseError> {
        let mut out = Vec::new();
        loop {
            self.take_while(char::is_whitespace);
            let start = self.pos;
            let Some(c) = self.peek() else { break };

            let tok = match c {
                '0'..='9' => self.number(),
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.number(),
                '"' | '\'' => self.string(c)?,
                '{' if self.peek_at(1) == Some('{') => self.dynamic()?,
                '#' => {
                    self.pos += 1;
                    let name = self.ident();
                    if name.is_empty() {
                        return Err(ExprParseError::new("expected an id after '#'", self.span(start)));
                    }
                    Tok::Hash(name.to_string())
                }
                '.' if self.peek_at(1).is_some_and(is_ident_start) => {
                    self.pos += 1;
                    Tok::DotIdent(self.ident().to_string())
                }
                c if is_ident_start(c) => Tok::Ident(self.ident().to_string()),
                '(' => {
                    self.pos += 1;
                    Tok::LParen
                }
                ')' => {
                    self.pos += 1;
                    Tok::RParen
                }
                _ => self.operator(start)?,
            };
            out.push(Token {
                tok,
                span: self.span(start),
            });
        }
        Ok(out)
    }

    fn number(&mut self) -> Tok {
        let start = self.pos;
        self.take_while(|c| c.is_ascii_digit());
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            self.take_while(|c| c.is_ascii_digit());
        }
        let value = self.text[start..self.pos].parse::<f64>().unwrap_or(0.0);
        let unit = if self.peek() == Some('%') {
            self.pos += 1;
            "%".to_string()
        } else {
            self.take_while(|c| c.is_ascii_alphabetic()).to_string()
        };
        Tok::Number(value, unit)
    }

    fn string(&mut self, quote: char) -> Result<Tok, ExprParseError> {
        let start = self.pos;
        self.pos += 1;
        let mut value = String::new();
        while let Some(c) = self.peek() {
            self.pos += c.len_utf8();
            match c {
                '\\' => {
                    if let Some(escaped) = self.peek() {
                        self.pos += escaped.len_utf8();
                        value.push(escaped);
                    }
                }
                c if c == quote => return Ok(Tok::Str(value)),
                c => value.push(c),
            }
        }
        Err(ExprParseError::new("unterminated string", self.span(start)))
    }

    fn dynamic(&mut self) -> Result<Tok, ExprParseError> {
        let start = self.pos;
        match self.text[self.pos + 2..].find("}}") {
            Some(end) => {
                let code = self.text[self.pos + 2..self.pos + 2 + end].trim().to_string();
                self.pos += 2 + end + 2;
                if code.is_empty() {
                    return Err(ExprParseError::new("empty '{{ }}' operand", self.span(start)));
                }
                Ok(Tok::Dynamic(code))
            }
            None => {
                self.pos = self.text.len();
                Err(ExprParseError::new("unterminated '{{' operand", self.span(start)))
            }
        }
    }

    fn operator(&mut self, start: usize) -> Result<Tok, ExprParseError> {
        const OPERATORS: [&str; 16] = [
            ">=", "<=", "==", "!=", "&&", "||", ">", "<", "!", "?", ":", "+", "-", "*", "/", "=",
        ];
        let rest = &self.text[self.pos..];
        for op in OPERATORS {
            if rest.starts_with(op) {
                self.pos += op.len();
                if op == "=" {
                    return Err(ExprParseError::new("'=' is not an operator; use '=='", self.span(start)));
                }
                return Ok(Tok::Op(op));
            }
        }
        let c = rest.chars().next().unwrap_or(' ');
        self.pos += c.len_utf8();
        Err(ExprParseError::new(
            format!("unexpected character '{}'", c),
            self.span(start),
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse `text` completely. `base` is the source offset of `text`, so spans in
/// the result point into the compilation unit.
pub fn parse_expression(text: &str, base: usize) -> Result<Expr, ExprParseError> {
    let tokens = Lexer { text, pos: 0, base }.tokens()?;
    let end = Span::point(base + text.len());
    let mut parser = Parser {
        tokens,
        pos: 0,
        end,
    };
    if parser.tokens.is_empty() {
        return Err(ExprParseError::new("expected an expression", end));
    }
    let expr = parser.ternary()?;
    if let Some(extra) = parser.tokens.get(parser.pos) {
        return Err(ExprParseError::new("unexpected trailing input", extra.span));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: Span,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map_or(self.end, |t| t.span)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprParseError> {
        let cond = self.or()?;
        if !self.eat_op("?") {
            return Ok(cond);
        }
        let then = self.ternary()?;
        if !self.eat_op(":") {
            return Err(ExprParseError::new("expected ':' in conditional expression", self.peek_span()));
        }
        let otherwise = self.ternary()?;
        let span = cond.span.to(otherwise.span);
        Ok(Expr::new(
            ExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            span,
        ))
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ExprParseError>,
        repeat: bool,
    ) -> Result<Expr, ExprParseError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (text, op) in ops {
                if self.eat_op(text) {
                    let rhs = next(self)?;
                    let span = lhs.span.to(rhs.span);
                    lhs = Expr::new(
                        ExprKind::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                        span,
                    );
                    if repeat {
                        continue 'outer;
                    }
                    break 'outer;
                }
            }
            break;
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr, ExprParseError> {
        self.binary_level(&[("||", BinaryOp::Or)], Self::and, true)
    }

    fn and(&mut self) -> Result<Expr, ExprParseError> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::comparison, true)
    }

    fn comparison(&mut self) -> Result<Expr, ExprParseError> {
        self.binary_level(
            &[
                (">=", BinaryOp::Ge),
                ("<=", BinaryOp::Le),
                (">", BinaryOp::Gt),
                ("<", BinaryOp::Lt),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
            ],
            Self::additive,
            false,
        )
    }

    fn additive(&mut self) -> Result<Expr, ExprParseError> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::multiplicative,
            true,
        )
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprParseError> {
        self.binary_level(&[("*", BinaryOp::Mul), ("/", BinaryOp::Div)], Self::unary, true)
    }

    fn unary(&mut self) -> Result<Expr, ExprParseError> {
        let start = self.peek_span();
        let op = if self.eat_op("!") {
            UnaryOp::Not
        } else if self.eat_op("-") {
            UnaryOp::Neg
        } else {
            return self.primary();
        };
        let operand = self.unary()?;
        let span = start.to(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    /// Property name directly attached to the previous token (`#a.width`).
    fn attached_property(&mut self, previous: Span) -> Option<(String, Span)> {
        let token = self.tokens.get(self.pos)?;
        match &token.tok {
            Tok::DotIdent(name) if token.span.start == previous.end => {
                let result = (name.clone(), token.span);
                self.pos += 1;
                Some(result)
            }
            _ => None,
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprParseError> {
        let Some(token) = self.tokens.get(self.pos).cloned() else {
            return Err(ExprParseError::new("unexpected end of expression", self.end));
        };
        self.pos += 1;
        let span = token.span;

        let kind = match token.tok {
            Tok::Number(value, unit) => ExprKind::Number { value, unit },
            Tok::Str(value) => ExprKind::Str { value },
            Tok::Dynamic(code) => ExprKind::Dynamic { code },
            Tok::Ident(name) if name == "true" || name == "false" => ExprKind::Bool {
                value: name == "true",
            },
            Tok::Ident(name) => match self.attached_property(span) {
                Some((property, end)) => {
                    return Ok(Expr::new(
                        ExprKind::PropertyRef {
                            selector: Selector::Tag(name),
                            property,
                        },
                        span.to(end),
                    ))
                }
                None => ExprKind::Ident { name },
            },
            Tok::Hash(id) => {
                let (property, end) = self.attached_property(span).ok_or_else(|| {
                    ExprParseError::new(format!("expected '.property' after '#{}'", id), span)
                })?;
                return Ok(Expr::new(
                    ExprKind::PropertyRef {
                        selector: Selector::Id(id),
                        property,
                    },
                    span.to(end),
                ));
            }
            Tok::DotIdent(class) => {
                let (property, end) = self.attached_property(span).ok_or_else(|| {
                    ExprParseError::new(format!("expected '.property' after '.{}'", class), span)
                })?;
                return Ok(Expr::new(
                    ExprKind::PropertyRef {
                        selector: Selector::Class(class),
                        property,
                    },
                    span.to(end),
                ));
            }
            Tok::LParen => {
                let inner = self.ternary()?;
                if !matches!(self.peek(), Some(Tok::RParen)) {
                    return Err(ExprParseError::new("expected ')'", self.peek_span()));
                }
                let close = self.peek_span();
                self.pos += 1;
                return Ok(Expr::new(inner.kind, span.to(close)));
            }
            Tok::RParen | Tok::Op(_) => {
                return Err(ExprParseError::new("expected an operand", span));
            }
        };
        Ok(Expr::new(kind, span))
    }
}
