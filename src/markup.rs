//! CHTL markup parser.
//!
//! Works on the scanner's markup stream, where every style and script block
//! has been replaced by its placeholder. A style placeholder sitting directly
//! in an element body is a *local* style: its fragment is parsed here into the
//! element's declarations and rules, and the placeholder is marked consumed.
//! Every other placeholder stays in the tree for the merger.
//!
//! Positions are tracked in the text being parsed and converted to source
//! offsets through the scanner's [`SourceMap`].

use crate::ast::{
    Attribute, AttributeValue, CommentNode, Condition, ConditionalBlock, Document, Element, Node, NodeId,
    PlaceholderNode, StyleDeclaration, StyleRule, StyleValue, TextNode,
};
use crate::diagnostics::Span;
use crate::expr::{looks_like_expression, parse_expression};
use crate::scanner::{Fragment, FragmentKind, Placeholder, ScannedSource, SourceMap};
use crate::templates::{TemplateDefinition, TemplateKind, TemplateRegistry};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;
use thiserror::Error;

lazy_static! {
    static ref RESPONSIVE_RE: Regex = Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_]*)\$([A-Za-z]*|%)$").unwrap();
    static ref VAR_USE_RE: Regex =
        Regex::new(r"([A-Z][A-Za-z0-9_]*)\(\s*([A-Za-z_][A-Za-z0-9_-]*)\s*\)").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkupError {
    #[error("expected {expected}, found '{found}'")]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        span: Span,
    },
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str, span: Span },
    #[error("unknown {kind} template '{name}'")]
    UnknownTemplate {
        kind: TemplateKind,
        name: String,
        span: Span,
    },
    #[error("malformed condition: {reason}")]
    MalformedCondition { reason: String, span: Span },
    #[error("{kind} block is not allowed {context}")]
    MisplacedBlock {
        kind: FragmentKind,
        context: &'static str,
        span: Span,
    },
}

impl MarkupError {
    pub fn span(&self) -> Span {
        match self {
            MarkupError::UnexpectedToken { span, .. }
            | MarkupError::UnexpectedEof { span, .. }
            | MarkupError::UnknownTemplate { span, .. }
            | MarkupError::MalformedCondition { span, .. }
            | MarkupError::MisplacedBlock { span, .. } => *span,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CURSOR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum Origin<'a> {
    Markup(&'a SourceMap),
    /// Fragment text starting at this source offset.
    Source(usize),
}

#[derive(Debug, Clone)]
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    origin: Origin<'a>,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl<'a> Cursor<'a> {
    fn markup(text: &'a str, map: &'a SourceMap) -> Self {
        Cursor {
            text,
            pos: 0,
            origin: Origin::Markup(map),
        }
    }

    fn fragment(fragment: &'a Fragment) -> Self {
        Cursor {
            text: &fragment.text,
            pos: 0,
            origin: Origin::Source(fragment.body_range.start),
        }
    }

    fn to_source(&self, offset: usize) -> usize {
        match self.origin {
            Origin::Markup(map) => map.to_source(offset),
            Origin::Source(base) => base + offset,
        }
    }

    fn span(&self, start: usize, end: usize) -> Span {
        match self.origin {
            Origin::Markup(map) => map.span_to_source(Span::new(start, end)),
            Origin::Source(base) => Span::new(start, end).shift(base),
        }
    }

    fn span_from(&self, start: usize) -> Span {
        self.span(start, self.pos)
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.rest().starts_with(prefix)
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char, description: &'static str) -> Result<(), MarkupError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(description))
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if self.starts_with("//") {
                self.pos += self.rest().find('\n').unwrap_or(self.rest().len());
            } else if self.starts_with("/*") {
                self.pos += self.rest().find("*/").map_or(self.rest().len(), |i| i + 2);
            } else {
                return;
            }
        }
    }

    fn ident(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        if !rest.starts_with(is_ident_start) {
            return None;
        }
        let len = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
        self.pos += len;
        Some(&rest[..len])
    }

    /// Consume the identifier `word` if it is next.
    fn keyword(&mut self, word: &str) -> bool {
        let save = self.pos;
        match self.ident() {
            Some(found) if found == word => true,
            _ => {
                self.pos = save;
                false
            }
        }
    }

    /// False right after a word character, where a quote is an apostrophe.
    fn at_token_start(&self) -> bool {
        self.text[..self.pos]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_' || c == '\\'))
    }

    /// Raw text up to (not including) the first terminator at nesting depth
    /// zero. Quoted strings, parentheses, brackets and `{{ }}` operands are
    /// skipped as units. Returns the text and its start offset.
    fn raw_until(&mut self, terminators: &[char]) -> (&'a str, usize) {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            if depth == 0 && terminators.contains(&c) && !self.starts_with("{{") {
                break;
            }
            match c {
                '"' | '\'' if self.at_token_start() => {
                    self.bump();
                    while let Some(inner) = self.peek() {
                        self.bump();
                        if inner == '\\' {
                            self.bump();
                        } else if inner == c {
                            break;
                        }
                    }
                    continue;
                }
                '{' if self.starts_with("{{") => {
                    self.pos += self.rest().find("}}").map_or(self.rest().len(), |i| i + 2);
                    continue;
                }
                '(' | '[' => depth += 1,
                ')' | ']' => depth = depth.saturating_sub(1),
                _ => {}
            }
            self.bump();
        }
        (&self.text[start..self.pos], start)
    }

    /// Interior of a `{ .. }` whose opening brace was already consumed. The
    /// closing brace is consumed too.
    fn balanced_body(&mut self, description: &'static str) -> Result<(&'a str, usize), MarkupError> {
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(c) = self.peek() {
            match c {
                '"' | '\'' => {
                    self.raw_quoted(c);
                    continue;
                }
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = &self.text[start..self.pos];
                        self.bump();
                        return Ok((body, start));
                    }
                }
                _ => {}
            }
            self.bump();
        }
        Err(self.unexpected(description))
    }

    fn raw_quoted(&mut self, quote: char) {
        self.bump();
        while let Some(c) = self.peek() {
            self.bump();
            if c == '\\' {
                self.bump();
            } else if c == quote {
                return;
            }
        }
    }

    fn unexpected(&self, expected: &'static str) -> MarkupError {
        if self.at_end() {
            return MarkupError::UnexpectedEof {
                expected,
                span: self.span(self.pos, self.pos),
            };
        }
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(i, c)| *i > 0 && (c.is_whitespace() || !is_ident_char(*c)))
            .map_or(rest.len(), |(i, _)| i);
        MarkupError::UnexpectedToken {
            expected,
            found: rest[..len].to_string(),
            span: self.span(self.pos, self.pos + len),
        }
    }
}

/// Trim `raw` (found at `start`) and return the trimmed text with its offset.
fn trim_with_offset(raw: &str, start: usize) -> (&str, usize) {
    let leading = raw.len() - raw.trim_start().len();
    (raw.trim(), start + leading)
}

fn unquote(text: &str) -> String {
    let bytes = text.as_bytes();
    if text.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[text.len() - 1] == bytes[0] {
        let inner = &text[1..text.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        text.to_string()
    }
}

fn is_single_string(text: &str) -> bool {
    let Some(quote) = text.chars().next().filter(|c| *c == '"' || *c == '\'') else {
        return false;
    };
    let mut cursor = Cursor {
        text,
        pos: 0,
        origin: Origin::Source(0),
    };
    cursor.raw_quoted(quote);
    cursor.at_end() && text.len() >= 2
}

fn parse_responsive(text: &str) -> Option<(String, String)> {
    RESPONSIVE_RE
        .captures(text)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

/// Classify a declared style value. `base` is the source offset of `text`.
fn classify_style_value(text: &str, base: usize) -> StyleValue {
    if let Some((variable, unit)) = parse_responsive(text) {
        return StyleValue::Responsive { variable, unit };
    }
    if !is_single_string(text) && looks_like_expression(text) {
        if let Ok(expr) = parse_expression(text, base) {
            return StyleValue::Expr { expr };
        }
    }
    StyleValue::Literal {
        text: text.to_string(),
    }
}

/// Add `declaration`, replacing the value of an existing key in place.
fn push_declaration(owner: &mut Element, declaration: StyleDeclaration) {
    match owner.style.iter_mut().find(|d| d.key == declaration.key) {
        Some(existing) => *existing = declaration,
        None => owner.style.push(declaration),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse the markup stream of `scanned` into a document.
#[tracing::instrument(level = "debug", skip_all, fields(len = scanned.markup_text().len()))]
pub fn parse_markup(scanned: &ScannedSource) -> Result<Document, MarkupError> {
    let document = MarkupParser::new(scanned).parse()?;
    tracing::debug!(
        roots = document.children.len(),
        consumed_styles = document.consumed_styles.len(),
        "parsed markup"
    );
    Ok(document)
}

pub struct MarkupParser<'a> {
    scanned: &'a ScannedSource,
    templates: TemplateRegistry,
    next_id: NodeId,
    consumed: BTreeSet<Placeholder>,
    conditional_depth: usize,
    template_depth: usize,
}

impl<'a> MarkupParser<'a> {
    pub fn new(scanned: &'a ScannedSource) -> Self {
        MarkupParser {
            scanned,
            templates: TemplateRegistry::new(),
            next_id: 0,
            consumed: BTreeSet::new(),
            conditional_depth: 0,
            template_depth: 0,
        }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn parse(mut self) -> Result<Document, MarkupError> {
        let mut c = Cursor::markup(self.scanned.markup_text(), self.scanned.source_map());
        let mut children = Vec::new();

        loop {
            c.skip_trivia();
            if c.at_end() {
                break;
            }
            let start = c.pos;
            if c.starts_with("--") {
                children.push(self.comment(&mut c));
                continue;
            }
            match c.peek() {
                Some('[') => {
                    self.template_definition(&mut c)?;
                    continue;
                }
                Some('@') => {
                    let nodes = self.template_use(&mut c)?;
                    children.extend(nodes);
                    continue;
                }
                _ => {}
            }

            let Some(name) = c.ident() else {
                return Err(c.unexpected("element, text block or template"));
            };
            if let Some((fragment, placeholder)) = self.block(name) {
                children.push(Self::placeholder_node(fragment, placeholder, c.span_from(start)));
                continue;
            }
            c.skip_trivia();
            if c.peek() != Some('{') {
                return Err(c.unexpected("'{'"));
            }
            let node = if name == "text" {
                self.text_block(&mut c, start)?
            } else {
                Node::Element(self.element(&mut c, name, start)?)
            };
            children.push(node);
        }

        Ok(Document {
            children,
            consumed_styles: self.consumed,
        })
    }

    fn alloc_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// The style or script block whose placeholder is `name`.
    fn block(&self, name: &str) -> Option<(&'a Fragment, &'a Placeholder)> {
        let fragment = self.scanned.fragment(name)?;
        fragment.placeholder.as_ref().map(|placeholder| (fragment, placeholder))
    }

    fn placeholder_node(fragment: &Fragment, placeholder: &Placeholder, span: Span) -> Node {
        Node::Placeholder(PlaceholderNode {
            placeholder: placeholder.clone(),
            kind: fragment.kind,
            span,
        })
    }

    fn comment(&mut self, c: &mut Cursor<'a>) -> Node {
        let start = c.pos;
        c.pos += 2;
        let line_end = c.rest().find('\n').unwrap_or(c.rest().len());
        let value = c.rest()[..line_end].trim().to_string();
        c.pos += line_end;
        Node::Comment(CommentNode {
            value,
            span: c.span_from(start),
        })
    }

    fn text_block(&mut self, c: &mut Cursor<'a>, start: usize) -> Result<Node, MarkupError> {
        c.expect('{', "'{'")?;
        let (raw, _) = c.raw_until(&['}']);
        c.expect('}', "'}'")?;
        Ok(Node::Text(TextNode {
            value: unquote(raw.trim()),
            span: c.span_from(start),
        }))
    }

    fn element(&mut self, c: &mut Cursor<'a>, tag: &str, start: usize) -> Result<Element, MarkupError> {
        let node_id = self.alloc_id();
        c.expect('{', "'{'")?;
        let mut element = Element::new(node_id, tag, c.span_from(start));
        self.element_body(c, &mut element)?;
        element.span = c.span_from(start);
        Ok(element)
    }

    fn element_body(&mut self, c: &mut Cursor<'a>, element: &mut Element) -> Result<(), MarkupError> {
        loop {
            c.skip_trivia();
            if c.eat('}') {
                return Ok(());
            }
            if c.at_end() {
                return Err(c.unexpected("'}'"));
            }
            let start = c.pos;
            if c.starts_with("--") {
                element.children.push(self.comment(c));
                continue;
            }
            if c.peek() == Some('@') {
                let nodes = self.template_use(c)?;
                element.children.extend(nodes);
                continue;
            }

            let Some(name) = c.ident() else {
                return Err(c.unexpected("attribute, element or '}'"));
            };
            if let Some((fragment, placeholder)) = self.block(name) {
                self.block_in_element(element, fragment, placeholder, c.span_from(start))?;
                continue;
            }

            c.skip_trivia();
            match c.peek() {
                Some(':') | Some('=') => {
                    c.bump();
                    self.attribute(c, element, name, start)?;
                }
                Some('{') => match name {
                    "text" => {
                        let text = self.text_block(c, start)?;
                        element.children.push(text);
                    }
                    "if" => {
                        let anchor = element.children.len();
                        let chain = self.conditional_chain(c, anchor, start)?;
                        element.conditionals.push(chain);
                    }
                    "else" => {
                        return Err(MarkupError::UnexpectedToken {
                            expected: "element",
                            found: "else without if".to_string(),
                            span: c.span_from(start),
                        })
                    }
                    _ => {
                        let child = self.element(c, name, start)?;
                        element.children.push(Node::Element(child));
                    }
                },
                _ => return Err(c.unexpected("':' or '{'")),
            }
        }
    }

    fn block_in_element(
        &mut self,
        element: &mut Element,
        fragment: &'a Fragment,
        placeholder: &Placeholder,
        span: Span,
    ) -> Result<(), MarkupError> {
        if self.conditional_depth > 0 {
            return Err(MarkupError::MisplacedBlock {
                kind: fragment.kind,
                context: "inside a conditional block",
                span,
            });
        }
        match fragment.kind {
            FragmentKind::Style => {
                let mut c = Cursor::fragment(fragment);
                self.style_body(&mut c, element, true, false)?;
                self.consumed.insert(placeholder.clone());
                Ok(())
            }
            FragmentKind::Script if self.template_depth > 0 => Err(MarkupError::MisplacedBlock {
                kind: fragment.kind,
                context: "inside a template",
                span,
            }),
            _ => {
                element
                    .children
                    .push(Self::placeholder_node(fragment, placeholder, span));
                Ok(())
            }
        }
    }

    fn attribute(&mut self, c: &mut Cursor<'a>, element: &mut Element, name: &str, start: usize) -> Result<(), MarkupError> {
        let (raw, raw_start) = c.raw_until(&[';', '}']);
        c.eat(';');
        let (text, text_start) = trim_with_offset(raw, raw_start);
        let span = c.span_from(start);
        let text = self.substitute_vars(text, c.span(text_start, text_start + text.len()))?;

        if name == "text" {
            element.children.push(Node::Text(TextNode {
                value: unquote(&text),
                span,
            }));
            return Ok(());
        }

        let value = match parse_responsive(&text) {
            Some((variable, unit)) => AttributeValue::Responsive { variable, unit },
            None => AttributeValue::Literal { value: unquote(&text) },
        };
        match element.attributes.iter_mut().find(|attr| attr.name == name) {
            Some(existing) => {
                existing.value = value;
                existing.span = span;
            }
            None => element.attributes.push(Attribute {
                name: name.to_string(),
                value,
                span,
            }),
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Style bodies
    // ───────────────────────────────────────────────────────────────────────────

    /// Declarations, template includes and (when `allow_rules`) selector rules.
    /// With `closing`, the body ends at an unmatched `}`; otherwise at the end
    /// of the text.
    fn style_body(
        &mut self,
        c: &mut Cursor<'a>,
        owner: &mut Element,
        allow_rules: bool,
        closing: bool,
    ) -> Result<(), MarkupError> {
        loop {
            c.skip_trivia();
            if closing {
                if c.eat('}') {
                    return Ok(());
                }
                if c.at_end() {
                    return Err(c.unexpected("'}'"));
                }
            } else if c.at_end() {
                return Ok(());
            }

            let start = c.pos;
            if c.peek() == Some('@') || c.starts_with("inherit ") || c.starts_with("inherit@") {
                self.style_include(c, owner)?;
                continue;
            }

            let mut lookahead = c.clone();
            lookahead.raw_until(&['{', ';', '}']);
            if lookahead.peek() == Some('{') {
                let (raw, raw_start) = c.raw_until(&['{']);
                let (selector, selector_start) = trim_with_offset(raw, raw_start);
                if !allow_rules {
                    return Err(MarkupError::UnexpectedToken {
                        expected: "declaration",
                        found: selector.to_string(),
                        span: c.span(selector_start, selector_start + selector.len()),
                    });
                }
                c.expect('{', "'{'")?;
                let (body, _) = c.balanced_body("'}'")?;
                self.local_rule(owner, selector, body.trim(), c.span_from(start));
                continue;
            }

            let (raw_key, key_start) = c.raw_until(&[':', ';', '}']);
            let (key, key_start) = trim_with_offset(raw_key, key_start);
            if !c.eat(':') {
                return Err(MarkupError::UnexpectedToken {
                    expected: "':' after property name",
                    found: key.to_string(),
                    span: c.span(key_start, key_start + key.len()),
                });
            }
            let (raw, raw_start) = c.raw_until(&[';', '}']);
            c.eat(';');
            let declaration = self.declaration(c, key, raw, raw_start, start, false)?;
            push_declaration(owner, declaration);
        }
    }

    /// `@Style Name;` or `inherit @Style Name;`
    fn style_include(&mut self, c: &mut Cursor<'a>, owner: &mut Element) -> Result<(), MarkupError> {
        let start = c.pos;
        if c.keyword("inherit") {
            c.skip_trivia();
        }
        c.expect('@', "'@Style'")?;
        if !c.keyword("Style") {
            return Err(c.unexpected("'@Style'"));
        }
        c.skip_trivia();
        let Some(name) = c.ident() else {
            return Err(c.unexpected("template name"));
        };
        c.skip_trivia();
        c.eat(';');
        let declarations = self
            .templates
            .lookup_style(name)
            .ok_or_else(|| MarkupError::UnknownTemplate {
                kind: TemplateKind::Style,
                name: name.to_string(),
                span: c.span_from(start),
            })?
            .to_vec();
        for declaration in declarations {
            push_declaration(owner, declaration);
        }
        Ok(())
    }

    fn local_rule(&mut self, owner: &mut Element, selector: &str, body: &str, span: Span) {
        let own_name = |prefix: char| {
            selector
                .strip_prefix(prefix)
                .map(|rest| rest.split(|c: char| !is_ident_char(c)).next().unwrap_or(""))
                .filter(|name| !name.is_empty())
        };
        if let Some(class) = own_name('.') {
            owner.add_class(class);
        } else if let Some(id) = own_name('#') {
            owner.set_id_if_absent(id);
        }
        owner.rules.push(StyleRule {
            selector: selector.to_string(),
            body: body.to_string(),
            span,
        });
    }

    fn declaration(
        &mut self,
        c: &Cursor<'a>,
        key: &str,
        raw: &str,
        raw_start: usize,
        start: usize,
        in_conditional: bool,
    ) -> Result<StyleDeclaration, MarkupError> {
        let (text, text_start) = trim_with_offset(raw, raw_start);
        let value_span = c.span(text_start, text_start + text.len());
        if key.is_empty() || !key.starts_with(|ch: char| is_ident_start(ch) || ch == '-') {
            return Err(MarkupError::UnexpectedToken {
                expected: "property name",
                found: key.to_string(),
                span: c.span(start, text_start),
            });
        }
        if text.is_empty() {
            return Err(MarkupError::UnexpectedToken {
                expected: "property value",
                found: c.rest().chars().next().map(String::from).unwrap_or_default(),
                span: value_span,
            });
        }
        let text = self.substitute_vars(text, value_span)?;
        let value = classify_style_value(&text, value_span.start);
        if in_conditional && value.is_responsive() {
            return Err(MarkupError::UnexpectedToken {
                expected: "static value in conditional block",
                found: text,
                span: value_span,
            });
        }
        Ok(StyleDeclaration {
            key: key.to_string(),
            value,
            span: c.span(start, c.pos),
        })
    }

    /// Replace `Group(key)` uses of defined `@Var` groups.
    fn substitute_vars(&self, text: &str, span: Span) -> Result<String, MarkupError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in VAR_USE_RE.captures_iter(text) {
            let group = &caps[1];
            if !self.templates.has_var_group(group) {
                continue;
            }
            let key = &caps[2];
            let value = self
                .templates
                .lookup_var(group, key)
                .ok_or_else(|| MarkupError::UnknownTemplate {
                    kind: TemplateKind::Var,
                    name: format!("{}({})", group, key),
                    span,
                })?;
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&text[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Conditionals
    // ───────────────────────────────────────────────────────────────────────────

    fn conditional_chain(&mut self, c: &mut Cursor<'a>, anchor: usize, start: usize) -> Result<ConditionalBlock, MarkupError> {
        let mut branches = vec![self.conditional_branch(c, true, start)?];
        loop {
            let save = c.pos;
            c.skip_trivia();
            let else_start = c.pos;
            if !c.keyword("else") {
                c.pos = save;
                break;
            }
            c.skip_trivia();
            if c.keyword("if") {
                c.skip_trivia();
                branches.push(self.conditional_branch(c, true, else_start)?);
            } else {
                branches.push(self.conditional_branch(c, false, else_start)?);
                break;
            }
        }

        let mut next: Option<ConditionalBlock> = None;
        for mut branch in branches.into_iter().rev() {
            branch.next = next.map(Box::new);
            next = Some(branch);
        }
        let mut head = next.ok_or_else(|| c.unexpected("'if'"))?;
        head.anchor = anchor;
        Ok(head)
    }

    fn conditional_branch(
        &mut self,
        c: &mut Cursor<'a>,
        requires_condition: bool,
        start: usize,
    ) -> Result<ConditionalBlock, MarkupError> {
        c.expect('{', "'{'")?;
        self.conditional_depth += 1;
        let result = self.conditional_body(c, requires_condition, start);
        self.conditional_depth -= 1;
        result
    }

    fn conditional_body(
        &mut self,
        c: &mut Cursor<'a>,
        requires_condition: bool,
        start: usize,
    ) -> Result<ConditionalBlock, MarkupError> {
        let mut condition: Option<Condition> = None;
        let mut body = Vec::new();
        let mut children = Vec::new();

        loop {
            c.skip_trivia();
            if c.eat('}') {
                break;
            }
            if c.at_end() {
                return Err(c.unexpected("'}'"));
            }
            let item_start = c.pos;
            if c.starts_with("--") {
                children.push(self.comment(c));
                continue;
            }
            if c.peek() == Some('@') {
                let nodes = self.template_use(c)?;
                children.extend(nodes);
                continue;
            }
            let Some(name) = c.ident() else {
                return Err(c.unexpected("condition, declaration or element"));
            };
            if let Some((fragment, _)) = self.block(name) {
                return Err(MarkupError::MisplacedBlock {
                    kind: fragment.kind,
                    context: "inside a conditional block",
                    span: c.span_from(item_start),
                });
            }

            c.skip_trivia();
            match c.peek() {
                Some(':') => {
                    c.bump();
                    let (raw, raw_start) = c.raw_until(&[',', ';', '}']);
                    if !c.eat(',') {
                        c.eat(';');
                    }
                    if name != "condition" {
                        body.push(self.declaration(c, name, raw, raw_start, item_start, true)?);
                        continue;
                    }
                    let span = c.span_from(item_start);
                    if !requires_condition {
                        return Err(MarkupError::MalformedCondition {
                            reason: "'else' takes no condition".to_string(),
                            span,
                        });
                    }
                    if condition.is_some() {
                        return Err(MarkupError::MalformedCondition {
                            reason: "a branch has exactly one condition".to_string(),
                            span,
                        });
                    }
                    let (text, text_start) = trim_with_offset(raw, raw_start);
                    let expr = parse_expression(text, c.to_source(text_start)).map_err(|err| {
                        MarkupError::MalformedCondition {
                            reason: err.message,
                            span: err.span,
                        }
                    })?;
                    condition = Some(Condition {
                        expr,
                        text: text.to_string(),
                    });
                }
                Some('{') => match name {
                    "text" => children.push(self.text_block(c, item_start)?),
                    "if" | "else" => {
                        return Err(MarkupError::UnexpectedToken {
                            expected: "element",
                            found: format!("nested '{}'", name),
                            span: c.span_from(item_start),
                        })
                    }
                    _ => children.push(Node::Element(self.element(c, name, item_start)?)),
                },
                _ => return Err(c.unexpected("':' or '{'")),
            }
        }

        let span = c.span_from(start);
        if requires_condition && condition.is_none() {
            return Err(MarkupError::MalformedCondition {
                reason: "missing 'condition'".to_string(),
                span,
            });
        }
        Ok(ConditionalBlock {
            condition,
            body,
            children,
            next: None,
            anchor: 0,
            span,
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Templates
    // ───────────────────────────────────────────────────────────────────────────

    fn template_definition(&mut self, c: &mut Cursor<'a>) -> Result<(), MarkupError> {
        let start = c.pos;
        c.expect('[', "'['")?;
        match c.ident() {
            Some("Template") | Some("Custom") => {}
            _ => return Err(c.unexpected("'Template' or 'Custom'")),
        }
        c.expect(']', "']'")?;
        c.skip_trivia();
        c.expect('@', "'@Style', '@Element' or '@Var'")?;
        let kind = match c.ident() {
            Some("Style") => TemplateKind::Style,
            Some("Element") => TemplateKind::Element,
            Some("Var") => TemplateKind::Var,
            _ => return Err(c.unexpected("'@Style', '@Element' or '@Var'")),
        };
        c.skip_trivia();
        let Some(name) = c.ident() else {
            return Err(c.unexpected("template name"));
        };
        c.skip_trivia();
        c.expect('{', "'{'")?;

        self.template_depth += 1;
        let definition = self.template_body(c, kind, start);
        self.template_depth -= 1;
        self.templates.define(name, definition?);
        Ok(())
    }

    fn template_body(&mut self, c: &mut Cursor<'a>, kind: TemplateKind, start: usize) -> Result<TemplateDefinition, MarkupError> {
        let mut holder = Element::new(NodeId::MAX, "", c.span_from(start));
        match kind {
            TemplateKind::Style => {
                self.style_body(c, &mut holder, false, true)?;
                Ok(TemplateDefinition::Style {
                    declarations: holder.style,
                })
            }
            TemplateKind::Element => {
                self.element_body(c, &mut holder)?;
                if let Some(attr) = holder.attributes.first() {
                    return Err(MarkupError::UnexpectedToken {
                        expected: "element or text",
                        found: attr.name.clone(),
                        span: attr.span,
                    });
                }
                if !holder.style.is_empty() || !holder.conditionals.is_empty() {
                    return Err(MarkupError::UnexpectedToken {
                        expected: "element or text",
                        found: "style or conditional".to_string(),
                        span: c.span_from(start),
                    });
                }
                Ok(TemplateDefinition::Element {
                    nodes: holder.children,
                })
            }
            TemplateKind::Var => {
                let mut values = Vec::new();
                loop {
                    c.skip_trivia();
                    if c.eat('}') {
                        break;
                    }
                    let Some(key) = c.ident() else {
                        return Err(c.unexpected("variable name or '}'"));
                    };
                    c.skip_trivia();
                    c.expect(':', "':'")?;
                    let (raw, _) = c.raw_until(&[';', '}']);
                    c.eat(';');
                    values.push((key.to_string(), unquote(raw.trim())));
                }
                Ok(TemplateDefinition::Var { values })
            }
        }
    }

    /// `@Element Name;` expands to a fresh copy of the template's nodes.
    fn template_use(&mut self, c: &mut Cursor<'a>) -> Result<Vec<Node>, MarkupError> {
        let start = c.pos;
        c.expect('@', "'@Element'")?;
        if !c.keyword("Element") {
            return Err(c.unexpected("'@Element'"));
        }
        c.skip_trivia();
        let Some(name) = c.ident() else {
            return Err(c.unexpected("template name"));
        };
        c.skip_trivia();
        c.eat(';');
        let nodes = self
            .templates
            .lookup_element(name)
            .ok_or_else(|| MarkupError::UnknownTemplate {
                kind: TemplateKind::Element,
                name: name.to_string(),
                span: c.span_from(start),
            })?
            .to_vec();
        Ok(nodes.into_iter().map(|node| self.renumber(node)).collect())
    }

    /// Give every element of an instantiated template a fresh pre-order id.
    fn renumber(&mut self, mut node: Node) -> Node {
        if let Node::Element(element) = &mut node {
            element.node_id = self.alloc_id();
            let children = std::mem::take(&mut element.children);
            element.children = children.into_iter().map(|child| self.renumber(child)).collect();
            for chain in &mut element.conditionals {
                let mut branch = Some(chain);
                while let Some(current) = branch {
                    let children = std::mem::take(&mut current.children);
                    current.children = children.into_iter().map(|child| self.renumber(child)).collect();
                    branch = current.next.as_deref_mut();
                }
            }
        }
        node
    }
}
