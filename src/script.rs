//! CHTL-JS parsing.
//!
//! A script body is plain JavaScript with a handful of enhancements layered on
//! top: `{{selector}}` element lookups, `->` member access, the `Listen` and
//! `Delegate` behavior blocks, the `&->` event-binding operator and `Animate`
//! expressions. Everything else passes through as raw text.

use crate::bridge::Bridge;
use crate::diagnostics::Span;
use serde::Serialize;
use thiserror::Error;

const HTML_TAGS: &[&str] = &[
    "a", "article", "aside", "audio", "body", "button", "canvas", "code", "dialog", "div", "footer", "form",
    "h1", "h2", "h3", "h4", "h5", "h6", "header", "img", "input", "label", "li", "main", "nav", "ol", "option",
    "p", "pre", "section", "select", "span", "strong", "table", "tbody", "td", "textarea", "th", "thead", "tr",
    "ul", "video",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("unterminated enhanced selector")]
    UnterminatedSelector { span: Span },

    #[error("empty enhanced selector")]
    EmptySelector { span: Span },

    #[error("malformed {keyword} block: {reason}")]
    MalformedBlock {
        keyword: &'static str,
        reason: String,
        span: Span,
    },

    #[error("unterminated {keyword} block")]
    UnterminatedBlock { keyword: &'static str, span: Span },

    #[error("`{{{{&}}}}` used in a script that is not inside an element")]
    MissingContext { span: Span },
}

impl ScriptError {
    pub fn span(&self) -> Span {
        match self {
            ScriptError::UnterminatedSelector { span }
            | ScriptError::EmptySelector { span }
            | ScriptError::MalformedBlock { span, .. }
            | ScriptError::UnterminatedBlock { span, .. }
            | ScriptError::MissingContext { span } => *span,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AST
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SelectorTarget {
    /// `{{&}}`: the element enclosing the script block.
    Ampersand,
    Id { name: String },
    Class { name: String },
    Tag { name: String },
    /// A bare name that is not an HTML tag. Resolved at runtime as id, then
    /// class, then tag.
    Auto { name: String },
    /// Anything with combinators or attribute selectors.
    Query { selector: String },
    Indexed { base: Box<SelectorTarget>, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnhancedSelector {
    pub target: SelectorTarget,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Handler {
    pub event: String,
    pub body: Vec<ScriptItem>,
    pub span: Span,
}

/// One `target &-> event: handler` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventBinding {
    pub target: EnhancedSelector,
    pub handlers: Vec<Handler>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Easing {
    #[default]
    Linear,
    Ease,
    EaseIn,
    EaseOut,
    EaseInOut,
}

impl Easing {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "linear" => Easing::Linear,
            "ease" => Easing::Ease,
            "ease-in" => Easing::EaseIn,
            "ease-out" => Easing::EaseOut,
            "ease-in-out" => Easing::EaseInOut,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    #[default]
    Normal,
    Reverse,
    Alternate,
}

/// Style properties as `(kebab-case name, JS value)` pairs.
pub type StyleFrame = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Keyframe {
    /// Progress in `[0, 1]`, as written.
    pub at: String,
    pub properties: StyleFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Animation {
    pub targets: Vec<EnhancedSelector>,
    pub duration: u64,
    pub delay: u64,
    /// `-1` repeats forever.
    pub loops: i64,
    pub easing: Easing,
    pub direction: Direction,
    pub begin: StyleFrame,
    pub when: Vec<Keyframe>,
    pub end: StyleFrame,
    pub callback: Option<Vec<ScriptItem>>,
    pub span: Span,
}

impl Animation {
    fn new(span: Span) -> Self {
        Animation {
            targets: Vec::new(),
            duration: 1000,
            delay: 0,
            loops: 1,
            easing: Easing::default(),
            direction: Direction::default(),
            begin: Vec::new(),
            when: Vec::new(),
            end: Vec::new(),
            callback: None,
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ScriptItem {
    Raw {
        text: String,
    },
    Selector {
        selector: EnhancedSelector,
    },
    /// `->`
    Arrow,
    Listen {
        target: EnhancedSelector,
        handlers: Vec<Handler>,
    },
    Delegate {
        parent: EnhancedSelector,
        targets: Vec<EnhancedSelector>,
        handlers: Vec<Handler>,
    },
    /// A whole `&->` statement, possibly chained over several targets.
    EventBind {
        bindings: Vec<EventBinding>,
    },
    Animate {
        animation: Box<Animation>,
    },
    VarDecl {
        keyword: String,
        name: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptAst {
    pub items: Vec<ScriptItem>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse a script body found at source offset `base`. Variable declarations
/// are recorded in `bridge`.
pub fn parse_script(text: &str, base: usize, bridge: &mut Bridge) -> Result<ScriptAst, ScriptError> {
    let items = parse_items(text, base, bridge)?;
    tracing::trace!(items = items.len(), "parsed script");
    Ok(ScriptAst { items })
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// End of a string, template literal or comment starting at `i`, if one does.
pub(crate) fn skip_literal(bytes: &[u8], i: usize) -> Option<usize> {
    match bytes[i] {
        quote @ (b'"' | b'\'' | b'`') => {
            let mut j = i + 1;
            while j < bytes.len() {
                match bytes[j] {
                    b'\\' => j += 2,
                    b if b == quote => return Some(j + 1),
                    _ => j += 1,
                }
            }
            Some(bytes.len())
        }
        b'/' if bytes.get(i + 1) == Some(&b'/') => Some(
            bytes[i..]
                .iter()
                .position(|b| *b == b'\n')
                .map_or(bytes.len(), |p| i + p),
        ),
        b'/' if bytes.get(i + 1) == Some(&b'*') => Some(
            bytes[i + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(bytes.len(), |p| i + 2 + p + 2),
        ),
        _ => None,
    }
}

/// Index just past the `}` matching the `{` at `open`.
pub(crate) fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Ranges of `text` separated by top-level occurrences of `separator`.
fn split_top_level(text: &str, separator: u8) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b if b == separator && depth == 0 => {
                parts.push((start, i));
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push((start, bytes.len()));
    parts
}

fn flush_raw(items: &mut Vec<ScriptItem>, raw: &str) {
    if raw.is_empty() {
        return;
    }
    if let Some(ScriptItem::Raw { text }) = items.last_mut() {
        text.push_str(raw);
    } else {
        items.push(ScriptItem::Raw { text: raw.to_string() });
    }
}

fn parse_items(text: &str, base: usize, bridge: &mut Bridge) -> Result<Vec<ScriptItem>, ScriptError> {
    let bytes = text.as_bytes();
    let mut items = Vec::new();
    let mut raw_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }

        if bytes[i..].starts_with(b"{{") {
            flush_raw(&mut items, &text[raw_start..i]);
            let (selector, end) = enhanced_selector(text, i, base)?;
            items.push(ScriptItem::Selector { selector });
            i = end;
            raw_start = i;
            continue;
        }

        if bytes[i..].starts_with(b"&->") {
            flush_raw(&mut items, &text[raw_start..i]);
            let target = pop_target(&mut items, "&->", Span::new(base + i, base + i + 3))?;
            let (item, end) = event_bind(text, i, target, base, bridge)?;
            items.push(item);
            i = end;
            raw_start = i;
            continue;
        }

        if bytes[i..].starts_with(b"->") {
            flush_raw(&mut items, &text[raw_start..i]);
            let arrow = i;
            i += 2;
            if let Some((keyword, open)) = behavior_keyword(text, i) {
                let end = matching_brace(bytes, open).ok_or(ScriptError::UnterminatedBlock {
                    keyword,
                    span: Span::new(base + arrow, base + bytes.len()),
                })?;
                let target = pop_target(&mut items, keyword, Span::new(base + arrow, base + end))?;
                let body = &text[open + 1..end - 1];
                items.push(behavior(keyword, target, body, base + open + 1, bridge)?);
                i = end;
            } else {
                items.push(ScriptItem::Arrow);
            }
            raw_start = i;
            continue;
        }

        if is_ident_start(bytes[i]) && (i == 0 || !is_ident_char(bytes[i - 1])) {
            let end = i + bytes[i..].iter().take_while(|b| is_ident_char(**b)).count();
            let word = &text[i..end];
            let open = skip_ws(text, end);
            if word == "Animate" && bytes.get(open) == Some(&b'{') {
                flush_raw(&mut items, &text[raw_start..i]);
                let close = matching_brace(bytes, open).ok_or(ScriptError::UnterminatedBlock {
                    keyword: "Animate",
                    span: Span::new(base + i, base + bytes.len()),
                })?;
                let span = Span::new(base + i, base + close);
                let animation = animation(&text[open + 1..close - 1], base + open + 1, span, bridge)?;
                items.push(ScriptItem::Animate {
                    animation: Box::new(animation),
                });
                i = close;
                raw_start = i;
                continue;
            }
            if matches!(word, "let" | "const" | "var") {
                if let Some((name, name_end)) = declared_name(text, end) {
                    flush_raw(&mut items, &text[raw_start..i]);
                    if let Some(initializer) = initializer(text, name_end) {
                        bridge.record_script_variable(name, initializer);
                    }
                    items.push(ScriptItem::VarDecl {
                        keyword: word.to_string(),
                        name: name.to_string(),
                    });
                    i = name_end;
                    raw_start = i;
                    continue;
                }
            }
            i = end;
            continue;
        }

        i += 1;
    }
    flush_raw(&mut items, &text[raw_start..]);
    Ok(items)
}

fn skip_ws(text: &str, from: usize) -> usize {
    from + text[from..].len() - text[from..].trim_start().len()
}

/// Take the enhanced selector just before an operator off the item list.
fn pop_target(items: &mut Vec<ScriptItem>, keyword: &'static str, span: Span) -> Result<EnhancedSelector, ScriptError> {
    while matches!(items.last(), Some(ScriptItem::Raw { text }) if text.trim().is_empty()) {
        items.pop();
    }
    match items.pop() {
        Some(ScriptItem::Selector { selector }) => Ok(selector),
        _ => Err(ScriptError::MalformedBlock {
            keyword,
            reason: "the target must be an enhanced selector".to_string(),
            span,
        }),
    }
}

/// `Listen {` or `Delegate {` after an arrow. Returns the keyword and the
/// offset of the brace.
fn behavior_keyword(text: &str, from: usize) -> Option<(&'static str, usize)> {
    let start = skip_ws(text, from);
    let rest = &text[start..];
    let keyword = ["Listen", "Delegate"].into_iter().find(|kw| rest.starts_with(kw))?;
    let open = skip_ws(text, start + keyword.len());
    (text.as_bytes().get(open) == Some(&b'{')).then_some((keyword, open))
}

fn declared_name(text: &str, from: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    let start = skip_ws(text, from);
    if start == from || !bytes.get(start).copied().is_some_and(is_ident_start) {
        return None;
    }
    let end = start + bytes[start..].iter().take_while(|b| is_ident_char(**b)).count();
    Some((&text[start..end], end))
}

/// Initializer text after `name_end`, up to a top-level `;` or newline.
fn initializer(text: &str, name_end: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let eq = skip_ws(text, name_end);
    if bytes.get(eq) != Some(&b'=') || matches!(bytes.get(eq + 1), Some(b'=') | Some(b'>')) {
        return None;
    }
    let start = eq + 1;
    let mut depth = 0i32;
    let mut i = start;
    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b';' | b'\n' if depth <= 0 => break,
            _ => {}
        }
        i += 1;
    }
    let value = text[start..i].trim();
    (!value.is_empty()).then_some(value)
}

fn enhanced_selector(text: &str, start: usize, base: usize) -> Result<(EnhancedSelector, usize), ScriptError> {
    let Some(close) = text[start + 2..].find("}}") else {
        return Err(ScriptError::UnterminatedSelector {
            span: Span::new(base + start, base + text.len()),
        });
    };
    let end = start + 2 + close + 2;
    let span = Span::new(base + start, base + end);
    let inner = text[start + 2..end - 2].trim();
    if inner.is_empty() {
        return Err(ScriptError::EmptySelector { span });
    }
    Ok((
        EnhancedSelector {
            target: classify_selector(inner),
            span,
        },
        end,
    ))
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn classify_selector(inner: &str) -> SelectorTarget {
    if inner == "&" {
        return SelectorTarget::Ampersand;
    }
    if let Some(head) = inner.strip_suffix(']') {
        if let Some((base, index)) = head.rsplit_once('[') {
            if let Ok(index) = index.trim().parse::<usize>() {
                return SelectorTarget::Indexed {
                    base: Box::new(classify_selector(base.trim())),
                    index,
                };
            }
        }
    }
    if let Some(name) = inner.strip_prefix('#').filter(|n| is_plain_name(n)) {
        return SelectorTarget::Id { name: name.to_string() };
    }
    if let Some(name) = inner.strip_prefix('.').filter(|n| is_plain_name(n)) {
        return SelectorTarget::Class { name: name.to_string() };
    }
    if is_plain_name(inner) {
        let name = inner.to_string();
        return if HTML_TAGS.contains(&inner) {
            SelectorTarget::Tag { name }
        } else {
            SelectorTarget::Auto { name }
        };
    }
    SelectorTarget::Query {
        selector: inner.to_string(),
    }
}

// ───────────────────────────────────────────────────────────────────────────────
// Behavior blocks
// ───────────────────────────────────────────────────────────────────────────────

struct Entry<'t> {
    key: &'t str,
    value: &'t str,
    value_start: usize,
    span: Span,
}

fn entries<'t>(keyword: &'static str, body: &'t str, base: usize) -> Result<Vec<Entry<'t>>, ScriptError> {
    let mut out = Vec::new();
    for (start, end) in split_top_level(body, b',') {
        let part = &body[start..end];
        if part.trim().is_empty() {
            continue;
        }
        let span = Span::new(base + start, base + end);
        let Some(&(_, colon)) = split_top_level(part, b':').first() else {
            continue;
        };
        if colon == part.len() {
            return Err(ScriptError::MalformedBlock {
                keyword,
                reason: format!("expected `event: handler`, found `{}`", part.trim()),
                span,
            });
        }
        let key = part[..colon].trim().trim_matches(|c| c == '"' || c == '\'');
        let raw_value = &part[colon + 1..];
        let leading = raw_value.len() - raw_value.trim_start().len();
        out.push(Entry {
            key,
            value: raw_value.trim(),
            value_start: base + start + colon + 1 + leading,
            span,
        });
    }
    Ok(out)
}

fn handlers(entries: Vec<Entry<'_>>, bridge: &mut Bridge) -> Result<Vec<Handler>, ScriptError> {
    entries
        .into_iter()
        .map(|entry| {
            Ok(Handler {
                event: entry.key.to_string(),
                body: parse_items(entry.value, entry.value_start, bridge)?,
                span: entry.span,
            })
        })
        .collect()
}

/// `{{a}}` or `[{{a}}, {{b}}]`.
fn selector_list(keyword: &'static str, entry: &Entry<'_>) -> Result<Vec<EnhancedSelector>, ScriptError> {
    let (list, offset) = match entry.value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        Some(inner) => (inner, entry.value_start + 1),
        None => (entry.value, entry.value_start),
    };
    let mut targets = Vec::new();
    for (start, end) in split_top_level(list, b',') {
        let item = list[start..end].trim();
        if item.is_empty() {
            continue;
        }
        let item_start = offset + start + (list[start..end].len() - list[start..end].trim_start().len());
        let parsed = item
            .starts_with("{{")
            .then(|| enhanced_selector(item, 0, item_start))
            .transpose()?
            .filter(|(_, consumed)| *consumed == item.len());
        let Some((selector, _)) = parsed else {
            return Err(ScriptError::MalformedBlock {
                keyword,
                reason: format!("target `{}` is not an enhanced selector", item),
                span: Span::new(item_start, item_start + item.len()),
            });
        };
        targets.push(selector);
    }
    Ok(targets)
}

fn behavior(
    keyword: &'static str,
    target: EnhancedSelector,
    body: &str,
    base: usize,
    bridge: &mut Bridge,
) -> Result<ScriptItem, ScriptError> {
    let mut entries = entries(keyword, body, base)?;
    if keyword == "Listen" {
        return Ok(ScriptItem::Listen {
            target,
            handlers: handlers(entries, bridge)?,
        });
    }

    let Some(position) = entries.iter().position(|entry| entry.key == "target") else {
        return Err(ScriptError::MalformedBlock {
            keyword,
            reason: "missing `target`".to_string(),
            span: Span::new(base, base + body.len()),
        });
    };
    let target_entry = entries.remove(position);
    let targets = selector_list(keyword, &target_entry)?;
    if targets.is_empty() {
        return Err(ScriptError::MalformedBlock {
            keyword,
            reason: "`target` is empty".to_string(),
            span: target_entry.span,
        });
    }
    Ok(ScriptItem::Delegate {
        parent: target,
        targets,
        handlers: handlers(entries, bridge)?,
    })
}

// ───────────────────────────────────────────────────────────────────────────────
// Event binding
// ───────────────────────────────────────────────────────────────────────────────

/// Parse the `&->` statement whose first operator is at `at`. Returns the item
/// and the offset of whatever ends the statement (`;`, newline or end).
fn event_bind(
    text: &str,
    at: usize,
    first: EnhancedSelector,
    base: usize,
    bridge: &mut Bridge,
) -> Result<(ScriptItem, usize), ScriptError> {
    let bytes = text.as_bytes();
    let mut bindings = Vec::new();
    let mut target = first;
    let mut operator = at;
    loop {
        let start = skip_ws(text, operator + 3);
        let (handlers, end) = if bytes.get(start) == Some(&b'{') {
            let close = matching_brace(bytes, start).ok_or(ScriptError::UnterminatedBlock {
                keyword: "&->",
                span: Span::new(base + operator, base + bytes.len()),
            })?;
            let body = &text[start + 1..close - 1];
            (handlers(entries("&->", body, base + start + 1)?, bridge)?, close)
        } else {
            bind_clause(text, start, base, bridge)?
        };
        bindings.push(EventBinding {
            target: target.clone(),
            handlers,
        });

        if bytes.get(end) != Some(&b',') {
            return Ok((ScriptItem::EventBind { bindings }, end));
        }
        let next = skip_ws(text, end + 1);
        if bytes[next..].starts_with(b"&->") {
            operator = next;
        } else if bytes[next..].starts_with(b"{{") {
            let (selector, selector_end) = enhanced_selector(text, next, base)?;
            operator = skip_ws(text, selector_end);
            if !bytes[operator..].starts_with(b"&->") {
                return Err(ScriptError::MalformedBlock {
                    keyword: "&->",
                    reason: "expected `&->` after a chained target".to_string(),
                    span: Span::new(base + next, base + operator),
                });
            }
            target = selector;
        } else {
            return Ok((ScriptItem::EventBind { bindings }, end));
        }
    }
}

/// `click, mouseenter: handler` starting at `start`.
fn bind_clause(text: &str, start: usize, base: usize, bridge: &mut Bridge) -> Result<(Vec<Handler>, usize), ScriptError> {
    let bytes = text.as_bytes();
    let colon = bytes[start..]
        .iter()
        .position(|b| matches!(b, b':' | b';' | b'{' | b'\n'))
        .map_or(bytes.len(), |offset| start + offset);
    if bytes.get(colon) != Some(&b':') {
        return Err(ScriptError::MalformedBlock {
            keyword: "&->",
            reason: "expected `event: handler`".to_string(),
            span: Span::new(base + start, base + colon),
        });
    }
    let events: Vec<&str> = text[start..colon].split(',').map(str::trim).collect();
    if let Some(bad) = events.iter().find(|event| !is_plain_name(event)) {
        return Err(ScriptError::MalformedBlock {
            keyword: "&->",
            reason: format!("`{}` is not an event name", bad),
            span: Span::new(base + start, base + colon),
        });
    }

    let end = clause_end(text, colon + 1);
    let raw = &text[colon + 1..end];
    let leading = raw.len() - raw.trim_start().len();
    let span = Span::new(base + start, base + end);
    if raw.trim().is_empty() {
        return Err(ScriptError::MalformedBlock {
            keyword: "&->",
            reason: "missing handler".to_string(),
            span,
        });
    }
    let body = parse_items(raw.trim(), base + colon + 1 + leading, bridge)?;
    Ok((
        events
            .into_iter()
            .map(|event| Handler {
                event: event.to_string(),
                body: body.clone(),
                span,
            })
            .collect(),
        end,
    ))
}

/// End of an `&->` handler: a top-level `;`, a newline not preceded by `,`, a
/// `,` that starts another clause, or a closing bracket of an outer group.
fn clause_end(text: &str, from: usize) -> usize {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = from;
    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }
        match bytes[i] {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' if depth == 0 => return i,
            b')' | b']' | b'}' => depth -= 1,
            b';' if depth == 0 => return i,
            b'\n' if depth == 0 && !text[from..i].trim_end().ends_with(',') => return i,
            b',' if depth == 0 => {
                let next = skip_ws(text, i + 1);
                if bytes[next..].starts_with(b"&->") || bytes[next..].starts_with(b"{{") {
                    return i;
                }
            }
            _ => {}
        }
        i += 1;
    }
    bytes.len()
}

// ───────────────────────────────────────────────────────────────────────────────
// Animate
// ───────────────────────────────────────────────────────────────────────────────

fn animation(body: &str, base: usize, span: Span, bridge: &mut Bridge) -> Result<Animation, ScriptError> {
    let malformed = |reason: String, span: Span| ScriptError::MalformedBlock {
        keyword: "Animate",
        reason,
        span,
    };
    let mut animation = Animation::new(span);
    for entry in entries("Animate", body, base)? {
        let word = entry.value.trim_matches(|c| c == '"' || c == '\'');
        let invalid = || malformed(format!("invalid `{}`: `{}`", entry.key, entry.value), entry.span);
        match entry.key {
            "target" => animation.targets = selector_list("Animate", &entry)?,
            "duration" => animation.duration = milliseconds(entry.value).filter(|ms| *ms > 0).ok_or_else(invalid)?,
            "delay" => animation.delay = milliseconds(entry.value).ok_or_else(invalid)?,
            "loop" => {
                animation.loops = entry
                    .value
                    .parse::<i64>()
                    .ok()
                    .filter(|n| *n == -1 || *n >= 1)
                    .ok_or_else(invalid)?
            }
            "easing" => animation.easing = Easing::parse(word).ok_or_else(invalid)?,
            "direction" => {
                animation.direction = match word {
                    "normal" => Direction::Normal,
                    "reverse" => Direction::Reverse,
                    "alternate" => Direction::Alternate,
                    _ => return Err(invalid()),
                }
            }
            "begin" => animation.begin = style_frame(&entry)?,
            "end" => animation.end = style_frame(&entry)?,
            "when" => animation.when = keyframes(&entry)?,
            "callback" => animation.callback = Some(parse_items(entry.value, entry.value_start, bridge)?),
            other => return Err(malformed(format!("unknown property `{}`", other), entry.span)),
        }
    }
    if animation.targets.is_empty() {
        return Err(malformed("missing `target`".to_string(), span));
    }
    Ok(animation)
}

fn milliseconds(value: &str) -> Option<u64> {
    value.strip_suffix("ms").unwrap_or(value).trim().parse().ok()
}

fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Entries of a `{ key: value, ... }` object literal.
fn object_entries<'t>(text: &'t str, start: usize, span: Span) -> Result<Vec<Entry<'t>>, ScriptError> {
    let Some(inner) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) else {
        return Err(ScriptError::MalformedBlock {
            keyword: "Animate",
            reason: format!("expected `{{ property: value }}`, found `{}`", text),
            span,
        });
    };
    entries("Animate", inner, start + 1)
}

fn style_frame(entry: &Entry<'_>) -> Result<StyleFrame, ScriptError> {
    Ok(object_entries(entry.value, entry.value_start, entry.span)?
        .into_iter()
        .map(|e| (kebab_case(e.key), e.value.to_string()))
        .collect())
}

fn keyframes(entry: &Entry<'_>) -> Result<Vec<Keyframe>, ScriptError> {
    let Some(list) = entry.value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) else {
        return Err(ScriptError::MalformedBlock {
            keyword: "Animate",
            reason: "`when` takes a list of keyframes".to_string(),
            span: entry.span,
        });
    };
    let mut frames = Vec::new();
    for (start, end) in split_top_level(list, b',') {
        let item = list[start..end].trim();
        if item.is_empty() {
            continue;
        }
        let item_start = entry.value_start + 1 + start + (list[start..end].len() - list[start..end].trim_start().len());
        let span = Span::new(item_start, item_start + item.len());
        let mut at = None;
        let mut properties = Vec::new();
        for e in object_entries(item, item_start, span)? {
            if e.key == "at" {
                at = Some(e.value);
            } else {
                properties.push((kebab_case(e.key), e.value.to_string()));
            }
        }
        let at = at
            .filter(|at| at.parse::<f64>().is_ok_and(|p| (0.0..=1.0).contains(&p)))
            .ok_or_else(|| ScriptError::MalformedBlock {
                keyword: "Animate",
                reason: "each keyframe needs `at` between 0 and 1".to_string(),
                span,
            })?;
        frames.push(Keyframe {
            at: at.to_string(),
            properties,
        });
    }
    Ok(frames)
}
