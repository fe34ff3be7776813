//! Fragment scanner.
//!
//! Splits one compilation unit into an ordered list of fragments: CHTL markup
//! text, and the interiors of `style {}` / `script {}` blocks. Each extracted
//! block leaves a placeholder token in the markup stream so the merger can put
//! the separately compiled output back where the block stood.
//!
//! The scanner knows nothing about CSS or JS. It only tracks quotes, comments
//! and brace depth, which is enough to find where a block ends.

use crate::diagnostics::{LineIndex, SourceLocation, Span};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// FRAGMENTS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FragmentKind {
    Chtl,
    Style,
    Script,
}

impl FragmentKind {
    fn token_tag(self) -> &'static str {
        match self {
            FragmentKind::Chtl => "CHTL",
            FragmentKind::Style => "STYLE",
            FragmentKind::Script => "SCRIPT",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FragmentKind::Chtl => "markup",
            FragmentKind::Style => "style",
            FragmentKind::Script => "script",
        })
    }
}

/// Marker left in the markup stream where a style or script block was cut out.
///
/// Shape: `__CHTL_<STYLE|SCRIPT>_<nonce>_<n>__`. The nonce is derived from the
/// unit's source so two units never share tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Placeholder(String);

impl Placeholder {
    fn new(kind: FragmentKind, nonce: &str, ordinal: usize) -> Self {
        Placeholder(format!("__CHTL_{}_{}_{}__", kind.token_tag(), nonce, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Placeholder {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub kind: FragmentKind,
    /// Markup text, or the interior of a block (without its braces).
    pub text: String,
    /// Whole extent in the source, including keyword and braces for blocks.
    pub range: Span,
    /// Extent of `text` in the source.
    pub body_range: Span,
    pub placeholder: Option<Placeholder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error(
        "unterminated {kind} block starting at line {}, column {}",
        location.line,
        location.column
    )]
    UnterminatedBlock {
        kind: FragmentKind,
        start: usize,
        location: SourceLocation,
    },
}

impl ScanError {
    pub fn span(&self) -> Span {
        match self {
            ScanError::UnterminatedBlock { start, .. } => Span::point(*start),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE MAP
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    markup: Span,
    source: Span,
    /// Placeholder segments collapse onto the start of the block they replaced.
    collapsed: bool,
}

/// Maps offsets in [`ScannedSource::markup_text`] back to the original source.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    segments: Vec<Segment>,
    source_len: usize,
}

impl SourceMap {
    pub fn to_source(&self, markup_offset: usize) -> usize {
        let index = self
            .segments
            .partition_point(|segment| segment.markup.start <= markup_offset);
        if index == 0 {
            return 0;
        }
        let segment = self.segments[index - 1];
        if markup_offset >= segment.markup.end {
            // Only reachable at the very end of the markup stream.
            return if index == self.segments.len() {
                self.source_len
            } else {
                segment.source.end
            };
        }
        if segment.collapsed {
            segment.source.start
        } else {
            segment.source.start + (markup_offset - segment.markup.start)
        }
    }

    pub fn span_to_source(&self, span: Span) -> Span {
        let start = self.to_source(span.start);
        let end = self.to_source(span.end).max(start);
        Span::new(start, end)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCANNED SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ScannedSource {
    fragments: Vec<Fragment>,
    markup: String,
    source_map: SourceMap,
    by_placeholder: HashMap<String, usize>,
}

impl ScannedSource {
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// The CHTL stream: markup fragments concatenated, blocks replaced by
    /// their placeholders.
    pub fn markup_text(&self) -> &str {
        &self.markup
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    pub fn fragment(&self, placeholder: &str) -> Option<&Fragment> {
        self.by_placeholder
            .get(placeholder)
            .map(|&index| &self.fragments[index])
    }

    /// Fragment whose range contains `offset`; an offset at the very end of the
    /// source belongs to the last fragment.
    pub fn fragment_at(&self, offset: usize) -> Option<&Fragment> {
        let index = self
            .fragments
            .partition_point(|fragment| fragment.range.start <= offset);
        if index == 0 {
            return self.fragments.first();
        }
        self.fragments.get(index - 1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCANNER
// ═══════════════════════════════════════════════════════════════════════════════

/// Partition `source` into fragments in strict source order.
#[tracing::instrument(level = "debug", skip_all, fields(len = source.len()))]
pub fn scan(source: &str) -> Result<ScannedSource, ScanError> {
    let scanned = Scanner::new(source).run()?;
    tracing::debug!(
        fragments = scanned.fragments.len(),
        blocks = scanned.by_placeholder.len(),
        "scanned compilation unit"
    );
    Ok(scanned)
}

fn source_nonce(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'$' | b'@' | b'.' | b'#')
}

/// A quote opens a string only where a token may begin, so the apostrophe in
/// an unquoted literal such as `It's` stays plain text.
fn opens_string(bytes: &[u8], i: usize) -> bool {
    i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || matches!(bytes[i - 1], b'_' | b'\\'))
}

fn opens_comment(bytes: &[u8], i: usize) -> bool {
    i == 0 || bytes[i - 1].is_ascii_whitespace() || matches!(bytes[i - 1], b'{' | b'}' | b';')
}

/// End of a `//`, `/* */` or `--` comment at `i` in markup. Line comments stop
/// before the newline.
fn markup_comment_end(source: &str, i: usize) -> Option<usize> {
    let rest = &source[i..];
    if rest.starts_with("//") || rest.starts_with("--") {
        Some(rest.find('\n').map_or(source.len(), |offset| i + offset))
    } else if rest.starts_with("/*") {
        Some(rest[2..].find("*/").map_or(source.len(), |offset| i + 2 + offset + 2))
    } else {
        None
    }
}

/// Index just past a quoted string starting at `start`, or `bytes.len()` if it
/// never closes.
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

struct Scanner<'a> {
    source: &'a str,
    bytes: &'a [u8],
    nonce: String,
    fragments: Vec<Fragment>,
    markup: String,
    segments: Vec<Segment>,
    by_placeholder: HashMap<String, usize>,
    blocks: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Scanner {
            source,
            bytes: source.as_bytes(),
            nonce: source_nonce(source),
            fragments: Vec::new(),
            markup: String::with_capacity(source.len()),
            segments: Vec::new(),
            by_placeholder: HashMap::new(),
            blocks: 0,
        }
    }

    fn run(mut self) -> Result<ScannedSource, ScanError> {
        let len = self.bytes.len();
        let mut chunk_start = 0;
        let mut i = 0;

        while i < len {
            match self.bytes[i] {
                b'"' | b'\'' if opens_string(self.bytes, i) => {
                    i = skip_string(self.bytes, i);
                    continue;
                }
                b'/' | b'-' if opens_comment(self.bytes, i) => {
                    if let Some(end) = markup_comment_end(self.source, i) {
                        i = end;
                        continue;
                    }
                }
                b's' => {
                    if let Some((kind, open)) = self.block_keyword_at(i) {
                        self.push_chtl(chunk_start, i);
                        let end = self.block_end(kind, i, open)?;
                        self.push_block(kind, i, open, end);
                        i = end;
                        chunk_start = end;
                        continue;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        self.push_chtl(chunk_start, len);

        Ok(ScannedSource {
            fragments: self.fragments,
            markup: self.markup,
            source_map: SourceMap {
                segments: self.segments,
                source_len: len,
            },
            by_placeholder: self.by_placeholder,
        })
    }

    /// `style {` or `script {` at `i`, as a whole word. Returns the block kind
    /// and the offset of the opening brace.
    fn block_keyword_at(&self, i: usize) -> Option<(FragmentKind, usize)> {
        if i > 0 && is_ident_byte(self.bytes[i - 1]) {
            return None;
        }
        let rest = &self.source[i..];
        let (kind, keyword_len) = if rest.starts_with("style") {
            (FragmentKind::Style, 5)
        } else if rest.starts_with("script") {
            (FragmentKind::Script, 6)
        } else {
            return None;
        };
        let mut j = i + keyword_len;
        if j < self.bytes.len() && is_ident_byte(self.bytes[j]) {
            return None;
        }
        while j < self.bytes.len() && self.bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        (j < self.bytes.len() && self.bytes[j] == b'{').then_some((kind, j))
    }

    /// Offset just past the brace that closes the block opened at `open`.
    fn block_end(&self, kind: FragmentKind, start: usize, open: usize) -> Result<usize, ScanError> {
        let bytes = self.bytes;
        let mut depth = 1usize;
        let mut i = open + 1;

        while i < bytes.len() {
            match bytes[i] {
                b'"' | b'\'' => {
                    i = skip_string(bytes, i);
                    continue;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i = match self.source[i + 2..].find("*/") {
                        Some(offset) => i + 2 + offset + 2,
                        None => bytes.len(),
                    };
                    continue;
                }
                b'/' if kind == FragmentKind::Script && bytes.get(i + 1) == Some(&b'/') => {
                    i = match self.source[i..].find('\n') {
                        Some(offset) => i + offset,
                        None => bytes.len(),
                    };
                    continue;
                }
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i + 1);
                    }
                }
                _ => {}
            }
            i += 1;
        }

        Err(ScanError::UnterminatedBlock {
            kind,
            start,
            location: LineIndex::new(self.source).location(start),
        })
    }

    fn push_chtl(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }
        let text = &self.source[start..end];
        let markup_start = self.markup.len();
        self.markup.push_str(text);
        self.segments.push(Segment {
            markup: Span::new(markup_start, self.markup.len()),
            source: Span::new(start, end),
            collapsed: false,
        });
        self.fragments.push(Fragment {
            kind: FragmentKind::Chtl,
            text: text.to_string(),
            range: Span::new(start, end),
            body_range: Span::new(start, end),
            placeholder: None,
        });
    }

    fn push_block(&mut self, kind: FragmentKind, start: usize, open: usize, end: usize) {
        let placeholder = Placeholder::new(kind, &self.nonce, self.blocks);
        self.blocks += 1;

        let markup_start = self.markup.len();
        self.markup.push_str(placeholder.as_str());
        self.segments.push(Segment {
            markup: Span::new(markup_start, self.markup.len()),
            source: Span::new(start, end),
            collapsed: true,
        });

        let body = Span::new(open + 1, end - 1);
        tracing::trace!(%kind, %placeholder, start, end, "extracted block");
        self.by_placeholder
            .insert(placeholder.as_str().to_string(), self.fragments.len());
        self.fragments.push(Fragment {
            kind,
            text: self.source[body.range()].to_string(),
            range: Span::new(start, end),
            body_range: body,
            placeholder: Some(placeholder),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn kinds(scanned: &ScannedSource) -> Vec<FragmentKind> {
        scanned.fragments().iter().map(|f| f.kind).collect()
    }

    /// Put every block's original text back where its placeholder stands.
    fn reconstruct(source: &str, scanned: &ScannedSource) -> String {
        let mut out = scanned.markup_text().to_string();
        for fragment in scanned.fragments() {
            if let Some(placeholder) = &fragment.placeholder {
                out = out.replacen(placeholder.as_str(), &source[fragment.range.range()], 1);
            }
        }
        out
    }

    #[test]
    fn test_splits_markup_and_blocks_in_order() {
        let source = "div { style { color: red; } text { \"hi\" } } script { let a = 1; }";
        let scanned = scan(source).unwrap();
        assert_eq!(
            kinds(&scanned),
            vec![
                FragmentKind::Chtl,
                FragmentKind::Style,
                FragmentKind::Chtl,
                FragmentKind::Script,
            ]
        );
        let style = &scanned.fragments()[1];
        assert_eq!(style.text, " color: red; ");
        assert_eq!(&source[style.range.range()], "style { color: red; }");
        assert_eq!(&source[style.body_range.range()], " color: red; ");
        assert!(style
            .placeholder
            .as_ref()
            .unwrap()
            .as_str()
            .starts_with("__CHTL_STYLE_"));
    }

    #[test]
    fn test_braces_inside_strings_do_not_close_blocks() {
        let source = "script { let s = \"}\"; let t = '{'; }";
        let scanned = scan(source).unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Script]);
        assert_eq!(scanned.fragments()[0].text, " let s = \"}\"; let t = '{'; ");
    }

    #[test]
    fn test_comments_inside_blocks_are_opaque() {
        let source = "style { /* don't } */ a { b: c; } } script { // it's }\n x(); }";
        let scanned = scan(source).unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Style, FragmentKind::Chtl, FragmentKind::Script]);
        assert!(scanned.fragments()[2].text.contains("x();"));
    }

    #[test]
    fn test_keyword_inside_markup_string_is_not_a_block() {
        let source = "text { \"style { not a block }\" }";
        let scanned = scan(source).unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Chtl]);
        assert_eq!(scanned.markup_text(), source);
    }

    #[test]
    fn test_quotes_inside_markup_comments() {
        for comment in ["-- don't\n", "// it's\n", "/* it's */ "] {
            let source = format!("{}div {{ style {{ color: red; }} }}", comment);
            let scanned = scan(&source).unwrap();
            assert_eq!(
                kinds(&scanned),
                vec![FragmentKind::Chtl, FragmentKind::Style, FragmentKind::Chtl],
                "comment: {:?}",
                comment
            );
        }
    }

    #[test]
    fn test_markup_comment_hides_block_keyword() {
        let scanned = scan("// style { }\ndiv { }").unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Chtl]);
    }

    #[test]
    fn test_apostrophe_in_unquoted_literal() {
        let source = "div { text { It's fine } } p { style { color: red; } }";
        let scanned = scan(source).unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Chtl, FragmentKind::Style, FragmentKind::Chtl]);
        assert_eq!(scanned.fragments()[1].text, " color: red; ");
    }

    #[test]
    fn test_keyword_must_be_a_whole_word() {
        let source = "mystyle { } stylesheet { } scripts { }";
        let scanned = scan(source).unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Chtl]);
    }

    #[test]
    fn test_nested_keyword_is_plain_content() {
        let source = "script { const o = { style: 1 }; function f() { script { } } }";
        let scanned = scan(source).unwrap();
        assert_eq!(kinds(&scanned), vec![FragmentKind::Script]);
        assert_eq!(scanned.fragments()[0].range, Span::new(0, source.len()));
    }

    #[test]
    fn test_unterminated_block_reports_start() {
        let source = "div {\n  script { if (x) { y();\n}";
        let err = scan(source).unwrap_err();
        let ScanError::UnterminatedBlock { kind, start, location } = err;
        assert_eq!(kind, FragmentKind::Script);
        assert_eq!(start, 8);
        assert_eq!(location, SourceLocation { line: 2, column: 3 });
    }

    #[test]
    fn test_placeholders_are_unique_and_indexed() {
        let source = "style { a {} } style { b {} } script { c(); }";
        let scanned = scan(source).unwrap();
        let tokens: Vec<&str> = scanned
            .fragments()
            .iter()
            .filter_map(|f| f.placeholder.as_ref().map(|p| p.as_str()))
            .collect();
        assert_eq!(tokens.len(), 3);
        assert!(tokens[0].ends_with("_0__"));
        assert!(tokens[2].ends_with("_2__"));
        for token in &tokens {
            assert_eq!(scanned.fragment(token).unwrap().placeholder.as_ref().unwrap().as_str(), *token);
        }
    }

    #[test]
    fn test_nonce_differs_between_units() {
        let a = scan("style { a {} }").unwrap();
        let b = scan("style { b {} }").unwrap();
        assert_ne!(a.markup_text(), b.markup_text());
    }

    #[test]
    fn test_source_map_round_trips_offsets() {
        let source = "div { style { color: red; } span { } }";
        let scanned = scan(source).unwrap();
        let markup = scanned.markup_text();
        let span_at = markup.find("span").unwrap();
        assert_eq!(scanned.source_map().to_source(span_at), source.find("span").unwrap());
        let token_at = markup.find("__CHTL").unwrap();
        assert_eq!(scanned.source_map().to_source(token_at + 3), source.find("style").unwrap());
        assert_eq!(scanned.source_map().to_source(markup.len()), source.len());
    }

    #[test]
    fn test_fragment_at_offset() {
        let source = "div { } script { x(); } p { }";
        let scanned = scan(source).unwrap();
        assert_eq!(scanned.fragment_at(0).unwrap().kind, FragmentKind::Chtl);
        assert_eq!(scanned.fragment_at(12).unwrap().kind, FragmentKind::Script);
        assert_eq!(scanned.fragment_at(source.len()).unwrap().kind, FragmentKind::Chtl);
    }

    fn piece() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("div { "),
            Just("} "),
            Just("text { \"hello\" } "),
            Just("text { \"style { }\" } "),
            Just("'script {' "),
            Just("id: box; "),
            Just("style { color: red; } "),
            Just("style { a { b: \"}\"; } /* } */ } "),
            Just("script { let s = '}'; } "),
            Just("script { if (a) { b(); } // }\n } "),
            Just("stylesheet { } "),
            Just("\n"),
        ]
    }

    proptest! {
        #[test]
        fn prop_scan_reconstructs_source(pieces in proptest::collection::vec(piece(), 0..24)) {
            let source: String = pieces.concat();
            let scanned = scan(&source).unwrap();
            prop_assert_eq!(reconstruct(&source, &scanned), source.clone());

            // Fragments tile the source without gaps or overlaps.
            let mut cursor = 0;
            for fragment in scanned.fragments() {
                prop_assert_eq!(fragment.range.start, cursor);
                prop_assert!(!fragment.range.is_empty());
                cursor = fragment.range.end;
            }
            prop_assert_eq!(cursor, source.len());
        }
    }
}
