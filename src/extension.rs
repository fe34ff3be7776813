//! Syntax extensions for script blocks.
//!
//! An extension claims a keyword. Every `keyword(args)` or `keyword { body }`
//! occurrence in a script is replaced by the extension's expansion before the
//! script is parsed.

use crate::diagnostics::Span;
use crate::script::skip_literal;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("extension `{keyword}` failed: {message}")]
pub struct ExtensionError {
    pub keyword: String,
    pub message: String,
    pub span: Span,
}

/// One occurrence of an extension keyword with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedArgs {
    /// From the keyword to the closing delimiter, relative to the scanned slice.
    pub range: Range<usize>,
    /// Text between the delimiters.
    pub body: String,
    /// `body` split on top-level commas, trimmed. Empty pieces are dropped.
    pub args: Vec<String>,
}

pub trait SyntaxExtension: Send + Sync {
    fn keyword(&self) -> &str;

    /// Replacement text for one occurrence.
    fn expand(&self, args: &MatchedArgs) -> Result<String, String>;
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Index just past the delimiter closing the one at `open`.
fn closing_delimiter(bytes: &[u8], open: usize) -> Option<usize> {
    let (opener, closer) = match bytes[open] {
        b'(' => (b'(', b')'),
        b'{' => (b'{', b'}'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut i = open;
    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }
        if bytes[i] == opener {
            depth += 1;
        } else if bytes[i] == closer {
            depth -= 1;
            if depth == 0 {
                return Some(i + 1);
            }
        }
        i += 1;
    }
    None
}

fn split_args(body: &str) -> Vec<String> {
    let bytes = body.as_bytes();
    let mut args = Vec::new();
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
            b',' if depth == 0 => {
                args.push(body[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    args.push(body[start..].trim().to_string());
    args.retain(|arg| !arg.is_empty());
    args
}

/// First occurrence of `keyword` in `slice` followed by a parenthesized or
/// braced argument list. Strings and comments are skipped.
pub fn scan_custom_syntax(slice: &str, keyword: &str) -> Option<MatchedArgs> {
    if keyword.is_empty() {
        return None;
    }
    let bytes = slice.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if let Some(end) = skip_literal(bytes, i) {
            i = end;
            continue;
        }
        let at_boundary = i == 0 || !is_word_byte(bytes[i - 1]);
        if at_boundary && bytes[i..].starts_with(keyword.as_bytes()) {
            let after = i + keyword.len();
            if !bytes.get(after).copied().is_some_and(is_word_byte) {
                let open = after + bytes[after..].iter().take_while(|b| b.is_ascii_whitespace()).count();
                if let Some(close) = bytes.get(open).and_then(|_| closing_delimiter(bytes, open)) {
                    let body = &slice[open + 1..close - 1];
                    return Some(MatchedArgs {
                        range: i..close,
                        body: body.to_string(),
                        args: split_args(body),
                    });
                }
            }
        }
        i += 1;
    }
    None
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Extensions in registration order. Shared read-only across units.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn SyntaxExtension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension. A later registration for the same keyword
    /// replaces the earlier one.
    pub fn register<E: SyntaxExtension + 'static>(&mut self, extension: E) {
        self.extensions.retain(|e| e.keyword() != extension.keyword());
        self.extensions.push(Box::new(extension));
    }

    pub fn get(&self, keyword: &str) -> Option<&dyn SyntaxExtension> {
        self.extensions
            .iter()
            .find(|e| e.keyword() == keyword)
            .map(|e| e.as_ref())
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> + '_ {
        self.extensions.iter().map(|e| e.keyword())
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Expand every extension occurrence in `text`, found at source offset
    /// `base`. Expansions are not rescanned for their own keyword.
    pub fn apply(&self, text: &str, base: usize) -> Result<String, ExtensionError> {
        let mut out = text.to_string();
        for extension in &self.extensions {
            let keyword = extension.keyword();
            let mut pos = 0;
            while let Some(matched) = scan_custom_syntax(&out[pos..], keyword) {
                let range = pos + matched.range.start..pos + matched.range.end;
                let expansion = extension.expand(&matched).map_err(|message| ExtensionError {
                    keyword: keyword.to_string(),
                    message,
                    span: Span::new(base + range.start, base + range.end),
                })?;
                tracing::trace!(keyword, start = range.start, "expanded syntax extension");
                pos = range.start + expansion.len();
                out.replace_range(range, &expansion);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keywords()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Log;

    impl SyntaxExtension for Log {
        fn keyword(&self) -> &str {
            "log"
        }

        fn expand(&self, args: &MatchedArgs) -> Result<String, String> {
            Ok(format!("console.log({})", args.args.join(", ")))
        }
    }

    struct Repeat;

    impl SyntaxExtension for Repeat {
        fn keyword(&self) -> &str {
            "repeat"
        }

        fn expand(&self, args: &MatchedArgs) -> Result<String, String> {
            let [count, text] = args.args.as_slice() else {
                return Err(format!("expected 2 arguments, got {}", args.args.len()));
            };
            let count: usize = count.parse().map_err(|_| format!("`{}` is not a count", count))?;
            Ok(format!("{}.repeat({})", text, count))
        }
    }

    #[test]
    fn test_scan_custom_syntax() {
        let matched = scan_custom_syntax("a(); repeat (2, f(x, y));", "repeat").unwrap();
        assert_eq!(matched.range, 5..24);
        assert_eq!(matched.body, "2, f(x, y)");
        assert_eq!(matched.args, vec!["2".to_string(), "f(x, y)".to_string()]);
    }

    #[test]
    fn test_scan_skips_strings_and_longer_words() {
        assert_eq!(scan_custom_syntax("'log(1)'; catalog(2); logger(3);", "log"), None);
        let braced = scan_custom_syntax("// log(0)\nlog { a, b }", "log").unwrap();
        assert_eq!(braced.args, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_scan_requires_closed_delimiter() {
        assert_eq!(scan_custom_syntax("log(1", "log"), None);
        assert_eq!(scan_custom_syntax("log;", "log"), None);
    }

    #[test]
    fn test_registry_apply() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Log);
        registry.register(Repeat);
        assert_eq!(registry.len(), 2);

        let out = registry.apply("log(repeat(2, 'ab')); log(1)", 0).unwrap();
        assert_eq!(out, "console.log('ab'.repeat(2)); console.log(1)");
    }

    #[test]
    fn test_registry_error_carries_span() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Repeat);
        let err = registry.apply("x; repeat(many, 'a')", 100).unwrap_err();
        assert_eq!(err.keyword, "repeat");
        assert_eq!(err.span, Span::new(103, 120));
    }

    #[test]
    fn test_register_replaces_same_keyword() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Log);
        registry.register(Log);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("log").is_some());
        assert!(registry.get("repeat").is_none());
    }
}
