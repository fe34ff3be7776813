//! Source positions and user-facing diagnostics.
//!
//! Every stage reports byte-offset [`Span`]s into the original compilation unit.
//! [`LineIndex`] turns those into 1-based line/column pairs, and [`Diagnostic`]
//! is the serializable record a host prints or ships over JSON.

use serde::{Deserialize, Serialize};
use std::ops::Range;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_UNTERMINATED_BLOCK: &str = "CHTL-ERR-SCAN-001";
pub const ERR_MARKUP_SYNTAX: &str = "CHTL-ERR-MARKUP-001";
pub const ERR_UNKNOWN_TEMPLATE: &str = "CHTL-ERR-MARKUP-002";
pub const ERR_MALFORMED_CONDITION: &str = "CHTL-ERR-MARKUP-003";
pub const ERR_MISPLACED_BLOCK: &str = "CHTL-ERR-MARKUP-004";
pub const ERR_UNIT_MISMATCH: &str = "CHTL-ERR-EVAL-001";
pub const ERR_TYPE_MISMATCH: &str = "CHTL-ERR-EVAL-002";
pub const ERR_UNRESOLVED_REFERENCE: &str = "CHTL-ERR-EVAL-003";
pub const ERR_CIRCULAR_REFERENCE: &str = "CHTL-ERR-EVAL-004";
pub const ERR_SCRIPT_SYNTAX: &str = "CHTL-ERR-SCRIPT-001";
pub const ERR_SCRIPT_CONTEXT: &str = "CHTL-ERR-SCRIPT-002";
pub const ERR_EXTENSION: &str = "CHTL-ERR-EXT-001";
pub const INV_DANGLING_PLACEHOLDER: &str = "CHTL-INV-001";
pub const INV_DUPLICATE_PLACEHOLDER: &str = "CHTL-INV-002";

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_UNTERMINATED_BLOCK => "Every style and script block is closed before the end of the unit.",
        ERR_MARKUP_SYNTAX => "Markup follows the element/attribute/text grammar.",
        ERR_UNKNOWN_TEMPLATE => "Templates and variable groups are defined before they are used.",
        ERR_MALFORMED_CONDITION => "Every if and else-if branch carries one well-formed condition.",
        ERR_MISPLACED_BLOCK => {
            "Script blocks live in rendered elements; conditional blocks hold no style or script blocks."
        }
        ERR_UNIT_MISMATCH => "Numeric operands are only compared or combined when their units agree.",
        ERR_TYPE_MISMATCH => "Operators are applied to operands of compatible types.",
        ERR_UNRESOLVED_REFERENCE => "Property references name an element and property that exist.",
        ERR_CIRCULAR_REFERENCE => "Property references between elements never form a cycle.",
        ERR_SCRIPT_SYNTAX => "Enhanced selectors and behavior blocks are well formed.",
        ERR_SCRIPT_CONTEXT => "`{{&}}` is only used inside a script block that belongs to an element.",
        ERR_EXTENSION => "Registered syntax extensions accept the arguments they are given.",
        INV_DANGLING_PLACEHOLDER => "Every placeholder emitted by the scanner is resolved by the merger.",
        INV_DUPLICATE_PLACEHOLDER => "Every placeholder is resolved exactly once.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SPANS
// ═══════════════════════════════════════════════════════════════════════════════

/// Half-open byte range into the compilation unit's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    pub fn point(offset: usize) -> Self {
        Span::new(offset, offset)
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    pub fn shift(self, by: usize) -> Span {
        Span::new(self.start + by, self.end + by)
    }

    pub fn contains(self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    pub fn len(self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(self) -> bool {
        self.start == self.end
    }

    pub fn range(self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for Span {
    fn from(range: Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

/// Maps byte offsets to 1-based line/column positions.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        LineIndex {
            line_starts,
            len: source.len(),
        }
    }

    pub fn location(&self, offset: usize) -> SourceLocation {
        let offset = offset.min(self.len);
        let line = match self.line_starts.binary_search(&offset) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        let column = offset - self.line_starts[line];
        SourceLocation {
            line: (line + 1) as u32,
            column: (column + 1) as u32,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIAGNOSTIC
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub fn new(code: &str, message: &str, file: &str, location: SourceLocation) -> Self {
        Self::with_details(code, message, file, location, None, vec![])
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        location: SourceLocation,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        let error_type = if code.starts_with("CHTL-INV") {
            "INTERNAL_INVARIANT_VIOLATION"
        } else {
            "COMPILE_ERROR"
        };
        Diagnostic {
            code: code.to_string(),
            error_type: error_type.to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line: location.line,
            column: location.column,
            context,
            hints,
        }
    }

    /// The offending source line, if the location falls inside `source`.
    pub fn attach_context(mut self, source: &str) -> Self {
        self.context = source
            .lines()
            .nth(self.line.saturating_sub(1) as usize)
            .map(|line| line.to_string());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: [{}] {}",
            self.file, self.line, self.column, self.code, self.message
        )?;
        if let Some(context) = &self.context {
            write!(f, "\n    {}", context)?;
        }
        for hint in &self.hints {
            write!(f, "\n    hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index_locations() {
        let index = LineIndex::new("div {\n  text { \"hi\" }\n}");
        assert_eq!(index.location(0), SourceLocation { line: 1, column: 1 });
        assert_eq!(index.location(6), SourceLocation { line: 2, column: 1 });
        assert_eq!(index.location(8), SourceLocation { line: 2, column: 3 });
        // Past the end clamps to the last position.
        assert_eq!(index.location(1000).line, 3);
    }

    #[test]
    fn test_span_helpers() {
        let a = Span::new(4, 8);
        let b = Span::new(2, 5);
        assert_eq!(a.to(b), Span::new(2, 8));
        assert_eq!(a.shift(10), Span::new(14, 18));
        assert!(a.contains(4));
        assert!(!a.contains(8));
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn test_internal_codes_are_classified() {
        let loc = SourceLocation { line: 1, column: 1 };
        let internal = Diagnostic::new(INV_DANGLING_PLACEHOLDER, "x", "a.chtl", loc);
        let user = Diagnostic::new(ERR_UNIT_MISMATCH, "y", "a.chtl", loc);
        assert_eq!(internal.error_type, "INTERNAL_INVARIANT_VIOLATION");
        assert_eq!(user.error_type, "COMPILE_ERROR");
        assert!(user.guarantee.contains("units"));
    }
}
