//! Compiler dispatch for one compilation unit.
//!
//! Phase one runs the markup pipeline and parses every script while the
//! [`Bridge`] is collecting. Sealing the bridge starts phase two, which lowers
//! scripts and emits runtime glue from the read-only snapshot.

use crate::bridge::{Bridge, BridgeSnapshot};
use crate::codegen::{generate_runtime, generate_script};
use crate::diagnostics::{
    Span, ERR_CIRCULAR_REFERENCE, ERR_EXTENSION, ERR_MALFORMED_CONDITION, ERR_MARKUP_SYNTAX, ERR_MISPLACED_BLOCK,
    ERR_SCRIPT_CONTEXT, ERR_SCRIPT_SYNTAX, ERR_TYPE_MISMATCH, ERR_UNIT_MISMATCH, ERR_UNKNOWN_TEMPLATE,
    ERR_UNRESOLVED_REFERENCE,
};
use crate::evaluator::EvalError;
use crate::extension::{ExtensionError, ExtensionRegistry};
use crate::generator::generate_markup;
use crate::markup::{parse_markup, MarkupError};
use crate::merger::{CompiledFragment, FragmentOutputs, MergeError, MergeOptions};
use crate::scanner::{scan, FragmentKind, ScanError, ScannedSource};
use crate::script::{parse_script, ScriptAst, ScriptError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    /// Used in diagnostics only.
    pub file_path: String,
    pub inline_html: bool,
    pub default_struct: bool,
    /// Emit runtime glue for responsive values and dynamic conditionals.
    pub emit_runtime: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            file_path: "<input>".to_string(),
            inline_html: false,
            default_struct: false,
            emit_runtime: true,
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            inline_html: self.inline_html,
            default_struct: self.default_struct,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubCompilerError {
    #[error(transparent)]
    Markup(#[from] MarkupError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

impl SubCompilerError {
    pub fn span(&self) -> Span {
        match self {
            SubCompilerError::Markup(e) => e.span(),
            SubCompilerError::Eval(e) => e.span(),
            SubCompilerError::Script(e) => e.span(),
            SubCompilerError::Extension(e) => e.span,
        }
    }

    /// Diagnostic code of the underlying failure.
    pub fn code(&self) -> &'static str {
        match self {
            SubCompilerError::Markup(e) => match e {
                MarkupError::UnexpectedToken { .. } | MarkupError::UnexpectedEof { .. } => ERR_MARKUP_SYNTAX,
                MarkupError::UnknownTemplate { .. } => ERR_UNKNOWN_TEMPLATE,
                MarkupError::MalformedCondition { .. } => ERR_MALFORMED_CONDITION,
                MarkupError::MisplacedBlock { .. } => ERR_MISPLACED_BLOCK,
            },
            SubCompilerError::Eval(e) => match e {
                EvalError::UnitMismatch { .. } => ERR_UNIT_MISMATCH,
                EvalError::TypeMismatch { .. } => ERR_TYPE_MISMATCH,
                EvalError::UnresolvedReference { .. } => ERR_UNRESOLVED_REFERENCE,
                EvalError::CircularReference { .. } => ERR_CIRCULAR_REFERENCE,
            },
            SubCompilerError::Script(ScriptError::MissingContext { .. }) => ERR_SCRIPT_CONTEXT,
            SubCompilerError::Script(_) => ERR_SCRIPT_SYNTAX,
            SubCompilerError::Extension(_) => ERR_EXTENSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("{kind} fragment at {start}..{end} failed to compile: {cause}", start = .fragment_range.start, end = .fragment_range.end)]
    SubCompilerFailed {
        fragment_range: Span,
        kind: FragmentKind,
        cause: SubCompilerError,
    },

    /// Two outputs for one placeholder.
    #[error(transparent)]
    Output(#[from] MergeError),
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISPATCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the merger needs, plus the sealed bridge for inspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledOutputs {
    /// Generated HTML with script and global style placeholders in place.
    pub markup: String,
    pub fragments: FragmentOutputs,
    /// Hoisted local style rules.
    pub prelude_css: String,
    /// Runtime glue.
    pub prelude_js: String,
    pub bridge: BridgeSnapshot,
}

pub struct Dispatcher<'r> {
    extensions: &'r ExtensionRegistry,
    emit_runtime: bool,
}

impl<'r> Dispatcher<'r> {
    pub fn new(extensions: &'r ExtensionRegistry) -> Self {
        Dispatcher {
            extensions,
            emit_runtime: true,
        }
    }

    pub fn with_runtime(mut self, emit_runtime: bool) -> Self {
        self.emit_runtime = emit_runtime;
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(len = source.len()))]
    pub fn dispatch(&self, source: &str) -> Result<CompiledOutputs, DispatchError> {
        let scanned = scan(source)?;
        let mut bridge = Bridge::new();

        // Phase one: markup.
        let document = parse_markup(&scanned).map_err(|e| attribute_failure(&scanned, source, e.into()))?;
        let generated = generate_markup(&document, &mut bridge).map_err(|e| attribute_failure(&scanned, source, e.into()))?;

        // Phase one: scripts.
        let mut scripts: Vec<(usize, ScriptAst)> = Vec::new();
        for (index, fragment) in scanned.fragments().iter().enumerate() {
            if fragment.kind != FragmentKind::Script {
                continue;
            }
            let base = fragment.body_range.start;
            let failed = |cause: SubCompilerError| DispatchError::SubCompilerFailed {
                fragment_range: fragment.range,
                kind: fragment.kind,
                cause,
            };
            let text = if self.extensions.is_empty() {
                fragment.text.clone()
            } else {
                self.extensions.apply(&fragment.text, base).map_err(|e| failed(e.into()))?
            };
            let ast = parse_script(&text, base, &mut bridge).map_err(|e| failed(e.into()))?;
            scripts.push((index, ast));
        }

        let snapshot = bridge.snapshot();
        tracing::debug!(runtime = snapshot.needs_runtime(), "bridge sealed");

        // Phase two.
        let mut compiled_scripts = Vec::with_capacity(scripts.len());
        for (index, ast) in &scripts {
            let fragment = &scanned.fragments()[*index];
            let placeholder = fragment.placeholder.as_ref().map(|p| p.as_str());
            let js = generate_script(ast, &snapshot, placeholder).map_err(|e| DispatchError::SubCompilerFailed {
                fragment_range: fragment.range,
                kind: fragment.kind,
                cause: e.into(),
            })?;
            compiled_scripts.push((*index, js));
        }

        let mut fragments = FragmentOutputs::new();
        let mut compiled_scripts = compiled_scripts.into_iter().peekable();
        for (index, fragment) in scanned.fragments().iter().enumerate() {
            let Some(placeholder) = &fragment.placeholder else { continue };
            let text = match fragment.kind {
                FragmentKind::Style if document.consumed_styles.contains(placeholder) => String::new(),
                FragmentKind::Style => fragment.text.trim().to_string(),
                _ => match compiled_scripts.next_if(|(i, _)| *i == index) {
                    Some((_, js)) => js.trim().to_string(),
                    None => String::new(),
                },
            };
            fragments.insert(
                placeholder.clone(),
                CompiledFragment {
                    kind: fragment.kind,
                    text,
                },
            )?;
        }

        let prelude_js = if self.emit_runtime {
            generate_runtime(&snapshot)
        } else {
            String::new()
        };
        tracing::debug!(fragments = fragments.len(), "dispatched compilation unit");

        Ok(CompiledOutputs {
            markup: generated.html,
            fragments,
            prelude_css: generated.hoisted_css,
            prelude_js,
            bridge: snapshot,
        })
    }
}

/// Blame the fragment that contains the failure position.
fn attribute_failure(scanned: &ScannedSource, source: &str, cause: SubCompilerError) -> DispatchError {
    let (fragment_range, kind) = scanned
        .fragment_at(cause.span().start)
        .map(|fragment| (fragment.range, fragment.kind))
        .unwrap_or((Span::new(0, source.len()), FragmentKind::Chtl));
    tracing::debug!(code = cause.code(), start = fragment_range.start, "sub-compiler failed");
    DispatchError::SubCompilerFailed {
        fragment_range,
        kind,
        cause,
    }
}

/// Dispatch `source` with no syntax extensions.
pub fn dispatch(source: &str) -> Result<CompiledOutputs, DispatchError> {
    let extensions = ExtensionRegistry::new();
    Dispatcher::new(&extensions).dispatch(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_options_from_json() {
        let options = CompileOptions::from_json(r#"{"filePath": "page.chtl", "inlineHtml": true}"#).unwrap();
        assert_eq!(options.file_path, "page.chtl");
        assert!(options.inline_html);
        assert!(!options.default_struct);
        assert!(options.emit_runtime);
    }

    #[test]
    fn test_every_placeholder_gets_an_output() {
        let source = "style { body { margin: 0; } }\ndiv { style { color: red; } script { run(); } }";
        let outputs = dispatch(source).unwrap();
        let kinds: Vec<_> = outputs.fragments.iter().map(|(_, f)| (f.kind, f.text.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (FragmentKind::Style, "body { margin: 0; }"),
                (FragmentKind::Style, ""),
                (FragmentKind::Script, "run();"),
            ]
        );
        assert!(outputs.markup.contains("style=\"color: red; \""));
        assert_eq!(outputs.prelude_js, "");
    }

    #[test]
    fn test_markup_failure_names_fragment() {
        let source = "div { }\nspan { style { width: 10px + 2em; } }";
        let err = dispatch(source).unwrap_err();
        let DispatchError::SubCompilerFailed {
            fragment_range,
            kind,
            cause,
        } = err
        else {
            panic!("expected sub-compiler failure, got {:?}", err);
        };
        assert_eq!(kind, FragmentKind::Style);
        assert_eq!(&source[fragment_range.range()], "style { width: 10px + 2em; }");
        assert_eq!(cause.code(), ERR_UNIT_MISMATCH);
    }

    #[test]
    fn test_script_failure_names_fragment() {
        let source = "div { }\nscript { {{#a }";
        let err = dispatch(source).unwrap_err();
        assert!(matches!(err, DispatchError::Scan(_)), "got {:?}", err);

        let source = "div { }\nscript { {{&}}->focus(); }";
        let err = dispatch(source).unwrap_err();
        let DispatchError::SubCompilerFailed { fragment_range, cause, .. } = err else {
            panic!("expected sub-compiler failure");
        };
        assert_eq!(fragment_range.start, 8);
        assert_eq!(cause.code(), ERR_SCRIPT_CONTEXT);
    }

    #[test]
    fn test_runtime_can_be_disabled() {
        let source = "div { style { width: $w$px; } }";
        let extensions = ExtensionRegistry::new();
        let with = Dispatcher::new(&extensions).dispatch(source).unwrap();
        let without = Dispatcher::new(&extensions).with_runtime(false).dispatch(source).unwrap();
        assert!(with.prelude_js.contains("Object.defineProperty(window, 'w'"));
        assert_eq!(without.prelude_js, "");
        assert!(without.bridge.is_responsive_variable("w"));
    }
}
