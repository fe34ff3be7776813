//! # CHTL Compiler Pipeline
//!
//! ## Unit Invariants
//!
//! 1. **Fragments**: The scanner cuts every `style {}` and `script {}` block out of the
//!    markup stream and leaves exactly one placeholder in its place.
//!
//! 2. **Two Phases**: Markup generation and script parsing write to a collecting
//!    [`Bridge`]. Script generation only ever sees the sealed [`BridgeSnapshot`].
//!
//! 3. **Resolution**: Every placeholder is resolved exactly once by the merger. An
//!    unknown or repeated placeholder is an internal error, never a user error.
//!
//! 4. **Isolation**: Each unit owns its scanner state, document, template registry
//!    and bridge. Only the extension registry is shared, read-only.
//!
//! ## Stages
//!
//! `scan` → `parse_markup` → `generate_markup` → `parse_script` → seal →
//! `generate_script` / `generate_runtime` → `merge`

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Once;
use thiserror::Error;

pub mod ast;
pub mod bridge;
pub mod codegen;
pub mod diagnostics;
pub mod dispatcher;
pub mod evaluator;
pub mod expr;
pub mod extension;
pub mod generator;
pub mod markup;
pub mod merger;
pub mod scanner;
pub mod script;
pub mod templates;
pub mod visitor;

#[cfg(test)]
mod conditional_tests;
#[cfg(test)]
mod pipeline_tests;

pub use ast::{find_in_document, Document, Element, Node, Selector};
pub use bridge::{Bridge, BridgeSnapshot};
pub use diagnostics::{Diagnostic, Span};
pub use dispatcher::{dispatch, CompileOptions, CompiledOutputs, DispatchError, Dispatcher, SubCompilerError};
pub use evaluator::{evaluate, EvalError, StyleMap, Value};
pub use extension::{scan_custom_syntax, ExtensionError, ExtensionRegistry, MatchedArgs, SyntaxExtension};
pub use markup::{parse_markup, MarkupError};
pub use merger::{merge, substitute_placeholders, MergeError, MergeOptions, MergedOutput, Preludes};
pub use scanner::{scan, Fragment, FragmentKind, Placeholder, ScanError, ScannedSource};
pub use script::{parse_script, ScriptAst, ScriptError};

use diagnostics::{
    LineIndex, ERR_UNTERMINATED_BLOCK, INV_DANGLING_PLACEHOLDER, INV_DUPLICATE_PLACEHOLDER,
};

static TRACING_INIT: Once = Once::new();

/// Install a `tracing` subscriber filtered by `RUST_LOG`. Does nothing when
/// `RUST_LOG` is unset or a subscriber was already installed by this call.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

fn merge_code(error: &MergeError) -> &'static str {
    match error {
        MergeError::DanglingPlaceholder { .. } => INV_DANGLING_PLACEHOLDER,
        MergeError::DuplicatePlaceholder { .. } => INV_DUPLICATE_PLACEHOLDER,
    }
}

impl CompileError {
    /// True for broken pipeline invariants; false for errors in the source.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            CompileError::Merge(_) | CompileError::Dispatch(DispatchError::Output(_))
        )
    }

    pub fn to_diagnostic(&self, file: &str, source: &str) -> Diagnostic {
        let index = LineIndex::new(source);
        let diagnostic = match self {
            CompileError::Dispatch(DispatchError::Scan(error)) => Diagnostic::with_details(
                ERR_UNTERMINATED_BLOCK,
                &error.to_string(),
                file,
                index.location(error.span().start),
                None,
                vec!["Check for a missing '}' or an unclosed string inside the block.".to_string()],
            ),
            CompileError::Dispatch(DispatchError::SubCompilerFailed {
                fragment_range,
                kind,
                cause,
            }) => {
                let fragment = index.location(fragment_range.start);
                Diagnostic::with_details(
                    cause.code(),
                    &cause.to_string(),
                    file,
                    index.location(cause.span().start),
                    None,
                    vec![format!(
                        "in the {} fragment starting at line {}, column {}",
                        kind, fragment.line, fragment.column
                    )],
                )
            }
            CompileError::Dispatch(DispatchError::Output(error)) | CompileError::Merge(error) => {
                Diagnostic::new(merge_code(error), &error.to_string(), file, index.location(0))
            }
        };
        diagnostic.attach_context(source)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub html: String,
    pub css: String,
    pub js: String,
    pub bridge: BridgeSnapshot,
}

/// One compilation unit for [`compile_many`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUnit {
    pub path: String,
    pub source: String,
}

/// Compile one unit with no syntax extensions.
pub fn compile(source: &str, options: &CompileOptions) -> Result<CompileResult, CompileError> {
    compile_with_extensions(source, options, &ExtensionRegistry::new())
}

#[tracing::instrument(level = "debug", skip_all, fields(file = %options.file_path))]
pub fn compile_with_extensions(
    source: &str,
    options: &CompileOptions,
    extensions: &ExtensionRegistry,
) -> Result<CompileResult, CompileError> {
    let outputs = Dispatcher::new(extensions)
        .with_runtime(options.emit_runtime)
        .dispatch(source)?;
    let merged = merge(
        &outputs.markup,
        &outputs.fragments,
        &Preludes {
            css: outputs.prelude_css,
            js: outputs.prelude_js,
        },
        options.merge_options(),
    )?;
    Ok(CompileResult {
        html: merged.html,
        css: merged.css,
        js: merged.js,
        bridge: outputs.bridge,
    })
}

/// Compile independent units in parallel. Results are in input order.
pub fn compile_many(
    units: &[SourceUnit],
    options: &CompileOptions,
    extensions: &ExtensionRegistry,
) -> Vec<Result<CompileResult, CompileError>> {
    tracing::debug!(units = units.len(), "compiling units in parallel");
    units
        .par_iter()
        .map(|unit| {
            let options = CompileOptions {
                file_path: unit.path.clone(),
                ..options.clone()
            };
            compile_with_extensions(&unit.source, &options, extensions)
        })
        .collect()
}
