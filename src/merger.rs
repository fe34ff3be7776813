//! Output assembly.
//!
//! The merger resolves every placeholder the scanner emitted, routes compiled
//! style and script text into their channels and optionally wraps everything
//! into one HTML document.

use crate::scanner::{FragmentKind, Placeholder};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"__CHTL_(?:STYLE|SCRIPT)_[0-9a-f]{8}_\d+__").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("placeholder `{token}` has no compiled fragment")]
    DanglingPlaceholder { token: String },

    #[error("placeholder `{token}` was resolved more than once")]
    DuplicatePlaceholder { token: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledFragment {
    pub kind: FragmentKind,
    pub text: String,
}

/// Compiled fragments keyed by placeholder, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FragmentOutputs {
    entries: Vec<(Placeholder, CompiledFragment)>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl FragmentOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, placeholder: Placeholder, fragment: CompiledFragment) -> Result<(), MergeError> {
        if self.index.contains_key(placeholder.as_str()) {
            return Err(MergeError::DuplicatePlaceholder {
                token: placeholder.to_string(),
            });
        }
        self.index.insert(placeholder.to_string(), self.entries.len());
        self.entries.push((placeholder, fragment));
        Ok(())
    }

    pub fn get(&self, token: &str) -> Option<&CompiledFragment> {
        self.index.get(token).map(|&i| &self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Placeholder, &CompiledFragment)> {
        self.entries.iter().map(|(p, f)| (p, f))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Wrap the result in one `<html>` document with inline `<style>`/`<script>`.
    pub inline_html: bool,
    /// Add a `<head>` around the inline style.
    pub default_struct: bool,
}

/// Document-level text placed ahead of the fragment outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preludes {
    /// Hoisted local style rules.
    pub css: String,
    /// Runtime glue.
    pub js: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergedOutput {
    pub html: String,
    pub css: String,
    pub js: String,
}

/// Replace every known placeholder in `text` with its mapped value. Tokens
/// that only appear after a substitution are resolved too; unknown tokens are
/// left as they are.
pub fn substitute_placeholders(text: &str, map: &HashMap<String, String>) -> String {
    let mut resolved: HashSet<String> = HashSet::new();
    let mut out = text.to_string();
    loop {
        let mut changed = false;
        let next = PLACEHOLDER_RE.replace_all(&out, |caps: &Captures| {
            let token = &caps[0];
            match map.get(token) {
                Some(value) if !resolved.contains(token) => {
                    changed = true;
                    value.clone()
                }
                _ => token.to_string(),
            }
        });
        if !changed {
            return out;
        }
        let next = next.into_owned();
        for token in map.keys() {
            if out.contains(token.as_str()) {
                resolved.insert(token.clone());
            }
        }
        out = next;
    }
}

fn join_channel(prelude: &str, pieces: Vec<&str>) -> String {
    std::iter::once(prelude)
        .chain(pieces)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve the placeholders of `main_text` against `fragments` and assemble
/// the final outputs.
#[tracing::instrument(level = "debug", skip_all, fields(fragments = fragments.len(), inline = options.inline_html))]
pub fn merge(
    main_text: &str,
    fragments: &FragmentOutputs,
    preludes: &Preludes,
    options: MergeOptions,
) -> Result<MergedOutput, MergeError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for token in PLACEHOLDER_RE.find_iter(main_text) {
        let token = token.as_str();
        if fragments.get(token).is_none() {
            return Err(MergeError::DanglingPlaceholder {
                token: token.to_string(),
            });
        }
        if !seen.insert(token) {
            return Err(MergeError::DuplicatePlaceholder {
                token: token.to_string(),
            });
        }
    }
    let body = PLACEHOLDER_RE.replace_all(main_text, "").into_owned();

    let mut styles = Vec::new();
    let mut scripts = Vec::new();
    for (_, fragment) in fragments.iter() {
        match fragment.kind {
            FragmentKind::Style => styles.push(fragment.text.as_str()),
            FragmentKind::Script => scripts.push(fragment.text.as_str()),
            FragmentKind::Chtl => {}
        }
    }
    let css = join_channel(&preludes.css, styles);
    let js = join_channel(&preludes.js, scripts);
    tracing::debug!(css_len = css.len(), js_len = js.len(), "merged channels");

    if !options.inline_html {
        return Ok(MergedOutput { html: body, css, js });
    }

    let mut html = String::from("<html>");
    let style = (!css.is_empty()).then(|| format!("<style>{}</style>", css));
    if options.default_struct {
        html.push_str("<head>");
        html.push_str(style.as_deref().unwrap_or_default());
        html.push_str("</head>");
    } else if let Some(style) = &style {
        html.push_str(style);
    }
    html.push_str(&body);
    if !js.is_empty() {
        html.push_str("<script>");
        html.push_str(&js);
        html.push_str("</script>");
    }
    html.push_str("</html>");

    Ok(MergedOutput {
        html,
        css: String::new(),
        js: String::new(),
    })
}
