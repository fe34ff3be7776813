//! `[Template]` / `[Custom]` definitions collected while parsing one unit.

use crate::ast::{Node, StyleDeclaration};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateKind {
    Style,
    Element,
    Var,
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TemplateKind::Style => "@Style",
            TemplateKind::Element => "@Element",
            TemplateKind::Var => "@Var",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TemplateDefinition {
    Style { declarations: Vec<StyleDeclaration> },
    Element { nodes: Vec<Node> },
    Var { values: Vec<(String, String)> },
}

/// Per-unit template table. `[Custom]` definitions share the namespace of
/// `[Template]` ones; a later definition replaces an earlier one.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    styles: HashMap<String, Vec<StyleDeclaration>>,
    elements: HashMap<String, Vec<Node>>,
    vars: HashMap<String, Vec<(String, String)>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, name: impl Into<String>, definition: TemplateDefinition) {
        let name = name.into();
        tracing::trace!(%name, "defined template");
        match definition {
            TemplateDefinition::Style { declarations } => {
                self.styles.insert(name, declarations);
            }
            TemplateDefinition::Element { nodes } => {
                self.elements.insert(name, nodes);
            }
            TemplateDefinition::Var { values } => {
                self.vars.insert(name, values);
            }
        }
    }

    pub fn lookup_style(&self, name: &str) -> Option<&[StyleDeclaration]> {
        self.styles.get(name).map(Vec::as_slice)
    }

    pub fn lookup_element(&self, name: &str) -> Option<&[Node]> {
        self.elements.get(name).map(Vec::as_slice)
    }

    pub fn lookup_var(&self, group: &str, key: &str) -> Option<&str> {
        self.vars
            .get(group)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_var_group(&self, group: &str) -> bool {
        self.vars.contains_key(group)
    }

    pub fn lookup(&self, kind: TemplateKind, name: &str) -> Option<TemplateDefinition> {
        match kind {
            TemplateKind::Style => self.lookup_style(name).map(|d| TemplateDefinition::Style {
                declarations: d.to_vec(),
            }),
            TemplateKind::Element => self.lookup_element(name).map(|n| TemplateDefinition::Element {
                nodes: n.to_vec(),
            }),
            TemplateKind::Var => self.vars.get(name).map(|v| TemplateDefinition::Var { values: v.clone() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::StyleValue;
    use crate::diagnostics::Span;

    #[test]
    fn test_define_and_lookup() {
        let mut registry = TemplateRegistry::new();
        registry.define(
            "Theme",
            TemplateDefinition::Var {
                values: vec![("primary".into(), "#336699".into())],
            },
        );
        registry.define(
            "Card",
            TemplateDefinition::Style {
                declarations: vec![StyleDeclaration {
                    key: "padding".into(),
                    value: StyleValue::Literal { text: "4px".into() },
                    span: Span::default(),
                }],
            },
        );

        assert_eq!(registry.lookup_var("Theme", "primary"), Some("#336699"));
        assert_eq!(registry.lookup_var("Theme", "secondary"), None);
        assert!(registry.has_var_group("Theme"));
        assert_eq!(registry.lookup_style("Card").map(<[_]>::len), Some(1));
        assert!(registry.lookup(TemplateKind::Element, "Card").is_none());
        assert!(matches!(
            registry.lookup(TemplateKind::Style, "Card"),
            Some(TemplateDefinition::Style { .. })
        ));
    }
}
