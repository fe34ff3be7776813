//! Document tree produced by the markup parser.

use crate::diagnostics::Span;
use crate::expr::Expr;
use crate::scanner::{FragmentKind, Placeholder};
use crate::visitor::{walk_element, DocumentVisitor};
use serde::Serialize;
use std::collections::BTreeSet;

/// Pre-order index of an element within its document.
pub type NodeId = u32;

// ═══════════════════════════════════════════════════════════════════════════════
// NODES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub children: Vec<Node>,
    /// Local style blocks folded into element declarations. Their placeholders
    /// never reach the generated markup.
    pub consumed_styles: BTreeSet<Placeholder>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Node {
    Element(Element),
    Text(TextNode),
    Comment(CommentNode),
    Placeholder(PlaceholderNode),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub node_id: NodeId,
    pub tag: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
    pub style: Vec<StyleDeclaration>,
    pub conditionals: Vec<ConditionalBlock>,
    /// Selector rules from the local style block, hoisted to the CSS channel.
    pub rules: Vec<StyleRule>,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNode {
    pub value: String,
    pub span: Span,
}

/// Generator comment (`-- text`), emitted into the HTML.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub value: String,
    pub span: Span,
}

/// A style or script block left in place for the merger to resolve.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderNode {
    pub placeholder: Placeholder,
    pub kind: FragmentKind,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AttributeValue {
    Literal { value: String },
    Responsive { variable: String, unit: String },
}

impl AttributeValue {
    pub fn literal(&self) -> Option<&str> {
        match self {
            AttributeValue::Literal { value } => Some(value),
            AttributeValue::Responsive { .. } => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STYLE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleDeclaration {
    pub key: String,
    pub value: StyleValue,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StyleValue {
    Literal { text: String },
    Expr { expr: Expr },
    /// `$variable$unit`: written by runtime glue, absent from the static style.
    Responsive { variable: String, unit: String },
}

impl StyleValue {
    pub fn is_responsive(&self) -> bool {
        matches!(self, StyleValue::Responsive { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleRule {
    /// May contain `&`, which stands for the owning element.
    pub selector: String,
    pub body: String,
    pub span: Span,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub expr: Expr,
    /// Condition as written.
    pub text: String,
}

/// One `if`, `else if` or `else` branch. The head of a chain carries the
/// rest of it in `next`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBlock {
    /// `None` for `else`.
    pub condition: Option<Condition>,
    pub body: Vec<StyleDeclaration>,
    pub children: Vec<Node>,
    pub next: Option<Box<ConditionalBlock>>,
    /// Number of element children that precede the chain. Only meaningful on
    /// the head.
    pub anchor: usize,
    pub span: Span,
}

impl ConditionalBlock {
    pub fn branches(&self) -> Branches<'_> {
        Branches { next: Some(self) }
    }

    /// A chain is dynamic when any of its conditions reads a runtime operand.
    pub fn is_dynamic(&self) -> bool {
        self.branches()
            .any(|branch| branch.condition.as_ref().is_some_and(|c| c.expr.is_dynamic()))
    }
}

pub struct Branches<'a> {
    next: Option<&'a ConditionalBlock>,
}

impl<'a> Iterator for Branches<'a> {
    type Item = &'a ConditionalBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.next.as_deref();
        Some(current)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ELEMENT HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

impl Element {
    pub fn new(node_id: NodeId, tag: impl Into<String>, span: Span) -> Self {
        Element {
            node_id,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            style: Vec::new(),
            conditionals: Vec::new(),
            rules: Vec::new(),
            span,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }

    /// Literal `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.attribute("id").and_then(|attr| attr.value.literal())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attribute("class")
            .and_then(|attr| attr.value.literal())
            .unwrap_or("")
            .split_whitespace()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }

    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        match self.attributes.iter_mut().find(|attr| attr.name == "class") {
            Some(Attribute {
                value: AttributeValue::Literal { value },
                ..
            }) => {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(class);
            }
            Some(_) => {}
            None => self.attributes.push(Attribute {
                name: "class".to_string(),
                value: AttributeValue::Literal {
                    value: class.to_string(),
                },
                span: self.span,
            }),
        }
    }

    pub fn set_id_if_absent(&mut self, id: &str) {
        if self.attribute("id").is_none() {
            self.attributes.push(Attribute {
                name: "id".to_string(),
                value: AttributeValue::Literal {
                    value: id.to_string(),
                },
                span: self.span,
            });
        }
    }

    pub fn matches(&self, selector: &Selector) -> bool {
        match selector {
            Selector::Id(id) => self.id() == Some(id.as_str()),
            Selector::Class(class) => self.has_class(class),
            Selector::Tag(tag) => self.tag == *tag,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SELECTORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "kebab-case")]
pub enum Selector {
    Id(String),
    Class(String),
    Tag(String),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Id(name) => write!(f, "#{}", name),
            Selector::Class(name) => write!(f, ".{}", name),
            Selector::Tag(name) => f.write_str(name),
        }
    }
}

struct SelectorFinder<'d, 's> {
    selector: &'s Selector,
    found: Option<&'d Element>,
}

impl<'d, 's> DocumentVisitor<'d> for SelectorFinder<'d, 's> {
    fn visit_element(&mut self, element: &'d Element) {
        if self.found.is_some() {
            return;
        }
        if element.matches(self.selector) {
            self.found = Some(element);
            return;
        }
        walk_element(self, element);
    }
}

/// First element in document order matching `selector`.
pub fn find_in_document<'d>(document: &'d Document, selector: &Selector) -> Option<&'d Element> {
    let mut finder = SelectorFinder {
        selector,
        found: None,
    };
    finder.visit_document(document);
    finder.found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: NodeId, tag: &str) -> Element {
        Element::new(id, tag, Span::default())
    }

    #[test]
    fn test_add_class_appends_once() {
        let mut el = element(0, "div");
        el.add_class("box");
        el.add_class("wide");
        el.add_class("box");
        assert_eq!(el.classes().collect::<Vec<_>>(), vec!["box", "wide"]);
    }

    #[test]
    fn test_find_in_document_is_preorder() {
        let mut outer = element(0, "section");
        let mut inner = element(1, "div");
        inner.add_class("box");
        outer.children.push(Node::Element(inner));
        let mut sibling = element(2, "div");
        sibling.add_class("box");
        sibling.set_id_if_absent("second");

        let document = Document {
            children: vec![Node::Element(outer), Node::Element(sibling)],
            consumed_styles: BTreeSet::new(),
        };

        let found = find_in_document(&document, &Selector::Class("box".into())).unwrap();
        assert_eq!(found.node_id, 1);
        let found = find_in_document(&document, &Selector::Id("second".into())).unwrap();
        assert_eq!(found.node_id, 2);
        assert!(find_in_document(&document, &Selector::Tag("span".into())).is_none());
    }
}
