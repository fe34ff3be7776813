//! HTML generation over a fully parsed document.
//!
//! Static conditionals are resolved through the [`StyleResolver`]; dynamic
//! ones, responsive values and local scripts become Bridge facts keyed by the
//! element ids assigned here.

use crate::ast::{ConditionalBlock, Document, Element, Node, StyleValue};
use crate::bridge::{Bridge, DynamicConditionalBinding};
use crate::evaluator::{EvalError, StyleMap, StyleResolver};
use crate::scanner::FragmentKind;
use crate::visitor::{walk_element, DocumentVisitor};
use std::collections::{HashMap, HashSet};

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedMarkup {
    /// HTML with script and global style placeholders still in place.
    pub html: String,
    /// Selector rules hoisted out of local style blocks.
    pub hoisted_css: String,
}

/// Generate HTML for `document`, recording cross-compiler facts in `bridge`.
#[tracing::instrument(level = "debug", skip_all)]
pub fn generate_markup(document: &Document, bridge: &mut Bridge) -> Result<GeneratedMarkup, EvalError> {
    let mut generator = HtmlGenerator {
        resolver: StyleResolver::new(document),
        bridge,
        ids: IdAllocator::for_document(document),
        html: String::new(),
        css: String::new(),
    };
    for node in &document.children {
        generator.node(node, None)?;
    }
    tracing::debug!(html_len = generator.html.len(), css_len = generator.css.len(), "generated markup");
    Ok(GeneratedMarkup {
        html: generator.html,
        hoisted_css: generator.css,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// ID ALLOCATION
// ═══════════════════════════════════════════════════════════════════════════════

struct IdCollector {
    ids: HashSet<String>,
}

impl<'d> DocumentVisitor<'d> for IdCollector {
    fn visit_element(&mut self, element: &'d Element) {
        if let Some(id) = element.id() {
            self.ids.insert(id.to_string());
        }
        walk_element(self, element);
    }
}

/// Hands out `<prefix>-<n>` ids that no author-written id already uses.
struct IdAllocator {
    taken: HashSet<String>,
    counters: HashMap<&'static str, usize>,
}

impl IdAllocator {
    fn for_document(document: &Document) -> Self {
        let mut collector = IdCollector { ids: HashSet::new() };
        collector.visit_document(document);
        IdAllocator {
            taken: collector.ids,
            counters: HashMap::new(),
        }
    }

    fn allocate(&mut self, prefix: &'static str) -> String {
        let counter = self.counters.entry(prefix).or_insert(0);
        loop {
            let id = format!("{}-{}", prefix, counter);
            *counter += 1;
            if self.taken.insert(id.clone()) {
                return id;
            }
        }
    }
}

/// Elements the runtime or a script has to find by id.
fn needs_id(element: &Element) -> bool {
    element.attributes.iter().any(|attr| attr.value.literal().is_none())
        || element.style.iter().any(|decl| decl.value.is_responsive())
        || element.conditionals.iter().any(ConditionalBlock::is_dynamic)
        || element
            .children
            .iter()
            .any(|child| matches!(child, Node::Placeholder(p) if p.kind == FragmentKind::Script))
        || (element.rules.iter().any(|rule| rule.selector.contains('&')) && element.classes().next().is_none())
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATOR
// ═══════════════════════════════════════════════════════════════════════════════

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}

/// Condition under which branch `n` of a chain is taken: every earlier
/// condition false and its own true.
fn guard_expression(previous: &[String], condition: Option<&str>) -> String {
    let mut parts: Vec<String> = previous.iter().map(|p| format!("!({})", p)).collect();
    if let Some(condition) = condition {
        if parts.is_empty() {
            parts.push(condition.to_string());
        } else {
            parts.push(format!("({})", condition));
        }
    }
    if parts.is_empty() {
        "true".to_string()
    } else {
        parts.join(" && ")
    }
}

struct HtmlGenerator<'d, 'b> {
    resolver: StyleResolver<'d>,
    bridge: &'b mut Bridge,
    ids: IdAllocator,
    html: String,
    css: String,
}

impl<'d, 'b> HtmlGenerator<'d, 'b> {
    fn node(&mut self, node: &'d Node, parent_id: Option<&str>) -> Result<(), EvalError> {
        match node {
            Node::Element(element) => self.element(element)?,
            Node::Text(text) => self.html.push_str(&escape_text(&text.value)),
            Node::Comment(comment) => {
                self.html.push_str("<!-- ");
                self.html.push_str(&comment.value.replace("--", "- -"));
                self.html.push_str(" -->");
            }
            Node::Placeholder(placeholder) => {
                if placeholder.kind == FragmentKind::Script {
                    if let Some(id) = parent_id {
                        self.bridge
                            .record_script_context(placeholder.placeholder.as_str(), id);
                    }
                }
                self.html.push_str(placeholder.placeholder.as_str());
            }
        }
        Ok(())
    }

    fn push_attr(&mut self, name: &str, value: &str) {
        self.html.push(' ');
        self.html.push_str(name);
        self.html.push_str("=\"");
        self.html.push_str(&escape_attr(value));
        self.html.push('"');
    }

    fn element(&mut self, element: &'d Element) -> Result<(), EvalError> {
        let resolved = self.resolver.resolve(element)?;
        let auto_id = match element.id() {
            None if needs_id(element) => Some(self.ids.allocate("chtl-el")),
            _ => None,
        };
        let element_id = element.id().map(str::to_string).or_else(|| auto_id.clone());

        if let Some(id) = &element_id {
            self.record_responsive(element, id);
        }

        self.html.push('<');
        self.html.push_str(&element.tag);
        if let Some(id) = &auto_id {
            self.push_attr("id", id);
        }
        let mut style_attr = resolved.style.to_style_attribute();
        for attr in &element.attributes {
            let Some(value) = attr.value.literal() else { continue };
            if attr.name == "style" {
                style_attr.push_str(value);
            } else {
                self.push_attr(&attr.name, value);
            }
        }
        if !style_attr.is_empty() {
            self.push_attr("style", &style_attr);
        }
        self.html.push('>');

        let is_void = VOID_ELEMENTS.contains(&element.tag.as_str());
        if !(is_void && element.children.is_empty() && element.conditionals.is_empty()) {
            let mut chains = element.conditionals.iter().zip(&resolved.fired).peekable();
            for (index, child) in element.children.iter().enumerate() {
                while let Some((chain, fired)) = chains.next_if(|(chain, _)| chain.anchor <= index) {
                    self.chain(chain, *fired, &resolved.style, element_id.as_deref())?;
                }
                self.node(child, element_id.as_deref())?;
            }
            for (chain, fired) in chains {
                self.chain(chain, *fired, &resolved.style, element_id.as_deref())?;
            }
            self.html.push_str("</");
            self.html.push_str(&element.tag);
            self.html.push('>');
        }

        self.hoist_rules(element, element_id.as_deref());
        Ok(())
    }

    fn record_responsive(&mut self, element: &Element, element_id: &str) {
        for attr in &element.attributes {
            if let crate::ast::AttributeValue::Responsive { variable, unit } = &attr.value {
                self.bridge
                    .record_responsive_binding(variable, element_id, &attr.name, unit);
            }
        }
        for declaration in &element.style {
            if let StyleValue::Responsive { variable, unit } = &declaration.value {
                let property = format!("style.{}", declaration.key);
                self.bridge
                    .record_responsive_binding(variable, element_id, &property, unit);
            }
        }
    }

    fn chain(
        &mut self,
        chain: &'d ConditionalBlock,
        fired: Option<usize>,
        style: &StyleMap,
        element_id: Option<&str>,
    ) -> Result<(), EvalError> {
        if chain.is_dynamic() {
            return self.dynamic_chain(chain, style, element_id.unwrap_or_default());
        }
        if let Some(branch) = fired.and_then(|index| chain.branches().nth(index)) {
            for child in &branch.children {
                self.node(child, element_id)?;
            }
        }
        Ok(())
    }

    fn dynamic_chain(&mut self, chain: &'d ConditionalBlock, style: &StyleMap, target: &str) -> Result<(), EvalError> {
        let chain_id = self.bridge.begin_dynamic_chain();
        let has_declarations = chain.branches().any(|branch| !branch.body.is_empty());
        let mut previous: Vec<String> = Vec::new();

        for (index, branch) in chain.branches().enumerate() {
            let condition = match &branch.condition {
                Some(condition) => Some(self.resolver.lower_to_js(&condition.expr, style)?),
                None => None,
            };
            let guard = guard_expression(&previous, condition.as_deref());

            let mut recorded = false;
            for declaration in &branch.body {
                let Some(value) = self.resolver.declaration_value(declaration, style)? else {
                    continue;
                };
                self.bridge
                    .record_dynamic_conditional_binding(DynamicConditionalBinding {
                        target_element_id: target.to_string(),
                        target_property: declaration.key.clone(),
                        expression_text: condition.clone(),
                        value,
                        chain: chain_id,
                        branch: index as u32,
                    });
                recorded = true;
            }
            if has_declarations && !recorded {
                // Keeps the branch in the runtime if/else ladder.
                self.bridge
                    .record_dynamic_conditional_binding(DynamicConditionalBinding {
                        target_element_id: target.to_string(),
                        target_property: String::new(),
                        expression_text: condition.clone(),
                        value: String::new(),
                        chain: chain_id,
                        branch: index as u32,
                    });
            }

            if !branch.children.is_empty() {
                let wrapper = self.ids.allocate("chtl-render");
                self.bridge.record_dynamic_rendering_binding(&wrapper, &guard);
                self.html.push_str("<div");
                self.push_attr("id", &wrapper);
                self.push_attr("style", "display: none;");
                self.html.push('>');
                for child in &branch.children {
                    self.node(child, Some(target))?;
                }
                self.html.push_str("</div>");
            }

            if let Some(condition) = condition {
                previous.push(condition);
            }
        }
        Ok(())
    }

    fn hoist_rules(&mut self, element: &Element, element_id: Option<&str>) {
        for rule in &element.rules {
            let selector = if rule.selector.contains('&') {
                let own = element
                    .classes()
                    .next()
                    .map(|class| format!(".{}", class))
                    .or_else(|| element_id.map(|id| format!("#{}", id)))
                    .unwrap_or_else(|| element.tag.clone());
                rule.selector.replace('&', &own)
            } else {
                rule.selector.clone()
            };
            self.css.push_str(&selector);
            self.css.push_str(" {\n  ");
            self.css.push_str(&rule.body);
            self.css.push_str("\n}\n");
        }
    }
}
