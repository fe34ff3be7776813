use crate::ast::{CommentNode, ConditionalBlock, Document, Element, Node, PlaceholderNode, TextNode};

/// The DocumentVisitor trait defines the single authoritative traversal mechanism for documents.
///
/// Rules:
/// 1. Traversal order is fixed: document order, with conditional chains visited
///    at the position they occupy among their element's children.
/// 2. Implementers override `visit_*` methods to add behavior.
/// 3. Implementers MUST call `walk_*` functions to continue traversal unless pruning is intended.
/// 4. No manual recursion outside of this system.
pub trait DocumentVisitor<'d> {
    fn visit_document(&mut self, document: &'d Document) {
        walk_document(self, document);
    }

    fn visit_node(&mut self, node: &'d Node) {
        walk_node(self, node);
    }

    fn visit_element(&mut self, element: &'d Element) {
        walk_element(self, element);
    }

    fn visit_conditional(&mut self, chain: &'d ConditionalBlock) {
        walk_conditional(self, chain);
    }

    fn visit_text(&mut self, _text: &'d TextNode) {
        // Leaf node, nothing to walk by default
    }

    fn visit_comment(&mut self, _comment: &'d CommentNode) {}

    fn visit_placeholder(&mut self, _placeholder: &'d PlaceholderNode) {}
}

pub fn walk_document<'d, V: DocumentVisitor<'d> + ?Sized>(visitor: &mut V, document: &'d Document) {
    walk_children(visitor, &document.children);
}

pub fn walk_children<'d, V: DocumentVisitor<'d> + ?Sized>(visitor: &mut V, children: &'d [Node]) {
    for node in children {
        visitor.visit_node(node);
    }
}

pub fn walk_node<'d, V: DocumentVisitor<'d> + ?Sized>(visitor: &mut V, node: &'d Node) {
    match node {
        Node::Element(element) => visitor.visit_element(element),
        Node::Text(text) => visitor.visit_text(text),
        Node::Comment(comment) => visitor.visit_comment(comment),
        Node::Placeholder(placeholder) => visitor.visit_placeholder(placeholder),
    }
}

pub fn walk_element<'d, V: DocumentVisitor<'d> + ?Sized>(visitor: &mut V, element: &'d Element) {
    let mut chains = element.conditionals.iter().peekable();
    for (index, child) in element.children.iter().enumerate() {
        while let Some(chain) = chains.next_if(|chain| chain.anchor <= index) {
            visitor.visit_conditional(chain);
        }
        visitor.visit_node(child);
    }
    for chain in chains {
        visitor.visit_conditional(chain);
    }
}

/// Visits the children of every branch, in branch order.
pub fn walk_conditional<'d, V: DocumentVisitor<'d> + ?Sized>(visitor: &mut V, chain: &'d ConditionalBlock) {
    for branch in chain.branches() {
        walk_children(visitor, &branch.children);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Span;

    struct TagCollector {
        tags: Vec<String>,
    }

    impl<'d> DocumentVisitor<'d> for TagCollector {
        fn visit_element(&mut self, element: &'d Element) {
            self.tags.push(element.tag.clone());
            walk_element(self, element);
        }
    }

    fn element(id: u32, tag: &str, children: Vec<Node>) -> Element {
        let mut el = Element::new(id, tag, Span::default());
        el.children = children;
        el
    }

    #[test]
    fn test_conditional_children_visited_at_anchor() {
        let mut root = element(
            0,
            "div",
            vec![
                Node::Element(element(1, "header", vec![])),
                Node::Element(element(2, "footer", vec![])),
            ],
        );
        root.conditionals.push(ConditionalBlock {
            condition: None,
            body: vec![],
            children: vec![Node::Element(element(3, "main", vec![]))],
            next: None,
            anchor: 1,
            span: Span::default(),
        });

        let document = Document {
            children: vec![Node::Element(root)],
            ..Default::default()
        };
        let mut collector = TagCollector { tags: vec![] };
        collector.visit_document(&document);
        assert_eq!(collector.tags, vec!["div", "header", "main", "footer"]);
    }
}
