//! Conditional Style Tests
//!
//! End-to-end checks of `if` / `else if` / `else` resolution:
//! - compile-time chains merge into the generated `style` attribute
//! - cross-element references read resolved styles
//! - runtime chains become bridge bindings and glue instead of styles

#[cfg(test)]
mod tests {
    use crate::dispatcher::{CompileOptions, DispatchError, SubCompilerError};
    use crate::evaluator::EvalError;
    use crate::{compile, CompileError, CompileResult};
    use pretty_assertions::assert_eq;

    fn compile_ok(source: &str) -> CompileResult {
        compile(source, &CompileOptions::default()).unwrap()
    }

    fn html(source: &str) -> String {
        compile_ok(source).html
    }

    fn eval_failure(source: &str) -> EvalError {
        match compile(source, &CompileOptions::default()) {
            Err(CompileError::Dispatch(DispatchError::SubCompilerFailed {
                cause: SubCompilerError::Eval(error),
                ..
            })) => error,
            other => panic!("expected evaluation failure, got {:?}", other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // STATIC CHAINS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_true_condition_goes_ahead_of_statics() {
        assert_eq!(
            html("div { style { width: 100px; } if { condition: width > 50px; display: block; } }"),
            "<div style=\"display: block; width: 100px; \"></div>"
        );
    }

    #[test]
    fn test_false_condition_adds_nothing() {
        assert_eq!(
            html("div { style { width: 40px; } if { condition: width > 50px; display: block; } }"),
            "<div style=\"width: 40px; \"></div>"
        );
    }

    #[test]
    fn test_if_else() {
        assert_eq!(
            html("div { if { condition: 10 > 5; color: red; } else { color: blue; } }"),
            "<div style=\"color: red; \"></div>"
        );
        assert_eq!(
            html("div { if { condition: 10 < 5; color: red; } else { color: blue; } }"),
            "<div style=\"color: blue; \"></div>"
        );
    }

    #[test]
    fn test_first_true_branch_of_else_if_chain_wins() {
        let out = html(
            "div {
                style { width: 75px; }
                if { condition: width > 100px; color: red; }
                else if { condition: width > 50px; color: blue; }
                else { color: green; }
            }",
        );
        assert_eq!(out, "<div style=\"color: blue; width: 75px; \"></div>");
    }

    #[test]
    fn test_colliding_key_keeps_its_slot() {
        let out = html(
            "div {
                style { color: red; width: 10px; }
                if { condition: true; width: 20px; display: block; }
            }",
        );
        assert_eq!(out, "<div style=\"display: block; color: red; width: 20px; \"></div>");
    }

    #[test]
    fn test_later_chains_follow_earlier_chains() {
        let out = html(
            "div {
                style { c: 3; }
                if { condition: true; a: 1; }
                if { condition: 1 == 1; b: 2; }
            }",
        );
        assert_eq!(out, "<div style=\"a: 1; b: 2; c: 3; \"></div>");
    }

    #[test]
    fn test_condition_can_read_earlier_conditional_result() {
        let out = html(
            "div {
                style { width: 60px; }
                if { condition: width > 50px; height: width * 2; }
                if { condition: height == 120px; color: red; }
            }",
        );
        assert_eq!(out, "<div style=\"height: 120px; color: red; width: 60px; \"></div>");
    }

    #[test]
    fn test_static_branch_children_render_inline() {
        let out = html(
            r#"ul {
                li { text: "first"; }
                if { condition: 2 > 1; li { text: "yes"; } }
                else { li { text: "no"; } }
                li { text: "last"; }
            }"#,
        );
        assert_eq!(out, "<ul><li>first</li><li>yes</li><li>last</li></ul>");
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // CROSS-ELEMENT REFERENCES
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_reference_to_earlier_element() {
        let out = html(
            "div { id: box1; style { width: 200px; } }
             div { id: box2; if { condition: #box1.width > 150px; height: 300px; } }",
        );
        assert_eq!(
            out,
            "<div id=\"box1\" style=\"width: 200px; \"></div><div id=\"box2\" style=\"height: 300px; \"></div>"
        );
    }

    #[test]
    fn test_reference_to_later_element_sees_its_conditionals() {
        let out = html(
            "p { if { condition: .wide.width > 100px; color: green; } }
             section { class: wide; style { width: 50px; } if { condition: true; width: 150px; } }",
        );
        assert!(out.starts_with("<p style=\"color: green; \"></p>"), "{}", out);
    }

    #[test]
    fn test_unresolved_reference() {
        let err = eval_failure("div { if { condition: #missing.width > 1px; color: red; } }");
        assert!(matches!(err, EvalError::UnresolvedReference { ref reference, .. } if reference == "#missing.width"));
    }

    #[test]
    fn test_circular_reference() {
        let err = eval_failure(
            "div { id: a; if { condition: #b.width > 1px; width: 1px; } }
             div { id: b; if { condition: #a.width > 1px; width: 1px; } }",
        );
        assert!(matches!(err, EvalError::CircularReference { .. }));
    }

    #[test]
    fn test_unit_mismatch_is_an_error() {
        let err = eval_failure("div { style { width: 100px; } if { condition: width > 50%; display: block; } }");
        assert!(matches!(err, EvalError::UnitMismatch { .. }));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // DYNAMIC CHAINS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_dynamic_chain_becomes_bindings() {
        let result = compile_ok(
            "div {
                id: panel;
                style { color: black; }
                if { condition: {{window.innerWidth}} > 600; display: block; }
                else { display: none; }
            }",
        );
        assert_eq!(result.html, "<div id=\"panel\" style=\"color: black; \"></div>");

        let bindings = result.bridge.dynamic_conditional_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].target_element_id, "panel");
        assert_eq!(bindings[0].target_property, "display");
        assert_eq!(bindings[0].value, "block");
        assert_eq!(
            bindings[0].expression_text.as_deref(),
            Some("{{window.innerWidth}} > 600")
        );
        assert_eq!((bindings[1].chain, bindings[1].branch), (0, 1));
        assert_eq!(bindings[1].expression_text, None);

        assert!(result.js.contains("function update_chtl_dynamic_0() {"));
        assert!(result.js.contains("if (window.innerWidth > 600) {"));
        assert!(result.js.contains("el.style.setProperty('display', 'none');"));
    }

    #[test]
    fn test_dynamic_condition_inlines_static_operands() {
        let result = compile_ok(
            "div { style { width: 300px; } if { condition: {{window.innerWidth}} > width; color: red; } }",
        );
        assert_eq!(
            result.bridge.dynamic_conditional_bindings()[0]
                .expression_text
                .as_deref(),
            Some("{{window.innerWidth}} > 300")
        );
        assert!(result.html.contains("id=\"chtl-el-0\""));
    }

    #[test]
    fn test_dynamic_branch_children_are_wrapped() {
        let result = compile_ok(
            r#"div {
                if { condition: {{count}} > 1; span { text: "many"; } }
                else { span { text: "few"; } }
            }"#,
        );
        assert_eq!(
            result.html,
            "<div id=\"chtl-el-0\">\
             <div id=\"chtl-render-0\" style=\"display: none;\"><span>many</span></div>\
             <div id=\"chtl-render-1\" style=\"display: none;\"><span>few</span></div>\
             </div>"
        );
        let renderings = result.bridge.dynamic_rendering_bindings();
        assert_eq!(renderings[0].expression_text, "{{count}} > 1");
        assert_eq!(renderings[1].expression_text, "!({{count}} > 1)");
        assert!(result
            .js
            .contains("__chtl.registerDynamicRendering('chtl-render-1', () => (!(count > 1)));"));
        assert!(result.bridge.dynamic_conditional_bindings().is_empty());
    }

    #[test]
    fn test_dynamic_chain_keeps_declaration_free_branches() {
        let result = compile_ok(
            r#"div {
                if { condition: {{a}}; span { text: "a"; } }
                else if { condition: {{b}}; color: red; }
            }"#,
        );
        let bindings = result.bridge.dynamic_conditional_bindings();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].target_property, "");
        assert_eq!(bindings[0].branch, 0);
        assert!(result.js.contains("  if (a) {\n  } else if (b) {\n    el.style.setProperty('color', 'red');"));
    }
}
