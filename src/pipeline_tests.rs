//! Pipeline Tests
//!
//! Whole-unit compilation: scanning, dispatch, the bridge hand-off between
//! markup and scripts, merging and parallel units.

#[cfg(test)]
mod tests {
    use crate::dispatcher::CompileOptions;
    use crate::extension::{ExtensionRegistry, MatchedArgs, SyntaxExtension};
    use crate::merger::{merge, FragmentOutputs, MergeOptions, Preludes};
    use crate::{compile, compile_many, compile_with_extensions, SourceUnit};
    use pretty_assertions::assert_eq;

    fn options() -> CompileOptions {
        CompileOptions::default()
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // CHANNELS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_separate_channels() {
        let source = r#"
style { body { margin: 0; } }
div {
    class: card;
    style { padding: 4px; &:hover { color: red; } }
    text { "Hi" }
}
script { console.log("ready"); }
"#;
        let result = compile(source, &options()).unwrap();
        assert_eq!(result.html, "<div class=\"card\" style=\"padding: 4px; \">Hi</div>");
        assert_eq!(result.css, ".card:hover {\n  color: red;\n}\nbody { margin: 0; }");
        assert_eq!(result.js, "console.log(\"ready\");");
    }

    #[test]
    fn test_inline_document() {
        let options = CompileOptions {
            inline_html: true,
            default_struct: true,
            ..CompileOptions::default()
        };
        let result = compile("p { text: \"x\"; } style { p { margin: 0; } } script { go(); }", &options).unwrap();
        assert_eq!(
            result.html,
            "<html><head><style>p { margin: 0; }</style></head><p>x</p><script>go();</script></html>"
        );
        assert_eq!(result.css, "");
        assert_eq!(result.js, "");
    }

    #[test]
    fn test_unbalanced_brace_in_script_string() {
        let result = compile("div { } script { const s = \"}\"; done(s); }", &options()).unwrap();
        assert_eq!(result.js, "const s = \"}\"; done(s);");
    }

    #[test]
    fn test_quotes_in_markup_comments_keep_blocks() {
        let result = compile("-- don't\ndiv { style { color: red; } }", &options()).unwrap();
        assert_eq!(result.html, "<!-- don't --><div style=\"color: red; \"></div>");

        let result = compile("// it's\np { script { go(); } }", &options()).unwrap();
        assert_eq!(result.html, "<p id=\"chtl-el-0\"></p>");
        assert_eq!(result.js, "go();");
    }

    #[test]
    fn test_apostrophe_in_unquoted_text() {
        let result = compile("div { text { It's fine } } p { style { color: red; } }", &options()).unwrap();
        assert_eq!(result.html, "<div>It's fine</div><p style=\"color: red; \"></p>");
    }

    #[test]
    fn test_merge_without_placeholders_is_unchanged() {
        let merged = merge(
            "<p>plain</p>",
            &FragmentOutputs::new(),
            &Preludes::default(),
            MergeOptions::default(),
        )
        .unwrap();
        assert_eq!(merged.html, "<p>plain</p>");
    }

    #[test]
    fn test_inline_merge_is_not_idempotent() {
        let inline = MergeOptions {
            inline_html: true,
            default_struct: false,
        };
        let once = merge("<p></p>", &FragmentOutputs::new(), &Preludes::default(), inline).unwrap();
        let twice = merge(&once.html, &FragmentOutputs::new(), &Preludes::default(), inline).unwrap();
        assert_eq!(once.html, "<html><p></p></html>");
        assert_eq!(twice.html, "<html><html><p></p></html></html>");
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // BRIDGE HAND-OFF
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_responsive_value_round_trip() {
        let result = compile(
            "div { style { width: $boxWidth$px; height: 10px; } }\nscript { let boxWidth = 100; }",
            &options(),
        )
        .unwrap();
        assert_eq!(result.html.trim_end(), "<div id=\"chtl-el-0\" style=\"height: 10px; \"></div>");

        let bindings = &result.bridge.responsive_bindings()["boxWidth"];
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].element_id, "chtl-el-0");
        assert_eq!(bindings[0].property, "style.width");
        assert_eq!(bindings[0].unit, "px");

        assert!(result.js.contains("Object.defineProperty(window, 'boxWidth', {"));
        assert!(result.js.ends_with("boxWidth = 100;"), "{}", result.js);
        assert!(!result.js.contains("let boxWidth"));
    }

    #[test]
    fn test_responsive_attribute() {
        let result = compile("input { value: $name$; }", &options()).unwrap();
        assert_eq!(result.html, "<input id=\"chtl-el-0\">");
        assert_eq!(result.bridge.responsive_bindings()["name"][0].property, "value");
    }

    #[test]
    fn test_ampersand_resolves_to_enclosing_element() {
        let result = compile(
            "div { class: card; script { {{&}}->classList.add('ready'); } }",
            &options(),
        )
        .unwrap();
        assert_eq!(result.html, "<div id=\"chtl-el-0\" class=\"card\"></div>");
        assert_eq!(
            result.js,
            "document.getElementById('chtl-el-0').classList.add('ready');"
        );
        assert!(!result.bridge.needs_runtime());
    }

    #[test]
    fn test_listen_in_local_script() {
        let result = compile(
            "button { id: go; script { {{&}}->Listen { click: () => {{#out}}->textContent = 'clicked' }; } }\np { id: out; }",
            &options(),
        )
        .unwrap();
        assert!(result.js.contains("const __chtl_target = document.getElementById('go');"));
        assert!(result.js.contains(
            "__chtl_target.addEventListener('click', () => document.getElementById('out').textContent = 'clicked');"
        ));
    }

    #[test]
    fn test_event_bind_and_animate() {
        let source = "button { id: toggle; script { {{&}} &-> click, keyup: () => {{#panel}}->classList.toggle('open'); } }\n\
                      div { id: panel; }\n\
                      script { const fade = Animate { target: {{#panel}}, duration: 400, end: { opacity: 1 } }; }";
        let result = compile(source, &options()).unwrap();
        assert!(result.js.contains(
            "document.getElementById('toggle').addEventListener('click', () => \
             document.getElementById('panel').classList.toggle('open'));\n\
             document.getElementById('toggle').addEventListener('keyup', () => \
             document.getElementById('panel').classList.toggle('open'));"
        ));
        assert!(result.js.contains("const fade = (() => {\n  const targets = [document.getElementById('panel')]"));
        assert!(result.js.contains("    apply({ 'opacity': 1 });\n"));
        assert!(result.js.contains("})();"));
    }

    #[test]
    fn test_runtime_disabled_leaves_script_only() {
        let options = CompileOptions {
            emit_runtime: false,
            ..CompileOptions::default()
        };
        let result = compile("div { style { width: $w$px; } } script { w = 3; }", &options).unwrap();
        assert_eq!(result.js, "w = 3;");
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // EXTENSIONS & PARALLEL UNITS
    // ═══════════════════════════════════════════════════════════════════════════════

    struct Print;

    impl SyntaxExtension for Print {
        fn keyword(&self) -> &str {
            "printMessage"
        }

        fn expand(&self, args: &MatchedArgs) -> Result<String, String> {
            match args.args.as_slice() {
                [message] => Ok(format!("console.log({})", message)),
                _ => Err("expected one message".to_string()),
            }
        }
    }

    #[test]
    fn test_extension_expands_before_parsing() {
        let mut extensions = ExtensionRegistry::new();
        extensions.register(Print);
        let result = compile_with_extensions(
            "div { id: a; script { printMessage({{&}}->id); } }",
            &options(),
            &extensions,
        )
        .unwrap();
        assert_eq!(result.js, "console.log(document.getElementById('a').id);");
    }

    #[test]
    fn test_parallel_units_have_independent_bridges() {
        let units = vec![
            SourceUnit {
                path: "a.chtl".into(),
                source: "div { style { width: $a$px; } }".into(),
            },
            SourceUnit {
                path: "b.chtl".into(),
                source: "div { style { height: $b$em; } }".into(),
            },
            SourceUnit {
                path: "c.chtl".into(),
                source: "div { script { x(); }".into(),
            },
        ];
        let results = compile_many(&units, &options(), &ExtensionRegistry::new());
        assert_eq!(results.len(), 3);

        let a = results[0].as_ref().unwrap();
        let b = results[1].as_ref().unwrap();
        assert!(a.bridge.is_responsive_variable("a"));
        assert!(!a.bridge.is_responsive_variable("b"));
        assert!(b.bridge.is_responsive_variable("b"));
        assert!(!b.bridge.is_responsive_variable("a"));
        assert_eq!(b.bridge.responsive_bindings()["b"][0].unit, "em");

        let err = results[2].as_ref().unwrap_err();
        assert_eq!(err.to_diagnostic("c.chtl", &units[2].source).file, "c.chtl");
    }

    #[test]
    fn test_same_source_compiles_identically() {
        let source = "div { style { width: $w$px; } if { condition: {{w}} > 1; color: red; } }";
        let first = compile(source, &options()).unwrap();
        let second = compile(source, &options()).unwrap();
        assert_eq!(first, second);
    }
}
