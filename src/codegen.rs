//! JavaScript emission (phase two).
//!
//! Everything here reads a sealed [`BridgeSnapshot`]; nothing can be recorded
//! once script generation starts.

use crate::bridge::{BridgeSnapshot, DynamicConditionalBinding};
use crate::script::{
    Animation, Direction, Easing, EnhancedSelector, EventBinding, Handler, ScriptAst, ScriptError, ScriptItem,
    SelectorTarget, StyleFrame,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;

lazy_static! {
    static ref DYNAMIC_OPERAND_RE: Regex = Regex::new(r"\{\{\s*(.*?)\s*\}\}").unwrap();
}

fn escape_js_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('\n', "\\n")
        .replace('\r', "")
}

/// Strip the `{{ }}` wrappers of runtime operands.
pub fn unwrap_dynamic_operands(expression: &str) -> String {
    DYNAMIC_OPERAND_RE.replace_all(expression, "$1").into_owned()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPT GENERATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Lower one parsed script to plain JavaScript. `placeholder` identifies the
/// script block so `{{&}}` can find its enclosing element.
pub fn generate_script(
    ast: &ScriptAst,
    snapshot: &BridgeSnapshot,
    placeholder: Option<&str>,
) -> Result<String, ScriptError> {
    let generator = ScriptGenerator {
        snapshot,
        context: placeholder.and_then(|p| snapshot.script_context(p)),
    };
    let mut out = String::new();
    generator.items(&ast.items, &mut out)?;
    Ok(out)
}

struct ScriptGenerator<'s> {
    snapshot: &'s BridgeSnapshot,
    context: Option<&'s str>,
}

impl<'s> ScriptGenerator<'s> {
    fn items(&self, items: &[ScriptItem], out: &mut String) -> Result<(), ScriptError> {
        for item in items {
            match item {
                ScriptItem::Raw { text } => out.push_str(text),
                ScriptItem::Selector { selector } => out.push_str(&self.lookup(selector)?),
                ScriptItem::Arrow => out.push('.'),
                ScriptItem::VarDecl { keyword, name } => {
                    // Responsive variables live on `window` behind an accessor.
                    if !self.snapshot.is_responsive_variable(name) {
                        out.push_str(keyword);
                        out.push(' ');
                    }
                    out.push_str(name);
                }
                ScriptItem::Listen { target, handlers } => self.listen(target, handlers, out)?,
                ScriptItem::Delegate {
                    parent,
                    targets,
                    handlers,
                } => self.delegate(parent, targets, handlers, out)?,
                ScriptItem::EventBind { bindings } => self.event_bind(bindings, out)?,
                ScriptItem::Animate { animation } => self.animate(animation, out)?,
            }
        }
        Ok(())
    }

    fn handler(&self, handler: &Handler) -> Result<String, ScriptError> {
        let mut body = String::new();
        self.items(&handler.body, &mut body)?;
        Ok(body)
    }

    fn context(&self, selector: &EnhancedSelector) -> Result<&'s str, ScriptError> {
        self.context
            .ok_or(ScriptError::MissingContext { span: selector.span })
    }

    /// CSS selector text for a target. Auto targets match any of id, class or tag.
    fn css_selector(&self, selector: &EnhancedSelector, target: &SelectorTarget) -> Result<String, ScriptError> {
        Ok(match target {
            SelectorTarget::Ampersand => format!("#{}", self.context(selector)?),
            SelectorTarget::Id { name } => format!("#{}", name),
            SelectorTarget::Class { name } => format!(".{}", name),
            SelectorTarget::Tag { name } => name.clone(),
            SelectorTarget::Auto { name } => format!("#{0}, .{0}, {0}", name),
            SelectorTarget::Query { selector } => selector.clone(),
            SelectorTarget::Indexed { base, .. } => self.css_selector(selector, base)?,
        })
    }

    fn lookup(&self, selector: &EnhancedSelector) -> Result<String, ScriptError> {
        Ok(match &selector.target {
            SelectorTarget::Ampersand => {
                format!("document.getElementById('{}')", escape_js_string(self.context(selector)?))
            }
            SelectorTarget::Id { name } => format!("document.getElementById('{}')", escape_js_string(name)),
            SelectorTarget::Auto { name } => {
                let name = escape_js_string(name);
                format!(
                    "(document.getElementById('{0}') || document.querySelector('.{0}') || document.querySelector('{0}'))",
                    name
                )
            }
            SelectorTarget::Indexed { base, index } => format!(
                "document.querySelectorAll('{}')[{}]",
                escape_js_string(&self.css_selector(selector, base)?),
                index
            ),
            target => format!(
                "document.querySelector('{}')",
                escape_js_string(&self.css_selector(selector, target)?)
            ),
        })
    }

    fn listen(&self, target: &EnhancedSelector, handlers: &[Handler], out: &mut String) -> Result<(), ScriptError> {
        out.push_str("{\n");
        out.push_str(&format!("  const __chtl_target = {};\n", self.lookup(target)?));
        for handler in handlers {
            out.push_str(&format!(
                "  __chtl_target.addEventListener('{}', {});\n",
                escape_js_string(&handler.event),
                self.handler(handler)?
            ));
        }
        out.push('}');
        Ok(())
    }

    fn delegate(
        &self,
        parent: &EnhancedSelector,
        targets: &[EnhancedSelector],
        handlers: &[Handler],
        out: &mut String,
    ) -> Result<(), ScriptError> {
        let selectors = targets
            .iter()
            .map(|target| self.css_selector(target, &target.target))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let selectors = escape_js_string(&selectors);

        out.push_str("{\n");
        out.push_str(&format!("  const __chtl_parent = {};\n", self.lookup(parent)?));
        for handler in handlers {
            out.push_str(&format!(
                "  __chtl_parent.addEventListener('{}', function (event) {{\n",
                escape_js_string(&handler.event)
            ));
            out.push_str(&format!("    const match = event.target.closest('{}');\n", selectors));
            out.push_str(&format!(
                "    if (match && __chtl_parent.contains(match)) ({}).call(match, event);\n",
                self.handler(handler)?
            ));
            out.push_str("  });\n");
        }
        out.push('}');
        Ok(())
    }

    /// One `addEventListener` call per event, without a trailing `;` so the
    /// statement's own terminator closes the last one.
    fn event_bind(&self, bindings: &[EventBinding], out: &mut String) -> Result<(), ScriptError> {
        let mut calls = Vec::new();
        for binding in bindings {
            let target = self.lookup(&binding.target)?;
            for handler in &binding.handlers {
                calls.push(format!(
                    "{}.addEventListener('{}', {})",
                    target,
                    escape_js_string(&handler.event),
                    self.handler(handler)?
                ));
            }
        }
        out.push_str(&calls.join(";\n"));
        Ok(())
    }

    /// An expression evaluating to `{ cancel }`. Frames run on
    /// `requestAnimationFrame`.
    fn animate(&self, animation: &Animation, out: &mut String) -> Result<(), ScriptError> {
        let targets = animation
            .targets
            .iter()
            .map(|target| self.lookup(target))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let progress = match animation.direction {
            Direction::Normal => "elapsed",
            Direction::Reverse => "1 - elapsed",
            Direction::Alternate => "cycle % 2 === 1 ? 1 - elapsed : elapsed",
        };

        out.push_str("(() => {\n");
        out.push_str(&format!("  const targets = [{}].filter(Boolean);\n", targets));
        out.push_str(
            "  const apply = (frame) => targets.forEach((el) => {\n    \
             for (const [name, value] of Object.entries(frame)) el.style.setProperty(name, String(value));\n  });\n",
        );
        out.push_str(&format!("  const ease = {};\n", easing_function(animation.easing)));
        out.push_str(&format!(
            "  const duration = {};\n  const loops = {};\n",
            animation.duration, animation.loops
        ));
        out.push_str("  let start = null;\n  let cycle = 0;\n  let frame = 0;\n");
        out.push_str("  const step = (now) => {\n    if (start === null) {\n      start = now;\n");
        if !animation.begin.is_empty() {
            out.push_str(&format!("      apply({});\n", style_object(&animation.begin)));
        }
        out.push_str("    }\n    const elapsed = Math.min((now - start) / duration, 1);\n");
        out.push_str(&format!("    const progress = ease({});\n", progress));
        for keyframe in &animation.when {
            out.push_str(&format!(
                "    if (progress >= {}) apply({});\n",
                keyframe.at,
                style_object(&keyframe.properties)
            ));
        }
        out.push_str("    if (elapsed < 1) {\n      frame = requestAnimationFrame(step);\n      return;\n    }\n");
        if !animation.end.is_empty() {
            out.push_str(&format!("    apply({});\n", style_object(&animation.end)));
        }
        out.push_str(
            "    cycle += 1;\n    if (loops === -1 || cycle < loops) {\n      start = now;\n      \
             frame = requestAnimationFrame(step);\n    }",
        );
        if let Some(callback) = &animation.callback {
            let mut body = String::new();
            self.items(callback, &mut body)?;
            out.push_str(&format!(" else {{\n      ({})();\n    }}", body));
        }
        out.push_str("\n  };\n");
        if animation.delay > 0 {
            out.push_str(&format!(
                "  setTimeout(() => {{ frame = requestAnimationFrame(step); }}, {});\n",
                animation.delay
            ));
        } else {
            out.push_str("  frame = requestAnimationFrame(step);\n");
        }
        out.push_str("  return { cancel: () => cancelAnimationFrame(frame) };\n})()");
        Ok(())
    }
}

fn easing_function(easing: Easing) -> &'static str {
    match easing {
        Easing::Linear => "(t) => t",
        Easing::Ease => "(t) => t * t * (3 - 2 * t)",
        Easing::EaseIn => "(t) => t * t",
        Easing::EaseOut => "(t) => t * (2 - t)",
        Easing::EaseInOut => "(t) => (t < 0.5 ? 2 * t * t : 1 - Math.pow(-2 * t + 2, 2) / 2)",
    }
}

/// Numbers and quoted strings are already JavaScript; anything else is CSS
/// text and gets quoted.
fn style_value(value: &str) -> String {
    if value.parse::<f64>().is_ok() || value.starts_with(['\'', '"', '`']) {
        value.to_string()
    } else {
        format!("'{}'", escape_js_string(value))
    }
}

fn style_object(frame: &StyleFrame) -> String {
    if frame.is_empty() {
        return "{}".to_string();
    }
    let fields = frame
        .iter()
        .map(|(name, value)| format!("'{}': {}", escape_js_string(name), style_value(value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{ {} }}", fields)
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME GLUE
// ═══════════════════════════════════════════════════════════════════════════════

const RUNTIME_CORE: &str = r#"const __chtl = {
  bindings: {},
  renderings: [],
  registerBinding(name, elementId, property, unit) {
    (this.bindings[name] = this.bindings[name] || []).push({ elementId, property, unit });
  },
  updateDOM(name, value) {
    for (const binding of this.bindings[name] || []) {
      const el = document.getElementById(binding.elementId);
      if (!el) continue;
      const text = String(value) + binding.unit;
      if (binding.property.startsWith('style.')) {
        el.style.setProperty(binding.property.slice(6), text);
      } else {
        el.setAttribute(binding.property, text);
      }
    }
  },
  registerDynamicRendering(wrapperId, condition) {
    this.renderings.push({ wrapperId, condition });
  },
  evaluateDynamicRendering() {
    for (const rendering of this.renderings) {
      const el = document.getElementById(rendering.wrapperId);
      if (el) el.style.display = rendering.condition() ? '' : 'none';
    }
  },
};
"#;

/// Runtime glue for the facts in `snapshot`. Empty when there is nothing to
/// bind.
pub fn generate_runtime(snapshot: &BridgeSnapshot) -> String {
    if !snapshot.needs_runtime() {
        return String::new();
    }
    let mut out = String::from(RUNTIME_CORE);

    for (variable, bindings) in snapshot.responsive_bindings() {
        let name = escape_js_string(variable);
        for binding in bindings {
            out.push_str(&format!(
                "__chtl.registerBinding('{}', '{}', '{}', '{}');\n",
                name,
                escape_js_string(&binding.element_id),
                escape_js_string(&binding.property),
                escape_js_string(&binding.unit)
            ));
        }
        out.push_str(&format!(
            "(function () {{\n  let value;\n  Object.defineProperty(window, '{0}', {{\n    configurable: true,\n    \
             get() {{ return value; }},\n    set(next) {{ value = next; __chtl.updateDOM('{0}', next); }},\n  }});\n}})();\n",
            name
        ));
        if snapshot.script_variable(variable).is_some() {
            out.push_str(&format!(
                "document.addEventListener('DOMContentLoaded', () => __chtl.updateDOM('{0}', window['{0}']));\n",
                name
            ));
        }
    }

    let mut chains: BTreeMap<u32, BTreeMap<u32, Vec<&DynamicConditionalBinding>>> = BTreeMap::new();
    for binding in snapshot.dynamic_conditional_bindings() {
        chains
            .entry(binding.chain)
            .or_default()
            .entry(binding.branch)
            .or_default()
            .push(binding);
    }
    for (chain, branches) in &chains {
        write_dynamic_chain(&mut out, *chain, branches);
    }

    let renderings = snapshot.dynamic_rendering_bindings();
    for rendering in renderings {
        out.push_str(&format!(
            "__chtl.registerDynamicRendering('{}', () => ({}));\n",
            escape_js_string(&rendering.wrapper_element_id),
            unwrap_dynamic_operands(&rendering.expression_text)
        ));
    }
    if !renderings.is_empty() {
        out.push_str("document.addEventListener('DOMContentLoaded', () => __chtl.evaluateDynamicRendering());\n");
        out.push_str("window.addEventListener('resize', () => __chtl.evaluateDynamicRendering());\n");
    }
    out
}

fn write_dynamic_chain(out: &mut String, chain: u32, branches: &BTreeMap<u32, Vec<&DynamicConditionalBinding>>) {
    let function = format!("update_chtl_dynamic_{}", chain);
    let Some(target) = branches.values().flatten().next().map(|b| b.target_element_id.as_str()) else {
        return;
    };

    out.push_str(&format!("function {}() {{\n", function));
    out.push_str(&format!("  const el = document.getElementById('{}');\n", escape_js_string(target)));
    out.push_str("  if (!el) return;\n");
    for (position, bindings) in branches.values().enumerate() {
        let condition = bindings.first().and_then(|b| b.expression_text.as_deref());
        match (position, condition) {
            (0, Some(condition)) => {
                out.push_str(&format!("  if ({}) {{\n", unwrap_dynamic_operands(condition)));
            }
            (_, Some(condition)) => {
                out.push_str(&format!("  }} else if ({}) {{\n", unwrap_dynamic_operands(condition)));
            }
            (0, None) => out.push_str("  {\n"),
            (_, None) => out.push_str("  } else {\n"),
        }
        for binding in bindings.iter().filter(|b| !b.target_property.is_empty()) {
            out.push_str(&format!(
                "    el.style.setProperty('{}', '{}');\n",
                escape_js_string(&binding.target_property),
                escape_js_string(&binding.value)
            ));
        }
    }
    out.push_str("  }\n}\n");
    out.push_str(&format!("document.addEventListener('DOMContentLoaded', {});\n", function));
    out.push_str(&format!("window.addEventListener('resize', {});\n", function));
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::script::parse_script;
    use pretty_assertions::assert_eq;

    fn compile(text: &str, bridge: Bridge, placeholder: Option<&str>) -> Result<String, ScriptError> {
        let mut bridge = bridge;
        let ast = parse_script(text, 0, &mut bridge)?;
        generate_script(&ast, &bridge.snapshot(), placeholder)
    }

    #[test]
    fn test_escape_js_string() {
        assert_eq!(escape_js_string("it's\n"), "it\\'s\\n");
    }

    #[test]
    fn test_unwrap_dynamic_operands() {
        assert_eq!(
            unwrap_dynamic_operands("({{ window.innerWidth }} > 600) && !({{x}})"),
            "(window.innerWidth > 600) && !(x)"
        );
    }

    #[test]
    fn test_selectors_lower_to_dom_lookups() {
        let js = compile("{{#box}}->textContent = 'a'; {{.card}}; {{button[1]}}; {{.list li}};", Bridge::new(), None)
            .unwrap();
        assert_eq!(
            js,
            "document.getElementById('box').textContent = 'a'; document.querySelector('.card'); \
             document.querySelectorAll('button')[1]; document.querySelector('.list li');"
        );
    }

    #[test]
    fn test_ampersand_uses_script_context() {
        let mut bridge = Bridge::new();
        bridge.record_script_context("__CHTL_SCRIPT_00000000_0__", "host");
        let js = compile("{{&}}->focus();", bridge, Some("__CHTL_SCRIPT_00000000_0__")).unwrap();
        assert_eq!(js, "document.getElementById('host').focus();");
    }

    #[test]
    fn test_ampersand_without_context_fails() {
        let err = compile("{{&}}->focus();", Bridge::new(), Some("__CHTL_SCRIPT_00000000_9__")).unwrap_err();
        assert!(matches!(err, ScriptError::MissingContext { .. }));
    }

    #[test]
    fn test_listen_lowering() {
        let js = compile("{{#go}}->Listen { click: () => run() };", Bridge::new(), None).unwrap();
        assert_eq!(
            js,
            "{\n  const __chtl_target = document.getElementById('go');\n  \
             __chtl_target.addEventListener('click', () => run());\n};"
        );
    }

    #[test]
    fn test_delegate_lowering() {
        let js = compile("{{#list}}->Delegate { target: {{.item}}, click: onItem }", Bridge::new(), None).unwrap();
        assert!(js.contains("const __chtl_parent = document.getElementById('list');"));
        assert!(js.contains("__chtl_parent.addEventListener('click', function (event) {"));
        assert!(js.contains("event.target.closest('.item')"));
        assert!(js.contains("(onItem).call(match, event);"));
    }

    #[test]
    fn test_event_bind_lowering() {
        let js = compile("{{#box}} &-> click, mouseenter: toggle;", Bridge::new(), None).unwrap();
        assert_eq!(
            js,
            "document.getElementById('box').addEventListener('click', toggle);\n\
             document.getElementById('box').addEventListener('mouseenter', toggle);"
        );
    }

    #[test]
    fn test_event_bind_across_targets() {
        let js = compile(
            "{{.tab}} &-> click: open,\n{{#form}} &-> submit: (e) => send(e);",
            Bridge::new(),
            None,
        )
        .unwrap();
        assert_eq!(
            js,
            "document.querySelector('.tab').addEventListener('click', open);\n\
             document.getElementById('form').addEventListener('submit', (e) => send(e));"
        );
    }

    #[test]
    fn test_event_bind_block_lowering() {
        let js = compile("{{#box}} &-> { click: a, keyup: b }", Bridge::new(), None).unwrap();
        assert_eq!(
            js,
            "document.getElementById('box').addEventListener('click', a);\n\
             document.getElementById('box').addEventListener('keyup', b)"
        );
    }

    #[test]
    fn test_animate_lowering() {
        let source = "const fade = Animate {\n  target: {{#box}},\n  duration: 500,\n  easing: ease-in,\n  \
                      begin: { opacity: 0 },\n  when: [{ at: 0.5, opacity: 0.5, transform: 'scale(1.2)' }],\n  \
                      end: { opacity: 1, backgroundColor: red },\n  callback: () => done()\n};";
        let js = compile(source, Bridge::new(), None).unwrap();
        assert!(js.starts_with("const fade = (() => {\n  const targets = [document.getElementById('box')].filter(Boolean);\n"));
        assert!(js.contains("  const ease = (t) => t * t;\n  const duration = 500;\n  const loops = 1;\n"));
        assert!(js.contains("      apply({ 'opacity': 0 });\n"));
        assert!(js.contains("    if (progress >= 0.5) apply({ 'opacity': 0.5, 'transform': 'scale(1.2)' });\n"));
        assert!(js.contains("    apply({ 'opacity': 1, 'background-color': 'red' });\n"));
        assert!(js.contains(" else {\n      (() => done())();\n    }"));
        assert!(js.contains("  frame = requestAnimationFrame(step);\n"));
        assert!(js.ends_with("  return { cancel: () => cancelAnimationFrame(frame) };\n})();"));
    }

    #[test]
    fn test_animate_delay_and_direction() {
        let js = compile(
            "Animate { target: [{{.a}}, {{.b}}], delay: 200ms, loop: -1, direction: alternate }",
            Bridge::new(),
            None,
        )
        .unwrap();
        assert!(js.contains("[document.querySelector('.a'), document.querySelector('.b')]"));
        assert!(js.contains("const loops = -1;"));
        assert!(js.contains("const progress = ease(cycle % 2 === 1 ? 1 - elapsed : elapsed);"));
        assert!(js.contains("setTimeout(() => { frame = requestAnimationFrame(step); }, 200);"));
        assert!(!js.contains(" else {"));
    }

    #[test]
    fn test_responsive_declaration_drops_keyword() {
        let mut bridge = Bridge::new();
        bridge.record_responsive_binding("boxWidth", "chtl-el-0", "style.width", "px");
        let js = compile("let boxWidth = 100; let other = 1;", bridge, None).unwrap();
        assert_eq!(js, "boxWidth = 100; let other = 1;");
    }

    #[test]
    fn test_runtime_is_empty_without_bindings() {
        assert_eq!(generate_runtime(&Bridge::new().snapshot()), "");
    }

    #[test]
    fn test_runtime_responsive_accessor() {
        let mut bridge = Bridge::new();
        bridge.record_responsive_binding("boxWidth", "chtl-el-0", "style.width", "px");
        bridge.record_script_variable("boxWidth", "100");
        let js = generate_runtime(&bridge.snapshot());
        assert!(js.starts_with("const __chtl = {"));
        assert!(js.contains("__chtl.registerBinding('boxWidth', 'chtl-el-0', 'style.width', 'px');"));
        assert!(js.contains("Object.defineProperty(window, 'boxWidth', {"));
        assert!(js.contains("__chtl.updateDOM('boxWidth', window['boxWidth'])"));
    }

    #[test]
    fn test_runtime_dynamic_chain() {
        let mut bridge = Bridge::new();
        let chain = bridge.begin_dynamic_chain();
        let binding = |property: &str, expression: Option<&str>, value: &str, branch| DynamicConditionalBinding {
            target_element_id: "panel".into(),
            target_property: property.into(),
            expression_text: expression.map(str::to_string),
            value: value.into(),
            chain,
            branch,
        };
        bridge.record_dynamic_conditional_binding(binding("display", Some("{{window.innerWidth}} > 600"), "block", 0));
        bridge.record_dynamic_conditional_binding(binding("display", None, "none", 1));
        bridge.record_dynamic_rendering_binding("chtl-render-0", "{{window.innerWidth}} > 600");

        let js = generate_runtime(&bridge.snapshot());
        assert!(js.contains(
            "function update_chtl_dynamic_0() {\n  const el = document.getElementById('panel');\n  \
             if (!el) return;\n  if (window.innerWidth > 600) {\n    el.style.setProperty('display', 'block');\n  \
             } else {\n    el.style.setProperty('display', 'none');\n  }\n}\n"
        ));
        assert!(js.contains("window.addEventListener('resize', update_chtl_dynamic_0);"));
        assert!(js.contains("__chtl.registerDynamicRendering('chtl-render-0', () => (window.innerWidth > 600));"));
    }
}
