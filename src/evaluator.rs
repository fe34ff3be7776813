//! Compile-time expression evaluation and conditional style resolution.

use crate::ast::{ConditionalBlock, Document, Element, NodeId, Selector, StyleDeclaration, StyleValue};
use crate::diagnostics::Span;
use crate::expr::{BinaryOp, Expr, ExprKind, UnaryOp};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// VALUES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Value {
    Number { value: f64, unit: String },
    Str { value: String },
    Bool { value: bool },
}

lazy_static! {
    static ref CSS_NUMBER_RE: Regex = Regex::new(r"^(-?(?:\d+(?:\.\d+)?|\.\d+))([A-Za-z]*|%)$").unwrap();
}

pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

impl Value {
    pub fn number(value: f64, unit: impl Into<String>) -> Self {
        Value::Number {
            value,
            unit: unit.into(),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Value::Str { value: value.into() }
    }

    /// Interpret declared CSS text: `100px` is a number, `true` a boolean,
    /// anything else a string.
    pub fn from_css(text: &str) -> Self {
        let text = text.trim();
        if let Some(caps) = CSS_NUMBER_RE.captures(text) {
            if let Ok(value) = caps[1].parse::<f64>() {
                return Value::number(value, &caps[2]);
            }
        }
        match text {
            "true" => Value::Bool { value: true },
            "false" => Value::Bool { value: false },
            _ => {
                let unquoted = text
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
                    .unwrap_or(text);
                Value::string(unquoted)
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number { .. } => "number",
            Value::Str { .. } => "string",
            Value::Bool { .. } => "boolean",
        }
    }

    /// Text written into a style attribute.
    pub fn to_css(&self) -> String {
        match self {
            Value::Number { value, unit } => format!("{}{}", format_number(*value), unit),
            Value::Str { value } => value.clone(),
            Value::Bool { value } => value.to_string(),
        }
    }

    /// JS literal for runtime conditions. Units are dropped.
    pub fn to_js(&self) -> String {
        match self {
            Value::Number { value, .. } => format_number(*value),
            Value::Str { value } => serde_json::Value::String(value.clone()).to_string(),
            Value::Bool { value } => value.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_css())
    }
}

fn unit_label(unit: &str) -> String {
    if unit.is_empty() {
        "(none)".to_string()
    } else {
        unit.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("unit mismatch: cannot combine '{}' with '{}'", unit_label(.left), unit_label(.right))]
    UnitMismatch { left: String, right: String, span: Span },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
        span: Span,
    },
    #[error("unresolved property reference '{reference}'")]
    UnresolvedReference { reference: String, span: Span },
    #[error("circular property reference through '{reference}'")]
    CircularReference { reference: String, span: Span },
}

impl EvalError {
    pub fn span(&self) -> Span {
        match self {
            EvalError::UnitMismatch { span, .. }
            | EvalError::TypeMismatch { span, .. }
            | EvalError::UnresolvedReference { span, .. }
            | EvalError::CircularReference { span, .. } => *span,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STYLE MAP
// ═══════════════════════════════════════════════════════════════════════════════

/// Ordered property → CSS text map of one element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StyleMap {
    entries: Vec<(String, String)>,
}

impl StyleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Overwrite in place, or append.
    pub fn set(&mut self, key: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    fn insert_at(&mut self, index: usize, key: &str, value: String) {
        let index = index.min(self.entries.len());
        self.entries.insert(index, (key.to_string(), value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `key: value; ` for every entry, in order.
    pub fn to_style_attribute(&self) -> String {
        self.iter().map(|(k, v)| format!("{}: {}; ", k, v)).collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StyleMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = StyleMap::new();
        for (k, v) in iter {
            map.set(&k.into(), v.into());
        }
        map
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVALUATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Looks up a property of another element.
pub trait ReferenceResolver {
    fn resolve_reference(&mut self, selector: &Selector, property: &str, span: Span) -> Result<Value, EvalError>;
}

pub struct Evaluator<'a, R: ReferenceResolver + ?Sized> {
    local: &'a StyleMap,
    resolver: &'a mut R,
}

impl<'a, R: ReferenceResolver + ?Sized> Evaluator<'a, R> {
    pub fn new(local: &'a StyleMap, resolver: &'a mut R) -> Self {
        Evaluator { local, resolver }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match &expr.kind {
            ExprKind::Number { value, unit } => Ok(Value::number(*value, unit.clone())),
            ExprKind::Str { value } => Ok(Value::string(value.clone())),
            ExprKind::Bool { value } => Ok(Value::Bool { value: *value }),
            ExprKind::Ident { name } => Ok(match self.local.get(name) {
                Some(text) => Value::from_css(text),
                None => Value::string(name.clone()),
            }),
            ExprKind::PropertyRef { selector, property } => {
                self.resolver.resolve_reference(selector, property, expr.span)
            }
            ExprKind::Dynamic { .. } => Err(EvalError::TypeMismatch {
                expected: "compile-time value",
                found: "runtime operand",
                span: expr.span,
            }),
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match (op, value) {
                    (UnaryOp::Not, Value::Bool { value }) => Ok(Value::Bool { value: !value }),
                    (UnaryOp::Neg, Value::Number { value, unit }) => Ok(Value::number(-value, unit)),
                    (UnaryOp::Not, other) => Err(mismatch("boolean", &other, operand.span)),
                    (UnaryOp::Neg, other) => Err(mismatch("number", &other, operand.span)),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, expr.span),
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                if self.eval_bool(cond)? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    pub fn eval_bool(&mut self, expr: &Expr) -> Result<bool, EvalError> {
        match self.eval(expr)? {
            Value::Bool { value } => Ok(value),
            other => Err(mismatch("boolean", &other, expr.span)),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, span: Span) -> Result<Value, EvalError> {
        match op {
            BinaryOp::And => {
                let value = self.eval_bool(lhs)? && self.eval_bool(rhs)?;
                return Ok(Value::Bool { value });
            }
            BinaryOp::Or => {
                let value = self.eval_bool(lhs)? || self.eval_bool(rhs)?;
                return Ok(Value::Bool { value });
            }
            _ => {}
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        if op.is_comparison() {
            compare(op, left, right, span)
        } else {
            arithmetic(op, left, right, rhs.span, span)
        }
    }
}

fn mismatch(expected: &'static str, found: &Value, span: Span) -> EvalError {
    EvalError::TypeMismatch {
        expected,
        found: found.type_name(),
        span,
    }
}

fn compare(op: BinaryOp, left: Value, right: Value, span: Span) -> Result<Value, EvalError> {
    let value = match (&left, &right) {
        (Value::Number { value: a, unit: ua }, Value::Number { value: b, unit: ub }) => {
            if ua != ub {
                return Err(EvalError::UnitMismatch {
                    left: ua.clone(),
                    right: ub.clone(),
                    span,
                });
            }
            match op {
                BinaryOp::Gt => a > b,
                BinaryOp::Lt => a < b,
                BinaryOp::Ge => a >= b,
                BinaryOp::Le => a <= b,
                BinaryOp::Eq => a == b,
                _ => a != b,
            }
        }
        (Value::Str { value: a }, Value::Str { value: b }) if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => {
            (a == b) == (op == BinaryOp::Eq)
        }
        (Value::Bool { value: a }, Value::Bool { value: b }) if matches!(op, BinaryOp::Eq | BinaryOp::Ne) => {
            (a == b) == (op == BinaryOp::Eq)
        }
        (Value::Number { .. }, other) | (other, Value::Number { .. }) => {
            return Err(mismatch("number", other, span))
        }
        _ => return Err(mismatch("number", &left, span)),
    };
    Ok(Value::Bool { value })
}

fn arithmetic(op: BinaryOp, left: Value, right: Value, rhs_span: Span, span: Span) -> Result<Value, EvalError> {
    let (a, ua) = match left {
        Value::Number { value, unit } => (value, unit),
        other => return Err(mismatch("number", &other, span)),
    };
    let (b, ub) = match right {
        Value::Number { value, unit } => (value, unit),
        other => return Err(mismatch("number", &other, span)),
    };
    let unit_mismatch = || EvalError::UnitMismatch {
        left: ua.clone(),
        right: ub.clone(),
        span,
    };

    match op {
        BinaryOp::Add | BinaryOp::Sub => {
            let unit = match (ua.is_empty(), ub.is_empty()) {
                (_, true) => ua.clone(),
                (true, false) => ub.clone(),
                (false, false) if ua == ub => ua.clone(),
                _ => return Err(unit_mismatch()),
            };
            let value = if op == BinaryOp::Add { a + b } else { a - b };
            Ok(Value::number(value, unit))
        }
        BinaryOp::Mul => {
            let unit = match (ua.is_empty(), ub.is_empty()) {
                (_, true) => ua.clone(),
                (true, false) => ub.clone(),
                _ => return Err(unit_mismatch()),
            };
            Ok(Value::number(a * b, unit))
        }
        _ => {
            if b == 0.0 {
                return Err(EvalError::TypeMismatch {
                    expected: "non-zero divisor",
                    found: "zero",
                    span: rhs_span,
                });
            }
            let unit = if ub.is_empty() {
                ua.clone()
            } else if ua == ub {
                String::new()
            } else {
                return Err(unit_mismatch());
            };
            Ok(Value::number(a / b, unit))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STYLE RESOLUTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Static style of one element after its compile-time conditionals fired.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedStyle {
    pub style: StyleMap,
    /// Per chain, the index of the branch that fired. `None` when no branch
    /// fired or the chain is dynamic.
    pub fired: Vec<Option<usize>>,
}

/// Resolves element styles against a document, memoizing each element.
pub struct StyleResolver<'d> {
    document: &'d Document,
    resolved: HashMap<NodeId, ResolvedStyle>,
    in_progress: Vec<NodeId>,
}

impl<'d> StyleResolver<'d> {
    pub fn new(document: &'d Document) -> Self {
        StyleResolver {
            document,
            resolved: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    pub fn document(&self) -> &'d Document {
        self.document
    }

    pub fn evaluate(&mut self, expr: &Expr, local: &StyleMap) -> Result<Value, EvalError> {
        Evaluator::new(local, self).eval(expr)
    }

    pub fn resolve(&mut self, element: &'d Element) -> Result<ResolvedStyle, EvalError> {
        self.resolve_guarded(element, element.span)
    }

    fn resolve_guarded(&mut self, element: &'d Element, reference_span: Span) -> Result<ResolvedStyle, EvalError> {
        if let Some(done) = self.resolved.get(&element.node_id) {
            return Ok(done.clone());
        }
        if self.in_progress.contains(&element.node_id) {
            return Err(EvalError::CircularReference {
                reference: describe(element),
                span: reference_span,
            });
        }

        self.in_progress.push(element.node_id);
        let result = self.compute(element);
        self.in_progress.pop();

        let resolved = result?;
        tracing::trace!(node = element.node_id, tag = %element.tag, "resolved element style");
        self.resolved.insert(element.node_id, resolved.clone());
        Ok(resolved)
    }

    fn compute(&mut self, element: &'d Element) -> Result<ResolvedStyle, EvalError> {
        let mut style = StyleMap::new();
        for declaration in &element.style {
            if let Some(value) = self.declaration_value(declaration, &style)? {
                style.set(&declaration.key, value);
            }
        }

        let mut front = 0;
        let mut fired = Vec::with_capacity(element.conditionals.len());
        for chain in &element.conditionals {
            if chain.is_dynamic() {
                fired.push(None);
                continue;
            }
            fired.push(self.apply_chain(chain, &mut style, &mut front)?);
        }
        Ok(ResolvedStyle { style, fired })
    }

    /// CSS text of a declaration evaluated against `local`. Responsive values
    /// have no compile-time text.
    pub fn declaration_value(
        &mut self,
        declaration: &StyleDeclaration,
        local: &StyleMap,
    ) -> Result<Option<String>, EvalError> {
        Ok(match &declaration.value {
            StyleValue::Literal { text } => Some(text.clone()),
            StyleValue::Expr { expr } => Some(self.evaluate(expr, local)?.to_css()),
            StyleValue::Responsive { .. } => None,
        })
    }

    /// Merge the first true branch of `chain` into `style`. New keys go in
    /// front of the static properties, after keys placed by earlier chains;
    /// existing keys keep their slot.
    fn apply_chain(
        &mut self,
        chain: &ConditionalBlock,
        style: &mut StyleMap,
        front: &mut usize,
    ) -> Result<Option<usize>, EvalError> {
        for (index, branch) in chain.branches().enumerate() {
            let fires = match &branch.condition {
                Some(condition) => Evaluator::new(style, self).eval_bool(&condition.expr)?,
                None => true,
            };
            if !fires {
                continue;
            }
            for declaration in &branch.body {
                let Some(value) = self.declaration_value(declaration, style)? else {
                    continue;
                };
                if style.contains(&declaration.key) {
                    style.set(&declaration.key, value);
                } else {
                    style.insert_at(*front, &declaration.key, value);
                    *front += 1;
                }
            }
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Render a condition as a JS expression. Runtime operands keep their
    /// `{{ }}` wrapper; compile-time references are inlined as literals.
    pub fn lower_to_js(&mut self, expr: &Expr, local: &StyleMap) -> Result<String, EvalError> {
        Ok(match &expr.kind {
            ExprKind::Dynamic { code } => format!("{{{{{}}}}}", code),
            ExprKind::Number { value, .. } => format_number(*value),
            ExprKind::Str { value } => Value::string(value.clone()).to_js(),
            ExprKind::Bool { value } => value.to_string(),
            ExprKind::Ident { .. } | ExprKind::PropertyRef { .. } => self.evaluate(expr, local)?.to_js(),
            ExprKind::Unary { op, operand } => {
                let inner = self.lower_operand(operand, local)?;
                match op {
                    UnaryOp::Not => format!("!{}", inner),
                    UnaryOp::Neg => format!("-{}", inner),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => format!(
                "{} {} {}",
                self.lower_operand(lhs, local)?,
                op.as_js(),
                self.lower_operand(rhs, local)?
            ),
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => format!(
                "{} ? {} : {}",
                self.lower_operand(cond, local)?,
                self.lower_operand(then, local)?,
                self.lower_operand(otherwise, local)?
            ),
        })
    }

    fn lower_operand(&mut self, expr: &Expr, local: &StyleMap) -> Result<String, EvalError> {
        let js = self.lower_to_js(expr, local)?;
        Ok(match expr.kind {
            ExprKind::Binary { .. } | ExprKind::Ternary { .. } => format!("({})", js),
            _ => js,
        })
    }
}

fn describe(element: &Element) -> String {
    match element.id() {
        Some(id) => format!("#{}", id),
        None => element.tag.clone(),
    }
}

impl<'d> ReferenceResolver for StyleResolver<'d> {
    fn resolve_reference(&mut self, selector: &Selector, property: &str, span: Span) -> Result<Value, EvalError> {
        let reference = format!("{}.{}", selector, property);
        let element = crate::ast::find_in_document(self.document, selector)
            .ok_or_else(|| EvalError::UnresolvedReference {
                reference: reference.clone(),
                span,
            })?;
        let resolved = self.resolve_guarded(element, span)?;
        resolved
            .style
            .get(property)
            .map(Value::from_css)
            .ok_or(EvalError::UnresolvedReference { reference, span })
    }
}

/// Evaluate `expr` against an element's local style, resolving references
/// through `document`.
pub fn evaluate(expr: &Expr, local_style: &StyleMap, document: &Document) -> Result<Value, EvalError> {
    StyleResolver::new(document).evaluate(expr, local_style)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expression;

    fn eval(text: &str, local: &[(&str, &str)]) -> Result<Value, EvalError> {
        let expr = parse_expression(text, 0).unwrap();
        let local: StyleMap = local.iter().copied().collect();
        evaluate(&expr, &local, &Document::default())
    }

    #[test]
    fn test_from_css() {
        assert_eq!(Value::from_css("100px"), Value::number(100.0, "px"));
        assert_eq!(Value::from_css("-1.5em"), Value::number(-1.5, "em"));
        assert_eq!(Value::from_css("50%"), Value::number(50.0, "%"));
        assert_eq!(Value::from_css("true"), Value::Bool { value: true });
        assert_eq!(Value::from_css("block"), Value::string("block"));
        assert_eq!(Value::from_css("1px solid red"), Value::string("1px solid red"));
    }

    #[test]
    fn test_number_rendering() {
        assert_eq!(Value::number(100.0, "px").to_css(), "100px");
        assert_eq!(Value::number(1.5, "em").to_css(), "1.5em");
        assert_eq!(Value::string("red").to_css(), "red");
    }

    #[test]
    fn test_comparisons_with_units() {
        assert_eq!(eval("width > 50px", &[("width", "100px")]).unwrap(), Value::Bool { value: true });
        assert_eq!(eval("3 <= 2", &[]).unwrap(), Value::Bool { value: false });
        let err = eval("width > 50%", &[("width", "100px")]).unwrap_err();
        assert!(matches!(err, EvalError::UnitMismatch { ref left, ref right, .. } if left == "px" && right == "%"));
    }

    #[test]
    fn test_string_and_bool_equality() {
        assert_eq!(eval("display == block", &[("display", "block")]).unwrap(), Value::Bool { value: true });
        assert_eq!(eval("'a' != 'b'", &[]).unwrap(), Value::Bool { value: true });
        assert_eq!(eval("true == false", &[]).unwrap(), Value::Bool { value: false });
        assert!(matches!(eval("'a' > 'b'", &[]), Err(EvalError::TypeMismatch { .. })));
        assert!(matches!(eval("10px == red", &[]), Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_logic_requires_booleans_and_short_circuits() {
        assert!(matches!(eval("1 && true", &[]), Err(EvalError::TypeMismatch { .. })));
        // The right side would be a unit mismatch, but is never evaluated.
        assert_eq!(eval("false && 1px > 1%", &[]).unwrap(), Value::Bool { value: false });
        assert_eq!(eval("true || 1px > 1%", &[]).unwrap(), Value::Bool { value: true });
        assert_eq!(eval("!(1 > 2)", &[]).unwrap(), Value::Bool { value: true });
    }

    #[test]
    fn test_arithmetic_units() {
        assert_eq!(eval("width + 20px", &[("width", "100px")]).unwrap(), Value::number(120.0, "px"));
        assert_eq!(eval("width * 2", &[("width", "100px")]).unwrap(), Value::number(200.0, "px"));
        assert_eq!(eval("width / 4", &[("width", "100px")]).unwrap(), Value::number(25.0, "px"));
        assert_eq!(eval("100px / 50px", &[]).unwrap(), Value::number(2.0, ""));
        assert_eq!(eval("-width", &[("width", "5px")]).unwrap(), Value::number(-5.0, "px"));
        assert!(matches!(eval("1px + 1em", &[]), Err(EvalError::UnitMismatch { .. })));
        assert!(matches!(eval("1px * 1px", &[]), Err(EvalError::UnitMismatch { .. })));
        assert!(matches!(eval("1px / 0", &[]), Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(
            eval("width > 50px ? red : blue", &[("width", "60px")]).unwrap(),
            Value::string("red")
        );
        assert!(matches!(eval("1 ? a : b", &[]), Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_unknown_reference_is_unresolved() {
        let err = eval("#missing.width > 1px", &[]).unwrap_err();
        assert_eq!(
            err,
            EvalError::UnresolvedReference {
                reference: "#missing.width".into(),
                span: Span::new(0, 14),
            }
        );
    }

    #[test]
    fn test_dynamic_operand_is_not_static() {
        assert!(matches!(eval("{{x}} > 1", &[]), Err(EvalError::TypeMismatch { .. })));
    }

    #[test]
    fn test_lower_to_js() {
        let document = Document::default();
        let mut resolver = StyleResolver::new(&document);
        let local: StyleMap = [("width", "100px")].into_iter().collect();
        let expr = parse_expression("{{window.innerWidth}} > width && !(mode == 'dark')", 0).unwrap();
        assert_eq!(
            resolver.lower_to_js(&expr, &local).unwrap(),
            "({{window.innerWidth}} > 100) && !(\"mode\" === \"dark\")"
        );
    }

    #[test]
    fn test_style_map_order() {
        let mut map: StyleMap = [("width", "100px")].into_iter().collect();
        map.insert_at(0, "display", "block".into());
        map.set("width", "50px".into());
        assert_eq!(map.to_style_attribute(), "display: block; width: 50px; ");
    }
}
