//! Cross-compiler fact table of one compilation unit.
//!
//! The markup generator and the script parser write facts during phase one.
//! [`Bridge::snapshot`] consumes the writer and hands out a read-only
//! [`BridgeSnapshot`], which is the only thing script generation accepts.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsiveBinding {
    pub element_id: String,
    /// Attribute name, or `style.<property>` for style declarations.
    pub property: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConditionalBinding {
    pub target_element_id: String,
    pub target_property: String,
    /// JS condition with `{{ }}` operands still wrapped. `None` for `else`.
    pub expression_text: Option<String>,
    pub value: String,
    /// Conditional chain the binding belongs to.
    pub chain: u32,
    /// Branch index inside the chain.
    pub branch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicRenderingBinding {
    pub wrapper_element_id: String,
    pub expression_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct BridgeTables {
    responsive_bindings: BTreeMap<String, Vec<ResponsiveBinding>>,
    dynamic_conditional_bindings: Vec<DynamicConditionalBinding>,
    dynamic_rendering_bindings: Vec<DynamicRenderingBinding>,
    script_contexts: BTreeMap<String, String>,
    script_variables: BTreeMap<String, String>,
}

/// Collecting side. One per compilation unit.
#[derive(Debug, Default)]
pub struct Bridge {
    tables: BridgeTables,
    chains: u32,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_responsive_binding(&mut self, variable: &str, element_id: &str, property: &str, unit: &str) {
        tracing::trace!(variable, element_id, property, "responsive binding");
        self.tables
            .responsive_bindings
            .entry(variable.to_string())
            .or_default()
            .push(ResponsiveBinding {
                element_id: element_id.to_string(),
                property: property.to_string(),
                unit: unit.to_string(),
            });
    }

    /// Reserve an id for a new dynamic conditional chain.
    pub fn begin_dynamic_chain(&mut self) -> u32 {
        let chain = self.chains;
        self.chains += 1;
        chain
    }

    pub fn record_dynamic_conditional_binding(&mut self, binding: DynamicConditionalBinding) {
        tracing::trace!(
            target_element_id = %binding.target_element_id,
            target_property = %binding.target_property,
            chain = binding.chain,
            "dynamic conditional binding"
        );
        self.tables.dynamic_conditional_bindings.push(binding);
    }

    pub fn record_dynamic_rendering_binding(&mut self, wrapper_element_id: &str, expression_text: &str) {
        self.tables
            .dynamic_rendering_bindings
            .push(DynamicRenderingBinding {
                wrapper_element_id: wrapper_element_id.to_string(),
                expression_text: expression_text.to_string(),
            });
    }

    pub fn record_script_context(&mut self, placeholder: &str, element_id: &str) {
        self.tables
            .script_contexts
            .insert(placeholder.to_string(), element_id.to_string());
    }

    pub fn record_script_variable(&mut self, name: &str, initializer: &str) {
        self.tables
            .script_variables
            .insert(name.to_string(), initializer.to_string());
    }

    /// Seal the bridge. Nothing can be recorded afterwards.
    pub fn snapshot(self) -> BridgeSnapshot {
        BridgeSnapshot { tables: self.tables }
    }
}

/// Read-only view handed to script generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BridgeSnapshot {
    tables: BridgeTables,
}

impl BridgeSnapshot {
    pub fn responsive_bindings(&self) -> &BTreeMap<String, Vec<ResponsiveBinding>> {
        &self.tables.responsive_bindings
    }

    pub fn is_responsive_variable(&self, name: &str) -> bool {
        self.tables.responsive_bindings.contains_key(name)
    }

    pub fn dynamic_conditional_bindings(&self) -> &[DynamicConditionalBinding] {
        &self.tables.dynamic_conditional_bindings
    }

    pub fn dynamic_rendering_bindings(&self) -> &[DynamicRenderingBinding] {
        &self.tables.dynamic_rendering_bindings
    }

    pub fn script_context(&self, placeholder: &str) -> Option<&str> {
        self.tables.script_contexts.get(placeholder).map(String::as_str)
    }

    pub fn script_variable(&self, name: &str) -> Option<&str> {
        self.tables.script_variables.get(name).map(String::as_str)
    }

    /// Whether runtime glue has anything to bind.
    pub fn needs_runtime(&self) -> bool {
        !self.tables.responsive_bindings.is_empty()
            || !self.tables.dynamic_conditional_bindings.is_empty()
            || !self.tables.dynamic_rendering_bindings.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
