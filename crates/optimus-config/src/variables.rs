//! Variable interpolation for stack documents.
//!
//! Supports variables like:
//! - `${stack.name}` - Stack name
//! - `${stack.region}` - Deployment region
//! - `${stack.account}` - Account id
//! - `${tags.Environment}` - Value of a stack tag
//! - `${instance.public_ip}` - Attribute of a materialized resource
//! - `${bootstrap.callback_url}` - Attribute published by a signal channel
//! - `${name}` - Custom variable

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Stack-related variables
    pub stack: StackContext,
    /// Stack tags
    pub tags: BTreeMap<String, String>,
    /// Attributes of resources, keyed by node id
    pub resources: HashMap<String, HashMap<String, String>>,
    /// Custom variables defined by user
    pub custom: HashMap<String, String>,
}

/// Stack context for variable interpolation.
#[derive(Debug, Clone, Default)]
pub struct StackContext {
    pub name: String,
    pub region: String,
    pub account: String,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_-]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}").unwrap()
});

/// Namespaces that never refer to a resource node.
pub const RESERVED_NAMESPACES: [&str; 2] = ["stack", "tags"];

impl VariableContext {
    /// Create a new empty variable context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Publish attributes of a resource node, merging with anything already published.
    pub fn set_resource_attributes<I, K, V>(&mut self, node_id: &str, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entry = self.resources.entry(node_id.to_string()).or_default();
        for (k, v) in attributes {
            entry.insert(k.into(), v.into());
        }
    }

    /// Forget everything published for a node.
    pub fn remove_resource(&mut self, node_id: &str) {
        self.resources.remove(node_id);
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["stack", "name"] => Some(self.stack.name.clone()),
            ["stack", "region"] => Some(self.stack.region.clone()),
            ["stack", "account"] => Some(self.stack.account.clone()),

            ["tags", key] => self.tags.get(*key).cloned(),

            [node, attribute] => self
                .resources
                .get(*node)
                .and_then(|attrs| attrs.get(*attribute))
                .cloned(),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    /// Variables are specified as `${var_name}` or `${namespace.var_name}`.
    /// Unknown variables are left untouched.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate every string inside a JSON value.
    pub fn interpolate_json(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::String(s) => serde_json::Value::String(self.interpolate(s)),
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.interpolate_json(v)).collect())
            }
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.interpolate_json(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Variables referenced in `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }

    /// Unresolved variables anywhere inside a JSON value.
    pub fn unresolved_json(&self, value: &serde_json::Value) -> Vec<String> {
        let mut out = Vec::new();
        visit_strings(value, &mut |s| out.extend(self.unresolved(s)));
        out
    }
}

/// Node ids referenced as `${node.attribute}` in a string.
pub fn resource_references(input: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(input)
        .filter_map(|caps| {
            let (namespace, _) = caps[1].split_once('.')?;
            if RESERVED_NAMESPACES.contains(&namespace) {
                None
            } else {
                Some(namespace.to_string())
            }
        })
        .collect()
}

/// Node ids referenced anywhere inside a JSON value.
pub fn resource_references_json(value: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    visit_strings(value, &mut |s| out.extend(resource_references(s)));
    out
}

fn visit_strings(value: &serde_json::Value, f: &mut dyn FnMut(&str)) {
    match value {
        serde_json::Value::String(s) => f(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| visit_strings(v, f)),
        serde_json::Value::Object(map) => map.values().for_each(|v| visit_strings(v, f)),
        _ => {}
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_stack(
        mut self,
        name: impl Into<String>,
        region: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        self.ctx.stack = StackContext {
            name: name.into(),
            region: region.into(),
            account: account.into(),
        };
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: &BTreeMap<String, String>) -> Self {
        self.ctx
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_resource_attribute(
        mut self,
        node_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.ctx
            .set_resource_attributes(node_id, [(key.into(), value.into())]);
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
