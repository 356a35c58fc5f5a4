//! Stack outputs: named values published after a successful provision.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared output, with a `${node.attribute}` template as its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    pub value: String,
    pub description: Option<String>,
    /// Name under which the value is exported for other stacks.
    pub export_name: Option<String>,
}

/// A rendered output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: String,
    pub description: Option<String>,
    pub export_name: Option<String>,
}

/// Flat mapping of output name to rendered value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackOutputs {
    values: BTreeMap<String, OutputValue>,
}

impl StackOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: OutputValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Values published under an export name, keyed by that name.
    pub fn exports(&self) -> BTreeMap<&str, &str> {
        self.values
            .values()
            .filter_map(|v| {
                v.export_name
                    .as_deref()
                    .map(|export| (export, v.value.as_str()))
            })
            .collect()
    }

    /// Plain name → value map for external consumers.
    pub fn to_flat_map(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports_only_include_named_exports() {
        let mut outputs = StackOutputs::new();
        outputs.insert(
            "DynamoDBTableName",
            OutputValue {
                value: "OptimusTable".to_string(),
                description: None,
                export_name: Some("OptimusTableName".to_string()),
            },
        );
        outputs.insert(
            "InstancePublicIP",
            OutputValue {
                value: "10.0.0.12".to_string(),
                description: Some("Public IP address of the instance".to_string()),
                export_name: None,
            },
        );

        let exports = outputs.exports();
        assert_eq!(exports.len(), 1);
        assert_eq!(exports.get("OptimusTableName"), Some(&"OptimusTable"));
        assert_eq!(outputs.get("InstancePublicIP"), Some("10.0.0.12"));
        assert_eq!(outputs.to_flat_map().len(), 2);
    }
}
