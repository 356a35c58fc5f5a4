//! Provider trait and materialization results.
//!
//! Providers turn resource nodes into real infrastructure. The orchestrator
//! hands them one node at a time, already interpolated, in dependency order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{ResourceKind, ResourceNode};
use crate::{Error, Result};

/// A node that now exists as a real resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedResource {
    pub node_id: String,
    pub kind: ResourceKind,
    /// Provider-assigned identifier (ARN, instance id, ...).
    pub physical_id: String,
    /// Attributes other nodes and outputs may reference as `${node.attribute}`.
    pub attributes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl MaterializedResource {
    pub fn new(
        node_id: impl Into<String>,
        kind: ResourceKind,
        physical_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            physical_id: physical_id.into(),
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up an attribute; `id` always resolves to the physical id.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "id" | "physical_id" => Some(self.physical_id.as_str()),
            _ => self.attributes.get(key).map(String::as_str),
        }
    }
}

/// Warning from node validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub node_id: String,
    pub field: String,
    pub message: String,
}

/// Why a node did not get materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// The provider rejected the node.
    Materialization { message: String },
    /// A bootstrap signal the node waits on failed or timed out.
    UpstreamSignal { signal: String, outcome: String },
}

/// A node that failed during provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedNode {
    pub id: String,
    #[serde(flatten)]
    pub cause: FailureCause,
}

impl FailedNode {
    pub fn to_error(&self) -> Error {
        match &self.cause {
            FailureCause::Materialization { message } => Error::MaterializationFailed {
                node: self.id.clone(),
                message: message.clone(),
            },
            FailureCause::UpstreamSignal { signal, outcome } => Error::UpstreamSignal {
                signal: signal.clone(),
                outcome: outcome.clone(),
            },
        }
    }
}

/// Report of a provisioning run that stopped before every node existed.
///
/// Completed nodes are left in place; cleaning them up is the job of a stack teardown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialProvision {
    pub completed: Vec<String>,
    pub failed: Vec<FailedNode>,
    /// Nodes never attempted because provisioning halted first.
    pub not_attempted: Vec<String>,
}

impl std::fmt::Display for PartialProvision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "partial provision: {} completed, {} failed",
            self.completed.len(),
            self.failed.len()
        )?;
        for node in &self.failed {
            write!(f, "; {}", node.to_error())?;
        }
        Ok(())
    }
}

/// Trait for infrastructure providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Validate a node before materializing it.
    async fn validate(&self, node: &ResourceNode) -> Result<Vec<ValidationWarning>>;

    /// Create or update the real resource for a node.
    async fn materialize(&self, node: &ResourceNode) -> Result<MaterializedResource>;

    /// Delete a previously materialized resource.
    async fn destroy(&self, resource: &MaterializedResource) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_provision_lists_failures() {
        let partial = PartialProvision {
            completed: vec!["vpc".to_string(), "bucket".to_string()],
            failed: vec![
                FailedNode {
                    id: "bootstrap".to_string(),
                    cause: FailureCause::UpstreamSignal {
                        signal: "bootstrap".to_string(),
                        outcome: "timed_out".to_string(),
                    },
                },
                FailedNode {
                    id: "table".to_string(),
                    cause: FailureCause::Materialization {
                        message: "quota exceeded".to_string(),
                    },
                },
            ],
            not_attempted: vec![],
        };

        let text = Error::from(partial).to_string();
        assert!(text.starts_with("partial provision: 2 completed, 2 failed"));
        assert!(text.contains("upstream signal 'bootstrap' ended in timed_out"));
        assert!(text.contains("materialization of 'table' failed: quota exceeded"));
    }

    #[test]
    fn test_id_attribute_aliases_physical_id() {
        let resource = MaterializedResource::new("vpc", ResourceKind::Network, "vpc-0abc")
            .with_attribute("cidr", "10.0.0.0/16");
        assert_eq!(resource.attribute("id"), Some("vpc-0abc"));
        assert_eq!(resource.attribute("cidr"), Some("10.0.0.0/16"));
        assert_eq!(resource.attribute("missing"), None);
    }
}
