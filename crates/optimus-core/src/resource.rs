//! Resource nodes: the declarative units of a stack.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default bootstrap wait, matching the five minutes the instance script is given.
pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(300);

/// What kind of infrastructure a node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    SecurityGroup,
    Storage,
    Table,
    Role,
    Compute,
    Function,
    Api,
    UserPool,
    Distribution,
    Application,
    DeploymentGroup,
    BuildProject,
    Pipeline,
    /// Gate that resolves when a bootstrap signal channel reports.
    WaitCondition,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 15] = [
        ResourceKind::Network,
        ResourceKind::SecurityGroup,
        ResourceKind::Storage,
        ResourceKind::Table,
        ResourceKind::Role,
        ResourceKind::Compute,
        ResourceKind::Function,
        ResourceKind::Api,
        ResourceKind::UserPool,
        ResourceKind::Distribution,
        ResourceKind::Application,
        ResourceKind::DeploymentGroup,
        ResourceKind::BuildProject,
        ResourceKind::Pipeline,
        ResourceKind::WaitCondition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::Storage => "storage",
            ResourceKind::Table => "table",
            ResourceKind::Role => "role",
            ResourceKind::Compute => "compute",
            ResourceKind::Function => "function",
            ResourceKind::Api => "api",
            ResourceKind::UserPool => "user-pool",
            ResourceKind::Distribution => "distribution",
            ResourceKind::Application => "application",
            ResourceKind::DeploymentGroup => "deployment-group",
            ResourceKind::BuildProject => "build-project",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::WaitCondition => "wait-condition",
        }
    }

    /// Whether nodes of this kind block their dependents on an external signal.
    pub fn is_gate(&self) -> bool {
        matches!(self, ResourceKind::WaitCondition)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown resource kind: {}", s))
    }
}

/// One declared piece of infrastructure.
///
/// Attributes are opaque to the orchestrator; only the provider interprets them.
/// `depends_on` keeps declaration order and never holds the same id twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: serde_json::Value::Object(Default::default()),
            depends_on: Vec::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if !self.attributes.is_object() {
            self.attributes = serde_json::Value::Object(Default::default());
        }
        if let Some(map) = self.attributes.as_object_mut() {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.add_dependency(id);
        self
    }

    pub fn add_dependency(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Timeout of a wait-condition node, read from its `timeout` attribute in seconds.
    pub fn signal_timeout(&self) -> Option<Duration> {
        if !self.kind.is_gate() {
            return None;
        }
        let secs = self
            .attributes
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        Some(secs.unwrap_or(DEFAULT_SIGNAL_TIMEOUT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_parses_kebab_and_snake_case() {
        assert_eq!(
            "deployment-group".parse::<ResourceKind>().unwrap(),
            ResourceKind::DeploymentGroup
        );
        assert_eq!(
            "build_project".parse::<ResourceKind>().unwrap(),
            ResourceKind::BuildProject
        );
        assert!("bucket-of-bits".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_kind_display_matches_serde() {
        for kind in ResourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_dependencies_are_deduplicated_in_order() {
        let node = ResourceNode::new("instance", ResourceKind::Compute)
            .depends_on("vpc")
            .depends_on("role")
            .depends_on("vpc");
        assert_eq!(node.depends_on, vec!["vpc", "role"]);
    }

    #[test]
    fn test_signal_timeout() {
        let gate = ResourceNode::new("bootstrap", ResourceKind::WaitCondition)
            .with_attributes(json!({ "timeout": 42 }));
        assert_eq!(gate.signal_timeout(), Some(Duration::from_secs(42)));

        let default_gate = ResourceNode::new("bootstrap", ResourceKind::WaitCondition);
        assert_eq!(default_gate.signal_timeout(), Some(DEFAULT_SIGNAL_TIMEOUT));

        let vpc = ResourceNode::new("vpc", ResourceKind::Network);
        assert_eq!(vpc.signal_timeout(), None);
    }
}
