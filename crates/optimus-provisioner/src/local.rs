//! Local provider implementation.
//!
//! Materializes nodes in memory with deterministic ids and addresses. Used
//! for dry runs, demos and tests; it never talks to a cloud API.

use async_trait::async_trait;
use optimus_core::provider::{MaterializedResource, Provider, ValidationWarning};
use optimus_core::{Error, ResourceKind, ResourceNode, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory provider.
pub struct LocalProvider {
    region: String,
    account: String,
    fail_nodes: HashSet<String>,
    sequence: AtomicUsize,
    live: RwLock<HashMap<String, MaterializedResource>>,
}

impl LocalProvider {
    pub fn new(region: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            account: account.into(),
            fail_nodes: HashSet::new(),
            sequence: AtomicUsize::new(0),
            live: RwLock::new(HashMap::new()),
        }
    }

    /// Refuse to materialize the node with this id.
    pub fn fail_on(mut self, node_id: impl Into<String>) -> Self {
        self.fail_nodes.insert(node_id.into());
        self
    }

    /// Number of resources created over the provider's lifetime.
    pub fn created_count(&self) -> usize {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Number of resources currently alive.
    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    fn arn(&self, service: &str, resource: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.account, resource
        )
    }

    fn describe(&self, node: &ResourceNode, seq: usize) -> MaterializedResource {
        let id = &node.id;
        let named = |key: &str| node.attribute_str(key).unwrap_or(id.as_str()).to_string();

        let (physical_id, attrs): (String, Vec<(&str, String)>) = match node.kind {
            ResourceKind::Network => (
                format!("vpc-{:017x}", seq),
                vec![("cidr", format!("10.{}.0.0/16", seq % 256))],
            ),
            ResourceKind::SecurityGroup => (format!("sg-{:017x}", seq), vec![]),
            ResourceKind::Storage => {
                let name = named("bucket-name");
                (
                    name.clone(),
                    vec![
                        ("name", name.clone()),
                        ("arn", format!("arn:aws:s3:::{}", name)),
                        (
                            "website_url",
                            format!("http://{}.s3-website-{}.amazonaws.com", name, self.region),
                        ),
                    ],
                )
            }
            ResourceKind::Table => {
                let name = named("table-name");
                (
                    name.clone(),
                    vec![
                        ("name", name.clone()),
                        ("arn", self.arn("dynamodb", &format!("table/{}", name))),
                    ],
                )
            }
            ResourceKind::Role => {
                let name = named("role-name");
                (
                    name.clone(),
                    vec![("arn", format!("arn:aws:iam::{}:role/{}", self.account, name))],
                )
            }
            ResourceKind::Compute => (
                format!("i-{:017x}", seq),
                vec![
                    ("public_ip", format!("203.0.113.{}", seq % 250 + 1)),
                    ("private_ip", format!("10.0.0.{}", seq % 250 + 1)),
                ],
            ),
            ResourceKind::Function => {
                let name = named("function-name");
                (
                    name.clone(),
                    vec![("arn", self.arn("lambda", &format!("function:{}", name)))],
                )
            }
            ResourceKind::Api => {
                let api_id = format!("{:010x}", seq);
                (
                    api_id.clone(),
                    vec![(
                        "url",
                        format!(
                            "https://{}.execute-api.{}.amazonaws.com/prod/",
                            api_id, self.region
                        ),
                    )],
                )
            }
            ResourceKind::UserPool => {
                let pool_id = format!("{}_{:09}", self.region, seq);
                (
                    pool_id.clone(),
                    vec![("arn", self.arn("cognito-idp", &format!("userpool/{}", pool_id)))],
                )
            }
            ResourceKind::Distribution => {
                let dist_id = format!("E{:013X}", seq);
                (
                    dist_id.clone(),
                    vec![("domain_name", format!("d{:012x}.cloudfront.net", seq))],
                )
            }
            ResourceKind::Application => {
                let name = named("application-name");
                (name.clone(), vec![("name", name.clone())])
            }
            ResourceKind::DeploymentGroup => {
                let name = named("group-name");
                (
                    name.clone(),
                    vec![
                        ("name", name.clone()),
                        ("arn", self.arn("codedeploy", &format!("deploymentgroup:{}", name))),
                    ],
                )
            }
            ResourceKind::BuildProject => {
                let name = named("project-name");
                (
                    name.clone(),
                    vec![("arn", self.arn("codebuild", &format!("project/{}", name)))],
                )
            }
            ResourceKind::Pipeline => {
                let name = named("pipeline-name");
                (name.clone(), vec![("arn", self.arn("codepipeline", &name))])
            }
            ResourceKind::WaitCondition => (format!("wait-{:017x}", seq), vec![]),
        };

        let mut resource = MaterializedResource::new(id.clone(), node.kind, physical_id);
        // Scalar inputs stay readable as attributes of the created resource.
        if let Some(map) = node.attributes.as_object() {
            for (key, value) in map {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                resource = resource.with_attribute(key.clone(), text);
            }
        }
        for (key, value) in attrs {
            resource = resource.with_attribute(key, value);
        }
        resource
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn validate(&self, node: &ResourceNode) -> Result<Vec<ValidationWarning>> {
        let warn = |field: &str, message: &str| ValidationWarning {
            node_id: node.id.clone(),
            field: field.to_string(),
            message: message.to_string(),
        };
        let mut warnings = Vec::new();
        match node.kind {
            ResourceKind::Compute => {
                if node.attribute_str("instance-type").is_none() {
                    warnings.push(warn("instance-type", "no instance type, defaulting to t2.micro"));
                }
                if node.attribute_str("key-name").is_none() {
                    warnings.push(warn("key-name", "instance will not accept SSH logins"));
                }
            }
            ResourceKind::Function => {
                if node.attribute_str("handler").is_none() {
                    warnings.push(warn("handler", "no handler configured"));
                }
            }
            ResourceKind::Pipeline if node.depends_on.is_empty() => {
                warnings.push(warn("depends-on", "pipeline does not depend on any resource"));
            }
            _ => {}
        }
        Ok(warnings)
    }

    async fn materialize(&self, node: &ResourceNode) -> Result<MaterializedResource> {
        if self.fail_nodes.contains(&node.id) {
            return Err(Error::MaterializationFailed {
                node: node.id.clone(),
                message: "rejected by local provider".to_string(),
            });
        }

        let mut live = self.live.write().await;
        if let Some(existing) = live.get(&node.id) {
            debug!(node = %node.id, "Resource already exists");
            return Ok(existing.clone());
        }

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let resource = self.describe(node, seq);
        debug!(node = %node.id, physical_id = %resource.physical_id, "Resource created");
        live.insert(node.id.clone(), resource.clone());
        Ok(resource)
    }

    async fn destroy(&self, resource: &MaterializedResource) -> Result<()> {
        match self.live.write().await.remove(&resource.node_id) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("resource {}", resource.node_id))),
        }
    }
}
