//! Stack document parsing.
//!
//! A stack document declares the resource nodes, signal gates, pipelines and
//! outputs of one stack:
//!
//! ```kdl
//! stack "optimus" region="us-west-1" account="619326977873"
//!
//! tags {
//!     Environment "Development"
//! }
//!
//! resource "instance" kind="compute" depends-on="vpc" {
//!     user-data "curl -X PUT '${bootstrap.callback_url}'"
//! }
//!
//! signal "bootstrap" timeout=300 depends-on="instance"
//!
//! pipeline "api" node="api-pipeline" {
//!     source owner="mzienert" repo="optimus-api" branch="master"
//!     build project="api-build"
//!     deploy group="deployment-group"
//!     rollback failed-deployment=#true
//! }
//!
//! output "InstancePublicIP" value="${instance.public_ip}"
//! ```

use crate::helpers::{
    child, children_to_json, get_first_string_arg, get_flag_setting, get_integer_prop,
    get_string_list_prop, get_string_prop, get_string_setting,
};
use crate::variables::{resource_references, resource_references_json};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use optimus_core::outputs::OutputSpec;
use optimus_core::pipeline::{DeployTarget, PipelineDefinition, RollbackPolicy, SourceConfig};
use optimus_core::resource::DEFAULT_SIGNAL_TIMEOUT;
use optimus_core::{DependencyGraph, Error, ResourceKind, ResourceNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A parsed stack document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDefinition {
    pub name: String,
    pub region: String,
    pub account: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// Resource and signal nodes in declaration order.
    pub resources: Vec<ResourceNode>,
    pub pipelines: Vec<PipelineDefinition>,
    pub outputs: Vec<OutputSpec>,
}

impl StackDefinition {
    pub fn resource(&self, id: &str) -> Option<&ResourceNode> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Ids of the signal gate nodes.
    pub fn signals(&self) -> impl Iterator<Item = &ResourceNode> {
        self.resources.iter().filter(|r| r.kind.is_gate())
    }
}

/// Parse a stack document from KDL text.
///
/// Checks everything that can be checked without a provider: declared kinds,
/// pipeline references, interpolation references and the dependency graph.
pub fn parse_stack(kdl: &str) -> ConfigResult<StackDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut region = String::new();
    let mut account = None;
    let mut tags = BTreeMap::new();
    let mut resources = Vec::new();
    let mut pipelines = Vec::new();
    let mut outputs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "stack" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;
                region = get_string_setting(node, "region").unwrap_or_default();
                account = get_string_setting(node, "account");
            }
            "tags" => {
                if let Some(children) = node.children() {
                    for c in children.nodes() {
                        if let Some(val) = get_first_string_arg(c) {
                            tags.insert(c.name().value().to_string(), val);
                        }
                    }
                }
            }
            "resource" => {
                resources.push(parse_resource(node)?);
            }
            "signal" => {
                resources.push(parse_signal(node)?);
            }
            "pipeline" => {
                pipelines.push(parse_pipeline(node)?);
            }
            "output" => {
                outputs.push(parse_output(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("stack name".to_string()));
    }
    if region.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "region for stack '{}'",
            name
        )));
    }

    let stack = StackDefinition {
        name,
        region,
        account,
        tags,
        resources,
        pipelines,
        outputs,
    };
    validate_stack(&stack)?;
    Ok(stack)
}

/// Read and parse a stack document from disk.
pub fn load_stack(path: impl AsRef<std::path::Path>) -> ConfigResult<StackDefinition> {
    let text = std::fs::read_to_string(path)?;
    parse_stack(&text)
}

fn parse_resource(node: &KdlNode) -> ConfigResult<ResourceNode> {
    let id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource id".to_string()))?;

    let kind_str = get_string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("kind for resource '{}'", id)))?;
    let kind: ResourceKind = kind_str.parse().map_err(|message| ConfigError::InvalidValue {
        field: format!("kind for resource '{}'", id),
        message,
    })?;
    if kind.is_gate() {
        return Err(ConfigError::InvalidValue {
            field: format!("kind for resource '{}'", id),
            message: "declare wait conditions with a `signal` node".to_string(),
        });
    }

    let mut resource = ResourceNode::new(id, kind)
        .with_attributes(children_to_json(node, &["depends-on"]));
    for dep in get_string_list_prop(node, "depends-on") {
        resource.add_dependency(dep);
    }
    Ok(resource)
}

fn parse_signal(node: &KdlNode) -> ConfigResult<ResourceNode> {
    let id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("signal id".to_string()))?;

    let timeout = match get_integer_prop(node, "timeout") {
        Some(secs) if secs > 0 => u64::try_from(secs).map_err(|_| ConfigError::InvalidValue {
            field: format!("timeout for signal '{}'", id),
            message: format!("{} is out of range", secs),
        })?,
        Some(secs) => {
            return Err(ConfigError::InvalidValue {
                field: format!("timeout for signal '{}'", id),
                message: format!("must be positive, got {}", secs),
            });
        }
        None => DEFAULT_SIGNAL_TIMEOUT.as_secs(),
    };

    let mut resource = ResourceNode::new(id, ResourceKind::WaitCondition)
        .with_attribute("timeout", timeout);
    for dep in get_string_list_prop(node, "depends-on") {
        resource.add_dependency(dep);
    }
    Ok(resource)
}

fn parse_pipeline(node: &KdlNode) -> ConfigResult<PipelineDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
    let node_id = get_string_setting(node, "node")
        .ok_or_else(|| ConfigError::MissingField(format!("node for pipeline '{}'", name)))?;

    let source_node = child(node, "source")
        .ok_or_else(|| ConfigError::MissingField(format!("source for pipeline '{}'", name)))?;
    let source = parse_source(&name, source_node)?;

    let build_project = child(node, "build")
        .and_then(|b| get_string_setting(b, "project"))
        .ok_or_else(|| {
            ConfigError::MissingField(format!("build project for pipeline '{}'", name))
        })?;

    let deploy_node = child(node, "deploy")
        .ok_or_else(|| ConfigError::MissingField(format!("deploy for pipeline '{}'", name)))?;
    let rollback = RollbackPolicy {
        failed_deployment: child(node, "rollback")
            .and_then(|r| get_flag_setting(r, "failed-deployment"))
            .unwrap_or(false),
    };
    let deploy = parse_deploy(&name, deploy_node, rollback)?;

    Ok(PipelineDefinition {
        node_id,
        source,
        build_project,
        deploy,
        artifact_bucket: get_string_setting(node, "artifact-bucket"),
        restart_on_update: get_flag_setting(node, "restart-on-update").unwrap_or(false),
        name,
    })
}

fn parse_source(pipeline: &str, node: &KdlNode) -> ConfigResult<SourceConfig> {
    let provider = get_string_setting(node, "provider").unwrap_or_else(|| "github".to_string());
    if provider != "github" {
        return Err(ConfigError::InvalidValue {
            field: format!("source provider for pipeline '{}'", pipeline),
            message: format!("unsupported provider: {}", provider),
        });
    }
    let field = |key: &str| {
        get_string_setting(node, key).ok_or_else(|| {
            ConfigError::MissingField(format!("source {} for pipeline '{}'", key, pipeline))
        })
    };
    Ok(SourceConfig {
        owner: field("owner")?,
        repo: field("repo")?,
        branch: get_string_setting(node, "branch").unwrap_or_else(|| "main".to_string()),
        token_secret: get_string_setting(node, "token-secret"),
    })
}

fn parse_deploy(
    pipeline: &str,
    node: &KdlNode,
    rollback: RollbackPolicy,
) -> ConfigResult<DeployTarget> {
    match (
        get_string_setting(node, "group"),
        get_string_setting(node, "bucket"),
    ) {
        (Some(group), None) => Ok(DeployTarget::ServerGroup { group, rollback }),
        (None, Some(bucket)) => {
            if rollback.failed_deployment {
                return Err(ConfigError::InvalidValue {
                    field: format!("rollback for pipeline '{}'", pipeline),
                    message: "bucket deployments cannot be rolled back".to_string(),
                });
            }
            Ok(DeployTarget::Bucket {
                bucket,
                extract: get_flag_setting(node, "extract").unwrap_or(false),
            })
        }
        _ => Err(ConfigError::InvalidValue {
            field: format!("deploy for pipeline '{}'", pipeline),
            message: "exactly one of group or bucket is required".to_string(),
        }),
    }
}

fn parse_output(node: &KdlNode) -> ConfigResult<OutputSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("output name".to_string()))?;
    let value = get_string_setting(node, "value")
        .ok_or_else(|| ConfigError::MissingField(format!("value for output '{}'", name)))?;
    Ok(OutputSpec {
        value,
        description: get_string_setting(node, "description"),
        export_name: get_string_setting(node, "export"),
        name,
    })
}

fn validate_stack(stack: &StackDefinition) -> ConfigResult<()> {
    // Graph errors: duplicate ids, unknown dependencies, cycles
    let graph = DependencyGraph::new(stack.resources.clone()).map_err(graph_error)?;
    graph.order().map_err(graph_error)?;

    for resource in &stack.resources {
        for referenced in resource_references_json(&resource.attributes) {
            if graph.get(&referenced).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "resource '{}' interpolates unknown resource '{}'",
                    resource.id, referenced
                )));
            }
        }
    }

    let mut pipeline_names = HashSet::new();
    let mut pipeline_nodes = HashSet::new();
    for pipeline in &stack.pipelines {
        if !pipeline_names.insert(pipeline.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("pipeline '{}'", pipeline.name)));
        }
        if !pipeline_nodes.insert(pipeline.node_id.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "pipeline node '{}'",
                pipeline.node_id
            )));
        }
        expect_kind(&graph, &pipeline.name, &pipeline.node_id, ResourceKind::Pipeline)?;
        expect_kind(
            &graph,
            &pipeline.name,
            &pipeline.build_project,
            ResourceKind::BuildProject,
        )?;
        match &pipeline.deploy {
            DeployTarget::ServerGroup { group, .. } => {
                expect_kind(&graph, &pipeline.name, group, ResourceKind::DeploymentGroup)?
            }
            DeployTarget::Bucket { bucket, .. } => {
                expect_kind(&graph, &pipeline.name, bucket, ResourceKind::Storage)?
            }
        }
        if let Some(bucket) = &pipeline.artifact_bucket {
            expect_kind(&graph, &pipeline.name, bucket, ResourceKind::Storage)?;
        }
    }

    let mut output_names = HashSet::new();
    let mut export_names = HashSet::new();
    for output in &stack.outputs {
        if !output_names.insert(output.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("output '{}'", output.name)));
        }
        if let Some(export) = &output.export_name {
            if !export_names.insert(export.as_str()) {
                return Err(ConfigError::Duplicate(format!("export '{}'", export)));
            }
        }
        for referenced in resource_references(&output.value) {
            if graph.get(&referenced).is_none() {
                return Err(ConfigError::InvalidReference(format!(
                    "output '{}' references unknown resource '{}'",
                    output.name, referenced
                )));
            }
        }
    }

    Ok(())
}

fn expect_kind(
    graph: &DependencyGraph,
    pipeline: &str,
    id: &str,
    kind: ResourceKind,
) -> ConfigResult<()> {
    match graph.get(id) {
        Some(node) if node.kind == kind => Ok(()),
        Some(node) => Err(ConfigError::InvalidReference(format!(
            "pipeline '{}' expects '{}' to be a {}, found {}",
            pipeline, id, kind, node.kind
        ))),
        None => Err(ConfigError::InvalidReference(format!(
            "pipeline '{}' references unknown resource '{}'",
            pipeline, id
        ))),
    }
}

fn graph_error(err: Error) -> ConfigError {
    match err {
        Error::Cycle { path } => ConfigError::CycleDetected(path.join(" -> ")),
        Error::DuplicateNode(id) => ConfigError::Duplicate(format!("resource '{}'", id)),
        Error::UnknownDependency { node, missing } => ConfigError::InvalidReference(format!(
            "resource '{}' depends on unknown resource '{}'",
            node, missing
        )),
        other => ConfigError::Graph(other),
    }
}
