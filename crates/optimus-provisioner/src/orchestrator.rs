//! Provisioning orchestrator - materializes resource nodes in dependency order.
//!
//! The walk is sequential. Signal gate nodes do not stop it: a node that
//! depends on an unresolved gate is deferred and unrelated nodes keep going.
//! Once nothing else can run, the orchestrator waits for whichever pending
//! gate resolves first and walks again.

use futures::future::{BoxFuture, select_all};
use optimus_config::{StackDefinition, VariableContext, VariableContextBuilder};
use optimus_core::outputs::{OutputSpec, OutputValue, StackOutputs};
use optimus_core::provider::{
    FailedNode, FailureCause, MaterializedResource, PartialProvision, Provider, ValidationWarning,
};
use optimus_core::{DependencyGraph, Error, ProvisionRunId, ResourceKind, ResourceNode, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{error, info, warn};

use crate::signal::{Resolution, SignalChannel, SignalRegistry};

/// Stack-wide settings passed to the orchestrator at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub stack_name: String,
    pub region: String,
    pub account: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl OrchestratorConfig {
    pub fn from_stack(stack: &StackDefinition) -> Self {
        Self {
            stack_name: stack.name.clone(),
            region: stack.region.clone(),
            account: stack.account.clone(),
            tags: stack.tags.clone(),
        }
    }

    fn variables(&self) -> VariableContext {
        VariableContextBuilder::new()
            .with_stack(
                self.stack_name.clone(),
                self.region.clone(),
                self.account.clone().unwrap_or_default(),
            )
            .with_tags(&self.tags)
            .build()
    }
}

/// Event emitted during provisioning.
#[derive(Debug, Clone)]
pub enum ProvisionEvent {
    NodeStarted { node: String, kind: ResourceKind },
    NodeMaterialized { resource: MaterializedResource },
    NodeFailed { node: String, cause: FailureCause },
    NodeDeferred { node: String, gate: String },
    GateWaiting { node: String, callback_url: String },
    GateResolved { node: String, resolution: Resolution },
    ProvisionCompleted { success: bool },
}

/// Result of a fully successful provisioning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub run_id: ProvisionRunId,
    /// Every node of the stack, in the order it was materialized.
    pub resources: Vec<MaterializedResource>,
    pub warnings: Vec<ValidationWarning>,
}

/// Result of a teardown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    pub cancelled_signals: usize,
    pub destroyed: Vec<String>,
    pub failed: Vec<FailedNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Waiting,
    Done,
    Failed,
}

/// Walks a resolved stack and materializes it through a provider.
///
/// One orchestrator serves one stack; it remembers what it materialized so
/// later runs skip existing nodes and teardown knows what to destroy.
pub struct ProvisioningOrchestrator {
    config: OrchestratorConfig,
    provider: Arc<dyn Provider>,
    signals: Arc<SignalRegistry>,
    inventory: RwLock<Vec<MaterializedResource>>,
    run_lock: Mutex<()>,
    cancelled: AtomicBool,
    events: Option<mpsc::Sender<ProvisionEvent>>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn Provider>,
        signals: Arc<SignalRegistry>,
    ) -> Self {
        Self {
            config,
            provider,
            signals,
            inventory: RwLock::new(Vec::new()),
            run_lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            events: None,
        }
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<ProvisionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn signals(&self) -> &Arc<SignalRegistry> {
        &self.signals
    }

    /// Whether a provisioning run is in flight.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Resources materialized so far, in creation order.
    pub async fn resources(&self) -> Vec<MaterializedResource> {
        self.inventory.read().await.clone()
    }

    /// Materialize `order`, a resolved node list.
    ///
    /// Nodes already materialized by an earlier run are kept and not touched
    /// again. A provider failure halts the walk; a failed or timed out signal
    /// fails its gate and everything downstream of it while unrelated nodes
    /// carry on. Either way the result is [`Error::PartialProvision`].
    pub async fn provision(&self, order: Vec<ResourceNode>) -> Result<ProvisionReport> {
        let _guard = self.run_lock.try_lock().map_err(|_| {
            Error::Conflict(format!(
                "stack '{}' is already provisioning",
                self.config.stack_name
            ))
        })?;

        let run_id = ProvisionRunId::new();
        let graph = DependencyGraph::new(order.clone())?;
        info!(run = %run_id, stack = %self.config.stack_name, nodes = order.len(), "Provisioning started");

        let mut vars = self.config.variables();
        let mut states: HashMap<String, NodeState> = order
            .iter()
            .map(|n| (n.id.clone(), NodeState::Pending))
            .collect();
        let mut completed: Vec<MaterializedResource> = Vec::new();

        // Keep whatever an earlier run already materialized.
        for existing in self.inventory.read().await.iter() {
            if let Some(node) = graph.get(&existing.node_id) {
                if node.kind == existing.kind {
                    states.insert(node.id.clone(), NodeState::Done);
                    vars.set_resource_attributes(&node.id, attribute_pairs(existing));
                    completed.push(existing.clone());
                }
            }
        }

        // Channels exist before anything is materialized so instances can embed the callback URL.
        let mut channels: HashMap<String, Arc<SignalChannel>> = HashMap::new();
        for gate in order.iter().filter(|n| n.kind.is_gate()) {
            if states.get(&gate.id) == Some(&NodeState::Done) {
                continue;
            }
            let timeout = gate
                .signal_timeout()
                .unwrap_or(optimus_core::resource::DEFAULT_SIGNAL_TIMEOUT);
            // Instances kept from an earlier run embed that run's callback URL.
            let channel = self.signals.rearm(&gate.id, timeout).await;
            let url = self.signals.callback_url(channel.id())?;
            vars.set_resource_attributes(
                &gate.id,
                [
                    ("callback_url".to_string(), url),
                    ("channel_id".to_string(), channel.id().to_string()),
                ],
            );
            channels.insert(gate.id.clone(), channel);
        }

        let mut failed: Vec<FailedNode> = Vec::new();
        let mut warnings: Vec<ValidationWarning> = Vec::new();
        let mut deferred: HashSet<String> = HashSet::new();
        let mut halted = false;

        loop {
            // Walk until a full pass makes no progress.
            let mut progressed = true;
            while progressed && !halted {
                progressed = false;
                for node in &order {
                    if states[&node.id] != NodeState::Pending {
                        continue;
                    }
                    if self.cancelled.load(Ordering::SeqCst) {
                        warn!(run = %run_id, "Provisioning cancelled by teardown");
                        halted = true;
                        break;
                    }
                    if let Some(blocker) = node
                        .depends_on
                        .iter()
                        .find(|dep| states[dep.as_str()] != NodeState::Done)
                    {
                        if states[blocker.as_str()] == NodeState::Waiting
                            && deferred.insert(node.id.clone())
                        {
                            self.emit(ProvisionEvent::NodeDeferred {
                                node: node.id.clone(),
                                gate: blocker.clone(),
                            })
                            .await;
                        }
                        continue;
                    }

                    if node.kind.is_gate() {
                        states.insert(node.id.clone(), NodeState::Waiting);
                        let callback_url = vars
                            .resolve(&format!("{}.callback_url", node.id))
                            .unwrap_or_default();
                        info!(node = %node.id, "Waiting for bootstrap signal");
                        self.emit(ProvisionEvent::GateWaiting {
                            node: node.id.clone(),
                            callback_url,
                        })
                        .await;
                        progressed = true;
                        continue;
                    }

                    match self.materialize_node(node, &vars, &mut warnings).await {
                        Ok(resource) => {
                            vars.set_resource_attributes(&node.id, attribute_pairs(&resource));
                            states.insert(node.id.clone(), NodeState::Done);
                            self.inventory.write().await.push(resource.clone());
                            self.emit(ProvisionEvent::NodeMaterialized {
                                resource: resource.clone(),
                            })
                            .await;
                            completed.push(resource);
                            progressed = true;
                        }
                        Err(e) => {
                            error!(node = %node.id, error = %e, "Materialization failed");
                            let message = match e {
                                Error::MaterializationFailed { message, .. } => message,
                                other => other.to_string(),
                            };
                            let cause = FailureCause::Materialization { message };
                            states.insert(node.id.clone(), NodeState::Failed);
                            self.emit(ProvisionEvent::NodeFailed {
                                node: node.id.clone(),
                                cause: cause.clone(),
                            })
                            .await;
                            failed.push(FailedNode {
                                id: node.id.clone(),
                                cause,
                            });
                            halted = true;
                            break;
                        }
                    }
                }
            }

            if halted {
                break;
            }

            let waiting: Vec<Arc<SignalChannel>> = order
                .iter()
                .filter(|n| states[&n.id] == NodeState::Waiting)
                .filter_map(|n| channels.get(&n.id).cloned())
                .collect();
            if waiting.is_empty() {
                break;
            }

            let (resolution, gate_id) = wait_any(waiting).await;
            self.emit(ProvisionEvent::GateResolved {
                node: gate_id.clone(),
                resolution: resolution.clone(),
            })
            .await;

            match &resolution {
                Resolution::Success(payload) => {
                    let mut resource = MaterializedResource::new(
                        &gate_id,
                        ResourceKind::WaitCondition,
                        channels
                            .get(&gate_id)
                            .map(|c| c.id().to_string())
                            .unwrap_or_default(),
                    )
                    .with_attribute("status", "SUCCESS");
                    if let Some(reason) = &payload.reason {
                        resource = resource.with_attribute("reason", reason);
                    }
                    if let Some(unique_id) = &payload.unique_id {
                        resource = resource.with_attribute("unique_id", unique_id);
                    }
                    if let Some(data) = &payload.data {
                        resource = resource.with_attribute("data", data);
                    }
                    info!(node = %gate_id, "Bootstrap signal succeeded");
                    vars.set_resource_attributes(&gate_id, attribute_pairs(&resource));
                    states.insert(gate_id.clone(), NodeState::Done);
                    self.inventory.write().await.push(resource.clone());
                    self.emit(ProvisionEvent::NodeMaterialized {
                        resource: resource.clone(),
                    })
                    .await;
                    completed.push(resource);
                }
                other => {
                    let outcome = other.state().to_string();
                    warn!(node = %gate_id, outcome = %outcome, "Bootstrap signal did not succeed");
                    let mut doomed = vec![gate_id.clone()];
                    doomed.extend(graph.transitive_dependents(&gate_id));
                    for id in doomed {
                        if matches!(states.get(&id), Some(NodeState::Done | NodeState::Failed)) {
                            continue;
                        }
                        let cause = FailureCause::UpstreamSignal {
                            signal: gate_id.clone(),
                            outcome: outcome.clone(),
                        };
                        states.insert(id.clone(), NodeState::Failed);
                        self.emit(ProvisionEvent::NodeFailed {
                            node: id.clone(),
                            cause: cause.clone(),
                        })
                        .await;
                        failed.push(FailedNode { id, cause });
                    }
                }
            }
        }

        let success = failed.is_empty() && states.values().all(|s| *s == NodeState::Done);
        self.emit(ProvisionEvent::ProvisionCompleted { success }).await;

        if success {
            info!(run = %run_id, resources = completed.len(), "Provisioning complete");
            return Ok(ProvisionReport {
                run_id,
                resources: completed,
                warnings,
            });
        }

        let not_attempted: Vec<String> = order
            .iter()
            .filter(|n| matches!(states[&n.id], NodeState::Pending | NodeState::Waiting))
            .map(|n| n.id.clone())
            .collect();
        let partial = PartialProvision {
            completed: completed.into_iter().map(|r| r.node_id).collect(),
            failed,
            not_attempted,
        };
        error!(run = %run_id, "{}", partial);
        Err(partial.into())
    }

    async fn materialize_node(
        &self,
        node: &ResourceNode,
        vars: &VariableContext,
        warnings: &mut Vec<ValidationWarning>,
    ) -> Result<MaterializedResource> {
        let unresolved = vars.unresolved_json(&node.attributes);
        if !unresolved.is_empty() {
            return Err(Error::InvalidInput(format!(
                "unresolved references: {}",
                unresolved
                    .iter()
                    .map(|v| format!("${{{}}}", v))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let resolved = node
            .clone()
            .with_attributes(vars.interpolate_json(&node.attributes));

        info!(node = %node.id, kind = %node.kind, provider = self.provider.name(), "Materializing");
        self.emit(ProvisionEvent::NodeStarted {
            node: node.id.clone(),
            kind: node.kind,
        })
        .await;

        for warning in self.provider.validate(&resolved).await? {
            warn!(node = %warning.node_id, field = %warning.field, "{}", warning.message);
            warnings.push(warning);
        }
        self.provider.materialize(&resolved).await
    }

    /// Render declared outputs against the materialized resources.
    pub async fn render_outputs(&self, specs: &[OutputSpec]) -> Result<StackOutputs> {
        let mut vars = self.config.variables();
        for resource in self.inventory.read().await.iter() {
            vars.set_resource_attributes(&resource.node_id, attribute_pairs(resource));
        }

        let mut outputs = StackOutputs::new();
        for spec in specs {
            let unresolved = vars.unresolved(&spec.value);
            if !unresolved.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "output '{}' references unresolved ${{{}}}",
                    spec.name, unresolved[0]
                )));
            }
            outputs.insert(
                spec.name.clone(),
                OutputValue {
                    value: vars.interpolate(&spec.value),
                    description: spec.description.clone(),
                    export_name: spec.export_name.clone(),
                },
            );
        }
        Ok(outputs)
    }

    /// Cancel pending signal waits and destroy every materialized resource in
    /// reverse creation order.
    ///
    /// An in-flight provisioning run is stopped first. Resources that fail to
    /// destroy stay in the inventory so a later teardown can retry them.
    pub async fn teardown(&self) -> Result<TeardownReport> {
        self.cancelled.store(true, Ordering::SeqCst);
        let cancelled_signals = self.signals.cancel_all().await;
        let _guard = self.run_lock.lock().await;
        self.cancelled.store(false, Ordering::SeqCst);

        info!(stack = %self.config.stack_name, cancelled_signals, "Tearing down stack");

        let mut report = TeardownReport {
            cancelled_signals,
            ..Default::default()
        };
        let mut inventory = self.inventory.write().await;
        let mut remaining = Vec::new();
        while let Some(resource) = inventory.pop() {
            if resource.kind.is_gate() {
                report.destroyed.push(resource.node_id);
                continue;
            }
            match self.provider.destroy(&resource).await {
                Ok(()) => {
                    info!(node = %resource.node_id, physical_id = %resource.physical_id, "Destroyed");
                    report.destroyed.push(resource.node_id);
                }
                Err(e) => {
                    error!(node = %resource.node_id, error = %e, "Destroy failed");
                    report.failed.push(FailedNode {
                        id: resource.node_id.clone(),
                        cause: FailureCause::Materialization {
                            message: e.to_string(),
                        },
                    });
                    remaining.push(resource);
                }
            }
        }
        remaining.reverse();
        *inventory = remaining;
        drop(inventory);

        self.signals.clear().await;
        Ok(report)
    }

    async fn emit(&self, event: ProvisionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }
}

fn attribute_pairs(resource: &MaterializedResource) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = resource
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.push(("id".to_string(), resource.physical_id.clone()));
    pairs
}

/// Wait for the first of several channels to resolve.
async fn wait_any(channels: Vec<Arc<SignalChannel>>) -> (Resolution, String) {
    let waits: Vec<BoxFuture<'static, (Resolution, String)>> = channels
        .into_iter()
        .map(|channel| -> BoxFuture<'static, (Resolution, String)> {
            Box::pin(async move {
                let resolution = channel.wait().await;
                (resolution, channel.node_id().to_string())
            })
        })
        .collect();
    let (first, _, _) = select_all(waits).await;
    first
}

/// Node ids of `order` that are signal gates, with the nodes each gate holds back.
pub fn gated_nodes(order: &[ResourceNode]) -> Result<BTreeMap<String, Vec<String>>> {
    let graph = DependencyGraph::new(order.to_vec())?;
    let mut out = BTreeMap::new();
    for gate in order.iter().filter(|n| n.kind.is_gate()) {
        out.insert(
            gate.id.clone(),
            graph.transitive_dependents(&gate.id).into_iter().collect(),
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use crate::signal::{ChannelState, SignalPayload, SignalStatus};
    use optimus_core::{ChannelId, resolve};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            stack_name: "optimus".to_string(),
            region: "us-west-1".to_string(),
            account: Some("619326977873".to_string()),
            tags: BTreeMap::from([("Environment".to_string(), "Development".to_string())]),
        }
    }

    fn orchestrator(provider: LocalProvider) -> ProvisioningOrchestrator {
        ProvisioningOrchestrator::new(
            config(),
            Arc::new(provider),
            Arc::new(SignalRegistry::new("http://localhost:8080", "secret")),
        )
    }

    fn stack(timeout_secs: u64) -> Vec<ResourceNode> {
        resolve(vec![
            ResourceNode::new("vpc", ResourceKind::Network),
            ResourceNode::new("table", ResourceKind::Table)
                .with_attribute("table-name", "OptimusTable"),
            ResourceNode::new("instance", ResourceKind::Compute)
                .with_attribute("user-data", "curl -X PUT '${bootstrap.callback_url}'")
                .with_attribute("tag", "${tags.Environment}")
                .depends_on("vpc"),
            ResourceNode::new("bootstrap", ResourceKind::WaitCondition)
                .with_attributes(json!({ "timeout": timeout_secs }))
                .depends_on("instance"),
            ResourceNode::new("group", ResourceKind::DeploymentGroup).depends_on("instance"),
            ResourceNode::new("pipeline", ResourceKind::Pipeline)
                .depends_on("group")
                .depends_on("bootstrap"),
            ResourceNode::new("function", ResourceKind::Function)
                .with_attribute("table", "${table.name}")
                .depends_on("table"),
        ])
        .unwrap()
    }

    /// Report success to the bootstrap channel once it exists.
    fn report_when_ready(orch: &Arc<ProvisioningOrchestrator>, status: SignalStatus) {
        let signals = orch.signals().clone();
        tokio::spawn(async move {
            loop {
                if let Some(channel) = signals
                    .by_node("bootstrap")
                    .await
                    .filter(|c| c.state() == ChannelState::Pending)
                {
                    let _ = channel.report(
                        status,
                        SignalPayload {
                            reason: Some("Configuration Complete".to_string()),
                            unique_id: Some("ID1234".to_string()),
                            data: None,
                        },
                    );
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    #[tokio::test]
    async fn test_provision_waits_for_signal_then_finishes() {
        let orch = Arc::new(orchestrator(LocalProvider::new("us-west-1", "619326977873")));
        report_when_ready(&orch, SignalStatus::Success);

        let report = orch.provision(stack(30)).await.unwrap();
        let ids: Vec<&str> = report.resources.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids.len(), 7);

        let pos = |id: &str| ids.iter().position(|i| *i == id).unwrap();
        assert!(pos("bootstrap") > pos("instance"));
        assert!(pos("pipeline") > pos("bootstrap"));
        assert!(pos("pipeline") > pos("group"));

        let gate = &report.resources[pos("bootstrap")];
        assert_eq!(gate.attribute("status"), Some("SUCCESS"));
        assert_eq!(gate.attribute("reason"), Some("Configuration Complete"));

        let instance = &report.resources[pos("instance")];
        let user_data = instance.attribute("user-data").unwrap();
        assert!(user_data.starts_with("curl -X PUT 'http://localhost:8080/signals/"));
        assert_eq!(instance.attribute("tag"), Some("Development"));

        let function = &report.resources[pos("function")];
        assert_eq!(function.attribute("table"), Some("OptimusTable"));
    }

    #[tokio::test]
    async fn test_unrelated_nodes_do_not_wait_for_signal() {
        let (tx, mut rx) = mpsc::channel(100);
        let orch = Arc::new(
            orchestrator(LocalProvider::new("us-west-1", "619326977873")).with_events(tx),
        );
        report_when_ready(&orch, SignalStatus::Success);
        orch.provision(stack(30)).await.unwrap();

        let mut order = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ProvisionEvent::NodeMaterialized { resource } => order.push(resource.node_id),
                ProvisionEvent::GateWaiting { node, .. } => order.push(format!("wait:{}", node)),
                _ => {}
            }
        }
        let pos = |id: &str| order.iter().position(|i| i == id).unwrap();
        // Everything that does not sit behind the gate exists before the wait starts resolving.
        assert!(pos("function") < pos("bootstrap"));
        assert!(pos("group") < pos("bootstrap"));
        assert!(pos("wait:bootstrap") < pos("bootstrap"));
    }

    #[tokio::test]
    async fn test_signal_failure_fails_dependents_only() {
        let orch = Arc::new(orchestrator(LocalProvider::new("us-west-1", "619326977873")));
        report_when_ready(&orch, SignalStatus::Failure);

        let err = orch.provision(stack(30)).await.unwrap_err();
        let Error::PartialProvision(partial) = err else {
            panic!("expected partial provision, got {err}");
        };
        let failed: Vec<&str> = partial.failed.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(failed, vec!["bootstrap", "pipeline"]);
        assert!(matches!(
            &partial.failed[1].cause,
            FailureCause::UpstreamSignal { signal, outcome } if signal == "bootstrap" && outcome == "failure"
        ));
        assert_eq!(partial.completed.len(), 5);
        assert!(partial.completed.contains(&"function".to_string()));
        assert!(partial.not_attempted.is_empty());
    }

    #[tokio::test]
    async fn test_signal_timeout_is_upstream_failure() {
        let orch = orchestrator(LocalProvider::new("us-west-1", "619326977873"));
        let mut nodes = stack(1);
        for node in nodes.iter_mut().filter(|n| n.id == "bootstrap") {
            node.attributes = json!({ "timeout": 0 });
        }

        let err = orch.provision(nodes).await.unwrap_err();
        let Error::PartialProvision(partial) = err else {
            panic!("expected partial provision, got {err}");
        };
        assert!(partial.failed.iter().all(|f| matches!(
            &f.cause,
            FailureCause::UpstreamSignal { outcome, .. } if outcome == "timed_out"
        )));
        assert_eq!(partial.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_materialization_failure_halts() {
        let provider = LocalProvider::new("us-west-1", "619326977873").fail_on("instance");
        let orch = orchestrator(provider);

        let err = orch.provision(stack(30)).await.unwrap_err();
        let Error::PartialProvision(partial) = err else {
            panic!("expected partial provision, got {err}");
        };
        assert_eq!(partial.completed, vec!["vpc", "table"]);
        assert_eq!(partial.failed.len(), 1);
        assert_eq!(partial.failed[0].id, "instance");
        assert!(partial.not_attempted.contains(&"pipeline".to_string()));
        assert!(partial.not_attempted.contains(&"function".to_string()));

        // Completed nodes stay in place.
        assert_eq!(orch.resources().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_provision_rejected() {
        let orch = Arc::new(orchestrator(LocalProvider::new("us-west-1", "619326977873")));
        let first = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.provision(stack(30)).await })
        };
        while orch.signals().by_node("bootstrap").await.is_none() {
            tokio::task::yield_now().await;
        }
        assert!(orch.is_running());

        let second = orch.provision(stack(30)).await;
        assert!(matches!(second, Err(Error::Conflict(_))));

        let report = orch.teardown().await.unwrap();
        assert_eq!(report.cancelled_signals, 1);
        assert!(first.await.unwrap().is_err());
        assert!(orch.resources().await.is_empty());
    }

    #[tokio::test]
    async fn test_reprovision_skips_existing_nodes() {
        let provider = Arc::new(LocalProvider::new("us-west-1", "619326977873"));
        let orch = Arc::new(ProvisioningOrchestrator::new(
            config(),
            provider.clone(),
            Arc::new(SignalRegistry::new("http://localhost:8080", "secret")),
        ));
        let mut nodes = stack(30);
        for node in nodes.iter_mut().filter(|n| n.id == "bootstrap") {
            node.attributes = json!({ "timeout": 0 });
        }
        assert!(orch.provision(nodes).await.is_err());
        let created = provider.created_count();

        report_when_ready(&orch, SignalStatus::Success);
        let report = orch.provision(stack(30)).await.unwrap();
        assert_eq!(report.resources.len(), 7);
        // Only the pipeline was new.
        assert_eq!(provider.created_count(), created + 1);
    }

    #[tokio::test]
    async fn test_reprovision_after_timeout_accepts_kept_instance_url() {
        let orch = Arc::new(orchestrator(LocalProvider::new("us-west-1", "619326977873")));
        let mut nodes = stack(30);
        for node in nodes.iter_mut().filter(|n| n.id == "bootstrap") {
            node.attributes = json!({ "timeout": 0 });
        }
        assert!(orch.provision(nodes).await.is_err());

        let instance = orch
            .resources()
            .await
            .into_iter()
            .find(|r| r.node_id == "instance")
            .unwrap();
        let user_data = instance.attribute("user-data").unwrap().to_string();
        let path = user_data.split("/signals/").nth(1).unwrap();
        let mut parts = path.trim_end_matches('\'').split('/');
        let id: ChannelId = parts.next().unwrap().parse().unwrap();
        let token = parts.next().unwrap().to_string();
        assert!(orch.signals().verify_token(id, &token));

        let signals = orch.signals().clone();
        let reporter = tokio::spawn(async move {
            loop {
                let reported = signals
                    .report(id, SignalStatus::Success, SignalPayload::default())
                    .await;
                if reported.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let report = orch.provision(stack(30)).await.unwrap();
        reporter.await.unwrap();
        assert_eq!(report.resources.len(), 7);
        let gate = report
            .resources
            .iter()
            .find(|r| r.node_id == "bootstrap")
            .unwrap();
        assert_eq!(gate.physical_id, id.to_string());
    }

    #[tokio::test]
    async fn test_render_outputs() {
        let orch = Arc::new(orchestrator(LocalProvider::new("us-west-1", "619326977873")));
        report_when_ready(&orch, SignalStatus::Success);
        orch.provision(stack(30)).await.unwrap();

        let outputs = orch
            .render_outputs(&[
                OutputSpec {
                    name: "TableName".to_string(),
                    value: "${table.name}".to_string(),
                    description: None,
                    export_name: Some("OptimusTableName".to_string()),
                },
                OutputSpec {
                    name: "Region".to_string(),
                    value: "${stack.region}".to_string(),
                    description: None,
                    export_name: None,
                },
            ])
            .await
            .unwrap();
        assert_eq!(outputs.get("TableName"), Some("OptimusTable"));
        assert_eq!(outputs.get("Region"), Some("us-west-1"));

        let missing = orch
            .render_outputs(&[OutputSpec {
                name: "Nope".to_string(),
                value: "${ghost.id}".to_string(),
                description: None,
                export_name: None,
            }])
            .await;
        assert!(matches!(missing, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_teardown_destroys_in_reverse() {
        let provider = Arc::new(LocalProvider::new("us-west-1", "619326977873"));
        let orch = Arc::new(ProvisioningOrchestrator::new(
            config(),
            provider.clone(),
            Arc::new(SignalRegistry::new("http://localhost:8080", "secret")),
        ));
        report_when_ready(&orch, SignalStatus::Success);
        let report = orch.provision(stack(30)).await.unwrap();

        let teardown = orch.teardown().await.unwrap();
        let mut expected: Vec<String> = report.resources.iter().map(|r| r.node_id.clone()).collect();
        expected.reverse();
        assert_eq!(teardown.destroyed, expected);
        assert!(teardown.failed.is_empty());
        assert_eq!(provider.live_count().await, 0);
    }

    #[test]
    fn test_gated_nodes() {
        let gated = gated_nodes(&stack(30)).unwrap();
        assert_eq!(gated.get("bootstrap"), Some(&vec!["pipeline".to_string()]));
    }
}
