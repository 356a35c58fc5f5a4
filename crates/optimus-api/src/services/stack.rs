//! Stack service.
//!
//! Owns the provisioning orchestrator of the served stack, tracks per-node
//! progress from its event stream and activates pipelines as their nodes
//! materialize.

use optimus_config::StackDefinition;
use optimus_core::outputs::StackOutputs;
use optimus_core::provider::{FailedNode, PartialProvision};
use optimus_core::{Error, ProvisionRunId, ResourceKind, Result, resolve};
use optimus_provisioner::{
    ProvisionEvent, ProvisionReport, ProvisioningOrchestrator, TeardownReport,
};
use optimus_scheduler::PipelineScheduler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{error, info, warn};

/// Lifecycle phase of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackPhase {
    NotProvisioned,
    Provisioning,
    Provisioned,
    /// The last run ended in a partial provision.
    Partial,
    /// The last run failed before anything was materialized.
    Failed,
    TearingDown,
    TornDown,
}

/// Progress of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeProgress {
    Pending,
    InProgress,
    Deferred { gate: String },
    Waiting { callback_url: String },
    Materialized { physical_id: String },
    Failed { reason: String },
    Destroyed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub kind: ResourceKind,
    #[serde(flatten)]
    pub progress: NodeProgress,
}

/// Current state of the stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackStatus {
    pub name: String,
    pub region: String,
    pub phase: StackPhase,
    pub last_run: Option<ProvisionRunId>,
    pub nodes: BTreeMap<String, NodeStatus>,
    pub failure: Option<PartialProvision>,
    pub last_error: Option<String>,
}

/// Provisioning front end for one stack.
pub struct StackService {
    definition: StackDefinition,
    orchestrator: Arc<ProvisioningOrchestrator>,
    scheduler: Arc<PipelineScheduler>,
    status: Arc<RwLock<StackStatus>>,
}

impl StackService {
    /// Create the service and start draining `events`, the receiving end of
    /// the orchestrator's event channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        definition: StackDefinition,
        orchestrator: Arc<ProvisioningOrchestrator>,
        scheduler: Arc<PipelineScheduler>,
        events: mpsc::Receiver<ProvisionEvent>,
    ) -> Self {
        let nodes = definition
            .resources
            .iter()
            .map(|node| {
                (
                    node.id.clone(),
                    NodeStatus {
                        kind: node.kind,
                        progress: NodeProgress::Pending,
                    },
                )
            })
            .collect();
        let status = Arc::new(RwLock::new(StackStatus {
            name: definition.name.clone(),
            region: definition.region.clone(),
            phase: StackPhase::NotProvisioned,
            last_run: None,
            nodes,
            failure: None,
            last_error: None,
        }));

        tokio::spawn(drain_events(events, status.clone(), scheduler.clone()));

        Self {
            definition,
            orchestrator,
            scheduler,
            status,
        }
    }

    pub fn definition(&self) -> &StackDefinition {
        &self.definition
    }

    pub fn orchestrator(&self) -> &Arc<ProvisioningOrchestrator> {
        &self.orchestrator
    }

    pub async fn status(&self) -> StackStatus {
        self.status.read().await.clone()
    }

    /// Provision the stack and wait for the run to end.
    pub async fn provision(&self) -> Result<ProvisionReport> {
        self.begin_provision().await?;
        self.run_provision().await
    }

    /// Start provisioning in the background.
    ///
    /// Fails with [`Error::Conflict`] while another run or a teardown is in
    /// flight.
    pub async fn start_provision(self: &Arc<Self>) -> Result<()> {
        self.begin_provision().await?;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_provision().await {
                warn!(stack = %this.definition.name, error = %e, "Provisioning did not complete");
            }
        });
        Ok(())
    }

    async fn begin_provision(&self) -> Result<()> {
        let mut status = self.status.write().await;
        match status.phase {
            StackPhase::Provisioning | StackPhase::TearingDown => Err(Error::Conflict(format!(
                "stack '{}' is {}",
                self.definition.name,
                if status.phase == StackPhase::Provisioning {
                    "already provisioning"
                } else {
                    "tearing down"
                }
            ))),
            _ => {
                status.phase = StackPhase::Provisioning;
                status.failure = None;
                status.last_error = None;
                for node in status.nodes.values_mut() {
                    if !matches!(node.progress, NodeProgress::Materialized { .. }) {
                        node.progress = NodeProgress::Pending;
                    }
                }
                Ok(())
            }
        }
    }

    async fn run_provision(&self) -> Result<ProvisionReport> {
        info!(stack = %self.definition.name, "Provisioning stack");
        let result = match resolve(self.definition.resources.clone()) {
            Ok(order) => self.orchestrator.provision(order).await,
            Err(e) => Err(e),
        };

        // Held until the phase is settled; teardown deactivates only after it.
        let mut status = self.status.write().await;
        if status.phase != StackPhase::Provisioning {
            // A teardown took over.
            return result;
        }

        // Events may still be in flight; activate from the inventory as well.
        for resource in self.orchestrator.resources().await {
            if resource.kind == ResourceKind::Pipeline {
                activate_pipeline(&self.scheduler, &resource.node_id).await;
            }
        }

        match &result {
            Ok(report) => {
                status.phase = StackPhase::Provisioned;
                status.last_run = Some(report.run_id);
                for resource in &report.resources {
                    if let Some(node) = status.nodes.get_mut(&resource.node_id) {
                        node.progress = NodeProgress::Materialized {
                            physical_id: resource.physical_id.clone(),
                        };
                    }
                }
                info!(stack = %self.definition.name, resources = report.resources.len(), "Stack provisioned");
            }
            Err(Error::PartialProvision(partial)) => {
                status.phase = StackPhase::Partial;
                for failed in &partial.failed {
                    if let Some(node) = status.nodes.get_mut(&failed.id) {
                        node.progress = NodeProgress::Failed {
                            reason: failure_reason(failed),
                        };
                    }
                }
                status.last_error = Some(partial.to_string());
                status.failure = Some((**partial).clone());
                warn!(stack = %self.definition.name, error = %partial, "Stack partially provisioned");
            }
            Err(e) => {
                status.phase = StackPhase::Failed;
                status.last_error = Some(e.to_string());
                error!(stack = %self.definition.name, error = %e, "Provisioning failed");
            }
        }
        result
    }

    /// Render the stack outputs. Only available once the stack is provisioned.
    pub async fn outputs(&self) -> Result<StackOutputs> {
        let phase = self.status.read().await.phase;
        if phase != StackPhase::Provisioned {
            return Err(Error::Conflict(format!(
                "stack '{}' is not provisioned",
                self.definition.name
            )));
        }
        self.orchestrator
            .render_outputs(&self.definition.outputs)
            .await
    }

    /// Deactivate every pipeline, cancel pending signal waits and destroy the
    /// stack's resources.
    pub async fn teardown(&self) -> Result<TeardownReport> {
        {
            let mut status = self.status.write().await;
            if status.phase == StackPhase::TearingDown {
                return Err(Error::Conflict(format!(
                    "stack '{}' is already tearing down",
                    self.definition.name
                )));
            }
            status.phase = StackPhase::TearingDown;
        }

        let deactivated = self.scheduler.deactivate_all().await;
        info!(stack = %self.definition.name, deactivated, "Pipelines deactivated");
        let result = self.orchestrator.teardown().await;

        let mut status = self.status.write().await;
        match &result {
            Ok(report) => {
                for id in &report.destroyed {
                    if let Some(node) = status.nodes.get_mut(id) {
                        node.progress = NodeProgress::Destroyed;
                    }
                }
                for failed in &report.failed {
                    if let Some(node) = status.nodes.get_mut(&failed.id) {
                        node.progress = NodeProgress::Failed {
                            reason: failure_reason(failed),
                        };
                    }
                }
                status.phase = if report.failed.is_empty() {
                    StackPhase::TornDown
                } else {
                    StackPhase::Partial
                };
            }
            Err(e) => {
                status.phase = StackPhase::Failed;
                status.last_error = Some(e.to_string());
            }
        }
        result
    }
}

fn failure_reason(failed: &FailedNode) -> String {
    failed.to_error().to_string()
}

async fn drain_events(
    mut events: mpsc::Receiver<ProvisionEvent>,
    status: Arc<RwLock<StackStatus>>,
    scheduler: Arc<PipelineScheduler>,
) {
    while let Some(event) = events.recv().await {
        let mut status = status.write().await;
        let provisioning = status.phase == StackPhase::Provisioning;
        let (node, progress) = match event {
            ProvisionEvent::NodeStarted { node, .. } => (node, NodeProgress::InProgress),
            ProvisionEvent::NodeMaterialized { resource } => {
                // Activated under the status lock; teardown deactivates only after taking it.
                if resource.kind == ResourceKind::Pipeline && provisioning {
                    activate_pipeline(&scheduler, &resource.node_id).await;
                }
                (
                    resource.node_id,
                    NodeProgress::Materialized {
                        physical_id: resource.physical_id,
                    },
                )
            }
            ProvisionEvent::NodeFailed { node, cause } => {
                let failed = FailedNode {
                    id: node.clone(),
                    cause,
                };
                (
                    node,
                    NodeProgress::Failed {
                        reason: failure_reason(&failed),
                    },
                )
            }
            ProvisionEvent::NodeDeferred { node, gate } => (node, NodeProgress::Deferred { gate }),
            ProvisionEvent::GateWaiting { node, callback_url } => {
                (node, NodeProgress::Waiting { callback_url })
            }
            ProvisionEvent::GateResolved { .. } | ProvisionEvent::ProvisionCompleted { .. } => {
                continue;
            }
        };
        if let Some(entry) = status.nodes.get_mut(&node) {
            entry.progress = progress;
        }
    }
}

async fn activate_pipeline(scheduler: &PipelineScheduler, node_id: &str) {
    match scheduler.activate_by_node(node_id).await {
        Ok(Some(pipeline)) => info!(node = %node_id, pipeline = %pipeline, "Pipeline node materialized"),
        Ok(None) => {}
        Err(e) => error!(node = %node_id, error = %e, "Failed to activate pipeline"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use optimus_config::parse_stack;
    use optimus_config::system::{ProviderConfig, ServerConfig};
    use std::time::Duration;

    const STACK: &str = r#"
        stack "optimus" region="us-west-1" account="619326977873"

        resource "instance" kind="compute"
        resource "deployment-group" kind="deployment-group" depends-on="instance"
        resource "api-build" kind="build-project"
        resource "api-pipeline" kind="pipeline" {
            depends-on "api-build" "deployment-group"
        }

        pipeline "api" node="api-pipeline" {
            source owner="mzienert" repo="optimus-api" branch="master"
            build project="api-build"
            deploy group="deployment-group"
        }
    "#;

    async fn state() -> AppState {
        let server = ServerConfig {
            callback_secret: Some("test-secret".to_string()),
            ..Default::default()
        };
        AppState::new(&server, &ProviderConfig::default(), parse_stack(STACK).unwrap()).await
    }

    #[tokio::test]
    async fn test_provision_activates_pipelines() {
        let state = state().await;
        state.stack.provision().await.unwrap();

        assert_eq!(state.stack.status().await.phase, StackPhase::Provisioned);
        assert!(state.scheduler.is_active("api").await);

        let report = state.stack.teardown().await.unwrap();
        assert_eq!(report.destroyed.len(), 4);
        assert!(!state.scheduler.is_active("api").await);
        assert_eq!(state.stack.status().await.phase, StackPhase::TornDown);
    }

    #[tokio::test]
    async fn test_no_activation_once_teardown_took_over() {
        let state = state().await;
        state.stack.begin_provision().await.unwrap();
        // Teardown claimed the stack while the run was still going.
        state.stack.status.write().await.phase = StackPhase::TearingDown;

        assert!(state.stack.run_provision().await.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!state.scheduler.is_active("api").await);
        assert_eq!(state.stack.status().await.phase, StackPhase::TearingDown);
    }
}
