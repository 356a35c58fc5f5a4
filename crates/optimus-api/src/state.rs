//! Application state.

use optimus_config::StackDefinition;
use optimus_config::system::{ProviderConfig, ServerConfig};
use optimus_provisioner::{
    LocalProvider, OrchestratorConfig, ProvisioningOrchestrator, SignalRegistry,
};
use optimus_scheduler::{
    EnvSecretStore, ExecutionStore, LocalStageRunner, PipelineOrchestrator, PipelineScheduler,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use crate::services::stack::StackService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub stack: Arc<StackService>,
    pub scheduler: Arc<PipelineScheduler>,
    pub signals: Arc<SignalRegistry>,
    pub runner: Arc<LocalStageRunner>,
    pub webhook_secret: Option<String>,
}

impl AppState {
    /// Wire up the local backends for `stack`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(
        server: &ServerConfig,
        provider: &ProviderConfig,
        stack: StackDefinition,
    ) -> Self {
        let callback_secret = server.callback_secret.clone().unwrap_or_else(|| {
            warn!("No callback secret configured, callback URLs will not survive a restart");
            uuid::Uuid::new_v4().simple().to_string()
        });
        let signals = Arc::new(SignalRegistry::new(
            server.public_url.clone(),
            callback_secret.into_bytes(),
        ));

        let mut local = LocalProvider::new(
            stack.region.clone(),
            stack.account.clone().unwrap_or_default(),
        );
        for node in &provider.fail_nodes {
            local = local.fail_on(node.clone());
        }

        let (tx, rx) = mpsc::channel(256);
        let orchestrator = Arc::new(
            ProvisioningOrchestrator::new(
                OrchestratorConfig::from_stack(&stack),
                Arc::new(local),
                signals.clone(),
            )
            .with_events(tx),
        );

        let runner = Arc::new(LocalStageRunner::new(Arc::new(EnvSecretStore)));
        let scheduler = Arc::new(PipelineScheduler::new(PipelineOrchestrator::new(
            runner.clone(),
            Arc::new(ExecutionStore::new()),
        )));
        scheduler.register(stack.pipelines.clone()).await;

        let stack = Arc::new(StackService::new(stack, orchestrator, scheduler.clone(), rx));

        Self {
            stack,
            scheduler,
            signals,
            runner,
            webhook_secret: server.webhook_secret.clone(),
        }
    }
}
