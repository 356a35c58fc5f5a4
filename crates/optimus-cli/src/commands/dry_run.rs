//! Local dry run: provision a stack in-process against the local provider.
//!
//! Signal gates are answered automatically, so the whole walk (including
//! deferred nodes) can be watched without any instance reporting back.

use anyhow::{Context, Result, bail};
use optimus_config::load_stack;
use optimus_core::resolve;
use optimus_provisioner::{
    LocalProvider, OrchestratorConfig, ProvisionEvent, ProvisioningOrchestrator, SignalPayload,
    SignalRegistry, SignalStatus,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Provision `path` locally, failing the given nodes and signals.
pub async fn run(path: &str, fail_nodes: Vec<String>, fail_signals: Vec<String>) -> Result<()> {
    let stack = load_stack(path).with_context(|| format!("Failed to load stack: {}", path))?;
    let order = resolve(stack.resources.clone())?;

    let mut provider = LocalProvider::new(
        stack.region.clone(),
        stack.account.clone().unwrap_or_default(),
    );
    for node in fail_nodes {
        provider = provider.fail_on(node);
    }
    let signals = Arc::new(SignalRegistry::new(
        "http://localhost:8080",
        uuid::Uuid::new_v4().simple().to_string().into_bytes(),
    ));
    let (tx, mut rx) = mpsc::channel(100);
    let orchestrator = ProvisioningOrchestrator::new(
        OrchestratorConfig::from_stack(&stack),
        Arc::new(provider),
        signals.clone(),
    )
    .with_events(tx);

    println!("Provisioning stack '{}' locally", stack.name);
    println!("Resources: {}\n", order.len());

    let outputs = stack.outputs.clone();
    let handle = tokio::spawn(async move {
        let result = orchestrator.provision(order).await;
        let rendered = match &result {
            Ok(_) => Some(orchestrator.render_outputs(&outputs).await),
            Err(_) => None,
        };
        (result, rendered)
    });

    while let Some(event) = rx.recv().await {
        match event {
            ProvisionEvent::NodeStarted { node, kind } => {
                println!("▶ {} [{}]", node, kind);
            }
            ProvisionEvent::NodeMaterialized { resource } => {
                println!("✓ {} → {}", resource.node_id, resource.physical_id);
            }
            ProvisionEvent::NodeFailed { node, cause } => {
                println!("✗ {} failed: {:?}", node, cause);
            }
            ProvisionEvent::NodeDeferred { node, gate } => {
                println!("⊘ {} deferred until '{}' signals", node, gate);
            }
            ProvisionEvent::GateWaiting { node, callback_url } => {
                println!("… {} waiting on {}", node, callback_url);
                let status = if fail_signals.contains(&node) {
                    SignalStatus::Failure
                } else {
                    SignalStatus::Success
                };
                if let Some(channel) = signals.by_node(&node).await {
                    let payload = SignalPayload {
                        reason: Some("dry run".to_string()),
                        unique_id: Some(node.clone()),
                        data: None,
                    };
                    if let Err(e) = channel.report(status, payload) {
                        println!("  signal for {} not delivered: {}", node, e);
                    }
                }
            }
            ProvisionEvent::GateResolved { node, resolution } => {
                println!("  {} resolved: {}", node, resolution.state());
            }
            ProvisionEvent::ProvisionCompleted { success } => {
                println!(
                    "\n--- Provisioning {} ---",
                    if success { "completed" } else { "failed" }
                );
            }
        }
    }

    let (result, rendered) = handle.await.context("Provisioning task failed")?;
    match result {
        Ok(report) => {
            for warning in &report.warnings {
                println!("! {}.{}: {}", warning.node_id, warning.field, warning.message);
            }
            if let Some(outputs) = rendered {
                let outputs = outputs?;
                println!("\nOutputs:");
                for (name, value) in outputs.iter() {
                    println!("  {} = {}", name, value.value);
                }
            }
            Ok(())
        }
        Err(e) => bail!("{}", e),
    }
}
