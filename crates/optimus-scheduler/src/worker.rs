//! Worker that runs one pipeline's executions in order.

use crate::orchestrator::PipelineOrchestrator;
use optimus_core::ExecutionId;
use optimus_core::pipeline::PipelineDefinition;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

/// Serial worker for a single pipeline.
///
/// Executions are taken from the queue one at a time; the next one starts
/// only after the previous one reached a terminal status. `run_lock` is shared
/// by every worker a pipeline ever gets, so a worker started by a
/// re-activation waits for the execution a deactivated one is still running.
pub struct Worker {
    pipeline: PipelineDefinition,
    orchestrator: Arc<PipelineOrchestrator>,
    queue: mpsc::UnboundedReceiver<ExecutionId>,
    active: Arc<AtomicBool>,
    run_lock: Arc<Mutex<()>>,
}

impl Worker {
    pub fn new(
        pipeline: PipelineDefinition,
        orchestrator: Arc<PipelineOrchestrator>,
        queue: mpsc::UnboundedReceiver<ExecutionId>,
        active: Arc<AtomicBool>,
        run_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            pipeline,
            orchestrator,
            queue,
            active,
            run_lock,
        }
    }

    /// Run the worker loop until the queue is closed and drained.
    pub async fn run(mut self) {
        info!(pipeline = %self.pipeline.name, "Starting worker");

        while let Some(execution_id) = self.queue.recv().await {
            let _running = self.run_lock.lock().await;
            if !self.active.load(Ordering::SeqCst) {
                self.cancel(execution_id).await;
                continue;
            }
            info!(pipeline = %self.pipeline.name, execution_id = %execution_id, "Claimed execution");
            if let Err(e) = self.orchestrator.execute(&self.pipeline, execution_id).await {
                warn!(execution_id = %execution_id, error = %e, "Execution aborted");
            }
        }

        info!(pipeline = %self.pipeline.name, "Worker stopped");
    }

    async fn cancel(&self, execution_id: ExecutionId) {
        let reason = format!("pipeline '{}' was deactivated", self.pipeline.name);
        if let Err(e) = self
            .orchestrator
            .store()
            .update(execution_id, |e| e.cancel(reason))
            .await
        {
            warn!(execution_id = %execution_id, error = %e, "Failed to cancel execution");
        }
    }
}
