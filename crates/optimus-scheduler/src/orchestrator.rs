//! Pipeline orchestrator - drives one execution through its stages.

use crate::queue::ExecutionStore;
use optimus_core::pipeline::{ExecutionStatus, PipelineDefinition, StageName, Transition};
use optimus_core::stage::{StageRequest, StageRunner};
use optimus_core::{Error, ExecutionId, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
    },
    StageStarted {
        execution_id: ExecutionId,
        stage: StageName,
    },
    StageCompleted {
        execution_id: ExecutionId,
        stage: StageName,
        success: bool,
    },
    RollbackStarted {
        execution_id: ExecutionId,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
}

/// Runs executions against a stage runner, recording every step in the store.
pub struct PipelineOrchestrator {
    runner: Arc<dyn StageRunner>,
    store: Arc<ExecutionStore>,
    events: Option<mpsc::Sender<PipelineEvent>>,
}

impl PipelineOrchestrator {
    pub fn new(runner: Arc<dyn StageRunner>, store: Arc<ExecutionStore>) -> Self {
        Self {
            runner,
            store,
            events: None,
        }
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Run a queued execution to a terminal status.
    pub async fn execute(
        &self,
        pipeline: &PipelineDefinition,
        execution_id: ExecutionId,
    ) -> Result<ExecutionStatus> {
        let trigger = self
            .store
            .update(execution_id, |e| {
                e.start()?;
                Ok(e.trigger.clone())
            })
            .await?;
        info!(
            pipeline = %pipeline.name,
            execution_id = %execution_id,
            runner = self.runner.name(),
            "Starting execution"
        );
        self.emit(PipelineEvent::ExecutionStarted { execution_id })
            .await;

        loop {
            let (stage, input) = self.store.update(execution_id, |e| e.begin_stage()).await?;
            info!(execution_id = %execution_id, stage = %stage, "Stage started");
            self.emit(PipelineEvent::StageStarted {
                execution_id,
                stage,
            })
            .await;

            let request = StageRequest {
                pipeline: pipeline.clone(),
                execution_id,
                stage,
                input,
                trigger: trigger.clone(),
            };

            let transition = match self.runner.run(request).await {
                Ok(output) => {
                    self.emit(PipelineEvent::StageCompleted {
                        execution_id,
                        stage,
                        success: true,
                    })
                    .await;
                    self.store
                        .update(execution_id, |e| e.record_success(output))
                        .await?
                }
                Err(e) => {
                    let message = match e {
                        Error::StageFailed { message, .. } => message,
                        other => other.to_string(),
                    };
                    warn!(execution_id = %execution_id, stage = %stage, error = %message, "Stage failed");
                    self.emit(PipelineEvent::StageCompleted {
                        execution_id,
                        stage,
                        success: false,
                    })
                    .await;
                    let policy = pipeline.deploy.rollback_policy();
                    self.store
                        .update(execution_id, |e| e.record_failure(message, policy))
                        .await?
                }
            };

            match transition {
                Transition::Advanced(_) => continue,
                Transition::Succeeded => break,
                Transition::Failed { rollback_required } => {
                    if rollback_required {
                        self.roll_back(pipeline, execution_id).await?;
                    }
                    break;
                }
                Transition::RolledBack => break,
            }
        }

        let status = self
            .store
            .get(execution_id)
            .await
            .map(|e| e.status)
            .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;
        info!(pipeline = %pipeline.name, execution_id = %execution_id, status = %status, "Execution finished");
        self.emit(PipelineEvent::ExecutionFinished {
            execution_id,
            status,
        })
        .await;
        Ok(status)
    }

    async fn roll_back(
        &self,
        pipeline: &PipelineDefinition,
        execution_id: ExecutionId,
    ) -> Result<()> {
        info!(execution_id = %execution_id, target = pipeline.deploy.node_id(), "Rolling back deployment");
        self.emit(PipelineEvent::RollbackStarted { execution_id })
            .await;

        match self.runner.rollback(pipeline, execution_id).await {
            Ok(()) => {
                self.store
                    .update(execution_id, |e| e.record_rolled_back())
                    .await?;
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Rollback failed");
                self.store
                    .update(execution_id, |e| {
                        e.abandon_rollback();
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(())
    }
}
