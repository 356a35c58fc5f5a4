//! Pipeline registry, activation and triggering.

use crate::orchestrator::PipelineOrchestrator;
use crate::queue::{ExecutionQueue, ExecutionStore};
use crate::worker::Worker;
use optimus_core::pipeline::{
    ExecutionStatus, PipelineDefinition, PipelineExecution, TriggerInfo, TriggerKind,
};
use optimus_core::{Error, ExecutionId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

struct PipelineSlot {
    definition: PipelineDefinition,
    active: Arc<AtomicBool>,
    queue: Option<ExecutionQueue>,
    run_lock: Arc<Mutex<()>>,
}

/// Summary of a registered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub name: String,
    pub node_id: String,
    pub repository: String,
    pub branch: String,
    pub active: bool,
    pub last_status: Option<ExecutionStatus>,
}

/// Owns every pipeline of a stack and the workers that run them.
pub struct PipelineScheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    store: Arc<ExecutionStore>,
    pipelines: RwLock<BTreeMap<String, PipelineSlot>>,
}

impl PipelineScheduler {
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        let store = orchestrator.store().clone();
        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            pipelines: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register pipeline definitions. Registered pipelines start inactive.
    ///
    /// An already registered pipeline keeps its activation; the new definition
    /// is used from its next activation on.
    pub async fn register(&self, definitions: impl IntoIterator<Item = PipelineDefinition>) {
        let mut pipelines = self.pipelines.write().await;
        for definition in definitions {
            match pipelines.get_mut(&definition.name) {
                Some(slot) => slot.definition = definition,
                None => {
                    debug!(pipeline = %definition.name, "Registered pipeline");
                    pipelines.insert(
                        definition.name.clone(),
                        PipelineSlot {
                            definition,
                            active: Arc::new(AtomicBool::new(false)),
                            queue: None,
                            run_lock: Arc::new(Mutex::new(())),
                        },
                    );
                }
            }
        }
    }

    /// Let a pipeline accept triggers.
    ///
    /// Returns `false` if it was already active. With `restart_on_update` a
    /// newly activated pipeline starts one execution right away.
    pub async fn activate(&self, name: &str) -> Result<bool> {
        let (queue, restart) = {
            let mut pipelines = self.pipelines.write().await;
            let slot = pipelines
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("pipeline {}", name)))?;
            if slot.queue.is_some() {
                return Ok(false);
            }

            // A fresh flag; a worker left over from an earlier activation
            // keeps its own and cancels whatever it still holds. The run lock
            // is shared, so the new worker waits for the old one's execution.
            let active = Arc::new(AtomicBool::new(true));
            let (queue, rx) = ExecutionQueue::new(name);
            let worker = Worker::new(
                slot.definition.clone(),
                self.orchestrator.clone(),
                rx,
                active.clone(),
                slot.run_lock.clone(),
            );
            tokio::spawn(worker.run());

            slot.active = active;
            slot.queue = Some(queue.clone());
            (queue, slot.definition.restart_on_update)
        };
        info!(pipeline = %name, restart_on_update = restart, "Pipeline activated");

        if restart {
            let trigger = TriggerInfo {
                kind: TriggerKind::Activation,
                branch: None,
                commit: None,
                actor: None,
            };
            self.enqueue(&queue, trigger).await?;
        }
        Ok(true)
    }

    /// Activate the pipeline materialized by resource node `node_id`, if any.
    pub async fn activate_by_node(&self, node_id: &str) -> Result<Option<String>> {
        let name = {
            let pipelines = self.pipelines.read().await;
            pipelines
                .values()
                .find(|slot| slot.definition.node_id == node_id)
                .map(|slot| slot.definition.name.clone())
        };
        match name {
            Some(name) => {
                self.activate(&name).await?;
                Ok(Some(name))
            }
            None => Ok(None),
        }
    }

    /// Stop accepting triggers.
    ///
    /// The running execution (if any) finishes; executions still queued are
    /// cancelled.
    pub async fn deactivate(&self, name: &str) -> Result<bool> {
        let mut pipelines = self.pipelines.write().await;
        let slot = pipelines
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("pipeline {}", name)))?;
        let was_active = slot.queue.take().is_some();
        slot.active.store(false, Ordering::SeqCst);
        if was_active {
            info!(pipeline = %name, "Pipeline deactivated");
        }
        Ok(was_active)
    }

    /// Deactivate every pipeline, returning how many were active.
    pub async fn deactivate_all(&self) -> usize {
        let names: Vec<String> = self.pipelines.read().await.keys().cloned().collect();
        let mut count = 0;
        for name in names {
            if let Ok(true) = self.deactivate(&name).await {
                count += 1;
            }
        }
        count
    }

    pub async fn is_active(&self, name: &str) -> bool {
        self.pipelines
            .read()
            .await
            .get(name)
            .is_some_and(|slot| slot.queue.is_some())
    }

    /// Queue a new execution of an active pipeline.
    pub async fn trigger(&self, name: &str, trigger: TriggerInfo) -> Result<PipelineExecution> {
        let queue = {
            let pipelines = self.pipelines.read().await;
            let slot = pipelines
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("pipeline {}", name)))?;
            slot.queue.clone().ok_or_else(|| {
                Error::Conflict(format!(
                    "pipeline '{}' is not active; provision the stack first",
                    name
                ))
            })?
        };
        self.enqueue(&queue, trigger).await
    }

    /// Trigger every active pipeline whose source matches a push.
    pub async fn handle_push(
        &self,
        repository: &str,
        branch: &str,
        commit: Option<String>,
        actor: Option<String>,
    ) -> Result<Vec<PipelineExecution>> {
        let matching: Vec<String> = {
            let pipelines = self.pipelines.read().await;
            pipelines
                .values()
                .filter(|slot| slot.queue.is_some())
                .filter(|slot| slot.definition.matches_push(repository, branch))
                .map(|slot| slot.definition.name.clone())
                .collect()
        };
        debug!(repository = %repository, branch = %branch, matched = matching.len(), "Push received");

        let mut started = Vec::new();
        for name in matching {
            let trigger = TriggerInfo {
                kind: TriggerKind::Push,
                branch: Some(branch.to_string()),
                commit: commit.clone(),
                actor: actor.clone(),
            };
            started.push(self.trigger(&name, trigger).await?);
        }
        Ok(started)
    }

    async fn enqueue(
        &self,
        queue: &ExecutionQueue,
        trigger: TriggerInfo,
    ) -> Result<PipelineExecution> {
        let execution = PipelineExecution::new(queue.pipeline(), trigger);
        self.store.insert(execution.clone()).await;
        queue.enqueue(execution.id)?;
        info!(pipeline = %queue.pipeline(), execution_id = %execution.id, "Execution queued");
        Ok(execution)
    }

    pub async fn definition(&self, name: &str) -> Option<PipelineDefinition> {
        self.pipelines
            .read()
            .await
            .get(name)
            .map(|slot| slot.definition.clone())
    }

    pub async fn list_pipelines(&self) -> Vec<PipelineSummary> {
        let pipelines = self.pipelines.read().await;
        let mut summaries = Vec::with_capacity(pipelines.len());
        for slot in pipelines.values() {
            let def = &slot.definition;
            summaries.push(PipelineSummary {
                name: def.name.clone(),
                node_id: def.node_id.clone(),
                repository: def.source.full_name(),
                branch: def.source.branch.clone(),
                active: slot.queue.is_some(),
                last_status: self.store.latest_status(&def.name).await,
            });
        }
        summaries
    }

    /// Executions of a pipeline, newest first.
    pub async fn executions(&self, name: &str) -> Result<Vec<PipelineExecution>> {
        if !self.pipelines.read().await.contains_key(name) {
            return Err(Error::NotFound(format!("pipeline {}", name)));
        }
        Ok(self.store.list(name).await)
    }

    pub async fn execution(&self, id: ExecutionId) -> Result<PipelineExecution> {
        self.store
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("execution {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use optimus_core::artifact::Artifact;
    use optimus_core::pipeline::{DeployTarget, RollbackPolicy, SourceConfig, StageName};
    use optimus_core::stage::{StageRequest, StageRunner};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn definition(name: &str, restart_on_update: bool) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            node_id: format!("{}-pipeline", name),
            source: SourceConfig {
                owner: "galvitron".to_string(),
                repo: format!("optimus-{}", name),
                branch: "main".to_string(),
                token_secret: None,
            },
            build_project: format!("{}-build", name),
            deploy: DeployTarget::ServerGroup {
                group: format!("{}-group", name),
                rollback: RollbackPolicy {
                    failed_deployment: true,
                },
            },
            artifact_bucket: None,
            restart_on_update,
        }
    }

    /// Runner whose deploy stage waits for a permit.
    struct GatedRunner {
        deploy_permits: Semaphore,
    }

    #[async_trait]
    impl StageRunner for GatedRunner {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn run(&self, request: StageRequest) -> Result<Option<Artifact>> {
            if request.stage == StageName::Deploy {
                let permit = self
                    .deploy_permits
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                permit.forget();
            }
            Ok(request
                .stage
                .output_artifact_name()
                .map(|name| Artifact::new(name, "mem://artifact")))
        }

        async fn rollback(&self, _: &PipelineDefinition, _: ExecutionId) -> Result<()> {
            Ok(())
        }
    }

    fn scheduler() -> (Arc<PipelineScheduler>, Arc<GatedRunner>) {
        let runner = Arc::new(GatedRunner {
            deploy_permits: Semaphore::new(0),
        });
        let store = Arc::new(ExecutionStore::new());
        let orchestrator = PipelineOrchestrator::new(runner.clone(), store);
        (Arc::new(PipelineScheduler::new(orchestrator)), runner)
    }

    async fn wait_for_status(
        scheduler: &PipelineScheduler,
        id: ExecutionId,
        status: ExecutionStatus,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if scheduler.execution(id).await.unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("execution {} never reached {}", id, status));
    }

    #[tokio::test]
    async fn test_trigger_requires_activation() {
        let (scheduler, _) = scheduler();
        scheduler.register([definition("api", false)]).await;

        let result = scheduler.trigger("api", TriggerInfo::manual(None)).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(matches!(
            scheduler.trigger("missing", TriggerInfo::manual(None)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_executions_run_one_at_a_time() {
        let (scheduler, runner) = scheduler();
        scheduler.register([definition("api", false)]).await;
        assert!(scheduler.activate("api").await.unwrap());

        let first = scheduler.trigger("api", TriggerInfo::manual(None)).await.unwrap();
        let second = scheduler.trigger("api", TriggerInfo::manual(None)).await.unwrap();

        wait_for_status(&scheduler, first.id, ExecutionStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            scheduler.execution(second.id).await.unwrap().status,
            ExecutionStatus::Queued
        );

        runner.deploy_permits.add_permits(1);
        wait_for_status(&scheduler, first.id, ExecutionStatus::Succeeded).await;
        wait_for_status(&scheduler, second.id, ExecutionStatus::Running).await;

        runner.deploy_permits.add_permits(1);
        wait_for_status(&scheduler, second.id, ExecutionStatus::Succeeded).await;

        let first = scheduler.execution(first.id).await.unwrap();
        let second = scheduler.execution(second.id).await.unwrap();
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
        assert_eq!(scheduler.executions("api").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_on_update_starts_execution() {
        let (scheduler, runner) = scheduler();
        scheduler
            .register([definition("api", true), definition("web", false)])
            .await;
        runner.deploy_permits.add_permits(1);

        assert_eq!(
            scheduler.activate_by_node("api-pipeline").await.unwrap(),
            Some("api".to_string())
        );
        scheduler.activate("web").await.unwrap();
        // Activating twice is a no-op.
        assert!(!scheduler.activate("api").await.unwrap());

        let api = scheduler.executions("api").await.unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].trigger.kind, TriggerKind::Activation);
        wait_for_status(&scheduler, api[0].id, ExecutionStatus::Succeeded).await;
        assert!(scheduler.executions("web").await.unwrap().is_empty());
        assert_eq!(scheduler.activate_by_node("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_handle_push_matches_source() {
        let (scheduler, _) = scheduler();
        scheduler
            .register([definition("api", false), definition("web", false)])
            .await;
        scheduler.activate("api").await.unwrap();
        scheduler.activate("web").await.unwrap();

        let started = scheduler
            .handle_push("Galvitron/optimus-api", "main", Some("abc123".to_string()), None)
            .await
            .unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].pipeline, "api");
        assert_eq!(started[0].trigger.commit.as_deref(), Some("abc123"));

        let none = scheduler
            .handle_push("galvitron/optimus-api", "feature/x", None, None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_cancels_queued_executions() {
        let (scheduler, runner) = scheduler();
        scheduler.register([definition("api", false)]).await;
        scheduler.activate("api").await.unwrap();

        let running = scheduler.trigger("api", TriggerInfo::manual(None)).await.unwrap();
        let queued = scheduler.trigger("api", TriggerInfo::manual(None)).await.unwrap();
        wait_for_status(&scheduler, running.id, ExecutionStatus::Running).await;

        assert_eq!(scheduler.deactivate_all().await, 1);
        assert!(!scheduler.is_active("api").await);
        assert!(matches!(
            scheduler.trigger("api", TriggerInfo::manual(None)).await,
            Err(Error::Conflict(_))
        ));

        runner.deploy_permits.add_permits(1);
        wait_for_status(&scheduler, running.id, ExecutionStatus::Succeeded).await;
        wait_for_status(&scheduler, queued.id, ExecutionStatus::Failed).await;
        let queued = scheduler.execution(queued.id).await.unwrap();
        assert!(queued.cancel_reason.is_some());
        assert!(queued.started_at.is_none());
    }

    #[tokio::test]
    async fn test_reactivation_waits_for_running_execution() {
        let (scheduler, runner) = scheduler();
        scheduler.register([definition("api", false)]).await;
        scheduler.activate("api").await.unwrap();

        let first = scheduler.trigger("api", TriggerInfo::manual(None)).await.unwrap();
        wait_for_status(&scheduler, first.id, ExecutionStatus::Running).await;

        assert!(scheduler.deactivate("api").await.unwrap());
        assert!(scheduler.activate("api").await.unwrap());
        let second = scheduler.trigger("api", TriggerInfo::manual(None)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            scheduler.execution(second.id).await.unwrap().status,
            ExecutionStatus::Queued
        );

        runner.deploy_permits.add_permits(1);
        wait_for_status(&scheduler, first.id, ExecutionStatus::Succeeded).await;
        wait_for_status(&scheduler, second.id, ExecutionStatus::Running).await;
        runner.deploy_permits.add_permits(1);
        wait_for_status(&scheduler, second.id, ExecutionStatus::Succeeded).await;

        let first = scheduler.execution(first.id).await.unwrap();
        let second = scheduler.execution(second.id).await.unwrap();
        assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_list_pipelines() {
        let (scheduler, _) = scheduler();
        scheduler
            .register([definition("web", false), definition("api", false)])
            .await;
        scheduler.activate("web").await.unwrap();

        let list = scheduler.list_pipelines().await;
        let names: Vec<&str> = list.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["api", "web"]);
        assert!(!list[0].active);
        assert!(list[1].active);
        assert_eq!(list[0].repository, "galvitron/optimus-api");
        assert!(list[0].last_status.is_none());
    }
}
