//! Execution store and per-pipeline queues.

use optimus_core::pipeline::{ExecutionStatus, PipelineExecution};
use optimus_core::{Error, ExecutionId, Result};
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};

#[derive(Default)]
struct StoreInner {
    executions: HashMap<ExecutionId, PipelineExecution>,
    /// Creation order.
    order: Vec<ExecutionId>,
}

/// In-memory record of every execution.
///
/// Executions are only ever mutated through [`ExecutionStore::update`], which
/// hands the closure exclusive access for the duration of one transition.
#[derive(Default)]
pub struct ExecutionStore {
    inner: RwLock<StoreInner>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, execution: PipelineExecution) {
        let mut inner = self.inner.write().await;
        inner.order.push(execution.id);
        inner.executions.insert(execution.id, execution);
    }

    pub async fn get(&self, id: ExecutionId) -> Option<PipelineExecution> {
        self.inner.read().await.executions.get(&id).cloned()
    }

    /// Apply one state machine step to an execution.
    pub async fn update<R>(
        &self,
        id: ExecutionId,
        f: impl FnOnce(&mut PipelineExecution) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.inner.write().await;
        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("execution {}", id)))?;
        f(execution)
    }

    /// Executions of one pipeline, newest first.
    pub async fn list(&self, pipeline: &str) -> Vec<PipelineExecution> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.executions.get(id))
            .filter(|e| e.pipeline == pipeline)
            .cloned()
            .collect()
    }

    /// Every execution, newest first.
    pub async fn list_all(&self) -> Vec<PipelineExecution> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.executions.get(id))
            .cloned()
            .collect()
    }

    /// Status of the newest execution of a pipeline.
    pub async fn latest_status(&self, pipeline: &str) -> Option<ExecutionStatus> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.executions.get(id))
            .find(|e| e.pipeline == pipeline)
            .map(|e| e.status)
    }
}

/// FIFO queue of executions waiting for one pipeline's worker.
#[derive(Clone)]
pub struct ExecutionQueue {
    pipeline: String,
    tx: mpsc::UnboundedSender<ExecutionId>,
}

impl ExecutionQueue {
    /// Create a queue and the receiving end its worker drains.
    pub fn new(pipeline: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ExecutionId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pipeline: pipeline.into(),
                tx,
            },
            rx,
        )
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Queue an execution behind everything already waiting.
    pub fn enqueue(&self, id: ExecutionId) -> Result<()> {
        self.tx.send(id).map_err(|_| {
            Error::Conflict(format!("pipeline '{}' is not accepting executions", self.pipeline))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimus_core::pipeline::TriggerInfo;

    #[tokio::test]
    async fn test_store_lists_newest_first() {
        let store = ExecutionStore::new();
        let first = PipelineExecution::new("api", TriggerInfo::manual(None));
        let second = PipelineExecution::new("api", TriggerInfo::manual(None));
        let other = PipelineExecution::new("web", TriggerInfo::manual(None));
        let (first_id, second_id) = (first.id, second.id);
        store.insert(first).await;
        store.insert(other).await;
        store.insert(second).await;

        let api: Vec<ExecutionId> = store.list("api").await.iter().map(|e| e.id).collect();
        assert_eq!(api, vec![second_id, first_id]);
        assert_eq!(store.list_all().await.len(), 3);
        assert_eq!(store.latest_status("web").await, Some(ExecutionStatus::Queued));
        assert_eq!(store.latest_status("missing").await, None);
    }

    #[tokio::test]
    async fn test_update_applies_transition() {
        let store = ExecutionStore::new();
        let exec = PipelineExecution::new("api", TriggerInfo::manual(None));
        let id = exec.id;
        store.insert(exec).await;

        store.update(id, |e| e.start()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, ExecutionStatus::Running);

        // Rejected transitions leave the record alone.
        assert!(store.update(id, |e| e.start()).await.is_err());
        assert!(matches!(
            store.update(ExecutionId::new(), |e| e.start()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_closes() {
        let (queue, mut rx) = ExecutionQueue::new("api");
        let ids: Vec<ExecutionId> = (0..3).map(|_| ExecutionId::new()).collect();
        for id in &ids {
            queue.enqueue(*id).unwrap();
        }
        for id in &ids {
            assert_eq!(rx.recv().await, Some(*id));
        }

        drop(rx);
        assert!(matches!(queue.enqueue(ExecutionId::new()), Err(Error::Conflict(_))));
    }
}
