//! Pipeline scheduling for Optimus.
//!
//! Keeps one serial queue per pipeline, runs executions through the
//! Source → Build → Deploy state machine and rolls back failed deployments.

pub mod local;
pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use local::{EnvSecretStore, LocalStageRunner, MemorySecretStore};
pub use orchestrator::{PipelineEvent, PipelineOrchestrator};
pub use queue::{ExecutionQueue, ExecutionStore};
pub use scheduler::{PipelineScheduler, PipelineSummary};
pub use worker::Worker;
