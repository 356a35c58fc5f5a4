//! Stage runner trait.
//!
//! Stage runners perform the work behind each pipeline stage: fetching the
//! source revision, running the build project, and deploying the build output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::pipeline::{PipelineDefinition, StageName, TriggerInfo};
use crate::{ExecutionId, Result};

/// Everything a runner needs to execute one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequest {
    pub pipeline: PipelineDefinition,
    pub execution_id: ExecutionId,
    pub stage: StageName,
    /// Output of the previous stage. Always `None` for `Source`.
    pub input: Option<Artifact>,
    pub trigger: TriggerInfo,
}

/// Trait for stage runners.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Run a stage, returning the artifact it produced (if any).
    async fn run(&self, request: StageRequest) -> Result<Option<Artifact>>;

    /// Roll back the deployment made by a failed execution.
    async fn rollback(&self, pipeline: &PipelineDefinition, execution_id: ExecutionId)
    -> Result<()>;
}
