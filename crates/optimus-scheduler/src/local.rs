//! Local stage runner and secret stores.
//!
//! The local runner produces deterministic artifacts without touching any
//! build or deployment service. It backs the server's default backend and
//! the tests.

use async_trait::async_trait;
use optimus_core::artifact::Artifact;
use optimus_core::pipeline::{PipelineDefinition, StageName};
use optimus_core::secret::SecretStore;
use optimus_core::stage::{StageRequest, StageRunner};
use optimus_core::{Error, ExecutionId, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// In-memory stage runner.
pub struct LocalStageRunner {
    secrets: Arc<dyn SecretStore>,
    failing: RwLock<HashSet<(String, StageName)>>,
    rollbacks: RwLock<Vec<(String, ExecutionId)>>,
}

impl LocalStageRunner {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            secrets,
            failing: RwLock::new(HashSet::new()),
            rollbacks: RwLock::new(Vec::new()),
        }
    }

    /// Make `stage` of `pipeline` fail until [`LocalStageRunner::clear_failures`].
    pub async fn fail_stage(&self, pipeline: impl Into<String>, stage: StageName) {
        self.failing.write().await.insert((pipeline.into(), stage));
    }

    pub async fn clear_failures(&self) {
        self.failing.write().await.clear();
    }

    /// Rollbacks performed so far, oldest first.
    pub async fn rollbacks(&self) -> Vec<(String, ExecutionId)> {
        self.rollbacks.read().await.clone()
    }

    fn location(request: &StageRequest, name: &str) -> String {
        match &request.pipeline.artifact_bucket {
            Some(bucket) => format!(
                "s3://{}/{}/{}/{}",
                bucket, request.pipeline.name, request.execution_id, name
            ),
            None => format!("local://{}/{}/{}", request.pipeline.name, request.execution_id, name),
        }
    }
}

#[async_trait]
impl StageRunner for LocalStageRunner {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&self, request: StageRequest) -> Result<Option<Artifact>> {
        let key = (request.pipeline.name.clone(), request.stage);
        if self.failing.read().await.contains(&key) {
            return Err(Error::StageFailed {
                stage: request.stage.to_string(),
                message: format!("{} stage configured to fail", request.stage),
            });
        }

        match request.stage {
            StageName::Source => {
                let source = &request.pipeline.source;
                if let Some(secret) = &source.token_secret {
                    // The token itself is never logged or stored.
                    self.secrets.get(secret).await.map_err(|e| Error::StageFailed {
                        stage: request.stage.to_string(),
                        message: format!("cannot read source token '{}': {}", secret, e),
                    })?;
                }
                let revision = request
                    .trigger
                    .commit
                    .clone()
                    .unwrap_or_else(|| format!("{}-HEAD", source.branch));
                debug!(repository = %source.full_name(), revision = %revision, "Fetched source");
                Ok(Some(
                    Artifact::new("SourceOutput", Self::location(&request, "SourceOutput"))
                        .with_revision(revision),
                ))
            }
            StageName::Build => {
                let input = request.input.as_ref().ok_or_else(|| Error::StageFailed {
                    stage: request.stage.to_string(),
                    message: "no source artifact".to_string(),
                })?;
                debug!(project = %request.pipeline.build_project, "Built artifact");
                let mut artifact =
                    Artifact::new("BuildOutput", Self::location(&request, "BuildOutput"));
                artifact.revision = input.revision.clone();
                Ok(Some(artifact))
            }
            StageName::Deploy => {
                if request.input.is_none() {
                    return Err(Error::StageFailed {
                        stage: request.stage.to_string(),
                        message: "no build artifact".to_string(),
                    });
                }
                info!(
                    pipeline = %request.pipeline.name,
                    target = request.pipeline.deploy.node_id(),
                    "Deployed build output"
                );
                Ok(None)
            }
        }
    }

    async fn rollback(&self, pipeline: &PipelineDefinition, execution_id: ExecutionId) -> Result<()> {
        info!(pipeline = %pipeline.name, execution_id = %execution_id, "Rolled back deployment");
        self.rollbacks
            .write()
            .await
            .push((pipeline.name.clone(), execution_id));
        Ok(())
    }
}

/// Reads secrets from `OPTIMUS_SECRET_<NAME>` environment variables.
///
/// `github-token` is looked up as `OPTIMUS_SECRET_GITHUB_TOKEN`.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn variable_name(name: &str) -> String {
        format!("OPTIMUS_SECRET_{}", name.to_uppercase().replace('-', "_"))
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<String> {
        let var = Self::variable_name(name);
        std::env::var(&var).map_err(|_| Error::NotFound(format!("secret {} ({} not set)", name, var)))
    }
}

/// Fixed secrets held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySecretStore {
    secrets: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {}", name)))
    }
}
