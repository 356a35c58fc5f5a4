//! Pipeline definitions and the execution state machine.
//!
//! Every pipeline has the same three stages: `Source`, `Build`, `Deploy`.
//! An execution walks them in order, handing each stage's output artifact to
//! the next. A failed `Deploy` is rolled back when the deployment target's
//! rollback policy asks for it; every other failure is final until the
//! pipeline is triggered again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::{Error, ExecutionId, Result};

/// A CI/CD pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (e.g., "api").
    pub name: String,
    /// Resource node that materializes this pipeline.
    pub node_id: String,
    /// Where source revisions come from.
    pub source: SourceConfig,
    /// Build project node the build stage runs.
    pub build_project: String,
    /// Where the build output is deployed.
    pub deploy: DeployTarget,
    /// Bucket node holding pipeline artifacts.
    pub artifact_bucket: Option<String>,
    /// Start one execution as soon as the pipeline is activated.
    pub restart_on_update: bool,
}

impl PipelineDefinition {
    /// Whether a push to `repository`/`branch` should trigger this pipeline.
    pub fn matches_push(&self, repository: &str, branch: &str) -> bool {
        self.source.full_name().eq_ignore_ascii_case(repository)
            && matches_branch_pattern(branch, &self.source.branch)
    }
}

/// Source repository configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub owner: String,
    pub repo: String,
    /// Branch or glob pattern (`release/*`).
    pub branch: String,
    /// Name of the secret holding the repository token.
    pub token_secret: Option<String>,
}

impl SourceConfig {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Deployment target of the `Deploy` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployTarget {
    /// Deploy to the instances of a server deployment group.
    ServerGroup {
        group: String,
        rollback: RollbackPolicy,
    },
    /// Sync the build output into a bucket.
    Bucket { bucket: String, extract: bool },
}

impl DeployTarget {
    pub fn rollback_policy(&self) -> RollbackPolicy {
        match self {
            DeployTarget::ServerGroup { rollback, .. } => *rollback,
            DeployTarget::Bucket { .. } => RollbackPolicy::default(),
        }
    }

    /// Resource node the deploy stage writes to.
    pub fn node_id(&self) -> &str {
        match self {
            DeployTarget::ServerGroup { group, .. } => group,
            DeployTarget::Bucket { bucket, .. } => bucket,
        }
    }
}

/// When a failed deployment is rolled back automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPolicy {
    pub failed_deployment: bool,
}

/// The fixed stages of every pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    Source,
    Build,
    Deploy,
}

impl StageName {
    pub const ALL: [StageName; 3] = [StageName::Source, StageName::Build, StageName::Deploy];

    /// Name of the artifact this stage hands forward.
    pub fn output_artifact_name(&self) -> Option<&'static str> {
        match self {
            StageName::Source => Some("SourceOutput"),
            StageName::Build => Some("BuildOutput"),
            StageName::Deploy => None,
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageName::Source => write!(f, "Source"),
            StageName::Build => write!(f, "Build"),
            StageName::Deploy => write!(f, "Deploy"),
        }
    }
}

/// Information about what triggered an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub kind: TriggerKind,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub actor: Option<String>,
}

impl TriggerInfo {
    pub fn manual(branch: Option<String>) -> Self {
        Self {
            kind: TriggerKind::Manual,
            branch,
            commit: None,
            actor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Source repository push delivered by webhook.
    Push,
    /// Started through the API or CLI.
    Manual,
    /// Started when the pipeline was (re)activated by provisioning.
    Activation,
}

/// Result of a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageResult {
    Pending,
    Succeeded,
    Failed { message: String },
}

/// One stage of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: StageName,
    pub input_artifact: Option<Artifact>,
    pub output_artifact: Option<Artifact>,
    pub result: StageResult,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Stage {
    fn new(name: StageName) -> Self {
        Self {
            name,
            input_artifact: None,
            output_artifact: None,
            result: StageResult::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn has_started(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Overall execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting behind another execution of the same pipeline.
    Queued,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "queued"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// Details of the stage failure that stopped an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageName,
    pub message: String,
}

/// What a state machine step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved to the stage at this index.
    Advanced(usize),
    Succeeded,
    /// The execution failed; `rollback_required` means a rollback must run next.
    Failed { rollback_required: bool },
    RolledBack,
}

/// A single run of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: ExecutionId,
    pub pipeline: String,
    pub trigger: TriggerInfo,
    pub stages: Vec<Stage>,
    pub current_stage_index: usize,
    pub status: ExecutionStatus,
    pub failure: Option<StageFailure>,
    /// Set while a failed deploy waits for its rollback.
    pub rollback_pending: bool,
    /// Why a queued execution was dropped before it started.
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    /// Create a queued execution with all stages pending.
    pub fn new(pipeline: impl Into<String>, trigger: TriggerInfo) -> Self {
        Self {
            id: ExecutionId::new(),
            pipeline: pipeline.into(),
            trigger,
            stages: StageName::ALL.into_iter().map(Stage::new).collect(),
            current_stage_index: 0,
            status: ExecutionStatus::Queued,
            failure: None,
            rollback_pending: false,
            cancel_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Terminal executions never change again.
    ///
    /// `Failed` is terminal unless a rollback is still owed.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            ExecutionStatus::Succeeded | ExecutionStatus::RolledBack => true,
            ExecutionStatus::Failed => !self.rollback_pending,
            ExecutionStatus::Queued | ExecutionStatus::Running => false,
        }
    }

    pub fn current_stage(&self) -> Option<&Stage> {
        match self.status {
            ExecutionStatus::Running => self.stages.get(self.current_stage_index),
            _ => None,
        }
    }

    /// `Queued` → `Running(0)`.
    pub fn start(&mut self) -> Result<()> {
        if self.status != ExecutionStatus::Queued {
            return Err(self.invalid("start"));
        }
        self.status = ExecutionStatus::Running;
        self.current_stage_index = 0;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `Queued` → `Failed` without running any stage.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.status != ExecutionStatus::Queued {
            return Err(self.invalid("cancel"));
        }
        self.status = ExecutionStatus::Failed;
        self.cancel_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the current stage as started and return its name and input.
    ///
    /// Refuses to start a stage whose predecessor has not succeeded.
    pub fn begin_stage(&mut self) -> Result<(StageName, Option<Artifact>)> {
        if self.status != ExecutionStatus::Running {
            return Err(self.invalid("begin stage"));
        }
        let i = self.current_stage_index;
        if i > 0 && self.stages[i - 1].result != StageResult::Succeeded {
            return Err(Error::InvalidTransition(format!(
                "stage {} cannot start before {} succeeded",
                self.stages[i].name,
                self.stages[i - 1].name
            )));
        }
        let stage = &mut self.stages[i];
        if stage.has_started() {
            return Err(Error::InvalidTransition(format!(
                "stage {} already started",
                stage.name
            )));
        }
        stage.started_at = Some(Utc::now());
        Ok((stage.name, stage.input_artifact.clone()))
    }

    /// Record success of the current stage.
    ///
    /// `Running(i)` → `Running(i+1)`, or `Succeeded` after the last stage.
    pub fn record_success(&mut self, output: Option<Artifact>) -> Result<Transition> {
        let i = self.running_stage("record success")?;
        let now = Utc::now();
        let stage = &mut self.stages[i];
        stage.result = StageResult::Succeeded;
        stage.finished_at = Some(now);
        // Deploy hands nothing forward.
        if stage.name.output_artifact_name().is_some() {
            stage.output_artifact = output;
        }
        let forwarded = stage.output_artifact.clone();

        if i + 1 < self.stages.len() {
            self.current_stage_index = i + 1;
            self.stages[i + 1].input_artifact = forwarded;
            Ok(Transition::Advanced(i + 1))
        } else {
            self.status = ExecutionStatus::Succeeded;
            self.finished_at = Some(now);
            Ok(Transition::Succeeded)
        }
    }

    /// Record failure of the current stage. `Running(i)` → `Failed`.
    ///
    /// A rollback is owed when the failing stage is `Deploy` and the policy
    /// covers failed deployments.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        policy: RollbackPolicy,
    ) -> Result<Transition> {
        let i = self.running_stage("record failure")?;
        let message = message.into();
        let now = Utc::now();
        let stage = &mut self.stages[i];
        stage.result = StageResult::Failed {
            message: message.clone(),
        };
        stage.finished_at = Some(now);

        let rollback_required = stage.name == StageName::Deploy && policy.failed_deployment;
        self.failure = Some(StageFailure {
            stage: stage.name,
            message,
        });
        self.status = ExecutionStatus::Failed;
        self.rollback_pending = rollback_required;
        if !rollback_required {
            self.finished_at = Some(now);
        }
        Ok(Transition::Failed { rollback_required })
    }

    /// `Failed` → `RolledBack`, once the owed rollback completed.
    pub fn record_rolled_back(&mut self) -> Result<Transition> {
        if self.status != ExecutionStatus::Failed || !self.rollback_pending {
            return Err(self.invalid("roll back"));
        }
        self.status = ExecutionStatus::RolledBack;
        self.rollback_pending = false;
        self.finished_at = Some(Utc::now());
        Ok(Transition::RolledBack)
    }

    /// The owed rollback could not run; the execution stays `Failed`.
    pub fn abandon_rollback(&mut self) {
        if self.status == ExecutionStatus::Failed && self.rollback_pending {
            self.rollback_pending = false;
            self.finished_at = Some(Utc::now());
        }
    }

    fn running_stage(&self, action: &str) -> Result<usize> {
        let i = self.current_stage_index;
        if self.status != ExecutionStatus::Running || !self.stages[i].has_started() {
            return Err(self.invalid(action));
        }
        Ok(i)
    }

    fn invalid(&self, action: &str) -> Error {
        Error::InvalidTransition(format!(
            "cannot {} execution {} in state {}",
            action, self.id, self.status
        ))
    }
}

/// Check if a branch name matches a pattern.
/// Supports simple glob patterns with '*' wildcard.
pub fn matches_branch_pattern(branch: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return branch == pattern;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 2 {
        let (prefix, suffix) = (parts[0], parts[1]);
        branch.len() >= prefix.len() + suffix.len()
            && branch.starts_with(prefix)
            && branch.ends_with(suffix)
    } else {
        // Complex glob - fall back to exact match
        branch == pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollback_on() -> RollbackPolicy {
        RollbackPolicy {
            failed_deployment: true,
        }
    }

    fn running() -> PipelineExecution {
        let mut exec = PipelineExecution::new("api", TriggerInfo::manual(Some("main".into())));
        exec.start().unwrap();
        exec
    }

    #[test]
    fn test_happy_path_hands_artifacts_forward() {
        let mut exec = running();

        let (name, input) = exec.begin_stage().unwrap();
        assert_eq!(name, StageName::Source);
        assert!(input.is_none());
        let source = Artifact::new("SourceOutput", "artifacts/source.zip").with_revision("abc123");
        assert_eq!(
            exec.record_success(Some(source.clone())).unwrap(),
            Transition::Advanced(1)
        );

        let (name, input) = exec.begin_stage().unwrap();
        assert_eq!(name, StageName::Build);
        assert_eq!(input, Some(source));
        let build = Artifact::new("BuildOutput", "artifacts/build.zip");
        assert_eq!(
            exec.record_success(Some(build.clone())).unwrap(),
            Transition::Advanced(2)
        );

        let (name, input) = exec.begin_stage().unwrap();
        assert_eq!(name, StageName::Deploy);
        assert_eq!(input, Some(build));
        assert_eq!(
            exec.record_success(Some(Artifact::new("ignored", "x"))).unwrap(),
            Transition::Succeeded
        );

        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert!(exec.is_terminal());
        assert!(exec.stages[2].output_artifact.is_none());
        assert!(exec.finished_at.is_some());
    }

    #[test]
    fn test_deploy_failure_with_rollback_ends_rolled_back() {
        let mut exec = running();
        for _ in 0..2 {
            exec.begin_stage().unwrap();
            exec.record_success(Some(Artifact::new("out", "loc"))).unwrap();
        }
        exec.begin_stage().unwrap();

        let transition = exec.record_failure("health check failed", rollback_on()).unwrap();
        assert_eq!(
            transition,
            Transition::Failed {
                rollback_required: true
            }
        );
        assert!(!exec.is_terminal());

        assert_eq!(exec.record_rolled_back().unwrap(), Transition::RolledBack);
        assert_eq!(exec.status, ExecutionStatus::RolledBack);
        assert!(exec.is_terminal());
        assert_eq!(exec.failure.as_ref().unwrap().stage, StageName::Deploy);
    }

    #[test]
    fn test_deploy_failure_without_policy_is_terminal_failure() {
        let mut exec = running();
        for _ in 0..2 {
            exec.begin_stage().unwrap();
            exec.record_success(None).unwrap();
        }
        exec.begin_stage().unwrap();

        let transition = exec
            .record_failure("sync failed", RollbackPolicy::default())
            .unwrap();
        assert_eq!(
            transition,
            Transition::Failed {
                rollback_required: false
            }
        );
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.is_terminal());
        assert!(exec.record_rolled_back().is_err());
    }

    #[test]
    fn test_build_failure_never_starts_deploy() {
        let mut exec = running();
        exec.begin_stage().unwrap();
        exec.record_success(None).unwrap();
        exec.begin_stage().unwrap();

        // Rollback policy only applies to deploy failures.
        let transition = exec.record_failure("compile error", rollback_on()).unwrap();
        assert_eq!(
            transition,
            Transition::Failed {
                rollback_required: false
            }
        );
        assert!(exec.is_terminal());
        assert!(exec.begin_stage().is_err());
        assert!(!exec.stages[2].has_started());
        assert_eq!(exec.stages[2].result, StageResult::Pending);
    }

    #[test]
    fn test_stage_cannot_start_before_predecessor_succeeded() {
        let mut exec = running();
        exec.begin_stage().unwrap();
        // Source still running, forcing the index forward must not let Build start.
        exec.current_stage_index = 1;
        assert!(matches!(
            exec.begin_stage(),
            Err(Error::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_queued_execution_rejects_stage_work() {
        let mut exec = PipelineExecution::new("web", TriggerInfo::manual(None));
        assert_eq!(exec.status, ExecutionStatus::Queued);
        assert!(exec.current_stage().is_none());
        assert!(exec.begin_stage().is_err());
        assert!(exec.record_success(None).is_err());
        exec.start().unwrap();
        assert!(exec.start().is_err());
        assert!(exec.cancel("too late").is_err());
    }

    #[test]
    fn test_cancel_queued_execution() {
        let mut exec = PipelineExecution::new("api", TriggerInfo::manual(None));
        exec.cancel("pipeline deactivated").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.is_terminal());
        assert!(exec.stages.iter().all(|s| !s.has_started()));
        assert_eq!(exec.cancel_reason.as_deref(), Some("pipeline deactivated"));
    }

    #[test]
    fn test_abandoned_rollback_leaves_failed() {
        let mut exec = running();
        for _ in 0..2 {
            exec.begin_stage().unwrap();
            exec.record_success(None).unwrap();
        }
        exec.begin_stage().unwrap();
        exec.record_failure("boom", rollback_on()).unwrap();
        exec.abandon_rollback();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.is_terminal());
    }

    #[test]
    fn test_branch_patterns() {
        assert!(matches_branch_pattern("main", "main"));
        assert!(!matches_branch_pattern("main", "master"));
        assert!(matches_branch_pattern("release/1.2", "release/*"));
        assert!(matches_branch_pattern("feature-x-hotfix", "*-hotfix"));
        assert!(matches_branch_pattern("anything", "*"));
        assert!(!matches_branch_pattern("rel", "release/*"));
    }

    #[test]
    fn test_pipeline_matches_push() {
        let pipeline = PipelineDefinition {
            name: "api".to_string(),
            node_id: "api-pipeline".to_string(),
            source: SourceConfig {
                owner: "mzienert".to_string(),
                repo: "optimus-api".to_string(),
                branch: "master".to_string(),
                token_secret: None,
            },
            build_project: "api-build".to_string(),
            deploy: DeployTarget::ServerGroup {
                group: "deployment-group".to_string(),
                rollback: rollback_on(),
            },
            artifact_bucket: None,
            restart_on_update: false,
        };

        assert!(pipeline.matches_push("mzienert/optimus-api", "master"));
        assert!(pipeline.matches_push("MZIENERT/Optimus-API", "master"));
        assert!(!pipeline.matches_push("mzienert/optimus-api", "main"));
        assert!(!pipeline.matches_push("mzienert/optimus-ui", "master"));
        assert!(pipeline.deploy.rollback_policy().failed_deployment);
        assert_eq!(pipeline.deploy.node_id(), "deployment-group");
    }
}
