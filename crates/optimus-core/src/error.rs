//! Error types for Optimus.

use thiserror::Error;

use crate::provider::PartialProvision;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("duplicate resource id: {0}")]
    DuplicateNode(String),

    #[error("resource '{node}' depends on unknown resource '{missing}'")]
    UnknownDependency { node: String, missing: String },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("signal channel {0} already resolved")]
    AlreadyResolved(String),

    #[error("upstream signal '{signal}' ended in {outcome}")]
    UpstreamSignal { signal: String, outcome: String },

    #[error("{0}")]
    PartialProvision(Box<PartialProvision>),

    #[error("materialization of '{node}' failed: {message}")]
    MaterializationFailed { node: String, message: String },

    #[error("stage {stage} failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error was raised while building the dependency graph.
    /// Graph errors are reported before anything is materialized and are never retried.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateNode(_) | Error::UnknownDependency { .. } | Error::Cycle { .. }
        )
    }
}

impl From<PartialProvision> for Error {
    fn from(partial: PartialProvision) -> Self {
        Error::PartialProvision(Box::new(partial))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
