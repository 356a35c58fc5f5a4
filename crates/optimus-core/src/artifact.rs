//! Artifacts handed from one pipeline stage to the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An artifact produced by a stage (e.g. `SourceOutput`, `BuildOutput`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name.
    pub name: String,
    /// Where the artifact is stored (bucket key, local path, ...).
    pub location: String,
    /// Source revision the artifact was built from, if known.
    pub revision: Option<String>,
    /// When the artifact was produced.
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            revision: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }
}
