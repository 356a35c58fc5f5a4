//! Secret lookup abstraction.
//!
//! How secrets are stored is up to the backend; the pipeline only needs to
//! resolve a named secret (such as the source repository token) at run time.

use async_trait::async_trait;

use crate::Result;

/// Trait for secret backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a secret value by name.
    async fn get(&self, name: &str) -> Result<String>;
}
