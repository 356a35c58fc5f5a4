//! Core domain types and traits for the Optimus provisioning platform.
//!
//! This crate contains:
//! - Runtime identifiers and the shared error type
//! - Resource nodes and the dependency graph resolver
//! - Provider trait and materialization results
//! - Pipeline definitions and the execution state machine
//! - Stage runner trait and artifacts
//! - Stack outputs and secret lookup

pub mod artifact;
pub mod error;
pub mod graph;
pub mod id;
pub mod outputs;
pub mod pipeline;
pub mod provider;
pub mod resource;
pub mod secret;
pub mod stage;

pub use error::{Error, Result};
pub use graph::{DependencyGraph, resolve};
pub use id::{ChannelId, ExecutionId, ProvisionRunId};
pub use resource::{ResourceKind, ResourceNode};
