//! Provisioning for Optimus stacks.
//!
//! Provides:
//! - Bootstrap signal channels and their registry
//! - The provisioning orchestrator
//! - A local in-memory provider

pub mod local;
pub mod orchestrator;
pub mod signal;

pub use local::LocalProvider;
pub use optimus_core::provider::{MaterializedResource, Provider, ValidationWarning};
pub use orchestrator::{
    OrchestratorConfig, ProvisionEvent, ProvisionReport, ProvisioningOrchestrator, TeardownReport,
};
pub use signal::{
    CallbackBody, ChannelSnapshot, ChannelState, Resolution, SignalChannel, SignalPayload,
    SignalRegistry, SignalStatus,
};
