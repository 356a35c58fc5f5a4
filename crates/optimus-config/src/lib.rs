//! KDL configuration parsing for Optimus.
//!
//! This crate handles parsing of:
//! - Stack documents (optimus.kdl)
//! - Server configuration
//! - Variable interpolation

pub mod error;
mod helpers;
pub mod stack;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use stack::{StackDefinition, load_stack, parse_stack};
pub use system::{ServerConfig, SystemConfig, parse_system_config};
pub use variables::{StackContext, VariableContext, VariableContextBuilder};
