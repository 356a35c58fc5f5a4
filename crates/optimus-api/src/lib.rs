//! API server for Optimus.
//!
//! Serves the bootstrap signal callback, GitHub webhooks and the stack and
//! pipeline endpoints.

pub mod error;
pub mod routes;
pub mod services;
pub mod state;

pub use state::AppState;
