//! Services behind the HTTP routes.

pub mod stack;
