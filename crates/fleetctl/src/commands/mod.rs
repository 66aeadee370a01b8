//! CLI command implementations

pub mod alerts;
pub mod health;
pub mod machines;
