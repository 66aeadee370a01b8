//! Operator CLI for the fleet telemetry daemon

pub mod client;
pub mod commands;
pub mod output;
