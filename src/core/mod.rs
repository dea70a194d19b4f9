//! Core pipeline: types, configuration, error taxonomy, intent resolution,
//! snapshots, and the orchestrator.

pub mod config;
pub mod error;
pub mod intent;
pub mod orchestrator;
pub mod resolver;
pub mod snapshot;
pub mod types;
