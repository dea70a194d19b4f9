//! AutoDevOps: natural-language infrastructure requests resolved, generated,
//! validated, applied and audited.
//!
//! Every run moves through a fixed state machine and leaves a hash-linked
//! audit trail; failed applies roll back to the pre-apply snapshot.

pub mod audit;
pub mod cli;
pub mod collab;
pub mod core;
pub mod engine;
pub mod generators;
pub mod server;
pub mod transport;
pub mod validators;
