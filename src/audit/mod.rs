//! Audit ledger, content hashing, and version-control commits.

pub mod commit;
pub mod hasher;
pub mod ledger;
