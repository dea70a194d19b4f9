//! External collaborators reached through request/response contracts.

pub mod llm;
pub mod retrieval;
