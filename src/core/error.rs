//! Pipeline error taxonomy.
//!
//! Every failure surfaced by a run is one `PipelineError` variant. Each
//! variant maps to exactly one HTTP status and one process exit code.

use crate::core::types::{ResourceKind, RunState, TargetFormat, ValidatorKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a raw intent could not be resolved into a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ResolutionError {
    #[error("missing required field '{field}'")]
    Missing { field: String },
    #[error("ambiguous field '{field}': candidates {}", .candidates.join(", "))]
    Ambiguous {
        field: String,
        candidates: Vec<String>,
    },
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ResolutionError {
    pub fn field(&self) -> &str {
        match self {
            Self::Missing { field } | Self::Ambiguous { field, .. } | Self::Invalid { field, .. } => {
                field
            }
        }
    }
}

/// No generator is registered for the (kind, format) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("no generator registered for {kind} -> {format}")]
pub struct UnsupportedTargetError {
    pub kind: ResourceKind,
    pub format: TargetFormat,
}

/// A generator could not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Required validators failed and no applicable override was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("validation failed: blocking validators [{}] ({findings} findings)", .blocking.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
pub struct ValidationFailure {
    pub blocking: Vec<ValidatorKind>,
    pub findings: usize,
}

/// Plan phase failed. No change was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct PlanError {
    pub message: String,
}

/// Apply phase failed, either hard or after exhausting transient retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (attempts: {attempts}, transient: {transient})")]
pub struct ApplyError {
    pub message: String,
    pub attempts: u32,
    pub transient: bool,
}

/// Post-apply state does not match the artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct VerificationError {
    pub message: String,
}

/// Rollback did not restore the prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RollbackError {
    pub message: String,
}

/// The audit ledger could not durably record an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct PersistenceError {
    pub message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Any error that stops or fails a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PipelineError {
    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("unsupported target: {0}")]
    UnsupportedTarget(#[from] UnsupportedTargetError),
    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),
    #[error("{0}")]
    ValidationFailure(#[from] ValidationFailure),
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),
    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),
    #[error("rollback error: {0}")]
    Rollback(#[from] RollbackError),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("run cancelled before {stage}")]
    Cancelled { stage: RunState },
}

/// Discriminant of [`PipelineError`], used for status/exit-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Resolution,
    UnsupportedTarget,
    Generation,
    ValidationFailure,
    Plan,
    Apply,
    Verification,
    Rollback,
    Persistence,
    Cancelled,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        Self::Resolution,
        Self::UnsupportedTarget,
        Self::Generation,
        Self::ValidationFailure,
        Self::Plan,
        Self::Apply,
        Self::Verification,
        Self::Rollback,
        Self::Persistence,
        Self::Cancelled,
    ];

    /// HTTP status code for the API surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Resolution => 422,
            Self::UnsupportedTarget => 501,
            Self::Generation => 500,
            Self::ValidationFailure => 409,
            Self::Plan => 424,
            Self::Apply => 502,
            Self::Verification => 412,
            Self::Rollback => 503,
            Self::Persistence => 507,
            Self::Cancelled => 499,
        }
    }

    /// Process exit code for the CLI surface. 0 is success, 1 is a usage or
    /// configuration error outside the pipeline.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Resolution => 2,
            Self::UnsupportedTarget => 3,
            Self::Generation => 4,
            Self::ValidationFailure => 5,
            Self::Plan => 6,
            Self::Apply => 7,
            Self::Verification => 8,
            Self::Rollback => 9,
            Self::Persistence => 10,
            Self::Cancelled => 11,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Resolution => "resolution_error",
            Self::UnsupportedTarget => "unsupported_target_error",
            Self::Generation => "generation_error",
            Self::ValidationFailure => "validation_failure",
            Self::Plan => "plan_error",
            Self::Apply => "apply_error",
            Self::Verification => "verification_error",
            Self::Rollback => "rollback_error",
            Self::Persistence => "persistence_error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::Resolution,
            Self::UnsupportedTarget(_) => ErrorKind::UnsupportedTarget,
            Self::Generation(_) => ErrorKind::Generation,
            Self::ValidationFailure(_) => ErrorKind::ValidationFailure,
            Self::Plan(_) => ErrorKind::Plan,
            Self::Apply(_) => ErrorKind::Apply,
            Self::Verification(_) => ErrorKind::Verification,
            Self::Rollback(_) => ErrorKind::Rollback,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_error_codes_are_distinct() {
        let statuses: HashSet<u16> = ErrorKind::ALL.iter().map(|k| k.http_status()).collect();
        let exits: HashSet<i32> = ErrorKind::ALL.iter().map(|k| k.exit_code()).collect();
        assert_eq!(statuses.len(), ErrorKind::ALL.len());
        assert_eq!(exits.len(), ErrorKind::ALL.len());
        assert!(exits.iter().all(|c| *c > 1));
        assert!(statuses.iter().all(|s| (400..600).contains(s)));
    }

    #[test]
    fn test_error_kind_mapping() {
        let e: PipelineError = ResolutionError::Missing {
            field: "provider".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Resolution);
        assert_eq!(e.http_status(), 422);
        assert_eq!(e.exit_code(), 2);

        let e: PipelineError = ValidationFailure {
            blocking: vec![ValidatorKind::Compliance],
            findings: 1,
        }
        .into();
        assert_eq!(e.http_status(), 409);
        assert!(e.to_string().contains("compliance"));
    }

    #[test]
    fn test_error_display() {
        let e = ResolutionError::Ambiguous {
            field: "kind".into(),
            candidates: vec!["compute".into(), "storage".into()],
        };
        assert_eq!(
            e.to_string(),
            "ambiguous field 'kind': candidates compute, storage"
        );
        assert_eq!(e.field(), "kind");
        let e: PipelineError = UnsupportedTargetError {
            kind: ResourceKind::Pipeline,
            format: TargetFormat::Terraform,
        }
        .into();
        assert_eq!(
            e.to_string(),
            "unsupported target: no generator registered for pipeline -> terraform"
        );
    }

    #[test]
    fn test_error_serde_roundtrip() {
        let e = PipelineError::Apply(ApplyError {
            message: "rate limited".into(),
            attempts: 4,
            transient: true,
        });
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"kind\":\"apply\""));
        let back: PipelineError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);

        let e = PipelineError::Cancelled {
            stage: RunState::Executing,
        };
        let back: PipelineError = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(back, e);
    }
}
