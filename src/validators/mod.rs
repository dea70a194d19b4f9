//! Validation pipeline: syntax → security → compliance → cost.
//!
//! Validators are independent and run in the fixed order of
//! [`ValidatorKind`]. A syntax failure stops the chain; everything else is
//! recorded and the aggregate verdict decides whether execution may proceed.

pub mod compliance;
pub mod cost;
pub mod hcl;
pub mod security;
pub mod syntax;

use crate::core::config::ValidationSettings;
use crate::core::types::{
    GeneratedArtifact, InfrastructureRequest, SubVerdict, ValidationVerdict, ValidatorKind,
    VerdictStatus,
};

/// One stage of the validation chain.
pub trait Validator: Send + Sync {
    fn kind(&self) -> ValidatorKind;

    /// Whether a `fail` from this validator blocks execution.
    fn required(&self) -> bool;

    fn validate(&self, artifact: &GeneratedArtifact, request: &InfrastructureRequest) -> SubVerdict;
}

pub struct ValidationPipeline {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    /// Build a pipeline from any validators; they are sorted into canonical order.
    pub fn new(mut validators: Vec<Box<dyn Validator>>) -> Self {
        validators.sort_by_key(|v| v.kind());
        Self { validators }
    }

    /// The four built-in validators configured from settings.
    pub fn from_settings(settings: &ValidationSettings) -> Self {
        Self::new(vec![
            Box::new(syntax::SyntaxValidator),
            Box::new(security::SecurityValidator::new(settings.security_required)),
            Box::new(compliance::ComplianceValidator::new(settings.clone())),
            Box::new(cost::CostValidator::new(settings.clone())),
        ])
    }

    pub fn order(&self) -> Vec<ValidatorKind> {
        self.validators.iter().map(|v| v.kind()).collect()
    }

    pub fn run(&self, artifact: &GeneratedArtifact, request: &InfrastructureRequest) -> ValidationVerdict {
        let mut subs = Vec::with_capacity(self.validators.len());
        let mut short_circuited = false;
        for validator in &self.validators {
            let sub = validator.validate(artifact, request);
            tracing::debug!(
                validator = %sub.validator,
                status = %sub.status,
                findings = sub.findings.len(),
                "validator finished"
            );
            let stop = sub.validator == ValidatorKind::Syntax && sub.status == VerdictStatus::Fail;
            subs.push(sub);
            if stop {
                short_circuited = true;
                break;
            }
        }
        ValidationVerdict::aggregate(subs, short_circuited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::GenerationSettings;
    use crate::core::types::{Finding, RetrievedContext, Severity};
    use crate::generators::test_support::request;
    use crate::generators::GeneratorRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        kind: ValidatorKind,
        severity: Option<Severity>,
        calls: Arc<AtomicUsize>,
    }

    impl Validator for Scripted {
        fn kind(&self) -> ValidatorKind {
            self.kind
        }

        fn required(&self) -> bool {
            true
        }

        fn validate(&self, _: &GeneratedArtifact, _: &InfrastructureRequest) -> SubVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let findings = self
                .severity
                .map(|s| vec![Finding::new("scripted", s, "scripted finding")])
                .unwrap_or_default();
            SubVerdict::from_findings(self.kind, true, findings)
        }
    }

    fn artifact(fields: serde_json::Value) -> (GeneratedArtifact, InfrastructureRequest) {
        let req = request(fields);
        let art = GeneratorRegistry::with_builtin(&GenerationSettings::default())
            .generate(&req, &RetrievedContext::empty())
            .unwrap();
        (art, req)
    }

    #[test]
    fn test_validators_canonical_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scripted = |kind| -> Box<dyn Validator> {
            Box::new(Scripted {
                kind,
                severity: None,
                calls: Arc::clone(&calls),
            })
        };
        let pipeline = ValidationPipeline::new(vec![
            scripted(ValidatorKind::Cost),
            scripted(ValidatorKind::Security),
            scripted(ValidatorKind::Syntax),
            scripted(ValidatorKind::Compliance),
        ]);
        assert_eq!(
            pipeline.order(),
            vec![
                ValidatorKind::Syntax,
                ValidatorKind::Security,
                ValidatorKind::Compliance,
                ValidatorKind::Cost
            ]
        );
        assert_eq!(
            ValidationPipeline::from_settings(&ValidationSettings::default()).order(),
            pipeline.order()
        );
    }

    #[test]
    fn test_validators_syntax_fail_short_circuits() {
        let later = Arc::new(AtomicUsize::new(0));
        let pipeline = ValidationPipeline::new(vec![
            Box::new(Scripted {
                kind: ValidatorKind::Syntax,
                severity: Some(Severity::Critical),
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(Scripted {
                kind: ValidatorKind::Security,
                severity: None,
                calls: Arc::clone(&later),
            }),
        ]);
        let (art, req) = artifact(json!({"kind": "storage", "provider": "aws", "bucket": "b"}));
        let verdict = pipeline.run(&art, &req);
        assert_eq!(verdict.status, VerdictStatus::Fail);
        assert!(verdict.short_circuited);
        assert_eq!(verdict.sub_verdicts.len(), 1);
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_validators_unparsable_hcl_stops_after_syntax() {
        let pipeline = ValidationPipeline::from_settings(&ValidationSettings::default());
        let req = request(json!({"kind": "compute", "provider": "aws", "name": "api"}));
        let broken = "resource \"aws_instance\" \"api\" {\n  ami = \"ami-123\"\n";
        let art = GeneratedArtifact::new(&req, "file", broken.to_string());
        let verdict = pipeline.run(&art, &req);
        assert_eq!(verdict.status, VerdictStatus::Fail);
        assert!(verdict.short_circuited);
        let kinds: Vec<ValidatorKind> = verdict.sub_verdicts.iter().map(|v| v.validator).collect();
        assert_eq!(kinds, vec![ValidatorKind::Syntax]);
        assert!(verdict.syntax_failed());
        assert!(verdict.cost.is_none());
    }

    #[test]
    fn test_validators_generated_storage_passes() {
        let pipeline = ValidationPipeline::from_settings(&ValidationSettings::default());
        let (art, req) = artifact(json!({"kind": "storage", "provider": "aws", "bucket": "logs"}));
        let verdict = pipeline.run(&art, &req);
        assert_eq!(verdict.sub_verdicts.len(), 4);
        assert!(!verdict.short_circuited);
        assert_ne!(verdict.status, VerdictStatus::Fail, "{:?}", verdict);
        assert!(verdict.cost.is_some());
    }

    #[test]
    fn test_validators_unencrypted_bucket_fails_compliance() {
        let pipeline = ValidationPipeline::from_settings(&ValidationSettings::default());
        let (art, req) = artifact(json!({"kind": "storage", "provider": "aws", "encrypted": false}));
        let verdict = pipeline.run(&art, &req);
        assert_eq!(verdict.status, VerdictStatus::Fail);
        assert_eq!(verdict.blocking_validators(), vec![ValidatorKind::Compliance]);
        assert!(!verdict.gate_open());
    }

    #[test]
    fn test_validators_optional_compliance_warns() {
        let settings = ValidationSettings {
            compliance_required: false,
            ..ValidationSettings::default()
        };
        let pipeline = ValidationPipeline::from_settings(&settings);
        let (art, req) = artifact(json!({"kind": "storage", "provider": "aws", "encrypted": false}));
        let verdict = pipeline.run(&art, &req);
        assert_eq!(verdict.status, VerdictStatus::Warn);
        assert!(verdict.gate_open());
    }
}
