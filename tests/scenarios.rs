//! End-to-end runs through the public API with scripted tool output.

use autodevops::audit::ledger::{chain_is_contiguous, AuditLedger, JsonlLedger, MemoryLedger};
use autodevops::core::config::PipelineConfig;
use autodevops::core::error::ErrorKind;
use autodevops::core::orchestrator::Orchestrator;
use autodevops::core::types::{
    AuditOutcome, ExitClass, PipelineRun, RawIntent, RunState, Severity, Submission, ValidatorKind,
    VerdictStatus,
};
use autodevops::transport::mock::MockRunner;
use autodevops::transport::ExecOutput;
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    _dir: tempfile::TempDir,
    runner: Arc<MockRunner>,
    orchestrator: Orchestrator,
}

fn harness(runner: MockRunner) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::rooted_at(dir.path());
    config.execution.base_backoff_ms = 100;
    config.execution.max_backoff_ms = 1_000;
    let runner = Arc::new(runner);
    let orchestrator = Orchestrator::new(config, runner.clone(), Arc::new(MemoryLedger::new()));
    Harness {
        _dir: dir,
        runner,
        orchestrator,
    }
}

fn submission(fields: Value) -> Submission {
    let mut raw = RawIntent::new();
    if let Value::Object(map) = fields {
        for (k, v) in map {
            raw = raw.with(&k, v);
        }
    }
    Submission::from_fields(raw)
}

fn stages(run: &PipelineRun) -> Vec<(RunState, Option<RunState>)> {
    run.audit.iter().map(|e| (e.stage, e.next)).collect()
}

// ============================================================================
// Scenario A: AWS web tier behind a load balancer
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_aws_web_tier_applied() {
    let h = harness(MockRunner::new());
    let run = h
        .orchestrator
        .run(submission(json!({
            "kind": "compute",
            "provider": "aws",
            "instances": 3,
            "hasLoadBalancer": true
        })))
        .await;

    assert_eq!(run.state, RunState::Applied, "{:?}", run.error());
    let artifact = run.artifact.as_ref().unwrap();
    assert!(artifact.content().contains("resource \"aws_lb\""));
    assert!(artifact.content().contains("resource \"aws_autoscaling_group\""));
    assert!(artifact.content().contains("desired_capacity    = 3"));
    assert_ne!(run.verdict.as_ref().unwrap().status, VerdictStatus::Fail);

    assert_eq!(
        stages(&run),
        vec![
            (RunState::Resolving, Some(RunState::Generating)),
            (RunState::Generating, Some(RunState::Validating)),
            (RunState::Validating, Some(RunState::Executing)),
            (RunState::Executing, Some(RunState::Applied)),
        ]
    );
    assert!(chain_is_contiguous(&run.audit));
    assert_eq!(h.runner.count("terraform apply"), 1);
    assert_eq!(h.runner.count("-detailed-exitcode"), 1);
}

// ============================================================================
// Scenario B: Kubernetes deployment without resource limits
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_kubernetes_warning_still_applies() {
    let h = harness(MockRunner::new());
    let run = h
        .orchestrator
        .run(submission(json!({
            "kind": "compute",
            "provider": "k8s",
            "name": "web",
            "replicas": 5,
            "servicePort": 80
        })))
        .await;

    assert_eq!(run.state, RunState::Applied, "{:?}", run.error());
    let content = run.artifact.as_ref().unwrap().content();
    let docs: Vec<serde_yaml_ng::Value> = content
        .split("---\n")
        .filter(|d| !d.trim().is_empty())
        .map(|d| serde_yaml_ng::from_str(d).unwrap())
        .collect();
    let deployment = docs.iter().find(|d| d["kind"] == "Deployment").unwrap();
    assert_eq!(deployment["spec"]["replicas"].as_i64(), Some(5));
    let service = docs.iter().find(|d| d["kind"] == "Service").unwrap();
    assert_eq!(service["spec"]["ports"][0]["port"].as_i64(), Some(80));

    let verdict = run.verdict.as_ref().unwrap();
    assert_ne!(verdict.status, VerdictStatus::Fail);
    let security = verdict.sub_verdict(ValidatorKind::Security).unwrap();
    assert!(security
        .findings
        .iter()
        .any(|f| f.rule == "missing-limits" && f.severity == Severity::Medium));
    assert!(h.runner.count("kubectl apply") >= 1);
}

// ============================================================================
// Scenario C: unencrypted storage fails compliance
// ============================================================================

#[tokio::test]
async fn test_scenario_unencrypted_bucket_halts_at_validating() {
    let h = harness(MockRunner::new());
    let run = h
        .orchestrator
        .run(submission(json!({
            "kind": "storage",
            "provider": "aws",
            "name": "audit-logs",
            "encrypted": false
        })))
        .await;

    assert_eq!(run.state, RunState::Validating);
    assert_eq!(run.error().unwrap().kind(), ErrorKind::ValidationFailure);
    let verdict = run.verdict.as_ref().unwrap();
    assert_eq!(verdict.status, VerdictStatus::Fail);
    assert!(verdict.blocking_validators().contains(&ValidatorKind::Compliance));
    assert!(h.runner.commands().is_empty());

    let last = run.audit.last().unwrap();
    assert_eq!(last.stage, RunState::Validating);
    assert_eq!(last.next, None);
    assert!(chain_is_contiguous(&run.audit));
    assert!(run.execution.is_none());
}

// ============================================================================
// Docker Compose stack on a single host
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_compose_stack_applied() {
    let runner = MockRunner::new().on(
        "{{.Service}}",
        vec![ExecOutput::ok("web running\nweb-proxy running\n")],
    );
    let h = harness(runner);
    let run = h
        .orchestrator
        .run(submission(json!({
            "kind": "compute",
            "provider": "on-prem",
            "format": "docker",
            "name": "web",
            "replicas": 2,
            "hasLoadBalancer": true
        })))
        .await;

    assert_eq!(run.state, RunState::Applied, "{:?}", run.error());
    let content = run.artifact.as_ref().unwrap().content();
    let compose: serde_yaml_ng::Value = serde_yaml_ng::from_str(content).unwrap();
    assert_eq!(compose["services"]["web"]["deploy"]["replicas"].as_i64(), Some(2));
    assert!(compose["services"]["web-proxy"].is_mapping());
    assert_ne!(run.verdict.as_ref().unwrap().status, VerdictStatus::Fail);
    assert_eq!(h.runner.count("config --quiet"), 1);
    assert_eq!(h.runner.count("docker compose -f docker-compose.yml up"), 1);
}

// ============================================================================
// Execution properties
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_apply_retried_with_backoff() {
    let runner = MockRunner::new().on(
        "terraform apply",
        vec![
            ExecOutput::failed(1, "Error: RequestLimitExceeded"),
            ExecOutput::failed(1, "Error: RequestLimitExceeded"),
            ExecOutput::ok("Apply complete! Resources: 4 added"),
        ],
    );
    let h = harness(runner);
    let run = h
        .orchestrator
        .run(submission(json!({"kind": "compute", "provider": "aws", "name": "api", "instances": 2})))
        .await;

    assert_eq!(run.state, RunState::Applied, "{:?}", run.error());
    let record = run.execution.as_ref().unwrap();
    let classes: Vec<ExitClass> = record.attempts.iter().map(|a| a.class).collect();
    assert_eq!(classes, vec![ExitClass::Transient, ExitClass::Transient, ExitClass::Success]);
    let backoffs: Vec<u64> = record.attempts.iter().map(|a| a.backoff_ms).collect();
    assert_eq!(backoffs, vec![0, 100, 200]);
    match &run.audit[3].outcome {
        AuditOutcome::Executed { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_drift_after_apply_rolls_back_to_prior_state() {
    let h = harness(MockRunner::new());
    let fields = json!({"kind": "compute", "provider": "aws", "name": "api", "instances": 1});
    let first = h.orchestrator.run(submission(fields.clone())).await;
    assert_eq!(first.state, RunState::Applied);

    let drifting = Orchestrator::new(
        h.orchestrator.config().clone(),
        Arc::new(MockRunner::new().on("-detailed-exitcode", vec![ExecOutput::failed(2, "1 to change")])),
        h.orchestrator.ledger().clone(),
    );
    let mut bigger = fields;
    bigger["instances"] = json!(4);
    let run = drifting.run(submission(bigger)).await;

    assert_eq!(run.state, RunState::RolledBack);
    assert_eq!(run.failure.as_ref().unwrap().kind(), ErrorKind::Verification);
    let workdir = &run.execution.as_ref().unwrap().rollback.workdir;
    let restored = std::fs::read_to_string(workdir.join("main.tf")).unwrap();
    assert_eq!(restored, first.artifact.as_ref().unwrap().content());
    match &run.audit.last().unwrap().outcome {
        AuditOutcome::RolledBack { error, .. } => assert!(error.is_none()),
        other => panic!("unexpected {other:?}"),
    }
}

// ============================================================================
// Audit persistence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_audit_trail_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::rooted_at(dir.path());
    let orchestrator = Orchestrator::new(
        config.clone(),
        Arc::new(MockRunner::new()),
        Arc::new(JsonlLedger::new(&config.state_dir)),
    );
    let run = orchestrator
        .run(submission(json!({"kind": "database", "provider": "aws", "name": "orders", "engine": "postgres"})))
        .await;
    assert!(run.is_finished());

    let reopened = JsonlLedger::new(&config.state_dir);
    let history = reopened.history(run.id).unwrap();
    assert_eq!(history, run.audit);
    assert!(chain_is_contiguous(&history));

    let all = reopened.since(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH).unwrap();
    assert_eq!(all.len(), run.audit.len());
}
