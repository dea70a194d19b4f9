//! CLI subcommands: init, serve, run, validate, audit.

use crate::audit::ledger::{AuditLedger, JsonlLedger};
use crate::core::config::{self, PipelineConfig};
use crate::core::error::{PipelineError, ValidationFailure};
use crate::core::orchestrator::Orchestrator;
use crate::core::types::{
    GeneratedArtifact, InfrastructureRequest, PipelineRun, Provider, RawIntent, ResourceKind,
    Submission, TargetFormat, ValidationOverride, ValidationVerdict,
};
use crate::server;
use crate::validators::ValidationPipeline;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_CONFIG: &str = "autodevops.yaml";

/// CLI failure. Pipeline errors keep their taxonomy exit code; everything
/// else (bad arguments, unreadable config) exits 1.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 1,
            Self::Pipeline(e) => e.exit_code(),
        }
    }
}

impl From<String> for CliError {
    fn from(message: String) -> Self {
        Self::Usage(message)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default autodevops.yaml and create the state directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Serve the HTTP API
    Serve {
        /// Path to autodevops.yaml
        #[arg(short, long, env = "AUTODEVOPS_CONFIG")]
        config: Option<PathBuf>,

        /// Override the configured bind host
        #[arg(long)]
        host: Option<String>,

        /// Override the configured port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the pipeline for one request
    Run {
        /// Path to autodevops.yaml
        #[arg(short, long, env = "AUTODEVOPS_CONFIG")]
        config: Option<PathBuf>,

        /// Natural-language request
        #[arg(short, long, default_value = "")]
        prompt: String,

        /// Target provider (aws, azure, gcp, on-prem, k8s)
        #[arg(long)]
        provider: Option<String>,

        /// Output format (terraform, kubernetes, ansible, docker)
        #[arg(long)]
        format: Option<String>,

        /// Explicit field, repeatable: --set instances=3
        #[arg(long = "set", value_name = "KEY=VALUE")]
        fields: Vec<String>,

        /// Acting user recorded in the audit trail
        #[arg(long)]
        actor: Option<String>,

        /// Stop after the plan phase and print the plan
        #[arg(long)]
        plan_only: bool,

        /// Actor authorizing a security/compliance override
        #[arg(long, requires = "override_reason")]
        override_actor: Option<String>,

        /// Reason recorded with the override
        #[arg(long, requires = "override_actor")]
        override_reason: Option<String>,
    },

    /// Validate an existing IaC file
    Validate {
        /// File to validate
        #[arg(short, long)]
        file: PathBuf,

        /// Format of the file (terraform, kubernetes, ansible, docker)
        #[arg(long)]
        format: String,

        /// Resource kind used for cost and compliance context
        #[arg(long, default_value = "compute")]
        kind: String,

        /// Path to autodevops.yaml
        #[arg(short, long, env = "AUTODEVOPS_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print audit entries as JSON lines
    Audit {
        /// Path to autodevops.yaml
        #[arg(short, long, env = "AUTODEVOPS_CONFIG")]
        config: Option<PathBuf>,

        /// Entries of one run
        #[arg(long, conflicts_with = "since")]
        run: Option<Uuid>,

        /// Entries of all runs at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
    },
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), CliError> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Serve { config, host, port } => cmd_serve(config.as_deref(), host, port).await,
        Commands::Run {
            config,
            prompt,
            provider,
            format,
            fields,
            actor,
            plan_only,
            override_actor,
            override_reason,
        } => {
            let config = load(config.as_deref())?;
            let mut submission = Submission::from_prompt(&prompt);
            submission.fields = parse_fields(&fields, provider, format)?;
            submission.actor = actor;
            submission.validation_override = override_actor
                .zip(override_reason)
                .map(|(actor, reason)| ValidationOverride { actor, reason });
            cmd_run(config, submission, plan_only).await
        }
        Commands::Validate {
            file,
            format,
            kind,
            config,
        } => cmd_validate(&file, &format, &kind, config.as_deref()),
        Commands::Audit { config, run, since } => cmd_audit(config.as_deref(), run, since.as_deref()),
    }
}

/// Load the config: an explicit path must exist; otherwise use
/// `./autodevops.yaml` when present and built-in defaults when not.
fn load(path: Option<&Path>) -> Result<PipelineConfig, CliError> {
    match path {
        Some(p) => Ok(config::load_config(p)?),
        None if Path::new(DEFAULT_CONFIG).exists() => Ok(config::load_config(Path::new(DEFAULT_CONFIG))?),
        None => {
            tracing::debug!("no {} found; using defaults", DEFAULT_CONFIG);
            Ok(PipelineConfig::default())
        }
    }
}

/// Parse `key=value` pairs. Values that parse as JSON (numbers, booleans,
/// arrays) keep their type; anything else is a string.
fn parse_fields(
    pairs: &[String],
    provider: Option<String>,
    format: Option<String>,
) -> Result<RawIntent, CliError> {
    let mut raw = RawIntent::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| CliError::Usage(format!("--set expects KEY=VALUE, got '{}'", pair)))?;
        let value = serde_json::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()));
        raw = raw.with(key.trim(), value);
    }
    if let Some(p) = provider {
        raw = raw.with("provider", Value::String(p));
    }
    if let Some(f) = format {
        raw = raw.with("format", Value::String(f));
    }
    Ok(raw)
}

fn cmd_init(path: &Path) -> Result<(), CliError> {
    let config_path = path.join(DEFAULT_CONFIG);
    if config_path.exists() {
        return Err(CliError::Usage(format!("{} already exists", config_path.display())));
    }
    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;
    let yaml = config::default_config_yaml()?;
    std::fs::write(&config_path, yaml)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized autodevops project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

async fn cmd_serve(path: Option<&Path>, host: Option<String>, port: Option<u16>) -> Result<(), CliError> {
    let config = load(path)?;
    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| config.server.host.clone()),
        port.unwrap_or(config.server.port)
    );
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    server::serve(orchestrator, &addr).await?;
    Ok(())
}

async fn cmd_run(config: PipelineConfig, submission: Submission, plan_only: bool) -> Result<(), CliError> {
    let orchestrator = Orchestrator::from_config(config)?;

    if plan_only {
        let run = orchestrator.prepare(submission).await;
        print_run(&run);
        if let Some(error) = run.error() {
            return Err(error.clone().into());
        }
        let (Some(artifact), Some(request)) = (&run.artifact, &run.request) else {
            return Ok(());
        };
        let plan = orchestrator
            .engine()
            .plan_only(artifact, request)
            .await
            .map_err(PipelineError::from)?;
        println!("\nPlan:\n{}", plan);
        return Ok(());
    }

    let run = orchestrator.run(submission).await;
    print_run(&run);
    match run.error() {
        Some(error) => Err(error.clone().into()),
        None => Ok(()),
    }
}

fn print_verdict(verdict: &ValidationVerdict) {
    println!("Verdict: {}", verdict.status);
    for sub in &verdict.sub_verdicts {
        println!(
            "  {}: {}{}",
            sub.validator,
            sub.status,
            if sub.required { "" } else { " (advisory)" }
        );
        for f in &sub.findings {
            let line = f.line.map(|l| format!(" line {}", l)).unwrap_or_default();
            println!("    [{}] {}{}: {}", f.severity, f.rule, line, f.message);
        }
    }
    if let Some(cost) = &verdict.cost {
        println!("  estimated monthly cost: ${:.2}", cost.monthly_usd);
    }
    if let Some(exception) = &verdict.exception {
        println!("  override by {}: {}", exception.actor, exception.reason);
    }
}

fn print_run(run: &PipelineRun) {
    println!("Run {} ({})", run.id, run.actor);
    if let Some(request) = &run.request {
        println!("Request: {} [{}]", request.summary(), request.resource_identity());
    }
    if let Some(artifact) = &run.artifact {
        println!("Artifact: {} ({} bytes, {})", artifact.id(), artifact.content().len(), artifact.content_hash());
    }
    if let Some(verdict) = &run.verdict {
        print_verdict(verdict);
    }
    if let Some(record) = &run.execution {
        println!(
            "Execution: {} after {} attempt(s)",
            record.status,
            record.attempts.len()
        );
    }
    if let Some(commit) = &run.commit {
        println!("Commit: {}", commit);
    }
    println!("State: {}", run.state);
    if let Some(error) = run.error() {
        println!("Error: {}", error);
    }
    println!("Audit:");
    for entry in &run.audit {
        let next = entry.next.map(|n| n.to_string()).unwrap_or_else(|| "halt".to_string());
        println!("  #{} {} {} -> {}", entry.sequence, entry.timestamp.to_rfc3339(), entry.stage, next);
    }
}

fn cmd_validate(file: &Path, format: &str, kind: &str, path: Option<&Path>) -> Result<(), CliError> {
    let config = load(path)?;
    let format: TargetFormat = format.parse().map_err(CliError::Usage)?;
    let kind: ResourceKind = kind.parse().map_err(CliError::Usage)?;
    let provider = match format {
        TargetFormat::Terraform => Provider::Aws,
        TargetFormat::Kubernetes => Provider::K8s,
        TargetFormat::Ansible | TargetFormat::Docker => Provider::OnPrem,
    };

    let content = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
    let request = InfrastructureRequest::new(kind, provider, format, BTreeMap::new());
    let artifact = GeneratedArtifact::new(&request, "file", content);
    let verdict = ValidationPipeline::from_settings(&config.validation).run(&artifact, &request);

    println!("File: {}", file.display());
    print_verdict(&verdict);
    if verdict.gate_open() {
        Ok(())
    } else {
        Err(PipelineError::from(ValidationFailure {
            blocking: verdict.blocking_validators(),
            findings: verdict.findings_count(),
        })
        .into())
    }
}

fn cmd_audit(path: Option<&Path>, run: Option<Uuid>, since: Option<&str>) -> Result<(), CliError> {
    let config = load(path)?;
    let ledger = JsonlLedger::new(&config.state_dir);
    let entries = match (run, since) {
        (Some(id), _) => ledger.history(id).map_err(PipelineError::from)?,
        (None, Some(ts)) => {
            let since = DateTime::parse_from_rfc3339(ts)
                .map_err(|e| CliError::Usage(format!("invalid --since '{}': {}", ts, e)))?
                .with_timezone(&Utc);
            ledger.since(since).map_err(PipelineError::from)?
        }
        (None, None) => ledger.since(DateTime::<Utc>::UNIX_EPOCH).map_err(PipelineError::from)?,
    };
    for entry in &entries {
        let line = serde_json::to_string(entry).map_err(|e| format!("JSON serialize error: {}", e))?;
        println!("{}", line);
    }
    if entries.is_empty() {
        eprintln!("No audit entries found.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn test_cli_init() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let yaml = std::fs::read_to_string(dir.path().join(DEFAULT_CONFIG)).unwrap();
        let config = config::parse_config(&yaml).unwrap();
        assert!(config::validate_config(&config).is_empty());
        assert!(dir.path().join("state").is_dir());
    }

    #[test]
    fn test_cli_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG), "exists").unwrap();
        let err = cmd_init(dir.path()).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_cli_parse_fields() {
        let raw = parse_fields(
            &["instances=3".into(), "hasLoadBalancer=true".into(), "name=web".into()],
            Some("aws".into()),
            None,
        )
        .unwrap();
        assert_eq!(raw.get("instances"), Some(&serde_json::json!(3)));
        assert_eq!(raw.get("hasLoadBalancer"), Some(&serde_json::json!(true)));
        assert_eq!(raw.get("name"), Some(&serde_json::json!("web")));
        assert_eq!(raw.get("provider"), Some(&serde_json::json!("aws")));
        assert!(parse_fields(&["novalue".into()], None, None).is_err());
    }

    #[test]
    fn test_cli_validate_unencrypted_bucket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.tf");
        std::fs::write(
            &file,
            "resource \"aws_s3_bucket\" \"logs\" {\n  bucket = \"logs\"\n}\n",
        )
        .unwrap();
        let err = cmd_validate(&file, "terraform", "storage", None).unwrap_err();
        assert_eq!(err.exit_code(), ErrorKind::ValidationFailure.exit_code());
    }

    #[test]
    fn test_cli_validate_bad_format() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x");
        std::fs::write(&file, "").unwrap();
        let err = cmd_validate(&file, "pulumi", "compute", None).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_cli_audit_unknown_run_prints_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG);
        std::fs::write(&path, format!("version: \"1.0\"\nstate_dir: {}\n", dir.path().join("state").display())).unwrap();
        cmd_audit(Some(&path), Some(Uuid::new_v4()), None).unwrap();
    }

    #[test]
    fn test_cli_error_exit_codes() {
        for kind in ErrorKind::ALL {
            assert!(kind.exit_code() > 1);
        }
        let err = CliError::from("bad flag".to_string());
        assert_eq!(err.exit_code(), 1);
    }
}
