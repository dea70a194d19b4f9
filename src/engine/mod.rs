//! Execution engine: snapshot → plan → apply (with retry) → verify, and
//! rollback from the captured snapshot.
//!
//! Each resource identity gets its own working directory holding the
//! artifact file. Tool output is stored content-addressed; the returned
//! [`ExecutionRecord`] only carries references.

pub mod backend;

use crate::core::config::{ExecutionSettings, PipelineConfig};
use crate::core::error::{ApplyError, PipelineError, PlanError, RollbackError, VerificationError};
use crate::core::snapshot::{self, Snapshot, SnapshotStore};
use crate::core::types::{
    ApplyAttempt, ExecutionRecord, ExecutionStatus, ExitClass, GeneratedArtifact,
    InfrastructureRequest, Phase, RollbackHandle, TargetFormat, ToolInvocation,
};
use crate::transport::{CommandRunner, CommandSpec, ExecOutput};
use backend::{
    AnsibleBackend, Backend, ComposeBackend, KubectlBackend, TerraformBackend, VerifyOutcome,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bounded exponential backoff for transient Apply failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base: Duration::from_millis(settings.base_backoff_ms),
            max: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): `min(base * 2^(retry-1), max)`.
    /// `None` once the retry budget is spent.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(retry - 1).unwrap_or(u32::MAX);
        let delay = self.base.checked_mul(factor).unwrap_or(self.max);
        Some(delay.min(self.max))
    }

    /// All delays, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).filter_map(|n| self.backoff(n)).collect()
    }
}

/// What [`ExecutionEngine::execute`] produced. `error` is set whenever
/// `record.status` is not `Applied`.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub record: ExecutionRecord,
    pub error: Option<PipelineError>,
}

/// Apply loop states.
enum ApplyStep {
    Attempt { number: u32, backoff: Duration },
    Succeeded,
    GaveUp(ApplyError),
}

pub struct ExecutionEngine {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn CommandRunner>,
    store: SnapshotStore,
    policy: RetryPolicy,
    backends: HashMap<TargetFormat, Arc<dyn Backend>>,
}

/// Directory name for a resource identity: path separators and anything
/// outside `[A-Za-z0-9._-]` become `_`.
pub fn workdir_name(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join(" | ")
}

fn failure_detail(out: &ExecOutput) -> String {
    if out.timed_out {
        return "timed out".to_string();
    }
    let detail = tail(&out.stderr);
    if detail.is_empty() {
        format!("exit {}", out.exit_code)
    } else {
        format!("exit {}: {}", out.exit_code, detail)
    }
}

impl ExecutionEngine {
    pub fn new(config: Arc<PipelineConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        let store = SnapshotStore::new(&config.state_dir);
        let policy = RetryPolicy::from_settings(&config.execution);
        let mut engine = Self {
            runner,
            store,
            policy,
            backends: HashMap::new(),
            config,
        };
        engine.register(Arc::new(TerraformBackend));
        engine.register(Arc::new(KubectlBackend));
        engine.register(Arc::new(ComposeBackend));
        let inventory = engine.config.execution.ansible_inventory.clone();
        engine.register(Arc::new(AnsibleBackend::new(&inventory)));
        engine
    }

    /// Register (or replace) the backend for its format.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.format(), backend);
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn workdir_for(&self, identity: &str) -> PathBuf {
        self.config.execution.workdir.join(workdir_name(identity))
    }

    fn backend(&self, format: TargetFormat) -> Result<Arc<dyn Backend>, String> {
        self.backends
            .get(&format)
            .cloned()
            .ok_or_else(|| format!("no execution backend for {}", format))
    }

    fn store_output(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        match self.store.put_output(text) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(error = %e, "failed to store tool output");
                None
            }
        }
    }

    /// Run one command in `workdir`, recording it as an invocation. A spawn
    /// failure comes back as `Err` after being recorded with class `Hard`.
    async fn invoke(
        &self,
        phase: Phase,
        spec: CommandSpec,
        workdir: &Path,
        env: &[(String, String)],
        timeout: Duration,
        backend: &dyn Backend,
        invocations: &mut Vec<ToolInvocation>,
    ) -> Result<ExecOutput, String> {
        let spec = spec.in_dir(workdir).with_env(env.to_vec());
        let command = spec.display();
        let start = Instant::now();
        tracing::debug!(%phase, %command, "running tool");
        match self.runner.run(&spec, timeout).await {
            Ok(out) => {
                let class = match (phase, out.timed_out) {
                    (Phase::Plan | Phase::Snapshot | Phase::Rollback, true) => ExitClass::Hard,
                    _ => backend::classify(backend, &out),
                };
                invocations.push(ToolInvocation {
                    phase,
                    command,
                    exit_code: (!out.timed_out).then_some(out.exit_code),
                    class,
                    timed_out: out.timed_out,
                    stdout_ref: self.store_output(&out.stdout),
                    stderr_ref: self.store_output(&out.stderr),
                    duration_ms: elapsed_ms(start),
                });
                Ok(out)
            }
            Err(e) => {
                tracing::warn!(%phase, %command, error = %e, "tool failed to start");
                invocations.push(ToolInvocation {
                    phase,
                    command,
                    exit_code: None,
                    class: ExitClass::Hard,
                    timed_out: false,
                    stdout_ref: None,
                    stderr_ref: None,
                    duration_ms: elapsed_ms(start),
                });
                Err(e)
            }
        }
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    /// Capture the prior artifact file and backend state before any change.
    async fn take_snapshot(
        &self,
        identity: &str,
        format: TargetFormat,
        workdir: &Path,
        env: &[(String, String)],
        backend: &dyn Backend,
        invocations: &mut Vec<ToolInvocation>,
    ) -> Result<(String, Option<String>), String> {
        std::fs::create_dir_all(workdir)
            .map_err(|e| format!("cannot create workdir {}: {}", workdir.display(), e))?;
        let artifact_path = workdir.join(format.file_name());

        let prior_artifact_ref = if artifact_path.exists() {
            let prior = std::fs::read_to_string(&artifact_path)
                .map_err(|e| format!("cannot read {}: {}", artifact_path.display(), e))?;
            Some(self.store.put_artifact(&prior)?)
        } else {
            None
        };

        let mut state_ref = None;
        if prior_artifact_ref.is_some() {
            if let Some(dump) = backend.state_dump() {
                let out = self
                    .invoke(
                        Phase::Snapshot,
                        dump,
                        workdir,
                        env,
                        self.config.execution.snapshot_timeout(),
                        backend,
                        invocations,
                    )
                    .await?;
                if !out.success() {
                    return Err(format!("state dump failed: {}", failure_detail(&out)));
                }
                state_ref = Some(self.store.put_output(&out.stdout)?);
            }
        }

        let snap = Snapshot {
            identity: identity.to_string(),
            format,
            taken_at: Utc::now(),
            prior_artifact_ref: prior_artifact_ref.clone(),
            state_ref,
        };
        let snapshot_ref = self.store.put_snapshot(&snap)?;
        Ok((snapshot_ref, prior_artifact_ref))
    }

    /// Put the workdir back the way the snapshot found it.
    fn restore_file(&self, handle: &RollbackHandle) -> Result<(), String> {
        let path = handle.workdir.join(handle.format.file_name());
        match &handle.prior_artifact_ref {
            Some(r) => {
                let prior = self.store.artifact(r)?;
                snapshot::write_atomic(&path, prior.as_bytes())
            }
            None if path.exists() => std::fs::remove_file(&path)
                .map_err(|e| format!("cannot remove {}: {}", path.display(), e)),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Execute
    // ========================================================================

    /// Run the execution protocol for `artifact`.
    pub async fn execute(
        &self,
        artifact: &GeneratedArtifact,
        request: &InfrastructureRequest,
    ) -> ExecutionOutcome {
        let identity = request.resource_identity();
        let format = artifact.format();
        let workdir = self.workdir_for(&identity);
        let env = self.config.credential_env(request.provider());

        let mut record = ExecutionRecord {
            artifact_id: artifact.id(),
            status: ExecutionStatus::Failed,
            exit_code: None,
            stdout_ref: None,
            stderr_ref: None,
            plan_ref: None,
            timestamp: Utc::now(),
            rollback: RollbackHandle {
                identity: identity.clone(),
                format,
                snapshot_ref: String::new(),
                prior_artifact_ref: None,
                workdir: workdir.clone(),
            },
            apply_started: false,
            attempts: Vec::new(),
            invocations: Vec::new(),
        };

        let backend = match self.backend(format) {
            Ok(b) => b,
            Err(message) => return fail(record, PlanError { message }.into()),
        };

        // Snapshot
        match self
            .take_snapshot(&identity, format, &workdir, &env, backend.as_ref(), &mut record.invocations)
            .await
        {
            Ok((snapshot_ref, prior)) => {
                record.rollback.snapshot_ref = snapshot_ref;
                record.rollback.prior_artifact_ref = prior;
            }
            Err(e) => {
                let message = format!("snapshot failed: {}", e);
                return fail(record, PlanError { message }.into());
            }
        }

        let artifact_path = workdir.join(format.file_name());
        if let Err(e) = snapshot::write_atomic(&artifact_path, artifact.content().as_bytes()) {
            self.discard_staged(&record.rollback);
            return fail(record, PlanError { message: e }.into());
        }

        // Plan
        if let Err(message) = self.run_plan(&workdir, &env, backend.as_ref(), &mut record).await {
            self.discard_staged(&record.rollback);
            tracing::warn!(%identity, %message, "plan failed");
            return fail(record, PlanError { message }.into());
        }

        // Apply
        record.apply_started = true;
        if let Err(err) = self.run_apply(&identity, &workdir, &env, backend.as_ref(), &mut record).await {
            tracing::warn!(%identity, attempts = err.attempts, transient = err.transient, "apply failed");
            return fail(record, err.into());
        }

        // Verify
        let verify = self
            .invoke(
                Phase::Verify,
                backend.verify(),
                &workdir,
                &env,
                self.config.execution.verify_timeout(),
                backend.as_ref(),
                &mut record.invocations,
            )
            .await;
        let message = match verify {
            Ok(out) => match backend.verify_outcome(&out) {
                VerifyOutcome::Match => None,
                VerifyOutcome::Drift => Some("live state differs from the artifact after apply".to_string()),
                VerifyOutcome::Failed => Some(format!("verify failed: {}", failure_detail(&out))),
            },
            Err(e) => Some(e),
        };
        if let Some(message) = message {
            tracing::warn!(%identity, %message, "verification failed");
            return fail(record, VerificationError { message }.into());
        }

        record.status = ExecutionStatus::Applied;
        record.timestamp = Utc::now();
        tracing::info!(%identity, attempts = record.attempts.len(), "applied");
        ExecutionOutcome { record, error: None }
    }

    async fn run_plan(
        &self,
        workdir: &Path,
        env: &[(String, String)],
        backend: &dyn Backend,
        record: &mut ExecutionRecord,
    ) -> Result<(), String> {
        let mut last = ExecOutput::default();
        for spec in backend.plan() {
            let out = self
                .invoke(
                    Phase::Plan,
                    spec,
                    workdir,
                    env,
                    self.config.execution.plan_timeout(),
                    backend,
                    &mut record.invocations,
                )
                .await?;
            if !out.success() {
                return Err(format!("plan failed: {}", failure_detail(&out)));
            }
            last = out;
        }
        record.plan_ref = self.store_output(&last.stdout);
        Ok(())
    }

    /// Apply with bounded retry on transient failures.
    async fn run_apply(
        &self,
        identity: &str,
        workdir: &Path,
        env: &[(String, String)],
        backend: &dyn Backend,
        record: &mut ExecutionRecord,
    ) -> Result<(), ApplyError> {
        let mut step = ApplyStep::Attempt {
            number: 1,
            backoff: Duration::ZERO,
        };
        loop {
            step = match step {
                ApplyStep::Attempt { number, backoff } => {
                    if !backoff.is_zero() {
                        tracing::info!(%identity, attempt = number, backoff_ms = backoff.as_millis() as u64, "retrying apply");
                        tokio::time::sleep(backoff).await;
                    }
                    let result = self
                        .invoke(
                            Phase::Apply,
                            backend.apply(),
                            workdir,
                            env,
                            self.config.execution.apply_timeout(),
                            backend,
                            &mut record.invocations,
                        )
                        .await;
                    let (class, exit_code, detail) = match &result {
                        Ok(out) => (
                            backend::classify(backend, out),
                            (!out.timed_out).then_some(out.exit_code),
                            failure_detail(out),
                        ),
                        Err(e) => (ExitClass::Hard, None, e.clone()),
                    };
                    if let Some(inv) = record.invocations.last() {
                        record.stdout_ref = inv.stdout_ref.clone();
                        record.stderr_ref = inv.stderr_ref.clone();
                    }
                    record.exit_code = exit_code;
                    record.attempts.push(ApplyAttempt {
                        attempt: number,
                        backoff_ms: backoff.as_millis() as u64,
                        class,
                        exit_code,
                    });
                    match class {
                        ExitClass::Success => ApplyStep::Succeeded,
                        ExitClass::Transient => match self.policy.backoff(number) {
                            Some(delay) => ApplyStep::Attempt {
                                number: number + 1,
                                backoff: delay,
                            },
                            None => ApplyStep::GaveUp(ApplyError {
                                message: format!("retries exhausted: {}", detail),
                                attempts: number,
                                transient: true,
                            }),
                        },
                        ExitClass::Hard => ApplyStep::GaveUp(ApplyError {
                            message: detail,
                            attempts: number,
                            transient: false,
                        }),
                    }
                }
                ApplyStep::Succeeded => return Ok(()),
                ApplyStep::GaveUp(err) => return Err(err),
            };
        }
    }

    /// Drop a staged artifact that never reached Apply.
    fn discard_staged(&self, handle: &RollbackHandle) {
        if handle.snapshot_ref.is_empty() {
            return;
        }
        if let Err(e) = self.restore_file(handle) {
            tracing::warn!(identity = %handle.identity, error = %e, "failed to restore workdir");
        }
    }

    // ========================================================================
    // Plan only
    // ========================================================================

    /// Run the Plan phase alone and return the plan output. The workdir is
    /// left as it was found.
    pub async fn plan_only(
        &self,
        artifact: &GeneratedArtifact,
        request: &InfrastructureRequest,
    ) -> Result<String, PlanError> {
        let identity = request.resource_identity();
        let format = artifact.format();
        let workdir = self.workdir_for(&identity);
        let env = self.config.credential_env(request.provider());
        let backend = self.backend(format).map_err(|message| PlanError { message })?;

        let mut invocations = Vec::new();
        let (snapshot_ref, prior_artifact_ref) = self
            .take_snapshot(&identity, format, &workdir, &env, backend.as_ref(), &mut invocations)
            .await
            .map_err(|e| PlanError {
                message: format!("snapshot failed: {}", e),
            })?;
        let handle = RollbackHandle {
            identity: identity.clone(),
            format,
            snapshot_ref,
            prior_artifact_ref,
            workdir: workdir.clone(),
        };

        let path = workdir.join(format.file_name());
        snapshot::write_atomic(&path, artifact.content().as_bytes())
            .map_err(|message| PlanError { message })?;

        let mut output = String::new();
        let mut result = Ok(());
        for spec in backend.plan() {
            match self
                .invoke(
                    Phase::Plan,
                    spec,
                    &workdir,
                    &env,
                    self.config.execution.plan_timeout(),
                    backend.as_ref(),
                    &mut invocations,
                )
                .await
            {
                Ok(out) if out.success() => output = out.stdout,
                Ok(out) => {
                    result = Err(format!("plan failed: {}", failure_detail(&out)));
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.discard_staged(&handle);
        result.map(|()| output).map_err(|message| PlanError { message })
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Restore the pre-change state recorded in `record`. A no-op when Apply
    /// never started. Never retried. Updates `record.status`.
    pub async fn rollback(
        &self,
        request: &InfrastructureRequest,
        record: &mut ExecutionRecord,
    ) -> Result<(), RollbackError> {
        let result = self.try_rollback(request, record).await;
        record.status = match result {
            Ok(()) => ExecutionStatus::RolledBack,
            Err(_) => ExecutionStatus::RollbackFailed,
        };
        record.timestamp = Utc::now();
        result.map_err(|message| {
            tracing::error!(identity = %record.rollback.identity, %message, "rollback failed");
            RollbackError { message }
        })
    }

    async fn try_rollback(
        &self,
        request: &InfrastructureRequest,
        record: &mut ExecutionRecord,
    ) -> Result<(), String> {
        if !record.apply_started {
            tracing::debug!(identity = %record.rollback.identity, "apply never started; nothing to roll back");
            return Ok(());
        }
        let handle = record.rollback.clone();
        let backend = self.backend(handle.format)?;
        let snap = self.store.snapshot(&handle.snapshot_ref)?;
        let env = self.config.credential_env(request.provider());
        let timeout = self.config.execution.rollback_timeout();

        let spec = match &snap.prior_artifact_ref {
            Some(_) => {
                self.restore_file(&handle)?;
                backend.restore()
            }
            None => backend.destroy().ok_or_else(|| {
                format!(
                    "no prior {} for {}; {} cannot remove what was applied",
                    handle.format.file_name(),
                    handle.identity,
                    handle.format
                )
            })?,
        };

        let out = self
            .invoke(
                Phase::Rollback,
                spec,
                &handle.workdir,
                &env,
                timeout,
                backend.as_ref(),
                &mut record.invocations,
            )
            .await?;
        if !out.success() {
            return Err(format!("rollback command failed: {}", failure_detail(&out)));
        }
        if snap.prior_artifact_ref.is_none() {
            self.restore_file(&handle)?;
        }
        tracing::info!(identity = %handle.identity, "rolled back");
        Ok(())
    }
}

fn fail(mut record: ExecutionRecord, error: PipelineError) -> ExecutionOutcome {
    record.status = ExecutionStatus::Failed;
    record.timestamp = Utc::now();
    ExecutionOutcome {
        record,
        error: Some(error),
    }
}
