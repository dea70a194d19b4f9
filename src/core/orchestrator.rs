//! Pipeline orchestrator: sequences resolve → generate → validate →
//! execute, owns the run state machine, and writes one audit entry per
//! transition before the next stage starts.
//!
//! Errors never escape as `Err`: every run comes back as a [`PipelineRun`]
//! whose `halt`/`failure`/`rollback_error` fields say why it stopped, with
//! the full audit chain attached.

use super::config::PipelineConfig;
use super::error::{GenerationError, PersistenceError, PipelineError, ValidationFailure};
use super::intent::IntentExtractor;
use super::resolver;
use super::types::{
    AuditOutcome, ExecutionStatus, InfrastructureRequest, PipelineRun, RetrievedContext,
    RunState, StageRecord, Submission, VerdictStatus,
};
use crate::audit::commit::{CommitRequest, GitVersionControl, VersionControl};
use crate::audit::hasher;
use crate::audit::ledger::{AuditLedger, JsonlLedger};
use crate::collab::llm::OllamaClient;
use crate::collab::retrieval::{KeywordRetriever, Retriever};
use crate::engine::ExecutionEngine;
use crate::generators::GeneratorRegistry;
use crate::transport::local::ProcessRunner;
use crate::transport::CommandRunner;
use crate::validators::ValidationPipeline;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

/// Cooperative cancellation flag, checked between stages only. A stage in
/// progress always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A run scheduled on the worker pool.
pub struct RunHandle {
    pub run_id: Uuid,
    cancel: CancelToken,
    join: JoinHandle<PipelineRun>,
}

impl RunHandle {
    /// Request cancellation before the run's next stage.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> Result<PipelineRun, tokio::task::JoinError> {
        self.join.await
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn json_hash<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value)
        .ok()
        .map(|s| hasher::hash_string(&s))
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    extractor: IntentExtractor,
    retriever: Arc<dyn Retriever>,
    registry: GeneratorRegistry,
    validation: ValidationPipeline,
    engine: ExecutionEngine,
    ledger: Arc<dyn AuditLedger>,
    vcs: Option<Arc<dyn VersionControl>>,
    workers: Arc<Semaphore>,
    /// Per-resource execution locks; an entry lives only while some run
    /// holds or waits on it.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Validated runs waiting for `/apply`, keyed by artifact id, with the
    /// instant they expire.
    parked: Mutex<HashMap<Uuid, (Instant, PipelineRun)>>,
    /// Latest reports, oldest first, capped at `server.max_reports`.
    reports: Mutex<IndexMap<Uuid, PipelineRun>>,
}

impl Orchestrator {
    /// Orchestrator with built-in generators and validators, the built-in
    /// retrieval corpus, and no language model or version control.
    pub fn new(
        config: PipelineConfig,
        runner: Arc<dyn CommandRunner>,
        ledger: Arc<dyn AuditLedger>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            extractor: IntentExtractor::new(config.llm.clone()),
            retriever: Arc::new(KeywordRetriever::builtin()),
            registry: GeneratorRegistry::with_builtin(&config.generation),
            validation: ValidationPipeline::from_settings(&config.validation),
            engine: ExecutionEngine::new(config.clone(), runner),
            ledger,
            vcs: None,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            locks: Mutex::new(HashMap::new()),
            parked: Mutex::new(HashMap::new()),
            reports: Mutex::new(IndexMap::new()),
            config,
        }
    }

    /// Production wiring: local processes, JSONL ledger under `state_dir`,
    /// corpus directory retrieval, and the optional model and git commits.
    pub fn from_config(config: PipelineConfig) -> Result<Self, String> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
        let ledger = Arc::new(JsonlLedger::new(&config.state_dir));
        let retriever: Arc<dyn Retriever> = match &config.retrieval.corpus_dir {
            Some(dir) => Arc::new(KeywordRetriever::from_dir(dir)?),
            None => Arc::new(KeywordRetriever::builtin()),
        };
        let llm = config.llm.clone();
        let vcs = config.version_control.clone();
        let mut orchestrator = Self::new(config, runner.clone(), ledger).with_retriever(retriever);
        if llm.enabled {
            let client = OllamaClient::new(llm.clone())?;
            orchestrator.extractor = IntentExtractor::new(llm).with_model(Arc::new(client));
        }
        if vcs.enabled {
            orchestrator = orchestrator.with_version_control(Arc::new(GitVersionControl::new(vcs, runner)));
        }
        Ok(orchestrator)
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_extractor(mut self, extractor: IntentExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_registry(mut self, registry: GeneratorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn AuditLedger> {
        &self.ledger
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn registry(&self) -> &GeneratorRegistry {
        &self.registry
    }

    pub fn validation(&self) -> &ValidationPipeline {
        &self.validation
    }

    // ========================================================================
    // Public lifecycle
    // ========================================================================

    fn start(&self, submission: Submission) -> PipelineRun {
        let actor = submission
            .actor
            .clone()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| self.config.actor.clone());
        PipelineRun::new(&actor, submission)
    }

    /// Resolve, generate and validate. A run whose gate is open is parked
    /// for [`Orchestrator::execute`].
    pub async fn prepare(&self, submission: Submission) -> PipelineRun {
        let run = self.start(submission);
        self.prepare_run(run, &CancelToken::new()).await
    }

    /// Execute a prepared run and handle its aftermath.
    pub async fn execute(&self, run: PipelineRun) -> PipelineRun {
        self.execute_run(run, &CancelToken::new()).await
    }

    /// Prepare and, when the gate is open, execute.
    pub async fn run(&self, submission: Submission) -> PipelineRun {
        let run = self.start(submission);
        self.drive(run, &CancelToken::new()).await
    }

    /// Schedule a full run on the worker pool.
    pub fn submit(self: &Arc<Self>, submission: Submission) -> RunHandle {
        let run = self.start(submission);
        let run_id = run.id;
        let cancel = CancelToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let span = tracing::info_span!("run", %run_id);
        let join = tokio::spawn(
            async move {
                let _permit = this.workers.clone().acquire_owned().await.ok();
                this.drive(run, &token).await
            }
            .instrument(span),
        );
        RunHandle {
            run_id,
            cancel,
            join,
        }
    }

    async fn drive(&self, run: PipelineRun, cancel: &CancelToken) -> PipelineRun {
        let run = self.prepare_run(run, cancel).await;
        if run.ready_for_execution() {
            self.execute_run(run, cancel).await
        } else {
            run
        }
    }

    /// Claim a parked run by artifact id. Each parked run is handed out once;
    /// an expired one is gone.
    pub fn take_parked(&self, artifact_id: Uuid) -> Option<PipelineRun> {
        let (expires, run) = guard(&self.parked).remove(&artifact_id)?;
        (Instant::now() < expires).then_some(run)
    }

    /// Number of runs currently parked (expired ones included until the
    /// next park sweeps them).
    pub fn parked_count(&self) -> usize {
        guard(&self.parked).len()
    }

    fn park(&self, run: &PipelineRun) {
        let Some(artifact) = &run.artifact else {
            return;
        };
        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.server.parked_ttl_secs);
        let mut parked = guard(&self.parked);
        let before = parked.len();
        parked.retain(|_, (expires, _)| *expires > now);
        if parked.len() < before {
            tracing::debug!(expired = before - parked.len(), "dropped expired parked runs");
        }
        parked.insert(artifact.id(), (now + ttl, run.clone()));
    }

    /// Latest known state of a recent run started by this process.
    pub fn report(&self, run_id: Uuid) -> Option<PipelineRun> {
        guard(&self.reports).get(&run_id).cloned()
    }

    fn publish(&self, run: &PipelineRun) {
        let mut reports = guard(&self.reports);
        reports.shift_remove(&run.id);
        reports.insert(run.id, run.clone());
        let cap = self.config.server.max_reports.max(1);
        while reports.len() > cap {
            reports.shift_remove_index(0);
        }
    }

    /// Number of resource identities with a live execution lock.
    pub fn lock_count(&self) -> usize {
        guard(&self.locks).len()
    }

    fn release_lock(&self, identity: &str) {
        let mut locks = guard(&self.locks);
        if locks.get(identity).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(identity);
        }
    }

    // ========================================================================
    // Stage recording
    // ========================================================================

    /// Append one transition. On success the run moves to `next`; a ledger
    /// failure halts the run with `PersistenceError`.
    async fn record(&self, run: &mut PipelineRun, record: StageRecord) -> bool {
        let next = record.next;
        let ledger = Arc::clone(&self.ledger);
        let (run_id, actor) = (run.id, run.actor.clone());
        // appends write and fsync a file; keep them off the async workers
        let appended = tokio::task::spawn_blocking(move || ledger.append(run_id, &actor, record))
            .await
            .unwrap_or_else(|e| Err(PersistenceError::new(format!("audit append task failed: {}", e))));
        match appended {
            Ok(entry) => {
                tracing::info!(
                    run_id = %run.id,
                    stage = %entry.stage,
                    next = entry.next.map(|s| s.to_string()).unwrap_or_else(|| "halt".into()),
                    "stage recorded"
                );
                run.audit.push(entry);
                if let Some(next) = next {
                    run.state = next;
                }
                true
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "audit append failed; halting run");
                run.halt = Some(e.into());
                false
            }
        }
    }

    /// Record a halt at `stage` with `error`.
    async fn halt(&self, run: &mut PipelineRun, stage: RunState, input_hash: Option<String>, error: PipelineError) {
        tracing::warn!(run_id = %run.id, %stage, error = %error, "run halted");
        let outcome = match &error {
            PipelineError::Cancelled { .. } => AuditOutcome::Cancelled,
            other => AuditOutcome::Error {
                error: other.clone(),
            },
        };
        if self
            .record(
                run,
                StageRecord {
                    stage,
                    next: None,
                    input_hash,
                    output_hash: None,
                    outcome,
                },
            )
            .await
        {
            run.halt = Some(error);
        }
    }

    /// Halt with `Cancelled` if cancellation was requested before `stage`.
    async fn cancelled_before(&self, run: &mut PipelineRun, stage: RunState, cancel: &CancelToken) -> bool {
        if !cancel.is_cancelled() {
            return false;
        }
        self.halt(run, stage, None, PipelineError::Cancelled { stage }).await;
        true
    }

    // ========================================================================
    // Resolving → Generating → Validating
    // ========================================================================

    async fn prepare_run(&self, mut run: PipelineRun, cancel: &CancelToken) -> PipelineRun {
        self.prepare_stages(&mut run, cancel).await;
        if run.ready_for_execution() {
            self.park(&run);
        }
        self.publish(&run);
        run
    }

    async fn prepare_stages(&self, run: &mut PipelineRun, cancel: &CancelToken) {
        // Resolving
        if self.cancelled_before(run, RunState::Resolving, cancel).await {
            return;
        }
        let intent = self
            .extractor
            .extract(&run.submission.prompt, &run.submission.fields)
            .await;
        let intent_hash = Some(intent.content_hash());
        run.intent = Some(intent.clone());
        let request = match resolver::resolve(&intent, &run.submission.context) {
            Ok(r) => r,
            Err(e) => {
                self.halt(run, RunState::Resolving, intent_hash, e.into()).await;
                return;
            }
        };
        run.request = Some(request.clone());
        let recorded = self
            .record(
                run,
                StageRecord {
                    stage: RunState::Resolving,
                    next: Some(RunState::Generating),
                    input_hash: intent_hash,
                    output_hash: Some(request.content_hash()),
                    outcome: AuditOutcome::Resolved {
                        intent,
                        request: request.clone(),
                    },
                },
            )
            .await;
        if !recorded {
            return;
        }

        // Generating
        if self.cancelled_before(run, RunState::Generating, cancel).await {
            return;
        }
        let request_hash = Some(request.content_hash());
        let context = match self.retrieve(&request, &run.submission.prompt).await {
            Ok(c) => c,
            Err(e) => {
                self.halt(run, RunState::Generating, request_hash, e.into()).await;
                return;
            }
        };
        let artifact = match self.registry.generate(&request, &context) {
            Ok(a) => a,
            Err(e) => {
                self.halt(run, RunState::Generating, request_hash, e).await;
                return;
            }
        };
        run.context = Some(context.clone());
        run.artifact = Some(artifact.clone());
        let recorded = self
            .record(
                run,
                StageRecord {
                    stage: RunState::Generating,
                    next: Some(RunState::Validating),
                    input_hash: request_hash,
                    output_hash: Some(artifact.content_hash().to_string()),
                    outcome: AuditOutcome::Generated {
                        generator: artifact.generator().to_string(),
                        artifact_id: artifact.id(),
                        bytes: artifact.content().len(),
                        context_documents: context.len(),
                    },
                },
            )
            .await;
        if !recorded {
            return;
        }

        // Validating
        if self.cancelled_before(run, RunState::Validating, cancel).await {
            return;
        }
        let mut verdict = self.validation.run(&artifact, &request);
        if verdict.status == VerdictStatus::Fail && !verdict.syntax_failed() {
            if let Some(exception) = &run.submission.validation_override {
                tracing::warn!(
                    run_id = %run.id,
                    actor = %exception.actor,
                    reason = %exception.reason,
                    "validation failure overridden"
                );
                verdict.exception = Some(exception.clone());
            }
        }
        let gate_open = verdict.gate_open();
        let blocking = verdict.blocking_validators();
        let findings = verdict.findings_count();
        let record = StageRecord {
            stage: RunState::Validating,
            next: gate_open.then_some(RunState::Executing),
            input_hash: Some(artifact.content_hash().to_string()),
            output_hash: json_hash(&verdict),
            outcome: AuditOutcome::Validated {
                status: verdict.status,
                findings,
                blocking: blocking.clone(),
                exception: verdict.exception.clone(),
            },
        };
        run.verdict = Some(verdict);
        if !self.record(run, record).await {
            return;
        }
        if !gate_open {
            tracing::warn!(run_id = %run.id, findings, "validation gate closed");
            run.halt = Some(ValidationFailure { blocking, findings }.into());
        }
    }

    async fn retrieve(
        &self,
        request: &InfrastructureRequest,
        prompt: &str,
    ) -> Result<RetrievedContext, GenerationError> {
        let query = format!("{} {}", request.summary(), prompt);
        let settings = &self.config.retrieval;
        self.retriever
            .retrieve(&query, settings.top_k, settings.similarity_threshold)
            .await
            .map_err(|e| GenerationError::new(e.to_string()))
    }

    // ========================================================================
    // Executing → Applied | Failed → RolledBack | RollbackFailed
    // ========================================================================

    async fn execute_run(&self, mut run: PipelineRun, cancel: &CancelToken) -> PipelineRun {
        if !run.ready_for_execution() {
            tracing::warn!(run_id = %run.id, state = %run.state, "run is not ready for execution");
            return run;
        }
        if let Some(artifact) = &run.artifact {
            guard(&self.parked).remove(&artifact.id());
        }
        self.execute_stages(&mut run, cancel).await;
        if let Some(request) = &run.request {
            self.release_lock(&request.resource_identity());
        }
        self.publish(&run);
        run
    }

    async fn execute_stages(&self, run: &mut PipelineRun, cancel: &CancelToken) {
        let (Some(request), Some(artifact)) = (run.request.clone(), run.artifact.clone()) else {
            return;
        };
        if self.cancelled_before(run, RunState::Executing, cancel).await {
            return;
        }

        let identity = request.resource_identity();
        let lock = {
            let mut locks = guard(&self.locks);
            locks.entry(identity.clone()).or_default().clone()
        };
        let _held = lock.lock_owned().await;
        tracing::debug!(run_id = %run.id, %identity, "resource lock acquired");

        let outcome = self.engine.execute(&artifact, &request).await;
        let mut record = outcome.record;
        let input_hash = Some(artifact.content_hash().to_string());

        let Some(error) = outcome.error else {
            let stage = StageRecord {
                stage: RunState::Executing,
                next: Some(RunState::Applied),
                input_hash,
                output_hash: json_hash(&record),
                outcome: AuditOutcome::Executed {
                    status: record.status,
                    attempts: record.attempts.len() as u32,
                    exit_code: record.exit_code,
                    error: None,
                },
            };
            run.execution = Some(record);
            if self.record(run, stage).await {
                self.commit(run).await;
            }
            return;
        };

        let stage = StageRecord {
            stage: RunState::Executing,
            next: Some(RunState::Failed),
            input_hash,
            output_hash: json_hash(&record),
            outcome: AuditOutcome::Executed {
                status: ExecutionStatus::Failed,
                attempts: record.attempts.len() as u32,
                exit_code: record.exit_code,
                error: Some(error.clone()),
            },
        };
        run.failure = Some(error);
        run.execution = Some(record.clone());
        if !self.record(run, stage).await {
            return;
        }

        // Failed is always followed by exactly one rollback attempt.
        let rollback = self.engine.rollback(&request, &mut record).await;
        let rollback_error: Option<PipelineError> = rollback.err().map(Into::into);
        let next = match rollback_error {
            None => RunState::RolledBack,
            Some(_) => RunState::RollbackFailed,
        };
        let stage = StageRecord {
            stage: RunState::Failed,
            next: Some(next),
            input_hash: Some(record.rollback.snapshot_ref.clone()).filter(|s| !s.is_empty()),
            output_hash: json_hash(&record),
            outcome: AuditOutcome::RolledBack {
                status: record.status,
                error: rollback_error.clone(),
            },
        };
        run.execution = Some(record);
        run.rollback_error = rollback_error;
        self.record(run, stage).await;
    }

    /// Best-effort commit of an applied artifact.
    async fn commit(&self, run: &mut PipelineRun) {
        let Some(vcs) = &self.vcs else {
            return;
        };
        let Some(request) = CommitRequest::from_run(run) else {
            return;
        };
        match vcs.commit(&request).await {
            Ok(id) => {
                tracing::info!(run_id = %run.id, commit = %id, "artifact committed");
                run.commit = Some(id);
            }
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "commit failed; ledger remains authoritative"),
        }
    }
}
