//! Pipeline data model: requests, retrieved context, artifacts, verdicts,
//! execution records, audit entries, and the run aggregate.
//!
//! Everything here derives Serialize/Deserialize: runs are reported over the
//! HTTP API and audit entries are persisted as JSONL.

use crate::audit::hasher;
use crate::core::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Request vocabulary
// ============================================================================

/// What kind of infrastructure a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Compute,
    Network,
    Storage,
    Database,
    Pipeline,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        Self::Compute,
        Self::Network,
        Self::Storage,
        Self::Database,
        Self::Pipeline,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Network => write!(f, "network"),
            Self::Storage => write!(f, "storage"),
            Self::Database => write!(f, "database"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compute" => Ok(Self::Compute),
            "network" => Ok(Self::Network),
            "storage" => Ok(Self::Storage),
            "database" => Ok(Self::Database),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Where the infrastructure lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "aws")]
    Aws,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "gcp")]
    Gcp,
    #[serde(rename = "on-prem")]
    OnPrem,
    #[serde(rename = "k8s")]
    K8s,
}

impl Provider {
    /// Whether this provider is a public cloud with a Terraform provider.
    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::Aws | Self::Azure | Self::Gcp)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Azure => write!(f, "azure"),
            Self::Gcp => write!(f, "gcp"),
            Self::OnPrem => write!(f, "on-prem"),
            Self::K8s => write!(f, "k8s"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            "on-prem" => Ok(Self::OnPrem),
            "k8s" => Ok(Self::K8s),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Target IaC format. Each format has one generator family and one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    Terraform,
    Kubernetes,
    Ansible,
    Docker,
}

impl TargetFormat {
    /// File name the artifact is written to inside a working directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Terraform => "main.tf",
            Self::Kubernetes => "manifest.yaml",
            Self::Ansible => "playbook.yml",
            Self::Docker => "docker-compose.yml",
        }
    }

    /// Line-comment prefix for the format.
    pub fn comment_prefix(&self) -> &'static str {
        "#"
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terraform => write!(f, "terraform"),
            Self::Kubernetes => write!(f, "kubernetes"),
            Self::Ansible => write!(f, "ansible"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terraform" => Ok(Self::Terraform),
            "kubernetes" => Ok(Self::Kubernetes),
            "ansible" => Ok(Self::Ansible),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown target format: {}", other)),
        }
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AttrValue>),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(n) => write!(f, "{}", n),
            Self::Float(x) => write!(f, "{}", x),
            Self::Text(s) => write!(f, "{}", s),
            Self::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

// ============================================================================
// Raw intent and conversational context
// ============================================================================

/// Free-form key/value extraction result, possibly incomplete or ambiguous.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawIntent {
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl RawIntent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn overlay(mut self, other: &RawIntent) -> Self {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
        self
    }

    /// Fill only keys that are absent from `self`.
    pub fn fill_from(mut self, other: &RawIntent) -> Self {
        for (k, v) in &other.fields {
            self.fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// BLAKE3 of the canonical JSON encoding (BTreeMap keeps key order stable).
    pub fn content_hash(&self) -> String {
        hasher::hash_string(&serde_json::to_string(&self.fields).unwrap_or_default())
    }
}

/// Defaults carried over from earlier conversation turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub format: Option<TargetFormat>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

// ============================================================================
// Infrastructure request
// ============================================================================

/// Canonical, typed description of desired infrastructure.
///
/// Fields are private: a request is immutable once the resolver builds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfrastructureRequest {
    kind: ResourceKind,
    provider: Provider,
    format: TargetFormat,
    attributes: BTreeMap<String, AttrValue>,
}

impl InfrastructureRequest {
    pub fn new(
        kind: ResourceKind,
        provider: Provider,
        format: TargetFormat,
        attributes: BTreeMap<String, AttrValue>,
    ) -> Self {
        Self {
            kind,
            provider,
            format,
            attributes,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn format(&self) -> TargetFormat {
        self.format
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        &self.attributes
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn int_attr(&self, key: &str, default: i64) -> i64 {
        self.attr(key).and_then(AttrValue::as_i64).unwrap_or(default)
    }

    pub fn bool_attr(&self, key: &str, default: bool) -> bool {
        self.attr(key).and_then(AttrValue::as_bool).unwrap_or(default)
    }

    pub fn text_attr(&self, key: &str, default: &str) -> String {
        match self.attr(key) {
            Some(AttrValue::Text(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    pub fn name(&self) -> String {
        self.text_attr("name", "app")
    }

    /// Identity of the underlying infrastructure resource. Runs with the same
    /// identity serialize their execution.
    pub fn resource_identity(&self) -> String {
        format!("{}/{}/{}", self.provider, self.kind, self.name())
    }

    /// One-line human summary, used in commit subjects and logs.
    pub fn summary(&self) -> String {
        format!("{} on {} via {}", self.kind, self.provider, self.format)
    }

    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn content_hash(&self) -> String {
        hasher::hash_string(&self.canonical_json())
    }
}

// ============================================================================
// Retrieved context
// ============================================================================

/// One retrieved document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    pub score: f64,
    pub snippet: String,
}

/// Ordered retrieval result, highest score first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievedContext {
    pub documents: Vec<RetrievedDocument>,
}

impl RetrievedContext {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rank documents: drop non-finite scores and scores outside [threshold, 1],
    /// sort by descending score (ties by id), truncate to `top_k`.
    pub fn ranked(mut documents: Vec<RetrievedDocument>, top_k: usize, threshold: f64) -> Self {
        documents.retain(|d| d.score.is_finite() && d.score >= threshold && d.score <= 1.0);
        documents.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        documents.truncate(top_k);
        Self { documents }
    }

    /// Check ordering and score bounds of a context received from outside.
    pub fn check(&self) -> Result<(), String> {
        for (i, doc) in self.documents.iter().enumerate() {
            if doc.id.trim().is_empty() {
                return Err(format!("document #{} has an empty id", i));
            }
            if !doc.score.is_finite() || !(0.0..=1.0).contains(&doc.score) {
                return Err(format!(
                    "document '{}' has score {} outside [0,1]",
                    doc.id, doc.score
                ));
            }
            if i > 0 && doc.score > self.documents[i - 1].score {
                return Err(format!(
                    "document '{}' is out of order (score {} after {})",
                    doc.id,
                    doc.score,
                    self.documents[i - 1].score
                ));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Hash of (id, score) pairs; identifies the context in audit entries.
    pub fn fingerprint(&self) -> String {
        let parts: Vec<String> = self
            .documents
            .iter()
            .map(|d| format!("{}@{:.4}", d.id, d.score))
            .collect();
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        hasher::composite_hash(&refs)
    }
}

// ============================================================================
// Generated artifact
// ============================================================================

/// Produced IaC source text for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    id: Uuid,
    format: TargetFormat,
    content: String,
    content_hash: String,
    request_hash: String,
    generator: String,
}

impl GeneratedArtifact {
    pub fn new(
        request: &InfrastructureRequest,
        generator: &str,
        content: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            format: request.format(),
            content_hash: hasher::hash_string(&content),
            content,
            request_hash: request.content_hash(),
            generator: generator.to_string(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn format(&self) -> TargetFormat {
        self.format
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Back-reference to the request that produced this artifact.
    pub fn request_hash(&self) -> &str {
        &self.request_hash
    }

    pub fn generator(&self) -> &str {
        &self.generator
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Status a finding of this severity imposes on its validator.
    pub fn status(&self) -> VerdictStatus {
        match self {
            Self::Critical | Self::High => VerdictStatus::Fail,
            Self::Medium | Self::Low => VerdictStatus::Warn,
            Self::Info => VerdictStatus::Pass,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Pass/warn/fail. Ordered so the aggregate is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Warn => write!(f, "warn"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// A single validator finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    /// 1-based line in the artifact, when the finding can be located.
    #[serde(default)]
    pub line: Option<usize>,
}

impl Finding {
    pub fn new(rule: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule: rule.to_string(),
            severity,
            message: message.into(),
            line: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

/// Validators in canonical chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorKind {
    Syntax,
    Security,
    Compliance,
    Cost,
}

impl fmt::Display for ValidatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syntax => write!(f, "syntax"),
            Self::Security => write!(f, "security"),
            Self::Compliance => write!(f, "compliance"),
            Self::Cost => write!(f, "cost"),
        }
    }
}

/// One line of a cost estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLineItem {
    pub resource: String,
    pub unit: String,
    pub quantity: f64,
    pub hourly_usd: f64,
    pub monthly_usd: f64,
}

/// Monthly cost estimate attached to a verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub monthly_usd: f64,
    pub line_items: Vec<CostLineItem>,
}

/// Result of one validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubVerdict {
    pub validator: ValidatorKind,
    pub status: VerdictStatus,
    pub required: bool,
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostEstimate>,
}

impl SubVerdict {
    /// Status is the worst status imposed by any finding (pass when none).
    pub fn from_findings(validator: ValidatorKind, required: bool, findings: Vec<Finding>) -> Self {
        let status = findings
            .iter()
            .map(|f| f.severity.status())
            .max()
            .unwrap_or(VerdictStatus::Pass);
        Self {
            validator,
            status,
            required,
            findings,
            cost: None,
        }
    }
}

/// Authorization to execute despite blocking security/compliance findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOverride {
    pub actor: String,
    pub reason: String,
}

/// Aggregated verdict of the validation chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub status: VerdictStatus,
    pub sub_verdicts: Vec<SubVerdict>,
    /// True when a syntax failure stopped the chain.
    pub short_circuited: bool,
    #[serde(default)]
    pub cost: Option<CostEstimate>,
    /// Override that let a failing verdict through, if any.
    #[serde(default)]
    pub exception: Option<ValidationOverride>,
}

impl ValidationVerdict {
    /// Aggregate sub-verdicts: fail if any required validator failed, else the
    /// worst of the remaining statuses (a non-required failure counts as warn).
    pub fn aggregate(sub_verdicts: Vec<SubVerdict>, short_circuited: bool) -> Self {
        let status = sub_verdicts
            .iter()
            .map(|s| match (s.status, s.required) {
                (VerdictStatus::Fail, false) => VerdictStatus::Warn,
                (status, _) => status,
            })
            .max()
            .unwrap_or(VerdictStatus::Pass);
        let cost = sub_verdicts.iter().find_map(|s| s.cost.clone());
        Self {
            status,
            sub_verdicts,
            short_circuited,
            cost,
            exception: None,
        }
    }

    /// Required validators that failed.
    pub fn blocking_validators(&self) -> Vec<ValidatorKind> {
        self.sub_verdicts
            .iter()
            .filter(|s| s.required && s.status == VerdictStatus::Fail)
            .map(|s| s.validator)
            .collect()
    }

    pub fn syntax_failed(&self) -> bool {
        self.sub_verdicts
            .iter()
            .any(|s| s.validator == ValidatorKind::Syntax && s.status == VerdictStatus::Fail)
    }

    pub fn sub_verdict(&self, kind: ValidatorKind) -> Option<&SubVerdict> {
        self.sub_verdicts.iter().find(|s| s.validator == kind)
    }

    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.sub_verdicts.iter().flat_map(|s| s.findings.iter())
    }

    pub fn findings_count(&self) -> usize {
        self.sub_verdicts.iter().map(|s| s.findings.len()).sum()
    }

    /// Whether execution may proceed. A syntax failure can never be overridden.
    pub fn gate_open(&self) -> bool {
        match self.status {
            VerdictStatus::Pass | VerdictStatus::Warn => true,
            VerdictStatus::Fail => !self.syntax_failed() && self.exception.is_some(),
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Phase of the execution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Snapshot,
    Plan,
    Apply,
    Verify,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => write!(f, "snapshot"),
            Self::Plan => write!(f, "plan"),
            Self::Apply => write!(f, "apply"),
            Self::Verify => write!(f, "verify"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

/// Classification of an external tool's exit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Success,
    Transient,
    Hard,
}

impl fmt::Display for ExitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Transient => write!(f, "transient"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// One external tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub phase: Phase,
    pub command: String,
    pub exit_code: Option<i32>,
    pub class: ExitClass,
    pub timed_out: bool,
    /// Content-addressed reference to captured stdout.
    pub stdout_ref: Option<String>,
    /// Content-addressed reference to captured stderr.
    pub stderr_ref: Option<String>,
    pub duration_ms: u64,
}

/// One attempt of the Apply phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Delay slept before this attempt (0 for the first).
    pub backoff_ms: u64,
    pub class: ExitClass,
    pub exit_code: Option<i32>,
}

/// Enough information to restore the pre-change state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackHandle {
    pub identity: String,
    pub format: TargetFormat,
    /// Reference to the snapshot manifest in the snapshot store.
    pub snapshot_ref: String,
    /// Reference to the artifact that was in place before this run, if any.
    pub prior_artifact_ref: Option<String>,
    pub workdir: PathBuf,
}

/// Outcome status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Applied,
    Failed,
    RolledBack,
    RollbackFailed,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled-back"),
            Self::RollbackFailed => write!(f, "rollback-failed"),
        }
    }
}

/// Outcome of applying an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub artifact_id: Uuid,
    pub status: ExecutionStatus,
    /// Exit code of the last Apply attempt, if Apply ran.
    pub exit_code: Option<i32>,
    pub stdout_ref: Option<String>,
    pub stderr_ref: Option<String>,
    /// Captured plan output (the diff).
    pub plan_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub rollback: RollbackHandle,
    /// Whether Apply was started (a change may have happened).
    pub apply_started: bool,
    pub attempts: Vec<ApplyAttempt>,
    pub invocations: Vec<ToolInvocation>,
}

// ============================================================================
// Run state machine
// ============================================================================

/// Pipeline run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Resolving,
    Generating,
    Validating,
    Executing,
    Applied,
    Failed,
    RolledBack,
    RollbackFailed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::RolledBack | Self::RollbackFailed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolving => write!(f, "resolving"),
            Self::Generating => write!(f, "generating"),
            Self::Validating => write!(f, "validating"),
            Self::Executing => write!(f, "executing"),
            Self::Applied => write!(f, "applied"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled-back"),
            Self::RollbackFailed => write!(f, "rollback-failed"),
        }
    }
}

// ============================================================================
// Audit
// ============================================================================

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    Resolved {
        intent: RawIntent,
        request: InfrastructureRequest,
    },
    Generated {
        generator: String,
        artifact_id: Uuid,
        bytes: usize,
        context_documents: usize,
    },
    Validated {
        status: VerdictStatus,
        findings: usize,
        blocking: Vec<ValidatorKind>,
        #[serde(default)]
        exception: Option<ValidationOverride>,
    },
    Executed {
        status: ExecutionStatus,
        attempts: u32,
        exit_code: Option<i32>,
        #[serde(default)]
        error: Option<PipelineError>,
    },
    RolledBack {
        status: ExecutionStatus,
        #[serde(default)]
        error: Option<PipelineError>,
    },
    Error {
        error: PipelineError,
    },
    Cancelled,
}

/// A stage record before the ledger stamps it with sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub stage: RunState,
    pub next: Option<RunState>,
    pub input_hash: Option<String>,
    pub output_hash: Option<String>,
    pub outcome: AuditOutcome,
}

/// One immutable audit record per stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    /// The state whose work this entry records.
    pub stage: RunState,
    /// State the run moved to; `None` when the run halted here.
    pub next: Option<RunState>,
    #[serde(default)]
    pub input_hash: Option<String>,
    #[serde(default)]
    pub output_hash: Option<String>,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
}

// ============================================================================
// Submission and run aggregate
// ============================================================================

/// A request to run the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    /// Natural-language prompt (may be empty when `fields` is complete).
    #[serde(default)]
    pub prompt: String,
    /// Explicit fields; these win over anything extracted from the prompt.
    #[serde(default)]
    pub fields: RawIntent,
    #[serde(default)]
    pub context: ConversationContext,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub validation_override: Option<ValidationOverride>,
}

impl Submission {
    pub fn from_fields(fields: RawIntent) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            ..Self::default()
        }
    }
}

/// The aggregate root of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub state: RunState,
    pub actor: String,
    pub created_at: DateTime<Utc>,
    pub submission: Submission,
    pub intent: Option<RawIntent>,
    pub request: Option<InfrastructureRequest>,
    pub context: Option<RetrievedContext>,
    pub artifact: Option<GeneratedArtifact>,
    pub verdict: Option<ValidationVerdict>,
    pub execution: Option<ExecutionRecord>,
    pub audit: Vec<AuditEntry>,
    /// Why the run stopped before execution (or was cancelled).
    pub halt: Option<PipelineError>,
    /// Execution-stage error that sent the run to `Failed`.
    pub failure: Option<PipelineError>,
    /// Error raised by the rollback attempt.
    pub rollback_error: Option<PipelineError>,
    /// Version-control commit id, when the best-effort commit succeeded.
    pub commit: Option<String>,
}

impl PipelineRun {
    pub fn new(actor: &str, submission: Submission) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: RunState::Resolving,
            actor: actor.to_string(),
            created_at: Utc::now(),
            submission,
            intent: None,
            request: None,
            context: None,
            artifact: None,
            verdict: None,
            execution: None,
            audit: Vec::new(),
            halt: None,
            failure: None,
            rollback_error: None,
            commit: None,
        }
    }

    /// Whether the run passed validation and waits for execution: the last
    /// entry moved it from `Validating` into `Executing` and nothing ran since.
    pub fn ready_for_execution(&self) -> bool {
        self.halt.is_none()
            && self.state == RunState::Executing
            && self.artifact.is_some()
            && self.verdict.as_ref().is_some_and(ValidationVerdict::gate_open)
            && self
                .audit
                .last()
                .is_some_and(|e| e.stage == RunState::Validating && e.next == Some(RunState::Executing))
    }

    /// Whether nothing more will happen to this run.
    pub fn is_finished(&self) -> bool {
        self.halt.is_some() || self.state.is_terminal()
    }

    /// The most specific error describing why the run did not reach `Applied`.
    pub fn error(&self) -> Option<&PipelineError> {
        self.rollback_error
            .as_ref()
            .or(self.failure.as_ref())
            .or(self.halt.as_ref())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InfrastructureRequest {
        let mut attrs = BTreeMap::new();
        attrs.insert("instances".to_string(), AttrValue::Int(3));
        attrs.insert("has_load_balancer".to_string(), AttrValue::Bool(true));
        InfrastructureRequest::new(
            ResourceKind::Compute,
            Provider::Aws,
            TargetFormat::Terraform,
            attrs,
        )
    }

    #[test]
    fn test_types_enum_display_and_parse() {
        assert_eq!(ResourceKind::Compute.to_string(), "compute");
        assert_eq!("storage".parse::<ResourceKind>().unwrap(), ResourceKind::Storage);
        assert_eq!(Provider::OnPrem.to_string(), "on-prem");
        assert_eq!("K8S".parse::<Provider>().unwrap(), Provider::K8s);
        assert_eq!("ansible".parse::<TargetFormat>().unwrap(), TargetFormat::Ansible);
        assert_eq!("Docker".parse::<TargetFormat>().unwrap(), TargetFormat::Docker);
        assert_eq!(TargetFormat::Docker.file_name(), "docker-compose.yml");
        assert!("cloudformation".parse::<TargetFormat>().is_err());
    }

    #[test]
    fn test_types_provider_serde_names() {
        let json = serde_json::to_string(&Provider::OnPrem).unwrap();
        assert_eq!(json, "\"on-prem\"");
        let p: Provider = serde_json::from_str("\"k8s\"").unwrap();
        assert_eq!(p, Provider::K8s);
    }

    #[test]
    fn test_types_attr_value_untagged() {
        let v: AttrValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, AttrValue::Int(3));
        let v: AttrValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, AttrValue::Bool(true));
        let v: AttrValue = serde_json::from_str("\"t3.micro\"").unwrap();
        assert_eq!(v.as_str(), Some("t3.micro"));
        let v: AttrValue = serde_json::from_str("[80, 443]").unwrap();
        assert_eq!(v.to_string(), "[80, 443]");
    }

    #[test]
    fn test_types_request_identity_and_hash() {
        let r = request();
        assert_eq!(r.resource_identity(), "aws/compute/app");
        assert_eq!(r.int_attr("instances", 1), 3);
        assert!(r.bool_attr("has_load_balancer", false));
        assert_eq!(r.content_hash(), request().content_hash());
        assert!(r.content_hash().starts_with("blake3:"));
    }

    #[test]
    fn test_types_context_ranked() {
        let docs = vec![
            RetrievedDocument { id: "b".into(), score: 0.8, snippet: String::new() },
            RetrievedDocument { id: "a".into(), score: 0.9, snippet: String::new() },
            RetrievedDocument { id: "c".into(), score: 0.2, snippet: String::new() },
            RetrievedDocument { id: "d".into(), score: f64::NAN, snippet: String::new() },
        ];
        let ctx = RetrievedContext::ranked(docs, 5, 0.5);
        let ids: Vec<_> = ctx.documents.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn test_types_context_check_rejects_disorder() {
        let ctx = RetrievedContext {
            documents: vec![
                RetrievedDocument { id: "a".into(), score: 0.3, snippet: String::new() },
                RetrievedDocument { id: "b".into(), score: 0.9, snippet: String::new() },
            ],
        };
        assert!(ctx.check().unwrap_err().contains("out of order"));
        let ctx = RetrievedContext {
            documents: vec![RetrievedDocument { id: "a".into(), score: 1.5, snippet: String::new() }],
        };
        assert!(ctx.check().is_err());
    }

    #[test]
    fn test_types_severity_status() {
        assert_eq!(Severity::Critical.status(), VerdictStatus::Fail);
        assert_eq!(Severity::High.status(), VerdictStatus::Fail);
        assert_eq!(Severity::Medium.status(), VerdictStatus::Warn);
        assert_eq!(Severity::Low.status(), VerdictStatus::Warn);
        assert_eq!(Severity::Info.status(), VerdictStatus::Pass);
    }

    #[test]
    fn test_types_verdict_aggregate() {
        let syntax = SubVerdict::from_findings(ValidatorKind::Syntax, true, vec![]);
        let security = SubVerdict::from_findings(
            ValidatorKind::Security,
            true,
            vec![Finding::new("k8s-limits", Severity::Medium, "no limits")],
        );
        let compliance = SubVerdict::from_findings(
            ValidatorKind::Compliance,
            false,
            vec![Finding::new("encryption", Severity::High, "unencrypted")],
        );
        let verdict = ValidationVerdict::aggregate(vec![syntax, security, compliance], false);
        assert_eq!(verdict.status, VerdictStatus::Warn);
        assert!(verdict.blocking_validators().is_empty());
        assert!(verdict.gate_open());
        assert_eq!(verdict.findings_count(), 2);
    }

    #[test]
    fn test_types_gate_override_never_covers_syntax() {
        let syntax = SubVerdict::from_findings(
            ValidatorKind::Syntax,
            true,
            vec![Finding::new("braces", Severity::Critical, "unbalanced")],
        );
        let mut verdict = ValidationVerdict::aggregate(vec![syntax], true);
        verdict.exception = Some(ValidationOverride {
            actor: "alice".into(),
            reason: "urgent".into(),
        });
        assert!(!verdict.gate_open());
    }

    #[test]
    fn test_types_raw_intent_overlay_and_fill() {
        let extracted = RawIntent::new().with("provider", "aws").with("instances", 2);
        let explicit = RawIntent::new().with("instances", 3);
        let merged = extracted.clone().overlay(&explicit);
        assert_eq!(merged.get("instances"), Some(&serde_json::json!(3)));
        let filled = explicit.fill_from(&extracted);
        assert_eq!(filled.get("instances"), Some(&serde_json::json!(3)));
        assert_eq!(filled.get("provider"), Some(&serde_json::json!("aws")));
    }

    #[test]
    fn test_types_audit_entry_serde_flattens_outcome() {
        let entry = AuditEntry {
            run_id: Uuid::nil(),
            sequence: 0,
            timestamp: Utc::now(),
            actor: "system".into(),
            stage: RunState::Validating,
            next: Some(RunState::Executing),
            input_hash: None,
            output_hash: None,
            outcome: AuditOutcome::Validated {
                status: VerdictStatus::Pass,
                findings: 0,
                blocking: vec![],
                exception: None,
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"outcome\":\"validated\""));
        let back: AuditEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_types_ready_for_execution_after_open_gate() {
        let req = request();
        let mut run = PipelineRun::new("alice", Submission::default());
        run.artifact = Some(GeneratedArtifact::new(&req, "terraform", "x".into()));
        run.verdict = Some(ValidationVerdict::aggregate(Vec::new(), false));
        run.audit.push(AuditEntry {
            run_id: run.id,
            sequence: 2,
            timestamp: Utc::now(),
            actor: "alice".into(),
            stage: RunState::Validating,
            next: Some(RunState::Executing),
            input_hash: None,
            output_hash: None,
            outcome: AuditOutcome::Validated {
                status: VerdictStatus::Pass,
                findings: 0,
                blocking: vec![],
                exception: None,
            },
        });
        run.state = RunState::Executing;
        assert!(run.ready_for_execution());

        run.state = RunState::Applied;
        assert!(!run.ready_for_execution());
        run.state = RunState::Executing;
        run.halt = Some(PipelineError::Cancelled {
            stage: RunState::Executing,
        });
        assert!(!run.ready_for_execution());
    }

    #[test]
    fn test_types_run_state_terminal() {
        assert!(RunState::Applied.is_terminal());
        assert!(RunState::RollbackFailed.is_terminal());
        assert!(!RunState::Failed.is_terminal());
        assert!(!RunState::Executing.is_terminal());
    }
}
