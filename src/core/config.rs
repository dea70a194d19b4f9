//! Pipeline configuration: YAML parsing, defaults, and validation.
//!
//! Every section has serde defaults so an empty file is a valid config.
//! `validate_config` returns a list of problems (empty = valid).

use crate::core::types::Provider;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name looked up by the CLI.
pub const CONFIG_FILE: &str = "autodevops.yaml";

/// Config validation error.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: String,

    /// Root for the audit ledger, snapshots, and captured outputs.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Actor recorded in audit entries when a submission names none.
    #[serde(default = "default_actor")]
    pub actor: String,

    /// Maximum number of runs executing at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub execution: ExecutionSettings,

    #[serde(default)]
    pub validation: ValidationSettings,

    #[serde(default)]
    pub generation: GenerationSettings,

    #[serde(default)]
    pub retrieval: RetrievalSettings,

    #[serde(default)]
    pub llm: LlmSettings,

    #[serde(default)]
    pub version_control: VersionControlSettings,

    #[serde(default)]
    pub server: ServerSettings,

    /// Per-provider environment variables passed to tool invocations.
    /// Values of the form `${NAME}` are read from the process environment.
    #[serde(default)]
    pub credentials: IndexMap<Provider, IndexMap<String, String>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_actor() -> String {
    "system".to_string()
}

fn default_workers() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            state_dir: default_state_dir(),
            actor: default_actor(),
            workers: default_workers(),
            execution: ExecutionSettings::default(),
            validation: ValidationSettings::default(),
            generation: GenerationSettings::default(),
            retrieval: RetrievalSettings::default(),
            llm: LlmSettings::default(),
            version_control: VersionControlSettings::default(),
            server: ServerSettings::default(),
            credentials: IndexMap::new(),
        }
    }
}

impl PipelineConfig {
    /// A default config rooted at `dir` (state and workspace live under it).
    pub fn rooted_at(dir: &Path) -> Self {
        let mut config = Self::default();
        config.state_dir = dir.join("state");
        config.execution.workdir = dir.join("workspace");
        config.version_control.repo_dir = dir.join("infrastructure");
        config
    }

    /// Environment for tool invocations against `provider`, with `${VAR}`
    /// references expanded from the process environment.
    pub fn credential_env(&self, provider: Provider) -> Vec<(String, String)> {
        let Some(vars) = self.credentials.get(&provider) else {
            return Vec::new();
        };
        vars.iter()
            .map(|(k, v)| (k.clone(), expand_env(v)))
            .collect()
    }
}

fn expand_env(value: &str) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Execution engine settings: retry bounds and per-phase timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout_secs: u64,
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_secs: u64,
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_secs: u64,
    /// Root under which each resource identity gets a working directory.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Inventory passed to ansible-playbook.
    #[serde(default = "default_inventory")]
    pub ansible_inventory: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_snapshot_timeout() -> u64 {
    120
}

fn default_plan_timeout() -> u64 {
    300
}

fn default_apply_timeout() -> u64 {
    1800
}

fn default_verify_timeout() -> u64 {
    300
}

fn default_rollback_timeout() -> u64 {
    1800
}

fn default_workdir() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_inventory() -> String {
    "inventory.ini".to_string()
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            snapshot_timeout_secs: default_snapshot_timeout(),
            plan_timeout_secs: default_plan_timeout(),
            apply_timeout_secs: default_apply_timeout(),
            verify_timeout_secs: default_verify_timeout(),
            rollback_timeout_secs: default_rollback_timeout(),
            workdir: default_workdir(),
            ansible_inventory: default_inventory(),
        }
    }
}

impl ExecutionSettings {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn plan_timeout(&self) -> Duration {
        Duration::from_secs(self.plan_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }
}

/// Validation chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    /// Whether a security failure blocks execution.
    #[serde(default = "default_true")]
    pub security_required: bool,
    /// Whether a compliance failure blocks execution.
    #[serde(default = "default_true")]
    pub compliance_required: bool,
    #[serde(default = "default_required_tags")]
    pub required_tags: Vec<String>,
    #[serde(default = "default_min_backup_days")]
    pub min_backup_retention_days: i64,
    /// Monthly budget; estimates above it produce a warning.
    #[serde(default = "default_budget")]
    pub monthly_budget_usd: f64,
    #[serde(default = "default_hours_per_month")]
    pub hours_per_month: f64,
}

fn default_true() -> bool {
    true
}

fn default_required_tags() -> Vec<String> {
    ["Environment", "Owner", "Project", "CostCenter"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_backup_days() -> i64 {
    7
}

fn default_budget() -> f64 {
    1000.0
}

fn default_hours_per_month() -> f64 {
    730.0
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            security_required: true,
            compliance_required: true,
            required_tags: default_required_tags(),
            min_backup_retention_days: default_min_backup_days(),
            monthly_budget_usd: default_budget(),
            hours_per_month: default_hours_per_month(),
        }
    }
}

/// Values the generators stamp into every artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_cost_center")]
    pub cost_center: String,
    /// Container image used when a request names none.
    #[serde(default = "default_image")]
    pub default_image: String,
}

fn default_owner() -> String {
    "platform-team".to_string()
}

fn default_cost_center() -> String {
    "engineering".to_string()
}

fn default_image() -> String {
    "nginx:1.27".to_string()
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            cost_center: default_cost_center(),
            default_image: default_image(),
        }
    }
}

/// Retrieval collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    /// Directory of reference documents for the keyword retriever.
    #[serde(default)]
    pub corpus_dir: Option<PathBuf>,
}

fn default_top_k() -> usize {
    5
}

fn default_threshold() -> f64 {
    0.75
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_threshold(),
            corpus_dir: None,
        }
    }
}

/// Language-model collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "codellama:7b".to_string()
}

fn default_temperature() -> f64 {
    0.2
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_llm_retries() -> u32 {
    2
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
        }
    }
}

/// Version-control collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionControlSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from("infrastructure")
}

fn default_author_name() -> String {
    "AutoDevOps Bot".to_string()
}

fn default_author_email() -> String {
    "bot@autodevops.local".to_string()
}

impl Default for VersionControlSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_dir: default_repo_dir(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a validated run waits for `/apply` before it is dropped.
    #[serde(default = "default_parked_ttl_secs")]
    pub parked_ttl_secs: u64,
    /// In-memory run reports kept for `/runs/{id}`; older runs are served
    /// from the ledger.
    #[serde(default = "default_max_reports")]
    pub max_reports: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_parked_ttl_secs() -> u64 {
    3600
}

fn default_max_reports() -> usize {
    1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            parked_ttl_secs: default_parked_ttl_secs(),
            max_reports: default_max_reports(),
        }
    }
}

/// Parse a config file from disk.
pub fn parse_config_file(path: &Path) -> Result<PipelineConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<PipelineConfig, String> {
    if yaml.trim().is_empty() {
        return Ok(PipelineConfig::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Parse and validate; all validation errors are joined into one message.
pub fn load_config(path: &Path) -> Result<PipelineConfig, String> {
    let config = parse_config_file(path)?;
    let errors = validate_config(&config);
    if errors.is_empty() {
        Ok(config)
    } else {
        let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
        Err(format!(
            "{} has {} error(s):\n{}",
            path.display(),
            errors.len(),
            lines.join("\n")
        ))
    }
}

/// YAML rendering of the default config, written by `init`.
pub fn default_config_yaml() -> Result<String, String> {
    serde_yaml_ng::to_string(&PipelineConfig::default())
        .map_err(|e| format!("YAML serialize error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &PipelineConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ConfigError { message });

    if config.version != "1.0" {
        err(format!("version must be \"1.0\", got \"{}\"", config.version));
    }
    if config.actor.trim().is_empty() {
        err("actor must not be empty".to_string());
    }
    if config.workers == 0 {
        err("workers must be at least 1".to_string());
    }

    let exec = &config.execution;
    if exec.max_retries > 10 {
        err(format!("execution.max_retries must be <= 10, got {}", exec.max_retries));
    }
    if exec.base_backoff_ms == 0 {
        err("execution.base_backoff_ms must be > 0".to_string());
    }
    if exec.base_backoff_ms > exec.max_backoff_ms {
        err(format!(
            "execution.base_backoff_ms ({}) exceeds max_backoff_ms ({})",
            exec.base_backoff_ms, exec.max_backoff_ms
        ));
    } else if exec.max_retries > 0 {
        // the last retry must still get a longer delay than the one before it
        let last = exec
            .base_backoff_ms
            .saturating_mul(1u64 << (exec.max_retries - 1).min(32));
        if last > exec.max_backoff_ms && exec.max_retries > 1 {
            let prev = exec
                .base_backoff_ms
                .saturating_mul(1u64 << (exec.max_retries - 2).min(32));
            if prev >= exec.max_backoff_ms {
                err(format!(
                    "execution.max_backoff_ms ({}) is too small for {} retries: backoff would stop increasing",
                    exec.max_backoff_ms, exec.max_retries
                ));
            }
        }
    }
    for (name, secs) in [
        ("snapshot_timeout_secs", exec.snapshot_timeout_secs),
        ("plan_timeout_secs", exec.plan_timeout_secs),
        ("apply_timeout_secs", exec.apply_timeout_secs),
        ("verify_timeout_secs", exec.verify_timeout_secs),
        ("rollback_timeout_secs", exec.rollback_timeout_secs),
    ] {
        if secs == 0 {
            err(format!("execution.{} must be > 0", name));
        }
    }

    let val = &config.validation;
    if val.monthly_budget_usd < 0.0 || !val.monthly_budget_usd.is_finite() {
        err(format!(
            "validation.monthly_budget_usd must be a non-negative number, got {}",
            val.monthly_budget_usd
        ));
    }
    if !(val.hours_per_month > 0.0 && val.hours_per_month <= 744.0) {
        err(format!(
            "validation.hours_per_month must be in (0, 744], got {}",
            val.hours_per_month
        ));
    }
    if val.min_backup_retention_days < 0 {
        err("validation.min_backup_retention_days must be >= 0".to_string());
    }
    for tag in &val.required_tags {
        if tag.trim().is_empty() || tag.contains(char::is_whitespace) {
            err(format!("validation.required_tags has invalid tag name '{}'", tag));
        }
    }

    let ret = &config.retrieval;
    if ret.top_k == 0 {
        err("retrieval.top_k must be at least 1".to_string());
    }
    if !(0.0..=1.0).contains(&ret.similarity_threshold) {
        err(format!(
            "retrieval.similarity_threshold must be in [0, 1], got {}",
            ret.similarity_threshold
        ));
    }

    let llm = &config.llm;
    if !(0.0..=2.0).contains(&llm.temperature) {
        err(format!("llm.temperature must be in [0, 2], got {}", llm.temperature));
    }
    if llm.enabled && !(llm.endpoint.starts_with("http://") || llm.endpoint.starts_with("https://"))
    {
        err(format!("llm.endpoint must be an http(s) URL, got '{}'", llm.endpoint));
    }
    if llm.timeout_secs == 0 {
        err("llm.timeout_secs must be > 0".to_string());
    }

    if config.server.parked_ttl_secs == 0 {
        err("server.parked_ttl_secs must be > 0".to_string());
    }
    if config.server.max_reports == 0 {
        err("server.max_reports must be at least 1".to_string());
    }

    if config.version_control.enabled && config.version_control.author_email.trim().is_empty() {
        err("version_control.author_email must not be empty".to_string());
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_empty_is_default() {
        let config = parse_config("").unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.workers, 4);
        assert_eq!(config.execution.max_retries, 3);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.similarity_threshold - 0.75).abs() < f64::EPSILON);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_config_parse_partial_sections() {
        let yaml = r#"
version: "1.0"
actor: ci-bot
execution:
  max_retries: 2
  base_backoff_ms: 100
validation:
  compliance_required: false
  monthly_budget_usd: 250
credentials:
  aws:
    AWS_PROFILE: staging
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.actor, "ci-bot");
        assert_eq!(config.execution.max_retries, 2);
        assert_eq!(config.execution.max_backoff_ms, 30_000);
        assert!(!config.validation.compliance_required);
        assert!(config.validation.security_required);
        assert_eq!(config.validation.required_tags.len(), 4);
        assert_eq!(
            config.credential_env(Provider::Aws),
            vec![("AWS_PROFILE".to_string(), "staging".to_string())]
        );
        assert!(config.credential_env(Provider::Gcp).is_empty());
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_config_parse_error() {
        let err = parse_config("workers: [not, a, number]").unwrap_err();
        assert!(err.contains("YAML parse error"));
    }

    #[test]
    fn test_config_validate_collects_all_errors() {
        let mut config = PipelineConfig::default();
        config.version = "2.0".into();
        config.workers = 0;
        config.retrieval.similarity_threshold = 1.5;
        config.validation.hours_per_month = 0.0;
        config.server.max_reports = 0;
        let errors = validate_config(&config);
        assert_eq!(errors.len(), 5, "{:?}", errors);
        assert!(errors[0].message.contains("version"));
    }

    #[test]
    fn test_config_validate_backoff_schedule() {
        let mut config = PipelineConfig::default();
        config.execution.base_backoff_ms = 1000;
        config.execution.max_backoff_ms = 1000;
        config.execution.max_retries = 3;
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("stop increasing")));

        config.execution.base_backoff_ms = 5000;
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.message.contains("exceeds max_backoff_ms")));
    }

    #[test]
    fn test_config_default_yaml_roundtrips() {
        let yaml = default_config_yaml().unwrap();
        assert!(yaml.contains("max_retries"));
        let config = parse_config(&yaml).unwrap();
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn test_config_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "workers: 0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.contains("autodevops.yaml has 1 error(s)"));
    }

    #[test]
    fn test_config_credential_env_expansion() {
        std::env::set_var("AUTODEVOPS_TEST_TOKEN", "s3cr3t");
        let mut config = PipelineConfig::default();
        let mut vars = IndexMap::new();
        vars.insert("ARM_CLIENT_SECRET".to_string(), "${AUTODEVOPS_TEST_TOKEN}".to_string());
        config.credentials.insert(Provider::Azure, vars);
        assert_eq!(
            config.credential_env(Provider::Azure),
            vec![("ARM_CLIENT_SECRET".to_string(), "s3cr3t".to_string())]
        );
    }

    #[test]
    fn test_config_rooted_at() {
        let config = PipelineConfig::rooted_at(Path::new("/tmp/x"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/x/state"));
        assert_eq!(config.execution.workdir, PathBuf::from("/tmp/x/workspace"));
    }
}
