//! Per-backend argument contracts and exit classification.
//!
//! Commands are built without a working directory; the engine runs them
//! inside the resource's workdir, which holds the artifact file.

use crate::core::types::{ExitClass, TargetFormat};
use crate::transport::{CommandSpec, ExecOutput};
use regex::Regex;
use std::sync::LazyLock;

static COMMON_TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)timed out|timeout|connection refused|connection reset|too many requests|throttl|rate exceeded|temporarily unavailable|i/o timeout",
    )
    .expect("valid regex")
});
static TERRAFORM_TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error acquiring the state lock|state lock|RequestLimitExceeded|503 Service Unavailable")
        .expect("valid regex")
});
static KUBECTL_TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"etcdserver: request timed out|the object has been modified|Unable to connect to the server|ServiceUnavailable",
    )
    .expect("valid regex")
});
static ANSIBLE_TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"UNREACHABLE!|Failed to connect to the host|Timeout \(\d+s\) waiting for privilege escalation")
        .expect("valid regex")
});
static COMPOSE_TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Cannot connect to the Docker daemon|toomanyrequests|TLS handshake timeout|error pulling image|net/http: request canceled",
    )
    .expect("valid regex")
});
static ANSIBLE_CHANGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bchanged=(\d+)").expect("valid regex"));

/// Result of comparing live state with the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    Drift,
    Failed,
}

/// A backend's command contract.
pub trait Backend: Send + Sync {
    fn format(&self) -> TargetFormat;

    /// Dump of live state taken before a change, if the tool can produce one.
    fn state_dump(&self) -> Option<CommandSpec>;

    /// Dry-run commands, run in order; the last one's output is the diff.
    fn plan(&self) -> Vec<CommandSpec>;

    fn apply(&self) -> CommandSpec;

    fn verify(&self) -> CommandSpec;

    fn verify_outcome(&self, out: &ExecOutput) -> VerifyOutcome;

    /// Re-apply the artifact file currently in the workdir (used after the
    /// prior artifact has been restored).
    fn restore(&self) -> CommandSpec;

    /// Remove everything the artifact created; `None` when the tool cannot.
    fn destroy(&self) -> Option<CommandSpec>;

    /// Backend-specific transient error patterns.
    fn transient_patterns(&self) -> &Regex;
}

/// Classify a tool exit: success, transient (retryable) or hard.
pub fn classify(backend: &dyn Backend, out: &ExecOutput) -> ExitClass {
    if out.success() {
        return ExitClass::Success;
    }
    if out.timed_out {
        return ExitClass::Transient;
    }
    let text = format!("{}\n{}", out.stderr, out.stdout);
    if backend.transient_patterns().is_match(&text) || COMMON_TRANSIENT.is_match(&text) {
        ExitClass::Transient
    } else {
        ExitClass::Hard
    }
}

// ============================================================================
// Terraform
// ============================================================================

pub struct TerraformBackend;

impl Backend for TerraformBackend {
    fn format(&self) -> TargetFormat {
        TargetFormat::Terraform
    }

    fn state_dump(&self) -> Option<CommandSpec> {
        Some(CommandSpec::new("terraform", &["show", "-json", "-no-color"]))
    }

    fn plan(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("terraform", &["init", "-input=false", "-no-color"]),
            CommandSpec::new(
                "terraform",
                &["plan", "-input=false", "-no-color", "-out=tfplan"],
            ),
        ]
    }

    fn apply(&self) -> CommandSpec {
        CommandSpec::new(
            "terraform",
            &["apply", "-input=false", "-no-color", "-auto-approve", "tfplan"],
        )
    }

    fn verify(&self) -> CommandSpec {
        CommandSpec::new(
            "terraform",
            &["plan", "-input=false", "-no-color", "-detailed-exitcode"],
        )
    }

    fn verify_outcome(&self, out: &ExecOutput) -> VerifyOutcome {
        match (out.timed_out, out.exit_code) {
            (false, 0) => VerifyOutcome::Match,
            (false, 2) => VerifyOutcome::Drift,
            _ => VerifyOutcome::Failed,
        }
    }

    fn restore(&self) -> CommandSpec {
        CommandSpec::new(
            "terraform",
            &["apply", "-input=false", "-no-color", "-auto-approve"],
        )
    }

    fn destroy(&self) -> Option<CommandSpec> {
        Some(CommandSpec::new(
            "terraform",
            &["destroy", "-input=false", "-no-color", "-auto-approve"],
        ))
    }

    fn transient_patterns(&self) -> &Regex {
        &TERRAFORM_TRANSIENT
    }
}

// ============================================================================
// Kubernetes
// ============================================================================

pub struct KubectlBackend;

const MANIFEST: &str = "manifest.yaml";

impl Backend for KubectlBackend {
    fn format(&self) -> TargetFormat {
        TargetFormat::Kubernetes
    }

    fn state_dump(&self) -> Option<CommandSpec> {
        Some(CommandSpec::new(
            "kubectl",
            &["get", "-f", MANIFEST, "-o", "yaml", "--ignore-not-found"],
        ))
    }

    fn plan(&self) -> Vec<CommandSpec> {
        vec![CommandSpec::new(
            "kubectl",
            &["apply", "--dry-run=server", "-f", MANIFEST],
        )]
    }

    fn apply(&self) -> CommandSpec {
        CommandSpec::new("kubectl", &["apply", "-f", MANIFEST])
    }

    fn verify(&self) -> CommandSpec {
        CommandSpec::new("kubectl", &["diff", "-f", MANIFEST])
    }

    fn verify_outcome(&self, out: &ExecOutput) -> VerifyOutcome {
        match (out.timed_out, out.exit_code) {
            (false, 0) => VerifyOutcome::Match,
            (false, 1) => VerifyOutcome::Drift,
            _ => VerifyOutcome::Failed,
        }
    }

    fn restore(&self) -> CommandSpec {
        self.apply()
    }

    fn destroy(&self) -> Option<CommandSpec> {
        Some(CommandSpec::new(
            "kubectl",
            &["delete", "-f", MANIFEST, "--ignore-not-found"],
        ))
    }

    fn transient_patterns(&self) -> &Regex {
        &KUBECTL_TRANSIENT
    }
}

// ============================================================================
// Ansible
// ============================================================================

pub struct AnsibleBackend {
    inventory: String,
}

const PLAYBOOK: &str = "playbook.yml";

impl AnsibleBackend {
    pub fn new(inventory: &str) -> Self {
        Self {
            inventory: inventory.to_string(),
        }
    }

    fn playbook(&self, extra: &[&str]) -> CommandSpec {
        let mut args = extra.to_vec();
        args.extend(["-i", self.inventory.as_str(), PLAYBOOK]);
        CommandSpec::new("ansible-playbook", &args)
    }
}

impl Backend for AnsibleBackend {
    fn format(&self) -> TargetFormat {
        TargetFormat::Ansible
    }

    fn state_dump(&self) -> Option<CommandSpec> {
        None
    }

    fn plan(&self) -> Vec<CommandSpec> {
        vec![self.playbook(&["--check", "--diff"])]
    }

    fn apply(&self) -> CommandSpec {
        self.playbook(&[])
    }

    fn verify(&self) -> CommandSpec {
        self.playbook(&["--check"])
    }

    /// A check run is a match when every host in the recap reports `changed=0`.
    fn verify_outcome(&self, out: &ExecOutput) -> VerifyOutcome {
        if !out.success() {
            return VerifyOutcome::Failed;
        }
        let drift = ANSIBLE_CHANGED
            .captures_iter(&out.stdout)
            .any(|c| c[1].parse::<u64>().map_or(true, |n| n > 0));
        if drift {
            VerifyOutcome::Drift
        } else {
            VerifyOutcome::Match
        }
    }

    fn restore(&self) -> CommandSpec {
        self.apply()
    }

    fn destroy(&self) -> Option<CommandSpec> {
        None
    }

    fn transient_patterns(&self) -> &Regex {
        &ANSIBLE_TRANSIENT
    }
}

// ============================================================================
// Docker Compose
// ============================================================================

pub struct ComposeBackend;

const COMPOSE_FILE: &str = "docker-compose.yml";

impl ComposeBackend {
    fn compose(&self, extra: &[&str]) -> CommandSpec {
        let mut args = vec!["compose", "-f", COMPOSE_FILE];
        args.extend_from_slice(extra);
        CommandSpec::new("docker", &args)
    }
}

impl Backend for ComposeBackend {
    fn format(&self) -> TargetFormat {
        TargetFormat::Docker
    }

    fn state_dump(&self) -> Option<CommandSpec> {
        Some(self.compose(&["ps", "--all", "--format", "json"]))
    }

    fn plan(&self) -> Vec<CommandSpec> {
        vec![self.compose(&["config", "--quiet"])]
    }

    fn apply(&self) -> CommandSpec {
        self.compose(&["up", "--detach", "--build", "--remove-orphans"])
    }

    fn verify(&self) -> CommandSpec {
        self.compose(&["ps", "--all", "--format", "{{.Service}} {{.State}}"])
    }

    /// Every listed container must be running; an empty listing means the
    /// stack is gone.
    fn verify_outcome(&self, out: &ExecOutput) -> VerifyOutcome {
        if !out.success() {
            return VerifyOutcome::Failed;
        }
        let mut states = out
            .stdout
            .lines()
            .filter_map(|l| l.split_whitespace().nth(1))
            .peekable();
        if states.peek().is_none() {
            return VerifyOutcome::Drift;
        }
        if states.all(|s| s == "running") {
            VerifyOutcome::Match
        } else {
            VerifyOutcome::Drift
        }
    }

    fn restore(&self) -> CommandSpec {
        self.apply()
    }

    fn destroy(&self) -> Option<CommandSpec> {
        Some(self.compose(&["down", "--remove-orphans"]))
    }

    fn transient_patterns(&self) -> &Regex {
        &COMPOSE_TRANSIENT
    }
}
