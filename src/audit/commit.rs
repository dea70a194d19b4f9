//! Version-control commits for applied artifacts.
//!
//! The ledger stays authoritative; a commit is a best-effort copy of the
//! artifact with a message derived from the run.

use crate::core::config::VersionControlSettings;
use crate::core::snapshot;
use crate::core::types::PipelineRun;
use crate::engine::workdir_name;
use crate::transport::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to commit and how to describe it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    /// Path relative to the repository root.
    pub path: PathBuf,
    pub content: String,
    pub subject: String,
    pub body: String,
}

impl CommitRequest {
    /// Build the commit for a run. `None` until the run has a request,
    /// an artifact and a verdict.
    pub fn from_run(run: &PipelineRun) -> Option<Self> {
        let request = run.request.as_ref()?;
        let artifact = run.artifact.as_ref()?;
        let verdict = run.verdict.as_ref()?;

        let subject = format!("{} [{}]", request.summary(), verdict.status);

        let mut lines = vec![
            format!("Run: {}", run.id),
            format!("Actor: {}", run.actor),
            format!("Resource: {}", request.resource_identity()),
            "Attributes:".to_string(),
        ];
        for (k, v) in request.attributes() {
            lines.push(format!("  {} = {}", k, v));
        }
        lines.push(format!("Artifact: {}", artifact.content_hash()));
        lines.push(format!("Generator: {}", artifact.generator()));
        lines.push(format!("Findings: {}", verdict.findings_count()));
        if let Some(exception) = &verdict.exception {
            lines.push(format!(
                "Override: {} ({})",
                exception.actor, exception.reason
            ));
        }
        lines.push(format!("State: {}", run.state));
        lines.push(format!("Audit entries: {}", run.audit.len()));

        let path = PathBuf::from(request.format().to_string())
            .join(workdir_name(&request.resource_identity()))
            .join(request.format().file_name());

        Some(Self {
            path,
            content: artifact.content().to_string(),
            subject,
            body: lines.join("\n"),
        })
    }

    pub fn message(&self) -> String {
        format!("{}\n\n{}\n", self.subject, self.body)
    }
}

/// External version-control collaborator. Returns the commit id.
#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn commit(&self, request: &CommitRequest) -> Result<String, String>;
}

/// Commits through the `git` CLI in `repo_dir`.
pub struct GitVersionControl {
    settings: VersionControlSettings,
    runner: Arc<dyn CommandRunner>,
}

impl GitVersionControl {
    pub fn new(settings: VersionControlSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    async fn git(&self, args: &[&str]) -> Result<String, String> {
        let spec = CommandSpec::new("git", args).in_dir(&self.settings.repo_dir);
        let out = self.runner.run(&spec, GIT_TIMEOUT).await?;
        if out.success() {
            Ok(out.stdout.trim().to_string())
        } else {
            Err(format!("{} failed: {}", spec, out.stderr.trim()))
        }
    }
}

#[async_trait]
impl VersionControl for GitVersionControl {
    async fn commit(&self, request: &CommitRequest) -> Result<String, String> {
        let repo = &self.settings.repo_dir;
        std::fs::create_dir_all(repo)
            .map_err(|e| format!("cannot create {}: {}", repo.display(), e))?;
        if !repo.join(".git").exists() {
            self.git(&["init", "--quiet"]).await?;
        }
        snapshot::write_atomic(&repo.join(&request.path), request.content.as_bytes())?;

        let rel = request.path.to_string_lossy().to_string();
        self.git(&["add", "--", &rel]).await?;
        let author = format!(
            "{} <{}>",
            self.settings.author_name, self.settings.author_email
        );
        let message = request.message();
        self.git(&["commit", "--quiet", "-m", &message, "--author", &author])
            .await?;
        self.git(&["rev-parse", "HEAD"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        GeneratedArtifact, RunState, Submission, ValidationOverride, ValidationVerdict,
    };
    use crate::generators::test_support::request;
    use crate::transport::mock::MockRunner;
    use crate::transport::ExecOutput;
    use serde_json::json;

    fn applied_run() -> PipelineRun {
        let req = request(json!({"kind": "compute", "provider": "aws", "name": "web", "instances": 3}));
        let mut run = PipelineRun::new("alice", Submission::default());
        run.artifact = Some(GeneratedArtifact::new(&req, "terraform", "# hcl\n".into()));
        let mut verdict = ValidationVerdict::aggregate(Vec::new(), false);
        verdict.exception = Some(ValidationOverride {
            actor: "sec-lead".into(),
            reason: "accepted".into(),
        });
        run.verdict = Some(verdict);
        run.request = Some(req);
        run.state = RunState::Applied;
        run
    }

    #[test]
    fn test_commit_message_from_run() {
        let run = applied_run();
        let c = CommitRequest::from_run(&run).unwrap();
        assert_eq!(c.subject, "compute on aws via terraform [pass]");
        assert!(c.body.contains(&format!("Run: {}", run.id)));
        assert!(c.body.contains("  instances = 3"));
        assert!(c.body.contains("Override: sec-lead (accepted)"));
        assert!(c.body.contains("State: applied"));
        assert_eq!(c.path, PathBuf::from("terraform/aws_compute_web/main.tf"));
        assert!(c.message().starts_with("compute on aws via terraform [pass]\n\n"));
    }

    #[test]
    fn test_commit_requires_artifact() {
        let run = PipelineRun::new("alice", Submission::default());
        assert!(CommitRequest::from_run(&run).is_none());
    }

    #[tokio::test]
    async fn test_commit_git_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new().on("rev-parse", vec![ExecOutput::ok("abc123\n")]));
        let settings = VersionControlSettings {
            enabled: true,
            repo_dir: dir.path().join("repo"),
            ..VersionControlSettings::default()
        };
        let vcs = GitVersionControl::new(settings, runner.clone());
        let c = CommitRequest::from_run(&applied_run()).unwrap();
        let id = vcs.commit(&c).await.unwrap();
        assert_eq!(id, "abc123");
        let cmds = runner.commands();
        assert!(cmds[0].starts_with("git init"));
        assert_eq!(cmds[1], "git add -- terraform/aws_compute_web/main.tf");
        assert!(cmds[2].starts_with("git commit --quiet -m compute on aws via terraform [pass]"));
        assert!(cmds[2].ends_with("--author AutoDevOps Bot <bot@autodevops.local>"));
        let written = std::fs::read_to_string(dir.path().join("repo/terraform/aws_compute_web/main.tf")).unwrap();
        assert_eq!(written, "# hcl\n");
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(MockRunner::new().on("git commit", vec![ExecOutput::failed(1, "nothing to commit")]));
        let settings = VersionControlSettings {
            enabled: true,
            repo_dir: dir.path().to_path_buf(),
            ..VersionControlSettings::default()
        };
        let vcs = GitVersionControl::new(settings, runner);
        let err = vcs.commit(&CommitRequest::from_run(&applied_run()).unwrap()).await.unwrap_err();
        assert!(err.contains("nothing to commit"));
    }
}
