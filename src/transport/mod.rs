//! Subprocess transport for the external IaC tools.
//!
//! Exit code plus captured stdout/stderr are the only channel back from a
//! tool. Every call carries a timeout; a call that exceeds it is killed and
//! reported with `timed_out` set.

pub mod local;
pub mod mock;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Output from running one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `-1` when the process was killed by a signal or timed out.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stderr: stderr.to_string(),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            exit_code: -1,
            timed_out: true,
            ..Self::default()
        }
    }
}

/// One command to run: program, arguments, working directory, extra env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    /// Command line as a single string, for logs and pattern matching.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Runs commands. `Err` means the command could not be started at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<ExecOutput, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_exec_output_success() {
        assert!(ExecOutput::ok("fine").success());
        assert!(!ExecOutput::failed(1, "err").success());
        assert!(!ExecOutput::failed(137, "killed").success());
        let t = ExecOutput::timeout();
        assert!(t.timed_out);
        assert!(!t.success());
    }

    #[test]
    fn test_transport_command_display() {
        let spec = CommandSpec::new("terraform", &["plan", "-input=false"])
            .arg("-no-color")
            .in_dir("/tmp/w");
        assert_eq!(spec.display(), "terraform plan -input=false -no-color");
        assert_eq!(spec.to_string(), spec.display());
        assert_eq!(spec.cwd.as_deref(), Some(std::path::Path::new("/tmp/w")));
    }
}
