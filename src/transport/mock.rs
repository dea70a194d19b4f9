//! Scripted command runner for running the pipeline without real tools.
//!
//! Responses are matched by substring against the command line. Each rule
//! holds a queue; the last queued response repeats once the queue drains.
//! Unmatched commands succeed with empty output. Every call is recorded.

use super::{CommandRunner, CommandSpec, ExecOutput};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum MockResponse {
    Output(ExecOutput),
    SpawnError(String),
}

impl From<ExecOutput> for MockResponse {
    fn from(out: ExecOutput) -> Self {
        Self::Output(out)
    }
}

struct Rule {
    pattern: String,
    queue: VecDeque<MockResponse>,
}

pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
    latency: Duration,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Script responses for commands containing `pattern`. Earlier rules win.
    pub fn on(self, pattern: &str, responses: Vec<ExecOutput>) -> Self {
        guard(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            queue: responses.into_iter().map(MockResponse::from).collect(),
        });
        self
    }

    /// Commands containing `pattern` fail to start.
    pub fn on_spawn_error(self, pattern: &str, message: &str) -> Self {
        guard(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            queue: VecDeque::from([MockResponse::SpawnError(message.to_string())]),
        });
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every command run so far, in call order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        guard(&self.calls).clone()
    }

    /// Command lines run so far.
    pub fn commands(&self) -> Vec<String> {
        guard(&self.calls).iter().map(CommandSpec::display).collect()
    }

    /// Number of calls whose command line contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        guard(&self.calls)
            .iter()
            .filter(|c| c.display().contains(pattern))
            .count()
    }

    fn respond(&self, line: &str) -> MockResponse {
        let mut rules = guard(&self.rules);
        let Some(rule) = rules.iter_mut().find(|r| line.contains(&r.pattern)) else {
            return MockResponse::Output(ExecOutput::ok(""));
        };
        if rule.queue.len() > 1 {
            rule.queue
                .pop_front()
                .unwrap_or(MockResponse::Output(ExecOutput::ok("")))
        } else {
            rule.queue
                .front()
                .cloned()
                .unwrap_or(MockResponse::Output(ExecOutput::ok("")))
        }
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, spec: &CommandSpec, _timeout: Duration) -> Result<ExecOutput, String> {
        guard(&self.calls).push(spec.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.respond(&spec.display()) {
            MockResponse::Output(out) => Ok(out),
            MockResponse::SpawnError(msg) => Err(msg),
        }
    }
}
