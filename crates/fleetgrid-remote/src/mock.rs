//! Scripted in-memory executor for tests.
//!
//! Replies are chosen by substring match on the command text; the most
//! recently registered matching rule wins. Every call is recorded with its
//! start and finish instants so tests can assert ordering.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use fleetgrid_state::SshTarget;

use crate::executor::{ExecFuture, ExecOutput, RemoteExecutor, SSH_TRANSPORT_EXIT_CODE};

/// One observed invocation.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub host: String,
    pub command: String,
    pub started: Instant,
    pub finished: Instant,
}

struct Rule {
    pattern: String,
    output: ExecOutput,
    delay: Duration,
    /// `None` means unlimited.
    remaining: Option<usize>,
}

#[derive(Default)]
pub struct MockExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CallRecord>>,
}

/// Successful output with the given stdout.
pub fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Failed output with the given exit code and stderr.
pub fn fail(exit_code: i32, stderr: &str) -> ExecOutput {
    ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

/// Output ssh produces when the host is unreachable.
pub fn unreachable() -> ExecOutput {
    fail(SSH_TRANSPORT_EXIT_CODE, "ssh: connect to host: Connection refused")
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, output: ExecOutput, delay: Duration, remaining: Option<usize>) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                output,
                delay,
                remaining,
            });
        }
    }

    /// Reply with `output` to every command containing `pattern`.
    pub fn on(&self, pattern: &str, output: ExecOutput) -> &Self {
        self.push(pattern, output, Duration::ZERO, None);
        self
    }

    /// Like [`on`](Self::on) but sleeps `delay` before replying.
    pub fn on_delayed(&self, pattern: &str, output: ExecOutput, delay: Duration) -> &Self {
        self.push(pattern, output, delay, None);
        self
    }

    /// Reply with `output` to the next matching command only.
    pub fn once(&self, pattern: &str, output: ExecOutput) -> &Self {
        self.push(pattern, output, Duration::ZERO, Some(1));
        self
    }

    fn reply_for(&self, command: &str) -> (ExecOutput, Duration) {
        let Ok(mut rules) = self.rules.lock() else {
            return (ExecOutput::default(), Duration::ZERO);
        };
        let hit = rules
            .iter()
            .rposition(|r| r.remaining != Some(0) && command.contains(&r.pattern));
        match hit {
            Some(i) => {
                let rule = &mut rules[i];
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                (rule.output.clone(), rule.delay)
            }
            None => (ExecOutput::default(), Duration::ZERO),
        }
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.command).collect()
    }

    /// Calls whose command contains `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.command.contains(pattern))
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl RemoteExecutor for MockExecutor {
    fn run<'a>(
        &'a self,
        target: &'a SshTarget,
        command: &'a str,
        _timeout: Duration,
    ) -> ExecFuture<'a> {
        Box::pin(async move {
            let started = Instant::now();
            let (output, delay) = self.reply_for(command);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(CallRecord {
                    host: target.host.clone(),
                    command: command.to_string(),
                    started,
                    finished: Instant::now(),
                });
            }
            Ok(output)
        })
    }
}
