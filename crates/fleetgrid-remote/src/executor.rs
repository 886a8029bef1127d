//! The remote executor seam and its output type.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use fleetgrid_state::SshTarget;

use crate::error::RemoteResult;

/// Exit code reported when a command is killed for exceeding its timeout.
///
/// Outside 0..=255, so no real remote exit status can be mistaken for it.
/// The command may or may not have finished its work on the host.
pub const TIMEOUT_EXIT_CODE: i32 = -1;

/// Exit code ssh itself uses for connection and authentication failures.
pub const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

/// Timeout applied when a caller does not pick one. Install scripts are slow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The command was killed at its deadline.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }

    /// The command never reached the host, or the session broke.
    pub fn transport_failed(&self) -> bool {
        self.exit_code == SSH_TRANSPORT_EXIT_CODE || self.timed_out()
    }

    /// Short description for task error text: stderr, else stdout, trimmed.
    pub fn summary(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let tail: Vec<&str> = text.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        format!("exit {}: {}", self.exit_code, tail.join(" | "))
    }
}

/// Boxed future returned by [`RemoteExecutor::run`].
pub type ExecFuture<'a> = Pin<Box<dyn Future<Output = RemoteResult<ExecOutput>> + Send + 'a>>;

/// Runs one shell command on a remote host.
///
/// Implementations must hard-kill the session when `timeout` expires and
/// report it as [`TIMEOUT_EXIT_CODE`]. A non-zero exit of the command is
/// never an `Err`.
pub trait RemoteExecutor: Send + Sync {
    fn run<'a>(&'a self, target: &'a SshTarget, command: &'a str, timeout: Duration)
    -> ExecFuture<'a>;
}
