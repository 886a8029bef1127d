//! Remote step runner with error classification and liveness checks.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_remote::{ExecOutput, RemoteExecutor};
use fleetgrid_state::SshTarget;
use tracing::{debug, warn};

use crate::commands;
use crate::error::{SchedulerError, SchedulerResult};

/// Thin layer over a [`RemoteExecutor`] that turns exit codes into
/// [`SchedulerError`] classes.
#[derive(Clone)]
pub struct HostOps {
    executor: Arc<dyn RemoteExecutor>,
    probe_timeout: Duration,
    retry_delay: Duration,
}

impl HostOps {
    pub fn new(executor: Arc<dyn RemoteExecutor>, probe_timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            executor,
            probe_timeout,
            retry_delay,
        }
    }

    /// Run a step. ssh-level failures are errors; the command's own exit
    /// code (including a timeout) is left for the caller to judge.
    pub async fn run(
        &self,
        target: &SshTarget,
        step: &str,
        command: &str,
        timeout: Duration,
    ) -> SchedulerResult<ExecOutput> {
        let out = self.executor.run(target, command, timeout).await?;
        debug!(host = %target.host, %step, exit_code = out.exit_code, "remote step finished");
        if out.transport_failed() && !out.timed_out() {
            return Err(SchedulerError::Transport {
                step: step.to_string(),
                detail: out.summary(),
            });
        }
        Ok(out)
    }

    /// Run a step that must exit 0.
    pub async fn run_checked(
        &self,
        target: &SshTarget,
        step: &str,
        command: &str,
        timeout: Duration,
    ) -> SchedulerResult<ExecOutput> {
        let out = self.run(target, step, command, timeout).await?;
        if out.timed_out() {
            return Err(SchedulerError::Transport {
                step: step.to_string(),
                detail: out.summary(),
            });
        }
        if !out.success() {
            return Err(SchedulerError::RemoteCommand {
                step: step.to_string(),
                detail: out.summary(),
            });
        }
        Ok(out)
    }

    /// Whether the host reports the server running.
    pub async fn liveness(
        &self,
        target: &SshTarget,
        server_id: &str,
        port: Option<u16>,
    ) -> SchedulerResult<bool> {
        let out = self
            .run_checked(
                target,
                "liveness",
                &commands::liveness(server_id, port),
                self.probe_timeout,
            )
            .await?;
        let stdout = out.stdout.trim();
        if stdout.ends_with(commands::RUNNING_MARKER) {
            Ok(true)
        } else if stdout.ends_with(commands::STOPPED_MARKER) {
            Ok(false)
        } else {
            Err(SchedulerError::RemoteCommand {
                step: "liveness".to_string(),
                detail: format!("unexpected probe output: {stdout}"),
            })
        }
    }

    /// Check liveness against `want`, re-checking once after the retry
    /// delay if the first answer disagrees. Returns the final answer.
    pub async fn await_liveness(
        &self,
        target: &SshTarget,
        server_id: &str,
        port: Option<u16>,
        want: bool,
    ) -> SchedulerResult<bool> {
        if self.liveness(target, server_id, port).await? == want {
            return Ok(true);
        }
        warn!(%server_id, want_running = want, delay_ms = self.retry_delay.as_millis() as u64, "liveness disagrees, re-checking");
        tokio::time::sleep(self.retry_delay).await;
        Ok(self.liveness(target, server_id, port).await? == want)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_remote::mock::{self, MockExecutor};
    use fleetgrid_remote::TIMEOUT_EXIT_CODE;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.1".into(),
            port: 22,
            user: "root".into(),
            key_path: None,
        }
    }

    fn ops(mock: Arc<MockExecutor>) -> HostOps {
        HostOps::new(mock, Duration::from_secs(5), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn classifies_exit_codes() {
        let m = Arc::new(MockExecutor::new());
        m.on("unreachable", mock::unreachable())
            .on("broken", mock::fail(2, "no such file"))
            .on("slow", mock::fail(TIMEOUT_EXIT_CODE, "timed out"));
        let ops = ops(m);
        let t = target();
        let d = Duration::from_secs(1);

        assert!(matches!(
            ops.run(&t, "s", "unreachable", d).await,
            Err(SchedulerError::Transport { .. })
        ));
        assert_eq!(ops.run(&t, "s", "broken", d).await.unwrap().exit_code, 2);
        assert!(ops.run(&t, "s", "slow", d).await.unwrap().timed_out());

        assert!(matches!(
            ops.run_checked(&t, "s", "broken", d).await,
            Err(SchedulerError::RemoteCommand { .. })
        ));
        assert!(matches!(
            ops.run_checked(&t, "s", "slow", d).await,
            Err(SchedulerError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn liveness_retries_once() {
        let m = Arc::new(MockExecutor::new());
        m.on("is-active", mock::ok("RUNNING\n"))
            .once("is-active", mock::ok("STOPPED\n"));
        let ops = ops(m.clone());

        assert!(ops.await_liveness(&target(), "abc", Some(2456), true).await.unwrap());
        assert_eq!(m.calls_matching("is-active").len(), 2);
    }

    #[tokio::test]
    async fn liveness_gives_up_after_one_retry() {
        let m = Arc::new(MockExecutor::new());
        m.on("is-active", mock::ok("STOPPED\n"));
        let ops = ops(m.clone());

        assert!(!ops.await_liveness(&target(), "abc", None, true).await.unwrap());
        assert_eq!(m.call_count(), 2);
    }

    #[tokio::test]
    async fn garbage_probe_output_is_an_error() {
        let m = Arc::new(MockExecutor::new());
        m.on("is-active", mock::ok("bash: systemctl: not found"));
        assert!(ops(m).liveness(&target(), "abc", None).await.is_err());
    }
}
