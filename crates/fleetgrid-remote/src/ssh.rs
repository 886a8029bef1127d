//! SSH-backed executor using the system `ssh` client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use fleetgrid_state::SshTarget;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{RemoteError, RemoteResult};
use crate::executor::{
    ExecFuture, ExecOutput, RemoteExecutor, SSH_TRANSPORT_EXIT_CODE, TIMEOUT_EXIT_CODE,
};

/// Client-side ssh settings shared by every target.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Path to the ssh client binary.
    pub binary: PathBuf,
    /// Passed as `-o ConnectTimeout=`.
    pub connect_timeout: Duration,
    /// Value for `-o StrictHostKeyChecking=`.
    pub host_key_checking: String,
    /// Additional `-o` options, e.g. `ServerAliveInterval=30`.
    pub extra_options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ssh"),
            connect_timeout: Duration::from_secs(15),
            host_key_checking: "accept-new".to_string(),
            extra_options: Vec::new(),
        }
    }
}

/// Runs commands through a non-interactive `ssh` child process.
///
/// The child is spawned with `kill_on_drop`, so when the timeout fires and
/// the wait future is dropped the local ssh process is killed, which tears
/// down the remote session.
#[derive(Debug, Clone, Default)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to the ssh binary for one invocation.
    pub fn build_args(&self, target: &SshTarget, command: &str) -> Vec<String> {
        let mut args = vec!["-p".to_string(), target.port.to_string()];
        if let Some(key) = &target.key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        let mut options = vec![
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            format!("StrictHostKeyChecking={}", self.config.host_key_checking),
        ];
        options.extend(self.config.extra_options.iter().cloned());
        for opt in options {
            args.push("-o".to_string());
            args.push(opt);
        }
        args.push(target.destination());
        args.push("--".to_string());
        args.push(command.to_string());
        args
    }

    async fn execute(
        &self,
        target: &SshTarget,
        command: &str,
        timeout: Duration,
    ) -> RemoteResult<ExecOutput> {
        if timeout.is_zero() {
            return Err(RemoteError::InvalidTimeout);
        }

        let child = Command::new(&self.config.binary)
            .args(self.build_args(target, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RemoteError::Spawn {
                program: self.config.binary.display().to_string(),
                reason: e.to_string(),
            })?;

        let started = Instant::now();
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(SSH_TRANSPORT_EXIT_CODE);
                debug!(
                    host = %target.host,
                    exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "remote command finished"
                );
                Ok(ExecOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code,
                })
            }
            Ok(Err(e)) => Err(RemoteError::Io {
                host: target.host.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(
                    host = %target.host,
                    timeout_secs = timeout.as_secs(),
                    "remote command timed out, session killed"
                );
                Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: format!(
                        "command timed out after {}s on {}",
                        timeout.as_secs_f64(),
                        target.host
                    ),
                    exit_code: TIMEOUT_EXIT_CODE,
                })
            }
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn run<'a>(
        &'a self,
        target: &'a SshTarget,
        command: &'a str,
        timeout: Duration,
    ) -> ExecFuture<'a> {
        Box::pin(self.execute(target, command, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            port: 2222,
            user: "deploy".to_string(),
            key_path: Some("/keys/fleet".to_string()),
        }
    }

    #[test]
    fn args_place_command_after_separator() {
        let exec = SshExecutor::default();
        let args = exec.build_args(&target(), "systemctl start server-abc");

        assert_eq!(&args[..4], &["-p", "2222", "-i", "/keys/fleet"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        let n = args.len();
        assert_eq!(args[n - 3], "deploy@10.0.0.5");
        assert_eq!(args[n - 2], "--");
        assert_eq!(args[n - 1], "systemctl start server-abc");
    }

    #[test]
    fn args_without_key() {
        let exec = SshExecutor::default();
        let mut t = target();
        t.key_path = None;
        assert!(!exec.build_args(&t, "true").contains(&"-i".to_string()));
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let exec = SshExecutor::default();
        let err = exec.run(&target(), "true", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, RemoteError::InvalidTimeout));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let exec = SshExecutor::new(SshConfig {
            binary: PathBuf::from("/nonexistent/ssh-client"),
            ..Default::default()
        });
        let err = exec
            .run(&target(), "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stand_in_binary_exit_codes_and_timeout() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let write_script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        // Echo the last argument (the remote command) and fail with 3.
        let echo = write_script("echo-ssh", "for a; do last=$a; done\necho \"$last\"\nexit 3");
        let slow = write_script("slow-ssh", "sleep 5");
        let inner_timeout = write_script("timeout-ssh", "exit 124");

        let exec = SshExecutor::new(SshConfig {
            binary: echo,
            ..Default::default()
        });
        let out = exec
            .run(&target(), "df -h /opt", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "df -h /opt");

        let exec = SshExecutor::new(SshConfig {
            binary: inner_timeout,
            ..Default::default()
        });
        let out = exec
            .run(&target(), "timeout 1 ./update.sh", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 124);
        assert!(!out.timed_out());
        assert!(!out.transport_failed());

        let exec = SshExecutor::new(SshConfig {
            binary: slow,
            ..Default::default()
        });
        let started = Instant::now();
        let out = exec
            .run(&target(), "install.sh", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(out.timed_out());
        assert!(out.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
