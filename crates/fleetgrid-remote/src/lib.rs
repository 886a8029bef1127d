//! fleetgrid-remote: run shell commands on fleet machines.
//!
//! Every remote action the orchestrator takes goes through the
//! [`RemoteExecutor`] trait: one command, one host, one timeout, and back
//! comes stdout, stderr and an exit code.
//!
//! ```text
//!   TaskExecutor / PortAllocator
//!            │ run(target, command, timeout)
//!            ▼
//!   ┌──────────────────┐      ssh -p PORT user@host -- command
//!   │   SshExecutor    │ ───────────────────────────────────────▶ host
//!   └──────────────────┘
//!            │ ExecOutput { stdout, stderr, exit_code }
//! ```
//!
//! Non-zero remote exits, ssh connection failures (exit 255) and timeouts
//! ([`TIMEOUT_EXIT_CODE`]) are all ordinary [`ExecOutput`] values. An `Err`
//! means the local ssh process could not be run at all.

pub mod error;
pub mod executor;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ssh;

pub use error::{RemoteError, RemoteResult};
pub use executor::{
    DEFAULT_TIMEOUT, ExecFuture, ExecOutput, RemoteExecutor, SSH_TRANSPORT_EXIT_CODE,
    TIMEOUT_EXIT_CODE,
};
pub use ssh::{SshConfig, SshExecutor};
