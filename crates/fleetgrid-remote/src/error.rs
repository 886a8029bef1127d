//! Error types for remote execution.

use thiserror::Error;

/// Result type alias for remote execution.
pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("timeout must be a positive duration")]
    InvalidTimeout,

    #[error("failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("i/o error while talking to {host}: {reason}")]
    Io { host: String, reason: String },
}
