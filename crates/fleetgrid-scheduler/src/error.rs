//! Scheduler error types.

use fleetgrid_placement::PlacementError;
use fleetgrid_ports::PortError;
use fleetgrid_remote::RemoteError;
use fleetgrid_state::{ServerStatus, StateError, TaskKind, TaskStatus};
use thiserror::Error;

use crate::lock::LockError;

/// Errors that can occur while executing tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} is {status}, only PENDING tasks can start")]
    TaskNotPending { task_id: String, status: TaskStatus },

    #[error("task {0} has no target server")]
    MissingServer(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("server {0} has no machine or ports assigned; provision it first")]
    Unassigned(String),

    #[error("cannot {action} server {server_id} while it is {status}")]
    StatusConflict {
        server_id: String,
        status: ServerStatus,
        action: TaskKind,
    },

    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    /// ssh could not reach the host, or the step hit its timeout.
    #[error("{step}: transport failure: {detail}")]
    Transport { step: String, detail: String },

    /// The command ran and failed.
    #[error("{step}: remote command failed: {detail}")]
    RemoteCommand { step: String, detail: String },

    #[error("provisioning lock: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Coarse error category, deciding retry and recovery behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network/ssh/timeout. The caller may retry.
    Transport,
    /// No machine fits or no port is free.
    ResourceExhausted,
    /// Rejected up front, nothing was mutated.
    StateConflict,
    /// A remote step ran and failed.
    RemoteCommand,
    /// Persistence or internal fault.
    Internal,
}

impl SchedulerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TaskNotFound(_)
            | Self::TaskNotPending { .. }
            | Self::MissingServer(_)
            | Self::ServerNotFound(_)
            | Self::AgentNotFound(_)
            | Self::MachineNotFound(_)
            | Self::Unassigned(_)
            | Self::StatusConflict { .. }
            | Self::InvalidMigration(_) => ErrorClass::StateConflict,
            Self::Transport { .. } | Self::Remote(_) => ErrorClass::Transport,
            Self::RemoteCommand { .. } => ErrorClass::RemoteCommand,
            Self::Lock(LockError::HolderFailed { .. }) => ErrorClass::Transport,
            Self::Lock(LockError::Reset { .. }) => ErrorClass::Internal,
            Self::Placement(PlacementError::NoSuitableMachine { .. }) => {
                ErrorClass::ResourceExhausted
            }
            Self::Placement(PlacementError::MachineNotFound(_)) => ErrorClass::StateConflict,
            Self::Placement(PlacementError::State(_)) => ErrorClass::Internal,
            Self::Ports(PortError::Exhausted { .. }) => ErrorClass::ResourceExhausted,
            Self::Ports(PortError::Probe { .. } | PortError::Remote(_)) => ErrorClass::Transport,
            Self::Ports(PortError::State(_)) => ErrorClass::Internal,
            Self::State(StateError::Conflict(_)) => ErrorClass::StateConflict,
            Self::State(_) => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}
