//! Placement errors.

use fleetgrid_state::{StateError, WorkloadKind};
use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no suitable machine for {kind} at occupancy {occupancy} ({considered} live candidates)")]
    NoSuitableMachine {
        kind: WorkloadKind,
        occupancy: u32,
        considered: usize,
    },

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
