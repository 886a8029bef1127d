//! Port allocation errors.

use fleetgrid_remote::RemoteError;
use fleetgrid_state::StateError;
use thiserror::Error;

pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no available ports found in range {min}-{max} on machine {machine_id} after {attempts} attempts")]
    Exhausted {
        machine_id: String,
        min: u16,
        max: u16,
        attempts: u32,
    },

    /// The live probe could not be run on the host.
    #[error("port probe failed on machine {machine_id}: {reason}")]
    Probe { machine_id: String, reason: String },

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
