//! Fleetgrid machine selection.
//!
//! Decides which machine (and which agent on it) a new game server lands
//! on. Machines are scored by utilisation; lower is better.
//!
//! # Components
//!
//! - **`requirements`**: Per-workload base resources, scaled by occupancy
//! - **`scorer`**: Fit check and load score for one machine
//! - **`convert`**: State store `Machine` → scorer input, with named
//!   defaults for machines that were never measured
//! - **`selector`**: `select_best` over the live fleet

pub mod convert;
pub mod error;
pub mod requirements;
pub mod scorer;
pub mod selector;

pub use convert::machine_resources;
pub use error::{PlacementError, PlacementResult};
pub use requirements::ResourceRequirement;
pub use scorer::{MachineResources, MachineScore, ScoreBreakdown, rank_machines, score_machine};
pub use selector::{MachineSelector, Selection};
