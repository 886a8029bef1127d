//! fleetgrid-ports: collision-free port allocation on fleet machines.
//!
//! A server needs a primary port plus zero or more secondaries derived from
//! it at fixed offsets. A candidate set is only handed out when none of its
//! values appear in any allocation recorded for the machine, and none are
//! seen bound on the host itself.
//!
//! ```text
//!   allocate(machine, kind, server)
//!     │  per-machine mutex
//!     ├── recorded ports  ◀── StateStore (port_allocations)
//!     ├── live ports      ◀── ss/netstat + docker ps over ssh
//!     ├── linear scan from preferred / profile minimum
//!     └── insert_port_allocation (overlap-checked write txn) ──▶ PortSet
//! ```

pub mod allocator;
pub mod error;
pub mod probe;
pub mod profile;

pub use allocator::{AllocatorConfig, PortAllocator};
pub use error::{PortError, PortResult};
pub use profile::{PortProfile, PortRole};
