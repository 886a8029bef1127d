//! fleetgrid-state: embedded state store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for machines, agents, servers, port allocations, tasks,
//! and cron jobs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Port allocations use `{machine_id}:{server_id}` keys so a machine's
//! allocations are one prefix scan away.
//!
//! Two operations are conditional and run inside a single write transaction:
//! claiming a PENDING task and inserting a port allocation that must not
//! overlap any other allocation on its machine. redb serializes write
//! transactions, so both are atomic with respect to concurrent callers.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
