//! redb table definitions for the fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Port allocations use the composite key `{machine_id}:{server_id}` so all
//! allocations of one machine are found with a prefix scan.

use redb::TableDefinition;

/// Shape shared by every table in the store.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Machines keyed by `{machine_id}`.
pub const MACHINES: JsonTable = TableDefinition::new("machines");

/// Agents keyed by `{agent_id}`.
pub const AGENTS: JsonTable = TableDefinition::new("agents");

/// Servers keyed by `{server_id}`.
pub const SERVERS: JsonTable = TableDefinition::new("servers");

/// Port allocations keyed by `{machine_id}:{server_id}`.
pub const PORT_ALLOCATIONS: JsonTable = TableDefinition::new("port_allocations");

/// Tasks keyed by `{task_id}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");

/// Cron jobs keyed by `{cron_job_id}`.
pub const CRON_JOBS: JsonTable = TableDefinition::new("cron_jobs");
