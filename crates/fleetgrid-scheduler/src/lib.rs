//! fleetgrid-scheduler: task execution for the game-server fleet.
//!
//! Turns persisted `Task` records into remote work on fleet machines:
//!
//! - Per-agent FIFO provisioning lock (`ProvisioningLocks`)
//! - Lifecycle state machine for PROVISION through INSTALL_AGENT (`TaskExecutor`)
//! - Polling runner that claims PENDING tasks in batches (`TaskRunner`)
//! - Agent heartbeats and offline sweep (`AgentMembership`)
//! - Best-effort owner notifications (`Notifications`)
//!
//! # Architecture
//!
//! ```text
//! TaskRunner ──▶ TaskExecutor::execute(task)
//!                  ├── StateStore::claim_task (PENDING → RUNNING, atomic)
//!                  ├── ProvisioningLocks (PROVISION / UPDATE / MIGRATE target)
//!                  ├── MachineSelector / PortAllocator
//!                  ├── HostOps ──▶ RemoteExecutor (ssh)
//!                  ├── StateStore::finish_task (COMPLETED | FAILED)
//!                  └── Notifications
//! ```

pub mod commands;
pub mod error;
pub mod executor;
pub mod host;
pub mod lock;
pub mod membership;
pub mod notify;
pub mod runner;
pub mod workload;

pub use error::{ErrorClass, SchedulerError, SchedulerResult};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use host::HostOps;
pub use lock::{LockError, LockInfo, ProvisioningGuard, ProvisioningLocks};
pub use membership::{AgentMembership, DEFAULT_HEARTBEAT_TIMEOUT};
#[cfg(any(test, feature = "mock"))]
pub use notify::RecordingNotifier;
pub use notify::{LogNotifier, Notification, NotificationEvent, Notifications, Notifier, NotifyError};
pub use runner::{DEFAULT_BATCH_SIZE, TaskRunner};
pub use workload::{TemplateParams, WorkloadCatalog, WorkloadTemplate};
