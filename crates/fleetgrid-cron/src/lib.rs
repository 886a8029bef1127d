//! fleetgrid-cron: recurring server actions.
//!
//! Jobs carry a standard 5-field cron expression and an IANA timezone.
//! [`CronScheduler`] polls for due jobs, runs each as an ordinary task via
//! the scheduler's `TaskExecutor`, then updates the job's counters and
//! computes its next run.

pub mod error;
pub mod schedule;
pub mod scheduler;

pub use error::{CronError, CronResult};
pub use schedule::CronSchedule;
pub use scheduler::{CronScheduler, NewCronJob, ScanReport};
