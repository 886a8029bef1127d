//! Cron error types.

use fleetgrid_scheduler::SchedulerError;
use fleetgrid_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("cron job not found: {0}")]
    JobNotFound(String),

    #[error("cron expression {0:?} never fires again")]
    NoUpcomingRun(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type CronResult<T> = Result<T, CronError>;
