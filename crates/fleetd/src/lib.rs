//! fleetd: the fleetgrid daemon.
//!
//! Assembles the fleet orchestrator into one process:
//! - State store (redb)
//! - Task executor over ssh, with the per-agent provisioning lock
//! - Task runner polling for PENDING tasks
//! - Cron scheduler
//! - Agent heartbeat sweep
//! - REST API

pub mod config;
pub mod control_plane;

use chrono::{DateTime, Utc};
use fleetgrid_cron::CronSchedule;

pub use config::{DaemonConfig, LogFormat};
pub use control_plane::{ControlPlane, run_control_plane};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

/// The next `count` firings of `expression` after `from`, one line each,
/// in the job's timezone and in UTC.
pub fn cron_preview(
    expression: &str,
    timezone: &str,
    count: usize,
    from: DateTime<Utc>,
) -> anyhow::Result<Vec<String>> {
    let schedule = CronSchedule::parse(expression, timezone)?;
    let tz = schedule.timezone();
    let runs = schedule.upcoming(from, count);
    if runs.is_empty() {
        anyhow::bail!("{expression:?} never fires");
    }
    Ok(runs
        .into_iter()
        .map(|t| {
            format!(
                "{}  ({})",
                t.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z"),
                t.format("%Y-%m-%d %H:%M UTC")
            )
        })
        .collect())
}
