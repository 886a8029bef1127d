//! Cron scheduler: fires due jobs through the task executor.
//!
//! Each scan loads the jobs whose `next_run` has passed (or was never
//! computed) and runs them concurrently, one task per job. A failing job
//! only affects its own counters. Scans never overlap: a scan requested
//! while another is in progress returns immediately as skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleetgrid_scheduler::{NotificationEvent, TaskExecutor};
use fleetgrid_state::{CronAction, CronJob, CronRunResult, StateStore, TaskStatus, epoch_secs};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{CronError, CronResult};
use crate::schedule::CronSchedule;

/// Parameters for a new cron job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCronJob {
    pub server_id: String,
    pub name: String,
    pub expression: String,
    pub action: CronAction,
    /// Falls back to the scheduler's default timezone.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default = "default_true")]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub notify_always: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Outcome of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Another scan was already running.
    pub skipped: bool,
    pub ran: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CronScheduler {
    executor: Arc<TaskExecutor>,
    default_timezone: String,
    scanning: Arc<AtomicBool>,
}

/// Clears the scan flag when the scan ends, however it ends.
struct ScanGuard(Arc<AtomicBool>);

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CronScheduler {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            default_timezone: "UTC".to_string(),
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_default_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.default_timezone = timezone.into();
        self
    }

    fn store(&self) -> &StateStore {
        self.executor.store()
    }

    // ── Job management ─────────────────────────────────────────────

    /// Validate and store a job. Invalid expressions are rejected here,
    /// never at execution time.
    pub fn create_job(&self, new: NewCronJob) -> CronResult<CronJob> {
        if self.store().get_server(&new.server_id)?.is_none() {
            return Err(CronError::ServerNotFound(new.server_id));
        }
        let timezone = new
            .timezone
            .unwrap_or_else(|| self.default_timezone.clone());
        let schedule = CronSchedule::parse(&new.expression, &timezone)?;
        let now = epoch_secs();
        let next_run = schedule
            .next_after_epoch(now)
            .ok_or_else(|| CronError::NoUpcomingRun(new.expression.clone()))?;

        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            server_id: new.server_id,
            name: new.name,
            expression: new.expression,
            action: new.action,
            timezone,
            notify_on_success: new.notify_on_success,
            notify_on_failure: new.notify_on_failure,
            notify_always: new.notify_always,
            enabled: new.enabled,
            active: true,
            next_run: Some(next_run),
            last_run: None,
            last_result: None,
            last_error: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
        };
        self.store().put_cron_job(&job)?;
        info!(
            job_id = %job.id,
            server_id = %job.server_id,
            expression = %job.expression,
            timezone = %job.timezone,
            action = ?job.action,
            next_run,
            "cron job created"
        );
        Ok(job)
    }

    /// Enable or disable a job. Re-enabling recomputes `next_run` from now
    /// so missed firings are not replayed.
    pub fn set_enabled(&self, job_id: &str, enabled: bool) -> CronResult<CronJob> {
        let mut job = self
            .store()
            .get_cron_job(job_id)?
            .ok_or_else(|| CronError::JobNotFound(job_id.to_string()))?;
        if enabled && !job.enabled {
            let schedule = CronSchedule::parse(&job.expression, &job.timezone)?;
            job.next_run = schedule.next_after_epoch(epoch_secs());
            job.active = job.next_run.is_some();
        }
        job.enabled = enabled;
        self.store().put_cron_job(&job)?;
        info!(%job_id, enabled, "cron job toggled");
        Ok(job)
    }

    pub fn delete_job(&self, job_id: &str) -> CronResult<bool> {
        let deleted = self.store().delete_cron_job(job_id)?;
        if deleted {
            info!(%job_id, "cron job deleted");
        }
        Ok(deleted)
    }

    pub fn get_job(&self, job_id: &str) -> CronResult<Option<CronJob>> {
        Ok(self.store().get_cron_job(job_id)?)
    }

    /// All jobs, or only those of one server.
    pub fn list_jobs(&self, server_id: Option<&str>) -> CronResult<Vec<CronJob>> {
        let jobs = self.store().list_cron_jobs()?;
        Ok(match server_id {
            Some(id) => jobs.into_iter().filter(|j| j.server_id == id).collect(),
            None => jobs,
        })
    }

    // ── Scanning ───────────────────────────────────────────────────

    /// Run every job due at `now` and wait for all of them.
    pub async fn scan_once(&self, now: u64) -> CronResult<ScanReport> {
        if self.scanning.swap(true, Ordering::AcqRel) {
            debug!("cron scan already in progress, skipping");
            return Ok(ScanReport {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = ScanGuard(self.scanning.clone());

        let due = self.store().list_due_cron_jobs(now)?;
        if due.is_empty() {
            return Ok(ScanReport::default());
        }
        debug!(count = due.len(), "cron jobs due");

        let mut set = JoinSet::new();
        for job in due {
            let this = self.clone();
            set.spawn(async move {
                let job_id = job.id.clone();
                (job_id, this.run_job(job, now).await)
            });
        }

        let mut report = ScanReport::default();
        while let Some(joined) = set.join_next().await {
            report.ran += 1;
            match joined {
                Ok((_, Ok(true))) => report.succeeded += 1,
                Ok((_, Ok(false))) => report.failed += 1,
                Ok((job_id, Err(e))) => {
                    report.failed += 1;
                    error!(%job_id, error = %e, "cron job bookkeeping failed");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "cron job worker panicked");
                }
            }
        }
        info!(ran = report.ran, succeeded = report.succeeded, failed = report.failed, "cron scan finished");
        Ok(report)
    }

    /// Scan now, outside the polling interval.
    pub async fn trigger_scan(&self) -> CronResult<ScanReport> {
        self.scan_once(epoch_secs()).await
    }

    /// Fire one job and record its outcome. Returns whether the task completed.
    async fn run_job(&self, job: CronJob, now: u64) -> CronResult<bool> {
        let job_id = job.id.as_str();
        let owner = self
            .store()
            .get_server(&job.server_id)?
            .and_then(|s| s.owner_id);
        info!(%job_id, server_id = %job.server_id, action = ?job.action, "cron job firing");

        let outcome = match self
            .executor
            .execute_now(&job.server_id, job.action.task_command())
            .await
        {
            Ok(task) if task.status == TaskStatus::Completed => Ok(task.id),
            Ok(task) => Err(task
                .error
                .unwrap_or_else(|| format!("task {} ended {}", task.id, task.status))),
            Err(e) => Err(e.to_string()),
        };
        let succeeded = outcome.is_ok();

        // The job may have been edited or deleted while the task ran.
        let Some(mut current) = self.store().get_cron_job(job_id)? else {
            warn!(%job_id, "cron job vanished while running");
            return Ok(succeeded);
        };
        let finished = epoch_secs().max(now);
        current.run_count += 1;
        current.last_run = Some(finished);
        match &outcome {
            Ok(_) => {
                current.success_count += 1;
                current.last_result = Some(CronRunResult::Success);
                current.last_error = None;
            }
            Err(reason) => {
                current.failure_count += 1;
                current.last_result = Some(CronRunResult::Failed);
                current.last_error = Some(reason.clone());
                warn!(%job_id, error = %reason, "cron job failed");
            }
        }
        match CronSchedule::parse(&current.expression, &current.timezone) {
            Ok(schedule) => {
                current.next_run = schedule.next_after_epoch(finished);
                if current.next_run.is_none() {
                    current.active = false;
                    warn!(%job_id, "cron job has no further runs, deactivated");
                }
            }
            Err(e) => {
                current.next_run = None;
                current.active = false;
                warn!(%job_id, error = %e, "stored cron expression no longer parses, deactivated");
            }
        }
        self.store().put_cron_job(&current)?;

        let notify = current.notify_always
            || (succeeded && current.notify_on_success)
            || (!succeeded && current.notify_on_failure);
        if notify {
            let (event, payload) = match &outcome {
                Ok(task_id) => (
                    NotificationEvent::CronJobSucceeded,
                    json!({
                        "job_id": job_id,
                        "name": current.name,
                        "server_id": current.server_id,
                        "task_id": task_id,
                        "next_run": current.next_run,
                    }),
                ),
                Err(reason) => (
                    NotificationEvent::CronJobFailed,
                    json!({
                        "job_id": job_id,
                        "name": current.name,
                        "server_id": current.server_id,
                        "error": reason,
                        "next_run": current.next_run,
                    }),
                ),
            };
            self.executor
                .notifications()
                .send(owner.as_deref(), event, payload)
                .await;
        }
        Ok(succeeded)
    }

    /// Scan periodically until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), timezone = %self.default_timezone, "cron scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.trigger_scan().await {
                        error!(error = %e, "cron scan failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("cron scheduler shutting down");
                    break;
                }
            }
        }
    }
}
