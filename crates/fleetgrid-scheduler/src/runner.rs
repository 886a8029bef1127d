//! Polling loop that feeds PENDING tasks to the executor.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetgrid_state::Task;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::executor::TaskExecutor;

/// Default number of tasks claimed per tick.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Claims the oldest PENDING tasks and runs them concurrently.
///
/// Tasks already running in this process are skipped, so a slow install
/// never gets handed to the executor twice. The executor's atomic claim
/// covers other processes.
#[derive(Clone)]
pub struct TaskRunner {
    executor: Arc<TaskExecutor>,
    batch_size: usize,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl TaskRunner {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            executor,
            batch_size: DEFAULT_BATCH_SIZE,
            in_flight: Arc::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Pick up to one batch of pending tasks not already in flight.
    fn take_batch(&self) -> SchedulerResult<Vec<Task>> {
        let pending = self
            .executor
            .store()
            .list_pending_tasks(self.batch_size + self.in_flight())?;
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let batch: Vec<Task> = pending
            .into_iter()
            .filter(|t| !in_flight.contains(&t.id))
            .take(self.batch_size)
            .collect();
        for task in &batch {
            in_flight.insert(task.id.clone());
        }
        Ok(batch)
    }

    /// Execute one claimed task and clear its in-flight mark.
    fn worker(&self, task: Task) -> impl Future<Output = Option<Task>> + Send + use<> {
        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();
        async move {
            let outcome = executor.execute(&task.id).await;
            if let Ok(mut s) = in_flight.lock() {
                s.remove(&task.id);
            }
            match outcome {
                Ok(finished) => Some(finished),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "task could not be executed");
                    None
                }
            }
        }
    }

    /// Run one batch and wait for all of it. Returns the finished tasks.
    pub async fn run_pending(&self) -> SchedulerResult<Vec<Task>> {
        let batch = self.take_batch()?;
        let mut set = JoinSet::new();
        for task in batch {
            set.spawn(self.worker(task));
        }
        let mut finished = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(task)) => finished.push(task),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "task worker panicked"),
            }
        }
        Ok(finished)
    }

    /// Start one batch in the background without waiting for it.
    pub fn tick(&self) -> SchedulerResult<usize> {
        let batch = self.take_batch()?;
        let count = batch.len();
        for task in batch {
            tokio::spawn(self.worker(task));
        }
        if count > 0 {
            debug!(count, "tasks dispatched");
        }
        Ok(count)
    }

    /// Poll until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, batch = self.batch_size, "task runner started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick() {
                        tracing::error!(error = %e, "task poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(in_flight = self.in_flight(), "task runner shutting down");
                    break;
                }
            }
        }
    }
}
