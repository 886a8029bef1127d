//! Control plane: wires the store, executor and background loops, and
//! serves the REST API.
//!
//! In this mode, the daemon:
//! 1. Opens the redb state store under the data directory
//! 2. Builds the task executor over the system ssh client
//! 3. Runs the task runner, cron scheduler and agent sweep loops
//! 4. Serves the REST API until Ctrl-C, then stops the loops

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use fleetgrid_api::ApiState;
use fleetgrid_cron::CronScheduler;
use fleetgrid_remote::{RemoteExecutor, SshExecutor};
use fleetgrid_scheduler::{AgentMembership, Notifications, TaskExecutor, TaskRunner};
use fleetgrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::DaemonConfig;

/// Every long-lived component of the daemon.
#[derive(Clone)]
pub struct ControlPlane {
    pub executor: Arc<TaskExecutor>,
    pub runner: TaskRunner,
    pub cron: CronScheduler,
    pub membership: AgentMembership,
}

impl ControlPlane {
    pub fn build(config: &DaemonConfig, store: StateStore, remote: Arc<dyn RemoteExecutor>) -> Self {
        let executor = Arc::new(
            TaskExecutor::new(store.clone(), remote, config.executor_config())
                .with_notifications(Notifications::log_only())
                .with_workloads(config.workloads.clone()),
        );
        let runner = TaskRunner::new(executor.clone()).with_batch_size(config.tasks.batch_size);
        let cron = CronScheduler::new(executor.clone())
            .with_default_timezone(config.cron.default_timezone.clone());
        let membership = AgentMembership::new(store).with_heartbeat_timeout(Duration::from_secs(
            config.membership.heartbeat_timeout_secs,
        ));
        Self {
            executor,
            runner,
            cron,
            membership,
        }
    }

    pub fn router(&self) -> Router {
        let state = ApiState::new(self.executor.clone())
            .with_membership(self.membership.clone())
            .with_cron(self.cron.clone());
        fleetgrid_api::build_router(state)
    }

    /// Start the runner, cron and sweep loops. They stop when `shutdown` flips.
    pub fn spawn_loops(
        &self,
        config: &DaemonConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let runner = self.runner.clone();
        let poll = Duration::from_millis(config.tasks.poll_interval_ms);
        let runner_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            runner.run(poll, runner_shutdown).await;
        }));

        if config.cron.enabled {
            let cron = self.cron.clone();
            let scan = Duration::from_secs(config.cron.scan_interval_secs);
            let cron_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                cron.run(scan, cron_shutdown).await;
            }));
        } else {
            info!("cron scheduler disabled");
        }

        let membership = self.membership.clone();
        let sweep = Duration::from_secs(config.membership.sweep_interval_secs);
        handles.push(tokio::spawn(async move {
            membership.run(sweep, shutdown).await;
        }));

        handles
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run_control_plane(config: DaemonConfig) -> anyhow::Result<()> {
    info!("fleetd starting");
    std::fs::create_dir_all(&config.daemon.data_dir)?;

    // ── State store ──────────────────────────────────────────────
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Executor and loops ───────────────────────────────────────
    let remote: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(config.ssh_config()));
    let plane = ControlPlane::build(&config, store, remote);
    info!(
        batch_size = config.tasks.batch_size,
        port_max_attempts = config.ports.max_attempts,
        "task executor initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.spawn_loops(&config, shutdown_rx);

    // ── REST API server ──────────────────────────────────────────
    let addr = config.daemon.listen;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, plane.router()).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    for handle in handles {
        let _ = handle.await;
    }

    info!(in_flight = plane.runner.in_flight(), "fleetd stopped");
    Ok(())
}
