//! fleetgrid-api: REST API for the fleet orchestrator.
//!
//! Server actions never run inline: each creates a PENDING task and answers
//! `202 Accepted` with it. The task runner picks it up from the store.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/machines` | List machines |
//! | POST | `/api/v1/machines` | Register a machine |
//! | GET | `/api/v1/agents` | List agents |
//! | POST | `/api/v1/agents` | Register an agent |
//! | POST | `/api/v1/agents/{id}/heartbeat` | Agent heartbeat |
//! | POST | `/api/v1/agents/{id}/install` | Queue INSTALL_AGENT |
//! | GET | `/api/v1/servers` | List servers |
//! | POST | `/api/v1/servers` | Create a server record |
//! | GET | `/api/v1/servers/{id}` | Get a server |
//! | POST | `/api/v1/servers/{id}/{action}` | Queue provision/start/stop/restart/update/backup/delete/migrate |
//! | GET | `/api/v1/tasks` | List tasks (`?server_id=`, `?status=`) |
//! | GET | `/api/v1/tasks/{id}` | Get a task |
//! | GET | `/api/v1/cron-jobs` | List cron jobs (`?server_id=`) |
//! | POST | `/api/v1/cron-jobs` | Create a cron job |
//! | DELETE | `/api/v1/cron-jobs/{id}` | Delete a cron job |
//! | POST | `/api/v1/cron-jobs/{id}/enabled` | Enable or disable a cron job |
//! | POST | `/api/v1/cron-jobs/scan` | Run a cron scan now |
//! | GET | `/api/v1/locks` | Held provisioning locks |

pub mod cron_handlers;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use fleetgrid_cron::CronScheduler;
use fleetgrid_scheduler::{AgentMembership, TaskExecutor};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<TaskExecutor>,
    pub membership: AgentMembership,
    pub cron: CronScheduler,
}

impl ApiState {
    /// Membership and cron share the executor's store.
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self {
            membership: AgentMembership::new(executor.store().clone()),
            cron: CronScheduler::new(executor.clone()),
            executor,
        }
    }

    pub fn with_membership(mut self, membership: AgentMembership) -> Self {
        self.membership = membership;
        self
    }

    pub fn with_cron(mut self, cron: CronScheduler) -> Self {
        self.cron = cron;
        self
    }
}

/// Build the `/api/v1` router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/machines", get(handlers::list_machines).post(handlers::register_machine))
        .route("/agents", get(handlers::list_agents).post(handlers::register_agent))
        .route("/agents/{id}/heartbeat", post(handlers::agent_heartbeat))
        .route("/agents/{id}/install", post(handlers::install_agent))
        .route("/servers", get(handlers::list_servers).post(handlers::create_server))
        .route("/servers/{id}", get(handlers::get_server))
        .route("/servers/{id}/provision", post(handlers::provision_server))
        .route("/servers/{id}/start", post(handlers::start_server))
        .route("/servers/{id}/stop", post(handlers::stop_server))
        .route("/servers/{id}/restart", post(handlers::restart_server))
        .route("/servers/{id}/update", post(handlers::update_server))
        .route("/servers/{id}/backup", post(handlers::backup_server))
        .route("/servers/{id}/delete", post(handlers::delete_server))
        .route("/servers/{id}/migrate", post(handlers::migrate_server))
        .route("/tasks", get(handlers::list_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/locks", get(handlers::list_locks))
        .route("/cron-jobs", get(cron_handlers::list_cron_jobs).post(cron_handlers::create_cron_job))
        .route("/cron-jobs/scan", post(cron_handlers::trigger_scan))
        .route("/cron-jobs/{id}", delete(cron_handlers::delete_cron_job))
        .route("/cron-jobs/{id}/enabled", post(cron_handlers::set_cron_job_enabled))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
