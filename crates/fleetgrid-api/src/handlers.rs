//! REST API handlers for the fleet: machines, agents, servers, tasks.
//!
//! Reads go straight to the `StateStore`. Server actions are submitted
//! through the `TaskExecutor` and answered with the PENDING task.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use fleetgrid_scheduler::{ErrorClass, SchedulerError};
use fleetgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

pub(crate) fn internal(e: impl std::fmt::Display) -> Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
}

/// HTTP status for a scheduler error.
pub(crate) fn scheduler_error(e: &SchedulerError) -> Response {
    let status = match e {
        SchedulerError::TaskNotFound(_)
        | SchedulerError::ServerNotFound(_)
        | SchedulerError::AgentNotFound(_)
        | SchedulerError::MachineNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::InvalidMigration(_) => StatusCode::BAD_REQUEST,
        _ => match e.class() {
            ErrorClass::StateConflict => StatusCode::CONFLICT,
            ErrorClass::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorClass::Transport => StatusCode::BAD_GATEWAY,
            ErrorClass::RemoteCommand | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    error_response(&e.to_string(), status)
}

fn accepted(task: Task) -> Response {
    (StatusCode::ACCEPTED, ApiResponse::ok(task)).into_response()
}

// ── Machines ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterMachineRequest {
    pub name: String,
    pub address: String,
    pub ssh: SshTarget,
    #[serde(default)]
    pub capacity: ResourceCapacity,
}

/// GET /api/v1/machines
pub async fn list_machines(State(state): State<ApiState>) -> Response {
    match state.executor.store().list_machines() {
        Ok(machines) => ApiResponse::ok(machines).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/machines
pub async fn register_machine(
    State(state): State<ApiState>,
    Json(req): Json<RegisterMachineRequest>,
) -> Response {
    if req.name.trim().is_empty() || req.ssh.host.trim().is_empty() {
        return error_response("name and ssh.host are required", StatusCode::BAD_REQUEST);
    }
    match state
        .membership
        .register_machine(&req.name, &req.address, req.ssh, req.capacity)
    {
        Ok(machine) => (StatusCode::CREATED, ApiResponse::ok(machine)).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

// ── Agents ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterAgentRequest {
    pub machine_id: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub usage: Option<ResourceUsage>,
}

/// GET /api/v1/agents
pub async fn list_agents(State(state): State<ApiState>) -> Response {
    match state.executor.store().list_agents() {
        Ok(agents) => ApiResponse::ok(agents).into_response(),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/agents
pub async fn register_agent(
    State(state): State<ApiState>,
    Json(req): Json<RegisterAgentRequest>,
) -> Response {
    match state.membership.register_agent(&req.machine_id, req.version) {
        Ok(agent) => (StatusCode::CREATED, ApiResponse::ok(agent)).into_response(),
        Err(e) => scheduler_error(&e),
    }
}

/// POST /api/v1/agents/:id/heartbeat
pub async fn agent_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    match state.membership.heartbeat(&id, req.version, req.usage) {
        Ok(true) => ApiResponse::ok("ok").into_response(),
        Ok(false) => error_response("agent not found", StatusCode::NOT_FOUND),
        Err(e) => scheduler_error(&e),
    }
}

/// POST /api/v1/agents/:id/install
pub async fn install_agent(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.executor.submit(&id, None, TaskCommand::InstallAgent) {
        Ok(task) => accepted(task),
        Err(e) => scheduler_error(&e),
    }
}

// ── Servers ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub kind: WorkloadKind,
    pub max_players: u32,
    #[serde(default)]
    pub ram_mb: Option<u32>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// GET /api/v1/servers
pub async fn list_servers(State(state): State<ApiState>) -> Response {
    match state.executor.store().list_servers() {
        Ok(servers) => ApiResponse::ok(servers).into_response(),
        Err(e) => internal(e),
    }
}

/// GET /api/v1/servers/:id
pub async fn get_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.executor.store().get_server(&id) {
        Ok(Some(server)) => ApiResponse::ok(server).into_response(),
        Ok(None) => error_response("server not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

/// POST /api/v1/servers
///
/// Creates the record only. Placement happens on provision.
pub async fn create_server(
    State(state): State<ApiState>,
    Json(req): Json<CreateServerRequest>,
) -> Response {
    if req.name.trim().is_empty() {
        return error_response("name is required", StatusCode::BAD_REQUEST);
    }
    if req.max_players == 0 {
        return error_response("max_players must be positive", StatusCode::BAD_REQUEST);
    }
    let now = epoch_secs();
    let server = Server {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        owner_id: req.owner_id,
        kind: req.kind,
        max_players: req.max_players,
        ram_mb: req.ram_mb,
        machine_id: None,
        agent_id: None,
        ports: None,
        status: ServerStatus::Offline,
        config: req.config,
        last_backup: None,
        created_at: now,
        updated_at: now,
    };
    match state.executor.store().put_server(&server) {
        Ok(()) => {
            info!(server_id = %server.id, kind = %server.kind, "server created");
            (StatusCode::CREATED, ApiResponse::ok(server)).into_response()
        }
        Err(e) => internal(e),
    }
}

// ── Server actions ─────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct ProvisionParams {
    pub preferred_port: Option<u16>,
}

#[derive(Deserialize, Default)]
pub struct BackupParams {
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct MigrateRequest {
    pub target_machine_id: String,
    pub target_agent_id: String,
}

fn submit(state: &ApiState, server_id: &str, command: TaskCommand) -> Response {
    match state.executor.submit_for_server(server_id, command) {
        Ok(task) => accepted(task),
        Err(e) => scheduler_error(&e),
    }
}

/// POST /api/v1/servers/:id/provision
///
/// Chooses a machine up front when the server has none.
pub async fn provision_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<ProvisionParams>,
) -> Response {
    match state.executor.request_provision(&id, params.preferred_port) {
        Ok(task) => accepted(task),
        Err(e) => scheduler_error(&e),
    }
}

/// POST /api/v1/servers/:id/start
pub async fn start_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    submit(&state, &id, TaskCommand::Start)
}

/// POST /api/v1/servers/:id/stop
pub async fn stop_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    submit(&state, &id, TaskCommand::Stop)
}

/// POST /api/v1/servers/:id/restart
pub async fn restart_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    submit(&state, &id, TaskCommand::Restart)
}

/// POST /api/v1/servers/:id/update
pub async fn update_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    submit(&state, &id, TaskCommand::Update)
}

/// POST /api/v1/servers/:id/backup
pub async fn backup_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<BackupParams>,
) -> Response {
    submit(&state, &id, TaskCommand::Backup { name: params.name })
}

/// POST /api/v1/servers/:id/delete
pub async fn delete_server(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    submit(&state, &id, TaskCommand::Delete)
}

/// POST /api/v1/servers/:id/migrate
pub async fn migrate_server(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> Response {
    let command = TaskCommand::Migrate {
        target_machine_id: req.target_machine_id,
        target_agent_id: req.target_agent_id,
    };
    submit(&state, &id, command)
}

// ── Tasks ──────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct TaskFilter {
    pub server_id: Option<String>,
    pub status: Option<TaskStatus>,
}

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>, Query(filter): Query<TaskFilter>) -> Response {
    match state.executor.store().list_tasks() {
        Ok(tasks) => {
            let tasks: Vec<Task> = tasks
                .into_iter()
                .filter(|t| {
                    filter
                        .server_id
                        .as_deref()
                        .is_none_or(|id| t.server_id.as_deref() == Some(id))
                })
                .filter(|t| filter.status.is_none_or(|s| t.status == s))
                .collect();
            ApiResponse::ok(tasks).into_response()
        }
        Err(e) => internal(e),
    }
}

/// GET /api/v1/tasks/:id
pub async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.executor.store().get_task(&id) {
        Ok(Some(task)) => ApiResponse::ok(task).into_response(),
        Ok(None) => error_response("task not found", StatusCode::NOT_FOUND),
        Err(e) => internal(e),
    }
}

// ── Locks ──────────────────────────────────────────────────────

/// GET /api/v1/locks
pub async fn list_locks(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.executor.locks().active_locks()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetgrid_remote::mock::MockExecutor;
    use fleetgrid_scheduler::{ExecutorConfig, TaskExecutor};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let exec = TaskExecutor::new(store, Arc::new(MockExecutor::new()), ExecutorConfig::default());
        ApiState::new(Arc::new(exec))
    }

    fn ssh() -> SshTarget {
        SshTarget {
            host: "10.0.0.1".into(),
            port: 22,
            user: "root".into(),
            key_path: None,
        }
    }

    /// A machine with one online agent, ready for placement.
    fn online_host(state: &ApiState) -> (Machine, Agent) {
        let machine = state
            .membership
            .register_machine(
                "gs-1",
                "203.0.113.7",
                ssh(),
                ResourceCapacity {
                    cpu_cores: 16.0,
                    ram_bytes: 64 * GIB,
                    disk_bytes: 500 * GIB,
                },
            )
            .unwrap();
        let agent = state.membership.register_agent(&machine.id, None).unwrap();
        state.membership.heartbeat(&agent.id, None, None).unwrap();
        let mut machine = state.executor.store().get_machine(&machine.id).unwrap().unwrap();
        machine.status = MachineStatus::Online;
        state.executor.store().put_machine(&machine).unwrap();
        (machine, agent)
    }

    async fn create(state: &ApiState) -> Server {
        let resp = create_server(
            State(state.clone()),
            Json(CreateServerRequest {
                name: "vikings".into(),
                kind: WorkloadKind::Valheim,
                max_players: 10,
                ram_mb: None,
                owner_id: Some("user-1".into()),
                config: serde_json::Value::Null,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        state.executor.store().list_servers().unwrap().remove(0)
    }

    #[tokio::test]
    async fn list_machines_empty() {
        let resp = list_machines(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_machine_requires_host() {
        let state = test_state();
        let mut target = ssh();
        target.host = " ".into();
        let resp = register_machine(
            State(state),
            Json(RegisterMachineRequest {
                name: "gs-1".into(),
                address: "203.0.113.7".into(),
                ssh: target,
                capacity: ResourceCapacity::default(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_for_unknown_machine_is_not_found() {
        let resp = register_agent(
            State(test_state()),
            Json(RegisterAgentRequest {
                machine_id: "ghost".into(),
                version: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent() {
        let resp = agent_heartbeat(
            State(test_state()),
            Path("ghost".into()),
            Json(HeartbeatRequest::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_server_validates_players() {
        let resp = create_server(
            State(test_state()),
            Json(CreateServerRequest {
                name: "empty".into(),
                kind: WorkloadKind::Minecraft,
                max_players: 0,
                ram_mb: None,
                owner_id: None,
                config: serde_json::Value::Null,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn provision_queues_a_pending_task() {
        let state = test_state();
        let (machine, agent) = online_host(&state);
        let server = create(&state).await;

        let resp = provision_server(
            State(state.clone()),
            Path(server.id.clone()),
            Query(ProvisionParams::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let tasks = state.executor.store().list_pending_tasks(10).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].agent_id, agent.id);
        let server = state.executor.store().get_server(&server.id).unwrap().unwrap();
        assert_eq!(server.machine_id.as_deref(), Some(machine.id.as_str()));
    }

    #[tokio::test]
    async fn provision_without_capacity_is_unavailable() {
        let state = test_state();
        let server = create(&state).await;
        let resp = provision_server(
            State(state),
            Path(server.id),
            Query(ProvisionParams::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn start_before_provision_conflicts() {
        let state = test_state();
        let server = create(&state).await;
        let resp = start_server(State(state), Path(server.id)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn actions_on_unknown_server_are_not_found() {
        let resp = stop_server(State(test_state()), Path("ghost".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_unknown_task() {
        let resp = get_task(State(test_state()), Path("nope".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn locks_empty() {
        let resp = list_locks(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
