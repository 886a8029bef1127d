//! REST API handlers for cron jobs.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use fleetgrid_cron::{CronError, NewCronJob};

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, scheduler_error};

fn cron_error(e: &CronError) -> Response {
    let status = match e {
        CronError::InvalidExpression { .. }
        | CronError::InvalidTimezone(_)
        | CronError::NoUpcomingRun(_) => StatusCode::BAD_REQUEST,
        CronError::ServerNotFound(_) | CronError::JobNotFound(_) => StatusCode::NOT_FOUND,
        CronError::Scheduler(inner) => return scheduler_error(inner),
        CronError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

#[derive(Deserialize, Default)]
pub struct CronFilter {
    pub server_id: Option<String>,
}

#[derive(Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

/// GET /api/v1/cron-jobs
pub async fn list_cron_jobs(
    State(state): State<ApiState>,
    Query(filter): Query<CronFilter>,
) -> Response {
    match state.cron.list_jobs(filter.server_id.as_deref()) {
        Ok(jobs) => ApiResponse::ok(jobs).into_response(),
        Err(e) => cron_error(&e),
    }
}

/// POST /api/v1/cron-jobs
pub async fn create_cron_job(
    State(state): State<ApiState>,
    Json(req): Json<NewCronJob>,
) -> Response {
    match state.cron.create_job(req) {
        Ok(job) => (StatusCode::CREATED, ApiResponse::ok(job)).into_response(),
        Err(e) => cron_error(&e),
    }
}

/// DELETE /api/v1/cron-jobs/:id
pub async fn delete_cron_job(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.cron.delete_job(&id) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("cron job not found", StatusCode::NOT_FOUND),
        Err(e) => cron_error(&e),
    }
}

/// POST /api/v1/cron-jobs/:id/enabled
pub async fn set_cron_job_enabled(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> Response {
    match state.cron.set_enabled(&id, req.enabled) {
        Ok(job) => ApiResponse::ok(job).into_response(),
        Err(e) => cron_error(&e),
    }
}

/// POST /api/v1/cron-jobs/scan
///
/// Runs due jobs inline and returns the scan report.
pub async fn trigger_scan(State(state): State<ApiState>) -> Response {
    match state.cron.trigger_scan().await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => cron_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fleetgrid_remote::mock::MockExecutor;
    use fleetgrid_scheduler::{ExecutorConfig, TaskExecutor};
    use fleetgrid_state::*;

    fn test_state() -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_server(&Server {
                id: "s-1".into(),
                name: "vikings".into(),
                owner_id: None,
                kind: WorkloadKind::Valheim,
                max_players: 10,
                ram_mb: None,
                machine_id: None,
                agent_id: None,
                ports: None,
                status: ServerStatus::Offline,
                config: serde_json::Value::Null,
                last_backup: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let exec = TaskExecutor::new(store, Arc::new(MockExecutor::new()), ExecutorConfig::default());
        ApiState::new(Arc::new(exec))
    }

    fn new_job(expression: &str) -> NewCronJob {
        NewCronJob {
            server_id: "s-1".into(),
            name: "nightly".into(),
            expression: expression.into(),
            action: CronAction::Restart,
            timezone: Some("Europe/Berlin".into()),
            notify_on_success: false,
            notify_on_failure: true,
            notify_always: false,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn create_rejects_bad_expression() {
        let state = test_state();
        let resp = create_cron_job(State(state), Json(new_job("every night"))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_list_delete() {
        let state = test_state();
        let resp = create_cron_job(State(state.clone()), Json(new_job("0 4 * * *"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let jobs = state.cron.list_jobs(None).unwrap();
        assert_eq!(jobs.len(), 1);
        let id = jobs[0].id.clone();

        let resp = list_cron_jobs(
            State(state.clone()),
            Query(CronFilter {
                server_id: Some("s-1".into()),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = set_cron_job_enabled(
            State(state.clone()),
            Path(id.clone()),
            Json(EnabledRequest { enabled: false }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!state.cron.get_job(&id).unwrap().unwrap().enabled);

        let resp = delete_cron_job(State(state.clone()), Path(id.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = delete_cron_job(State(state), Path(id)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let state = test_state();
        let mut job = new_job("0 4 * * *");
        job.server_id = "ghost".into();
        let resp = create_cron_job(State(state), Json(job)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scan_with_nothing_due() {
        let state = test_state();
        let resp = trigger_scan(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
