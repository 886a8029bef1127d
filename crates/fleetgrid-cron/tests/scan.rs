//! Cron scans against a scripted remote executor.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_cron::{CronError, CronScheduler, NewCronJob};
use fleetgrid_remote::mock::{self, MockExecutor};
use fleetgrid_scheduler::{
    ExecutorConfig, NotificationEvent, Notifications, RecordingNotifier, TaskExecutor,
};
use fleetgrid_state::*;

const GIB: u64 = 1024 * 1024 * 1024;

struct Harness {
    store: StateStore,
    remote: Arc<MockExecutor>,
    notes: Arc<RecordingNotifier>,
    exec: Arc<TaskExecutor>,
    cron: CronScheduler,
}

async fn harness(servers: &[&str]) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    store
        .put_machine(&Machine {
            id: "m-1".into(),
            name: "gs-1".into(),
            address: "10.0.0.1".into(),
            ssh: SshTarget {
                host: "10.0.0.1".into(),
                port: 22,
                user: "root".into(),
                key_path: None,
            },
            capacity: ResourceCapacity {
                cpu_cores: 32.0,
                ram_bytes: 128 * GIB,
                disk_bytes: 1000 * GIB,
            },
            usage: None,
            status: MachineStatus::Online,
            created_at: 0,
            updated_at: 0,
        })
        .unwrap();
    store
        .put_agent(&Agent {
            id: "a-1".into(),
            machine_id: "m-1".into(),
            status: AgentStatus::Online,
            version: None,
            last_heartbeat: epoch_secs(),
            created_at: 0,
        })
        .unwrap();
    for id in servers {
        store
            .put_server(&Server {
                id: id.to_string(),
                name: format!("{id} world"),
                owner_id: Some("user-1".into()),
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
    }

    let remote = Arc::new(MockExecutor::new());
    let notes = Arc::new(RecordingNotifier::new());
    let config = ExecutorConfig {
        restart_delay: Duration::from_millis(10),
        liveness_retry_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let exec = Arc::new(
        TaskExecutor::new(store.clone(), remote.clone(), config)
            .with_notifications(Notifications::new(notes.clone())),
    );
    for id in servers {
        let task = exec.request_provision(id, None).unwrap();
        let done = exec.execute(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error);
    }
    remote.on("is-active", mock::ok("RUNNING\n"));

    let cron = CronScheduler::new(exec.clone());
    Harness {
        store,
        remote,
        notes,
        exec,
        cron,
    }
}

fn job(server_id: &str, expression: &str, action: CronAction) -> NewCronJob {
    NewCronJob {
        server_id: server_id.into(),
        name: format!("{server_id} {expression}"),
        expression: expression.into(),
        action,
        timezone: None,
        notify_on_success: true,
        notify_on_failure: true,
        notify_always: false,
        enabled: true,
    }
}

#[tokio::test]
async fn create_validates_up_front() {
    let h = harness(&["s-1"]).await;

    assert!(matches!(
        h.cron.create_job(job("s-1", "0 4 * *", CronAction::Restart)),
        Err(CronError::InvalidExpression { .. })
    ));
    assert!(matches!(
        h.cron.create_job(job("ghost", "0 4 * * *", CronAction::Restart)),
        Err(CronError::ServerNotFound(_))
    ));
    let mut bad_tz = job("s-1", "0 4 * * *", CronAction::Restart);
    bad_tz.timezone = Some("Nowhere/Special".into());
    assert!(matches!(
        h.cron.create_job(bad_tz),
        Err(CronError::InvalidTimezone(_))
    ));
    assert!(h.store.list_cron_jobs().unwrap().is_empty());

    let before = epoch_secs();
    let created = h.cron.create_job(job("s-1", "0 4 * * 1-5", CronAction::Restart)).unwrap();
    assert_eq!(created.timezone, "UTC");
    assert!(created.next_run.unwrap() > before);
    assert_eq!(h.cron.list_jobs(Some("s-1")).unwrap().len(), 1);
    assert!(h.cron.list_jobs(Some("s-2")).unwrap().is_empty());
}

#[tokio::test]
async fn due_job_runs_and_reschedules() {
    let h = harness(&["s-1"]).await;
    let created = h.cron.create_job(job("s-1", "0 4 * * *", CronAction::Start)).unwrap();
    let due_at = created.next_run.unwrap();

    // Not due yet.
    let early = h.cron.scan_once(due_at - 1).await.unwrap();
    assert_eq!(early.ran, 0);

    let report = h.cron.scan_once(due_at).await.unwrap();
    assert_eq!((report.ran, report.succeeded, report.failed), (1, 1, 0));

    let after = h.cron.get_job(&created.id).unwrap().unwrap();
    assert_eq!(after.run_count, 1);
    assert_eq!(after.success_count, 1);
    assert_eq!(after.last_result, Some(CronRunResult::Success));
    assert_eq!(after.last_run, Some(due_at));
    assert_eq!(after.next_run, Some(due_at + 86_400));

    assert_eq!(h.store.get_server("s-1").unwrap().unwrap().status, ServerStatus::Online);
    let tasks = h.store.list_tasks().unwrap();
    assert!(tasks
        .iter()
        .any(|t| t.command == TaskCommand::Start && t.status == TaskStatus::Completed));
    assert!(h.notes.events().contains(&NotificationEvent::CronJobSucceeded));
}

#[tokio::test]
async fn one_failing_job_does_not_stop_the_others() {
    let h = harness(&["s-1", "s-2"]).await;
    h.remote.on("systemctl start server-s-2", mock::unreachable());
    let ok = h.cron.create_job(job("s-1", "*/5 * * * *", CronAction::Start)).unwrap();
    let bad = h.cron.create_job(job("s-2", "*/5 * * * *", CronAction::Start)).unwrap();
    let now = ok.next_run.unwrap().max(bad.next_run.unwrap());

    let report = h.cron.scan_once(now).await.unwrap();
    assert_eq!((report.ran, report.succeeded, report.failed), (2, 1, 1));

    let ok = h.cron.get_job(&ok.id).unwrap().unwrap();
    let bad = h.cron.get_job(&bad.id).unwrap().unwrap();
    assert_eq!(ok.success_count, 1);
    assert_eq!(bad.failure_count, 1);
    assert_eq!(bad.last_result, Some(CronRunResult::Failed));
    assert!(bad.last_error.as_deref().unwrap().contains("transport"));
    // A failed job is still rescheduled.
    assert!(bad.next_run.unwrap() > now);
    assert!(h.notes.events().contains(&NotificationEvent::CronJobFailed));
}

#[tokio::test]
async fn overlapping_scans_are_skipped() {
    let h = harness(&["s-1"]).await;
    h.remote
        .on_delayed("systemctl start", mock::ok(""), Duration::from_millis(200));
    let created = h.cron.create_job(job("s-1", "* * * * *", CronAction::Start)).unwrap();
    let now = created.next_run.unwrap();

    let (first, second) = tokio::join!(h.cron.scan_once(now), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.cron.scan_once(now).await
    });
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(!first.skipped);
    assert_eq!(first.ran, 1);
    assert!(second.skipped);
    assert_eq!(second.ran, 0);
    assert_eq!(h.remote.calls_matching("systemctl start").len(), 1);

    // The guard is released once the scan ends.
    let third = h.cron.scan_once(now).await.unwrap();
    assert!(!third.skipped);
}

#[tokio::test]
async fn disabled_jobs_are_not_fired() {
    let h = harness(&["s-1"]).await;
    let mut new = job("s-1", "* * * * *", CronAction::Backup);
    new.enabled = false;
    let created = h.cron.create_job(new).unwrap();
    let now = created.next_run.unwrap() + 3600;

    assert_eq!(h.cron.scan_once(now).await.unwrap().ran, 0);

    let enabled = h.cron.set_enabled(&created.id, true).unwrap();
    assert!(enabled.enabled);
    assert!(enabled.next_run.unwrap() > epoch_secs() - 1);

    assert!(h.cron.delete_job(&created.id).unwrap());
    assert!(!h.cron.delete_job(&created.id).unwrap());
    assert!(matches!(
        h.cron.set_enabled(&created.id, false),
        Err(CronError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn quiet_jobs_do_not_notify() {
    let h = harness(&["s-1"]).await;
    let mut new = job("s-1", "* * * * *", CronAction::Start);
    new.notify_on_success = false;
    let created = h.cron.create_job(new).unwrap();

    let report = h.cron.scan_once(created.next_run.unwrap()).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(!h.notes.events().contains(&NotificationEvent::CronJobSucceeded));
    // The task itself still reports.
    assert!(h.notes.events().contains(&NotificationEvent::TaskCompleted));
    assert!(h.exec.locks().active_locks().is_empty());
}
