//! End-to-end scenarios on an on-disk store.

use std::sync::Arc;
use std::time::Duration;

use fleetd::{ControlPlane, DaemonConfig};
use fleetgrid_cron::NewCronJob;
use fleetgrid_remote::mock::{self, MockExecutor};
use fleetgrid_state::*;
use tokio::sync::watch;

const GIB: u64 = 1024 * 1024 * 1024;

fn config(dir: &std::path::Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.daemon.data_dir = dir.to_path_buf();
    config.tasks.poll_interval_ms = 20;
    config.tasks.restart_delay_secs = 0;
    config.tasks.liveness_retry_delay_secs = 0;
    config
}

fn seed(plane: &ControlPlane) -> (String, String) {
    let machine = plane
        .membership
        .register_machine(
            "gs-1",
            "203.0.113.7",
            SshTarget {
                host: "10.0.0.1".into(),
                port: 22,
                user: "root".into(),
                key_path: None,
            },
            ResourceCapacity {
                cpu_cores: 16.0,
                ram_bytes: 64 * GIB,
                disk_bytes: 500 * GIB,
            },
        )
        .unwrap();
    let agent = plane.membership.register_agent(&machine.id, None).unwrap();
    plane
        .membership
        .heartbeat(
            &agent.id,
            None,
            Some(ResourceUsage {
                cpu_percent: 1.0,
                ram_used_bytes: GIB,
                disk_used_bytes: GIB,
                measured_at: epoch_secs(),
            }),
        )
        .unwrap();

    let server = Server {
        id: "s-1".into(),
        name: "rusty".into(),
        owner_id: None,
        kind: WorkloadKind::Rust,
        max_players: 50,
        ram_mb: Some(8192),
        machine_id: None,
        agent_id: None,
        ports: None,
        status: ServerStatus::Offline,
        config: serde_json::Value::Null,
        last_backup: None,
        created_at: 0,
        updated_at: 0,
    };
    plane.executor.store().put_server(&server).unwrap();
    (machine.id, agent.id)
}

#[tokio::test]
async fn state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let remote = Arc::new(MockExecutor::new());

    let machine_id = {
        let store = StateStore::open(&config.db_path()).unwrap();
        let plane = ControlPlane::build(&config, store, remote.clone());
        let (machine_id, _) = seed(&plane);
        let task = plane.executor.request_provision("s-1", None).unwrap();
        let done = plane.executor.execute(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{:?}", done.error);
        machine_id
    };

    let store = StateStore::open(&config.db_path()).unwrap();
    let server = store.get_server("s-1").unwrap().unwrap();
    assert_eq!(server.machine_id.as_deref(), Some(machine_id.as_str()));
    let ports = server.ports.unwrap();
    assert_eq!(store.list_port_allocations_for_server("s-1").unwrap().len(), 1);
    assert_eq!(
        store.get_port_allocation(&machine_id, "s-1").unwrap().unwrap().ports,
        ports
    );
}

#[tokio::test]
async fn background_loops_drain_tasks_and_stop_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let remote = Arc::new(MockExecutor::new());
    remote.on("is-active", mock::ok("RUNNING\n"));
    let store = StateStore::open(&config.db_path()).unwrap();
    let plane = ControlPlane::build(&config, store, remote.clone());
    seed(&plane);

    let (tx, rx) = watch::channel(false);
    let handles = plane.spawn_loops(&config, rx);

    let provision = plane.executor.request_provision("s-1", None).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = plane.executor.store().get_task(&provision.id).unwrap().unwrap();
        if task.status.is_terminal() {
            assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "provision never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn cron_backup_records_archive() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let remote = Arc::new(MockExecutor::new());
    let store = StateStore::open(&config.db_path()).unwrap();
    let plane = ControlPlane::build(&config, store, remote.clone());
    seed(&plane);
    let task = plane.executor.request_provision("s-1", None).unwrap();
    plane.executor.execute(&task.id).await.unwrap();
    remote.on("tar -czf", mock::ok("1048576\n"));

    let job = plane
        .cron
        .create_job(NewCronJob {
            server_id: "s-1".into(),
            name: "hourly backup".into(),
            expression: "0 * * * *".into(),
            action: CronAction::Backup,
            timezone: None,
            notify_on_success: false,
            notify_on_failure: true,
            notify_always: false,
            enabled: true,
        })
        .unwrap();
    let report = plane.cron.scan_once(job.next_run.unwrap()).await.unwrap();
    assert_eq!(report.succeeded, 1);

    let server = plane.executor.store().get_server("s-1").unwrap().unwrap();
    let backup = server.last_backup.unwrap();
    assert!(backup.path.starts_with("/opt/backups/s-1/"));
    assert_eq!(backup.size_bytes, Some(1_048_576));
    let job = plane.cron.get_job(&job.id).unwrap().unwrap();
    assert_eq!(job.success_count, 1);
}
