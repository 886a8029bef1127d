//! Task executor: the lifecycle state machine.
//!
//! A task moves `PENDING → RUNNING → {COMPLETED, FAILED}`. [`TaskExecutor::execute`]
//! claims the task atomically, dispatches on its [`TaskCommand`], and records
//! the outcome. It is the single recovery boundary: whatever a handler
//! returns, the task ends terminal, and a server left mid-transition is
//! flipped to ERROR.
//!
//! Handlers follow one ordering: mutate the host, then persist the server
//! fields that describe the new host state. A crash between steps leaves the
//! database describing the last step that finished.

use std::sync::Arc;
use std::time::Duration;

use fleetgrid_placement::MachineSelector;
use fleetgrid_ports::{AllocatorConfig, PortAllocator};
use fleetgrid_remote::{DEFAULT_TIMEOUT, RemoteExecutor};
use fleetgrid_state::{
    Agent, AgentStatus, BackupRecord, Machine, MachineStatus, PortSet, Server, ServerStatus,
    StateError, StateStore, Task, TaskCommand, TaskKind, TaskStatus, epoch_secs,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::commands;
use crate::error::{ErrorClass, SchedulerError, SchedulerResult};
use crate::host::HostOps;
use crate::lock::{ProvisioningGuard, ProvisioningLocks};
use crate::notify::{NotificationEvent, Notifications};
use crate::workload::{TemplateParams, WorkloadCatalog, render};

/// How often [`TaskExecutor::execute_now`] re-reads a task another worker claimed.
const FINISH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timeouts, delays and remote paths for task handlers.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Short remote steps: systemctl, unit writes, removal.
    pub command_timeout: Duration,
    /// Install, update and agent install scripts.
    pub install_timeout: Duration,
    /// Migration file copies.
    pub transfer_timeout: Duration,
    /// Liveness and port probes.
    pub probe_timeout: Duration,
    /// Pause between the stop and start halves of a restart.
    pub restart_delay: Duration,
    /// Pause before the single liveness re-check.
    pub liveness_retry_delay: Duration,
    pub servers_root: String,
    pub backups_root: String,
    /// Shell command that installs the agent. `{agent_id}` and
    /// `{machine_id}` are substituted.
    pub agent_install_script: String,
    /// Bound on port candidates tried per allocation.
    pub port_max_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(120),
            install_timeout: DEFAULT_TIMEOUT,
            transfer_timeout: Duration::from_secs(30 * 60),
            probe_timeout: Duration::from_secs(30),
            restart_delay: Duration::from_secs(5),
            liveness_retry_delay: Duration::from_secs(5),
            servers_root: "/opt/servers".to_string(),
            backups_root: "/opt/backups".to_string(),
            agent_install_script:
                "curl -fsSL https://get.fleetgrid.dev/agent.sh | sh -s -- --agent-id {agent_id} --machine-id {machine_id}"
                    .to_string(),
            port_max_attempts: 100,
        }
    }
}

/// Runs tasks against the fleet.
pub struct TaskExecutor {
    store: StateStore,
    executor: Arc<dyn RemoteExecutor>,
    host: HostOps,
    ports: PortAllocator,
    selector: MachineSelector,
    locks: ProvisioningLocks,
    notifications: Notifications,
    workloads: WorkloadCatalog,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(store: StateStore, executor: Arc<dyn RemoteExecutor>, config: ExecutorConfig) -> Self {
        let host = HostOps::new(executor.clone(), config.probe_timeout, config.liveness_retry_delay);
        let ports = PortAllocator::new(
            store.clone(),
            executor.clone(),
            AllocatorConfig {
                max_attempts: config.port_max_attempts,
                probe_timeout: config.probe_timeout,
            },
        );
        Self {
            selector: MachineSelector::new(store.clone()),
            store,
            executor,
            host,
            ports,
            locks: ProvisioningLocks::new(),
            notifications: Notifications::log_only(),
            workloads: WorkloadCatalog::default(),
            config,
        }
    }

    /// Share a lock manager with other components.
    pub fn with_locks(mut self, locks: ProvisioningLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_notifications(mut self, notifications: Notifications) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn with_workloads(mut self, workloads: WorkloadCatalog) -> Self {
        self.workloads = workloads;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn locks(&self) -> &ProvisioningLocks {
        &self.locks
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    // ── Submission ─────────────────────────────────────────────────

    /// Record a new PENDING task.
    pub fn submit(
        &self,
        agent_id: &str,
        server_id: Option<&str>,
        command: TaskCommand,
    ) -> SchedulerResult<Task> {
        if self.store.get_agent(agent_id)?.is_none() {
            return Err(SchedulerError::AgentNotFound(agent_id.to_string()));
        }
        if let Some(id) = server_id
            && self.store.get_server(id)?.is_none()
        {
            return Err(SchedulerError::ServerNotFound(id.to_string()));
        }

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            server_id: server_id.map(str::to_string),
            command,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: epoch_secs(),
            started_at: None,
            completed_at: None,
        };
        self.store.put_task(&task)?;
        info!(task_id = %task.id, kind = %task.kind(), %agent_id, server_id = ?server_id, "task submitted");
        Ok(task)
    }

    /// Submit a task against the agent the server is assigned to.
    pub fn submit_for_server(&self, server_id: &str, command: TaskCommand) -> SchedulerResult<Task> {
        let server = self.load_server(server_id)?;
        let agent_id = server
            .agent_id
            .ok_or_else(|| SchedulerError::Unassigned(server_id.to_string()))?;
        self.submit(&agent_id, Some(server_id), command)
    }

    /// Submit a PROVISION task, choosing a machine first if the server has none.
    pub fn request_provision(
        &self,
        server_id: &str,
        preferred_port: Option<u16>,
    ) -> SchedulerResult<Task> {
        let server = self.load_server(server_id)?;
        let agent_id = match server.agent_id {
            Some(agent_id) => agent_id,
            None => {
                let selection = self.selector.select_best(server.kind, server.max_players)?;
                self.store.update_server(server_id, |mut s| {
                    s.machine_id = Some(selection.machine_id.clone());
                    s.agent_id = Some(selection.agent_id.clone());
                    s.updated_at = epoch_secs();
                    Ok(s)
                })?;
                selection.agent_id
            }
        };
        self.submit(&agent_id, Some(server_id), TaskCommand::Provision { preferred_port })
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Claim and run one task to a terminal status.
    ///
    /// Returns the finished task whether it COMPLETED or FAILED. `Err` means
    /// the task could not be claimed or its outcome could not be stored.
    pub async fn execute(&self, task_id: &str) -> SchedulerResult<Task> {
        let task = match self.store.claim_task(task_id, epoch_secs()) {
            Ok(task) => task,
            Err(StateError::NotFound(_)) => {
                return Err(SchedulerError::TaskNotFound(task_id.to_string()));
            }
            Err(StateError::Conflict(_)) => {
                let status = self
                    .store
                    .get_task(task_id)?
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::Running);
                warn!(%task_id, %status, "refusing to run non-pending task");
                return Err(SchedulerError::TaskNotPending {
                    task_id: task_id.to_string(),
                    status,
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.drive(task).await
    }

    /// Submit a task for `server_id` and run it inline.
    ///
    /// The task goes through PENDING and the normal claim like any other. If
    /// the runner claims it first, this waits for the runner to finish it.
    pub async fn execute_now(&self, server_id: &str, command: TaskCommand) -> SchedulerResult<Task> {
        let task = self.submit_for_server(server_id, command)?;
        match self.execute(&task.id).await {
            Err(SchedulerError::TaskNotPending { .. }) => self.wait_finished(&task.id).await,
            other => other,
        }
    }

    async fn wait_finished(&self, task_id: &str) -> SchedulerResult<Task> {
        loop {
            let task = self
                .store
                .get_task(task_id)?
                .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(FINISH_POLL_INTERVAL).await;
        }
    }

    /// Dispatch a RUNNING task and record its terminal status.
    async fn drive(&self, task: Task) -> SchedulerResult<Task> {
        let task_id = task.id.as_str();
        let kind = task.kind();
        let owner = match &task.server_id {
            Some(id) => self.store.get_server(id)?.and_then(|s| s.owner_id),
            None => None,
        };
        info!(%task_id, %kind, agent_id = %task.agent_id, server_id = ?task.server_id, "task running");

        let outcome = self.dispatch(&task).await;

        let finished = match outcome {
            Ok(result) => {
                let finished = self.store.finish_task(task_id, Ok(result), epoch_secs())?;
                info!(%task_id, %kind, "task completed");
                self.notifications
                    .send(
                        owner.as_deref(),
                        NotificationEvent::TaskCompleted,
                        json!({ "task_id": task_id, "kind": kind, "server_id": task.server_id }),
                    )
                    .await;
                finished
            }
            Err(e) => {
                error!(%task_id, %kind, class = ?e.class(), error = %e, "task failed");
                if let Err(mark) = self.mark_server_error(&task, &e).await {
                    warn!(%task_id, error = %mark, "could not flip server to ERROR");
                }
                let finished = self
                    .store
                    .finish_task(task_id, Err(e.to_string()), epoch_secs())?;
                self.notifications
                    .send(
                        owner.as_deref(),
                        NotificationEvent::TaskFailed,
                        json!({
                            "task_id": task_id,
                            "kind": kind,
                            "server_id": task.server_id,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                finished
            }
        };
        Ok(finished)
    }

    async fn dispatch(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        match &task.command {
            TaskCommand::Provision { preferred_port } => self.provision(task, *preferred_port).await,
            TaskCommand::Start => self.start(task).await,
            TaskCommand::Stop => self.stop(task).await,
            TaskCommand::Restart => self.restart(task).await,
            TaskCommand::Update => self.update(task).await,
            TaskCommand::Backup { name } => self.backup(task, name.as_deref()).await,
            TaskCommand::Delete => self.delete(task).await,
            TaskCommand::Migrate {
                target_machine_id,
                target_agent_id,
            } => self.migrate(task, target_machine_id, target_agent_id).await,
            TaskCommand::InstallAgent => self.install_agent(task).await,
        }
    }

    /// Flip the task's server to ERROR when a failure could leave it stuck.
    ///
    /// Rejections never touched the server, so they leave it alone.
    async fn mark_server_error(&self, task: &Task, e: &SchedulerError) -> SchedulerResult<()> {
        if e.class() == ErrorClass::StateConflict {
            return Ok(());
        }
        let Some(server_id) = &task.server_id else {
            return Ok(());
        };
        let Some(server) = self.store.get_server(server_id)? else {
            return Ok(());
        };
        let lifecycle = matches!(task.kind(), TaskKind::Start | TaskKind::Stop | TaskKind::Restart);
        if lifecycle || server.status.is_transient() {
            self.set_status(server_id, ServerStatus::Error).await?;
        }
        Ok(())
    }

    // ── Shared helpers ─────────────────────────────────────────────

    fn load_server(&self, server_id: &str) -> SchedulerResult<Server> {
        self.store
            .get_server(server_id)?
            .ok_or_else(|| SchedulerError::ServerNotFound(server_id.to_string()))
    }

    fn task_server(&self, task: &Task) -> SchedulerResult<Server> {
        let server_id = task
            .server_id
            .as_deref()
            .ok_or_else(|| SchedulerError::MissingServer(task.id.clone()))?;
        self.load_server(server_id)
    }

    fn load_machine(&self, machine_id: &str) -> SchedulerResult<Machine> {
        self.store
            .get_machine(machine_id)?
            .ok_or_else(|| SchedulerError::MachineNotFound(machine_id.to_string()))
    }

    fn load_agent(&self, agent_id: &str) -> SchedulerResult<Agent> {
        self.store
            .get_agent(agent_id)?
            .ok_or_else(|| SchedulerError::AgentNotFound(agent_id.to_string()))
    }

    /// The machine a provisioned server lives on, plus its ports.
    fn placement(&self, server: &Server) -> SchedulerResult<(Machine, PortSet)> {
        match (&server.machine_id, server.ports) {
            (Some(machine_id), Some(ports)) => Ok((self.load_machine(machine_id)?, ports)),
            _ => Err(SchedulerError::Unassigned(server.id.clone())),
        }
    }

    fn reject_if(&self, server: &Server, action: TaskKind, statuses: &[ServerStatus]) -> SchedulerResult<()> {
        if statuses.contains(&server.status) {
            return Err(SchedulerError::StatusConflict {
                server_id: server.id.clone(),
                status: server.status,
                action,
            });
        }
        Ok(())
    }

    /// Persist a status change and tell the owner about it.
    async fn set_status(&self, server_id: &str, status: ServerStatus) -> SchedulerResult<Server> {
        let mut previous = status;
        let server = self.store.update_server(server_id, |mut s| {
            previous = s.status;
            s.status = status;
            s.updated_at = epoch_secs();
            Ok(s)
        })?;
        if previous != status {
            info!(%server_id, from = %previous, to = %status, "server status changed");
            self.notifications
                .send(
                    server.owner_id.as_deref(),
                    NotificationEvent::ServerStatusChanged,
                    json!({ "server_id": server_id, "from": previous, "to": status }),
                )
                .await;
        }
        Ok(server)
    }

    fn params<'a>(&self, server: &'a Server, dir: &'a str, ports: PortSet) -> TemplateParams<'a> {
        TemplateParams {
            server_id: &server.id,
            name: &server.name,
            dir,
            ports,
            max_players: server.max_players,
            ram_mb: server.ram_mb,
        }
    }

    /// Render and write the systemd unit for `server` on `machine`.
    async fn install_unit(&self, machine: &Machine, server: &Server, ports: PortSet) -> SchedulerResult<()> {
        let dir = commands::server_dir(&self.config.servers_root, &server.id);
        let template = self.workloads.template(server.kind);
        let params = self.params(server, &dir, ports);
        let start = render(&template.start, &params);
        let stop = template.stop.as_deref().map(|s| render(s, &params));
        self.host
            .run_checked(
                &machine.ssh,
                "unit",
                &commands::write_unit(&server.id, &dir, &start, stop.as_deref()),
                self.config.command_timeout,
            )
            .await?;
        Ok(())
    }

    /// Issue start and confirm via liveness.
    async fn start_on(&self, machine: &Machine, server_id: &str, port: u16) -> SchedulerResult<()> {
        let out = self
            .host
            .run(&machine.ssh, "start", &commands::start_unit(server_id), self.config.command_timeout)
            .await?;
        if !out.success() {
            warn!(%server_id, detail = %out.summary(), "start command reported failure, checking liveness");
        }
        if !self.host.await_liveness(&machine.ssh, server_id, Some(port), true).await? {
            return Err(SchedulerError::RemoteCommand {
                step: "start".to_string(),
                detail: format!("server not running after start ({})", out.summary()),
            });
        }
        Ok(())
    }

    /// Issue stop and confirm via liveness. "Already stopped" exits are fine.
    async fn stop_on(&self, machine: &Machine, server_id: &str, port: u16) -> SchedulerResult<()> {
        let out = self
            .host
            .run(&machine.ssh, "stop", &commands::stop_unit(server_id), self.config.command_timeout)
            .await?;
        if !out.success() {
            warn!(%server_id, detail = %out.summary(), "stop command reported failure, checking liveness");
        }
        if !self.host.await_liveness(&machine.ssh, server_id, Some(port), false).await? {
            return Err(SchedulerError::RemoteCommand {
                step: "stop".to_string(),
                detail: format!("server still running after stop ({})", out.summary()),
            });
        }
        Ok(())
    }

    /// Release a provisioning guard according to how the locked work ended.
    fn release<T>(guard: ProvisioningGuard, result: &SchedulerResult<T>) {
        match result {
            Err(e) if e.class() == ErrorClass::Transport => guard.release_with_error(&e.to_string()),
            _ => guard.release(),
        }
    }

    // ── PROVISION ──────────────────────────────────────────────────

    async fn provision(&self, task: &Task, preferred_port: Option<u16>) -> SchedulerResult<serde_json::Value> {
        let server_id = self.task_server(task)?.id;
        let guard = self.locks.acquire(&task.agent_id, &server_id).await?;
        let result = self.provision_locked(task, &server_id, preferred_port).await;
        Self::release(guard, &result);
        result
    }

    /// Runs with the agent lock held. The server is read only now, since
    /// another task may have changed it while this one waited.
    async fn provision_locked(
        &self,
        task: &Task,
        server_id: &str,
        preferred_port: Option<u16>,
    ) -> SchedulerResult<serde_json::Value> {
        let server = self.load_server(server_id)?;
        self.reject_if(
            &server,
            TaskKind::Provision,
            &[ServerStatus::Starting, ServerStatus::Online, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;

        let server = match (&server.machine_id, &server.agent_id) {
            (Some(_), Some(_)) => server,
            _ => {
                let agent = self.load_agent(&task.agent_id)?;
                self.selector
                    .check_fits(&agent.machine_id, server.kind, server.max_players)?;
                info!(server_id = %server.id, machine_id = %agent.machine_id, agent_id = %agent.id, "server assigned");
                self.store.update_server(&server.id, |mut s| {
                    s.machine_id = Some(agent.machine_id.clone());
                    s.agent_id = Some(agent.id.clone());
                    s.updated_at = epoch_secs();
                    Ok(s)
                })?
            }
        };
        let machine_id = server
            .machine_id
            .clone()
            .ok_or_else(|| SchedulerError::Unassigned(server.id.clone()))?;
        let machine = self.load_machine(&machine_id)?;

        let (server, ports) = match server.ports {
            Some(ports) => (server, ports),
            None => {
                let ports = self
                    .ports
                    .allocate(&machine, server.kind, &server.id, preferred_port)
                    .await?;
                let server = self.store.update_server(&server.id, |mut s| {
                    s.ports = Some(ports);
                    s.updated_at = epoch_secs();
                    Ok(s)
                })?;
                (server, ports)
            }
        };

        let dir = commands::server_dir(&self.config.servers_root, &server.id);
        let template = self.workloads.template(server.kind);
        let params = self.params(&server, &dir, ports);
        self.host
            .run_checked(&machine.ssh, "prepare", &commands::prepare_dir(&dir), self.config.command_timeout)
            .await?;
        self.host
            .run_checked(
                &machine.ssh,
                "install",
                &commands::in_dir(&dir, &render(&template.install, &params)),
                self.config.install_timeout,
            )
            .await?;
        self.install_unit(&machine, &server, ports).await?;

        self.set_status(&server.id, ServerStatus::Offline).await?;
        info!(server_id = %server.id, %machine_id, port = ports.port, "server provisioned");
        Ok(json!({
            "server_id": server.id,
            "machine_id": machine_id,
            "ports": ports,
            "dir": dir,
        }))
    }

    // ── START / STOP / RESTART ─────────────────────────────────────

    async fn start(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Start,
            &[ServerStatus::Online, ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        let (machine, ports) = self.placement(&server)?;

        self.set_status(&server.id, ServerStatus::Starting).await?;
        self.start_on(&machine, &server.id, ports.port).await?;
        self.set_status(&server.id, ServerStatus::Online).await?;
        Ok(json!({ "server_id": server.id, "status": ServerStatus::Online }))
    }

    async fn stop(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Stop,
            &[ServerStatus::Offline, ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        let (machine, ports) = self.placement(&server)?;

        self.set_status(&server.id, ServerStatus::Stopping).await?;
        self.stop_on(&machine, &server.id, ports.port).await?;
        self.set_status(&server.id, ServerStatus::Offline).await?;
        Ok(json!({ "server_id": server.id, "status": ServerStatus::Offline }))
    }

    async fn restart(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Restart,
            &[ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        let (machine, ports) = self.placement(&server)?;

        self.set_status(&server.id, ServerStatus::Restarting).await?;
        self.stop_on(&machine, &server.id, ports.port).await?;
        tokio::time::sleep(self.config.restart_delay).await;
        self.start_on(&machine, &server.id, ports.port).await?;
        self.set_status(&server.id, ServerStatus::Online).await?;
        Ok(json!({ "server_id": server.id, "status": ServerStatus::Online }))
    }

    // ── UPDATE ─────────────────────────────────────────────────────

    async fn update(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Update,
            &[ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        self.placement(&server)?;

        let guard = self.locks.acquire(&task.agent_id, &server.id).await?;
        let result = self.update_locked(&server.id).await;
        Self::release(guard, &result);
        result
    }

    /// Runs with the agent lock held, against a fresh read of the server.
    async fn update_locked(&self, server_id: &str) -> SchedulerResult<serde_json::Value> {
        let server = self.load_server(server_id)?;
        self.reject_if(
            &server,
            TaskKind::Update,
            &[ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        let (machine, ports) = self.placement(&server)?;
        let was_running = self.host.liveness(&machine.ssh, &server.id, Some(ports.port)).await?;
        if was_running {
            self.set_status(&server.id, ServerStatus::Stopping).await?;
            self.stop_on(&machine, &server.id, ports.port).await?;
            self.set_status(&server.id, ServerStatus::Offline).await?;
        }

        let dir = commands::server_dir(&self.config.servers_root, &server.id);
        let template = self.workloads.template(server.kind);
        let params = self.params(&server, &dir, ports);
        self.host
            .run_checked(
                &machine.ssh,
                "update",
                &commands::in_dir(&dir, &render(template.update_command(), &params)),
                self.config.install_timeout,
            )
            .await?;
        self.install_unit(&machine, &server, ports).await?;

        if was_running {
            self.set_status(&server.id, ServerStatus::Starting).await?;
            self.start_on(&machine, &server.id, ports.port).await?;
            self.set_status(&server.id, ServerStatus::Online).await?;
        }
        info!(server_id = %server.id, restarted = was_running, "server updated");
        Ok(json!({ "server_id": server.id, "restarted": was_running }))
    }

    // ── BACKUP ─────────────────────────────────────────────────────

    async fn backup(&self, task: &Task, name: Option<&str>) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Backup,
            &[ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        let machine_id = server
            .machine_id
            .as_deref()
            .ok_or_else(|| SchedulerError::Unassigned(server.id.clone()))?;
        let machine = self.load_machine(machine_id)?;

        let now = epoch_secs();
        let dir = commands::server_dir(&self.config.servers_root, &server.id);
        let backups = commands::backup_dir(&self.config.backups_root, &server.id);
        let archive = format!("{backups}/{}.tar.gz", archive_stem(name, now));

        let out = self
            .host
            .run_checked(
                &machine.ssh,
                "backup",
                &commands::backup(&dir, &backups, &archive),
                self.config.install_timeout,
            )
            .await?;
        let size_bytes = out
            .stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<u64>().ok());

        let record = BackupRecord {
            path: archive.clone(),
            size_bytes,
            created_at: now,
        };
        self.store.update_server(&server.id, |mut s| {
            s.last_backup = Some(record.clone());
            s.updated_at = epoch_secs();
            Ok(s)
        })?;
        info!(server_id = %server.id, path = %archive, size_bytes = ?size_bytes, "backup created");
        Ok(json!({ "server_id": server.id, "path": archive, "size_bytes": size_bytes }))
    }

    // ── DELETE ─────────────────────────────────────────────────────

    async fn delete(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Delete,
            &[ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;

        if let Some(machine_id) = &server.machine_id {
            let machine = self.load_machine(machine_id)?;
            let dir = commands::server_dir(&self.config.servers_root, &server.id);
            self.host
                .run_checked(&machine.ssh, "remove", &commands::remove(&server.id, &dir), self.config.command_timeout)
                .await?;
        }

        let ports_released = self.ports.release(&server.id)?;
        let mut cron_jobs_removed = 0u32;
        for job in self.store.list_cron_jobs()? {
            if job.server_id == server.id && self.store.delete_cron_job(&job.id)? {
                cron_jobs_removed += 1;
            }
        }
        self.store.delete_server(&server.id)?;
        info!(server_id = %server.id, ports_released, cron_jobs_removed, "server deleted");
        Ok(json!({
            "server_id": server.id,
            "ports_released": ports_released,
            "cron_jobs_removed": cron_jobs_removed,
        }))
    }

    // ── MIGRATE ────────────────────────────────────────────────────

    async fn migrate(
        &self,
        task: &Task,
        target_machine_id: &str,
        target_agent_id: &str,
    ) -> SchedulerResult<serde_json::Value> {
        let server = self.task_server(task)?;
        self.reject_if(
            &server,
            TaskKind::Migrate,
            &[ServerStatus::Starting, ServerStatus::Stopping, ServerStatus::Restarting],
        )?;
        let (source, old_ports) = self.placement(&server)?;
        let target = self.check_migration_target(&server, &source, target_machine_id, target_agent_id)?;

        let was_running = self.host.liveness(&source.ssh, &server.id, Some(old_ports.port)).await?;
        if was_running {
            self.set_status(&server.id, ServerStatus::Stopping).await?;
            self.stop_on(&source, &server.id, old_ports.port).await?;
            self.set_status(&server.id, ServerStatus::Offline).await?;
        }

        let expected = self.load_server(&server.id)?;
        let guard = self.locks.acquire(target_agent_id, &server.id).await?;
        let result = match self.unchanged_while_waiting(&expected, TaskKind::Migrate) {
            Ok(()) => {
                self.migrate_locked(&server, &source, &target, target_agent_id, old_ports)
                    .await
            }
            Err(e) => Err(e),
        };
        Self::release(guard, &result);
        let new_ports = result?;

        if was_running {
            self.set_status(&server.id, ServerStatus::Starting).await?;
            self.start_on(&target, &server.id, new_ports.port).await?;
            self.set_status(&server.id, ServerStatus::Online).await?;
        }
        info!(
            server_id = %server.id,
            from = %source.id,
            to = %target.id,
            port = new_ports.port,
            "server migrated"
        );
        Ok(json!({
            "server_id": server.id,
            "source_machine_id": source.id,
            "target_machine_id": target.id,
            "target_agent_id": target_agent_id,
            "ports": new_ports,
            "restarted": was_running,
        }))
    }

    /// Re-read `expected` after a lock wait and reject if another task moved
    /// it or changed its status in the meantime.
    fn unchanged_while_waiting(&self, expected: &Server, action: TaskKind) -> SchedulerResult<()> {
        let current = self.load_server(&expected.id)?;
        if current.machine_id != expected.machine_id || current.ports != expected.ports {
            return Err(SchedulerError::InvalidMigration(format!(
                "server {} was re-placed while waiting for the lock",
                expected.id
            )));
        }
        if current.status != expected.status {
            return Err(SchedulerError::StatusConflict {
                server_id: current.id,
                status: current.status,
                action,
            });
        }
        Ok(())
    }

    fn check_migration_target(
        &self,
        server: &Server,
        source: &Machine,
        target_machine_id: &str,
        target_agent_id: &str,
    ) -> SchedulerResult<Machine> {
        if source.id == target_machine_id {
            return Err(SchedulerError::InvalidMigration(format!(
                "server {} is already on machine {target_machine_id}",
                server.id
            )));
        }
        let target = self.load_machine(target_machine_id)?;
        if target.status != MachineStatus::Online {
            return Err(SchedulerError::InvalidMigration(format!(
                "target machine {target_machine_id} is offline"
            )));
        }
        let agent = self.load_agent(target_agent_id)?;
        if agent.machine_id != target.id {
            return Err(SchedulerError::InvalidMigration(format!(
                "agent {target_agent_id} runs on {}, not {target_machine_id}",
                agent.machine_id
            )));
        }
        if agent.status != AgentStatus::Online {
            return Err(SchedulerError::InvalidMigration(format!(
                "target agent {target_agent_id} is not online"
            )));
        }
        self.selector
            .check_fits(&target.id, server.kind, server.max_players)?;
        Ok(target)
    }

    /// Copy files to `target` and re-point the server. On failure before the
    /// re-point, the target reservation is dropped again.
    async fn migrate_locked(
        &self,
        server: &Server,
        source: &Machine,
        target: &Machine,
        target_agent_id: &str,
        old_ports: PortSet,
    ) -> SchedulerResult<PortSet> {
        let new_ports = self
            .ports
            .allocate(target, server.kind, &server.id, Some(old_ports.port))
            .await?;

        if let Err(e) = self.copy_to_target(server, source, target, new_ports).await {
            if let Err(release) = self.ports.release_on(&target.id, &server.id) {
                warn!(server_id = %server.id, error = %release, "could not drop target port reservation");
            }
            return Err(e);
        }

        self.store.update_server(&server.id, |mut s| {
            s.machine_id = Some(target.id.clone());
            s.agent_id = Some(target_agent_id.to_string());
            s.ports = Some(new_ports);
            s.status = ServerStatus::Offline;
            s.updated_at = epoch_secs();
            Ok(s)
        })?;
        self.ports.release_on(&source.id, &server.id)?;

        let dir = commands::server_dir(&self.config.servers_root, &server.id);
        match self
            .host
            .run(&source.ssh, "cleanup", &commands::remove(&server.id, &dir), self.config.command_timeout)
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(server_id = %server.id, machine_id = %source.id, detail = %out.summary(), "source cleanup failed"),
            Err(e) => warn!(server_id = %server.id, machine_id = %source.id, error = %e, "source cleanup failed"),
        }
        Ok(new_ports)
    }

    async fn copy_to_target(
        &self,
        server: &Server,
        source: &Machine,
        target: &Machine,
        new_ports: PortSet,
    ) -> SchedulerResult<()> {
        let dir = commands::server_dir(&self.config.servers_root, &server.id);
        self.host
            .run_checked(
                &source.ssh,
                "transfer",
                &commands::transfer(&dir, &target.ssh, &dir),
                self.config.transfer_timeout,
            )
            .await?;

        let backups = commands::backup_dir(&self.config.backups_root, &server.id);
        let out = self
            .host
            .run(
                &source.ssh,
                "transfer backups",
                &commands::transfer_if_exists(&backups, &target.ssh, &backups),
                self.config.transfer_timeout,
            )
            .await?;
        if !out.success() {
            warn!(server_id = %server.id, detail = %out.summary(), "backup copy failed, continuing");
        }

        self.install_unit(target, server, new_ports).await
    }

    // ── INSTALL_AGENT ──────────────────────────────────────────────

    async fn install_agent(&self, task: &Task) -> SchedulerResult<serde_json::Value> {
        let agent = self.load_agent(&task.agent_id)?;
        let machine = self.load_machine(&agent.machine_id)?;
        let script = self
            .config
            .agent_install_script
            .replace("{agent_id}", &agent.id)
            .replace("{machine_id}", &machine.id);

        let holder = format!("install-agent:{}", agent.id);
        let guard = self.locks.acquire(&agent.id, &holder).await?;
        let result = self
            .host
            .run_checked(&machine.ssh, "install agent", &script, self.config.install_timeout)
            .await;
        Self::release(guard, &result);
        result?;

        info!(agent_id = %agent.id, machine_id = %machine.id, "agent installed");
        Ok(json!({ "agent_id": agent.id, "machine_id": machine.id }))
    }
}

/// File stem for a backup archive: the sanitised name, or a timestamp.
fn archive_stem(name: Option<&str>, now: u64) -> String {
    let cleaned: String = name
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        format!("backup-{now}")
    } else {
        cleaned.to_string()
    }
}
