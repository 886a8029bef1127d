//! Domain types for the fleetgrid state store.
//!
//! These types represent the persisted state of machines, agents, game
//! servers, port allocations, tasks, and cron jobs. All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a machine in the fleet.
pub type MachineId = String;

/// Unique identifier for an agent process.
pub type AgentId = String;

/// Unique identifier for a game server.
pub type ServerId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for a cron job.
pub type CronJobId = String;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Machine ───────────────────────────────────────────────────────

/// A physical or virtual host reachable over SSH.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub id: MachineId,
    pub name: String,
    /// Public address game clients connect to.
    pub address: String,
    pub ssh: SshTarget,
    /// Declared capacity. Zero fields mean "never declared".
    pub capacity: ResourceCapacity,
    /// Last usage snapshot reported by the agent, if any.
    pub usage: Option<ResourceUsage>,
    pub status: MachineStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// SSH connection parameters for a machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Path to the private key on the control host.
    pub key_path: Option<String>,
}

impl SshTarget {
    /// `user@host` form used on the ssh command line.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Declared resource capacity of a machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ResourceCapacity {
    pub cpu_cores: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

/// Point-in-time usage measured on a machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    /// CPU utilisation, 0–100.
    pub cpu_percent: f64,
    pub ram_used_bytes: u64,
    pub disk_used_bytes: u64,
    /// Unix timestamp of the measurement.
    pub measured_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineStatus {
    Online,
    Offline,
}

// ── Agent ─────────────────────────────────────────────────────────

/// A supervising process bound to exactly one machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    pub machine_id: MachineId,
    pub status: AgentStatus,
    pub version: Option<String>,
    /// Unix timestamp of the last heartbeat (0 if never seen).
    pub last_heartbeat: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    Offline,
    Error,
}

// ── Server ────────────────────────────────────────────────────────

/// Enumerated game/engine kinds the fleet knows how to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadKind {
    Minecraft,
    ArkEvolved,
    ArkAscended,
    Rust,
    Valheim,
    SevenDaysToDie,
    Satisfactory,
    TheForest,
    Cs2,
    Other,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minecraft => "MINECRAFT",
            Self::ArkEvolved => "ARK_EVOLVED",
            Self::ArkAscended => "ARK_ASCENDED",
            Self::Rust => "RUST",
            Self::Valheim => "VALHEIM",
            Self::SevenDaysToDie => "SEVEN_DAYS_TO_DIE",
            Self::Satisfactory => "SATISFACTORY",
            Self::TheForest => "THE_FOREST",
            Self::Cs2 => "CS2",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Offline,
    Starting,
    Online,
    Stopping,
    Restarting,
    Error,
}

impl ServerStatus {
    /// Statuses that only exist while a task is driving the server.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping | Self::Restarting)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offline => "OFFLINE",
            Self::Starting => "STARTING",
            Self::Online => "ONLINE",
            Self::Stopping => "STOPPING",
            Self::Restarting => "RESTARTING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A provisioned game-server instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    /// User notified about this server's tasks and status changes.
    pub owner_id: Option<String>,
    pub kind: WorkloadKind,
    /// Declared max occupancy (player slots).
    pub max_players: u32,
    /// RAM hint in megabytes passed to start templates.
    pub ram_mb: Option<u32>,
    pub machine_id: Option<MachineId>,
    pub agent_id: Option<AgentId>,
    pub ports: Option<PortSet>,
    pub status: ServerStatus,
    /// Free-form configuration blob.
    #[serde(default)]
    pub config: serde_json::Value,
    pub last_backup: Option<BackupRecord>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Archive produced by a BACKUP task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub path: String,
    pub size_bytes: Option<u64>,
    pub created_at: u64,
}

// ── Ports ─────────────────────────────────────────────────────────

/// Primary port plus the workload-dependent secondary ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PortSet {
    pub port: u16,
    pub query_port: Option<u16>,
    pub rcon_port: Option<u16>,
    pub beacon_port: Option<u16>,
    pub telnet_port: Option<u16>,
    pub web_map_port: Option<u16>,
    pub steam_peer_port: Option<u16>,
    pub rust_plus_port: Option<u16>,
}

impl PortSet {
    /// Every port value in the set, primary first.
    pub fn values(&self) -> Vec<u16> {
        let mut out = vec![self.port];
        out.extend(
            [
                self.query_port,
                self.rcon_port,
                self.beacon_port,
                self.telnet_port,
                self.web_map_port,
                self.steam_peer_port,
                self.rust_plus_port,
            ]
            .into_iter()
            .flatten(),
        );
        out
    }

    pub fn contains(&self, port: u16) -> bool {
        self.values().contains(&port)
    }

    /// True if any port value appears in both sets.
    pub fn overlaps(&self, other: &PortSet) -> bool {
        other.values().iter().any(|p| self.contains(*p))
    }
}

/// Durable binding of a port set on a machine to a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortAllocation {
    pub machine_id: MachineId,
    pub server_id: ServerId,
    pub kind: WorkloadKind,
    pub ports: PortSet,
    pub created_at: u64,
}

// ── Task ──────────────────────────────────────────────────────────

/// Task type, used for dispatch bookkeeping and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Provision,
    Start,
    Stop,
    Restart,
    Update,
    Backup,
    Delete,
    Migrate,
    InstallAgent,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provision => "PROVISION",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Restart => "RESTART",
            Self::Update => "UPDATE",
            Self::Backup => "BACKUP",
            Self::Delete => "DELETE",
            Self::Migrate => "MIGRATE",
            Self::InstallAgent => "INSTALL_AGENT",
        };
        f.write_str(s)
    }
}

/// Type-specific task parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCommand {
    Provision {
        #[serde(default)]
        preferred_port: Option<u16>,
    },
    Start,
    Stop,
    Restart,
    Update,
    Backup {
        #[serde(default)]
        name: Option<String>,
    },
    Delete,
    Migrate {
        target_machine_id: MachineId,
        target_agent_id: AgentId,
    },
    InstallAgent,
}

impl TaskCommand {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Provision { .. } => TaskKind::Provision,
            Self::Start => TaskKind::Start,
            Self::Stop => TaskKind::Stop,
            Self::Restart => TaskKind::Restart,
            Self::Update => TaskKind::Update,
            Self::Backup { .. } => TaskKind::Backup,
            Self::Delete => TaskKind::Delete,
            Self::Migrate { .. } => TaskKind::Migrate,
            Self::InstallAgent => TaskKind::InstallAgent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One unit of orchestration work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub agent_id: AgentId,
    pub server_id: Option<ServerId>,
    pub command: TaskCommand,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.command.kind()
    }
}

// ── Cron ──────────────────────────────────────────────────────────

/// Action a cron job triggers on its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronAction {
    Start,
    Stop,
    Restart,
    Update,
    Backup,
}

impl CronAction {
    /// The task command a firing of this action submits.
    pub fn task_command(&self) -> TaskCommand {
        match self {
            Self::Start => TaskCommand::Start,
            Self::Stop => TaskCommand::Stop,
            Self::Restart => TaskCommand::Restart,
            Self::Update => TaskCommand::Update,
            Self::Backup => TaskCommand::Backup { name: None },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronRunResult {
    Success,
    Failed,
}

/// A recurring task template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub id: CronJobId,
    pub server_id: ServerId,
    pub name: String,
    /// Standard 5-field cron expression.
    pub expression: String,
    pub action: CronAction,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub notify_always: bool,
    pub enabled: bool,
    pub active: bool,
    pub next_run: Option<u64>,
    pub last_run: Option<u64>,
    pub last_result: Option<CronRunResult>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: u64,
}

impl CronJob {
    /// Whether the job should fire at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        self.enabled && self.active && self.next_run.is_none_or(|at| at <= now)
    }
}

impl PortAllocation {
    /// Build the composite key for the port allocations table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.machine_id, self.server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_set_values_skip_absent_secondaries() {
        let set = PortSet {
            port: 28015,
            query_port: Some(28016),
            rust_plus_port: Some(28018),
            ..Default::default()
        };
        assert_eq!(set.values(), vec![28015, 28016, 28018]);
        assert!(set.contains(28018));
        assert!(!set.contains(28017));
    }

    #[test]
    fn port_sets_overlap_on_secondary() {
        let a = PortSet {
            port: 27015,
            query_port: Some(27016),
            ..Default::default()
        };
        let b = PortSet {
            port: 27016,
            ..Default::default()
        };
        let c = PortSet {
            port: 27017,
            ..Default::default()
        };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn task_command_serializes_tagged() {
        let cmd = TaskCommand::Migrate {
            target_machine_id: "m-2".to_string(),
            target_agent_id: "a-2".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "MIGRATE");
        assert_eq!(cmd.kind(), TaskKind::Migrate);

        let parsed: TaskCommand = serde_json::from_str(r#"{"type":"PROVISION"}"#).unwrap();
        assert_eq!(parsed, TaskCommand::Provision { preferred_port: None });
    }

    #[test]
    fn cron_job_due_rules() {
        let mut job = CronJob {
            id: "c-1".to_string(),
            server_id: "s-1".to_string(),
            name: "nightly restart".to_string(),
            expression: "0 4 * * *".to_string(),
            action: CronAction::Restart,
            timezone: "UTC".to_string(),
            notify_on_success: false,
            notify_on_failure: true,
            notify_always: false,
            enabled: true,
            active: true,
            next_run: None,
            last_run: None,
            last_result: None,
            last_error: None,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            created_at: 0,
        };
        assert!(job.is_due(100));
        job.next_run = Some(200);
        assert!(!job.is_due(100));
        assert!(job.is_due(200));
        job.enabled = false;
        assert!(!job.is_due(300));
    }

    #[test]
    fn transient_statuses() {
        assert!(ServerStatus::Starting.is_transient());
        assert!(ServerStatus::Restarting.is_transient());
        assert!(!ServerStatus::Online.is_transient());
        assert!(!ServerStatus::Error.is_transient());
    }
}
