//! Machine and agent registry with heartbeat-based liveness.
//!
//! Agents report in periodically. A heartbeat marks the agent ONLINE and,
//! when it carries a usage snapshot, refreshes the machine's usage and marks
//! the machine ONLINE. The sweep marks silent agents OFFLINE and takes a
//! machine OFFLINE once it has no live agent left.

use std::time::Duration;

use fleetgrid_state::{
    Agent, AgentStatus, Machine, MachineStatus, ResourceCapacity, ResourceUsage, SshTarget,
    StateStore, epoch_secs,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

/// Agents silent for longer than this are marked OFFLINE.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct AgentMembership {
    store: StateStore,
    heartbeat_timeout: Duration,
}

impl AgentMembership {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Add a machine. It stays OFFLINE until one of its agents reports in.
    pub fn register_machine(
        &self,
        name: &str,
        address: &str,
        ssh: SshTarget,
        capacity: ResourceCapacity,
    ) -> SchedulerResult<Machine> {
        let now = epoch_secs();
        let machine = Machine {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            address: address.to_string(),
            ssh,
            capacity,
            usage: None,
            status: MachineStatus::Offline,
            created_at: now,
            updated_at: now,
        };
        self.store.put_machine(&machine)?;
        info!(machine_id = %machine.id, %name, %address, "machine registered");
        Ok(machine)
    }

    /// Add an agent bound to an existing machine.
    pub fn register_agent(&self, machine_id: &str, version: Option<String>) -> SchedulerResult<Agent> {
        if self.store.get_machine(machine_id)?.is_none() {
            return Err(SchedulerError::MachineNotFound(machine_id.to_string()));
        }
        let agent = Agent {
            id: uuid::Uuid::new_v4().to_string(),
            machine_id: machine_id.to_string(),
            status: AgentStatus::Offline,
            version,
            last_heartbeat: 0,
            created_at: epoch_secs(),
        };
        self.store.put_agent(&agent)?;
        info!(agent_id = %agent.id, %machine_id, "agent registered");
        Ok(agent)
    }

    /// Record a heartbeat. Returns `false` for an unknown agent.
    pub fn heartbeat(
        &self,
        agent_id: &str,
        version: Option<String>,
        usage: Option<ResourceUsage>,
    ) -> SchedulerResult<bool> {
        let Some(mut agent) = self.store.get_agent(agent_id)? else {
            warn!(%agent_id, "heartbeat from unknown agent");
            return Ok(false);
        };
        let now = epoch_secs();
        if agent.status != AgentStatus::Online {
            info!(%agent_id, machine_id = %agent.machine_id, "agent online");
        }
        agent.status = AgentStatus::Online;
        agent.last_heartbeat = now;
        if version.is_some() {
            agent.version = version;
        }
        self.store.put_agent(&agent)?;

        if let Some(usage) = usage {
            self.record_usage(&agent.machine_id, usage, now)?;
        }
        debug!(%agent_id, "heartbeat received");
        Ok(true)
    }

    fn record_usage(&self, machine_id: &str, usage: ResourceUsage, now: u64) -> SchedulerResult<()> {
        let Some(mut machine) = self.store.get_machine(machine_id)? else {
            warn!(%machine_id, "usage reported for unknown machine");
            return Ok(());
        };
        if machine.status != MachineStatus::Online {
            info!(%machine_id, "machine online");
        }
        machine.usage = Some(usage);
        machine.status = MachineStatus::Online;
        machine.updated_at = now;
        self.store.put_machine(&machine)?;
        Ok(())
    }

    /// Mark agents silent past the timeout OFFLINE. Returns their ids.
    pub fn sweep(&self, now: u64) -> SchedulerResult<Vec<String>> {
        let timeout = self.heartbeat_timeout.as_secs();
        let mut expired = Vec::new();
        for mut agent in self.store.list_agents()? {
            if agent.status != AgentStatus::Online || now.saturating_sub(agent.last_heartbeat) <= timeout {
                continue;
            }
            agent.status = AgentStatus::Offline;
            self.store.put_agent(&agent)?;
            warn!(agent_id = %agent.id, machine_id = %agent.machine_id, last_heartbeat = agent.last_heartbeat, "agent marked offline");
            expired.push(agent);
        }

        for agent in &expired {
            let live = self
                .store
                .list_agents_for_machine(&agent.machine_id)?
                .iter()
                .any(|a| a.status == AgentStatus::Online);
            if live {
                continue;
            }
            if let Some(mut machine) = self.store.get_machine(&agent.machine_id)?
                && machine.status == MachineStatus::Online
            {
                machine.status = MachineStatus::Offline;
                machine.updated_at = now;
                self.store.put_machine(&machine)?;
                warn!(machine_id = %machine.id, "machine marked offline, no live agents");
            }
        }
        Ok(expired.into_iter().map(|a| a.id).collect())
    }

    /// Sweep periodically until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = self.heartbeat_timeout.as_secs(),
            "agent membership sweep started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep(epoch_secs()) {
                        Ok(expired) if !expired.is_empty() => {
                            info!(count = expired.len(), "agents expired");
                        }
                        Err(e) => warn!(error = %e, "agent sweep failed"),
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    info!("agent membership sweep shutting down");
                    break;
                }
            }
        }
    }
}
