//! The port allocator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleetgrid_remote::RemoteExecutor;
use fleetgrid_state::{
    Machine, PortAllocation, PortSet, StateError, StateStore, WorkloadKind, epoch_secs,
};
use tracing::{debug, info, warn};

use crate::error::{PortError, PortResult};
use crate::probe::probe_used_ports;
use crate::profile::PortProfile;

/// Tunables for [`PortAllocator`].
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Candidates tried (including a preferred port) before giving up.
    pub max_attempts: u32,
    /// Timeout for the live probe command.
    pub probe_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

/// Hands out non-overlapping port sets per machine.
///
/// The recorded-ports check, live probe and persist step run under a
/// per-machine async mutex; the store's overlap-checked insert backs it up.
pub struct PortAllocator {
    store: StateStore,
    executor: Arc<dyn RemoteExecutor>,
    config: AllocatorConfig,
    machine_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PortAllocator {
    pub fn new(store: StateStore, executor: Arc<dyn RemoteExecutor>, config: AllocatorConfig) -> Self {
        Self {
            store,
            executor,
            config,
            machine_locks: Mutex::new(HashMap::new()),
        }
    }

    fn machine_lock(&self, machine_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .machine_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(machine_id.to_string()).or_default().clone()
    }

    /// Reserve ports for `server_id` on `machine`.
    ///
    /// Returns the existing reservation unchanged if the server already
    /// holds one on this machine.
    pub async fn allocate(
        &self,
        machine: &Machine,
        kind: WorkloadKind,
        server_id: &str,
        preferred_port: Option<u16>,
    ) -> PortResult<PortSet> {
        let lock = self.machine_lock(&machine.id);
        let _held = lock.lock().await;

        if let Some(existing) = self.store.get_port_allocation(&machine.id, server_id)? {
            debug!(machine_id = %machine.id, %server_id, port = existing.ports.port, "reusing port allocation");
            return Ok(existing.ports);
        }

        let profile = PortProfile::for_kind(kind);
        let mut taken = self.recorded_ports(&machine.id, server_id)?;
        taken.extend(probe_used_ports(self.executor.as_ref(), machine, self.config.probe_timeout).await?);

        let candidates = preferred_port
            .into_iter()
            .chain(profile.min_port..=profile.max_port)
            .take(self.config.max_attempts as usize);

        let mut attempts = 0u32;
        for candidate in candidates {
            attempts += 1;
            let Some(ports) = profile.derive(candidate) else {
                continue;
            };
            if ports.values().iter().any(|p| taken.contains(p)) {
                continue;
            }

            let alloc = PortAllocation {
                machine_id: machine.id.clone(),
                server_id: server_id.to_string(),
                kind,
                ports,
                created_at: epoch_secs(),
            };
            match self.store.insert_port_allocation(&alloc) {
                Ok(()) => {
                    info!(
                        machine_id = %machine.id,
                        %server_id,
                        %kind,
                        ports = ?ports.values(),
                        attempts,
                        "ports allocated"
                    );
                    return Ok(ports);
                }
                Err(StateError::Conflict(reason)) => {
                    // Written by someone outside this allocator; refresh and move on.
                    warn!(machine_id = %machine.id, %reason, "allocation raced, rescanning");
                    taken.extend(self.recorded_ports(&machine.id, server_id)?);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PortError::Exhausted {
            machine_id: machine.id.clone(),
            min: profile.min_port,
            max: profile.max_port,
            attempts,
        })
    }

    /// Every port recorded on a machine, excluding `server_id`'s own.
    fn recorded_ports(&self, machine_id: &str, server_id: &str) -> PortResult<HashSet<u16>> {
        Ok(self
            .store
            .list_port_allocations_for_machine(machine_id)?
            .into_iter()
            .filter(|a| a.server_id != server_id)
            .flat_map(|a| a.ports.values())
            .collect())
    }

    pub fn allocation_for(&self, machine_id: &str, server_id: &str) -> PortResult<Option<PortAllocation>> {
        Ok(self.store.get_port_allocation(machine_id, server_id)?)
    }

    /// Drop the server's reservation on one machine.
    pub fn release_on(&self, machine_id: &str, server_id: &str) -> PortResult<bool> {
        let existed = self.store.delete_port_allocation(machine_id, server_id)?;
        if existed {
            info!(%machine_id, %server_id, "port allocation released");
        }
        Ok(existed)
    }

    /// Drop every reservation the server holds.
    pub fn release(&self, server_id: &str) -> PortResult<u32> {
        let count = self.store.delete_port_allocations_for_server(server_id)?;
        if count > 0 {
            info!(%server_id, count, "port allocations released");
        }
        Ok(count)
    }
}
