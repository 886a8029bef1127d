//! Fleet-wide machine selection.

use std::collections::HashMap;

use fleetgrid_state::{
    Agent, AgentStatus, Machine, MachineStatus, StateStore, WorkloadKind, epoch_secs,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::convert::machine_resources;
use crate::error::{PlacementError, PlacementResult};
use crate::requirements::ResourceRequirement;
use crate::scorer::{MachineScore, rank_machines, score_machine};

/// Where a new server should go.
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub machine_id: String,
    pub agent_id: String,
    pub score: MachineScore,
}

/// Picks the least-loaded machine with a live agent.
#[derive(Clone)]
pub struct MachineSelector {
    store: StateStore,
}

impl MachineSelector {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Choose a machine and agent for a `kind` server with `occupancy` slots.
    ///
    /// Only machines with at least one ONLINE agent are candidates. A
    /// candidate whose own status is stale gets flipped to ONLINE, since a
    /// live agent is better evidence than the machine flag.
    pub fn select_best(&self, kind: WorkloadKind, occupancy: u32) -> PlacementResult<Selection> {
        let req = ResourceRequirement::for_workload(kind, occupancy);
        let agents = self.store.list_agents()?;
        let (machine_servers, agent_servers) = self.server_counts()?;

        let mut candidates = Vec::new();
        let mut live_agents: HashMap<String, Vec<&Agent>> = HashMap::new();
        for machine in self.store.list_machines()? {
            let live: Vec<&Agent> = agents
                .iter()
                .filter(|a| a.machine_id == machine.id && a.status == AgentStatus::Online)
                .collect();
            if live.is_empty() {
                continue;
            }
            if machine.status != MachineStatus::Online {
                self.mark_online(&machine)?;
            }
            let count = machine_servers.get(&machine.id).copied().unwrap_or(0);
            candidates.push(machine_resources(&machine, count));
            live_agents.insert(machine.id, live);
        }

        let ranked = rank_machines(&candidates, &req);
        debug!(%kind, occupancy, candidates = candidates.len(), fitting = ranked.len(), "machines ranked");

        let Some(best) = ranked.into_iter().next() else {
            return Err(PlacementError::NoSuitableMachine {
                kind,
                occupancy,
                considered: candidates.len(),
            });
        };

        let agent = live_agents
            .get(&best.machine_id)
            .and_then(|agents| {
                agents.iter().min_by_key(|a| {
                    (agent_servers.get(&a.id).copied().unwrap_or(0), a.id.clone())
                })
            })
            .ok_or_else(|| PlacementError::NoSuitableMachine {
                kind,
                occupancy,
                considered: candidates.len(),
            })?;

        info!(
            machine_id = %best.machine_id,
            agent_id = %agent.id,
            score = best.score,
            %kind,
            occupancy,
            "machine selected"
        );
        Ok(Selection {
            machine_id: best.machine_id.clone(),
            agent_id: agent.id.clone(),
            score: best,
        })
    }

    /// Check that one specific machine can host the workload.
    pub fn check_fits(
        &self,
        machine_id: &str,
        kind: WorkloadKind,
        occupancy: u32,
    ) -> PlacementResult<MachineScore> {
        let machine = self
            .store
            .get_machine(machine_id)?
            .ok_or_else(|| PlacementError::MachineNotFound(machine_id.to_string()))?;
        let (machine_servers, _) = self.server_counts()?;
        let count = machine_servers.get(machine_id).copied().unwrap_or(0);
        let req = ResourceRequirement::for_workload(kind, occupancy);

        score_machine(&machine_resources(&machine, count), &req).ok_or(
            PlacementError::NoSuitableMachine {
                kind,
                occupancy,
                considered: 1,
            },
        )
    }

    /// Servers per machine and per agent.
    fn server_counts(&self) -> PlacementResult<(HashMap<String, u32>, HashMap<String, u32>)> {
        let mut by_machine = HashMap::new();
        let mut by_agent = HashMap::new();
        for server in self.store.list_servers()? {
            if let Some(m) = server.machine_id {
                *by_machine.entry(m).or_insert(0) += 1;
            }
            if let Some(a) = server.agent_id {
                *by_agent.entry(a).or_insert(0) += 1;
            }
        }
        Ok((by_machine, by_agent))
    }

    fn mark_online(&self, machine: &Machine) -> PlacementResult<()> {
        let mut updated = machine.clone();
        updated.status = MachineStatus::Online;
        updated.updated_at = epoch_secs();
        self.store.put_machine(&updated)?;
        info!(machine_id = %machine.id, "machine marked online from live agent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn put_machine(store: &StateStore, id: &str, cpu: f64, ram_gib: u64, disk_gib: u64) {
        store
            .put_machine(&Machine {
                id: id.to_string(),
                name: id.to_string(),
                address: "192.0.2.1".to_string(),
                ssh: SshTarget {
                    host: "192.0.2.1".to_string(),
                    port: 22,
                    user: "root".to_string(),
                    key_path: None,
                },
                capacity: ResourceCapacity {
                    cpu_cores: cpu,
                    ram_bytes: ram_gib * GIB,
                    disk_bytes: disk_gib * GIB,
                },
                usage: None,
                status: MachineStatus::Online,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    fn put_agent(store: &StateStore, id: &str, machine: &str, status: AgentStatus) {
        store
            .put_agent(&Agent {
                id: id.to_string(),
                machine_id: machine.to_string(),
                status,
                version: None,
                last_heartbeat: 0,
                created_at: 0,
            })
            .unwrap();
    }

    fn put_server(store: &StateStore, id: &str, machine: &str, agent: &str) {
        store
            .put_server(&Server {
                id: id.to_string(),
                name: id.to_string(),
                owner_id: None,
                kind: WorkloadKind::Valheim,
                max_players: 10,
                ram_mb: None,
                machine_id: Some(machine.to_string()),
                agent_id: Some(agent.to_string()),
                ports: None,
                status: ServerStatus::Offline,
                config: serde_json::Value::Null,
                last_backup: None,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    #[test]
    fn single_roomy_machine_is_selected() {
        let store = StateStore::open_in_memory().unwrap();
        put_machine(&store, "m-1", 16.0, 64, 500);
        put_agent(&store, "a-1", "m-1", AgentStatus::Online);

        let sel = MachineSelector::new(store)
            .select_best(WorkloadKind::ArkEvolved, 10)
            .unwrap();
        assert_eq!(sel.machine_id, "m-1");
        assert_eq!(sel.agent_id, "a-1");
    }

    #[test]
    fn machines_without_live_agent_are_skipped() {
        let store = StateStore::open_in_memory().unwrap();
        put_machine(&store, "m-1", 64.0, 256, 2000);
        put_agent(&store, "a-1", "m-1", AgentStatus::Offline);
        put_machine(&store, "m-2", 4.0, 16, 100);
        put_agent(&store, "a-2", "m-2", AgentStatus::Online);

        let sel = MachineSelector::new(store)
            .select_best(WorkloadKind::Minecraft, 5)
            .unwrap();
        assert_eq!(sel.machine_id, "m-2");
    }

    #[test]
    fn no_fit_is_explicit_error() {
        let store = StateStore::open_in_memory().unwrap();
        put_machine(&store, "m-1", 2.0, 4, 50);
        put_agent(&store, "a-1", "m-1", AgentStatus::Online);

        let err = MachineSelector::new(store)
            .select_best(WorkloadKind::ArkAscended, 70)
            .unwrap_err();
        assert!(matches!(
            err,
            PlacementError::NoSuitableMachine { considered: 1, .. }
        ));
    }

    #[test]
    fn empty_fleet_is_explicit_error() {
        let store = StateStore::open_in_memory().unwrap();
        let err = MachineSelector::new(store)
            .select_best(WorkloadKind::Other, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            PlacementError::NoSuitableMachine { considered: 0, .. }
        ));
    }

    #[test]
    fn stale_machine_flag_is_upgraded() {
        let store = StateStore::open_in_memory().unwrap();
        put_machine(&store, "m-1", 16.0, 64, 500);
        let mut m = store.get_machine("m-1").unwrap().unwrap();
        m.status = MachineStatus::Offline;
        store.put_machine(&m).unwrap();
        put_agent(&store, "a-1", "m-1", AgentStatus::Online);

        let selector = MachineSelector::new(store.clone());
        selector.select_best(WorkloadKind::Rust, 10).unwrap();
        assert_eq!(
            store.get_machine("m-1").unwrap().unwrap().status,
            MachineStatus::Online
        );
    }

    #[test]
    fn least_loaded_machine_and_emptiest_agent_win() {
        let store = StateStore::open_in_memory().unwrap();
        put_machine(&store, "m-1", 16.0, 64, 500);
        put_agent(&store, "a-1", "m-1", AgentStatus::Online);
        put_server(&store, "s-1", "m-1", "a-1");
        put_server(&store, "s-2", "m-1", "a-1");

        put_machine(&store, "m-2", 16.0, 64, 500);
        put_agent(&store, "a-2", "m-2", AgentStatus::Online);
        put_agent(&store, "a-3", "m-2", AgentStatus::Online);
        put_server(&store, "s-3", "m-2", "a-2");

        let sel = MachineSelector::new(store)
            .select_best(WorkloadKind::Valheim, 10)
            .unwrap();
        assert_eq!(sel.machine_id, "m-2");
        assert_eq!(sel.agent_id, "a-3");
    }

    #[test]
    fn check_fits_single_machine() {
        let store = StateStore::open_in_memory().unwrap();
        put_machine(&store, "m-1", 2.0, 4, 50);
        let selector = MachineSelector::new(store);

        assert!(selector.check_fits("m-1", WorkloadKind::Valheim, 10).is_ok());
        assert!(matches!(
            selector.check_fits("m-1", WorkloadKind::ArkEvolved, 10),
            Err(PlacementError::NoSuitableMachine { .. })
        ));
        assert!(matches!(
            selector.check_fits("ghost", WorkloadKind::Valheim, 10),
            Err(PlacementError::MachineNotFound(_))
        ));
    }
}
