//! StateStore: redb-backed state persistence for fleetgrid.
//!
//! Provides typed CRUD operations over machines, agents, servers, port
//! allocations, tasks, and cron jobs. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [MACHINES, AGENTS, SERVERS, PORT_ALLOCATIONS, TASKS, CRON_JOBS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// List every value whose key starts with `prefix` (all values for `""`).
    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn remove_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a single record inside one write transaction.
    ///
    /// `f` sees the current value and either returns the replacement or an
    /// error; on error nothing is written.
    fn modify_json<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> StateResult<T>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let current: Option<T> = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;
            match current {
                None => Err(StateError::NotFound(key.to_string())),
                Some(value) => f(value).and_then(|updated| {
                    let bytes = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
                    table
                        .insert(key, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    Ok(updated)
                }),
            }
        };
        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Insert or update a machine.
    pub fn put_machine(&self, machine: &Machine) -> StateResult<()> {
        self.put_json(MACHINES, &machine.id, machine)?;
        debug!(machine_id = %machine.id, "machine stored");
        Ok(())
    }

    pub fn get_machine(&self, machine_id: &str) -> StateResult<Option<Machine>> {
        self.get_json(MACHINES, machine_id)
    }

    pub fn list_machines(&self) -> StateResult<Vec<Machine>> {
        self.scan_json(MACHINES, "")
    }

    pub fn delete_machine(&self, machine_id: &str) -> StateResult<bool> {
        self.remove_key(MACHINES, machine_id)
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert or update an agent.
    pub fn put_agent(&self, agent: &Agent) -> StateResult<()> {
        self.put_json(AGENTS, &agent.id, agent)?;
        debug!(agent_id = %agent.id, status = ?agent.status, "agent stored");
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &str) -> StateResult<Option<Agent>> {
        self.get_json(AGENTS, agent_id)
    }

    pub fn list_agents(&self) -> StateResult<Vec<Agent>> {
        self.scan_json(AGENTS, "")
    }

    /// List the agents bound to one machine.
    pub fn list_agents_for_machine(&self, machine_id: &str) -> StateResult<Vec<Agent>> {
        let mut agents = self.list_agents()?;
        agents.retain(|a| a.machine_id == machine_id);
        Ok(agents)
    }

    pub fn delete_agent(&self, agent_id: &str) -> StateResult<bool> {
        self.remove_key(AGENTS, agent_id)
    }

    // ── Servers ────────────────────────────────────────────────────

    /// Insert or update a server.
    pub fn put_server(&self, server: &Server) -> StateResult<()> {
        self.put_json(SERVERS, &server.id, server)?;
        debug!(server_id = %server.id, status = %server.status, "server stored");
        Ok(())
    }

    pub fn get_server(&self, server_id: &str) -> StateResult<Option<Server>> {
        self.get_json(SERVERS, server_id)
    }

    pub fn list_servers(&self) -> StateResult<Vec<Server>> {
        self.scan_json(SERVERS, "")
    }

    /// Apply `f` to a stored server in a single write transaction.
    pub fn update_server<F>(&self, server_id: &str, f: F) -> StateResult<Server>
    where
        F: FnOnce(Server) -> StateResult<Server>,
    {
        self.modify_json(SERVERS, server_id, f)
    }

    pub fn delete_server(&self, server_id: &str) -> StateResult<bool> {
        let existed = self.remove_key(SERVERS, server_id)?;
        debug!(%server_id, existed, "server deleted");
        Ok(existed)
    }

    // ── Port allocations ───────────────────────────────────────────

    /// Persist an allocation unless it overlaps another server's
    /// allocation on the same machine.
    ///
    /// The overlap scan and the insert share one write transaction. An
    /// existing allocation for the same `(machine, server)` is replaced.
    pub fn insert_port_allocation(&self, alloc: &PortAllocation) -> StateResult<()> {
        let key = alloc.table_key();
        let prefix = format!("{}:", alloc.machine_id);
        let bytes = serde_json::to_vec(alloc).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
            let mut clash = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                if !k.value().starts_with(&prefix) || k.value() == key {
                    continue;
                }
                let existing: PortAllocation =
                    serde_json::from_slice(v.value()).map_err(map_err!(Deserialize))?;
                if existing.ports.overlaps(&alloc.ports) {
                    clash = Some(existing.server_id);
                    break;
                }
            }
            match clash {
                Some(other) => Err(StateError::Conflict(format!(
                    "ports {:?} on machine {} overlap allocation of server {other}",
                    alloc.ports.values(),
                    alloc.machine_id
                ))),
                None => table
                    .insert(key.as_str(), bytes.as_slice())
                    .map(|_| ())
                    .map_err(map_err!(Write)),
            }
        };
        match outcome {
            Ok(()) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(%key, ports = ?alloc.ports.values(), "port allocation stored");
                Ok(())
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    pub fn get_port_allocation(
        &self,
        machine_id: &str,
        server_id: &str,
    ) -> StateResult<Option<PortAllocation>> {
        self.get_json(PORT_ALLOCATIONS, &format!("{machine_id}:{server_id}"))
    }

    /// List all allocations on a machine.
    pub fn list_port_allocations_for_machine(
        &self,
        machine_id: &str,
    ) -> StateResult<Vec<PortAllocation>> {
        self.scan_json(PORT_ALLOCATIONS, &format!("{machine_id}:"))
    }

    /// List all allocations held by a server, across machines.
    pub fn list_port_allocations_for_server(
        &self,
        server_id: &str,
    ) -> StateResult<Vec<PortAllocation>> {
        let mut allocs: Vec<PortAllocation> = self.scan_json(PORT_ALLOCATIONS, "")?;
        allocs.retain(|a| a.server_id == server_id);
        Ok(allocs)
    }

    pub fn delete_port_allocation(&self, machine_id: &str, server_id: &str) -> StateResult<bool> {
        self.remove_key(PORT_ALLOCATIONS, &format!("{machine_id}:{server_id}"))
    }

    /// Delete every allocation held by a server. Returns the count removed.
    pub fn delete_port_allocations_for_server(&self, server_id: &str) -> StateResult<u32> {
        let allocs = self.list_port_allocations_for_server(server_id)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0u32;
        {
            let mut table = txn.open_table(PORT_ALLOCATIONS).map_err(map_err!(Table))?;
            for alloc in &allocs {
                if table
                    .remove(alloc.table_key().as_str())
                    .map_err(map_err!(Write))?
                    .is_some()
                {
                    count += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%server_id, count, "port allocations deleted");
        Ok(count)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task.
    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        self.put_json(TASKS, &task.id, task)?;
        debug!(task_id = %task.id, status = %task.status, "task stored");
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<Task>> {
        self.get_json(TASKS, task_id)
    }

    /// List all tasks, oldest first.
    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.scan_json(TASKS, "")?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// The `limit` oldest PENDING tasks.
    pub fn list_pending_tasks(&self, limit: usize) -> StateResult<Vec<Task>> {
        let mut tasks = self.list_tasks()?;
        tasks.retain(|t| t.status == TaskStatus::Pending);
        tasks.truncate(limit);
        Ok(tasks)
    }

    /// Move a PENDING task to RUNNING and stamp `started_at`.
    ///
    /// Fails with [`StateError::Conflict`] if the task is in any other
    /// status, so at most one caller ever claims a given task.
    pub fn claim_task(&self, task_id: &str, now: u64) -> StateResult<Task> {
        self.modify_json(TASKS, task_id, |mut task: Task| {
            if task.status != TaskStatus::Pending {
                return Err(StateError::Conflict(format!(
                    "task {} is {}, expected PENDING",
                    task.id, task.status
                )));
            }
            task.status = TaskStatus::Running;
            task.started_at = Some(now);
            Ok(task)
        })
    }

    /// Move a RUNNING task to a terminal status and stamp `completed_at`.
    pub fn finish_task(
        &self,
        task_id: &str,
        outcome: Result<serde_json::Value, String>,
        now: u64,
    ) -> StateResult<Task> {
        self.modify_json(TASKS, task_id, |mut task: Task| {
            if task.status != TaskStatus::Running {
                return Err(StateError::Conflict(format!(
                    "task {} is {}, expected RUNNING",
                    task.id, task.status
                )));
            }
            match outcome {
                Ok(result) => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                }
                Err(error) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
            }
            task.completed_at = Some(now);
            Ok(task)
        })
    }

    // ── Cron jobs ──────────────────────────────────────────────────

    /// Insert or update a cron job.
    pub fn put_cron_job(&self, job: &CronJob) -> StateResult<()> {
        self.put_json(CRON_JOBS, &job.id, job)?;
        debug!(cron_job_id = %job.id, next_run = ?job.next_run, "cron job stored");
        Ok(())
    }

    pub fn get_cron_job(&self, job_id: &str) -> StateResult<Option<CronJob>> {
        self.get_json(CRON_JOBS, job_id)
    }

    pub fn list_cron_jobs(&self) -> StateResult<Vec<CronJob>> {
        self.scan_json(CRON_JOBS, "")
    }

    /// Jobs due at `now`, earliest `next_run` first (never-scheduled first of all).
    pub fn list_due_cron_jobs(&self, now: u64) -> StateResult<Vec<CronJob>> {
        let mut jobs = self.list_cron_jobs()?;
        jobs.retain(|j| j.is_due(now));
        jobs.sort_by_key(|j| j.next_run.unwrap_or(0));
        Ok(jobs)
    }

    pub fn delete_cron_job(&self, job_id: &str) -> StateResult<bool> {
        self.remove_key(CRON_JOBS, job_id)
    }
}
