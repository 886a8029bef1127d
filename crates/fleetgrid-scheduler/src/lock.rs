//! Per-agent provisioning lock.
//!
//! At most one provisioning flow holds an agent at a time. Later acquirers
//! queue FIFO and are handed the lock directly on release, so a waiter
//! never races a newcomer for it. The holder gets a [`ProvisioningGuard`]
//! that releases exactly once, on an explicit call or on drop.
//!
//! State is in memory only. A manager is created once at startup and shared
//! by handle; [`ProvisioningLocks::reset`] clears it between tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use fleetgrid_state::epoch_secs;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// The holder released with an error; queued work is failed fast.
    #[error("provisioning on agent {agent_id} failed: {reason}")]
    HolderFailed { agent_id: String, reason: String },

    #[error("lock state for agent {agent_id} was reset")]
    Reset { agent_id: String },
}

struct Waiter {
    server_id: String,
    tx: oneshot::Sender<Result<(), LockError>>,
}

struct Held {
    server_id: String,
    acquired_at: u64,
    since: Instant,
    waiters: VecDeque<Waiter>,
}

/// Snapshot of one held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub agent_id: String,
    pub server_id: String,
    pub acquired_at: u64,
    pub queued: usize,
}

/// Keyed FIFO mutex over agent ids.
#[derive(Clone, Default)]
pub struct ProvisioningLocks {
    inner: Arc<Mutex<HashMap<String, Held>>>,
}

impl ProvisioningLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Held>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait until no other provisioning holds `agent_id`, then hold it.
    pub async fn acquire(
        &self,
        agent_id: &str,
        server_id: &str,
    ) -> Result<ProvisioningGuard, LockError> {
        let rx = {
            let mut table = self.table();
            match table.get_mut(agent_id) {
                None => {
                    table.insert(
                        agent_id.to_string(),
                        Held {
                            server_id: server_id.to_string(),
                            acquired_at: epoch_secs(),
                            since: Instant::now(),
                            waiters: VecDeque::new(),
                        },
                    );
                    info!(%agent_id, %server_id, "provisioning lock acquired");
                    return Ok(self.guard(agent_id, server_id));
                }
                Some(held) => {
                    let (tx, rx) = oneshot::channel();
                    held.waiters.push_back(Waiter {
                        server_id: server_id.to_string(),
                        tx,
                    });
                    info!(
                        %agent_id,
                        %server_id,
                        holder = %held.server_id,
                        position = held.waiters.len(),
                        "waiting for provisioning lock"
                    );
                    rx
                }
            }
        };

        let mut ticket = Ticket {
            locks: self.clone(),
            agent_id: agent_id.to_string(),
            server_id: server_id.to_string(),
            rx,
            settled: false,
        };
        let outcome = (&mut ticket.rx).await;
        ticket.settled = true;
        match outcome {
            Ok(Ok(())) => {
                info!(%agent_id, %server_id, "provisioning lock handed over");
                Ok(self.guard(agent_id, server_id))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LockError::Reset {
                agent_id: agent_id.to_string(),
            }),
        }
    }

    fn guard(&self, agent_id: &str, server_id: &str) -> ProvisioningGuard {
        ProvisioningGuard {
            locks: self.clone(),
            agent_id: agent_id.to_string(),
            server_id: server_id.to_string(),
            released: false,
        }
    }

    /// Release the lock held by `server_id` and hand it to the next waiter.
    ///
    /// Returns false (and changes nothing) if `server_id` is not the holder.
    pub fn release(&self, agent_id: &str, server_id: &str) -> bool {
        let mut table = self.table();
        let Some(held) = table.get_mut(agent_id) else {
            warn!(%agent_id, %server_id, "release of a lock that is not held");
            return false;
        };
        if held.server_id != server_id {
            warn!(%agent_id, %server_id, holder = %held.server_id, "release by non-holder ignored");
            return false;
        }

        let held_ms = held.since.elapsed().as_millis() as u64;
        while let Some(next) = held.waiters.pop_front() {
            let next_server = next.server_id.clone();
            held.server_id = next.server_id;
            held.acquired_at = epoch_secs();
            held.since = Instant::now();
            if next.tx.send(Ok(())).is_ok() {
                info!(%agent_id, from = %server_id, to = %next_server, held_ms, "provisioning lock released");
                return true;
            }
            debug!(%agent_id, server_id = %next_server, "skipping cancelled waiter");
        }

        table.remove(agent_id);
        info!(%agent_id, %server_id, held_ms, "provisioning lock released");
        true
    }

    /// Release and fail every queued acquirer with `reason`.
    pub fn release_with_error(&self, agent_id: &str, server_id: &str, reason: &str) -> bool {
        let mut table = self.table();
        match table.get(agent_id) {
            Some(held) if held.server_id == server_id => {}
            Some(held) => {
                warn!(%agent_id, %server_id, holder = %held.server_id, "release by non-holder ignored");
                return false;
            }
            None => {
                warn!(%agent_id, %server_id, "release of a lock that is not held");
                return false;
            }
        }
        let Some(held) = table.remove(agent_id) else {
            return false;
        };
        let failed = held.waiters.len();
        for waiter in held.waiters {
            let _ = waiter.tx.send(Err(LockError::HolderFailed {
                agent_id: agent_id.to_string(),
                reason: reason.to_string(),
            }));
        }
        warn!(%agent_id, %server_id, failed, %reason, "provisioning lock released with error");
        true
    }

    pub fn has_active_lock(&self, agent_id: &str) -> bool {
        self.table().contains_key(agent_id)
    }

    pub fn active_lock(&self, agent_id: &str) -> Option<LockInfo> {
        self.table().get(agent_id).map(|held| LockInfo {
            agent_id: agent_id.to_string(),
            server_id: held.server_id.clone(),
            acquired_at: held.acquired_at,
            queued: held.waiters.len(),
        })
    }

    pub fn active_locks(&self) -> Vec<LockInfo> {
        let mut locks: Vec<LockInfo> = self
            .table()
            .iter()
            .map(|(agent_id, held)| LockInfo {
                agent_id: agent_id.clone(),
                server_id: held.server_id.clone(),
                acquired_at: held.acquired_at,
                queued: held.waiters.len(),
            })
            .collect();
        locks.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        locks
    }

    /// Drop all lock state, failing any queued acquirers.
    pub fn reset(&self) {
        let drained: Vec<(String, Held)> = self.table().drain().collect();
        for (agent_id, held) in drained {
            for waiter in held.waiters {
                let _ = waiter.tx.send(Err(LockError::Reset {
                    agent_id: agent_id.clone(),
                }));
            }
        }
    }
}

/// A queued acquire. Dropped after the lock was handed to it but before
/// it became a guard, it passes the lock on.
struct Ticket {
    locks: ProvisioningLocks,
    agent_id: String,
    server_id: String,
    rx: oneshot::Receiver<Result<(), LockError>>,
    settled: bool,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if let Ok(Ok(())) = self.rx.try_recv() {
            debug!(agent_id = %self.agent_id, server_id = %self.server_id, "acquire cancelled after handover");
            self.locks.release(&self.agent_id, &self.server_id);
        }
    }
}

/// Proof of holding an agent's provisioning lock.
pub struct ProvisioningGuard {
    locks: ProvisioningLocks,
    agent_id: String,
    server_id: String,
    released: bool,
}

impl ProvisioningGuard {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn release(mut self) {
        self.released = true;
        self.locks.release(&self.agent_id, &self.server_id);
    }

    pub fn release_with_error(mut self, reason: &str) {
        self.released = true;
        self.locks
            .release_with_error(&self.agent_id, &self.server_id, reason);
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        if !self.released {
            self.locks.release(&self.agent_id, &self.server_id);
        }
    }
}
