//! Machine scoring for placement decisions.
//!
//! A machine is rejected when any dimension is already saturated or when
//! what is left cannot hold the requirement. Survivors are scored by the
//! unweighted mean of CPU, RAM and disk utilisation plus a server-count
//! pressure term. Lower scores are less loaded and win.

use serde::Serialize;

use crate::requirements::ResourceRequirement;

/// Capacity and current usage of one machine.
#[derive(Debug, Clone, Serialize)]
pub struct MachineResources {
    pub machine_id: String,
    pub cpu_cores: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
    pub cpu_used_cores: f64,
    pub ram_used_bytes: u64,
    pub disk_used_bytes: u64,
    pub server_count: u32,
}

impl MachineResources {
    pub fn available_cpu(&self) -> f64 {
        (self.cpu_cores - self.cpu_used_cores).max(0.0)
    }

    pub fn available_ram(&self) -> u64 {
        self.ram_bytes.saturating_sub(self.ram_used_bytes)
    }

    pub fn available_disk(&self) -> u64 {
        self.disk_bytes.saturating_sub(self.disk_used_bytes)
    }

    pub fn cpu_percent(&self) -> f64 {
        percent(self.cpu_used_cores, self.cpu_cores)
    }

    pub fn ram_percent(&self) -> f64 {
        percent(self.ram_used_bytes as f64, self.ram_bytes as f64)
    }

    pub fn disk_percent(&self) -> f64 {
        percent(self.disk_used_bytes as f64, self.disk_bytes as f64)
    }
}

/// Zero capacity counts as saturated.
fn percent(used: f64, capacity: f64) -> f64 {
    if capacity > 0.0 {
        used / capacity * 100.0
    } else {
        100.0
    }
}

/// Scored candidate.
#[derive(Debug, Clone, Serialize)]
pub struct MachineScore {
    pub machine_id: String,
    /// Composite load (lower = better).
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub disk_percent: f64,
    /// `server_count / 10 × 100`.
    pub server_pressure: f64,
}

/// Score a single machine, or `None` if it cannot host the requirement.
pub fn score_machine(
    machine: &MachineResources,
    req: &ResourceRequirement,
) -> Option<MachineScore> {
    let cpu_percent = machine.cpu_percent();
    let ram_percent = machine.ram_percent();
    let disk_percent = machine.disk_percent();

    if cpu_percent >= 100.0 || ram_percent >= 100.0 || disk_percent >= 100.0 {
        return None;
    }
    if machine.available_cpu() < req.cpu_cores
        || machine.available_ram() < req.ram_bytes
        || machine.available_disk() < req.disk_bytes
    {
        return None;
    }

    let server_pressure = f64::from(machine.server_count) / 10.0 * 100.0;
    let score = (cpu_percent + ram_percent + disk_percent + server_pressure) / 4.0;

    Some(MachineScore {
        machine_id: machine.machine_id.clone(),
        score,
        breakdown: ScoreBreakdown {
            cpu_percent,
            ram_percent,
            disk_percent,
            server_pressure,
        },
    })
}

/// Score all machines and return the fitting ones, least loaded first.
pub fn rank_machines(machines: &[MachineResources], req: &ResourceRequirement) -> Vec<MachineScore> {
    let mut scores: Vec<MachineScore> = machines
        .iter()
        .filter_map(|m| score_machine(m, req))
        .collect();

    scores.sort_by(|a, b| {
        a.score
            .partial_cmp(&b.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.machine_id.cmp(&b.machine_id))
    });
    scores
}
