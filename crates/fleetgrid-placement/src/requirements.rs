//! Resource requirements per workload kind.
//!
//! Each kind has a base footprint for ten players. CPU and RAM scale
//! linearly with `max(1, occupancy / 10)`; disk scales by
//! `1 + 0.5 × scale` since saves and logs grow slower than player count.

use fleetgrid_state::WorkloadKind;
use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;

/// CPU/RAM/disk a server needs on its machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub cpu_cores: f64,
    pub ram_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceRequirement {
    /// Unscaled footprint of a workload kind.
    pub fn base(kind: WorkloadKind) -> Self {
        let (cpu_cores, ram_gib, disk_gib) = match kind {
            WorkloadKind::Minecraft => (1.0, 2, 5),
            WorkloadKind::ArkEvolved | WorkloadKind::ArkAscended => (2.0, 8, 20),
            WorkloadKind::Cs2 => (1.0, 2, 10),
            WorkloadKind::Rust => (2.0, 4, 15),
            WorkloadKind::Valheim => (1.0, 2, 5),
            WorkloadKind::SevenDaysToDie => (2.0, 4, 10),
            WorkloadKind::Satisfactory | WorkloadKind::TheForest | WorkloadKind::Other => {
                (1.0, 2, 5)
            }
        };
        Self {
            cpu_cores,
            ram_bytes: ram_gib * GIB,
            disk_bytes: disk_gib * GIB,
        }
    }

    /// Occupancy multiplier, never below 1.
    pub fn scale_for(occupancy: u32) -> f64 {
        (f64::from(occupancy) / 10.0).max(1.0)
    }

    /// Footprint of `kind` hosting `occupancy` players.
    pub fn for_workload(kind: WorkloadKind, occupancy: u32) -> Self {
        let base = Self::base(kind);
        let scale = Self::scale_for(occupancy);
        Self {
            cpu_cores: base.cpu_cores * scale,
            ram_bytes: (base.ram_bytes as f64 * scale).ceil() as u64,
            disk_bytes: (base.disk_bytes as f64 * (1.0 + 0.5 * scale)).ceil() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_occupancy_uses_minimum_scale() {
        assert_eq!(ResourceRequirement::scale_for(0), 1.0);
        assert_eq!(ResourceRequirement::scale_for(4), 1.0);
        assert_eq!(ResourceRequirement::scale_for(10), 1.0);
        assert_eq!(ResourceRequirement::scale_for(25), 2.5);
    }

    #[test]
    fn ark_at_ten_players() {
        let req = ResourceRequirement::for_workload(WorkloadKind::ArkAscended, 10);
        assert_eq!(req.cpu_cores, 2.0);
        assert_eq!(req.ram_bytes, 8 * GIB);
        assert_eq!(req.disk_bytes, 30 * GIB);
    }

    #[test]
    fn disk_grows_slower_than_ram() {
        let small = ResourceRequirement::for_workload(WorkloadKind::Rust, 10);
        let large = ResourceRequirement::for_workload(WorkloadKind::Rust, 100);
        assert_eq!(large.ram_bytes, small.ram_bytes * 10);
        assert_eq!(large.cpu_cores, small.cpu_cores * 10.0);
        // 15 × (1 + 5) vs 15 × 1.5
        assert_eq!(large.disk_bytes, 90 * GIB);
        assert_eq!(small.disk_bytes, (22.5 * GIB as f64) as u64);
    }
}
