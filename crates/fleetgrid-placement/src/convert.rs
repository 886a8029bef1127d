//! Bridges `fleetgrid_state::Machine` to the scorer's `MachineResources`.
//!
//! A machine that never declared a capacity dimension gets the matching
//! `UNMEASURED_*` value, and a machine with no usage snapshot is treated as
//! idle, so a freshly registered box still competes for placements.

use fleetgrid_state::Machine;

use crate::scorer::MachineResources;

/// Assumed CPU cores when a machine declares none.
pub const UNMEASURED_CPU_CORES: f64 = 8.0;

/// Assumed RAM when a machine declares none (32 GiB).
pub const UNMEASURED_RAM_BYTES: u64 = 32 * 1024 * 1024 * 1024;

/// Assumed disk when a machine declares none (500 GiB).
pub const UNMEASURED_DISK_BYTES: u64 = 500 * 1024 * 1024 * 1024;

/// Build scorer input for `machine`, which currently hosts `server_count` servers.
pub fn machine_resources(machine: &Machine, server_count: u32) -> MachineResources {
    let cap = &machine.capacity;
    let cpu_cores = if cap.cpu_cores > 0.0 {
        cap.cpu_cores
    } else {
        UNMEASURED_CPU_CORES
    };
    let ram_bytes = if cap.ram_bytes > 0 {
        cap.ram_bytes
    } else {
        UNMEASURED_RAM_BYTES
    };
    let disk_bytes = if cap.disk_bytes > 0 {
        cap.disk_bytes
    } else {
        UNMEASURED_DISK_BYTES
    };

    let (cpu_used_cores, ram_used_bytes, disk_used_bytes) = match &machine.usage {
        Some(usage) => (
            cpu_cores * usage.cpu_percent.clamp(0.0, 100.0) / 100.0,
            usage.ram_used_bytes,
            usage.disk_used_bytes,
        ),
        None => (0.0, 0, 0),
    };

    MachineResources {
        machine_id: machine.id.clone(),
        cpu_cores,
        ram_bytes,
        disk_bytes,
        cpu_used_cores,
        ram_used_bytes,
        disk_used_bytes,
        server_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::*;

    fn sample_machine() -> Machine {
        Machine {
            id: "m-1".to_string(),
            name: "fsn1-01".to_string(),
            address: "198.51.100.7".to_string(),
            ssh: SshTarget {
                host: "198.51.100.7".to_string(),
                port: 22,
                user: "root".to_string(),
                key_path: None,
            },
            capacity: ResourceCapacity {
                cpu_cores: 12.0,
                ram_bytes: 64 << 30,
                disk_bytes: 1 << 40,
            },
            usage: Some(ResourceUsage {
                cpu_percent: 25.0,
                ram_used_bytes: 16 << 30,
                disk_used_bytes: 100 << 30,
                measured_at: 0,
            }),
            status: MachineStatus::Online,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn usage_snapshot_maps_cpu_percent_to_cores() {
        let res = machine_resources(&sample_machine(), 3);
        assert_eq!(res.cpu_used_cores, 3.0);
        assert_eq!(res.ram_used_bytes, 16 << 30);
        assert_eq!(res.server_count, 3);
    }

    #[test]
    fn unmeasured_machine_gets_named_defaults() {
        let mut m = sample_machine();
        m.capacity = ResourceCapacity::default();
        m.usage = None;

        let res = machine_resources(&m, 0);
        assert_eq!(res.cpu_cores, UNMEASURED_CPU_CORES);
        assert_eq!(res.ram_bytes, UNMEASURED_RAM_BYTES);
        assert_eq!(res.disk_bytes, UNMEASURED_DISK_BYTES);
        assert_eq!(res.ram_used_bytes, 0);
    }
}
