//! Live port probe: what is actually bound or published on a host.

use std::collections::BTreeSet;
use std::time::Duration;

use fleetgrid_remote::RemoteExecutor;
use fleetgrid_state::Machine;
use tracing::debug;

use crate::error::{PortError, PortResult};

const DOCKER_MARKER: &str = "--- docker ---";

/// Lists listening sockets, then published container ports.
pub const PROBE_COMMAND: &str = "(ss -Htuln 2>/dev/null || netstat -tuln 2>/dev/null); \
echo '--- docker ---'; docker ps --format '{{.Ports}}' 2>/dev/null; true";

/// Ports in use on `machine` right now.
pub async fn probe_used_ports(
    executor: &dyn RemoteExecutor,
    machine: &Machine,
    timeout: Duration,
) -> PortResult<BTreeSet<u16>> {
    let out = executor.run(&machine.ssh, PROBE_COMMAND, timeout).await?;
    if !out.success() {
        return Err(PortError::Probe {
            machine_id: machine.id.clone(),
            reason: out.summary(),
        });
    }
    let ports = parse_probe_output(&out.stdout);
    debug!(machine_id = %machine.id, in_use = ports.len(), "host ports probed");
    Ok(ports)
}

/// Parse [`PROBE_COMMAND`] output.
pub fn parse_probe_output(stdout: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    let (sockets, docker) = match stdout.split_once(DOCKER_MARKER) {
        Some((s, d)) => (s, d),
        None => (stdout, ""),
    };

    // ss and netstat both print the local address before the peer.
    for line in sockets.lines() {
        let local = line.split_whitespace().find(|tok| tok.contains(':'));
        if let Some(port) = local.and_then(|tok| tok.rsplit(':').next()?.parse().ok()) {
            ports.insert(port);
        }
    }

    // e.g. `0.0.0.0:27015->27015/udp, :::27016-27018->27016-27018/udp`
    for mapping in docker.lines().flat_map(|l| l.split(',')) {
        let Some((host_side, _)) = mapping.trim().split_once("->") else {
            continue;
        };
        let Some(spec) = host_side.rsplit(':').next() else {
            continue;
        };
        match spec.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                    ports.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(p) = spec.parse() {
                    ports.insert(p);
                }
            }
        }
    }
    ports
}
