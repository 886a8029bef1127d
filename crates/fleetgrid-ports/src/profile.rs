//! Per-workload port profiles.

use fleetgrid_state::{PortSet, WorkloadKind};

/// Which `PortSet` field a secondary port fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Query,
    Rcon,
    Beacon,
    Telnet,
    WebMap,
    SteamPeer,
    RustPlus,
}

/// Scan range for the primary port plus secondary offsets from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProfile {
    pub min_port: u16,
    pub max_port: u16,
    pub secondaries: &'static [(PortRole, u16)],
}

const DEFAULT_MIN: u16 = 27015;
const DEFAULT_MAX: u16 = 30000;

impl PortProfile {
    const fn new(min_port: u16, max_port: u16, secondaries: &'static [(PortRole, u16)]) -> Self {
        Self {
            min_port,
            max_port,
            secondaries,
        }
    }

    pub fn for_kind(kind: WorkloadKind) -> Self {
        use PortRole::*;
        match kind {
            WorkloadKind::SevenDaysToDie => Self::new(26900, 28000, &[(Telnet, 1), (WebMap, 2)]),
            WorkloadKind::ArkEvolved | WorkloadKind::ArkAscended => {
                Self::new(27015, 28000, &[(Query, 1), (Rcon, 2)])
            }
            WorkloadKind::Rust => Self::new(28015, 29000, &[(Query, 1), (Rcon, 2), (RustPlus, 3)]),
            WorkloadKind::Valheim => Self::new(2456, 2500, &[(Query, 1)]),
            WorkloadKind::Minecraft => Self::new(25565, 25600, &[(Query, 1), (Rcon, 2)]),
            WorkloadKind::Cs2 => Self::new(27015, 27100, &[]),
            WorkloadKind::Satisfactory => {
                Self::new(DEFAULT_MIN, DEFAULT_MAX, &[(Query, 1), (Beacon, 2)])
            }
            WorkloadKind::TheForest => Self::new(DEFAULT_MIN, DEFAULT_MAX, &[(SteamPeer, 1)]),
            WorkloadKind::Other => Self::new(DEFAULT_MIN, DEFAULT_MAX, &[]),
        }
    }

    /// The full port set for a primary, or `None` if a secondary would
    /// overflow the port space.
    pub fn derive(&self, primary: u16) -> Option<PortSet> {
        let mut set = PortSet {
            port: primary,
            ..Default::default()
        };
        for (role, offset) in self.secondaries {
            let port = Some(primary.checked_add(*offset)?);
            match role {
                PortRole::Query => set.query_port = port,
                PortRole::Rcon => set.rcon_port = port,
                PortRole::Beacon => set.beacon_port = port,
                PortRole::Telnet => set.telnet_port = port,
                PortRole::WebMap => set.web_map_port = port,
                PortRole::SteamPeer => set.steam_peer_port = port,
                PortRole::RustPlus => set.rust_plus_port = port,
            }
        }
        Some(set)
    }
}
