//! Install and start templates per workload kind.
//!
//! Templates are shell snippets with `{placeholder}` markers. Operators can
//! override any kind from configuration; kinds without an override use the
//! built-in steamcmd or jar recipes below.

use std::collections::HashMap;

use fleetgrid_state::{PortSet, WorkloadKind};
use serde::{Deserialize, Serialize};

use crate::commands::shell_quote;

/// RAM passed to `{ram}` when the server does not set one, in megabytes.
pub const DEFAULT_RAM_MB: u32 = 4096;

/// Shell snippets for one workload kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadTemplate {
    /// Runs in the server directory. Must be safe to re-run.
    pub install: String,
    /// Foreground command the systemd unit supervises.
    pub start: String,
    /// Optional graceful stop, run as the unit's `ExecStop`.
    #[serde(default)]
    pub stop: Option<String>,
    /// Package refresh. Falls back to `install` when absent.
    #[serde(default)]
    pub update: Option<String>,
}

impl WorkloadTemplate {
    pub fn update_command(&self) -> &str {
        self.update.as_deref().unwrap_or(&self.install)
    }
}

/// Per-kind overrides on top of the built-in templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadCatalog {
    overrides: HashMap<WorkloadKind, WorkloadTemplate>,
}

impl WorkloadCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, kind: WorkloadKind, template: WorkloadTemplate) -> Self {
        self.overrides.insert(kind, template);
        self
    }

    pub fn template(&self, kind: WorkloadKind) -> WorkloadTemplate {
        self.overrides
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| builtin(kind))
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone)]
pub struct TemplateParams<'a> {
    pub server_id: &'a str,
    pub name: &'a str,
    pub dir: &'a str,
    pub ports: PortSet,
    pub max_players: u32,
    pub ram_mb: Option<u32>,
}

/// Substitute every known placeholder. The name is shell-quoted; absent
/// secondary ports render as empty strings.
pub fn render(template: &str, params: &TemplateParams<'_>) -> String {
    let opt = |p: Option<u16>| p.map(|p| p.to_string()).unwrap_or_default();
    let pairs = [
        ("{server_id}", params.server_id.to_string()),
        ("{name}", shell_quote(params.name)),
        ("{dir}", params.dir.to_string()),
        ("{port}", params.ports.port.to_string()),
        ("{query_port}", opt(params.ports.query_port)),
        ("{rcon_port}", opt(params.ports.rcon_port)),
        ("{beacon_port}", opt(params.ports.beacon_port)),
        ("{max_players}", params.max_players.to_string()),
        ("{ram}", params.ram_mb.unwrap_or(DEFAULT_RAM_MB).to_string()),
    ];
    pairs
        .iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
}

// ── Built-in templates ─────────────────────────────────────────────

fn steamcmd_install(app_id: u32) -> String {
    format!(
        "mkdir -p {{dir}}/steamcmd && cd {{dir}}/steamcmd && \
         ( [ -x steamcmd.sh ] || wget -qO- https://steamcdn-a.akamaihd.net/client/installer/steamcmd_linux.tar.gz | tar zxf - ) && \
         ./steamcmd.sh +force_install_dir {{dir}}/game +login anonymous +app_update {app_id} validate +quit"
    )
}

fn steam(app_id: u32, start: &str) -> WorkloadTemplate {
    WorkloadTemplate {
        install: steamcmd_install(app_id),
        start: start.to_string(),
        stop: None,
        update: None,
    }
}

fn builtin(kind: WorkloadKind) -> WorkloadTemplate {
    match kind {
        WorkloadKind::Minecraft => WorkloadTemplate {
            install: "mkdir -p {dir}/game && cd {dir}/game && \
                      ( [ -f server.jar ] || wget -q -O server.jar https://piston-data.mojang.com/v1/objects/server.jar ) && \
                      echo eula=true > eula.txt"
                .to_string(),
            start: "cd {dir}/game && exec java -Xms1024M -Xmx{ram}M -jar server.jar nogui --port {port}"
                .to_string(),
            stop: None,
            update: Some(
                "cd {dir}/game && wget -q -O server.jar https://piston-data.mojang.com/v1/objects/server.jar"
                    .to_string(),
            ),
        },
        WorkloadKind::ArkEvolved => steam(
            376030,
            "cd {dir}/game/ShooterGame/Binaries/Linux && exec ./ShooterGameServer \
             TheIsland?listen?SessionName={name}?Port={port}?QueryPort={query_port}?RCONPort={rcon_port}?MaxPlayers={max_players} -server -log",
        ),
        WorkloadKind::ArkAscended => steam(
            2430930,
            "cd {dir}/game/ShooterGame/Binaries/Win64 && exec proton run ./ArkAscendedServer.exe \
             TheIsland_WP?listen?SessionName={name}?Port={port}?RCONPort={rcon_port} -WinLiveMaxPlayers={max_players}",
        ),
        WorkloadKind::Rust => steam(
            258550,
            "cd {dir}/game && exec ./RustDedicated -batchmode +server.port {port} +server.queryport {query_port} \
             +rcon.port {rcon_port} +server.hostname {name} +server.maxplayers {max_players}",
        ),
        WorkloadKind::Valheim => steam(
            896660,
            "cd {dir}/game && exec ./valheim_server.x86_64 -name {name} -port {port} -world Dedicated -nographics -batchmode",
        ),
        WorkloadKind::SevenDaysToDie => steam(
            294420,
            "cd {dir}/game && exec ./7DaysToDieServer.x86_64 -batchmode -nographics -dedicated \
             -ServerPort={port} -ServerName={name} -ServerMaxPlayerCount={max_players}",
        ),
        WorkloadKind::Satisfactory => steam(
            1690800,
            "cd {dir}/game && exec ./FactoryServer.sh -Port={port} -ReliablePort={beacon_port}",
        ),
        WorkloadKind::TheForest => steam(
            556450,
            "cd {dir}/game && exec xvfb-run wine TheForestDedicatedServer.exe -batchmode -nographics \
             -serverport {port} -servername {name} -serverplayers {max_players}",
        ),
        WorkloadKind::Cs2 => steam(
            730,
            "cd {dir}/game/game/bin/linuxsteamrt64 && exec ./cs2 -dedicated -port {port} -maxplayers {max_players} +map de_dust2",
        ),
        WorkloadKind::Other => WorkloadTemplate {
            install: "mkdir -p {dir}/game".to_string(),
            start: "echo 'no start template configured for server {server_id}' >&2; exit 1".to_string(),
            stop: None,
            update: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(name: &'a str, ports: PortSet) -> TemplateParams<'a> {
        TemplateParams {
            server_id: "srv-1",
            name,
            dir: "/opt/servers/srv-1",
            ports,
            max_players: 32,
            ram_mb: None,
        }
    }

    #[test]
    fn renders_ports_and_defaults() {
        let ports = PortSet {
            port: 28015,
            query_port: Some(28016),
            rcon_port: Some(28017),
            ..Default::default()
        };
        let out = render(
            "run {port} {query_port} {rcon_port} {beacon_port}| {max_players} {ram} {dir}",
            &params("x", ports),
        );
        assert_eq!(out, "run 28015 28016 28017 | 32 4096 /opt/servers/srv-1");
    }

    #[test]
    fn name_is_shell_quoted() {
        let out = render("--name {name}", &params("Bob's $(rm -rf /)", PortSet::default()));
        assert_eq!(out, r#"--name 'Bob'\''s $(rm -rf /)'"#);
    }

    #[test]
    fn overrides_take_precedence() {
        let custom = WorkloadTemplate {
            install: "true".into(),
            start: "sleep infinity".into(),
            stop: None,
            update: Some("apt-get upgrade -y".into()),
        };
        let catalog = WorkloadCatalog::new().with_template(WorkloadKind::Valheim, custom.clone());
        assert_eq!(catalog.template(WorkloadKind::Valheim), custom);
        assert_eq!(catalog.template(WorkloadKind::Valheim).update_command(), "apt-get upgrade -y");
        assert!(catalog.template(WorkloadKind::Rust).install.contains("258550"));
    }

    #[test]
    fn update_falls_back_to_install() {
        let t = WorkloadCatalog::new().template(WorkloadKind::Cs2);
        assert_eq!(t.update_command(), t.install);
    }

    #[test]
    fn catalog_deserializes_from_kind_keys() {
        let catalog: WorkloadCatalog = serde_json::from_value(serde_json::json!({
            "VALHEIM": { "install": "i", "start": "s" }
        }))
        .unwrap();
        assert_eq!(catalog.template(WorkloadKind::Valheim).start, "s");
    }
}
