//! fleetd.toml configuration.
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a working single-host setup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetgrid_remote::SshConfig;
use fleetgrid_scheduler::{ExecutorConfig, WorkloadCatalog};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub ssh: SshSection,
    pub tasks: TasksSection,
    pub ports: PortsSection,
    pub cron: CronSection,
    pub membership: MembershipSection,
    /// `[workloads.VALHEIM]` style overrides of the built-in templates.
    pub workloads: WorkloadCatalog,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub binary: PathBuf,
    pub connect_timeout_secs: u64,
    pub host_key_checking: String,
    pub extra_options: Vec<String>,
}

impl Default for SshSection {
    fn default() -> Self {
        let ssh = SshConfig::default();
        Self {
            binary: ssh.binary,
            connect_timeout_secs: ssh.connect_timeout.as_secs(),
            host_key_checking: ssh.host_key_checking,
            extra_options: ssh.extra_options,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub command_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub restart_delay_secs: u64,
    pub liveness_retry_delay_secs: u64,
    pub servers_root: String,
    pub backups_root: String,
    pub agent_install_script: String,
}

impl Default for TasksSection {
    fn default() -> Self {
        let exec = ExecutorConfig::default();
        Self {
            poll_interval_ms: 1000,
            batch_size: fleetgrid_scheduler::DEFAULT_BATCH_SIZE,
            command_timeout_secs: exec.command_timeout.as_secs(),
            install_timeout_secs: exec.install_timeout.as_secs(),
            transfer_timeout_secs: exec.transfer_timeout.as_secs(),
            probe_timeout_secs: exec.probe_timeout.as_secs(),
            restart_delay_secs: exec.restart_delay.as_secs(),
            liveness_retry_delay_secs: exec.liveness_retry_delay.as_secs(),
            servers_root: exec.servers_root,
            backups_root: exec.backups_root,
            agent_install_script: exec.agent_install_script,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsSection {
    /// Candidates tried per allocation before giving up.
    pub max_attempts: u32,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self { max_attempts: 100 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronSection {
    pub enabled: bool,
    pub scan_interval_secs: u64,
    /// Used by jobs created without a timezone.
    pub default_timezone: String,
}

impl Default for CronSection {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: 60,
            default_timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for MembershipSection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: fleetgrid_scheduler::DEFAULT_HEARTBEAT_TIMEOUT.as_secs(),
            sweep_interval_secs: 30,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tasks.batch_size == 0 {
            anyhow::bail!("tasks.batch_size must be at least 1");
        }
        if self.tasks.poll_interval_ms == 0 {
            anyhow::bail!("tasks.poll_interval_ms must be positive");
        }
        if self.ports.max_attempts == 0 {
            anyhow::bail!("ports.max_attempts must be at least 1");
        }
        for (name, secs) in [
            ("tasks.command_timeout_secs", self.tasks.command_timeout_secs),
            ("tasks.install_timeout_secs", self.tasks.install_timeout_secs),
            ("tasks.transfer_timeout_secs", self.tasks.transfer_timeout_secs),
            ("tasks.probe_timeout_secs", self.tasks.probe_timeout_secs),
            ("cron.scan_interval_secs", self.cron.scan_interval_secs),
            ("membership.sweep_interval_secs", self.membership.sweep_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{name} must be positive");
            }
        }
        fleetgrid_cron::CronSchedule::parse("* * * * *", &self.cron.default_timezone)?;
        Ok(())
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            binary: self.ssh.binary.clone(),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            host_key_checking: self.ssh.host_key_checking.clone(),
            extra_options: self.ssh.extra_options.clone(),
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let t = &self.tasks;
        ExecutorConfig {
            command_timeout: Duration::from_secs(t.command_timeout_secs),
            install_timeout: Duration::from_secs(t.install_timeout_secs),
            transfer_timeout: Duration::from_secs(t.transfer_timeout_secs),
            probe_timeout: Duration::from_secs(t.probe_timeout_secs),
            restart_delay: Duration::from_secs(t.restart_delay_secs),
            liveness_retry_delay: Duration::from_secs(t.liveness_retry_delay_secs),
            servers_root: t.servers_root.clone(),
            backups_root: t.backups_root.clone(),
            agent_install_script: t.agent_install_script.clone(),
            port_max_attempts: self.ports.max_attempts,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.daemon.data_dir.join("fleetgrid.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::WorkloadKind;

    #[test]
    fn empty_file_is_valid() {
        let config = DaemonConfig::from_toml_str("").unwrap();
        assert_eq!(config.daemon.listen.port(), 8443);
        assert_eq!(config.ports.max_attempts, 100);
        assert_eq!(config.cron.default_timezone, "UTC");
        assert_eq!(config.membership.heartbeat_timeout_secs, 300);
        assert_eq!(config.executor_config().command_timeout, Duration::from_secs(120));
    }

    #[test]
    fn parses_sections_and_workloads() {
        let toml_str = r#"
[daemon]
listen = "127.0.0.1:9000"
data_dir = "/tmp/fleet"
log_format = "json"

[tasks]
batch_size = 4
restart_delay_secs = 2

[ports]
max_attempts = 20

[cron]
default_timezone = "Europe/Berlin"

[workloads.VALHEIM]
install = "echo install {server_id}"
start = "./valheim_server -port {port}"
"#;
        let config = DaemonConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.daemon.log_format, LogFormat::Json);
        assert_eq!(config.tasks.batch_size, 4);
        assert_eq!(config.executor_config().restart_delay, Duration::from_secs(2));
        assert_eq!(config.executor_config().port_max_attempts, 20);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/fleet/fleetgrid.redb"));
        let valheim = config.workloads.template(WorkloadKind::Valheim);
        assert_eq!(valheim.start, "./valheim_server -port {port}");
        // Untouched kinds keep the built-ins.
        assert!(config.workloads.template(WorkloadKind::Rust).install.contains("258550"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(DaemonConfig::from_toml_str("[tasks]\nbatch_size = 0\n").is_err());
        assert!(DaemonConfig::from_toml_str("[ports]\nmax_attempts = 0\n").is_err());
        assert!(DaemonConfig::from_toml_str("[cron]\ndefault_timezone = \"Moon/Base\"\n").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = DaemonConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[daemon]"));
        let back = DaemonConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.tasks.servers_root, config.tasks.servers_root);
    }
}
