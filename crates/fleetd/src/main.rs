//! fleetd: the fleetgrid daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd --config /etc/fleetgrid/fleetd.toml run
//! fleetd cron-preview "30 4 * * 1-5" --timezone Europe/Berlin
//! fleetd print-config
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetd::{DaemonConfig, LogFormat};

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleetgrid game-server fleet daemon")]
struct Cli {
    /// Path to fleetd.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `[daemon] log_format`.
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane: API, task runner, cron and agent sweep.
    Run {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a cron expression and print its next runs.
    CronPreview {
        expression: String,

        #[arg(long, default_value = "UTC")]
        timezone: String,

        #[arg(long, default_value = "5")]
        count: usize,
    },
    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.daemon.log_format = format;
    }

    match cli.command {
        Command::Run { listen, data_dir } => {
            if let Some(listen) = listen {
                config.daemon.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.daemon.data_dir = data_dir;
            }
            fleetd::init_tracing(config.daemon.log_format);
            fleetd::run_control_plane(config).await
        }
        Command::CronPreview {
            expression,
            timezone,
            count,
        } => {
            for line in fleetd::cron_preview(&expression, &timezone, count, chrono::Utc::now())? {
                println!("{line}");
            }
            Ok(())
        }
        Command::PrintConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
