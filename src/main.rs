use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use nimbus_cc::client::HttpNcClient;
use nimbus_cc::logging::{self, LogFormat};
use nimbus_controller::config::CcConfig;
use nimbus_controller::state::{Capabilities, ClusterState};
use nimbus_controller::{checkpoint, monitor};
use nimbus_core::host::ShellTools;
use nimbus_core::vnet::BasicVnet;

#[derive(Parser)]
#[command(
    name = "nimbus-cc",
    version,
    about = "Cluster controller: schedules VMs onto node controllers and tracks fleet state"
)]
struct Cli {
    /// Main configuration file.
    #[arg(long, default_value = "/etc/nimbus/cc.toml")]
    config: PathBuf,

    /// Override configuration file; its keys win over the main file.
    #[arg(long)]
    config_override: Option<PathBuf>,

    /// Emit JSON logs instead of human-readable output.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon.
    Run,
    /// Parse and validate the configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = CcConfig::load(&cli.config, cli.config_override.as_deref())
        .with_context(|| format!("Cannot load configuration from {}", cli.config.display()))?;

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    logging::init(format, &config.log_level);

    match cli.command {
        Commands::CheckConfig => {
            println!(
                "Configuration OK: {} nodes, policy {}, state dir {}",
                config.nodes.len(),
                config.sched_policy,
                config.state_dir.display()
            );
            Ok(())
        }
        Commands::Run => run(config).await,
    }
}

async fn run(config: CcConfig) -> Result<()> {
    info!(
        nodes = config.nodes.len(),
        policy = %config.sched_policy,
        idle_thresh = config.power_idle_thresh_secs,
        wake_thresh = config.power_wake_thresh_secs,
        ws_security = config.enable_ws_security,
        "Configuration loaded"
    );

    let tools = Arc::new(ShellTools);
    let caps = Capabilities {
        nc: Arc::new(HttpNcClient::new()?),
        vnet: Arc::new(BasicVnet::new(tools.clone())),
        tools,
    };

    let state = ClusterState::open(config, caps).await?;
    state.ensure_initialized().await?;

    let monitor_task = tokio::spawn(monitor::run(state.clone()));
    info!("Cluster controller ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    info!("Shutting down");

    monitor_task.abort();
    checkpoint::flush(&state).await?;
    Ok(())
}
