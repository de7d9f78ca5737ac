// MIST broker daemon
//
// Owns the broker socket: agents register here, UI clients query the
// catalog, send commands and call the built-in services.

use anyhow::{bail, Context, Result};
use clap::Parser;
use mist_broker::{lifecycle, Broker};
use mist_config::MistConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mist-broker")]
#[command(about = "MIST broker - routes agent commands and hosts built-in services")]
#[command(version)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/mist/config.toml)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Socket path, overriding config and MIST_SOCKET
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    let mut config = MistConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(socket) = cli.socket {
        config.socket_path = Some(socket);
    }
    let paths = config.paths();
    let socket = paths.socket_path();
    let pid_file = paths.pid_file();

    if lifecycle::is_running_at(&pid_file) {
        bail!("broker already running (pid file {})", pid_file.display());
    }

    info!("Starting MIST broker v{}", env!("CARGO_PKG_VERSION"));

    let broker = Arc::new(Broker::from_config(&config));
    let server = broker
        .bind(&socket, config.broker.socket_mode)
        .await
        .with_context(|| format!("failed to bind {}", socket.display()))?;
    lifecycle::write_pid_file(&pid_file)?;

    let handle = server.start();
    info!(socket = %socket.display(), "broker ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
    }
    info!("shutting down");

    handle.stop().await;
    lifecycle::remove_pid_file(&pid_file);
    info!("broker stopped");
    Ok(())
}
