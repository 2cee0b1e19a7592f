//! procraft-server - owns the controllers and serves operators

use anyhow::Result;
use clap::Parser;
use procraft::config::Config;
use procraft::controller::ControllerSet;
use procraft::logging;
use procraft::server::ServerListener;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "procraft-server")]
#[command(about = "procraft server daemon")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Socket path override
    #[arg(long)]
    socket: Option<std::path::PathBuf>,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    logging::init_logging(logging::level_for(&config.general.log_level, cli.verbose))?;

    let controllers = Arc::new(ControllerSet::from_config(&config)?);
    if controllers.is_empty() {
        tracing::warn!("No controllers configured in {}", Config::config_path().display());
    }
    tracing::info!("Starting {} controllers", controllers.len());
    controllers.start();

    let socket = cli.socket.unwrap_or_else(|| config.socket_path());
    let server = ServerListener::new(socket, Arc::clone(&controllers), config.operators.clone());

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    let result = server.run(shutdown_rx).await;
    controllers.shutdown();
    result
}
