//! procraft - operator client for shared console sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use procraft::client::Client;
use procraft::config::Config;
use procraft::logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "procraft")]
#[command(about = "Attach to and drive shared console sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket path override
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Operator name (defaults to $USER)
    #[arg(short, long, env = "PROCRAFT_OPERATOR")]
    operator: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List the controllers you may use
    List,
    /// Mirror a controller on this terminal (Ctrl-] detaches)
    Attach {
        /// Controller name
        name: String,
    },
    /// Queue a command on a controller
    Run {
        /// Controller name
        name: String,
        /// Command line to send
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Connect a controller whose session has closed
    Reconnect {
        /// Controller name
        name: String,
    },
    /// Stop the server
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    logging::init_logging(logging::level_for("warn", cli.verbose))?;

    let socket = cli.socket.clone().unwrap_or_else(|| config.socket_path());
    let operator = match cli.operator.clone() {
        Some(name) => name,
        None => std::env::var("USER").context("No --operator given and $USER is unset")?,
    };

    let mut client = Client::connect(&socket, &operator).await?;

    match cli.command {
        Commands::List => {
            let controllers = client.list().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&controllers)?);
            } else if controllers.is_empty() {
                println!("No controllers available");
            } else {
                println!("{:<16} {:<13} {:>6} {:>7}", "NAME", "STATE", "QUEUED", "VIEWERS");
                for c in controllers {
                    println!("{:<16} {:<13} {:>6} {:>7}", c.name, c.state.as_str(), c.queued, c.viewers);
                }
            }
        }
        Commands::Attach { name } => {
            tracing::info!("Attaching to controller: {}", name);
            client.attach_interactive(&name).await?;
        }
        Commands::Run { name, command } => {
            client.run(&name, &command.join(" ")).await?;
            println!("Queued on '{}'", name);
        }
        Commands::Reconnect { name } => {
            client.reconnect(&name).await?;
            println!("Reconnecting '{}'", name);
        }
        Commands::Shutdown => {
            client.shutdown().await?;
            println!("Server shutting down");
        }
    }

    Ok(())
}
