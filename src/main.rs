//! fleet-edge - on-vehicle telemetry edge agent
//!
//! Runs the edge agent: campaign-driven signal collection with
//! store-and-forward persistence and object storage forwarding.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration search order
//! fleet-edge
//!
//! # Run with an explicit config file
//! fleet-edge --config /etc/fleet-edge.toml
//! ```
//!
//! # Environment Variables
//!
//! - `FLEET_EDGE_CONFIG`: Path to the TOML configuration file
//! - `RUST_LOG`: Logging level (default: info)
//!
//! Exit code 0 on normal shutdown, non-zero on startup failure. SIGUSR1
//! triggers the same graceful shutdown sequence as Ctrl-C; it is also
//! raised internally when an invariant failure permits a controlled exit.

use anyhow::{Context, Result};
use clap::Parser;
use fleet_edge::agent::{Agent, NullFrameSink};
use fleet_edge::config::AgentConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "fleet-edge")]
#[command(about = "On-vehicle telemetry edge agent")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML configuration file; overrides the search order
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        let detail = format!("{e:#}");
        error!(error = %detail, "Startup failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();

    let config = match &args.config {
        Some(path) => AgentConfig::load_from_file(path)
            .with_context(|| format!("could not load config from {}", path.display()))?,
        None => AgentConfig::load(),
    };

    let agent = Agent::start(&config, Arc::new(NullFrameSink), None)?;

    let mut sigusr1 =
        signal(SignalKind::user_defined1()).context("could not install SIGUSR1 handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = sigusr1.recv() => {
            info!("Received SIGUSR1, initiating graceful fatal shutdown");
        }
    }

    agent.shutdown().await;
    Ok(())
}
