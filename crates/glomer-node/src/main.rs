//! glomer-node - broadcast node over stdin/stdout
//!
//! ## Usage
//!
//! ```bash
//! maelstrom test -w broadcast --bin target/release/glomer-node --node-count 5
//! ```
//!
//! Settings come from an optional JSON config file; flags and environment
//! variables override it.

use std::io;
use std::path::PathBuf;

use clap::Parser;
use glomer_node::{ConfigOverrides, NodeConfig, serve};
use tokio::io::BufReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "glomer-node")]
#[command(about = "Broadcast node speaking newline-delimited JSON over stdio")]
#[command(version)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, env = "GLOMER_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<NodeConfig> {
        let config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };
        Ok(config.apply_overrides(&self.overrides)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log to stderr so stdout is clean for the protocol
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_ansi(false))
        .with(
            EnvFilter::from_default_env()
                .add_directive("glomer_node=info".parse()?)
                .add_directive("glomer_broadcast=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    info!(
        retry_interval_ms = config.retry_interval_ms,
        rpc_timeout_ms = config.rpc_timeout_ms,
        exclude_sender = config.exclude_sender,
        relay_expects_reply = config.relay_expects_reply,
        origin_targets_all_nodes = config.origin_targets_all_nodes,
        "glomer-node starting"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let stats = serve(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &config,
        cancel,
    )
    .await?;

    info!(
        stored_values = stats.stored_values,
        waves = stats.waves(),
        attempts = stats.attempts,
        delivered = stats.delivered,
        abandoned = stats.abandoned,
        cancelled = stats.cancelled,
        "glomer-node stopped"
    );

    // A pending blocking read on stdin would otherwise hold up runtime shutdown
    std::process::exit(0)
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install SIGINT handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received SIGINT, shutting down");
        }
        () = terminate => {
            info!("received SIGTERM, shutting down");
        }
    }
}
