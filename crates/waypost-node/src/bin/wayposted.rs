//! Waypost node daemon.
//!
//! Loads a TOML config, starts the node, and logs delivered payloads until
//! killed.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use waypost_node::{start, Config};

/// Waypost BPv7 store-and-forward node.
#[derive(Parser, Debug)]
#[command(name = "wayposted", about = "Waypost BPv7 node daemon")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(long, default_value = "waypost.toml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `waypost_cache=debug`.
    #[arg(long)]
    log: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let node = start(config).context("starting node")?;

    loop {
        if let Some(delivered) = node.recv_delivered(Duration::from_secs(5)) {
            info!(
                source = %delivered.source,
                len = delivered.payload.len(),
                "bundle delivered"
            );
        }
    }
}


