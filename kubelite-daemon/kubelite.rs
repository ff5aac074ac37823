//! Sync the topology index, then keep it current until interrupted
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kubelite::{Config, Registry, ResourceKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Mirror cluster topology into memory and keep it current
#[derive(Parser, Debug)]
#[command(name = "kubelite", version)]
struct Args {
    /// YAML file with tuning overrides
    #[arg(long, env = "KUBELITE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let client = kubelite::client::connect()
        .await
        .context("failed to build an apiserver client")?;
    let registry = Registry::from_client(client, config);
    let token = CancellationToken::new();

    let started = Instant::now();
    let baseline = registry.sync(&token).await.context("initial sync failed")?;
    let index = registry.index();
    info!(
        elapsed = ?started.elapsed(),
        nodes = index.len(ResourceKind::Node),
        pods = index.len(ResourceKind::Pod),
        services = index.len(ResourceKind::Service),
        endpoints = index.len(ResourceKind::Endpoints),
        "starting watches"
    );
    let watches = registry.start(baseline, token);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    watches.shutdown().await;
    Ok(())
}
