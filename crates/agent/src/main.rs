use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleetsync-agent", about = "fleetsync subscriber daemon")]
struct Args {
    /// Path to the agent config file.
    #[arg(long, env = "FLEETSYNC_AGENT_CONFIG")]
    config: Option<PathBuf>,
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "fleetsync")
        .map(|dirs| dirs.config_dir().join("agent.toml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(default_config_path)
        .context("no config path given and no default location available")?;
    let config = agent::Config::load(&config_path)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    agent::run(config, shutdown_rx).await
}
