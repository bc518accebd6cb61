use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleetsync-controller", about = "fleetsync fleet controller")]
struct Args {
    /// Path to the controller config file.
    #[arg(long, env = "FLEETSYNC_CONTROLLER_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = controller::Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    controller::run(config, shutdown_rx).await
}
