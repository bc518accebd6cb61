//! The fleetsync subscriber daemon.
//!
//! Wires the perpetual scanner, the local object cache and the RPC surface
//! together. The scanner produces snapshots into a single-slot mailbox; a
//! consumer task installs them into the shared state the `Subscriber.Poll`
//! handler serves from.

pub mod apply;
pub mod config;
pub mod fsbench;
pub mod rpc;
pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tokio::sync::watch::Receiver as WatchReceiver;
use tracing::info;

use common::srpc::{Registry, Server};
use object_store::rpc::ObjectClient;
use object_store::LocalStore;

pub use config::Config;
use config::SharedSettings;
use rpc::AgentState;
use scanner::{start_scan_loop, ScanLoopConfig};

/// Run the agent until the shutdown signal fires.
pub async fn run(config: Config, shutdown: WatchReceiver<()>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .context("creating state directory")?;
    let cache = LocalStore::open(&config.state_dir.join("objects"))
        .await
        .context("opening object cache")?;

    let device_speed = fsbench::cached_speed(&config.root_dir, &config.state_dir)
        .await
        .context("measuring device speed")?;
    info!(
        bytes_per_second = device_speed.bytes_per_second,
        blocks_per_second = device_speed.blocks_per_second,
        "device speed"
    );

    let settings: SharedSettings = Arc::new(RwLock::new(config.scan_settings()?));
    let remote = ObjectClient::new(config.object_server_addr.clone());
    let state = Arc::new(AgentState::new(
        config.root_dir.clone(),
        cache,
        Some(remote),
        settings.clone(),
    ));

    let mailbox = start_scan_loop(
        ScanLoopConfig {
            root_dir: config.root_dir.clone(),
            device_speed,
            min_interval: Duration::from_secs(config.min_scan_interval_secs),
        },
        settings,
        shutdown.clone(),
    );
    let consumer_state = state.clone();
    tokio::spawn(async move {
        while let Ok(outcome) = mailbox.recv_async().await {
            consumer_state.install_snapshot(outcome);
        }
    });

    let mut registry = Registry::new();
    rpc::register_service(&mut registry, state);
    let server = Server::bind(config.listen_addr, Arc::new(registry))
        .await
        .context("binding rpc listener")?;
    info!(addr = %server.local_addr()?, "agent listening");
    server.serve(shutdown).await?;
    Ok(())
}
