//! The fleetsync controller.
//!
//! Keeps every configured subscriber converged on its target image by
//! running the poll, compare, push, ack cycle across the fleet.

pub mod config;
pub mod fleet;
pub mod images;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

pub use config::Config;
use fleet::{Fleet, SubReport};
use images::RpcImageFetcher;

/// Build the fleet from configuration and run it until shutdown. Status
/// snapshots are published through the returned watch channel after every
/// pass.
pub async fn run(config: Config, shutdown: watch::Receiver<()>) -> anyhow::Result<()> {
    let triggers = Arc::new(config.triggers()?);
    let image_fetcher = Arc::new(RpcImageFetcher::new(config.image_server_addr.clone()));

    let mut fleet = Fleet::new(config.fleet_config(), image_fetcher, triggers);
    for spec in config.subs.clone() {
        fleet.add_sub(spec);
    }

    let (status_tx, status_rx) = watch::channel(Vec::<SubReport>::new());
    spawn_status_logger(status_rx, shutdown.clone());

    info!(subs = fleet.sub_count(), "controller starting");
    fleet.run(shutdown, Some(status_tx)).await;
    Ok(())
}

/// Periodic summary for the status collaborator: error counters and last
/// errors never disappear silently.
fn spawn_status_logger(
    mut status_rx: watch::Receiver<Vec<SubReport>>,
    mut shutdown: watch::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let reports = status_rx.borrow_and_update().clone();
                    let errors: u64 = reports.iter().map(|r| r.error_count).sum();
                    tracing::debug!(subs = reports.len(), errors, "fleet pass complete");
                    for report in reports.iter().filter(|r| !r.last_error.is_empty()) {
                        tracing::debug!(
                            sub = %report.hostname,
                            status = %report.status,
                            error_count = report.error_count,
                            last_error = %report.last_error,
                            "subscriber error state"
                        );
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}
