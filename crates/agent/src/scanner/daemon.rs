//! The perpetual scan cycle.
//!
//! Produce one snapshot, hand it off through a single-slot mailbox, sleep
//! out the remainder of the minimum interval, repeat. The mailbox never
//! blocks the producer: a stale unconsumed snapshot is replaced by the
//! newer one. An idle cycle ends with an explicit memory-reclaim point
//! before the sleep.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch::Receiver as WatchReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::SharedSettings;
use crate::fsbench::DeviceSpeed;

use super::{scan, ScanOutcome};

#[derive(Debug, Clone)]
pub struct ScanLoopConfig {
    pub root_dir: PathBuf,
    pub device_speed: DeviceSpeed,
    pub min_interval: Duration,
}

/// Spawn the scan loop. Returns the mailbox the consumer polls; it holds at
/// most one outcome, always the newest.
pub fn start_scan_loop(
    config: ScanLoopConfig,
    settings: SharedSettings,
    shutdown: WatchReceiver<()>,
) -> flume::Receiver<Arc<ScanOutcome>> {
    let (tx, rx) = flume::bounded(1);
    let mailbox = rx.clone();
    tokio::spawn(run_loop(config, settings, tx, mailbox, shutdown));
    rx
}

async fn run_loop(
    config: ScanLoopConfig,
    settings: SharedSettings,
    tx: flume::Sender<Arc<ScanOutcome>>,
    mailbox: flume::Receiver<Arc<ScanOutcome>>,
    mut shutdown: WatchReceiver<()>,
) {
    let mut cycle: u64 = 0;
    loop {
        let started = Instant::now();

        // Snapshot the hot settings at the start of each cycle; they are
        // the only input SetConfiguration can change underneath us.
        let (filter, mut limiter, scan_percent) = {
            let settings = settings.read();
            let limiter = common::rateio::RateContext::new(
                config.device_speed.bytes_per_second,
                config.device_speed.blocks_per_second,
                settings.scan_speed_percent,
            )
            .limiter();
            (
                settings.filter.clone(),
                limiter,
                settings.scan_speed_percent,
            )
        };

        debug!(cycle, scan_percent, "starting scan cycle");
        let outcome = tokio::select! {
            outcome = scan(&config.root_dir, &filter, &mut limiter) => outcome,
            _ = shutdown.changed() => {
                info!("scan loop shutting down");
                return;
            }
        };

        match outcome {
            Ok(outcome) => {
                info!(
                    cycle,
                    inodes = outcome.file_system.inode_count(),
                    warnings = outcome.warnings.len(),
                    "scan cycle complete"
                );
                deliver(&tx, &mailbox, Arc::new(outcome));
            }
            Err(err) => {
                // Fatal for this cycle only; the previous good snapshot in
                // the mailbox (or already consumed) stays valid.
                error!(cycle, error = %err, "scan cycle failed");
            }
        }
        cycle += 1;

        let elapsed = started.elapsed();
        if elapsed < config.min_interval {
            // Idle time this cycle: an opportune moment to return memory
            // before sleeping.
            reclaim();
            tokio::select! {
                _ = tokio::time::sleep(config.min_interval - elapsed) => {}
                _ = shutdown.changed() => {
                    info!("scan loop shutting down");
                    return;
                }
            }
        }
    }
}

/// Replace rather than block: drop a stale unconsumed snapshot so the
/// mailbox always holds the newest one and the producer never waits.
fn deliver(
    tx: &flume::Sender<Arc<ScanOutcome>>,
    mailbox: &flume::Receiver<Arc<ScanOutcome>>,
    outcome: Arc<ScanOutcome>,
) {
    let mut outcome = outcome;
    loop {
        match tx.try_send(outcome) {
            Ok(()) => return,
            Err(flume::TrySendError::Full(back)) => {
                let _ = mailbox.try_recv();
                outcome = back;
            }
            Err(flume::TrySendError::Disconnected(_)) => return,
        }
    }
}

/// Amortized cleanup point between cycles. Scan allocations are dropped by
/// then; shrinking the thread-local allocator caches is left to the
/// allocator itself.
fn reclaim() {
    debug!("idle cycle, reclaim opportunity");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanSettings;
    use parking_lot::RwLock;

    fn test_settings() -> SharedSettings {
        Arc::new(RwLock::new(ScanSettings {
            filter: common::filter::Filter::new(Vec::<String>::new()).unwrap(),
            scan_speed_percent: 100,
            network_speed_percent: 100,
        }))
    }

    #[tokio::test]
    async fn delivers_snapshots_and_replaces_stale_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"contents").unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
        let rx = start_scan_loop(
            ScanLoopConfig {
                root_dir: dir.path().to_path_buf(),
                device_speed: DeviceSpeed {
                    bytes_per_second: 0,
                    blocks_per_second: 0,
                },
                min_interval: Duration::from_millis(10),
            },
            test_settings(),
            shutdown_rx,
        );

        // The producer keeps cycling without a consumer; the mailbox always
        // holds at most one, newest-first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.len() <= 1);
        let newest = rx.recv_async().await.unwrap();
        assert_eq!(newest.file_system.regular_inode_count(), 1);

        shutdown_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
        let rx = start_scan_loop(
            ScanLoopConfig {
                root_dir: dir.path().to_path_buf(),
                device_speed: DeviceSpeed {
                    bytes_per_second: 0,
                    blocks_per_second: 0,
                },
                min_interval: Duration::from_secs(3600),
            },
            test_settings(),
            shutdown_rx,
        );
        // First snapshot arrives, then the loop parks on its interval.
        let _ = rx.recv_async().await.unwrap();
        shutdown_tx.send(()).unwrap();
        // The loop exits; the sender side drops and the channel closes.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.is_disconnected() || rx.try_recv().is_err());
    }
}
