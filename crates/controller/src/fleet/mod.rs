//! The fleet controller's scheduler.
//!
//! One cooperative loop multiplexes every subscriber: each tick drains all
//! ready cycle results (non-blocking) before starting new polling work, so
//! a backlog of completions is always serviced first, then starts at most
//! one new cycle and advances the rotation. After a full pass with no
//! ready work the loop sleeps out the remainder of the minimum cycle
//! interval. Cycles for one subscriber never overlap; fleet-wide
//! concurrency is bounded by the connection-slot semaphore sized from the
//! file-descriptor ceiling.

mod cycle;
mod sub;

pub use cycle::{run_cycle, CycleContext, CycleError, CycleOutcome, CycleResult};
pub use sub::{StatusCell, SubReport, SubSpec, SubStatus};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::fs::FileSystem;
use common::triggers::Triggers;
use object_store::rpc::ObjectClient;

use crate::images::ImageFetcher;
use sub::Sub;

#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Minimum interval between scheduler passes over the fleet.
    pub min_interval: Duration,
    /// Open file-descriptor ceiling; bounds concurrent outstanding
    /// connection attempts across the whole fleet.
    pub fd_limit: usize,
    /// Request a synchronous acknowledgment for every push.
    pub wait_for_ack: bool,
    /// Object server consulted before a push to confirm required content
    /// is fetchable. `None` skips the check.
    pub object_server_addr: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            fd_limit: 256,
            wait_for_ack: true,
            object_server_addr: None,
        }
    }
}

pub struct Fleet {
    config: FleetConfig,
    subs: Vec<Sub>,
    cursor: usize,
    image_fetcher: Arc<dyn ImageFetcher>,
    /// Target snapshots cached per (stream, leaf); image freshness is the
    /// builder's concern.
    image_cache: HashMap<(String, String), Arc<FileSystem>>,
    triggers: Arc<Triggers>,
    connection_slots: Arc<Semaphore>,
    results_tx: flume::Sender<CycleResult>,
    results_rx: flume::Receiver<CycleResult>,
}

impl Fleet {
    pub fn new(
        config: FleetConfig,
        image_fetcher: Arc<dyn ImageFetcher>,
        triggers: Arc<Triggers>,
    ) -> Self {
        let connection_slots = Arc::new(Semaphore::new(config.fd_limit.max(1)));
        let (results_tx, results_rx) = flume::unbounded();
        Self {
            config,
            subs: Vec::new(),
            cursor: 0,
            image_fetcher,
            image_cache: HashMap::new(),
            triggers,
            connection_slots,
            results_tx,
            results_rx,
        }
    }

    /// Add a subscriber, or update the spec of an existing one in place.
    pub fn add_sub(&mut self, spec: SubSpec) {
        match self
            .subs
            .iter_mut()
            .find(|sub| sub.spec.hostname == spec.hostname)
        {
            Some(existing) => existing.spec = spec,
            None => self.subs.push(Sub::new(spec)),
        }
    }

    /// Replace fleet membership. Kept subscribers retain their state;
    /// removed ones are dropped (an in-flight result for a removed sub is
    /// discarded on arrival).
    pub fn update_subs(&mut self, specs: Vec<SubSpec>) {
        let mut next = Vec::with_capacity(specs.len());
        for spec in specs {
            match self
                .subs
                .iter()
                .position(|sub| sub.spec.hostname == spec.hostname)
            {
                Some(index) => {
                    let mut sub = self.subs.swap_remove(index);
                    sub.spec = spec;
                    next.push(sub);
                }
                None => next.push(Sub::new(spec)),
            }
        }
        self.subs = next;
        self.cursor = 0;
    }

    pub fn sub_count(&self) -> usize {
        self.subs.len()
    }

    /// Status surface: one report per subscriber.
    pub fn status(&self) -> Vec<SubReport> {
        self.subs.iter().map(Sub::report).collect()
    }

    /// Apply every ready cycle result without blocking. Returns how many
    /// were drained.
    pub fn drain_results(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(result) = self.results_rx.try_recv() {
            self.apply_result(result);
            drained += 1;
        }
        drained
    }

    fn apply_result(&mut self, result: CycleResult) {
        let Some(sub) = self
            .subs
            .iter_mut()
            .find(|sub| sub.spec.hostname == result.hostname)
        else {
            debug!(sub = %result.hostname, "result for removed subscriber discarded");
            return;
        };
        sub.busy = false;
        sub.cycles += 1;
        sub.generation = result.generation;
        if let Some(snapshot) = result.snapshot {
            sub.last_snapshot = Some(snapshot);
        }
        match result.outcome {
            Ok(CycleOutcome::Unchanged) => {
                sub.status.set(SubStatus::Idle);
            }
            Ok(CycleOutcome::InSync) => {
                debug!(sub = %sub.spec.hostname, "in sync");
                sub.status.set(SubStatus::Idle);
            }
            Ok(CycleOutcome::Pushed {
                creations,
                deletions,
                acked,
            }) => {
                info!(
                    sub = %sub.spec.hostname,
                    creations,
                    deletions,
                    acked,
                    "update pushed"
                );
                sub.status.set(SubStatus::Idle);
            }
            Err(err) => {
                sub.status.set(SubStatus::Error);
                sub.error_count += 1;
                sub.last_error = err.to_string();
                warn!(sub = %sub.spec.hostname, error = %err, "cycle failed");
                // Error backs off to Idle; the next pass retries.
                sub.status.set(SubStatus::Idle);
            }
        }
    }

    /// Start a cycle for the subscriber at the rotation cursor (when it is
    /// not already busy) and advance. Returns true when the pass wrapped
    /// around the whole fleet.
    pub async fn poll_next_sub(&mut self) -> bool {
        if self.subs.is_empty() {
            return true;
        }
        let index = self.cursor;
        self.cursor += 1;
        let wrapped = if self.cursor >= self.subs.len() {
            self.cursor = 0;
            true
        } else {
            false
        };
        if !self.subs[index].busy {
            self.start_cycle(index).await;
        }
        wrapped
    }

    async fn start_cycle(&mut self, index: usize) {
        let spec = self.subs[index].spec.clone();
        let key = (spec.image_stream.clone(), spec.image_leaf.clone());
        let target = match self.image_cache.get(&key) {
            Some(target) => target.clone(),
            None => {
                match self
                    .image_fetcher
                    .get_target_snapshot(&spec.image_stream, &spec.image_leaf)
                    .await
                {
                    Ok(target) => {
                        self.image_cache.insert(key, target.clone());
                        target
                    }
                    Err(err) => {
                        warn!(sub = %spec.hostname, error = %err, "target image unavailable");
                        let sub = &mut self.subs[index];
                        sub.error_count += 1;
                        sub.last_error = err.to_string();
                        return;
                    }
                }
            }
        };

        let triggers = self.triggers.clone();
        let object_client = self
            .config
            .object_server_addr
            .as_ref()
            .map(|addr| ObjectClient::new(addr.clone()));
        let wait_for_ack = self.config.wait_for_ack;
        let slots = self.connection_slots.clone();
        let results = self.results_tx.clone();

        let sub = &mut self.subs[index];
        sub.busy = true;
        let context = CycleContext {
            hostname: spec.hostname,
            address: spec.address,
            target,
            have_generation: sub.generation,
            last_snapshot: sub.last_snapshot.clone(),
            triggers,
            object_client,
            wait_for_ack,
            status: sub.status.clone(),
        };
        tokio::spawn(async move {
            // The connection-slot permit is held for the whole cycle, so
            // fleet-wide outstanding connections stay under the fd ceiling
            // even during a fleet-wide outage.
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            let result = run_cycle(context).await;
            let _ = results.send_async(result).await;
        });
    }

    /// Drive the fleet until shutdown. `status_tx` receives a fresh status
    /// snapshot after every full pass.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<()>,
        status_tx: Option<watch::Sender<Vec<SubReport>>>,
    ) {
        info!(subs = self.subs.len(), "fleet loop starting");
        let results = self.results_rx.clone();
        let mut pass_started = Instant::now();
        let mut pass_had_work = false;
        loop {
            if shutdown.has_changed().unwrap_or(true) {
                info!("fleet loop shutting down");
                return;
            }
            if self.drain_results() > 0 {
                pass_had_work = true;
            }
            let wrapped = self.poll_next_sub().await;
            if !wrapped {
                continue;
            }
            if let Some(tx) = &status_tx {
                let _ = tx.send(self.status());
            }
            if !pass_had_work {
                let sleep_for = self
                    .config
                    .min_interval
                    .saturating_sub(pass_started.elapsed());
                if !sleep_for.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        result = results.recv_async() => {
                            // Ready work ends the idle sleep immediately.
                            if let Ok(result) = result {
                                self.apply_result(result);
                            }
                        }
                        _ = shutdown.changed() => {
                            info!("fleet loop shutting down");
                            return;
                        }
                    }
                }
            }
            pass_started = Instant::now();
            pass_had_work = false;
        }
    }
}
