//! Per-subscriber bookkeeping and the reconciliation state machine states.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use common::fs::FileSystem;

/// Where a subscriber's reconciliation cycle currently stands.
///
/// `Idle -> Polling -> Comparing -> (Idle | Pushing) -> AwaitingAck -> Idle`,
/// with `Error` reachable from any step and backing off to `Idle` after
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubStatus {
    Idle = 0,
    Polling = 1,
    Comparing = 2,
    Pushing = 3,
    AwaitingAck = 4,
    Error = 5,
}

impl SubStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Comparing,
            3 => Self::Pushing,
            4 => Self::AwaitingAck,
            5 => Self::Error,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for SubStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Comparing => "comparing",
            Self::Pushing => "pushing",
            Self::AwaitingAck => "awaiting-ack",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Lock-free live status shared between the fleet loop and the in-flight
/// cycle task, so the status surface sees transitions as they happen.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    pub fn set(&self, status: SubStatus) {
        self.0.store(status as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> SubStatus {
        SubStatus::from_u8(self.0.load(Ordering::Relaxed))
    }
}

/// Static identity of a managed subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSpec {
    pub hostname: String,
    /// RPC address (`host:port`).
    pub address: String,
    pub image_stream: String,
    pub image_leaf: String,
}

/// Controller-side state for one subscriber. The last-known snapshot is
/// exclusively owned here and replaced, never mutated, each cycle.
pub(crate) struct Sub {
    pub spec: SubSpec,
    pub status: StatusCell,
    /// A cycle task is in flight; cycles for one sub never overlap.
    pub busy: bool,
    pub generation: u64,
    pub last_snapshot: Option<Arc<FileSystem>>,
    pub cycles: u64,
    pub error_count: u64,
    pub last_error: String,
}

impl Sub {
    pub fn new(spec: SubSpec) -> Self {
        Self {
            spec,
            status: StatusCell::default(),
            busy: false,
            generation: 0,
            last_snapshot: None,
            cycles: 0,
            error_count: 0,
            last_error: String::new(),
        }
    }

    pub fn report(&self) -> SubReport {
        SubReport {
            hostname: self.spec.hostname.clone(),
            status: self.status.get(),
            generation: self.generation,
            cycles: self.cycles,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
        }
    }
}

/// Status surface entry for one subscriber, consumed by the dashboard
/// collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubReport {
    pub hostname: String,
    pub status: SubStatus,
    pub generation: u64,
    pub cycles: u64,
    pub error_count: u64,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_round_trips_all_states() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), SubStatus::Idle);
        for status in [
            SubStatus::Polling,
            SubStatus::Comparing,
            SubStatus::Pushing,
            SubStatus::AwaitingAck,
            SubStatus::Error,
            SubStatus::Idle,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }
}
