//! Update generation and the subscriber RPC wire types.

mod generate;

pub use generate::{generate_update, GeneratedUpdate};

use serde::{Deserialize, Serialize};

use crate::fs::{Inode, RegularInode};
use crate::triggers::Trigger;

/// Full specification for one inode to materialize on the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeSpec {
    Regular(RegularInode),
    Other(Inode),
    Directory { mode: u32, uid: u32, gid: u32 },
}

/// One creation operation: the path to materialize and its inode spec.
/// Covers both brand-new entries and entries whose content or metadata
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeToMake {
    pub path: String,
    pub spec: InodeSpec,
}

/// The minimal patch moving a subscriber from its current snapshot to the
/// target snapshot, plus the triggers that matched the changed paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub inodes_to_make: Vec<InodeToMake>,
    pub paths_to_delete: Vec<String>,
    pub triggers: Vec<Trigger>,
    /// When set the subscriber's reply is waited for synchronously.
    pub wait: bool,
}

impl UpdateRequest {
    /// An empty patch; pushing it would be a wasted RPC.
    pub fn is_noop(&self) -> bool {
        self.inodes_to_make.is_empty() && self.paths_to_delete.is_empty()
    }
}

/// Subscriber reply to an update push. An empty error string means success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub success: bool,
    pub error: String,
}

impl UpdateResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// Request for the subscriber's current snapshot. `have_generation` is the
/// generation the caller already holds; when it is still current the
/// subscriber omits the snapshot from the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollRequest {
    pub have_generation: u64,
}

/// Header record for a poll reply. When `has_snapshot` is set, the encoded
/// [`FileSystem`](crate::fs::FileSystem) follows as a blob (snapshots
/// routinely exceed the record size cap).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub generation: u64,
    pub has_snapshot: bool,
}

/// Live reconfiguration of a subscriber's scanner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigurationRequest {
    pub scan_speed_percent: u64,
    pub network_speed_percent: u64,
    pub scan_exclusion_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetConfigurationResponse {
    pub success: bool,
}
