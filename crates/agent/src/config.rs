//! Agent configuration: startup values loaded from TOML plus the
//! hot-reloadable scan settings.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use common::filter::{Filter, FilterError};

/// Exclusions applied when a config supplies none: paths whose churn is
/// expected and must not count as drift.
pub const DEFAULT_SCAN_EXCLUDE_LIST: &[&str] = &[
    "/tmp/.*",
    "/var/log/.*",
    "/var/mail/.*",
    "/var/spool/.*",
    "/var/tmp/.*",
];

pub const DEFAULT_SCAN_SPEED_PERCENT: u64 = 2;
pub const DEFAULT_NETWORK_SPEED_PERCENT: u64 = 10;
pub const DEFAULT_MIN_SCAN_INTERVAL_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Malformed(#[from] toml::de::Error),
    #[error("root directory {0} does not exist")]
    MissingRootDir(PathBuf),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

fn default_scan_speed_percent() -> u64 {
    DEFAULT_SCAN_SPEED_PERCENT
}

fn default_network_speed_percent() -> u64 {
    DEFAULT_NETWORK_SPEED_PERCENT
}

fn default_min_scan_interval_secs() -> u64 {
    DEFAULT_MIN_SCAN_INTERVAL_SECS
}

fn default_exclude_list() -> Vec<String> {
    DEFAULT_SCAN_EXCLUDE_LIST
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Startup configuration for the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the directory tree to manage.
    pub root_dir: PathBuf,
    /// Private state directory: object cache, device-speed cache.
    pub state_dir: PathBuf,
    /// Address to listen on for RPC.
    pub listen_addr: SocketAddr,
    /// Address of the object server to pull missing content from.
    pub object_server_addr: String,
    #[serde(default = "default_scan_speed_percent")]
    pub scan_speed_percent: u64,
    #[serde(default = "default_network_speed_percent")]
    pub network_speed_percent: u64,
    #[serde(default = "default_exclude_list")]
    pub scan_exclude_list: Vec<String>,
    #[serde(default = "default_min_scan_interval_secs")]
    pub min_scan_interval_secs: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; failures here refuse to run the process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.root_dir.is_dir() {
            return Err(ConfigError::MissingRootDir(self.root_dir.clone()));
        }
        // Compile once so a bad pattern is caught before any cycle runs.
        Filter::new(&self.scan_exclude_list)?;
        Ok(())
    }

    pub fn scan_settings(&self) -> Result<ScanSettings, ConfigError> {
        Ok(ScanSettings {
            filter: Filter::new(&self.scan_exclude_list)?,
            scan_speed_percent: self.scan_speed_percent,
            network_speed_percent: self.network_speed_percent,
        })
    }
}

/// The hot-reloadable part of the configuration. Replaced wholesale by the
/// SetConfiguration RPC under a single-writer lock; the scanner snapshots
/// it at the start of every throttling decision.
#[derive(Debug)]
pub struct ScanSettings {
    pub filter: Filter,
    pub scan_speed_percent: u64,
    pub network_speed_percent: u64,
}

pub type SharedSettings = Arc<RwLock<ScanSettings>>;
