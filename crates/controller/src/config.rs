//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::triggers::{TriggerError, Triggers};

use crate::fleet::{FleetConfig, SubSpec};

pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_FD_LIMIT: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed config: {0}")]
    Malformed(#[from] toml::de::Error),
    #[error("triggers_file and triggers_inline are mutually exclusive")]
    AmbiguousTriggers,
    #[error(transparent)]
    Triggers(#[from] TriggerError),
    #[error("no subscribers configured")]
    NoSubs,
}

fn default_min_interval_secs() -> u64 {
    DEFAULT_MIN_INTERVAL_SECS
}

fn default_fd_limit() -> usize {
    DEFAULT_FD_LIMIT
}

fn default_wait_for_ack() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the image server.
    pub image_server_addr: String,
    /// Address of the object server required objects are checked against.
    pub object_server_addr: Option<String>,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_fd_limit")]
    pub fd_limit: usize,
    #[serde(default = "default_wait_for_ack")]
    pub wait_for_ack: bool,
    /// Trigger rules: a JSON file path, or the same document inline.
    /// Exactly one form is honored.
    pub triggers_file: Option<PathBuf>,
    pub triggers_inline: Option<String>,
    #[serde(default)]
    pub subs: Vec<SubSpec>,
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

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.triggers_file.is_some() && self.triggers_inline.is_some() {
            return Err(ConfigError::AmbiguousTriggers);
        }
        if self.subs.is_empty() {
            return Err(ConfigError::NoSubs);
        }
        // Compile triggers now; bad rules refuse to start the process.
        self.triggers()?;
        Ok(())
    }

    /// The compiled trigger set from whichever form was supplied.
    pub fn triggers(&self) -> Result<Triggers, ConfigError> {
        match (&self.triggers_file, &self.triggers_inline) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousTriggers),
            (Some(path), None) => Ok(Triggers::load(path)?),
            (None, Some(inline)) => Ok(Triggers::decode(inline)?),
            (None, None) => Ok(Triggers::default()),
        }
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            min_interval: Duration::from_secs(self.min_interval_secs),
            fd_limit: self.fd_limit,
            wait_for_ack: self.wait_for_ack,
            object_server_addr: self.object_server_addr.clone(),
        }
    }
}
