//! Post-update trigger rules.
//!
//! A trigger names a corrective action (typically a service restart) and a
//! list of anchored path patterns. When an update is generated, every
//! trigger whose patterns match any changed path is shipped with the patch
//! so the subscriber can run the action after applying it.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("cannot read trigger file {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed trigger rules: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("trigger {name:?} has invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        name: String,
        pattern: String,
        source: regex::Error,
    },
}

/// One named trigger rule. The wire form carries the patterns so the
/// subscriber can log what fired; matching happens on the controller side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub match_patterns: Vec<String>,
    /// Service to restart when the trigger fires. Empty means the trigger
    /// is informational only.
    #[serde(default)]
    pub service: String,
    /// High-impact triggers are surfaced more loudly by the subscriber.
    #[serde(default)]
    pub high_impact: bool,
}

/// A compiled trigger set. Patterns are anchored, like scan exclusions.
#[derive(Debug, Default)]
pub struct Triggers {
    triggers: Vec<Trigger>,
    compiled: Vec<Vec<Regex>>,
}

impl Triggers {
    pub fn new(triggers: Vec<Trigger>) -> Result<Self, TriggerError> {
        let mut compiled = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            let mut regexes = Vec::with_capacity(trigger.match_patterns.len());
            for pattern in &trigger.match_patterns {
                let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                    TriggerError::InvalidPattern {
                        name: trigger.name.clone(),
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
                regexes.push(regex);
            }
            compiled.push(regexes);
        }
        Ok(Self { triggers, compiled })
    }

    /// Load rules from a JSON file.
    pub fn load(path: &Path) -> Result<Self, TriggerError> {
        let data = std::fs::read_to_string(path).map_err(|source| TriggerError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::decode(&data)
    }

    /// Decode rules from an inline JSON string.
    pub fn decode(data: &str) -> Result<Self, TriggerError> {
        let triggers: Vec<Trigger> = serde_json::from_str(data)?;
        Self::new(triggers)
    }

    /// The subset of triggers whose patterns match any changed path,
    /// in rule order.
    pub fn matched(&self, changed_paths: &[String]) -> Vec<Trigger> {
        self.triggers
            .iter()
            .zip(&self.compiled)
            .filter(|(_, regexes)| {
                changed_paths
                    .iter()
                    .any(|path| regexes.iter().any(|regex| regex.is_match(path)))
            })
            .map(|(trigger, _)| trigger.clone())
            .collect()
    }

    pub fn rules(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
