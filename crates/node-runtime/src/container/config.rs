//! # Node Configuration
//!
//! Runtime parameters for the local committee.
//!
//! ## Sources
//!
//! 1. Built-in defaults
//! 2. JSON file named by `HOTSTUFF_CONFIG` (every field optional)
//! 3. `HOTSTUFF_*` environment variables, which win over the file

use hotstuff_consensus::{ConsensusConfig, TimingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG_FILE: &str = "HOTSTUFF_CONFIG";
pub const ENV_VALIDATORS: &str = "HOTSTUFF_VALIDATORS";
pub const ENV_DATA_DIR: &str = "HOTSTUFF_DATA_DIR";
pub const ENV_RESET_WAL: &str = "HOTSTUFF_RESET_WAL";
pub const ENV_KEY_SEED: &str = "HOTSTUFF_KEY_SEED";
pub const ENV_ROUND_TIMEOUT_MS: &str = "HOTSTUFF_ROUND_TIMEOUT_MS";
pub const ENV_ROUND_TIMEOUT_INTERVAL_MS: &str = "HOTSTUFF_ROUND_TIMEOUT_INTERVAL_MS";
pub const ENV_PAYLOAD_SIZE: &str = "HOTSTUFF_PAYLOAD_SIZE";
pub const ENV_STATUS_INTERVAL_SECS: &str = "HOTSTUFF_STATUS_INTERVAL_SECS";
pub const ENV_LOG: &str = "HOTSTUFF_LOG";

/// Complete node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Committee configuration.
    pub committee: CommitteeConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Consensus tuning.
    pub consensus: ConsensusSettings,
    /// Runtime behaviour.
    pub runtime: RuntimeConfig,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} has invalid value {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("committee needs at least one validator")]
    EmptyCommittee,

    #[error("round timeout must be positive")]
    ZeroRoundTimeout,

    #[error("key seed must not be empty")]
    EmptyKeySeed,
}

impl NodeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Load through `lookup`, which resolves a variable name to its value.
    pub fn load<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_FILE) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env<F>(&mut self, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_var(lookup, ENV_VALIDATORS)? {
            self.committee.validators = n;
        }
        if let Some(seed) = lookup(ENV_KEY_SEED) {
            self.committee.key_seed = seed;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(reset) = parse_var(lookup, ENV_RESET_WAL)? {
            self.storage.reset_wal = reset;
        }
        if let Some(ms) = parse_var(lookup, ENV_ROUND_TIMEOUT_MS)? {
            self.consensus.round_timeout_ms = ms;
        }
        if let Some(ms) = parse_var(lookup, ENV_ROUND_TIMEOUT_INTERVAL_MS)? {
            self.consensus.round_timeout_interval_ms = ms;
        }
        if let Some(size) = parse_var(lookup, ENV_PAYLOAD_SIZE)? {
            self.runtime.payload_size = size;
        }
        if let Some(secs) = parse_var(lookup, ENV_STATUS_INTERVAL_SECS)? {
            self.runtime.status_interval_secs = secs;
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.runtime.log_level = level;
        }
        Ok(())
    }

    /// Reject settings the committee cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.committee.validators == 0 {
            return Err(ConfigError::EmptyCommittee);
        }
        if self.consensus.round_timeout_ms == 0 {
            return Err(ConfigError::ZeroRoundTimeout);
        }
        if self.committee.key_seed.is_empty() {
            return Err(ConfigError::EmptyKeySeed);
        }
        Ok(())
    }

    /// Engine configuration for the validator called `node_id`.
    pub fn consensus_config(&self, node_id: &str) -> ConsensusConfig {
        let mut config = ConsensusConfig::for_node(node_id);
        config.timing = self.consensus.timing();
        config.max_pruned_size = self.consensus.max_pruned_size;
        config.channel_capacity = self.consensus.channel_capacity;
        config.wal_truncate_interval = self.consensus.wal_truncate_interval;
        config
    }

    /// WAL file of the validator called `node_id`.
    pub fn wal_path(&self, node_id: &str) -> PathBuf {
        self.storage.data_dir.join(node_id).join("consensus.wal")
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

/// Committee configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitteeConfig {
    /// Number of validators run in this process.
    pub validators: u64,
    /// Secret mixed into every validator's signing key.
    pub key_seed: String,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        Self {
            validators: 4,
            key_seed: "hotstuff-local".to_string(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each validator writes its WAL below it.
    pub data_dir: PathBuf,
    /// Delete old WAL files at startup. The ledger lives in memory, so a
    /// WAL left by an earlier run refers to blocks this process never saw.
    pub reset_wal: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            reset_wal: true,
        }
    }
}

/// Consensus tuning shared by every validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSettings {
    pub round_timeout_ms: u64,
    pub round_timeout_interval_ms: u64,
    pub max_pruned_size: usize,
    pub channel_capacity: usize,
    pub wal_truncate_interval: u64,
}

impl ConsensusSettings {
    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            round_timeout: Duration::from_millis(self.round_timeout_ms),
            round_timeout_interval: Duration::from_millis(self.round_timeout_interval_ms),
        }
    }
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        let engine = ConsensusConfig::default();
        Self {
            round_timeout_ms: engine.timing.round_timeout.as_millis() as u64,
            round_timeout_interval_ms: engine.timing.round_timeout_interval.as_millis() as u64,
            max_pruned_size: engine.max_pruned_size,
            channel_capacity: engine.channel_capacity,
            wal_truncate_interval: engine.wal_truncate_interval,
        }
    }
}

/// Runtime behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Random payload bytes per proposed block.
    pub payload_size: usize,
    /// Seconds between status lines; 0 disables them.
    pub status_interval_secs: u64,
    /// `tracing` filter directive.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            payload_size: 256,
            status_interval_secs: 10,
            log_level: "info".to_string(),
        }
    }
}
