//! Consensus configuration, protocol states and timer events

use super::CommitteeSnapshot;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Governance key overriding the base round timeout, in milliseconds
pub const ROUND_TIMEOUT_KEY: &str = "RoundTimeoutMill";
/// Governance key overriding the per-level timeout increment, in milliseconds
pub const ROUND_TIMEOUT_INTERVAL_KEY: &str = "RoundTimeoutIntervalMill";

pub const DEFAULT_ROUND_TIMEOUT_MS: u64 = 6000;
pub const DEFAULT_ROUND_TIMEOUT_INTERVAL_MS: u64 = 500;

/// Largest millisecond value whose nanosecond form still fits an i64
const MAX_TIMEOUT_MS: u64 = (i64::MAX as u64) / 1_000_000;

/// Level timeout schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    pub round_timeout: Duration,
    pub round_timeout_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_millis(DEFAULT_ROUND_TIMEOUT_MS),
            round_timeout_interval: Duration::from_millis(DEFAULT_ROUND_TIMEOUT_INTERVAL_MS),
        }
    }
}

impl TimingConfig {
    /// Timeout for a level whose distance index is `index`
    pub fn timeout_for(&self, index: u64) -> Duration {
        let step = u32::try_from(index).unwrap_or(u32::MAX);
        self.round_timeout
            .saturating_add(self.round_timeout_interval.saturating_mul(step))
    }

    /// Apply the timing keys found in a governance snapshot.
    ///
    /// Malformed values are logged and skipped.
    pub fn with_overrides(mut self, snapshot: &CommitteeSnapshot) -> Self {
        for (key, value) in &snapshot.ext_config {
            let target = match key.as_str() {
                ROUND_TIMEOUT_KEY => &mut self.round_timeout,
                ROUND_TIMEOUT_INTERVAL_KEY => &mut self.round_timeout_interval,
                _ => continue,
            };
            match parse_timeout_ms(value) {
                Some(ms) => *target = Duration::from_millis(ms),
                None => warn!("[hotstuff] ignoring invalid config {}={}", key, value),
            }
        }
        self
    }
}

fn parse_timeout_ms(value: &str) -> Option<u64> {
    let ms: i64 = value.trim().parse().ok()?;
    if ms <= 0 || ms as u64 > MAX_TIMEOUT_MS {
        return None;
    }
    Some(ms as u64)
}

/// Local node configuration
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Network identity of this node, matched against `Validator::node_id`
    pub node_id: String,
    pub timing: TimingConfig,
    /// Detached blocks kept before the pool really deletes them
    pub max_pruned_size: usize,
    /// Committed heights whose messages stay in the message pool
    pub msg_cache_heights: u64,
    /// Capacity of the protocol, sync and event mailboxes
    pub channel_capacity: usize,
    /// The WAL is truncated when the committed height is a multiple of this
    pub wal_truncate_interval: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            timing: TimingConfig::default(),
            max_pruned_size: 20,
            msg_cache_heights: 0,
            channel_capacity: 1024,
            wal_truncate_interval: 5,
        }
    }
}

impl ConsensusConfig {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }
}

/// Protocol state within one level, in progress order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConsStateType {
    NewHeight,
    NewLevel,
    Propose,
    Vote,
    PaceMaker,
}

/// A scheduled timeout
///
/// Events are never cancelled; a fired event older than the current
/// height, level, epoch or state is discarded on arrival.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub state: ConsStateType,
    pub height: u64,
    pub level: u64,
    pub epoch_id: u64,
    pub duration: Duration,
    /// Distance index used to compute `duration`
    pub level_index: u64,
}
