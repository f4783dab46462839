//! # Consensus Metrics
//!
//! Prometheus metrics for monitoring the HotStuff engine.
//!
//! ## Usage
//!
//! Enable with the `metrics` feature:
//! ```toml
//! hotstuff-consensus = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `hotstuff_blocks_committed_total` - Counter of blocks committed to the ledger
//! - `hotstuff_current_level` - Gauge of the pacemaker level
//! - `hotstuff_local_timeouts_total` - Counter of level timeouts fired locally
//! - `hotstuff_certificates_total` - Counter of aggregated certificates (by kind)
//! - `hotstuff_sync_fetch_total` - Counter of block fetches (by outcome)
//! - `hotstuff_messages_dropped_total` - Counter of dropped messages (by reason)

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref BLOCKS_COMMITTED: IntCounter = register_int_counter!(
        "hotstuff_blocks_committed_total",
        "Total number of blocks committed to the ledger"
    )
    .expect("Failed to create BLOCKS_COMMITTED metric");

    pub static ref CURRENT_LEVEL: IntGauge = register_int_gauge!(
        "hotstuff_current_level",
        "Current pacemaker level"
    )
    .expect("Failed to create CURRENT_LEVEL metric");

    pub static ref LOCAL_TIMEOUTS: IntCounter = register_int_counter!(
        "hotstuff_local_timeouts_total",
        "Total number of level timeouts fired locally"
    )
    .expect("Failed to create LOCAL_TIMEOUTS metric");

    /// Aggregated certificates, labeled `qc` or `tc`
    pub static ref CERTIFICATES: IntCounterVec = register_int_counter_vec!(
        "hotstuff_certificates_total",
        "Total number of certificates aggregated from votes",
        &["kind"]
    )
    .expect("Failed to create CERTIFICATES metric");

    pub static ref SYNC_FETCHES: IntCounterVec = register_int_counter_vec!(
        "hotstuff_sync_fetch_total",
        "Total number of block fetch requests by outcome",
        &["outcome"]
    )
    .expect("Failed to create SYNC_FETCHES metric");

    pub static ref MESSAGES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "hotstuff_messages_dropped_total",
        "Total number of consensus messages dropped",
        &["reason"]
    )
    .expect("Failed to create MESSAGES_DROPPED metric");
}

#[cfg(feature = "metrics")]
pub fn record_block_committed() {
    BLOCKS_COMMITTED.inc();
}

#[cfg(feature = "metrics")]
pub fn record_level(level: u64) {
    CURRENT_LEVEL.set(i64::try_from(level).unwrap_or(i64::MAX));
}

#[cfg(feature = "metrics")]
pub fn record_local_timeout() {
    LOCAL_TIMEOUTS.inc();
}

/// Record an aggregated certificate, `kind` is `qc` or `tc`
#[cfg(feature = "metrics")]
pub fn record_certificate(kind: &str) {
    CERTIFICATES.with_label_values(&[kind]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_sync_fetch(outcome: &str) {
    SYNC_FETCHES.with_label_values(&[outcome]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_message_dropped(reason: &str) {
    MESSAGES_DROPPED.with_label_values(&[reason]).inc();
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub fn record_block_committed() {}

#[cfg(not(feature = "metrics"))]
pub fn record_level(_level: u64) {}

#[cfg(not(feature = "metrics"))]
pub fn record_local_timeout() {}

#[cfg(not(feature = "metrics"))]
pub fn record_certificate(_kind: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_sync_fetch(_outcome: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_message_dropped(_reason: &str) {}
