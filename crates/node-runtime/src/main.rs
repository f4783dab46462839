//! # HotStuff Node Runtime
//!
//! Runs a complete HotStuff committee inside one process.
//!
//! ## Wiring
//!
//! ```text
//!                     InMemoryNetwork hub
//!        ┌──────────────┬───────┴───────┬──────────────┐
//!        ↓              ↓               ↓              ↓
//!     node-0         node-1          node-2         node-3
//!   ┌─────────────────────────────────────────┐
//!   │ inbound pump ──→ ConsensusService        │
//!   │ builder pump ──→   │   │                 │
//!   │ commit pump  ──→   │   └──→ FileWal      │
//!   │        ↑           ↓                     │
//!   │        └──── InMemoryLedger              │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (JSON file, then `HOTSTUFF_*` env vars)
//! 2. Derive validator keys and the genesis committee
//! 3. Open one WAL per validator and register every network endpoint
//! 4. Start the pumps and the consensus services
//! 5. Run until Ctrl-C or until any service halts

pub mod container;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::container::{LocalCommittee, NodeConfig, ENV_LOG};

/// The runtime driving the local committee.
pub struct NodeRuntime {
    config: NodeConfig,
    committee: Arc<LocalCommittee>,
    /// Every task spawned for the committee, joined on shutdown.
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig) -> Result<Self> {
        info!(
            "Creating HotStuff runtime with {} validators",
            config.committee.validators
        );
        let committee = LocalCommittee::build(&config).context("Failed to build committee")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            committee: Arc::new(committee),
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  HotStuff Node Runtime v{}", env!("CARGO_PKG_VERSION"));
        info!("  Validators: {}", self.config.committee.validators);
        info!("===========================================");

        let handles = self.committee.start(&self.shutdown_rx).await?;
        self.handles.lock().extend(handles);

        self.watch_halts();
        self.spawn_status_reporter();

        info!(
            "Round timeout: {}ms (+{}ms per level)",
            self.config.consensus.round_timeout_ms, self.config.consensus.round_timeout_interval_ms
        );
        info!("Data Dir: {:?}", self.config.storage.data_dir);
        Ok(())
    }

    /// A halted service stops the whole committee.
    fn watch_halts(&self) {
        let mut handles = self.handles.lock();
        for node in &self.committee.nodes {
            let mut halted = node.service.halted();
            let shutdown_tx = self.shutdown_tx.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            let node_id = node.node_id.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    res = async { halted.wait_for(|h| *h).await.map(|_| ()) } => {
                        if res.is_ok() {
                            error!("{} halted, stopping the committee", node_id);
                            let _ = shutdown_tx.send(true);
                        }
                    }
                    _ = shutdown_rx.changed() => {}
                }
            }));
        }
    }

    fn spawn_status_reporter(&self) {
        let secs = self.config.runtime.status_interval_secs;
        if secs == 0 {
            return;
        }
        let committee = Arc::clone(&self.committee);
        let mut shutdown_rx = self.shutdown_rx.clone();
        self.handles.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for node in &committee.nodes {
                            let status = node.service.status();
                            info!(
                                "{}: epoch {} height {} level {} state {:?} committed {} locked {} voted {} qc {}",
                                status.node_id,
                                status.epoch_id,
                                status.height,
                                status.level,
                                status.state,
                                status.commit_height,
                                status.locked_level,
                                status.last_vote_level,
                                status.highest_qc_level
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
    }

    /// Resolves once a shutdown was requested, by a halt or by `shutdown`.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_rx.clone();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Shutdown the committee gracefully.
    ///
    /// ## Shutdown Sequence
    ///
    /// 1. Signal shutdown to every task
    /// 2. Join the tasks (with timeout)
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Err(e)) if e.is_panic() => error!("Task panicked: {}", e),
                Ok(_) => {}
                Err(_) => warn!("Task did not stop in time"),
            }
        }

        for node in &self.committee.nodes {
            info!("{} stopped at height {}", node.node_id, node.ledger.height());
        }
        info!("Shutdown complete");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env().context("Invalid configuration")?;

    let filter = EnvFilter::try_new(&config.runtime.log_level)
        .with_context(|| format!("Invalid {} directive", ENV_LOG))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = NodeRuntime::new(config)?;
    runtime.start().await?;

    info!("Committee is running. Press Ctrl+C to stop.");
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = runtime.stopped() => warn!("Committee stopped itself"),
    }

    runtime.shutdown().await;
    Ok(())
}
