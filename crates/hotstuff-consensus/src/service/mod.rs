//! Consensus Service - the chained HotStuff state machine
//!
//! # Architecture
//! - One coarse `process_lock` serializes every state change: protocol
//!   messages, local events and WAL replay.
//! - Three loops feed it: protocol messages (proposals and votes), sync
//!   messages (block fetch requests and responses) and local events
//!   (built blocks, ledger commits, timeouts).
//! - Per-epoch state lives in an `Epoch` bundle that is swapped whole when
//!   the committee changes.
//!
//! Submodules extend `ConsensusService` with one concern each:
//! `protocol` (proposal/vote handling), `verify` (certificate and block
//! checks), `sync` (block fetch), `wal` (persistence and replay),
//! `messages` (signing and sending) and `loops` (task wiring).

mod chain_store;
mod epoch;
mod loops;
mod messages;
mod protocol;
mod smr;
mod sync;
mod timer;
mod verify;
mod wal;

use crate::domain::{
    Block, CommitteeSnapshot, ConsensusConfig, ConsensusError, ConsensusResult, ConsensusStatus,
    TimingConfig,
};
use crate::events::{ConsensusEvent, ConsensusMsg};
use crate::ipc::IpcHandler;
use crate::ports::{
    BlockBuilder, BlockCommitter, BlockVerifier, BlockchainStore, ConsensusApi, GovernanceSource,
    NetworkSender, SignatureVerifier, Signer, WriteAheadLog,
};
use async_trait::async_trait;
use chain_store::ChainStore;
use epoch::Epoch;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use sync::SyncManager;
use timer::{TimerCommand, TimerHandle};
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Dependencies for ConsensusService
pub struct ConsensusDependencies {
    pub store: Arc<dyn BlockchainStore>,
    pub committer: Arc<dyn BlockCommitter>,
    pub verifier: Arc<dyn BlockVerifier>,
    pub signer: Arc<dyn Signer>,
    pub sig_verifier: Arc<dyn SignatureVerifier>,
    pub governance: Arc<dyn GovernanceSource>,
    pub network: Arc<dyn NetworkSender>,
    pub builder: Arc<dyn BlockBuilder>,
    pub wal: Arc<dyn WriteAheadLog>,
    pub config: ConsensusConfig,
}

/// WAL bookkeeping
#[derive(Default)]
struct WalState {
    /// WAL index of the first entry at the height after the last commit
    last_commit_wal_index: u64,
    /// First WAL index written for each uncommitted height
    proposal_wal_index: BTreeMap<u64, u64>,
}

/// Mailbox ends consumed by the loops, taken once in `start`
struct Receivers {
    protocol: mpsc::Receiver<ConsensusMsg>,
    sync: mpsc::Receiver<ConsensusMsg>,
    internal: mpsc::UnboundedReceiver<ConsensusMsg>,
    events: mpsc::Receiver<ConsensusEvent>,
    timer: mpsc::UnboundedReceiver<TimerCommand>,
}

/// HotStuff consensus service
pub struct ConsensusService {
    store: Arc<dyn BlockchainStore>,
    committer: Arc<dyn BlockCommitter>,
    verifier: Arc<dyn BlockVerifier>,
    signer: Arc<dyn Signer>,
    sig_verifier: Arc<dyn SignatureVerifier>,
    governance: Arc<dyn GovernanceSource>,
    network: Arc<dyn NetworkSender>,
    builder: Arc<dyn BlockBuilder>,
    wal: Arc<dyn WriteAheadLog>,
    config: ConsensusConfig,
    timing: RwLock<TimingConfig>,

    epoch: RwLock<Arc<Epoch>>,
    next_epoch: Mutex<Option<CommitteeSnapshot>>,
    process_lock: tokio::sync::Mutex<()>,
    commit_height: AtomicU64,
    /// (height, level) of the last `BuildProposal` sent
    proposal_requested: Mutex<Option<(u64, u64)>>,
    /// (height, level) of the last proposal broadcast
    proposed: Mutex<Option<(u64, u64)>>,
    wal_state: Mutex<WalState>,
    done_replay: AtomicBool,

    syncer: SyncManager,
    timer: TimerHandle,
    ipc: IpcHandler,
    internal_tx: mpsc::UnboundedSender<ConsensusMsg>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    receivers: Mutex<Option<Receivers>>,
    halt_tx: watch::Sender<bool>,
}

impl ConsensusService {
    /// Open the chain at the ledger's last committed block and load the
    /// committee from governance. Nothing runs until `start`.
    pub fn new(deps: ConsensusDependencies) -> ConsensusResult<Self> {
        let snapshot = deps.governance.snapshot()?;
        let timing = deps.config.timing.with_overrides(&snapshot);
        let chain_store = ChainStore::open(
            Arc::clone(&deps.store),
            Arc::clone(&deps.committer),
            deps.config.max_pruned_size,
        )?;
        let commit_height = chain_store.root_block().height();
        let epoch = Epoch::new(&snapshot, chain_store, &deps.config, timing);
        info!(
            "[hotstuff] {} opened epoch {} at height {}, member index {:?}",
            deps.config.node_id, epoch.epoch_id, commit_height, epoch.self_index
        );

        let capacity = deps.config.channel_capacity.max(1);
        let (protocol_tx, protocol_rx) = mpsc::channel(capacity);
        let (sync_tx, sync_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (timer, timer_rx) = TimerHandle::channel();
        let (halt_tx, _) = watch::channel(false);

        Ok(Self {
            store: deps.store,
            committer: deps.committer,
            verifier: deps.verifier,
            signer: deps.signer,
            sig_verifier: deps.sig_verifier,
            governance: deps.governance,
            network: deps.network,
            builder: deps.builder,
            wal: deps.wal,
            config: deps.config,
            timing: RwLock::new(timing),
            epoch: RwLock::new(Arc::new(epoch)),
            next_epoch: Mutex::new(None),
            process_lock: tokio::sync::Mutex::new(()),
            commit_height: AtomicU64::new(commit_height),
            proposal_requested: Mutex::new(None),
            proposed: Mutex::new(None),
            wal_state: Mutex::new(WalState::default()),
            done_replay: AtomicBool::new(false),
            syncer: SyncManager::new(),
            timer,
            ipc: IpcHandler::new(protocol_tx, sync_tx),
            internal_tx,
            event_tx,
            receivers: Mutex::new(Some(Receivers {
                protocol: protocol_rx,
                sync: sync_rx,
                internal: internal_rx,
                events: event_rx,
                timer: timer_rx,
            })),
            halt_tx,
        })
    }

    fn current_epoch(&self) -> Arc<Epoch> {
        self.epoch.read().clone()
    }

    fn node_id(&self) -> &str {
        &self.config.node_id
    }

    fn round_timeout(&self) -> std::time::Duration {
        self.timing.read().round_timeout
    }

    /// Replace the timeout schedule. Applies from the next armed timer.
    pub fn reconfigure_timing(&self, timing: TimingConfig) {
        *self.timing.write() = timing;
        self.current_epoch().smr.reconfigure(timing);
        info!(
            "[hotstuff] timing reconfigured: round {:?}, interval {:?}",
            timing.round_timeout, timing.round_timeout_interval
        );
    }

    pub fn status(&self) -> ConsensusStatus {
        let epoch = self.current_epoch();
        let safety = epoch.smr.safety();
        ConsensusStatus {
            node_id: self.config.node_id.clone(),
            epoch_id: epoch.epoch_id,
            height: epoch.smr.height(),
            level: epoch.smr.level(),
            state: epoch.smr.state(),
            commit_height: self.commit_height.load(Ordering::SeqCst),
            highest_qc_level: epoch.chain_store.highest_qc().level,
            locked_level: safety.locked_level(),
            last_vote_level: safety.last_vote_level(),
            self_index: epoch.self_index,
        }
    }

    /// Fires `true` once a fatal error stopped the service.
    pub fn halted(&self) -> watch::Receiver<bool> {
        self.halt_tx.subscribe()
    }

    async fn push_event(&self, event: ConsensusEvent) -> ConsensusResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| ConsensusError::ChannelClosed("consensus events"))
    }
}

#[async_trait]
impl ConsensusApi for ConsensusService {
    async fn on_proposed_block(&self, block: Block) -> ConsensusResult<()> {
        self.push_event(ConsensusEvent::ProposedBlock(block)).await
    }

    async fn on_block_committed(&self, block: Block) -> ConsensusResult<()> {
        self.push_event(ConsensusEvent::BlockCommitted(block)).await
    }

    async fn on_network_message(&self, peer: String, payload: Vec<u8>) -> ConsensusResult<()> {
        self.ipc.handle(&peer, &payload).await
    }

    async fn verify_block_signatures(&self, block: &Block) -> ConsensusResult<()> {
        let epoch = self.current_epoch();
        self.verify_block_certificate(&epoch, block)
    }

    async fn status(&self) -> ConsensusStatus {
        ConsensusService::status(self)
    }
}

#[cfg(test)]
mod tests;
