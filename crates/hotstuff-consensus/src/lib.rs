//! # hotstuff-consensus
//!
//! Chained HotStuff BFT consensus for a permissioned validator committee.
//!
//! ## Architecture
//!
//! Every block is proposed at a (height, level). Validators vote for the
//! proposal of the current level and send the vote to the leader of the
//! next level, which aggregates a quorum into a QC and proposes on top of
//! it. A block commits once it heads a three-chain of certified blocks at
//! contiguous heights.
//!
//! ```text
//!  network ──► IpcHandler ──► protocol mailbox ─┐
//!                        └──► sync mailbox ─────┤
//!  builder/ledger/timer ────► event mailbox ────┼──► ConsensusService ──► BlockCommitter
//!                                               │      (process lock)  ──► NetworkSender
//!                                               │                      ──► WriteAheadLog
//! ```
//!
//! A level that makes no progress times out; a quorum of timeout votes
//! forms a TC that moves every honest node to the next level.
//!
//! ## Safety
//!
//! - A validator votes at most once per level, and never below its lock.
//! - Every accepted message and every vote cast is written to the WAL
//!   before it takes effect, and replayed on restart.
//! - All signatures (message, vote, block) are checked against the
//!   committee of the height they claim.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hotstuff_consensus::{ConsensusConfig, ConsensusDependencies, ConsensusService};
//!
//! let service = Arc::new(ConsensusService::new(ConsensusDependencies {
//!     store, committer, verifier, signer, sig_verifier,
//!     governance, network, builder, wal,
//!     config: ConsensusConfig::for_node("node-0"),
//! })?);
//! let handles = service.start(shutdown_rx).await?;
//!
//! // feed peer bytes, built blocks and ledger commits
//! service.on_network_message(peer, bytes).await?;
//! ```

pub mod adapters;
pub mod domain;
pub mod events;
pub mod ipc;
pub mod metrics;
pub mod ports;
pub mod service;

// Re-export main types
pub use domain::{
    Block, BlockHeader, CommitteeSnapshot, ConsStateType, ConsensusConfig, ConsensusError,
    ConsensusResult, ConsensusStatus, QuorumCert, TimingConfig, Validator,
};
pub use ipc::IpcHandler;
pub use ports::{
    BlockBuilder, BlockCommitter, BlockVerifier, BlockchainStore, ConsensusApi, GovernanceSource,
    NetworkSender, SignatureVerifier, Signer, WriteAheadLog,
};
pub use service::{ConsensusDependencies, ConsensusService};
