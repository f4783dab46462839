//! Driven ports (Outbound dependencies)
//!
//! Everything the engine needs from the node around it: durable ledger,
//! block execution, signing, governance, transport and the write-ahead log.
//! All calls are synchronous; adapters that talk to slow backends are
//! expected to hand work off to their own tasks.

use crate::domain::{Block, CommitteeSnapshot, ConsensusResult, Endorsement, Hash};
use crate::events::BuildProposal;

/// Ledger commit failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// A block already occupies this height. The caller decides whether
    /// it is the same block by comparing hashes.
    #[error("block at height {0} already committed")]
    AlreadyCommitted(u64),

    #[error("{0}")]
    Other(String),
}

/// Write-ahead log failures. Every one of them is fatal to the engine.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("no WAL entry at index {0}")]
    NotFound(u64),

    #[error("WAL I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted WAL: {0}")]
    Corrupted(String),
}

/// Read access to the durable chain
///
/// Used as a fallback once the block pool has pruned a block.
pub trait BlockchainStore: Send + Sync {
    fn get_block(&self, height: u64) -> Option<Block>;

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block>;

    /// Highest committed block, `None` on an empty ledger
    fn last_committed_block(&self) -> Option<Block>;
}

/// Hands a committed block to the ledger
pub trait BlockCommitter: Send + Sync {
    /// Must return `AlreadyCommitted` rather than overwrite a stored height.
    fn commit_block(&self, block: &Block) -> Result<(), LedgerError>;
}

/// Application-level block validation (execution, payload rules)
pub trait BlockVerifier: Send + Sync {
    fn verify_block(&self, block: &Block) -> Result<(), LedgerError>;
}

/// Signs on behalf of this node
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> ConsensusResult<Endorsement>;

    fn public_key(&self) -> Vec<u8>;
}

/// Checks a signature against a validator public key
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &Endorsement) -> bool;
}

/// Source of committee snapshots, polled after every commit
pub trait GovernanceSource: Send + Sync {
    fn snapshot(&self) -> ConsensusResult<CommitteeSnapshot>;
}

/// Peer-to-peer transport for already signed, serialized messages
pub trait NetworkSender: Send + Sync {
    fn send(&self, peer: &str, payload: Vec<u8>) -> ConsensusResult<()>;

    /// Send to every peer except this node.
    ///
    /// Every peer is attempted; the first failure is returned.
    fn broadcast(&self, peers: &[String], payload: Vec<u8>) -> ConsensusResult<()> {
        let mut result = Ok(());
        for peer in peers {
            if let Err(err) = self.send(peer, payload.clone()) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

/// Receives requests to build the next block
pub trait BlockBuilder: Send + Sync {
    fn request_proposal(&self, request: BuildProposal) -> ConsensusResult<()>;
}

/// Append-only framed log addressed by a monotonically increasing index
///
/// Indexes start at 1. `first_index` and `last_index` return 0 for an
/// empty log.
pub trait WriteAheadLog: Send + Sync {
    fn write(&self, index: u64, data: &[u8]) -> Result<(), WalError>;

    fn read(&self, index: u64) -> Result<Vec<u8>, WalError>;

    fn first_index(&self) -> Result<u64, WalError>;

    fn last_index(&self) -> Result<u64, WalError>;

    /// Remove every entry below `index`.
    fn truncate_front(&self, index: u64) -> Result<(), WalError>;
}
