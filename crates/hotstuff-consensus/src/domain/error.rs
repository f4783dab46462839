//! Error types for the HotStuff consensus engine

use super::Hash;

/// Consensus error types
///
/// Malformed or stale input maps to the validation variants and is dropped
/// by the caller. `UnsafeProposal` is a normal outcome of the vote rules
/// under faults. `Wal` and `SafetyViolation` are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Orphan block {block}: parent {parent} not in tree")]
    OrphanBlock { block: String, parent: String },

    #[error("No such block: {0}")]
    NoSuchBlock(String),

    #[error("Invalid quorum certificate: {0}")]
    InvalidQc(String),

    #[error("Duplicate proposal at height {height}, level {level}")]
    DuplicateProposal { height: u64, level: u64 },

    #[error("Equivocating vote from validator {author_idx} at height {height}, level {level}")]
    EquivocatingVote {
        author_idx: u64,
        height: u64,
        level: u64,
    },

    #[error("Stale message: {0}")]
    StaleMessage(String),

    #[error("Epoch mismatch: expected {expected}, got {actual}")]
    EpochMismatch { expected: u64, actual: u64 },

    #[error("Invalid proposer: {0}")]
    InvalidProposer(String),

    #[error("Unknown validator index {index} at height {height}")]
    UnknownValidator { index: u64, height: u64 },

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Insufficient votes: got {got}, required {required}")]
    InsufficientVotes { got: usize, required: usize },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Unsafe proposal: {0}")]
    UnsafeProposal(String),

    #[error("Safety invariant violated: {0}")]
    SafetyViolation(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] crate::ports::LedgerError),

    #[error("WAL error: {0}")]
    Wal(#[from] crate::ports::WalError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Governance error: {0}")]
    Governance(String),

    #[error("Block fetch for {0} timed out")]
    SyncTimeout(String),

    #[error("Block fetch failed: {0}")]
    SyncFailed(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl From<bincode::Error> for ConsensusError {
    fn from(err: bincode::Error) -> Self {
        ConsensusError::Codec(err.to_string())
    }
}

impl ConsensusError {
    /// Errors after which the node must stop rather than continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::Wal(_) | ConsensusError::SafetyViolation(_))
    }

    /// Metric label for a dropped message
    pub fn label(&self) -> &'static str {
        match self {
            ConsensusError::OrphanBlock { .. } | ConsensusError::NoSuchBlock(_) => "missing_block",
            ConsensusError::InvalidQc(_) | ConsensusError::InsufficientVotes { .. } => "invalid_qc",
            ConsensusError::DuplicateProposal { .. } => "duplicate",
            ConsensusError::EquivocatingVote { .. } => "equivocation",
            ConsensusError::StaleMessage(_) => "stale",
            ConsensusError::EpochMismatch { .. } => "epoch",
            ConsensusError::InvalidProposer(_) | ConsensusError::UnknownValidator { .. } => "unknown_sender",
            ConsensusError::InvalidSignature(_) => "signature",
            ConsensusError::InvalidBlock(_) | ConsensusError::Ledger(_) => "invalid_block",
            ConsensusError::UnsafeProposal(_) | ConsensusError::SafetyViolation(_) => "safety",
            ConsensusError::SyncTimeout(_) | ConsensusError::SyncFailed(_) => "sync",
            ConsensusError::Codec(_) => "codec",
            ConsensusError::Wal(_)
            | ConsensusError::Network(_)
            | ConsensusError::Governance(_)
            | ConsensusError::ChannelClosed(_) => "internal",
        }
    }
}

/// Short hex rendering of a hash for log lines and error messages.
pub fn short_hash(hash: &Hash) -> String {
    hex::encode(&hash[..4])
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;
