//! Block domain entities

use super::{Endorsement, Hash, QuorumCert, ZERO_HASH};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Block header
///
/// `level` is the consensus round the block was proposed in. It is part of
/// the hashed content, so a QC claiming a different level for the same
/// block id is detectable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub pre_block_hash: Hash,
    pub block_hash: Hash,
    pub level: u64,
    pub proposer: String,
    pub timestamp: u64,
    /// Proposer signature over `block_hash`
    pub signature: Option<Endorsement>,
}

/// A block as carried by proposals and stored in the block pool
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    #[serde_as(as = "Bytes")]
    pub payload: Vec<u8>,
    /// Certificate for this block, attached when it is committed
    pub qc: Option<QuorumCert>,
}

impl Block {
    /// Build an unsealed block on top of `pre_block_hash`.
    ///
    /// Level, proposer and hash are filled in when the block is wrapped in a
    /// proposal.
    pub fn new(height: u64, pre_block_hash: Hash, payload: Vec<u8>, timestamp: u64) -> Self {
        Self {
            header: BlockHeader {
                height,
                pre_block_hash,
                block_hash: ZERO_HASH,
                level: 0,
                proposer: String::new(),
                timestamp,
                signature: None,
            },
            payload,
            qc: None,
        }
    }

    /// Genesis block with its certificate attached
    pub fn genesis(epoch_id: u64) -> Self {
        let mut block = Self::new(0, ZERO_HASH, Vec::new(), 0);
        block.seal();
        block.qc = Some(QuorumCert::genesis(block.hash(), epoch_id));
        block
    }

    pub fn hash(&self) -> Hash {
        self.header.block_hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn level(&self) -> u64 {
        self.header.level
    }

    pub fn pre_hash(&self) -> Hash {
        self.header.pre_block_hash
    }

    pub fn is_genesis(&self) -> bool {
        self.header.height == 0
    }

    /// Keccak-256 over the header fields and payload
    ///
    /// `block_hash`, the signature and the attached QC are excluded.
    pub fn compute_hash(&self) -> Hash {
        use sha3::{Digest, Keccak256};
        let mut hasher = Keccak256::new();
        hasher.update(self.header.height.to_le_bytes());
        hasher.update(self.header.pre_block_hash);
        hasher.update(self.header.level.to_le_bytes());
        hasher.update((self.header.proposer.len() as u64).to_le_bytes());
        hasher.update(self.header.proposer.as_bytes());
        hasher.update(self.header.timestamp.to_le_bytes());
        hasher.update(&self.payload);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    /// Recompute and store the block hash
    pub fn seal(&mut self) {
        self.header.block_hash = self.compute_hash();
    }

    pub fn verify_hash(&self) -> bool {
        self.header.block_hash == self.compute_hash()
    }
}
