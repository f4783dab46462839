//! Votes and quorum certificates

use super::{ConsensusResult, Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// A signature together with the public key that produced it
#[serde_as]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endorsement {
    #[serde_as(as = "Bytes")]
    pub signer: Vec<u8>,
    #[serde_as(as = "Bytes")]
    pub signature: Vec<u8>,
}

/// A single validator vote
///
/// Regular votes carry `block_id` with `new_view == false`. Timeout votes
/// set `new_view`; a timeout vote that retries an earlier regular vote keeps
/// its `block_id`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteData {
    pub author: String,
    pub author_idx: u64,
    pub height: u64,
    pub level: u64,
    pub epoch_id: u64,
    pub block_id: Option<Hash>,
    pub new_view: bool,
    pub signature: Option<Endorsement>,
}

impl VoteData {
    /// Bytes covered by the vote signature (the vote with `signature` cleared)
    pub fn signing_bytes(&self) -> ConsensusResult<Vec<u8>> {
        let unsigned = VoteData {
            signature: None,
            ..self.clone()
        };
        Ok(bincode::serialize(&unsigned)?)
    }
}

/// Quorum certificate
///
/// A certificate with `new_view` set and no `block_id` is a timeout
/// certificate (TC).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuorumCert {
    pub block_id: Option<Hash>,
    pub height: u64,
    pub level: u64,
    pub epoch_id: u64,
    pub new_view: bool,
    pub votes: Vec<VoteData>,
}

impl QuorumCert {
    /// Certificate for the genesis block. Level 0 needs no votes.
    pub fn genesis(block_id: Hash, epoch_id: u64) -> Self {
        Self {
            block_id: Some(block_id),
            height: 0,
            level: 0,
            epoch_id,
            new_view: false,
            votes: Vec::new(),
        }
    }

    pub fn is_tc(&self) -> bool {
        self.new_view && self.block_id.is_none()
    }
}

/// Highest certificates known to the sender, gossiped with every
/// proposal and vote.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncInfo {
    pub highest_qc: QuorumCert,
    pub highest_tc: Option<QuorumCert>,
    pub highest_tc_level: u64,
}

/// Vote payload as sent on the wire
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VoteMsg {
    pub vote_data: VoteData,
    pub sync_info: SyncInfo,
}
