//! Wire messages exchanged between validators
//!
//! Every message is a `ConsensusMsg`: a tagged payload plus the sender's
//! endorsement over the bincode encoding of that payload.

use crate::domain::{Block, ConsensusResult, Endorsement, Hash, QuorumCert, SyncInfo, VoteMsg};
use serde::{Deserialize, Serialize};

/// Largest number of blocks requested or answered in one fetch round
pub const MAX_SYNC_BLOCK_NUM: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Proposal,
    Vote,
    BlockFetch,
    BlockFetchResp,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Proposal => "proposal",
            MessageType::Vote => "vote",
            MessageType::BlockFetch => "block_fetch",
            MessageType::BlockFetchResp => "block_fetch_resp",
        }
    }
}

/// Block proposed at one (height, level)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalData {
    pub block: Block,
    pub height: u64,
    pub level: u64,
    pub epoch_id: u64,
    pub proposer: String,
    pub proposer_idx: u64,
    /// Certificate of the parent block
    pub justify_qc: QuorumCert,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalMsg {
    pub proposal_data: ProposalData,
    pub sync_info: SyncInfo,
}

/// Request for the chain ending at `block_id`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockFetchMsg {
    pub req_id: u64,
    pub height: u64,
    pub block_id: Hash,
    pub num_blocks: u64,
    pub author_idx: u64,
    /// Requester's committed root; the responder stops walking there
    pub commit_block: Hash,
    /// Requester's locked block; the responder stops walking there too
    pub locked_block: Hash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockFetchStatus {
    Succeeded,
    NotEnoughBlocks,
}

/// A block with the certificate that certifies it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockPair {
    pub block: Block,
    pub qc: QuorumCert,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockFetchRespMsg {
    pub resp_id: u64,
    pub status: BlockFetchStatus,
    pub blocks: Vec<BlockPair>,
    pub author_idx: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConsensusPayload {
    Proposal(ProposalMsg),
    Vote(VoteMsg),
    BlockFetch(BlockFetchMsg),
    BlockFetchResp(BlockFetchRespMsg),
}

impl ConsensusPayload {
    pub fn msg_type(&self) -> MessageType {
        match self {
            ConsensusPayload::Proposal(_) => MessageType::Proposal,
            ConsensusPayload::Vote(_) => MessageType::Vote,
            ConsensusPayload::BlockFetch(_) => MessageType::BlockFetch,
            ConsensusPayload::BlockFetchResp(_) => MessageType::BlockFetchResp,
        }
    }

    /// Bytes covered by the message endorsement
    pub fn signing_bytes(&self) -> ConsensusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// Envelope sent over the network
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsensusMsg {
    pub payload: ConsensusPayload,
    pub sign_entry: Option<Endorsement>,
}

impl ConsensusMsg {
    pub fn encode(&self) -> ConsensusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One record of the write-ahead log
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalEntry {
    pub msg_type: MessageType,
    /// Encoded `ConsensusMsg`
    pub msg: Vec<u8>,
    /// WAL index of the last committed height when the entry was written
    pub last_snapshot_index: u64,
}

impl WalEntry {
    pub fn encode(&self) -> ConsensusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
