//! IPC Handler for peer messages
//!
//! Decodes raw bytes from the network, rejects what is obviously malformed
//! and routes the rest into the protocol or sync mailbox. Signatures and
//! committee membership are checked later by the service, against the
//! epoch the message is processed in.

use crate::domain::{ConsensusError, ConsensusResult};
use crate::events::{BlockFetchStatus, ConsensusMsg, ConsensusPayload};
use tokio::sync::mpsc;
use tracing::trace;

/// Entry point for bytes received from peers
pub struct IpcHandler {
    protocol_tx: mpsc::Sender<ConsensusMsg>,
    sync_tx: mpsc::Sender<ConsensusMsg>,
}

impl IpcHandler {
    pub fn new(protocol_tx: mpsc::Sender<ConsensusMsg>, sync_tx: mpsc::Sender<ConsensusMsg>) -> Self {
        Self {
            protocol_tx,
            sync_tx,
        }
    }

    /// Decode `payload` from `peer` and hand it to the matching mailbox.
    ///
    /// Waits while the mailbox is full.
    pub async fn handle(&self, peer: &str, payload: &[u8]) -> ConsensusResult<()> {
        let msg = ConsensusMsg::decode(payload)?;
        Self::check(peer, &msg)?;
        trace!("[hotstuff] {} from {}", msg.payload.msg_type().as_str(), peer);

        let mailbox = match msg.payload {
            ConsensusPayload::Proposal(_) | ConsensusPayload::Vote(_) => &self.protocol_tx,
            ConsensusPayload::BlockFetch(_) | ConsensusPayload::BlockFetchResp(_) => &self.sync_tx,
        };
        mailbox
            .send(msg)
            .await
            .map_err(|_| ConsensusError::ChannelClosed("consensus mailbox"))
    }

    /// Cheap structural checks before anything is queued.
    fn check(peer: &str, msg: &ConsensusMsg) -> ConsensusResult<()> {
        if msg.sign_entry.is_none() {
            return Err(ConsensusError::InvalidSignature(format!(
                "unsigned {} from {}",
                msg.payload.msg_type().as_str(),
                peer
            )));
        }
        match &msg.payload {
            ConsensusPayload::Proposal(proposal) => {
                let data = &proposal.proposal_data;
                if data.proposer != peer {
                    return Err(ConsensusError::InvalidProposer(format!(
                        "proposal by {} relayed from {}",
                        data.proposer, peer
                    )));
                }
                if data.height != data.block.height() {
                    return Err(ConsensusError::InvalidBlock(format!(
                        "proposal height {} carries block at height {}",
                        data.height,
                        data.block.height()
                    )));
                }
                if data.block.header.signature.is_none() {
                    return Err(ConsensusError::InvalidSignature(format!(
                        "proposal from {} carries an unsigned block",
                        peer
                    )));
                }
            }
            ConsensusPayload::Vote(vote) => {
                let data = &vote.vote_data;
                if data.author != peer {
                    return Err(ConsensusError::InvalidSignature(format!(
                        "vote by {} relayed from {}",
                        data.author, peer
                    )));
                }
                // only a new-view vote may leave the block out
                if data.block_id.is_none() && !data.new_view {
                    return Err(ConsensusError::InvalidBlock(format!(
                        "vote from {} at level {} names no block",
                        peer, data.level
                    )));
                }
            }
            ConsensusPayload::BlockFetch(fetch) => {
                if fetch.num_blocks == 0 {
                    return Err(ConsensusError::SyncFailed(format!(
                        "empty fetch request from {}",
                        peer
                    )));
                }
            }
            ConsensusPayload::BlockFetchResp(resp) => {
                if resp.status == BlockFetchStatus::Succeeded && resp.blocks.is_empty() {
                    return Err(ConsensusError::SyncFailed(format!(
                        "successful fetch response {} from {} carries no blocks",
                        resp.resp_id, peer
                    )));
                }
                if let Some(pair) = resp
                    .blocks
                    .iter()
                    .find(|pair| !pair.block.is_genesis() && pair.block.header.signature.is_none())
                {
                    return Err(ConsensusError::InvalidSignature(format!(
                        "fetch response from {} carries unsigned block at height {}",
                        peer,
                        pair.block.height()
                    )));
                }
            }
        }
        Ok(())
    }
}
