//! Building, signing and sending consensus messages

use super::epoch::Epoch;
use super::ConsensusService;
use crate::domain::{
    Block, ConsensusError, ConsensusResult, Hash, SyncInfo, Validator, VoteData, VoteMsg,
};
use crate::events::{ConsensusMsg, ConsensusPayload, ProposalData, ProposalMsg};
use tracing::{debug, warn};

impl ConsensusService {
    pub(super) fn sync_info(&self, epoch: &Epoch) -> SyncInfo {
        SyncInfo {
            highest_qc: epoch.chain_store.highest_qc(),
            highest_tc: epoch.smr.tc(),
            highest_tc_level: epoch.smr.highest_tc_level(),
        }
    }

    /// Wrap `payload` with this node's endorsement over its encoding.
    pub(super) fn sign_msg(&self, payload: ConsensusPayload) -> ConsensusResult<ConsensusMsg> {
        let sign_entry = self.signer.sign(&payload.signing_bytes()?)?;
        Ok(ConsensusMsg {
            payload,
            sign_entry: Some(sign_entry),
        })
    }

    /// Check the message endorsement against `sender`'s registered key.
    pub(super) fn verify_msg_signature(
        &self,
        msg: &ConsensusMsg,
        sender: &Validator,
    ) -> ConsensusResult<()> {
        let entry = msg.sign_entry.as_ref().ok_or_else(|| {
            ConsensusError::InvalidSignature(format!("unsigned {}", msg.payload.msg_type().as_str()))
        })?;
        if entry.signer != sender.public_key {
            return Err(ConsensusError::InvalidSignature(format!(
                "{} signed by a key other than {}",
                msg.payload.msg_type().as_str(),
                sender.node_id
            )));
        }
        let bytes = msg.payload.signing_bytes()?;
        if !self.sig_verifier.verify(&sender.public_key, &bytes, entry) {
            return Err(ConsensusError::InvalidSignature(format!(
                "bad {} signature from {}",
                msg.payload.msg_type().as_str(),
                sender.node_id
            )));
        }
        Ok(())
    }

    /// A signed vote at (height, level) by this node.
    pub(super) fn construct_vote(
        &self,
        epoch: &Epoch,
        height: u64,
        level: u64,
        block_id: Option<Hash>,
        new_view: bool,
    ) -> ConsensusResult<VoteMsg> {
        let author_idx = epoch.index_at(height).ok_or_else(|| {
            ConsensusError::UnknownValidator {
                index: u64::MAX,
                height,
            }
        })?;
        let mut vote_data = VoteData {
            author: self.node_id().to_string(),
            author_idx,
            height,
            level,
            epoch_id: epoch.epoch_id,
            block_id,
            new_view,
            signature: None,
        };
        vote_data.signature = Some(self.signer.sign(&vote_data.signing_bytes()?)?);
        Ok(VoteMsg {
            vote_data,
            sync_info: self.sync_info(epoch),
        })
    }

    /// Stamp level and proposer into `block`, seal and sign it, and wrap it
    /// with the highest QC as justification.
    pub(super) fn construct_proposal(
        &self,
        epoch: &Epoch,
        mut block: Block,
    ) -> ConsensusResult<ProposalMsg> {
        let height = epoch.smr.height();
        let level = epoch.smr.level();
        let proposer_idx = epoch.index_at(height).ok_or_else(|| {
            ConsensusError::InvalidProposer(format!("{} is not a validator", self.node_id()))
        })?;
        block.header.level = level;
        block.header.proposer = self.node_id().to_string();
        block.qc = None;
        block.seal();
        block.header.signature = Some(self.signer.sign(&block.hash())?);

        Ok(ProposalMsg {
            proposal_data: ProposalData {
                block,
                height,
                level,
                epoch_id: epoch.epoch_id,
                proposer: self.node_id().to_string(),
                proposer_idx,
                justify_qc: epoch.chain_store.highest_qc(),
            },
            sync_info: self.sync_info(epoch),
        })
    }

    /// Send to one validator. Messages addressed to this node go through the
    /// internal mailbox.
    pub(super) fn send_to(&self, node_id: &str, msg: &ConsensusMsg) -> ConsensusResult<()> {
        if node_id == self.node_id() {
            return self.deliver_internal(msg.clone());
        }
        self.network.send(node_id, msg.encode()?)
    }

    pub(super) fn deliver_internal(&self, msg: ConsensusMsg) -> ConsensusResult<()> {
        self.internal_tx
            .send(msg)
            .map_err(|_| ConsensusError::ChannelClosed("internal mailbox"))
    }

    /// Sign, broadcast to every other validator, and loop back to this node.
    pub(super) fn sign_and_broadcast(
        &self,
        epoch: &Epoch,
        payload: ConsensusPayload,
    ) -> ConsensusResult<ConsensusMsg> {
        let msg = self.sign_msg(payload)?;
        self.broadcast_msg(epoch, msg.clone())?;
        Ok(msg)
    }

    /// Send an already signed message to every other validator and loop it
    /// back to this node.
    pub(super) fn broadcast_msg(&self, epoch: &Epoch, msg: ConsensusMsg) -> ConsensusResult<()> {
        let peers = epoch.broadcast_peers();
        debug!(
            "[hotstuff] broadcast {} to {} peers",
            msg.payload.msg_type().as_str(),
            peers.len()
        );
        if let Err(err) = self.network.broadcast(&peers, msg.encode()?) {
            warn!("[hotstuff] broadcast incomplete: {}", err);
        }
        self.deliver_internal(msg)
    }
}
