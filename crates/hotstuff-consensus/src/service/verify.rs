//! Certificate, block and fetch-need checks

use super::epoch::Epoch;
use super::ConsensusService;
use crate::domain::{
    short_hash, Block, ConsensusError, ConsensusResult, QuorumCert, Validator, VoteData,
};
use crate::events::{ProposalMsg, MAX_SYNC_BLOCK_NUM};
use crate::ports::LedgerError;
use std::collections::HashSet;

impl ConsensusService {
    /// Verify every vote of `qc` and require a quorum for levels above 0.
    ///
    /// A certificate from the directly preceding epoch is accepted as is:
    /// its committee is no longer available to check it against.
    pub(super) fn verify_justify_qc(&self, epoch: &Epoch, qc: &QuorumCert) -> ConsensusResult<()> {
        if !qc.new_view && qc.block_id.is_none() {
            return Err(ConsensusError::InvalidQc(format!(
                "certificate at level {} names no block",
                qc.level
            )));
        }
        if qc.new_view && qc.block_id.is_some() {
            return Err(ConsensusError::InvalidQc(format!(
                "timeout certificate at level {} names a block",
                qc.level
            )));
        }
        if qc.epoch_id != epoch.epoch_id {
            if qc.epoch_id + 1 == epoch.epoch_id {
                return Ok(());
            }
            return Err(ConsensusError::EpochMismatch {
                expected: epoch.epoch_id,
                actual: qc.epoch_id,
            });
        }

        let (new_view_votes, block_votes) = self.count_votes(epoch, qc)?;
        if qc.level == 0 {
            return Ok(());
        }
        let got = if qc.new_view { new_view_votes } else { block_votes };
        let required = epoch.smr.committee().quorum_at(qc.height);
        if got < required {
            return Err(ConsensusError::InsufficientVotes { got, required });
        }
        Ok(())
    }

    /// Returns (timeout votes, votes for `qc.block_id`).
    fn count_votes(&self, epoch: &Epoch, qc: &QuorumCert) -> ConsensusResult<(usize, usize)> {
        let mut seen = HashSet::new();
        let mut new_view_votes = 0;
        let mut block_votes = 0;
        for vote in &qc.votes {
            let validator = epoch
                .smr
                .committee()
                .validator_by_index(vote.height, vote.author_idx)
                .ok_or(ConsensusError::UnknownValidator {
                    index: vote.author_idx,
                    height: vote.height,
                })?;
            if validator.node_id != vote.author {
                return Err(ConsensusError::InvalidQc(format!(
                    "vote author {} does not hold index {}",
                    vote.author, vote.author_idx
                )));
            }
            self.verify_vote_signature(vote, validator)?;
            if vote.height != qc.height || vote.level != qc.level {
                return Err(ConsensusError::InvalidQc(format!(
                    "vote at {}/{} inside certificate at {}/{}",
                    vote.height, vote.level, qc.height, qc.level
                )));
            }
            if !seen.insert(vote.author_idx) {
                return Err(ConsensusError::InvalidQc(format!(
                    "validator {} counted twice",
                    vote.author_idx
                )));
            }
            if vote.new_view {
                new_view_votes += 1;
            }
            if vote.block_id.is_some() && vote.block_id == qc.block_id {
                block_votes += 1;
            }
        }
        Ok((new_view_votes, block_votes))
    }

    pub(super) fn verify_vote_signature(
        &self,
        vote: &VoteData,
        validator: &Validator,
    ) -> ConsensusResult<()> {
        let signature = vote.signature.as_ref().ok_or_else(|| {
            ConsensusError::InvalidSignature(format!("unsigned vote from {}", vote.author))
        })?;
        if signature.signer != validator.public_key
            || !self
                .sig_verifier
                .verify(&validator.public_key, &vote.signing_bytes()?, signature)
        {
            return Err(ConsensusError::InvalidSignature(format!(
                "bad vote signature from {}",
                vote.author
            )));
        }
        Ok(())
    }

    /// Check the QC attached to a block certifies that block.
    pub(super) fn verify_block_certificate(&self, epoch: &Epoch, block: &Block) -> ConsensusResult<()> {
        let qc = block.qc.as_ref().ok_or_else(|| {
            ConsensusError::InvalidQc(format!(
                "block {} has no certificate",
                short_hash(&block.hash())
            ))
        })?;
        if qc.block_id != Some(block.hash()) || qc.height != block.height() {
            return Err(ConsensusError::InvalidQc(format!(
                "certificate does not certify block {}",
                short_hash(&block.hash())
            )));
        }
        if block.is_genesis() && qc.level == 0 {
            return Ok(());
        }
        self.verify_justify_qc(epoch, qc)
    }

    /// Proposer signature over the block hash, checked against the
    /// validator named in the header.
    pub(super) fn verify_proposer_signature(&self, epoch: &Epoch, block: &Block) -> ConsensusResult<()> {
        let proposer = epoch
            .smr
            .committee()
            .peers_at(block.height())
            .iter()
            .find(|v| v.node_id == block.header.proposer)
            .ok_or_else(|| {
                ConsensusError::InvalidProposer(format!(
                    "{} is not a validator at height {}",
                    block.header.proposer,
                    block.height()
                ))
            })?;
        let signature = block.header.signature.as_ref().ok_or_else(|| {
            ConsensusError::InvalidSignature(format!("unsigned block {}", short_hash(&block.hash())))
        })?;
        if signature.signer != proposer.public_key
            || !self
                .sig_verifier
                .verify(&proposer.public_key, &block.hash(), signature)
        {
            return Err(ConsensusError::InvalidSignature(format!(
                "bad proposer signature on block {}",
                short_hash(&block.hash())
            )));
        }
        Ok(())
    }

    /// Structural and ledger checks on a proposed block.
    pub(super) fn validate_block(&self, epoch: &Epoch, proposal: &ProposalMsg) -> ConsensusResult<()> {
        let data = &proposal.proposal_data;
        let block = &data.block;
        if block.height() != data.height
            || block.level() != data.level
            || block.header.proposer != data.proposer
        {
            return Err(ConsensusError::InvalidBlock(format!(
                "block {} disagrees with its proposal",
                short_hash(&block.hash())
            )));
        }
        if block.height() != data.justify_qc.height + 1 {
            return Err(ConsensusError::InvalidBlock(format!(
                "block at height {} justified by certificate at height {}",
                block.height(),
                data.justify_qc.height
            )));
        }
        match epoch.chain_store.get_block(&block.pre_hash()) {
            Some(parent) if parent.height() + 1 == block.height() => {}
            _ => {
                return Err(ConsensusError::OrphanBlock {
                    block: short_hash(&block.hash()),
                    parent: short_hash(&block.pre_hash()),
                })
            }
        }
        if !block.verify_hash() {
            return Err(ConsensusError::InvalidBlock(format!(
                "hash mismatch on block {}",
                short_hash(&block.hash())
            )));
        }
        self.verify_proposer_signature(epoch, block)?;
        match self.verifier.verify_block(block) {
            Ok(()) => Ok(()),
            Err(LedgerError::AlreadyCommitted(height)) => Err(ConsensusError::StaleMessage(format!(
                "proposal at committed height {}",
                height
            ))),
            Err(err) => Err(ConsensusError::InvalidBlock(err.to_string())),
        }
    }

    /// Does `qc` reference data this node must fetch first?
    pub(super) fn need_fetch(&self, epoch: &Epoch, qc: &QuorumCert) -> ConsensusResult<bool> {
        let root_level = epoch.chain_store.root_level();
        if qc.level < root_level {
            return Err(ConsensusError::StaleMessage(format!(
                "certificate level {} below committed level {}",
                qc.level, root_level
            )));
        }
        let Some(block_id) = qc.block_id else {
            return Ok(false);
        };
        let height = epoch.smr.height();
        if qc.height > height + MAX_SYNC_BLOCK_NUM {
            return Err(ConsensusError::InvalidQc(format!(
                "certificate height {} too far ahead of {}",
                qc.height, height
            )));
        }
        let Some(block) = epoch.chain_store.get_block(&block_id) else {
            return Ok(true);
        };
        if block.height() == 0 {
            return Ok(false);
        }
        Ok(epoch.chain_store.get_qc(&block.pre_hash()).is_none())
    }
}
