//! Proposal and vote handling, level transitions, commits and epoch
//! switches. Every entry point here runs under the process lock.

use super::chain_store::ChainStore;
use super::epoch::Epoch;
use super::ConsensusService;
use crate::domain::{
    short_hash, Block, CommitteeSnapshot, ConsStateType, ConsensusError, ConsensusResult, Hash,
    QuorumCert, SyncInfo, TimerEvent, VotesDone,
};
use crate::events::{BuildProposal, ConsensusMsg, ConsensusPayload, ProposalMsg};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl ConsensusService {
    pub(super) async fn process_proposal(&self, epoch: &Epoch, msg: ConsensusMsg) -> ConsensusResult<()> {
        let ConsensusPayload::Proposal(proposal) = &msg.payload else {
            return Ok(());
        };
        let data = &proposal.proposal_data;
        if data.level < epoch.smr.level() {
            return Err(ConsensusError::StaleMessage(format!(
                "proposal at level {} behind level {}",
                data.level,
                epoch.smr.level()
            )));
        }
        if data.epoch_id != epoch.epoch_id {
            return Err(ConsensusError::EpochMismatch {
                expected: epoch.epoch_id,
                actual: data.epoch_id,
            });
        }
        if epoch.msg_pool.has_proposal(data.height, data.level) {
            return Err(ConsensusError::DuplicateProposal {
                height: data.height,
                level: data.level,
            });
        }

        let proposer = epoch
            .smr
            .proposer(data.height, data.level)
            .cloned()
            .ok_or_else(|| ConsensusError::InvalidProposer("empty committee".to_string()))?;
        if proposer.index != data.proposer_idx || proposer.node_id != data.proposer {
            return Err(ConsensusError::InvalidProposer(format!(
                "{} is not the proposer of height {} level {}",
                data.proposer, data.height, data.level
            )));
        }
        self.verify_msg_signature(&msg, &proposer)?;
        self.verify_justify_qc(epoch, &data.justify_qc)?;
        if data.justify_qc.block_id != Some(data.block.pre_hash()) {
            return Err(ConsensusError::InvalidQc(format!(
                "justify certificate does not certify the parent of {}",
                short_hash(&data.block.hash())
            )));
        }

        if self.need_fetch(epoch, &data.justify_qc)? {
            if !self.done_replay.load(Ordering::SeqCst) {
                return Err(ConsensusError::NoSuchBlock(format!(
                    "parent {} missing during replay",
                    short_hash(&data.block.pre_hash())
                )));
            }
            self.fetch_and_apply(epoch, &data.justify_qc, &proposer).await?;
        }

        let lookup = |id: &Hash| epoch.chain_store.get_block(id);
        epoch.smr.safety().safe_node(&data.block, &data.justify_qc, lookup)?;
        self.validate_block(epoch, proposal)?;

        self.process_qc(epoch, &data.justify_qc)?;
        self.process_sync_tc(epoch, &proposal.sync_info)?;

        epoch
            .msg_pool
            .insert_proposal(data.height, data.level, proposal.clone())?;
        if self.done_replay.load(Ordering::SeqCst) {
            let index = self.save_wal_entry(&msg)?;
            self.add_proposal_wal_index(data.height, index);
        }
        epoch.chain_store.insert_block(data.block.clone())?;
        debug!(
            "[hotstuff] accepted proposal {} at height {} level {} from {}",
            short_hash(&data.block.hash()),
            data.height,
            data.level,
            data.proposer
        );

        self.vote_for_proposal(epoch, proposal)?;
        // votes may have reached quorum before the block itself arrived
        self.process_votes(epoch, data.height, data.level)
    }

    fn vote_for_proposal(&self, epoch: &Epoch, proposal: &ProposalMsg) -> ConsensusResult<()> {
        let data = &proposal.proposal_data;
        if data.level != epoch.smr.level() || !epoch.smr.safety().vote_rules(data.level, &data.justify_qc) {
            return Ok(());
        }
        epoch.smr.set_state(ConsStateType::Vote);
        if !self.done_replay.load(Ordering::SeqCst) {
            return Ok(());
        }
        if epoch.index_at(data.height).is_none() {
            return Ok(());
        }

        let vote = self.construct_vote(epoch, data.height, data.level, Some(data.block.hash()), false)?;
        epoch.smr.safety().set_last_vote(vote.clone(), data.level);
        let vote_msg = self.sign_msg(ConsensusPayload::Vote(vote))?;
        let index = self.save_wal_entry(&vote_msg)?;
        self.add_proposal_wal_index(data.height, index);

        let leader = epoch
            .smr
            .next_leader(data.height, data.level)
            .map(|v| v.node_id.clone())
            .ok_or_else(|| ConsensusError::InvalidProposer("empty committee".to_string()))?;
        debug!(
            "[hotstuff] vote for {} at level {} sent to {}",
            short_hash(&data.block.hash()),
            data.level,
            leader
        );
        self.send_to(&leader, &vote_msg)
    }

    pub(super) async fn process_vote(&self, epoch: &Epoch, msg: ConsensusMsg) -> ConsensusResult<()> {
        let ConsensusPayload::Vote(vote_msg) = &msg.payload else {
            return Ok(());
        };
        let vote = &vote_msg.vote_data;
        if vote.epoch_id != epoch.epoch_id {
            return Err(ConsensusError::EpochMismatch {
                expected: epoch.epoch_id,
                actual: vote.epoch_id,
            });
        }
        let author = epoch
            .smr
            .committee()
            .validator_by_index(vote.height, vote.author_idx)
            .cloned()
            .ok_or(ConsensusError::UnknownValidator {
                index: vote.author_idx,
                height: vote.height,
            })?;
        if author.node_id != vote.author {
            return Err(ConsensusError::InvalidSignature(format!(
                "vote author {} does not hold index {}",
                vote.author, vote.author_idx
            )));
        }
        self.verify_msg_signature(&msg, &author)?;
        self.verify_vote_signature(vote, &author)?;

        let own_vote = author.node_id == self.node_id();
        if own_vote {
            // restores the vote-once guard when the vote comes back from the WAL
            epoch.smr.safety().set_last_vote(vote_msg.clone(), vote.level);
        }
        if vote.level < epoch.smr.level() {
            return Err(ConsensusError::StaleMessage(format!(
                "vote at level {} behind level {}",
                vote.level,
                epoch.smr.level()
            )));
        }
        if !vote.new_view {
            let leads_next = epoch
                .smr
                .next_leader(vote.height, vote.level)
                .is_some_and(|v| v.node_id == self.node_id());
            if !leads_next {
                return Err(ConsensusError::InvalidProposer(format!(
                    "vote at level {} sent to a node that does not lead level {}",
                    vote.level,
                    vote.level + 1
                )));
            }
        }

        if self.need_fetch(epoch, &vote_msg.sync_info.highest_qc)? {
            if !self.done_replay.load(Ordering::SeqCst) {
                return Err(ConsensusError::NoSuchBlock("certificate block missing during replay".to_string()));
            }
            self.fetch_and_apply(epoch, &vote_msg.sync_info.highest_qc, &author)
                .await?;
        }

        let quorum = epoch.smr.committee().quorum_at(vote.height);
        if !epoch.msg_pool.insert_vote(vote, quorum)? {
            return Ok(());
        }
        if !own_vote && self.done_replay.load(Ordering::SeqCst) {
            self.save_wal_entry(&msg)?;
        }

        self.process_sync_info(epoch, &vote_msg.sync_info)?;
        self.process_votes(epoch, vote.height, vote.level)
    }

    /// Adopt the certificates a peer gossiped.
    fn process_sync_info(&self, epoch: &Epoch, sync_info: &SyncInfo) -> ConsensusResult<()> {
        let tc_level = self.adopt_tc(epoch, sync_info)?;
        self.verify_justify_qc(epoch, &sync_info.highest_qc)?;
        self.insert_certified(epoch, &sync_info.highest_qc)?;
        self.process_certificates(epoch, tc_level)?;
        Ok(())
    }

    /// Certificates carried by a proposal: the justify QC is handled by the
    /// caller, only the TC is left.
    fn process_sync_tc(&self, epoch: &Epoch, sync_info: &SyncInfo) -> ConsensusResult<()> {
        if let Some(level) = self.adopt_tc(epoch, sync_info)? {
            self.process_certificates(epoch, Some(level))?;
        }
        Ok(())
    }

    fn adopt_tc(&self, epoch: &Epoch, sync_info: &SyncInfo) -> ConsensusResult<Option<u64>> {
        let Some(tc) = &sync_info.highest_tc else {
            return Ok(None);
        };
        if tc.level < sync_info.highest_qc.level || tc.level <= epoch.smr.highest_tc_level() {
            return Ok(None);
        }
        self.verify_justify_qc(epoch, tc)?;
        epoch.smr.update_tc(tc.clone());
        Ok(Some(tc.level))
    }

    /// Insert a verified justify QC and advance on it.
    fn process_qc(&self, epoch: &Epoch, qc: &QuorumCert) -> ConsensusResult<()> {
        self.insert_certified(epoch, qc)?;
        self.process_certificates(epoch, None)?;
        Ok(())
    }

    fn insert_certified(&self, epoch: &Epoch, qc: &QuorumCert) -> ConsensusResult<()> {
        let Some(id) = qc.block_id else {
            return Ok(());
        };
        if qc.new_view || epoch.chain_store.contains_qc(&id) {
            return Ok(());
        }
        epoch.chain_store.insert_qc(qc.clone())?;
        self.commit_blocks_by_qc(epoch, qc)
    }

    /// Aggregate once a quorum is reached at (height, level).
    fn process_votes(&self, epoch: &Epoch, height: u64, level: u64) -> ConsensusResult<()> {
        let Some(done) = epoch.msg_pool.check_votes_done(height, level) else {
            return Ok(());
        };
        let votes = epoch.msg_pool.qc_votes(height, level);
        match done {
            VotesDone::Block(block_id) => {
                if epoch.chain_store.contains_qc(&block_id) {
                    return Ok(());
                }
                if epoch.chain_store.get_block(&block_id).is_none() {
                    debug!(
                        "[hotstuff] quorum for unknown block {}, waiting",
                        short_hash(&block_id)
                    );
                    return Ok(());
                }
                let qc = QuorumCert {
                    block_id: Some(block_id),
                    height,
                    level,
                    epoch_id: epoch.epoch_id,
                    new_view: false,
                    votes,
                };
                info!(
                    "[hotstuff] qc formed for {} at height {} level {}",
                    short_hash(&block_id),
                    height,
                    level
                );
                epoch.chain_store.insert_qc(qc.clone())?;
                crate::metrics::record_certificate("qc");
                self.commit_blocks_by_qc(epoch, &qc)?;
                self.process_certificates(epoch, None)?;
            }
            VotesDone::NewView => {
                if level <= epoch.smr.highest_tc_level() {
                    return Ok(());
                }
                let tc = QuorumCert {
                    block_id: None,
                    height,
                    level,
                    epoch_id: epoch.epoch_id,
                    new_view: true,
                    votes,
                };
                info!("[hotstuff] tc formed at height {} level {}", height, level);
                crate::metrics::record_certificate("tc");
                epoch.smr.update_tc(tc);
                self.process_certificates(epoch, Some(level))?;
            }
        }

        let (height, level) = (epoch.smr.height(), epoch.smr.level());
        if epoch.smr.is_proposer(self.node_id(), height, level)
            && epoch.smr.state() < ConsStateType::Propose
        {
            epoch.smr.set_state(ConsStateType::Propose);
            self.process_new_propose(epoch)?;
        }
        Ok(())
    }

    /// Fold the highest certificates into the pacemaker. On a level change
    /// the timer is re-armed and the new level is entered.
    pub(super) fn process_certificates(&self, epoch: &Epoch, tc_level: Option<u64>) -> ConsensusResult<bool> {
        let highest_qc = epoch.chain_store.highest_qc();
        let safety = epoch.smr.safety();
        safety.update_locked_qc(&highest_qc);
        let Some(advance) = epoch.smr.process_certificates(
            highest_qc.height,
            highest_qc.level,
            tc_level.unwrap_or(0),
            safety.last_committed_level(),
        ) else {
            return Ok(false);
        };
        debug!(
            "[hotstuff] entering height {} level {}",
            advance.timer.height, advance.timer.level
        );
        self.timer.arm(advance.timer);
        epoch.smr.set_state(ConsStateType::NewHeight);
        self.process_new_height(epoch)?;
        Ok(true)
    }

    pub(super) fn process_new_height(&self, epoch: &Epoch) -> ConsensusResult<()> {
        if epoch.smr.state() != ConsStateType::NewHeight {
            return Ok(());
        }
        let height = epoch.smr.height();
        if epoch.index_at(height).is_none() {
            return Ok(());
        }
        epoch.smr.set_state(ConsStateType::NewLevel);
        self.process_new_level(epoch, height, epoch.smr.level())
    }

    pub(super) fn process_new_level(&self, epoch: &Epoch, height: u64, level: u64) -> ConsensusResult<()> {
        if height != epoch.smr.height()
            || level != epoch.smr.level()
            || epoch.smr.state() != ConsStateType::NewLevel
        {
            return Ok(());
        }
        if epoch.chain_store.highest_certified_block().level() >= level {
            return Ok(());
        }
        if epoch.smr.is_proposer(self.node_id(), height, level) {
            epoch.smr.set_state(ConsStateType::Propose);
            self.process_new_propose(epoch)?;
        }
        Ok(())
    }

    /// Ask the block builder for a block, once per (height, level).
    fn process_new_propose(&self, epoch: &Epoch) -> ConsensusResult<()> {
        if epoch.smr.state() != ConsStateType::Propose || !self.done_replay.load(Ordering::SeqCst) {
            return Ok(());
        }
        let (height, level) = (epoch.smr.height(), epoch.smr.level());
        {
            let mut requested = self.proposal_requested.lock();
            if *requested == Some((height, level)) {
                return Ok(());
            }
            *requested = Some((height, level));
        }
        let pre_hash = epoch
            .chain_store
            .highest_qc()
            .block_id
            .unwrap_or_else(|| epoch.chain_store.root_block().hash());
        info!(
            "[hotstuff] proposer of height {} level {}, requesting block on {}",
            height,
            level,
            short_hash(&pre_hash)
        );
        self.builder.request_proposal(BuildProposal {
            height,
            pre_hash,
            is_proposer: true,
        })
    }

    /// Turn a built block into a signed proposal.
    pub(super) fn process_proposed_block(&self, epoch: &Epoch, block: Block) -> ConsensusResult<()> {
        let (height, level) = (epoch.smr.height(), epoch.smr.level());
        if !epoch.smr.is_proposer(self.node_id(), height, level) {
            return Err(ConsensusError::StaleMessage(format!(
                "built block arrived after leaving level {}",
                level
            )));
        }
        if block.height() != height {
            return Err(ConsensusError::StaleMessage(format!(
                "built block at height {}, current height {}",
                block.height(),
                height
            )));
        }
        if epoch.msg_pool.has_proposal(height, level) || *self.proposed.lock() == Some((height, level)) {
            return Err(ConsensusError::DuplicateProposal { height, level });
        }
        let highest_qc = epoch.chain_store.highest_qc();
        if highest_qc.block_id != Some(block.pre_hash()) {
            return Err(ConsensusError::StaleMessage(format!(
                "built block extends {}, not the highest certified block",
                short_hash(&block.pre_hash())
            )));
        }

        let proposal = self.construct_proposal(epoch, block)?;
        info!(
            "[hotstuff] proposing {} at height {} level {}",
            short_hash(&proposal.proposal_data.block.hash()),
            height,
            level
        );
        *self.proposed.lock() = Some((height, level));
        self.sign_and_broadcast(epoch, ConsensusPayload::Proposal(proposal))?;
        Ok(())
    }

    /// The level timed out locally: back off, then broadcast a timeout
    /// vote. A vote already cast at this level is retried as a timeout vote
    /// for the same block.
    pub(super) fn process_local_timeout(&self, epoch: &Epoch, event: &TimerEvent) -> ConsensusResult<()> {
        let Some(timer) = epoch.smr.process_local_timeout(event.level) else {
            return Ok(());
        };
        self.timer.arm(timer);
        crate::metrics::record_local_timeout();
        let (height, level) = (epoch.smr.height(), epoch.smr.level());
        warn!("[hotstuff] local timeout at height {} level {}", height, level);
        epoch.smr.set_state(ConsStateType::PaceMaker);

        if epoch.index_at(height).is_none() {
            return Ok(());
        }
        let block_id = match epoch.smr.safety().last_vote() {
            (_, Some(last)) if last.vote_data.height == height && last.vote_data.level == level => {
                last.vote_data.block_id
            }
            _ => None,
        };
        let vote = self.construct_vote(epoch, height, level, block_id, true)?;
        epoch.smr.safety().set_last_vote(vote.clone(), level);

        let msg = self.sign_msg(ConsensusPayload::Vote(vote))?;
        let index = self.save_wal_entry(&msg)?;
        self.add_proposal_wal_index(height, index);
        self.broadcast_msg(epoch, msg)
    }

    /// Commit whatever the three-chain rule allows once `qc` is known.
    pub(super) fn commit_blocks_by_qc(&self, epoch: &Epoch, qc: &QuorumCert) -> ConsensusResult<()> {
        let safety = epoch.smr.safety();
        let Some((block, level)) = safety.commit_rules(qc) else {
            return Ok(());
        };
        if level <= epoch.chain_store.root_level() {
            return Ok(());
        }
        epoch.chain_store.commit_block(&block)?;
        safety.set_last_committed_block(Arc::clone(&block), level);
        epoch.msg_pool.on_block_sealed(block.height());
        Ok(())
    }

    /// The ledger sealed `block`: catch up on pruning, WAL truncation and
    /// governance changes.
    pub(super) fn process_block_committed(&self, block: Block) -> ConsensusResult<()> {
        let height = block.height();
        if height <= self.commit_height.load(Ordering::SeqCst) {
            return Ok(());
        }
        let epoch = self.current_epoch();
        if let Err(err) = epoch.chain_store.insert_completed_block(&block) {
            debug!("[hotstuff] committed block not in pool: {}", err);
        }
        self.commit_height.store(height, Ordering::SeqCst);
        epoch.msg_pool.on_block_sealed(height);
        let root = epoch.chain_store.root_block();
        epoch
            .smr
            .safety()
            .set_last_committed_block(Arc::clone(&root), epoch.chain_store.root_level());

        self.update_wal_index_and_trunc(height)?;
        self.create_next_epoch_if_required()?;

        let switch = self
            .next_epoch
            .lock()
            .as_ref()
            .is_some_and(|next| next.switch_height <= height);
        if switch {
            if let Some(snapshot) = self.next_epoch.lock().take() {
                self.switch_next_epoch(&epoch, snapshot)?;
            }
        }

        let epoch = self.current_epoch();
        self.process_certificates(&epoch, None)?;
        Ok(())
    }

    /// Poll governance. Timing overrides apply at once; a new epoch id is
    /// queued until its switch height commits.
    fn create_next_epoch_if_required(&self) -> ConsensusResult<()> {
        let snapshot = match self.governance.snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("[hotstuff] governance unavailable: {}", err);
                return Ok(());
            }
        };
        let timing = self.config.timing.with_overrides(&snapshot);
        if timing != *self.timing.read() {
            self.reconfigure_timing(timing);
        }

        let current = self.current_epoch().epoch_id;
        if snapshot.epoch_id <= current {
            return Ok(());
        }
        let mut next = self.next_epoch.lock();
        if next.as_ref().map(|n| n.epoch_id) != Some(snapshot.epoch_id) {
            info!(
                "[hotstuff] epoch {} scheduled at height {}",
                snapshot.epoch_id, snapshot.switch_height
            );
            *next = Some(snapshot);
        }
        Ok(())
    }

    fn switch_next_epoch(&self, old: &Epoch, snapshot: CommitteeSnapshot) -> ConsensusResult<()> {
        let chain_store = ChainStore::open(
            Arc::clone(&self.store),
            Arc::clone(&self.committer),
            self.config.max_pruned_size,
        )?;
        let timing = *self.timing.read();
        let epoch = Epoch::new(&snapshot, chain_store, &self.config, timing);
        if let (level, Some(vote)) = old.smr.safety().last_vote() {
            epoch.smr.safety().set_last_vote(vote, level);
        }

        match (old.self_index, epoch.self_index) {
            (None, Some(index)) => info!("[hotstuff] joined committee of epoch {} as {}", epoch.epoch_id, index),
            (Some(_), None) => info!("[hotstuff] left committee at epoch {}", epoch.epoch_id),
            _ => info!("[hotstuff] switched to epoch {}", epoch.epoch_id),
        }
        *self.epoch.write() = Arc::new(epoch);
        self.syncer.abandon();
        self.timer.disarm();
        *self.proposal_requested.lock() = None;
        *self.proposed.lock() = None;
        Ok(())
    }

    /// Fired timer events that still match the current round.
    pub(super) fn process_timer_event(&self, epoch: &Epoch, event: TimerEvent) -> ConsensusResult<()> {
        let stale = event.height != epoch.smr.height()
            || event.level < epoch.smr.level()
            || event.epoch_id != epoch.epoch_id
            || (event.level == epoch.smr.level() && event.state < epoch.smr.state());
        if stale {
            debug!(
                "[hotstuff-timer] stale {:?} event at height {} level {}",
                event.state, event.height, event.level
            );
            return Ok(());
        }
        match event.state {
            ConsStateType::PaceMaker => self.process_local_timeout(epoch, &event),
            ConsStateType::NewLevel => self.process_new_level(epoch, event.height, event.level),
            _ => Ok(()),
        }
    }

    pub(super) async fn handle_protocol_msg(&self, msg: ConsensusMsg) -> ConsensusResult<()> {
        let _guard = self.process_lock.lock().await;
        let epoch = self.current_epoch();
        match &msg.payload {
            ConsensusPayload::Proposal(_) => self.process_proposal(&epoch, msg).await,
            ConsensusPayload::Vote(_) => self.process_vote(&epoch, msg).await,
            other => Err(ConsensusError::Codec(format!(
                "{} on the protocol mailbox",
                other.msg_type().as_str()
            ))),
        }
    }

    pub(super) async fn handle_proposed_block(&self, block: Block) -> ConsensusResult<()> {
        let _guard = self.process_lock.lock().await;
        let epoch = self.current_epoch();
        self.process_proposed_block(&epoch, block)
    }

    pub(super) async fn handle_block_committed(&self, block: Block) -> ConsensusResult<()> {
        let _guard = self.process_lock.lock().await;
        self.process_block_committed(block)
    }

    pub(super) async fn handle_timer_event(&self, event: TimerEvent) -> ConsensusResult<()> {
        let _guard = self.process_lock.lock().await;
        let epoch = self.current_epoch();
        self.process_timer_event(&epoch, event)
    }
}
