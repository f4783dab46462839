//! Vote, lock and commit rules
//!
//! Every setter is monotonic: an update that would lower the stored level
//! is ignored, so replaying the same inputs leaves the state unchanged.

use super::{short_hash, Block, BlockPool, ConsensusError, ConsensusResult, Hash, QuorumCert, VoteMsg};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

struct SafetyState {
    last_vote_level: u64,
    last_vote: Option<VoteMsg>,
    locked_level: u64,
    locked_block: Arc<Block>,
    last_committed_level: u64,
    last_committed_block: Option<Arc<Block>>,
}

pub struct SafetyRules {
    pool: Arc<BlockPool>,
    state: RwLock<SafetyState>,
}

impl SafetyRules {
    /// Lock starts on the pool root at the level of the highest known QC.
    pub fn new(pool: Arc<BlockPool>) -> Self {
        let state = SafetyState {
            last_vote_level: 0,
            last_vote: None,
            locked_level: pool.highest_qc().level,
            locked_block: pool.root_block(),
            last_committed_level: 0,
            last_committed_block: None,
        };
        Self {
            pool,
            state: RwLock::new(state),
        }
    }

    pub fn last_vote_level(&self) -> u64 {
        self.state.read().last_vote_level
    }

    pub fn last_vote(&self) -> (u64, Option<VoteMsg>) {
        let state = self.state.read();
        (state.last_vote_level, state.last_vote.clone())
    }

    pub fn locked_level(&self) -> u64 {
        self.state.read().locked_level
    }

    pub fn locked_block(&self) -> Arc<Block> {
        Arc::clone(&self.state.read().locked_block)
    }

    pub fn last_committed_level(&self) -> u64 {
        self.state.read().last_committed_level
    }

    pub fn last_committed_block(&self) -> Option<Arc<Block>> {
        self.state.read().last_committed_block.clone()
    }

    pub fn set_last_vote(&self, vote: VoteMsg, level: u64) {
        let mut state = self.state.write();
        if level <= state.last_vote_level {
            return;
        }
        state.last_vote = Some(vote);
        state.last_vote_level = level;
    }

    pub fn set_last_committed_block(&self, block: Arc<Block>, level: u64) {
        let mut state = self.state.write();
        let lower_height = state
            .last_committed_block
            .as_ref()
            .is_some_and(|last| block.height() <= last.height());
        if level <= state.last_committed_level || lower_height {
            return;
        }
        state.last_committed_block = Some(block);
        state.last_committed_level = level;
    }

    /// May this node vote at `level` for a proposal justified by `qc`?
    pub fn vote_rules(&self, level: u64, qc: &QuorumCert) -> bool {
        let state = self.state.read();
        if level <= state.last_vote_level {
            debug!(
                "[hotstuff] vote rules: level {} not above last vote level {}",
                level, state.last_vote_level
            );
            return false;
        }
        let Some(block) = qc.block_id.and_then(|id| self.pool.get_block(&id)) else {
            debug!("[hotstuff] vote rules: block of qc at level {} unknown", qc.level);
            return false;
        };
        if block.level() != qc.level {
            debug!(
                "[hotstuff] vote rules: qc level {} disagrees with block level {}",
                qc.level,
                block.level()
            );
            return false;
        }
        if qc.level < state.locked_level {
            debug!(
                "[hotstuff] vote rules: qc level {} below locked level {}",
                qc.level, state.locked_level
            );
            return false;
        }
        true
    }

    /// Accept a proposal if its justify QC is newer than the lock, or if its
    /// block extends the locked block.
    ///
    /// `lookup` resolves ancestors that may already have left the pool.
    pub fn safe_node<F>(&self, block: &Block, justify_qc: &QuorumCert, lookup: F) -> ConsensusResult<()>
    where
        F: Fn(&Hash) -> Option<Arc<Block>>,
    {
        let state = self.state.read();
        if justify_qc.level > state.locked_level {
            return Ok(());
        }

        let locked = &state.locked_block;
        let mut cur_height = block.height();
        let mut cur_hash = block.hash();
        let mut pre_hash = block.pre_hash();
        while cur_height > locked.height() {
            let Some(parent) = lookup(&pre_hash) else {
                return Err(ConsensusError::NoSuchBlock(short_hash(&pre_hash)));
            };
            cur_height = parent.height();
            cur_hash = parent.hash();
            pre_hash = parent.pre_hash();
        }
        if cur_hash != locked.hash() {
            return Err(ConsensusError::UnsafeProposal(format!(
                "block {} does not extend locked block {}",
                short_hash(&block.hash()),
                short_hash(&locked.hash())
            )));
        }
        Ok(())
    }

    /// Three-chain rule.
    ///
    /// Returns the grandparent of the certified block, with its own QC level,
    /// once the certified block, its parent and its grandparent are
    /// certified at contiguous heights.
    pub fn commit_rules(&self, qc: &QuorumCert) -> Option<(Arc<Block>, u64)> {
        if qc.new_view {
            return None;
        }
        let block = self.pool.get_block(&qc.block_id?)?;
        let parent = self.pool.get_block(&block.pre_hash())?;
        let grand = self.pool.get_block(&parent.pre_hash())?;
        let parent_qc = self.pool.get_qc(&parent.hash())?;
        let grand_qc = self.pool.get_qc(&grand.hash())?;

        if qc.height == parent_qc.height + 1 && parent_qc.height == grand_qc.height + 1 {
            debug!(
                "[hotstuff] commit rules: three-chain at heights {}/{}/{}",
                qc.height, parent_qc.height, grand_qc.height
            );
            return Some((grand, grand_qc.level));
        }
        None
    }

    /// Two-chain rule: lock on the parent of the certified block.
    pub fn update_locked_qc(&self, qc: &QuorumCert) {
        if qc.new_view {
            return;
        }
        let Some(id) = qc.block_id else {
            return;
        };
        let mut state = self.state.write();
        let Some(block) = self.pool.get_block(&id) else {
            return;
        };
        let Some(parent) = self.pool.get_block(&block.pre_hash()) else {
            return;
        };
        let Some(parent_qc) = self.pool.get_qc(&parent.hash()) else {
            return;
        };
        let root_level = self.pool.root_qc().map(|root| root.level).unwrap_or(0);
        if parent_qc.level <= root_level || parent_qc.level <= state.locked_level {
            return;
        }
        debug!(
            "[hotstuff] lock raised from level {} to {}",
            state.locked_level, parent_qc.level
        );
        state.locked_level = parent_qc.level;
        state.locked_block = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SyncInfo, VoteData};

    fn block_at(parent: &Block, level: u64) -> Block {
        let mut block = Block::new(parent.height() + 1, parent.hash(), vec![level as u8], level);
        block.header.level = level;
        block.seal();
        block
    }

    fn qc_for(block: &Block) -> QuorumCert {
        QuorumCert {
            block_id: Some(block.hash()),
            height: block.height(),
            level: block.level(),
            epoch_id: 0,
            new_view: false,
            votes: Vec::new(),
        }
    }

    fn vote_at(level: u64, qc: &QuorumCert) -> VoteMsg {
        VoteMsg {
            vote_data: VoteData {
                author: "node-0".into(),
                author_idx: 0,
                height: qc.height + 1,
                level,
                epoch_id: 0,
                block_id: None,
                new_view: false,
                signature: None,
            },
            sync_info: SyncInfo {
                highest_qc: qc.clone(),
                highest_tc: None,
                highest_tc_level: 0,
            },
        }
    }

    struct Chain {
        pool: Arc<BlockPool>,
        rules: SafetyRules,
        root: Block,
        blocks: Vec<Block>,
    }

    /// Root at height 100 / level 100, certified children 101..=103.
    fn chain_of_three() -> Chain {
        let mut root = Block::new(100, [0xAB; 32], vec![], 0);
        root.header.level = 100;
        root.seal();
        let pool = Arc::new(BlockPool::new(root.clone(), qc_for(&root), 10));
        let rules = SafetyRules::new(Arc::clone(&pool));
        let b101 = block_at(&root, 101);
        let b102 = block_at(&b101, 102);
        let b103 = block_at(&b102, 103);
        for block in [&b101, &b102, &b103] {
            pool.insert_block(block.clone()).unwrap();
            pool.insert_qc(qc_for(block)).unwrap();
        }
        Chain {
            pool,
            rules,
            root,
            blocks: vec![b101, b102, b103],
        }
    }

    #[test]
    fn test_three_chain_commit() {
        let chain = chain_of_three();
        let (committed, level) = chain.rules.commit_rules(&qc_for(&chain.blocks[2])).unwrap();
        assert_eq!(committed.hash(), chain.blocks[0].hash());
        assert_eq!(level, 101);

        let (committed, level) = chain.rules.commit_rules(&qc_for(&chain.blocks[1])).unwrap();
        assert_eq!(committed.hash(), chain.root.hash());
        assert_eq!(level, 100);

        assert!(chain.rules.commit_rules(&qc_for(&chain.blocks[0])).is_none());
    }

    #[test]
    fn test_commit_rules_ignore_timeout_certificate() {
        let chain = chain_of_three();
        let mut tc = qc_for(&chain.blocks[2]);
        tc.new_view = true;
        assert!(chain.rules.commit_rules(&tc).is_none());
    }

    #[test]
    fn test_commit_rules_need_contiguous_heights() {
        let chain = chain_of_three();
        // a fork certified two heights above its grandparent's certificate
        let gap = block_at(&chain.blocks[1], 110);
        chain.pool.insert_block(gap.clone()).unwrap();
        let mut gap_qc = qc_for(&gap);
        gap_qc.height += 1;
        assert!(chain.rules.commit_rules(&gap_qc).is_none());
    }

    #[test]
    fn test_conflicting_commits_impossible() {
        let chain = chain_of_three();
        let fork = block_at(&chain.blocks[0], 104);
        let fork_child = block_at(&fork, 105);
        for block in [&fork, &fork_child] {
            chain.pool.insert_block(block.clone()).unwrap();
            chain.pool.insert_qc(qc_for(block)).unwrap();
        }

        let (a, _) = chain.rules.commit_rules(&qc_for(&chain.blocks[2])).unwrap();
        let (b, _) = chain.rules.commit_rules(&qc_for(&fork_child)).unwrap();
        assert_eq!(a.height(), b.height());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_lock_follows_two_chain_and_is_monotonic() {
        let chain = chain_of_three();
        assert_eq!(chain.rules.locked_level(), 100);

        let b104 = block_at(&chain.blocks[2], 104);
        let b105 = block_at(&b104, 105);
        for block in [&b104, &b105] {
            chain.pool.insert_block(block.clone()).unwrap();
            chain.pool.insert_qc(qc_for(block)).unwrap();
        }

        chain.rules.update_locked_qc(&qc_for(&b105));
        assert_eq!(chain.rules.locked_level(), 104);
        assert_eq!(chain.rules.locked_block().hash(), b104.hash());

        // late and replayed certificates never lower the lock
        for block in [&chain.blocks[1], &chain.blocks[2], &b104, &b105] {
            chain.rules.update_locked_qc(&qc_for(block));
            assert_eq!(chain.rules.locked_level(), 104);
        }
    }

    #[test]
    fn test_lock_starts_at_root_when_empty() {
        let mut root = Block::new(10, [0u8; 32], vec![], 0);
        root.header.level = 12;
        root.seal();
        let pool = Arc::new(BlockPool::new(root.clone(), qc_for(&root), 10));
        let rules = SafetyRules::new(Arc::clone(&pool));
        assert_eq!(rules.locked_level(), 12);

        let b = block_at(&root, 13);
        let c = block_at(&b, 14);
        pool.insert_block(b.clone()).unwrap();
        pool.insert_block(c.clone()).unwrap();
        pool.insert_qc(qc_for(&b)).unwrap();
        pool.insert_qc(qc_for(&c)).unwrap();
        rules.update_locked_qc(&qc_for(&c));
        assert_eq!(rules.locked_level(), 13);
    }

    #[test]
    fn test_vote_once_per_level() {
        let chain = chain_of_three();
        let justify = qc_for(&chain.blocks[2]);
        assert!(chain.rules.vote_rules(104, &justify));
        chain.rules.set_last_vote(vote_at(104, &justify), 104);
        assert!(!chain.rules.vote_rules(104, &justify));
        assert!(!chain.rules.vote_rules(103, &justify));
        assert!(chain.rules.vote_rules(105, &justify));
    }

    #[test]
    fn test_set_last_vote_is_monotonic() {
        let chain = chain_of_three();
        let justify = qc_for(&chain.blocks[2]);
        chain.rules.set_last_vote(vote_at(106, &justify), 106);
        chain.rules.set_last_vote(vote_at(105, &justify), 105);
        let (level, vote) = chain.rules.last_vote();
        assert_eq!(level, 106);
        assert_eq!(vote.unwrap().vote_data.level, 106);
    }

    #[test]
    fn test_vote_rules_reject_forged_level() {
        let chain = chain_of_three();
        let mut forged = qc_for(&chain.blocks[2]);
        forged.level = 150;
        assert!(!chain.rules.vote_rules(151, &forged));
    }

    #[test]
    fn test_vote_rules_level_five_and_six() {
        let mut genesis = Block::new(0, [0u8; 32], vec![], 0);
        genesis.seal();
        let pool = Arc::new(BlockPool::new(genesis.clone(), qc_for(&genesis), 10));
        let rules = SafetyRules::new(Arc::clone(&pool));

        let mut parent = genesis.clone();
        let mut blocks = Vec::new();
        for level in 1..=4 {
            let block = block_at(&parent, level);
            pool.insert_block(block.clone()).unwrap();
            pool.insert_qc(qc_for(&block)).unwrap();
            blocks.push(block.clone());
            parent = block;
        }
        rules.update_locked_qc(&qc_for(&blocks[3]));
        assert_eq!(rules.locked_level(), 3);

        let justify = qc_for(&blocks[3]);
        rules.set_last_vote(vote_at(5, &justify), 5);
        // a proposal at level 5 must not be voted again
        assert!(!rules.vote_rules(5, &justify));
        // a proposal at level 6 justified below the lock is rejected
        assert!(!rules.vote_rules(6, &qc_for(&blocks[1])));
        assert!(rules.vote_rules(6, &justify));
    }

    #[test]
    fn test_safe_node_liveness_and_safety_paths() {
        let chain = chain_of_three();
        chain.rules.update_locked_qc(&qc_for(&chain.blocks[2]));
        assert_eq!(chain.rules.locked_level(), 102);
        let lookup = |id: &Hash| chain.pool.get_block(id);
        // extends the locked block
        let good = block_at(&chain.blocks[2], 104);
        let stale_justify = qc_for(&chain.blocks[0]);
        assert!(chain.rules.safe_node(&good, &stale_justify, lookup).is_ok());

        // a fork off the root with an old justify QC conflicts with the lock
        let fork = block_at(&chain.root, 104);
        let err = chain
            .rules
            .safe_node(&fork, &qc_for(&chain.root), lookup)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::UnsafeProposal(_)));
        assert!(!err.is_fatal());

        // a newer justify QC unlocks
        let mut newer = qc_for(&chain.blocks[2]);
        newer.level = 200;
        assert!(chain.rules.safe_node(&fork, &newer, lookup).is_ok());
    }

    #[test]
    fn test_last_committed_is_monotonic() {
        let chain = chain_of_three();
        let b101 = Arc::new(chain.blocks[0].clone());
        let b102 = Arc::new(chain.blocks[1].clone());
        chain.rules.set_last_committed_block(Arc::clone(&b102), 102);
        chain.rules.set_last_committed_block(b101, 101);
        assert_eq!(chain.rules.last_committed_level(), 102);
        assert_eq!(
            chain.rules.last_committed_block().unwrap().hash(),
            b102.hash()
        );
    }
}
