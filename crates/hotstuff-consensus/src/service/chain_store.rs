//! Uncommitted blocks in front of the ledger
//!
//! The block pool holds everything above the last committed block; the
//! ledger answers for everything at or below it.

use crate::domain::{
    short_hash, Block, BlockPool, ConsensusError, ConsensusResult, Hash, QuorumCert,
};
use crate::ports::{BlockCommitter, BlockchainStore, LedgerError};
use std::sync::Arc;
use tracing::{debug, info};

pub(crate) struct ChainStore {
    pool: Arc<BlockPool>,
    store: Arc<dyn BlockchainStore>,
    committer: Arc<dyn BlockCommitter>,
}

impl ChainStore {
    /// Root the pool at the ledger's last committed block.
    pub fn open(
        store: Arc<dyn BlockchainStore>,
        committer: Arc<dyn BlockCommitter>,
        max_pruned_size: usize,
    ) -> ConsensusResult<Self> {
        let root = store
            .last_committed_block()
            .ok_or_else(|| ConsensusError::NoSuchBlock("ledger has no committed block".to_string()))?;
        let root_qc = root.qc.clone().ok_or_else(|| {
            ConsensusError::InvalidQc(format!(
                "committed block {} carries no certificate",
                short_hash(&root.hash())
            ))
        })?;
        debug!(
            "[hotstuff] chain store rooted at height {} level {}",
            root.height(),
            root_qc.level
        );
        Ok(Self {
            pool: Arc::new(BlockPool::new(root, root_qc, max_pruned_size)),
            store,
            committer,
        })
    }

    pub fn pool(&self) -> Arc<BlockPool> {
        Arc::clone(&self.pool)
    }

    pub fn root_block(&self) -> Arc<Block> {
        self.pool.root_block()
    }

    pub fn root_level(&self) -> u64 {
        self.pool.root_qc().map(|qc| qc.level).unwrap_or(0)
    }

    pub fn highest_qc(&self) -> QuorumCert {
        self.pool.highest_qc()
    }

    pub fn highest_certified_block(&self) -> Arc<Block> {
        self.pool.highest_certified_block()
    }

    /// Blocks at or below the root must match what the ledger holds.
    pub fn insert_block(&self, block: Block) -> ConsensusResult<()> {
        if block.height() <= self.root_block().height() {
            return match self.store.get_block(block.height()) {
                Some(stored) if stored.hash() == block.hash() => Ok(()),
                _ => Err(ConsensusError::StaleMessage(format!(
                    "block {} at committed height {}",
                    short_hash(&block.hash()),
                    block.height()
                ))),
            };
        }
        self.pool.insert_block(block)
    }

    pub fn insert_qc(&self, qc: QuorumCert) -> ConsensusResult<()> {
        if let Some(id) = qc.block_id {
            if self.pool.get_block(&id).is_none() && self.store.get_block_by_hash(&id).is_some() {
                return Ok(());
            }
        }
        self.pool.insert_qc(qc)
    }

    pub fn contains_qc(&self, id: &Hash) -> bool {
        self.pool.contains_qc(id)
    }

    pub fn get_block(&self, id: &Hash) -> Option<Arc<Block>> {
        self.pool
            .get_block(id)
            .or_else(|| self.store.get_block_by_hash(id).map(Arc::new))
    }

    pub fn get_qc(&self, id: &Hash) -> Option<QuorumCert> {
        self.pool
            .get_qc(id)
            .or_else(|| self.store.get_block_by_hash(id).and_then(|block| block.qc))
    }

    /// Hand every block from the root down to `target` to the ledger, each
    /// with its own certificate attached, then re-root the pool at `target`.
    pub fn commit_block(&self, target: &Block) -> ConsensusResult<Vec<Arc<Block>>> {
        let branch = self.pool.branch_from_root(target).ok_or_else(|| {
            ConsensusError::SafetyViolation(format!(
                "committable block {} does not extend the committed root",
                short_hash(&target.hash())
            ))
        })?;

        for block in &branch {
            let qc = self.pool.get_qc(&block.hash()).ok_or_else(|| {
                ConsensusError::SafetyViolation(format!(
                    "committing uncertified block {}",
                    short_hash(&block.hash())
                ))
            })?;
            let mut sealed = Block::clone(block);
            sealed.qc = Some(qc);
            match self.committer.commit_block(&sealed) {
                Ok(()) => {
                    crate::metrics::record_block_committed();
                    info!(
                        "[hotstuff] committed block {} at height {} level {}",
                        short_hash(&sealed.hash()),
                        sealed.height(),
                        sealed.level()
                    );
                }
                Err(LedgerError::AlreadyCommitted(height)) => {
                    let stored = self.store.get_block(height);
                    if stored.map(|b| b.hash()) != Some(sealed.hash()) {
                        return Err(ConsensusError::SafetyViolation(format!(
                            "ledger holds a different block at height {}",
                            height
                        )));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.pool.prune_block(&target.hash());
        Ok(branch)
    }

    /// Follow a commit the ledger announced. Blocks at or below the root
    /// were already handled by `commit_block`.
    pub fn insert_completed_block(&self, block: &Block) -> ConsensusResult<()> {
        if block.height() <= self.root_block().height() {
            return Ok(());
        }
        if self.pool.get_block(&block.hash()).is_none() {
            return Err(ConsensusError::NoSuchBlock(short_hash(&block.hash())));
        }
        if let Some(qc) = &block.qc {
            self.pool.insert_qc(qc.clone())?;
        }
        self.pool.prune_block(&block.hash());
        Ok(())
    }
}
