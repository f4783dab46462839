//! In-memory ledger
//!
//! Stands in for the node's block store and executor: stores committed
//! blocks by height and hash, and announces each commit on an optional
//! channel so the node can feed it back into `on_block_committed`.

use crate::domain::{Block, Hash};
use crate::ports::{BlockCommitter, BlockVerifier, BlockchainStore, LedgerError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct LedgerInner {
    blocks: BTreeMap<u64, Block>,
    by_hash: HashMap<Hash, u64>,
}

pub struct InMemoryLedger {
    inner: RwLock<LedgerInner>,
    commit_tx: Option<mpsc::UnboundedSender<Block>>,
}

impl InMemoryLedger {
    /// A ledger holding only `genesis`
    pub fn new(genesis: Block) -> Self {
        let mut inner = LedgerInner::default();
        inner.by_hash.insert(genesis.hash(), genesis.height());
        inner.blocks.insert(genesis.height(), genesis);
        Self {
            inner: RwLock::new(inner),
            commit_tx: None,
        }
    }

    /// Like `new`, also returning a receiver of every committed block.
    pub fn with_commit_notify(genesis: Block) -> (Self, mpsc::UnboundedReceiver<Block>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut ledger = Self::new(genesis);
        ledger.commit_tx = Some(tx);
        (ledger, rx)
    }

    pub fn height(&self) -> u64 {
        self.inner
            .read()
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }
}

impl BlockchainStore for InMemoryLedger {
    fn get_block(&self, height: u64) -> Option<Block> {
        self.inner.read().blocks.get(&height).cloned()
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        let inner = self.inner.read();
        let height = inner.by_hash.get(hash)?;
        inner.blocks.get(height).cloned()
    }

    fn last_committed_block(&self) -> Option<Block> {
        self.inner.read().blocks.values().next_back().cloned()
    }
}

impl BlockCommitter for InMemoryLedger {
    fn commit_block(&self, block: &Block) -> Result<(), LedgerError> {
        {
            let mut inner = self.inner.write();
            if inner.blocks.contains_key(&block.height()) {
                return Err(LedgerError::AlreadyCommitted(block.height()));
            }
            let tip = inner.blocks.keys().next_back().copied().unwrap_or(0);
            if block.height() != tip + 1 {
                return Err(LedgerError::Other(format!(
                    "block at height {} does not extend tip {}",
                    block.height(),
                    tip
                )));
            }
            inner.by_hash.insert(block.hash(), block.height());
            inner.blocks.insert(block.height(), block.clone());
        }
        debug!("[hotstuff] ledger sealed block at height {}", block.height());
        if let Some(tx) = &self.commit_tx {
            // a closed receiver only means nobody listens for commits
            let _ = tx.send(block.clone());
        }
        Ok(())
    }
}

impl BlockVerifier for InMemoryLedger {
    fn verify_block(&self, block: &Block) -> Result<(), LedgerError> {
        if block.height() <= self.height() {
            return Err(LedgerError::AlreadyCommitted(block.height()));
        }
        if !block.verify_hash() {
            return Err(LedgerError::Other("block hash mismatch".to_string()));
        }
        Ok(())
    }
}
