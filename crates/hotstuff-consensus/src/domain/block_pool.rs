//! Block tree plus the certificate index, behind one lock

use super::{short_hash, Block, BlockTree, ConsensusError, ConsensusResult, Hash, QuorumCert};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct PoolInner {
    tree: BlockTree,
    id_to_qc: HashMap<Hash, QuorumCert>,
    highest_qc: QuorumCert,
    highest_certified_block: Arc<Block>,
}

/// In-memory store of uncommitted blocks and their certificates
///
/// `id_to_qc` only holds certificates for blocks present in the tree, and
/// pruning removes both together.
pub struct BlockPool {
    inner: RwLock<PoolInner>,
}

impl BlockPool {
    /// Create a pool rooted at `root_block`, certified by `root_qc`.
    pub fn new(root_block: Block, root_qc: QuorumCert, max_pruned_size: usize) -> Self {
        let tree = BlockTree::new(root_block, max_pruned_size);
        let root = Arc::clone(tree.root());
        let mut id_to_qc = HashMap::new();
        id_to_qc.insert(root.hash(), root_qc.clone());
        Self {
            inner: RwLock::new(PoolInner {
                tree,
                id_to_qc,
                highest_qc: root_qc,
                highest_certified_block: root,
            }),
        }
    }

    pub fn insert_block(&self, block: Block) -> ConsensusResult<()> {
        let mut inner = self.inner.write();
        let id = block.hash();
        inner.tree.insert_block(block)?;
        if inner.id_to_qc.contains_key(&id) {
            if let Some(block) = inner.tree.get_block(&id) {
                if inner.highest_certified_block.height() < block.height() {
                    inner.highest_certified_block = block;
                }
            }
        }
        Ok(())
    }

    /// Store the certificate of a block already in the tree.
    ///
    /// Storing a certificate twice is a no-op. Timeout certificates certify
    /// no block and are rejected.
    pub fn insert_qc(&self, qc: QuorumCert) -> ConsensusResult<()> {
        let Some(id) = qc.block_id else {
            return Err(ConsensusError::InvalidQc(format!(
                "certificate at level {} has no block",
                qc.level
            )));
        };
        let mut inner = self.inner.write();
        if inner.id_to_qc.contains_key(&id) {
            return Ok(());
        }
        let Some(block) = inner.tree.get_block(&id) else {
            return Err(ConsensusError::NoSuchBlock(short_hash(&id)));
        };
        let raises_highest = qc.level > inner.highest_qc.level;
        inner.id_to_qc.insert(id, qc.clone());
        if raises_highest {
            inner.highest_qc = qc;
            inner.highest_certified_block = block;
        }
        Ok(())
    }

    pub fn get_block(&self, id: &Hash) -> Option<Arc<Block>> {
        self.inner.read().tree.get_block(id)
    }

    pub fn get_qc(&self, id: &Hash) -> Option<QuorumCert> {
        self.inner.read().id_to_qc.get(id).cloned()
    }

    pub fn contains_qc(&self, id: &Hash) -> bool {
        self.inner.read().id_to_qc.contains_key(id)
    }

    pub fn blocks_at(&self, height: u64) -> Vec<Arc<Block>> {
        self.inner.read().tree.blocks_at(height)
    }

    pub fn highest_qc(&self) -> QuorumCert {
        self.inner.read().highest_qc.clone()
    }

    pub fn highest_certified_block(&self) -> Arc<Block> {
        Arc::clone(&self.inner.read().highest_certified_block)
    }

    pub fn root_block(&self) -> Arc<Block> {
        Arc::clone(self.inner.read().tree.root())
    }

    pub fn root_qc(&self) -> Option<QuorumCert> {
        let inner = self.inner.read();
        inner.id_to_qc.get(&inner.tree.root().hash()).cloned()
    }

    pub fn branch_from_root(&self, block: &Block) -> Option<Vec<Arc<Block>>> {
        self.inner.read().tree.branch_from_root(block)
    }

    /// Re-root at `new_root` and drop the certificates of deleted blocks.
    pub fn prune_block(&self, new_root: &Hash) -> Vec<Hash> {
        let mut inner = self.inner.write();
        let deleted = inner.tree.prune_block(new_root);
        for id in &deleted {
            inner.id_to_qc.remove(id);
        }
        deleted
    }

    /// Certificates whose block is no longer in the tree. Empty when the
    /// pool is consistent.
    pub fn dangling_qcs(&self) -> Vec<Hash> {
        let inner = self.inner.read();
        inner
            .id_to_qc
            .keys()
            .filter(|id| !inner.tree.contains(id))
            .copied()
            .collect()
    }

    pub fn block_count(&self) -> usize {
        self.inner.read().tree.len()
    }
}
