//! Parent/children index over uncommitted blocks
//!
//! The tree is rooted at the latest locally committed block. It is not
//! thread safe on its own; `BlockPool` owns it behind a lock.

use super::{short_hash, Block, ConsensusError, ConsensusResult, Hash};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One block plus the hashes of its children
#[derive(Debug)]
pub struct BlockNode {
    block: Arc<Block>,
    children: Vec<Hash>,
}

impl BlockNode {
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn children(&self) -> &[Hash] {
        &self.children
    }
}

#[derive(Debug)]
pub struct BlockTree {
    nodes: HashMap<Hash, BlockNode>,
    by_height: HashMap<u64, Vec<Hash>>,
    root: Arc<Block>,
    /// Blocks detached from the tree but not yet deleted, oldest first
    pending_prune: VecDeque<Hash>,
    max_pruned_size: usize,
}

impl BlockTree {
    pub fn new(root: Block, max_pruned_size: usize) -> Self {
        let root = Arc::new(root);
        let mut tree = Self {
            nodes: HashMap::new(),
            by_height: HashMap::new(),
            root: Arc::clone(&root),
            pending_prune: VecDeque::with_capacity(max_pruned_size + 1),
            max_pruned_size,
        };
        tree.by_height.entry(root.height()).or_default().push(root.hash());
        tree.nodes.insert(
            root.hash(),
            BlockNode {
                block: root,
                children: Vec::new(),
            },
        );
        tree
    }

    /// Insert a block whose parent is already in the tree.
    ///
    /// Inserting a known hash is a no-op.
    pub fn insert_block(&mut self, block: Block) -> ConsensusResult<()> {
        let id = block.hash();
        if self.nodes.contains_key(&id) {
            return Ok(());
        }
        let parent = block.pre_hash();
        let Some(parent_node) = self.nodes.get_mut(&parent) else {
            return Err(ConsensusError::OrphanBlock {
                block: short_hash(&id),
                parent: short_hash(&parent),
            });
        };
        parent_node.children.push(id);
        self.by_height.entry(block.height()).or_default().push(id);
        self.nodes.insert(
            id,
            BlockNode {
                block: Arc::new(block),
                children: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn root(&self) -> &Arc<Block> {
        &self.root
    }

    pub fn get_block(&self, id: &Hash) -> Option<Arc<Block>> {
        self.nodes.get(id).map(|node| Arc::clone(&node.block))
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn blocks_at(&self, height: u64) -> Vec<Arc<Block>> {
        self.by_height
            .get(&height)
            .map(|ids| ids.iter().filter_map(|id| self.get_block(id)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Path from the root (exclusive) down to `block` (inclusive).
    ///
    /// Returns `None` when walking parents from `block` does not land
    /// exactly on the root.
    pub fn branch_from_root(&self, block: &Block) -> Option<Vec<Arc<Block>>> {
        let root_height = self.root.height();
        let mut branch = Vec::new();
        let mut cur = self
            .get_block(&block.hash())
            .unwrap_or_else(|| Arc::new(block.clone()));

        while cur.height() > root_height {
            let parent = self.get_block(&cur.pre_hash())?;
            branch.push(cur);
            cur = parent;
        }

        if cur.hash() != self.root.hash() {
            return None;
        }
        branch.reverse();
        Some(branch)
    }

    /// Re-root the tree at `new_root` and detach every other branch.
    ///
    /// Detached blocks are queued and only deleted once the queue grows past
    /// `max_pruned_size`. Returns the hashes actually deleted by this call.
    pub fn prune_block(&mut self, new_root: &Hash) -> Vec<Hash> {
        if *new_root == self.root.hash() {
            return Vec::new();
        }
        let Some(new_root_block) = self.get_block(new_root) else {
            return Vec::new();
        };

        let detached = self.find_blocks_to_prune(new_root);
        self.root = new_root_block;
        self.pending_prune.extend(detached);

        let mut deleted = Vec::new();
        while self.pending_prune.len() > self.max_pruned_size {
            if let Some(id) = self.pending_prune.pop_front() {
                self.clean_block(&id);
                deleted.push(id);
            }
        }
        deleted
    }

    /// BFS from the current root, skipping the branch that leads to
    /// `new_root`.
    fn find_blocks_to_prune(&self, new_root: &Hash) -> Vec<Hash> {
        let mut to_prune = Vec::new();
        let mut queue = VecDeque::from([self.root.hash()]);
        while let Some(id) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&id) {
                queue.extend(node.children.iter().filter(|child| *child != new_root));
            }
            to_prune.push(id);
        }
        to_prune
    }

    fn clean_block(&mut self, id: &Hash) {
        if let Some(node) = self.nodes.remove(id) {
            let height = node.block.height();
            if let Some(ids) = self.by_height.get_mut(&height) {
                ids.retain(|other| other != id);
                if ids.is_empty() {
                    self.by_height.remove(&height);
                }
            }
        }
    }
}
