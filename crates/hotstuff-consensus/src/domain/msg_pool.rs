//! Proposal and vote storage per (height, level)

use super::{ConsensusError, ConsensusResult, Hash, VoteData};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Merged view of everything one author sent at a level
#[derive(Clone, Copy, Debug)]
struct AuthorRecord {
    block_id: Option<Hash>,
    new_view: bool,
}

/// Outcome of a quorum check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VotesDone {
    /// Quorum of regular votes for one block
    Block(Hash),
    /// Quorum of timeout votes
    NewView,
}

/// Votes received at one (height, level)
#[derive(Default)]
struct VotePool {
    authors: HashMap<u64, AuthorRecord>,
    new_view_votes: BTreeMap<u64, VoteData>,
    block_votes: HashMap<Hash, BTreeMap<u64, VoteData>>,
    locked_block: Option<Hash>,
    locked_new_view: bool,
}

impl VotePool {
    /// Returns `Ok(false)` for a vote that adds nothing new from its author.
    fn insert(&mut self, vote: &VoteData, quorum: usize) -> ConsensusResult<bool> {
        if let Some(last) = self.authors.get(&vote.author_idx) {
            if let (Some(prev), Some(next)) = (last.block_id, vote.block_id) {
                if prev != next {
                    return Err(ConsensusError::EquivocatingVote {
                        author_idx: vote.author_idx,
                        height: vote.height,
                        level: vote.level,
                    });
                }
            }
            if last.new_view == vote.new_view && last.block_id == vote.block_id {
                return Ok(false);
            }
        }

        let record = self
            .authors
            .entry(vote.author_idx)
            .or_insert(AuthorRecord {
                block_id: vote.block_id,
                new_view: vote.new_view,
            });
        record.new_view |= vote.new_view;
        if record.block_id.is_none() {
            record.block_id = vote.block_id;
        }

        if vote.new_view {
            self.new_view_votes.insert(vote.author_idx, vote.clone());
            if self.new_view_votes.len() >= quorum {
                self.locked_new_view = true;
            }
        }
        if let Some(block_id) = vote.block_id {
            let votes = self.block_votes.entry(block_id).or_default();
            votes.insert(vote.author_idx, vote.clone());
            if self.locked_block.is_none() && votes.len() >= quorum {
                self.locked_block = Some(block_id);
            }
        }
        Ok(true)
    }

    fn done(&self) -> Option<VotesDone> {
        if let Some(block_id) = self.locked_block {
            return Some(VotesDone::Block(block_id));
        }
        self.locked_new_view.then_some(VotesDone::NewView)
    }

    /// Votes backing the reached quorum, ordered by author index
    fn qc_votes(&self) -> Vec<VoteData> {
        match self.done() {
            Some(VotesDone::Block(block_id)) => self
                .block_votes
                .get(&block_id)
                .map(|votes| votes.values().cloned().collect())
                .unwrap_or_default(),
            Some(VotesDone::NewView) => self.new_view_votes.values().cloned().collect(),
            None => Vec::new(),
        }
    }
}

struct Round<P> {
    proposals: HashMap<u64, P>,
    votes: HashMap<u64, VotePool>,
}

impl<P> Default for Round<P> {
    fn default() -> Self {
        Self {
            proposals: HashMap::new(),
            votes: HashMap::new(),
        }
    }
}

/// Message pool keyed by height, then level
///
/// Holds at most one proposal and one vote pool per (height, level).
/// `cached_heights` committed heights are kept after a block is sealed.
pub struct MsgPool<P> {
    rounds: RwLock<BTreeMap<u64, Round<P>>>,
    cached_heights: u64,
}

impl<P: Clone> MsgPool<P> {
    pub fn new(cached_heights: u64) -> Self {
        Self {
            rounds: RwLock::new(BTreeMap::new()),
            cached_heights,
        }
    }

    pub fn insert_proposal(&self, height: u64, level: u64, proposal: P) -> ConsensusResult<()> {
        let mut rounds = self.rounds.write();
        let round = rounds.entry(height).or_default();
        if round.proposals.contains_key(&level) {
            return Err(ConsensusError::DuplicateProposal { height, level });
        }
        round.proposals.insert(level, proposal);
        Ok(())
    }

    pub fn get_proposal(&self, height: u64, level: u64) -> Option<P> {
        self.rounds
            .read()
            .get(&height)
            .and_then(|round| round.proposals.get(&level))
            .cloned()
    }

    pub fn has_proposal(&self, height: u64, level: u64) -> bool {
        self.rounds
            .read()
            .get(&height)
            .is_some_and(|round| round.proposals.contains_key(&level))
    }

    /// Record a vote. `Ok(false)` means the vote was already known.
    pub fn insert_vote(&self, vote: &VoteData, quorum: usize) -> ConsensusResult<bool> {
        let mut rounds = self.rounds.write();
        rounds
            .entry(vote.height)
            .or_default()
            .votes
            .entry(vote.level)
            .or_default()
            .insert(vote, quorum)
    }

    pub fn check_votes_done(&self, height: u64, level: u64) -> Option<VotesDone> {
        self.rounds
            .read()
            .get(&height)
            .and_then(|round| round.votes.get(&level))
            .and_then(VotePool::done)
    }

    pub fn qc_votes(&self, height: u64, level: u64) -> Vec<VoteData> {
        self.rounds
            .read()
            .get(&height)
            .and_then(|round| round.votes.get(&level))
            .map(VotePool::qc_votes)
            .unwrap_or_default()
    }

    /// Drop every height that fell out of the cache window behind `height`.
    pub fn on_block_sealed(&self, height: u64) {
        if height < self.cached_heights {
            return;
        }
        let keep_from = height - self.cached_heights + 1;
        let mut rounds = self.rounds.write();
        *rounds = rounds.split_off(&keep_from);
    }

    /// Drop every height below `height`.
    pub fn cleanup(&self, height: u64) {
        let mut rounds = self.rounds.write();
        *rounds = rounds.split_off(&height);
    }

    pub fn heights(&self) -> Vec<u64> {
        self.rounds.read().keys().copied().collect()
    }
}
