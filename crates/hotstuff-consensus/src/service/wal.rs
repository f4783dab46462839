//! Write-ahead log of accepted proposals and votes
//!
//! Every entry records the WAL index where the last committed height's
//! successor starts, so replay can skip everything already committed.

use super::ConsensusService;
use crate::domain::{ConsensusError, ConsensusResult};
use crate::events::{ConsensusMsg, ConsensusPayload, MessageType, WalEntry};
use crate::ports::WalError;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

fn corrupted(err: ConsensusError) -> ConsensusError {
    ConsensusError::Wal(WalError::Corrupted(err.to_string()))
}

impl ConsensusService {
    /// Append `msg` and return its WAL index.
    pub(super) fn save_wal_entry(&self, msg: &ConsensusMsg) -> ConsensusResult<u64> {
        let last_snapshot_index = self.wal_state.lock().last_commit_wal_index;
        let entry = WalEntry {
            msg_type: msg.payload.msg_type(),
            msg: msg.encode()?,
            last_snapshot_index,
        };
        let index = self.wal.last_index()? + 1;
        self.wal.write(index, &entry.encode()?)?;
        debug!(
            "[hotstuff-wal] saved {} at index {}",
            entry.msg_type.as_str(),
            index
        );
        Ok(index)
    }

    /// Remember the first WAL index written at `height`.
    pub(super) fn add_proposal_wal_index(&self, height: u64, index: u64) {
        self.wal_state
            .lock()
            .proposal_wal_index
            .entry(height)
            .or_insert(index);
    }

    /// `height` committed: entries before the next height's first index are
    /// no longer needed, and every `wal_truncate_interval` heights they are
    /// dropped from the log.
    pub(super) fn update_wal_index_and_trunc(&self, height: u64) -> ConsensusResult<()> {
        let next = {
            let mut state = self.wal_state.lock();
            let next = state.proposal_wal_index.get(&(height + 1)).copied();
            state.proposal_wal_index = state.proposal_wal_index.split_off(&(height + 1));
            if let Some(next) = next {
                state.last_commit_wal_index = next;
            }
            next
        };
        let Some(next) = next else {
            return Ok(());
        };
        let interval = self.config.wal_truncate_interval;
        if interval > 0 && height % interval == 0 {
            self.wal.truncate_front(next)?;
            info!("[hotstuff-wal] truncated before index {} at height {}", next, height);
        }
        Ok(())
    }

    /// Re-run every logged message since the last committed height.
    ///
    /// Replayed messages rebuild the pool and the vote guard but never send
    /// anything or fetch blocks. Must run before the loops start.
    pub async fn replay_wal(&self) -> ConsensusResult<()> {
        let last = self.wal.last_index()?;
        if last == 0 {
            self.done_replay.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let tail = WalEntry::decode(&self.wal.read(last)?).map_err(corrupted)?;
        let first = self.wal.first_index()?;
        let start = tail.last_snapshot_index.max(first).max(1);
        self.wal_state.lock().last_commit_wal_index = tail.last_snapshot_index;
        info!("[hotstuff-wal] replaying entries {}..={}", start, last);

        let _guard = self.process_lock.lock().await;
        let mut replayed = 0usize;
        for index in start..=last {
            let entry = WalEntry::decode(&self.wal.read(index)?).map_err(corrupted)?;
            let msg = ConsensusMsg::decode(&entry.msg).map_err(corrupted)?;
            let epoch = self.current_epoch();
            let (height, own_vote) = match &msg.payload {
                ConsensusPayload::Proposal(proposal) => (proposal.proposal_data.height, false),
                ConsensusPayload::Vote(vote) => (
                    vote.vote_data.height,
                    vote.vote_data.author == self.node_id(),
                ),
                other => {
                    warn!(
                        "[hotstuff-wal] skipping {} at index {}",
                        other.msg_type().as_str(),
                        index
                    );
                    continue;
                }
            };
            let result = if msg.payload.msg_type() == MessageType::Proposal {
                let result = self.process_proposal(&epoch, msg).await;
                if result.is_ok() {
                    self.add_proposal_wal_index(height, index);
                }
                result
            } else {
                if own_vote {
                    self.add_proposal_wal_index(height, index);
                }
                self.process_vote(&epoch, msg).await
            };
            match result {
                Ok(()) => replayed += 1,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!("[hotstuff-wal] entry {} not applied: {}", index, err),
            }
        }

        self.done_replay.store(true, Ordering::SeqCst);
        info!("[hotstuff-wal] replay done, {} entries applied", replayed);
        Ok(())
    }
}
