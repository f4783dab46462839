//! Static governance source
//!
//! Holds one committee snapshot that tests and the local runtime can swap
//! at will to drive epoch changes.

use crate::domain::{CommitteeSnapshot, ConsensusResult};
use crate::ports::GovernanceSource;
use parking_lot::RwLock;

pub struct StaticGovernance {
    snapshot: RwLock<CommitteeSnapshot>,
}

impl StaticGovernance {
    pub fn new(snapshot: CommitteeSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Publish a new snapshot, picked up at the next commit.
    pub fn update(&self, snapshot: CommitteeSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

impl GovernanceSource for StaticGovernance {
    fn snapshot(&self) -> ConsensusResult<CommitteeSnapshot> {
        Ok(self.snapshot.read().clone())
    }
}
