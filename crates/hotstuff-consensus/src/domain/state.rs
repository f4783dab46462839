//! Read-only snapshot of the local consensus state

use super::ConsStateType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStatus {
    pub node_id: String,
    pub epoch_id: u64,
    pub height: u64,
    pub level: u64,
    pub state: ConsStateType,
    pub commit_height: u64,
    pub highest_qc_level: u64,
    pub locked_level: u64,
    pub last_vote_level: u64,
    /// Index in the current committee, `None` for non-members
    pub self_index: Option<u64>,
}
