//! Published events (Outgoing)

use crate::domain::Hash;
use serde::{Deserialize, Serialize};

/// Asks the block builder for a block at `height` extending `pre_hash`
///
/// Sent at most once per (height, level).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildProposal {
    pub height: u64,
    pub pre_hash: Hash,
    pub is_proposer: bool,
}
