//! Consumed events (Incoming)
//!
//! Inputs of the generic event loop. Protocol and sync messages have their
//! own mailboxes and never pass through here.

use crate::domain::{Block, TimerEvent};

#[derive(Clone, Debug)]
pub enum ConsensusEvent {
    /// Block built in answer to a `BuildProposal`
    ProposedBlock(Block),
    /// Block sealed by the ledger
    BlockCommitted(Block),
    /// Timeout fired by the timer service
    Timeout(TimerEvent),
}
