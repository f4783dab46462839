//! Driving ports (Inbound API)

use crate::domain::{Block, ConsensusResult, ConsensusStatus};
use async_trait::async_trait;

/// Primary consensus API
///
/// Everything the surrounding node feeds into the engine.
#[async_trait]
pub trait ConsensusApi: Send + Sync {
    /// A block built in answer to a `BuildProposal` request.
    ///
    /// Ignored unless this node is still the proposer of the current level
    /// and the block extends the highest certified block.
    async fn on_proposed_block(&self, block: Block) -> ConsensusResult<()>;

    /// The ledger sealed `block`.
    async fn on_block_committed(&self, block: Block) -> ConsensusResult<()>;

    /// Raw bytes received from `peer`.
    async fn on_network_message(&self, peer: String, payload: Vec<u8>) -> ConsensusResult<()>;

    /// Check that the QC attached to `block` certifies it with a quorum of
    /// valid committee signatures.
    async fn verify_block_signatures(&self, block: &Block) -> ConsensusResult<()>;

    async fn status(&self) -> ConsensusStatus;
}
