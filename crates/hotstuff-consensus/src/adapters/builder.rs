//! Channel-backed block builder
//!
//! Forwards `BuildProposal` requests to whatever task assembles blocks.

use crate::domain::{ConsensusError, ConsensusResult};
use crate::events::BuildProposal;
use crate::ports::BlockBuilder;
use tokio::sync::mpsc;

pub struct ChannelBlockBuilder {
    tx: mpsc::UnboundedSender<BuildProposal>,
}

impl ChannelBlockBuilder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BuildProposal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BlockBuilder for ChannelBlockBuilder {
    fn request_proposal(&self, request: BuildProposal) -> ConsensusResult<()> {
        self.tx
            .send(request)
            .map_err(|_| ConsensusError::ChannelClosed("block builder"))
    }
}
