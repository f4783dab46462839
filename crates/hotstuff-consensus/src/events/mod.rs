//! Events layer
//!
//! Wire messages between validators, events consumed by the engine's event
//! loop and events it publishes to the node.

mod consumed;
mod published;
mod wire;

pub use consumed::*;
pub use published::*;
pub use wire::*;
