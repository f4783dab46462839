//! Adapters layer (Hexagonal Architecture)
//!
//! Local implementations of the outbound ports, used by the runtime and
//! the tests.

mod builder;
mod crypto;
mod governance;
mod ledger;
mod network;
mod wal;

pub use builder::*;
pub use crypto::*;
pub use governance::*;
pub use ledger::*;
pub use network::*;
pub use wal::*;
