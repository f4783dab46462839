//! Domain layer for the HotStuff consensus engine
//!
//! Pure state and rules, no I/O:
//! - block_tree / block_pool: uncommitted blocks and their certificates
//! - safety_rules: vote rule, two-chain lock, three-chain commit
//! - msg_pool: proposals and votes per (height, level)
//! - pacemaker: level cursor and timeout schedule
//! - committee: validator sets across epoch switches

mod block;
mod block_pool;
mod block_tree;
mod committee;
mod config;
mod error;
mod msg_pool;
mod pacemaker;
mod qc;
mod safety_rules;
mod state;

pub use block::*;
pub use block_pool::*;
pub use block_tree::*;
pub use committee::*;
pub use config::*;
pub use error::*;
pub use msg_pool::*;
pub use pacemaker::*;
pub use qc::*;
pub use safety_rules::*;
pub use state::*;

/// Keccak-256 digest
pub type Hash = [u8; 32];

pub const ZERO_HASH: Hash = [0u8; 32];
