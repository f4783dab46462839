//! # Committee Container
//!
//! Builds every validator of the local committee with its collaborators
//! and owns the tasks that connect them.

mod committee;
mod config;

pub use committee::LocalCommittee;
pub use config::{NodeConfig, ENV_LOG};
