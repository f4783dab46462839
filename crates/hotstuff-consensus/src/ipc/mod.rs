//! Inbound network boundary

mod handler;

pub use handler::IpcHandler;
