//! In-memory network adapter
//!
//! A hub connecting local endpoints through unbounded channels. Nodes can
//! be isolated and healed to simulate partitions.

use crate::domain::{ConsensusError, ConsensusResult};
use crate::ports::NetworkSender;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// `(sender node id, payload)` delivered to an endpoint
pub type Inbound = (String, Vec<u8>);

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    isolated: HashSet<String>,
}

/// Shared switchboard for all local nodes
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<RwLock<HubInner>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `node_id` to the hub. Re-registering replaces the old endpoint.
    pub fn register(&self, node_id: &str) -> (NetworkEndpoint, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().endpoints.insert(node_id.to_string(), tx);
        let endpoint = NetworkEndpoint {
            node_id: node_id.to_string(),
            hub: self.clone(),
        };
        (endpoint, rx)
    }

    /// Drop all traffic to and from `node_id`.
    pub fn isolate(&self, node_id: &str) {
        self.inner.write().isolated.insert(node_id.to_string());
    }

    pub fn heal(&self, node_id: &str) {
        self.inner.write().isolated.remove(node_id);
    }

    pub fn peer_count(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    fn deliver(&self, from: &str, to: &str, payload: Vec<u8>) -> ConsensusResult<()> {
        let inner = self.inner.read();
        if inner.isolated.contains(from) || inner.isolated.contains(to) {
            return Ok(());
        }
        let endpoint = inner
            .endpoints
            .get(to)
            .ok_or_else(|| ConsensusError::Network(format!("unknown peer {}", to)))?;
        endpoint
            .send((from.to_string(), payload))
            .map_err(|_| ConsensusError::Network(format!("peer {} disconnected", to)))
    }
}

/// One node's handle on the hub
#[derive(Clone)]
pub struct NetworkEndpoint {
    node_id: String,
    hub: InMemoryNetwork,
}

impl NetworkEndpoint {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl NetworkSender for NetworkEndpoint {
    fn send(&self, peer: &str, payload: Vec<u8>) -> ConsensusResult<()> {
        self.hub.deliver(&self.node_id, peer, payload)
    }
}
