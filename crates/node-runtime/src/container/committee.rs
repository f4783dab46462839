//! Local committee wiring
//!
//! Each validator gets a deterministic ed25519 key, an in-memory ledger, a
//! file WAL and an endpoint on the shared in-memory network hub. Three pump
//! tasks per validator carry peer bytes, block build requests and ledger
//! commits into its consensus service.

use super::config::NodeConfig;
use anyhow::{Context, Result};
use hotstuff_consensus::adapters::{
    ChannelBlockBuilder, Ed25519Signer, Ed25519Verifier, FileWal, InMemoryLedger,
    InMemoryNetwork, Inbound, StaticGovernance,
};
use hotstuff_consensus::events::BuildProposal;
use hotstuff_consensus::{
    Block, CommitteeSnapshot, ConsensusApi, ConsensusDependencies, ConsensusService, Signer,
    Validator,
};
use parking_lot::Mutex;
use rand::RngCore;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Signing key seed of validator `index`: `keccak256(key_seed || index)`.
pub fn validator_key(key_seed: &str, index: u64) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(key_seed.as_bytes());
    hasher.update(index.to_be_bytes());
    hasher.finalize().into()
}

fn node_name(index: u64) -> String {
    format!("node-{index}")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Channel ends drained by the pump tasks, taken once in `start`
struct Pumps {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    builds: mpsc::UnboundedReceiver<BuildProposal>,
    commits: mpsc::UnboundedReceiver<Block>,
}

/// One validator and its collaborators.
pub struct ValidatorNode {
    pub node_id: String,
    pub service: Arc<ConsensusService>,
    pub ledger: Arc<InMemoryLedger>,
    pumps: Mutex<Option<Pumps>>,
}

impl ValidatorNode {
    fn build(
        config: &NodeConfig,
        index: u64,
        hub: &InMemoryNetwork,
        snapshot: &CommitteeSnapshot,
        signer: Ed25519Signer,
    ) -> Result<Self> {
        let node_id = node_name(index);
        let wal_path = config.wal_path(&node_id);
        if config.storage.reset_wal && wal_path.exists() {
            std::fs::remove_file(&wal_path)
                .with_context(|| format!("Failed to reset WAL {}", wal_path.display()))?;
        }
        let wal = FileWal::open(&wal_path)
            .with_context(|| format!("Failed to open WAL {}", wal_path.display()))?;

        let genesis = Block::genesis(snapshot.epoch_id);
        let (ledger, commits) = InMemoryLedger::with_commit_notify(genesis);
        let ledger = Arc::new(ledger);
        let (builder, builds) = ChannelBlockBuilder::new();
        let (endpoint, inbound) = hub.register(&node_id);

        let service = ConsensusService::new(ConsensusDependencies {
            store: ledger.clone(),
            committer: ledger.clone(),
            verifier: ledger.clone(),
            signer: Arc::new(signer),
            sig_verifier: Arc::new(Ed25519Verifier),
            governance: Arc::new(StaticGovernance::new(snapshot.clone())),
            network: Arc::new(endpoint),
            builder: Arc::new(builder),
            wal: Arc::new(wal),
            config: config.consensus_config(&node_id),
        })
        .with_context(|| format!("Failed to create consensus service for {}", node_id))?;

        Ok(Self {
            node_id,
            service: Arc::new(service),
            ledger,
            pumps: Mutex::new(Some(Pumps {
                inbound,
                builds,
                commits,
            })),
        })
    }

    /// Spawn the pumps, then start the service.
    async fn start(
        &self,
        payload_size: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let Pumps {
            mut inbound,
            mut builds,
            mut commits,
        } = self
            .pumps
            .lock()
            .take()
            .with_context(|| format!("{} already started", self.node_id))?;

        let mut handles = Vec::with_capacity(7);

        let service = Arc::clone(&self.service);
        let mut stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = inbound.recv() => match msg {
                        Some((peer, payload)) => {
                            if let Err(e) = service.on_network_message(peer.clone(), payload).await {
                                debug!("[node] dropped message from {}: {}", peer, e);
                            }
                        }
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        let service = Arc::clone(&self.service);
        let mut stop = shutdown.clone();
        let node_id = self.node_id.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = builds.recv() => match request {
                        Some(request) => {
                            let block = assemble_block(&node_id, &request, payload_size);
                            if let Err(e) = service.on_proposed_block(block).await {
                                warn!(
                                    "[node] {} failed to hand over block {}: {}",
                                    node_id, request.height, e
                                );
                            }
                        }
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        let service = Arc::clone(&self.service);
        let mut stop = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    block = commits.recv() => match block {
                        Some(block) => {
                            if let Err(e) = service.on_block_committed(block).await {
                                warn!("[node] commit notification lost: {}", e);
                            }
                        }
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        let service_handles = self
            .service
            .start(shutdown.clone())
            .await
            .with_context(|| format!("Failed to start {}", self.node_id))?;
        handles.extend(service_handles);
        Ok(handles)
    }
}

/// A block carrying `payload_size` random bytes on top of `request.pre_hash`.
fn assemble_block(node_id: &str, request: &BuildProposal, payload_size: usize) -> Block {
    let mut payload = vec![0u8; payload_size];
    rand::thread_rng().fill_bytes(&mut payload);
    debug!(
        "[node] {} built block {} on {}",
        node_id,
        request.height,
        hex::encode(&request.pre_hash[..4])
    );
    Block::new(request.height, request.pre_hash, payload, now_millis())
}

/// Every validator of the committee, sharing one network hub.
pub struct LocalCommittee {
    pub hub: InMemoryNetwork,
    pub nodes: Vec<ValidatorNode>,
    payload_size: usize,
}

impl LocalCommittee {
    /// Create every validator. Endpoints are all registered before any
    /// service starts, so no early proposal is lost.
    pub fn build(config: &NodeConfig) -> Result<Self> {
        let signers: Vec<Ed25519Signer> = (0..config.committee.validators)
            .map(|i| Ed25519Signer::from_seed(validator_key(&config.committee.key_seed, i)))
            .collect();
        let validators: Vec<Validator> = signers
            .iter()
            .zip(0..)
            .map(|(signer, index)| Validator {
                index,
                node_id: node_name(index),
                public_key: signer.public_key(),
            })
            .collect();
        for validator in &validators {
            info!(
                "[node] {} key {}",
                validator.node_id,
                hex::encode(&validator.public_key)
            );
        }
        let snapshot = CommitteeSnapshot::genesis(validators);

        let hub = InMemoryNetwork::new();
        let nodes = signers
            .into_iter()
            .zip(0..)
            .map(|(signer, index)| ValidatorNode::build(config, index, &hub, &snapshot, signer))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            hub,
            nodes,
            payload_size: config.runtime.payload_size,
        })
    }

    /// Start every validator; returns all spawned task handles.
    pub async fn start(&self, shutdown: &watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for node in &self.nodes {
            handles.extend(node.start(self.payload_size, shutdown).await?);
        }
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &std::path::Path, validators: u64) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.committee.validators = validators;
        config.storage.data_dir = dir.to_path_buf();
        config.consensus.round_timeout_ms = 300;
        config.consensus.round_timeout_interval_ms = 100;
        config.runtime.payload_size = 8;
        config
    }

    #[test]
    fn test_validator_keys_are_deterministic() {
        assert_eq!(validator_key("seed", 1), validator_key("seed", 1));
        assert_ne!(validator_key("seed", 1), validator_key("seed", 2));
        assert_ne!(validator_key("seed", 1), validator_key("other", 1));
    }

    #[test]
    fn test_build_registers_every_validator() {
        let dir = tempfile::tempdir().unwrap();
        let committee = LocalCommittee::build(&config(dir.path(), 4)).unwrap();

        assert_eq!(committee.nodes.len(), 4);
        assert_eq!(committee.hub.peer_count(), 4);
        assert_eq!(committee.nodes[2].node_id, "node-2");
        assert!(dir.path().join("node-3").join("consensus.wal").exists());
    }

    #[test]
    fn test_assembled_block_extends_request() {
        let request = BuildProposal {
            height: 5,
            pre_hash: [7; 32],
            is_proposer: true,
        };
        let block = assemble_block("node-0", &request, 16);

        assert_eq!(block.height(), 5);
        assert_eq!(block.payload.len(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_committee_commits_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let committee = LocalCommittee::build(&config(dir.path(), 4)).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = committee.start(&shutdown_rx).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        while !committee.nodes.iter().all(|n| n.ledger.height() >= 2) {
            assert!(tokio::time::Instant::now() < deadline, "committee made no progress");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}
