//! Block fetch: requesting missing ancestors, serving peers, and applying
//! fetched (block, certificate) pairs.
//!
//! At most one request is outstanding. Responses arrive on the sync loop,
//! which runs without the process lock, so the protocol loop can wait on a
//! fetch while still holding it.

use super::epoch::Epoch;
use super::ConsensusService;
use crate::domain::{
    short_hash, ConsensusError, ConsensusResult, Hash, QuorumCert, Validator,
};
use crate::events::{
    BlockFetchMsg, BlockFetchRespMsg, BlockFetchStatus, BlockPair, ConsensusMsg,
    ConsensusPayload, MAX_SYNC_BLOCK_NUM,
};
use crate::ports::LedgerError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type FetchResult = ConsensusResult<Vec<BlockPair>>;

struct PendingFetch {
    req_id: u64,
    target_idx: u64,
    block_id: Hash,
    received: Vec<BlockPair>,
    incomplete: bool,
    done: oneshot::Sender<FetchResult>,
}

pub(crate) struct SyncManager {
    next_req_id: AtomicU64,
    pending: Mutex<Option<PendingFetch>>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self {
            next_req_id: AtomicU64::new(1),
            pending: Mutex::new(None),
        }
    }

    /// Register a request for the chain ending at `block_id`. A request
    /// still outstanding is dropped, which wakes its waiter with an error.
    pub fn begin(&self, target_idx: u64, block_id: Hash) -> (u64, oneshot::Receiver<FetchResult>) {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let (done, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingFetch {
            req_id,
            target_idx,
            block_id,
            received: Vec::new(),
            incomplete: false,
            done,
        });
        (req_id, rx)
    }

    /// Feed one response chunk. Returns `false` if no request matches.
    ///
    /// The request completes on the chunk carrying the requested block, or
    /// on an empty chunk.
    pub fn route_response(&self, author_idx: u64, resp: BlockFetchRespMsg) -> bool {
        let mut guard = self.pending.lock();
        let Some(pending) = guard.as_mut() else {
            return false;
        };
        if pending.req_id != resp.resp_id || pending.target_idx != author_idx {
            return false;
        }

        let last_chunk = resp.blocks.is_empty()
            || resp
                .blocks
                .iter()
                .any(|pair| pair.block.hash() == pending.block_id);
        pending.incomplete |= resp.status == BlockFetchStatus::NotEnoughBlocks;
        pending.received.extend(resp.blocks);

        if last_chunk {
            if let Some(pending) = guard.take() {
                let result = if pending.incomplete {
                    Err(ConsensusError::SyncFailed(format!(
                        "peer {} lacks blocks up to {}",
                        pending.target_idx,
                        short_hash(&pending.block_id)
                    )))
                } else {
                    Ok(pending.received)
                };
                let _ = pending.done.send(result);
            }
        }
        true
    }

    /// Drop whatever request is outstanding.
    pub fn abandon(&self) {
        if self.pending.lock().take().is_some() {
            debug!("[hotstuff-sync] pending fetch abandoned");
        }
    }

    pub fn abandon_request(&self, req_id: u64) {
        let mut guard = self.pending.lock();
        if guard.as_ref().is_some_and(|p| p.req_id == req_id) {
            guard.take();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl ConsensusService {
    /// Fetch the chain certified by `qc` from `target` and apply it.
    ///
    /// Waits up to twice the round timeout.
    pub(super) async fn fetch_and_apply(
        &self,
        epoch: &Epoch,
        qc: &QuorumCert,
        target: &Validator,
    ) -> ConsensusResult<()> {
        let Some(block_id) = qc.block_id else {
            return Ok(());
        };
        let author_idx = epoch.self_index.ok_or_else(|| {
            ConsensusError::SyncFailed("only validators may fetch blocks".to_string())
        })?;
        let root = epoch.chain_store.root_block();
        let request = BlockFetchMsg {
            req_id: 0,
            height: qc.height,
            block_id,
            num_blocks: qc.height.saturating_sub(root.height()).max(1),
            author_idx,
            commit_block: root.hash(),
            locked_block: epoch.smr.safety().locked_block().hash(),
        };

        let (req_id, done) = self.syncer.begin(target.index, block_id);
        let msg = self.sign_msg(ConsensusPayload::BlockFetch(BlockFetchMsg { req_id, ..request }))?;
        info!(
            "[hotstuff-sync] fetching {} at height {} from {}",
            short_hash(&block_id),
            qc.height,
            target.node_id
        );
        if let Err(err) = self.network.send(&target.node_id, msg.encode()?) {
            self.syncer.abandon_request(req_id);
            return Err(err);
        }

        let wait = self.round_timeout() * 2;
        let pairs = match tokio::time::timeout(wait, done).await {
            Err(_) => {
                self.syncer.abandon_request(req_id);
                crate::metrics::record_sync_fetch("timeout");
                return Err(ConsensusError::SyncTimeout(short_hash(&block_id)));
            }
            Ok(Err(_)) => {
                crate::metrics::record_sync_fetch("abandoned");
                return Err(ConsensusError::SyncFailed("request abandoned".to_string()));
            }
            Ok(Ok(Err(err))) => {
                crate::metrics::record_sync_fetch("incomplete");
                return Err(err);
            }
            Ok(Ok(Ok(pairs))) => pairs,
        };
        crate::metrics::record_sync_fetch("ok");
        self.apply_block_pairs(epoch, pairs)
    }

    /// Validate and insert fetched pairs in level order, then let the
    /// pacemaker catch up.
    pub(super) fn apply_block_pairs(&self, epoch: &Epoch, mut pairs: Vec<BlockPair>) -> ConsensusResult<()> {
        pairs.sort_by_key(|pair| pair.qc.level);
        let mut seen = HashSet::new();
        let count = pairs.len();

        for pair in pairs {
            let id = pair.block.hash();
            if !seen.insert(id) {
                continue;
            }
            if pair.qc.epoch_id != epoch.epoch_id {
                return Err(ConsensusError::EpochMismatch {
                    expected: epoch.epoch_id,
                    actual: pair.qc.epoch_id,
                });
            }
            if pair.block.height() <= epoch.chain_store.root_block().height() {
                continue;
            }
            if epoch.chain_store.contains_qc(&id) {
                continue;
            }
            self.validate_block_pair(epoch, &pair)?;

            let qc = pair.qc;
            epoch.chain_store.insert_block(pair.block)?;
            epoch.chain_store.insert_qc(qc.clone())?;
            epoch.smr.safety().update_locked_qc(&qc);
            self.commit_blocks_by_qc(epoch, &qc)?;
        }

        debug!("[hotstuff-sync] applied {} fetched blocks", count);
        self.process_certificates(epoch, None)?;
        Ok(())
    }

    fn validate_block_pair(&self, epoch: &Epoch, pair: &BlockPair) -> ConsensusResult<()> {
        let block = &pair.block;
        self.verify_justify_qc(epoch, &pair.qc)?;
        if pair.qc.block_id != Some(block.hash()) || pair.qc.height != block.height() {
            return Err(ConsensusError::InvalidBlock(format!(
                "fetched block {} does not match its certificate",
                short_hash(&block.hash())
            )));
        }
        if !block.verify_hash() {
            return Err(ConsensusError::InvalidBlock(format!(
                "hash mismatch on fetched block {}",
                short_hash(&block.hash())
            )));
        }
        self.verify_proposer_signature(epoch, block)?;
        match self.verifier.verify_block(block) {
            Ok(()) => Ok(()),
            Err(LedgerError::AlreadyCommitted(height)) => {
                match self.store.get_block(height) {
                    Some(stored) if stored.hash() == block.hash() => Ok(()),
                    _ => Err(ConsensusError::InvalidBlock(format!(
                        "fetched block {} conflicts with committed height {}",
                        short_hash(&block.hash()),
                        height
                    ))),
                }
            }
            Err(err) => Err(ConsensusError::InvalidBlock(err.to_string())),
        }
    }

    /// Serve a peer's fetch request from the pool and the ledger.
    pub(super) fn process_block_fetch(&self, msg: &ConsensusMsg) -> ConsensusResult<()> {
        let ConsensusPayload::BlockFetch(request) = &msg.payload else {
            return Ok(());
        };
        let epoch = self.current_epoch();
        let requester = epoch
            .smr
            .committee()
            .member(request.author_idx)
            .cloned()
            .ok_or(ConsensusError::UnknownValidator {
                index: request.author_idx,
                height: request.height,
            })?;
        self.verify_msg_signature(msg, &requester)?;
        let author_idx = epoch.self_index.ok_or_else(|| {
            ConsensusError::SyncFailed("only validators serve blocks".to_string())
        })?;

        let (status, mut blocks) = collect_block_pairs(&epoch, request);
        blocks.sort_by_key(|pair| pair.block.height());
        debug!(
            "[hotstuff-sync] serving {} blocks ({:?}) to {}",
            blocks.len(),
            status,
            requester.node_id
        );

        let chunks: Vec<Vec<BlockPair>> = if blocks.is_empty() {
            vec![Vec::new()]
        } else {
            blocks
                .chunks(MAX_SYNC_BLOCK_NUM as usize)
                .map(<[BlockPair]>::to_vec)
                .collect()
        };
        for chunk in chunks {
            let resp = self.sign_msg(ConsensusPayload::BlockFetchResp(BlockFetchRespMsg {
                resp_id: request.req_id,
                status,
                blocks: chunk,
                author_idx,
            }))?;
            self.network.send(&requester.node_id, resp.encode()?)?;
        }
        Ok(())
    }

    /// Route a verified response to the waiting fetch.
    pub(super) fn process_block_fetch_resp(&self, msg: ConsensusMsg) -> ConsensusResult<()> {
        let epoch = self.current_epoch();
        let ConsensusPayload::BlockFetchResp(resp) = &msg.payload else {
            return Ok(());
        };
        let responder = epoch
            .smr
            .committee()
            .member(resp.author_idx)
            .cloned()
            .ok_or(ConsensusError::UnknownValidator {
                index: resp.author_idx,
                height: 0,
            })?;
        self.verify_msg_signature(&msg, &responder)?;

        let ConsensusPayload::BlockFetchResp(resp) = msg.payload else {
            return Ok(());
        };
        let resp_id = resp.resp_id;
        if !self.syncer.route_response(responder.index, resp) {
            warn!(
                "[hotstuff-sync] unexpected fetch response {} from {}",
                resp_id, responder.node_id
            );
        }
        Ok(())
    }
}

/// Walk back from the requested block until the requester's committed or
/// locked block, or until `num_blocks` pairs are collected. An empty walk is
/// reported as `NotEnoughBlocks`.
fn collect_block_pairs(epoch: &Epoch, request: &BlockFetchMsg) -> (BlockFetchStatus, Vec<BlockPair>) {
    let mut pairs = Vec::new();
    let mut id = request.block_id;
    while (pairs.len() as u64) < request.num_blocks {
        if id == request.commit_block || id == request.locked_block {
            break;
        }
        let Some(block) = epoch.chain_store.get_block(&id) else {
            return (BlockFetchStatus::NotEnoughBlocks, pairs);
        };
        let Some(qc) = epoch.chain_store.get_qc(&id).filter(|qc| qc.block_id == Some(id)) else {
            return (BlockFetchStatus::NotEnoughBlocks, pairs);
        };
        let parent = block.pre_hash();
        let genesis = block.is_genesis();
        pairs.push(BlockPair {
            block: (*block).clone(),
            qc,
        });
        if genesis {
            break;
        }
        id = parent;
    }
    if pairs.is_empty() {
        return (BlockFetchStatus::NotEnoughBlocks, pairs);
    }
    (BlockFetchStatus::Succeeded, pairs)
}
