use super::*;
use crate::adapters::{
    ChannelBlockBuilder, Ed25519Signer, Ed25519Verifier, InMemoryLedger, InMemoryNetwork,
    InMemoryWal, Inbound, NetworkEndpoint, StaticGovernance,
};
use crate::domain::{
    ConsStateType, Hash, QuorumCert, SyncInfo, TimerEvent, Validator, VoteData, VoteMsg,
    ROUND_TIMEOUT_KEY,
};
use crate::events::{
    BlockFetchMsg, BlockFetchRespMsg, BlockFetchStatus, BlockPair, BuildProposal,
    ConsensusPayload, ProposalData, ProposalMsg,
};
use crate::ports::{ConsensusApi, NetworkSender, Signer};
use std::time::Duration;
use tokio::task::JoinHandle;

const COMMITTEE_SIZE: u64 = 4;

fn node(idx: u64) -> String {
    format!("node-{idx}")
}

fn signer(idx: u64) -> Ed25519Signer {
    Ed25519Signer::from_seed([idx as u8 + 1; 32])
}

fn validators() -> Vec<Validator> {
    (0..COMMITTEE_SIZE)
        .map(|i| Validator {
            index: i,
            node_id: node(i),
            public_key: signer(i).public_key(),
        })
        .collect()
}

fn genesis() -> Block {
    Block::genesis(0)
}

fn genesis_qc() -> QuorumCert {
    genesis().qc.unwrap()
}

/// Records every message the service puts on the wire.
#[derive(Default)]
struct RecordingNetwork {
    sent: Mutex<Vec<(String, ConsensusMsg)>>,
}

impl RecordingNetwork {
    fn take(&self) -> Vec<(String, ConsensusMsg)> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn votes(&self) -> Vec<(String, VoteData)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(peer, msg)| match &msg.payload {
                ConsensusPayload::Vote(vote) => Some((peer.clone(), vote.vote_data.clone())),
                _ => None,
            })
            .collect()
    }

    fn fetch_request(&self) -> Option<BlockFetchMsg> {
        self.sent.lock().iter().find_map(|(_, msg)| match &msg.payload {
            ConsensusPayload::BlockFetch(req) => Some(req.clone()),
            _ => None,
        })
    }
}

impl NetworkSender for RecordingNetwork {
    fn send(&self, peer: &str, payload: Vec<u8>) -> ConsensusResult<()> {
        let msg = ConsensusMsg::decode(&payload)?;
        self.sent.lock().push((peer.to_string(), msg));
        Ok(())
    }
}

struct Harness {
    service: Arc<ConsensusService>,
    network: Arc<RecordingNetwork>,
    wal: Arc<InMemoryWal>,
    builds: mpsc::UnboundedReceiver<BuildProposal>,
}

impl Harness {
    fn new(idx: u64) -> Self {
        Self::build(
            idx,
            CommitteeSnapshot::genesis(validators()),
            Arc::new(InMemoryWal::new()),
            Arc::new(InMemoryLedger::new(genesis())),
        )
        .0
    }

    fn build(
        idx: u64,
        snapshot: CommitteeSnapshot,
        wal: Arc<InMemoryWal>,
        ledger: Arc<InMemoryLedger>,
    ) -> (Self, Arc<StaticGovernance>) {
        let network = Arc::new(RecordingNetwork::default());
        let governance = Arc::new(StaticGovernance::new(snapshot));
        let (builder, builds) = ChannelBlockBuilder::new();
        let mut config = ConsensusConfig::for_node(node(idx));
        config.timing.round_timeout = Duration::from_secs(2);

        let service = ConsensusService::new(ConsensusDependencies {
            store: ledger.clone(),
            committer: ledger.clone(),
            verifier: ledger,
            signer: Arc::new(signer(idx)),
            sig_verifier: Arc::new(Ed25519Verifier),
            governance: governance.clone(),
            network: network.clone(),
            builder: Arc::new(builder),
            wal: wal.clone(),
            config,
        })
        .unwrap();

        let harness = Self {
            service: Arc::new(service),
            network,
            wal,
            builds,
        };
        (harness, governance)
    }

    /// Finish the (empty) replay and enter the first level, without
    /// spawning the loops.
    async fn ready(&self) {
        self.service.replay_wal().await.unwrap();
        self.service.kick_off().await.unwrap();
    }
}

fn signed(idx: u64, payload: ConsensusPayload) -> ConsensusMsg {
    let sign_entry = signer(idx).sign(&payload.signing_bytes().unwrap()).unwrap();
    ConsensusMsg {
        payload,
        sign_entry: Some(sign_entry),
    }
}

fn signed_block(proposer: u64, height: u64, level: u64, parent: &Block) -> Block {
    let mut block = Block::new(height, parent.hash(), vec![height as u8, level as u8], height);
    block.header.level = level;
    block.header.proposer = node(proposer);
    block.seal();
    block.header.signature = Some(signer(proposer).sign(&block.hash()).unwrap());
    block
}

fn proposal_signed_by(
    proposer: u64,
    msg_signer: u64,
    block: Block,
    justify_qc: QuorumCert,
) -> ConsensusMsg {
    let payload = ConsensusPayload::Proposal(ProposalMsg {
        proposal_data: ProposalData {
            height: block.height(),
            level: block.level(),
            epoch_id: 0,
            proposer: node(proposer),
            proposer_idx: proposer,
            justify_qc: justify_qc.clone(),
            block,
        },
        sync_info: SyncInfo {
            highest_qc: justify_qc,
            highest_tc: None,
            highest_tc_level: 0,
        },
    });
    signed(msg_signer, payload)
}

/// Block by `proposer` on top of `parent`, wrapped in a signed proposal.
fn proposal(
    proposer: u64,
    height: u64,
    level: u64,
    parent: &Block,
    justify_qc: QuorumCert,
) -> (Block, ConsensusMsg) {
    let block = signed_block(proposer, height, level, parent);
    let msg = proposal_signed_by(proposer, proposer, block.clone(), justify_qc);
    (block, msg)
}

fn vote(idx: u64, height: u64, level: u64, block_id: Option<Hash>, new_view: bool) -> VoteData {
    let mut data = VoteData {
        author: node(idx),
        author_idx: idx,
        height,
        level,
        epoch_id: 0,
        block_id,
        new_view,
        signature: None,
    };
    data.signature = Some(signer(idx).sign(&data.signing_bytes().unwrap()).unwrap());
    data
}

fn vote_msg(vote_data: VoteData, highest_qc: QuorumCert) -> ConsensusMsg {
    let idx = vote_data.author_idx;
    signed(
        idx,
        ConsensusPayload::Vote(VoteMsg {
            vote_data,
            sync_info: SyncInfo {
                highest_qc,
                highest_tc: None,
                highest_tc_level: 0,
            },
        }),
    )
}

fn qc_for(block: &Block, voters: &[u64]) -> QuorumCert {
    QuorumCert {
        block_id: Some(block.hash()),
        height: block.height(),
        level: block.level(),
        epoch_id: 0,
        new_view: false,
        votes: voters
            .iter()
            .map(|&i| vote(i, block.height(), block.level(), Some(block.hash()), false))
            .collect(),
    }
}

fn timeout_event(height: u64, level: u64) -> TimerEvent {
    TimerEvent {
        state: ConsStateType::PaceMaker,
        height,
        level,
        epoch_id: 0,
        duration: Duration::from_secs(2),
        level_index: 0,
    }
}

// -------------------------------------------------------------------------
// PROPOSALS
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_valid_proposal_is_voted_for() {
    let h = Harness::new(0);
    h.ready().await;

    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    h.service.handle_protocol_msg(msg).await.unwrap();

    let sent = h.network.take();
    assert_eq!(sent.len(), 1);
    let (peer, msg) = &sent[0];
    assert_eq!(peer, "node-2", "votes at level 1 go to the leader of level 2");
    let ConsensusPayload::Vote(vote) = &msg.payload else {
        panic!("expected a vote, got {:?}", msg.payload.msg_type());
    };
    assert_eq!(vote.vote_data.block_id, Some(b1.hash()));
    assert_eq!(vote.vote_data.author_idx, 0);
    assert!(!vote.vote_data.new_view);

    let status = h.service.status();
    assert_eq!(status.state, ConsStateType::Vote);
    assert_eq!((status.height, status.level), (1, 1));
    assert_eq!(status.last_vote_level, 1);
    // the proposal and the vote
    assert_eq!(h.wal.len(), 2);
}

#[tokio::test]
async fn test_duplicate_proposal_rejected() {
    let h = Harness::new(0);
    h.ready().await;

    let (_, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    h.service.handle_protocol_msg(msg.clone()).await.unwrap();
    let err = h.service.handle_protocol_msg(msg).await.unwrap_err();

    assert!(matches!(err, ConsensusError::DuplicateProposal { height: 1, level: 1 }));
    assert_eq!(h.network.votes().len(), 1);
}

#[tokio::test]
async fn test_proposal_from_wrong_leader_rejected() {
    let h = Harness::new(0);
    h.ready().await;

    let (_, msg) = proposal(3, 1, 1, &genesis(), genesis_qc());
    let err = h.service.handle_protocol_msg(msg).await.unwrap_err();

    assert!(matches!(err, ConsensusError::InvalidProposer(_)));
    assert!(h.network.take().is_empty());
    assert_eq!(h.service.status().last_vote_level, 0);
}

#[tokio::test]
async fn test_forged_proposal_rejected() {
    let h = Harness::new(0);
    h.ready().await;

    let block = signed_block(1, 1, 1, &genesis());
    let msg = proposal_signed_by(1, 3, block, genesis_qc());
    let err = h.service.handle_protocol_msg(msg).await.unwrap_err();

    assert!(matches!(err, ConsensusError::InvalidSignature(_)));
    assert!(h.network.take().is_empty());
}

#[tokio::test]
async fn test_proposal_with_weak_justification_rejected() {
    let h = Harness::new(0);
    h.ready().await;

    let b1 = signed_block(1, 1, 1, &genesis());
    let (_, msg) = proposal(2, 2, 2, &b1, qc_for(&b1, &[0, 1]));
    let err = h.service.handle_protocol_msg(msg).await.unwrap_err();

    assert!(matches!(err, ConsensusError::InsufficientVotes { got: 2, required: 3 }));
}

/// Feed b1, b2 and b3 at levels 1 to 3. The certificate for b2 carried by
/// b3 locks b1.
async fn three_chain(service: &ConsensusService) -> (Block, Block, Block) {
    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    service.handle_protocol_msg(msg).await.unwrap();
    let (b2, msg) = proposal(2, 2, 2, &b1, qc_for(&b1, &[0, 1, 2]));
    service.handle_protocol_msg(msg).await.unwrap();
    let (b3, msg) = proposal(3, 3, 3, &b2, qc_for(&b2, &[0, 1, 2]));
    service.handle_protocol_msg(msg).await.unwrap();
    (b1, b2, b3)
}

#[tokio::test]
async fn test_fork_below_lock_is_dropped_without_halting() {
    let h = Harness::new(0);
    h.ready().await;
    let (_, _, b3) = three_chain(&h.service).await;
    h.network.take();

    let status = h.service.status();
    assert_eq!(status.locked_level, 1);
    assert_eq!((status.height, status.level), (3, 3));

    // the level 5 leader forks off genesis with a certificate older than the lock
    let (_, fork) = proposal(1, 1, 5, &genesis(), genesis_qc());
    let err = h.service.handle_protocol_msg(fork).await.unwrap_err();
    assert!(matches!(err, ConsensusError::UnsafeProposal(_)));
    assert!(!err.is_fatal());

    h.service.on_error(err);
    assert!(!*h.service.halted().borrow());
    assert!(h.network.take().is_empty());
    let status = h.service.status();
    assert_eq!(status.locked_level, 1);
    assert_eq!(status.last_vote_level, 3);

    // level 4 is this node's own slot; its proposal loops back like any other
    let (b4, msg) = proposal(0, 4, 4, &b3, qc_for(&b3, &[0, 1, 2]));
    h.service.handle_protocol_msg(msg).await.unwrap();

    let votes = h.network.votes();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].0, "node-1");
    assert_eq!(votes[0].1.block_id, Some(b4.hash()));
    let status = h.service.status();
    assert_eq!(status.last_vote_level, 4);
    assert_eq!(status.locked_level, 2);
}

// -------------------------------------------------------------------------
// VOTES AND CERTIFICATES
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_votes_form_qc_and_request_next_block() {
    let mut h = Harness::new(2);
    h.ready().await;

    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    h.service.handle_protocol_msg(msg).await.unwrap();
    // node-2 leads level 2, so its own vote stays local
    assert!(h.network.take().is_empty());
    assert!(h.builds.try_recv().is_err());

    for idx in [0, 1, 3] {
        let msg = vote_msg(vote(idx, 1, 1, Some(b1.hash()), false), genesis_qc());
        h.service.handle_protocol_msg(msg).await.unwrap();
    }

    let request = h.builds.try_recv().unwrap();
    assert_eq!(
        request,
        BuildProposal {
            height: 2,
            pre_hash: b1.hash(),
            is_proposer: true,
        }
    );
    let status = h.service.status();
    assert_eq!((status.height, status.level), (2, 2));
    assert_eq!(status.highest_qc_level, 1);
    assert_eq!(status.state, ConsStateType::Propose);

    h.service
        .handle_proposed_block(Block::new(2, b1.hash(), b"payload".to_vec(), 2))
        .await
        .unwrap();
    let sent = h.network.take();
    let mut peers: Vec<_> = sent.iter().map(|(peer, _)| peer.as_str()).collect();
    peers.sort();
    assert_eq!(peers, ["node-0", "node-1", "node-3"]);
    for (_, msg) in &sent {
        let ConsensusPayload::Proposal(proposal) = &msg.payload else {
            panic!("expected a proposal");
        };
        let data = &proposal.proposal_data;
        assert_eq!((data.height, data.level), (2, 2));
        assert_eq!(data.justify_qc.block_id, Some(b1.hash()));
        assert_eq!(data.justify_qc.votes.len(), 3);
        assert!(data.block.verify_hash());
    }

    // only one block per level
    let err = h
        .service
        .handle_proposed_block(Block::new(2, b1.hash(), b"again".to_vec(), 3))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::DuplicateProposal { .. }));
}

#[tokio::test]
async fn test_vote_for_other_leader_dropped() {
    let h = Harness::new(0);
    h.ready().await;

    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    h.service.handle_protocol_msg(msg).await.unwrap();

    let msg = vote_msg(vote(3, 1, 1, Some(b1.hash()), false), genesis_qc());
    let err = h.service.handle_protocol_msg(msg).await.unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidProposer(_)));
}

#[tokio::test]
async fn test_vote_with_mismatched_author_rejected() {
    let h = Harness::new(2);
    h.ready().await;

    let mut data = vote(1, 1, 1, None, true);
    data.author_idx = 3;
    let err = h
        .service
        .handle_protocol_msg(vote_msg(data, genesis_qc()))
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidSignature(_)));
}

#[tokio::test]
async fn test_timeout_votes_form_tc() {
    let h = Harness::new(0);
    h.ready().await;

    for idx in [1, 2, 3] {
        let msg = vote_msg(vote(idx, 1, 1, None, true), genesis_qc());
        h.service.handle_protocol_msg(msg).await.unwrap();
    }

    let status = h.service.status();
    assert_eq!(status.level, 2, "a timeout certificate moves the level");
    assert_eq!(status.height, 1, "but not the height");
    assert_eq!(h.service.current_epoch().smr.highest_tc_level(), 1);
}

// -------------------------------------------------------------------------
// PACEMAKER
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_local_timeout_broadcasts_timeout_vote() {
    let h = Harness::new(0);
    h.ready().await;

    h.service.handle_timer_event(timeout_event(1, 1)).await.unwrap();

    let votes = h.network.votes();
    let mut peers: Vec<_> = votes.iter().map(|(peer, _)| peer.as_str()).collect();
    peers.sort();
    assert_eq!(peers, ["node-1", "node-2", "node-3"]);
    for (_, vote) in &votes {
        assert!(vote.new_view);
        assert_eq!(vote.block_id, None);
        assert_eq!((vote.height, vote.level), (1, 1));
    }
    assert_eq!(h.service.status().state, ConsStateType::PaceMaker);
}

#[tokio::test]
async fn test_timeout_retries_cast_vote() {
    let h = Harness::new(0);
    h.ready().await;

    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    h.service.handle_protocol_msg(msg).await.unwrap();
    h.network.take();

    h.service.handle_timer_event(timeout_event(1, 1)).await.unwrap();
    let votes = h.network.votes();
    assert_eq!(votes.len(), 3);
    assert!(votes
        .iter()
        .all(|(_, vote)| vote.new_view && vote.block_id == Some(b1.hash())));
}

#[tokio::test]
async fn test_stale_timer_event_ignored() {
    let h = Harness::new(0);
    h.ready().await;

    h.service.handle_timer_event(timeout_event(1, 0)).await.unwrap();
    h.service.handle_timer_event(timeout_event(7, 1)).await.unwrap();
    let mut other_epoch = timeout_event(1, 1);
    other_epoch.epoch_id = 9;
    h.service.handle_timer_event(other_epoch).await.unwrap();

    assert!(h.network.take().is_empty());
    assert_eq!(h.service.status().state, ConsStateType::NewLevel);
}

// -------------------------------------------------------------------------
// WAL
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_replay_restores_vote_guard() {
    let wal = Arc::new(InMemoryWal::new());
    let ledger = Arc::new(InMemoryLedger::new(genesis()));
    let snapshot = CommitteeSnapshot::genesis(validators());

    let (first, _) = Harness::build(0, snapshot.clone(), wal.clone(), ledger.clone());
    first.ready().await;
    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    first.service.handle_protocol_msg(msg.clone()).await.unwrap();
    drop(first);

    let (second, _) = Harness::build(0, snapshot, wal, ledger);
    second.service.replay_wal().await.unwrap();

    assert!(second.network.take().is_empty(), "replay must not send");
    let status = second.service.status();
    assert_eq!((status.height, status.level), (1, 1));
    assert_eq!(status.last_vote_level, 1);

    let err = second.service.handle_protocol_msg(msg).await.unwrap_err();
    assert!(matches!(err, ConsensusError::DuplicateProposal { .. }));

    second
        .service
        .handle_timer_event(timeout_event(1, 1))
        .await
        .unwrap();
    let votes = second.network.votes();
    assert_eq!(votes.len(), 3);
    assert!(votes.iter().all(|(_, v)| v.block_id == Some(b1.hash())));
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let wal = Arc::new(InMemoryWal::new());
    let ledger = Arc::new(InMemoryLedger::new(genesis()));
    let snapshot = CommitteeSnapshot::genesis(validators());

    let (first, _) = Harness::build(0, snapshot.clone(), wal.clone(), ledger.clone());
    first.ready().await;
    three_chain(&first.service).await;
    let live = first.service.status();
    drop(first);
    let entries = wal.len();

    let (second, _) = Harness::build(0, snapshot.clone(), wal.clone(), ledger.clone());
    second.service.replay_wal().await.unwrap();
    let replayed = second.service.status();
    drop(second);
    assert_eq!(wal.len(), entries, "replay must not append");

    let (third, _) = Harness::build(0, snapshot, wal.clone(), ledger);
    third.service.replay_wal().await.unwrap();
    let again = third.service.status();
    assert_eq!(wal.len(), entries);
    assert!(third.network.take().is_empty());

    for status in [&replayed, &again] {
        assert_eq!(status.locked_level, live.locked_level);
        assert_eq!(status.last_vote_level, live.last_vote_level);
        assert_eq!(status.highest_qc_level, live.highest_qc_level);
        assert_eq!((status.height, status.level), (live.height, live.level));
    }
    assert_eq!(
        (again.locked_level, again.last_vote_level, again.highest_qc_level),
        (1, 3, 2)
    );
}

#[tokio::test]
async fn test_replay_rejects_corrupt_wal() {
    let wal = Arc::new(InMemoryWal::new());
    wal.write(1, b"not a wal entry").unwrap();
    let (h, _) = Harness::build(
        0,
        CommitteeSnapshot::genesis(validators()),
        wal,
        Arc::new(InMemoryLedger::new(genesis())),
    );

    let err = h.service.replay_wal().await.unwrap_err();
    assert!(err.is_fatal());
}

// -------------------------------------------------------------------------
// BLOCK SYNC
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_serves_block_fetch() {
    let h = Harness::new(2);
    h.ready().await;

    let (b1, msg) = proposal(1, 1, 1, &genesis(), genesis_qc());
    h.service.handle_protocol_msg(msg).await.unwrap();
    for idx in [0, 1, 3] {
        let msg = vote_msg(vote(idx, 1, 1, Some(b1.hash()), false), genesis_qc());
        h.service.handle_protocol_msg(msg).await.unwrap();
    }
    h.network.take();

    let request = signed(
        0,
        ConsensusPayload::BlockFetch(BlockFetchMsg {
            req_id: 7,
            height: 1,
            block_id: b1.hash(),
            num_blocks: 1,
            author_idx: 0,
            commit_block: genesis().hash(),
            locked_block: genesis().hash(),
        }),
    );
    h.service.process_block_fetch(&request).unwrap();

    let sent = h.network.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "node-0");
    let ConsensusPayload::BlockFetchResp(resp) = &sent[0].1.payload else {
        panic!("expected a fetch response");
    };
    assert_eq!(resp.resp_id, 7);
    assert_eq!(resp.status, BlockFetchStatus::Succeeded);
    assert_eq!(resp.blocks.len(), 1);
    assert_eq!(resp.blocks[0].block.hash(), b1.hash());
    assert_eq!(resp.blocks[0].qc.block_id, Some(b1.hash()));

    // nothing between the requested block and the requester's root
    let request = signed(
        0,
        ConsensusPayload::BlockFetch(BlockFetchMsg {
            req_id: 8,
            height: 1,
            block_id: b1.hash(),
            num_blocks: 1,
            author_idx: 0,
            commit_block: b1.hash(),
            locked_block: genesis().hash(),
        }),
    );
    h.service.process_block_fetch(&request).unwrap();

    let sent = h.network.take();
    assert_eq!(sent.len(), 1);
    let ConsensusPayload::BlockFetchResp(resp) = &sent[0].1.payload else {
        panic!("expected a fetch response");
    };
    assert_eq!(resp.status, BlockFetchStatus::NotEnoughBlocks);
    assert!(resp.blocks.is_empty());
}

#[tokio::test]
async fn test_missing_parent_is_fetched_before_voting() {
    let h = Harness::new(0);
    h.ready().await;

    let b1 = signed_block(1, 1, 1, &genesis());
    let qc1 = qc_for(&b1, &[0, 1, 2]);
    let (b2, msg) = proposal(2, 2, 2, &b1, qc1.clone());

    let service = Arc::clone(&h.service);
    let task = tokio::spawn(async move { service.handle_protocol_msg(msg).await });

    let mut request = None;
    for _ in 0..200 {
        request = h.network.fetch_request();
        if request.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let request = request.expect("no fetch request sent");
    assert_eq!(request.block_id, b1.hash());
    assert_eq!(request.author_idx, 0);

    let resp = signed(
        2,
        ConsensusPayload::BlockFetchResp(BlockFetchRespMsg {
            resp_id: request.req_id,
            status: BlockFetchStatus::Succeeded,
            blocks: vec![BlockPair { block: b1, qc: qc1 }],
            author_idx: 2,
        }),
    );
    h.service.process_block_fetch_resp(resp).unwrap();
    task.await.unwrap().unwrap();

    let votes = h.network.votes();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0].0, "node-3");
    assert_eq!(votes[0].1.block_id, Some(b2.hash()));
    assert_eq!(h.service.status().highest_qc_level, 1);
}

// -------------------------------------------------------------------------
// API
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_verify_block_signatures() {
    let h = Harness::new(0);
    let b1 = signed_block(1, 1, 1, &genesis());

    let mut certified = b1.clone();
    certified.qc = Some(qc_for(&b1, &[0, 1, 2]));
    ConsensusApi::verify_block_signatures(&*h.service, &certified)
        .await
        .unwrap();

    let mut weak = b1.clone();
    weak.qc = Some(qc_for(&b1, &[0, 1]));
    let err = ConsensusApi::verify_block_signatures(&*h.service, &weak)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InsufficientVotes { .. }));

    let mut mismatched = b1.clone();
    mismatched.qc = Some(qc_for(&genesis(), &[0, 1, 2]));
    let err = ConsensusApi::verify_block_signatures(&*h.service, &mismatched)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidQc(_)));

    let err = ConsensusApi::verify_block_signatures(&*h.service, &b1)
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidQc(_)));
}

#[tokio::test]
async fn test_governance_timing_overrides() {
    let mut snapshot = CommitteeSnapshot::genesis(validators());
    snapshot
        .ext_config
        .push((ROUND_TIMEOUT_KEY.to_string(), "1500".to_string()));
    let (h, _) = Harness::build(
        0,
        snapshot,
        Arc::new(InMemoryWal::new()),
        Arc::new(InMemoryLedger::new(genesis())),
    );
    assert_eq!(h.service.round_timeout(), Duration::from_millis(1500));

    h.service.reconfigure_timing(TimingConfig {
        round_timeout: Duration::from_millis(300),
        round_timeout_interval: Duration::from_millis(10),
    });
    assert_eq!(h.service.round_timeout(), Duration::from_millis(300));
}

#[tokio::test]
async fn test_epoch_switch_on_commit() {
    let ledger = Arc::new(InMemoryLedger::new(genesis()));
    let (h, governance) = Harness::build(
        0,
        CommitteeSnapshot::genesis(validators()),
        Arc::new(InMemoryWal::new()),
        ledger.clone(),
    );
    h.ready().await;

    let mut b1 = signed_block(1, 1, 1, &genesis());
    b1.qc = Some(qc_for(&b1, &[0, 1, 2]));
    ledger.commit_block(&b1).unwrap();

    let mut next = CommitteeSnapshot::genesis(validators());
    next.epoch_id = 1;
    next.switch_height = 1;
    next.last_validators = validators();
    governance.update(next);

    h.service.handle_block_committed(b1).await.unwrap();

    let status = h.service.status();
    assert_eq!(status.epoch_id, 1);
    assert_eq!(status.commit_height, 1);
    assert_eq!((status.height, status.level), (2, 2));
    assert_eq!(status.self_index, Some(0));
}

#[tokio::test]
async fn test_start_only_once() {
    let h = Harness::new(0);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = h.service.start(shutdown_rx.clone()).await.unwrap();
    let err = h.service.start(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, ConsensusError::ChannelClosed(_)));

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

// -------------------------------------------------------------------------
// END TO END
// -------------------------------------------------------------------------

struct Node {
    service: Arc<ConsensusService>,
    ledger: Arc<InMemoryLedger>,
    handles: Vec<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
}

async fn spawn_node(
    idx: u64,
    endpoint: NetworkEndpoint,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    shutdown: watch::Receiver<bool>,
) -> Node {
    let (ledger, mut commits) = InMemoryLedger::with_commit_notify(genesis());
    let ledger = Arc::new(ledger);
    let (builder, mut builds) = ChannelBlockBuilder::new();
    let mut config = ConsensusConfig::for_node(node(idx));
    config.timing = TimingConfig {
        round_timeout: Duration::from_millis(300),
        round_timeout_interval: Duration::from_millis(100),
    };

    let service = Arc::new(
        ConsensusService::new(ConsensusDependencies {
            store: ledger.clone(),
            committer: ledger.clone(),
            verifier: ledger.clone(),
            signer: Arc::new(signer(idx)),
            sig_verifier: Arc::new(Ed25519Verifier),
            governance: Arc::new(StaticGovernance::new(CommitteeSnapshot::genesis(validators()))),
            network: Arc::new(endpoint),
            builder: Arc::new(builder),
            wal: Arc::new(InMemoryWal::new()),
            config,
        })
        .unwrap(),
    );

    let mut pumps = Vec::new();
    let svc = Arc::clone(&service);
    pumps.push(tokio::spawn(async move {
        while let Some((peer, payload)) = inbound.recv().await {
            let _ = svc.on_network_message(peer, payload).await;
        }
    }));
    let svc = Arc::clone(&service);
    pumps.push(tokio::spawn(async move {
        while let Some(request) = builds.recv().await {
            let payload = format!("{}@{}", node(idx), request.height).into_bytes();
            let block = Block::new(request.height, request.pre_hash, payload, request.height);
            let _ = svc.on_proposed_block(block).await;
        }
    }));
    let svc = Arc::clone(&service);
    pumps.push(tokio::spawn(async move {
        while let Some(block) = commits.recv().await {
            let _ = svc.on_block_committed(block).await;
        }
    }));

    let handles = service.start(shutdown).await.unwrap();
    Node {
        service,
        ledger,
        handles,
        pumps,
    }
}

/// Every endpoint is registered before the first node starts proposing.
async fn spawn_committee(hub: &InMemoryNetwork, shutdown: watch::Receiver<bool>) -> Vec<Node> {
    let endpoints: Vec<_> = (0..COMMITTEE_SIZE).map(|i| hub.register(&node(i))).collect();
    let mut nodes = Vec::new();
    for (idx, (endpoint, inbound)) in (0..).zip(endpoints) {
        nodes.push(spawn_node(idx, endpoint, inbound, shutdown.clone()).await);
    }
    nodes
}

async fn wait_for_height(nodes: &[&Node], height: u64, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !nodes.iter().all(|n| n.ledger.height() >= height) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "ledgers stuck at {:?}",
            nodes.iter().map(|n| n.ledger.height()).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn assert_same_chain(nodes: &[&Node], up_to: u64) {
    for height in 1..=up_to {
        let hashes: Vec<_> = nodes
            .iter()
            .map(|n| n.ledger.get_block(height).map(|b| b.hash()))
            .collect();
        assert!(hashes[0].is_some());
        assert!(
            hashes.iter().all(|h| *h == hashes[0]),
            "fork at height {height}"
        );
    }
}

async fn stop(nodes: Vec<Node>, shutdown_tx: watch::Sender<bool>) {
    shutdown_tx.send(true).unwrap();
    for node in nodes {
        for handle in node.handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
        for pump in node.pumps {
            pump.abort();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_nodes_commit_same_chain() {
    let hub = InMemoryNetwork::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let nodes = spawn_committee(&hub, shutdown_rx).await;

    let all: Vec<&Node> = nodes.iter().collect();
    wait_for_height(&all, 3, Duration::from_secs(20)).await;
    assert_same_chain(&all, 3);
    for node in &nodes {
        assert!(node.service.status().commit_height >= 3);
    }

    stop(nodes, shutdown_tx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_with_one_node_down() {
    let hub = InMemoryNetwork::new();
    hub.isolate("node-3");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let nodes = spawn_committee(&hub, shutdown_rx).await;

    let live: Vec<&Node> = nodes.iter().take(3).collect();
    wait_for_height(&live, 2, Duration::from_secs(30)).await;
    assert_same_chain(&live, 2);
    assert_eq!(nodes[3].ledger.height(), 0);

    stop(nodes, shutdown_tx).await;
}
