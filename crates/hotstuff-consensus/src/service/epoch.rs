//! Everything that is rebuilt when the committee changes

use super::chain_store::ChainStore;
use super::smr::Smr;
use crate::domain::{Committee, CommitteeSnapshot, ConsensusConfig, MsgPool, TimingConfig};
use crate::events::ProposalMsg;
use std::collections::BTreeSet;

pub(crate) struct Epoch {
    pub epoch_id: u64,
    pub chain_store: ChainStore,
    pub smr: Smr,
    pub msg_pool: MsgPool<ProposalMsg>,
    /// Index in the current validator set, `None` for non-members
    pub self_index: Option<u64>,
    node_id: String,
}

impl Epoch {
    /// The pacemaker starts at the committed root; the first
    /// `process_certificates` moves it onto the next height.
    pub fn new(
        snapshot: &CommitteeSnapshot,
        chain_store: ChainStore,
        config: &ConsensusConfig,
        timing: TimingConfig,
    ) -> Self {
        let committee = Committee::from_snapshot(snapshot);
        let self_index = committee.index_of(&config.node_id);
        let root_height = chain_store.root_block().height();
        let smr = Smr::new(committee, chain_store.pool(), root_height, timing);
        Self {
            epoch_id: snapshot.epoch_id,
            chain_store,
            smr,
            msg_pool: MsgPool::new(config.msg_cache_heights),
            self_index,
            node_id: config.node_id.clone(),
        }
    }

    /// This node's index among the validators used at `height`
    pub fn index_at(&self, height: u64) -> Option<u64> {
        self.smr.committee().index_at(height, &self.node_id)
    }

    /// Current and previous validators, without this node
    pub fn broadcast_peers(&self) -> Vec<String> {
        let committee = self.smr.committee();
        committee
            .validators()
            .iter()
            .chain(committee.last_validators())
            .map(|v| v.node_id.clone())
            .filter(|id| *id != self.node_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryLedger;
    use crate::domain::{Block, Validator};
    use std::sync::Arc;

    fn validators(ids: &[u64]) -> Vec<Validator> {
        ids.iter()
            .map(|&i| Validator {
                index: i,
                node_id: format!("node-{i}"),
                public_key: vec![i as u8; 32],
            })
            .collect()
    }

    fn epoch(snapshot: &CommitteeSnapshot, node_id: &str) -> Epoch {
        let ledger = Arc::new(InMemoryLedger::new(Block::genesis(snapshot.epoch_id)));
        let chain_store = ChainStore::open(ledger.clone(), ledger, 20).unwrap();
        Epoch::new(
            snapshot,
            chain_store,
            &ConsensusConfig::for_node(node_id),
            TimingConfig::default(),
        )
    }

    #[test]
    fn test_membership() {
        let snapshot = CommitteeSnapshot::genesis(validators(&[0, 1, 2, 3]));
        let member = epoch(&snapshot, "node-2");
        assert_eq!(member.self_index, Some(2));
        assert_eq!(member.index_at(1), Some(2));
        assert_eq!(member.smr.height(), 0);

        let outsider = epoch(&snapshot, "observer");
        assert_eq!(outsider.self_index, None);
        assert_eq!(outsider.broadcast_peers().len(), 4);
    }

    #[test]
    fn test_broadcast_peers_span_both_committees() {
        let mut snapshot = CommitteeSnapshot::genesis(validators(&[0, 1, 2, 3, 4]));
        snapshot.epoch_id = 1;
        snapshot.last_validators = validators(&[0, 1, 5]);
        let epoch = epoch(&snapshot, "node-0");
        assert_eq!(
            epoch.broadcast_peers(),
            vec!["node-1", "node-2", "node-3", "node-4", "node-5"]
        );
    }
}
