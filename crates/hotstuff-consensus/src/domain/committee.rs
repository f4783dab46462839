//! Validator sets and the epoch grace window

use serde::{Deserialize, Serialize};

/// Heights after a switch during which the previous committee stays
/// authoritative.
pub const EPOCH_GRACE_HEIGHTS: u64 = 3;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validator {
    pub index: u64,
    pub node_id: String,
    pub public_key: Vec<u8>,
}

/// Everything governance publishes about one epoch
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitteeSnapshot {
    pub epoch_id: u64,
    pub validators: Vec<Validator>,
    pub last_validators: Vec<Validator>,
    pub switch_height: u64,
    pub quorum: usize,
    pub last_quorum: usize,
    /// Consecutive levels each proposer keeps
    pub node_propose_round: u64,
    /// Free-form chain parameters, e.g. timing overrides
    pub ext_config: Vec<(String, String)>,
}

impl CommitteeSnapshot {
    /// A first-epoch snapshot with the usual `2f + 1` quorum.
    pub fn genesis(validators: Vec<Validator>) -> Self {
        let quorum = bft_quorum(validators.len());
        Self {
            epoch_id: 0,
            validators,
            last_validators: Vec::new(),
            switch_height: 0,
            quorum,
            last_quorum: quorum,
            node_propose_round: 1,
            ext_config: Vec::new(),
        }
    }

    pub fn ext_value(&self, key: &str) -> Option<&str> {
        self.ext_config
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Smallest quorum tolerating `f = (n - 1) / 3` faults
pub fn bft_quorum(n: usize) -> usize {
    n * 2 / 3 + 1
}

/// Resolves which validators and quorum apply at a height
#[derive(Clone, Debug)]
pub struct Committee {
    epoch_id: u64,
    validators: Vec<Validator>,
    last_validators: Vec<Validator>,
    switch_height: u64,
    quorum: usize,
    last_quorum: usize,
    node_propose_round: u64,
}

impl Committee {
    pub fn from_snapshot(snapshot: &CommitteeSnapshot) -> Self {
        let mut validators = snapshot.validators.clone();
        validators.sort_by_key(|v| v.index);
        let mut last_validators = snapshot.last_validators.clone();
        last_validators.sort_by_key(|v| v.index);
        Self {
            epoch_id: snapshot.epoch_id,
            validators,
            last_validators,
            switch_height: snapshot.switch_height,
            quorum: snapshot.quorum,
            last_quorum: snapshot.last_quorum,
            node_propose_round: snapshot.node_propose_round.max(1),
        }
    }

    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    fn in_grace(&self, height: u64) -> bool {
        height != 0
            && height <= self.switch_height + EPOCH_GRACE_HEIGHTS
            && !self.last_validators.is_empty()
    }

    /// Validators whose votes count at `height`
    pub fn peers_at(&self, height: u64) -> &[Validator] {
        if self.in_grace(height) {
            &self.last_validators
        } else {
            &self.validators
        }
    }

    pub fn quorum_at(&self, height: u64) -> usize {
        if self.in_grace(height) {
            self.last_quorum
        } else {
            self.quorum
        }
    }

    /// Validators of the current epoch, regardless of the grace window
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn last_validators(&self) -> &[Validator] {
        &self.last_validators
    }

    /// Look up `index` in the current committee, then in the previous one.
    pub fn member(&self, index: u64) -> Option<&Validator> {
        self.validators
            .iter()
            .chain(self.last_validators.iter())
            .find(|v| v.index == index)
    }

    /// Index of `node_id` among the validators used at `height`
    pub fn index_at(&self, height: u64, node_id: &str) -> Option<u64> {
        self.peers_at(height)
            .iter()
            .find(|v| v.node_id == node_id)
            .map(|v| v.index)
    }

    pub fn validator_by_index(&self, height: u64, index: u64) -> Option<&Validator> {
        self.peers_at(height).iter().find(|v| v.index == index)
    }

    pub fn is_valid_index(&self, height: u64, index: u64) -> bool {
        self.validator_by_index(height, index).is_some()
    }

    /// Proposer of `level` among the validators used at `height`
    pub fn proposer(&self, height: u64, level: u64) -> Option<&Validator> {
        let peers = self.peers_at(height);
        if peers.is_empty() {
            return None;
        }
        let slot = (level / self.node_propose_round) % peers.len() as u64;
        peers.get(slot as usize)
    }

    /// Index of `node_id` in the current epoch
    pub fn index_of(&self, node_id: &str) -> Option<u64> {
        self.validators
            .iter()
            .find(|v| v.node_id == node_id)
            .map(|v| v.index)
    }
}
