//! State machine replication core: committee, pacemaker, safety rules and
//! the per-level protocol state, bundled per epoch.

use crate::domain::{
    BlockPool, Committee, ConsStateType, LevelAdvance, Pacemaker, QuorumCert, SafetyRules,
    TimerEvent, TimingConfig, Validator,
};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) struct Smr {
    committee: Committee,
    pacemaker: Mutex<Pacemaker>,
    safety: SafetyRules,
    state: Mutex<ConsStateType>,
}

impl Smr {
    pub fn new(committee: Committee, pool: Arc<BlockPool>, height: u64, timing: TimingConfig) -> Self {
        let pacemaker = Pacemaker::new(height, committee.epoch_id(), timing);
        Self {
            committee,
            pacemaker: Mutex::new(pacemaker),
            safety: SafetyRules::new(pool),
            state: Mutex::new(ConsStateType::NewHeight),
        }
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn safety(&self) -> &SafetyRules {
        &self.safety
    }

    pub fn height(&self) -> u64 {
        self.pacemaker.lock().height()
    }

    pub fn level(&self) -> u64 {
        self.pacemaker.lock().level()
    }

    pub fn state(&self) -> ConsStateType {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ConsStateType) {
        *self.state.lock() = state;
    }

    pub fn process_certificates(
        &self,
        qc_height: u64,
        qc_level: u64,
        tc_level: u64,
        committed_level: u64,
    ) -> Option<LevelAdvance> {
        let advance =
            self.pacemaker
                .lock()
                .process_certificates(qc_height, qc_level, tc_level, committed_level)?;
        crate::metrics::record_level(advance.timer.level);
        Some(advance)
    }

    pub fn process_local_timeout(&self, level: u64) -> Option<TimerEvent> {
        self.pacemaker.lock().process_local_timeout(level)
    }

    pub fn update_tc(&self, tc: QuorumCert) {
        self.pacemaker.lock().update_tc(tc);
    }

    pub fn tc(&self) -> Option<QuorumCert> {
        self.pacemaker.lock().tc().cloned()
    }

    pub fn highest_tc_level(&self) -> u64 {
        self.pacemaker.lock().highest_tc_level()
    }

    pub fn reconfigure(&self, timing: TimingConfig) {
        self.pacemaker.lock().reconfigure(timing);
    }

    pub fn proposer(&self, height: u64, level: u64) -> Option<&Validator> {
        self.committee.proposer(height, level)
    }

    pub fn is_proposer(&self, node_id: &str, height: u64, level: u64) -> bool {
        self.proposer(height, level)
            .is_some_and(|v| v.node_id == node_id)
    }

    /// Leader collecting the votes cast at (height, level)
    pub fn next_leader(&self, height: u64, level: u64) -> Option<&Validator> {
        self.proposer(height + 1, level + 1)
    }
}
