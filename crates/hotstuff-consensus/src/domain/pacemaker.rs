//! Liveness: the height/level cursor and level timeouts
//!
//! The pacemaker never touches a clock. Every call that needs a timer armed
//! returns the `TimerEvent` and the caller hands it to the timer service.

use super::{ConsStateType, QuorumCert, TimerEvent, TimingConfig};
use tracing::debug;

/// Result of a level change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelAdvance {
    /// The height moved as well, i.e. a QC (not only a TC) drove the change
    pub new_height: bool,
    pub timer: TimerEvent,
}

pub struct Pacemaker {
    height: u64,
    level: u64,
    epoch_id: u64,
    highest_qc_level: u64,
    highest_tc_level: u64,
    highest_committed_level: u64,
    tc: Option<QuorumCert>,
    /// Local timeouts fired at the current level
    retries: u64,
    timing: TimingConfig,
}

impl Pacemaker {
    pub fn new(height: u64, epoch_id: u64, timing: TimingConfig) -> Self {
        Self {
            height,
            level: 0,
            epoch_id,
            highest_qc_level: 0,
            highest_tc_level: 0,
            highest_committed_level: 0,
            tc: None,
            retries: 0,
            timing,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    pub fn highest_tc_level(&self) -> u64 {
        self.highest_tc_level
    }

    pub fn timing(&self) -> TimingConfig {
        self.timing
    }

    /// Replace the timeout schedule. Takes effect at the next armed timer.
    pub fn reconfigure(&mut self, timing: TimingConfig) {
        self.timing = timing;
    }

    /// Fold in the highest QC, the highest TC level and the committed level.
    ///
    /// The new level is `max(qc_level, tc_level) + 1`; the height moves to
    /// `qc_height + 1` when the QC is at least as recent as every TC.
    pub fn process_certificates(
        &mut self,
        qc_height: u64,
        qc_level: u64,
        tc_level: u64,
        committed_level: u64,
    ) -> Option<LevelAdvance> {
        self.highest_committed_level = self.highest_committed_level.max(committed_level);
        self.highest_qc_level = self.highest_qc_level.max(qc_level);
        self.highest_tc_level = self.highest_tc_level.max(tc_level);
        let old_height = self.height;
        self.height = self.height.max(qc_height);

        let mut max_level = self.highest_tc_level;
        if self.highest_qc_level >= self.highest_tc_level {
            max_level = self.highest_qc_level;
            self.height = self.height.max(qc_height + 1);
        }

        let new_level = max_level + 1;
        debug!(
            "[hotstuff] process certificates: qc {}/{}, tc level {}, committed {}, level {} -> {}",
            qc_height, qc_level, tc_level, committed_level, self.level, new_level
        );
        if new_level <= self.level {
            return None;
        }
        self.level = new_level;
        self.retries = 0;
        Some(LevelAdvance {
            new_height: self.height > old_height,
            timer: self.next_timer(),
        })
    }

    /// Re-arm the timer after the level timed out locally.
    ///
    /// Stale timeouts (other levels) return `None`. Each retry at the same
    /// level lengthens the next timeout by one interval step.
    pub fn process_local_timeout(&mut self, level: u64) -> Option<TimerEvent> {
        if level != self.level {
            return None;
        }
        self.retries += 1;
        Some(self.next_timer())
    }

    /// Keep the highest timeout certificate. A candidate must be higher in
    /// both height and level to replace the stored one.
    pub fn update_tc(&mut self, tc: QuorumCert) {
        if let Some(current) = &self.tc {
            if tc.height <= current.height || tc.level <= current.level {
                return;
            }
        }
        self.tc = Some(tc);
    }

    pub fn tc(&self) -> Option<&QuorumCert> {
        self.tc.as_ref()
    }

    /// Distance index of the current level from the last commit
    fn level_index(&self) -> u64 {
        if self.highest_committed_level == 0 {
            return self.level.saturating_sub(1);
        }
        let gap = self.level.saturating_sub(self.highest_committed_level);
        if gap < 3 {
            0
        } else {
            gap - 3
        }
    }

    fn next_timer(&self) -> TimerEvent {
        let level_index = self.level_index() + self.retries;
        TimerEvent {
            state: ConsStateType::PaceMaker,
            height: self.height,
            level: self.level,
            epoch_id: self.epoch_id,
            duration: self.timing.timeout_for(level_index),
            level_index,
        }
    }
}
