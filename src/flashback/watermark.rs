use crate::types::{Lsn, Scn};
use serde::{Deserialize, Serialize};

/// Commit high-watermarks the engine keeps alongside the stream tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitWatermark {
    pub committed_end_lsn: Lsn,
    pub committed_scn: Scn,
    pub last_observed_scn: Scn,
}

impl CommitWatermark {
    pub fn new(committed_end_lsn: Lsn, committed_scn: Scn) -> Self {
        Self {
            committed_end_lsn,
            committed_scn,
            last_observed_scn: committed_scn,
        }
    }

    /// Moves the committed point forward; regressions are ignored. Returns
    /// whether anything changed.
    pub fn advance(&mut self, end_lsn: Lsn, scn: Scn) -> bool {
        if end_lsn < self.committed_end_lsn || scn < self.committed_scn {
            return false;
        }
        let changed = end_lsn != self.committed_end_lsn || scn != self.committed_scn;
        self.committed_end_lsn = end_lsn;
        self.committed_scn = scn;
        self.observe(scn);
        changed
    }

    pub fn observe(&mut self, scn: Scn) {
        self.last_observed_scn = self.last_observed_scn.max(scn);
    }

    /// Flashback: places the committed point at `(end_lsn, scn)` even when
    /// that is behind the current one.
    pub(crate) fn rewind(&mut self, end_lsn: Lsn, scn: Scn) {
        self.committed_end_lsn = end_lsn;
        self.committed_scn = scn;
        self.observe(scn);
    }
}
