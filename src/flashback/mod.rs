//! Flashback: truncating the data stream back to a target SCN under an
//! epoch fence.
//!
//! A caller fences appends for an epoch, opens a [`TruncationPermit`]
//! (which also takes the stream's writer guard), locates the cut point and
//! commits. Nothing is observable until `commit`; dropping the permit
//! instead leaves the stream untouched. `commit` records its intent in the
//! metadata before removing anything, so an interrupted flashback is either
//! retried by the caller or finished when the engine reopens.

pub mod fence;
pub mod watermark;

pub use fence::{EpochFence, FenceError};
pub use watermark::CommitWatermark;

use crate::engine::{FlashbackRecord, LogEngine};
use crate::storage::stream::{AppendGuard, LogStream};
use crate::types::{Lsn, Scn};
use crate::util::error::{LogError, LogResult};
use log::{debug, info};
use std::time::{Duration, Instant};

/// Cut point found by [`TruncationPermit::locate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationPlan {
    pub target_scn: Scn,
    pub previous_tail: Lsn,
    pub new_tail: Lsn,
}

impl TruncationPlan {
    pub fn is_noop(&self) -> bool {
        self.new_tail == self.previous_tail
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashbackOutcome {
    pub epoch: u64,
    pub target_scn: Scn,
    pub previous_tail: Lsn,
    pub new_tail: Lsn,
    pub truncated_bytes: u64,
    pub watermark: CommitWatermark,
}

pub struct TruncationController<'a> {
    engine: &'a LogEngine,
}

impl<'a> TruncationController<'a> {
    pub fn new(engine: &'a LogEngine) -> Self {
        Self { engine }
    }

    /// Takes the writer guard for a fenced `epoch`.
    pub fn begin(&self, epoch: u64) -> LogResult<TruncationPermit<'a>> {
        self.engine.fence().ensure(epoch)?;
        let guard = self.engine.data_stream().lock_appends();
        self.engine.fence().ensure(epoch)?;
        Ok(TruncationPermit {
            engine: self.engine,
            guard,
            epoch,
            plan: None,
        })
    }

    pub fn flashback(
        &self,
        epoch: u64,
        target_scn: Scn,
        timeout: Duration,
    ) -> LogResult<FlashbackOutcome> {
        let mut permit = self.begin(epoch)?;
        permit.locate(target_scn, timeout)?;
        permit.commit()
    }
}

/// Exclusive right to truncate the data stream for one fenced epoch.
pub struct TruncationPermit<'a> {
    engine: &'a LogEngine,
    guard: AppendGuard<'a>,
    epoch: u64,
    plan: Option<TruncationPlan>,
}

impl<'a> TruncationPermit<'a> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn plan(&self) -> Option<&TruncationPlan> {
        self.plan.as_ref()
    }

    /// Finds the first entry, padding included, whose SCN exceeds
    /// `target_scn`; that entry's start becomes the new tail. Fails with
    /// `Timeout` once `timeout` has elapsed, leaving nothing staged.
    pub fn locate(&mut self, target_scn: Scn, timeout: Duration) -> LogResult<TruncationPlan> {
        self.plan = None;
        let started = Instant::now();
        let deadline = Deadline { started, timeout };
        let stream = self.engine.data_stream();
        let previous_tail = stream.tail();

        let plan = match stream.get_block_id_range() {
            None => TruncationPlan {
                target_scn,
                previous_tail,
                new_tail: previous_tail,
            },
            Some((min, max)) => {
                let anchor = last_block_starting_at_or_below(stream, min, max, target_scn, &deadline)?;
                match anchor {
                    None => TruncationPlan {
                        target_scn,
                        previous_tail,
                        new_tail: stream.lower_bound(),
                    },
                    Some(block_id) => {
                        let start = Lsn::block_start(block_id, stream.block_size());
                        let mut new_tail = previous_tail;
                        for item in stream.entries_from(start) {
                            deadline.check()?;
                            let (lsn, entry) = item?;
                            if entry.scn() > target_scn {
                                new_tail = lsn;
                                break;
                            }
                        }
                        TruncationPlan {
                            target_scn,
                            previous_tail,
                            new_tail,
                        }
                    }
                }
            }
        };
        debug!(
            "event=flashback_locate stream_id={} epoch={} target_scn={} previous_tail={} new_tail={} elapsed={:?}",
            self.engine.stream_id(),
            self.epoch,
            target_scn,
            plan.previous_tail,
            plan.new_tail,
            started.elapsed()
        );
        self.plan = Some(plan);
        Ok(plan)
    }

    /// Applies the staged plan: records the intent, truncates the stream,
    /// moves the commit watermark and marks the flashback complete.
    ///
    /// An error after the intent is recorded leaves the flashback pending and
    /// appends refused; retrying it or reopening the engine completes it.
    pub fn commit(mut self) -> LogResult<FlashbackOutcome> {
        let plan = self
            .plan
            .take()
            .ok_or_else(|| LogError::state_not_match("flashback commit without a located target"))?;
        self.engine.fence().ensure(self.epoch)?;
        let record = FlashbackRecord {
            epoch: self.epoch,
            target_scn: plan.target_scn,
            tail_lsn: plan.new_tail,
        };
        if !plan.is_noop() {
            self.engine.begin_flashback(record)?;
            self.engine
                .data_stream()
                .truncate_to(&self.guard, plan.new_tail)?;
        }
        let watermark = {
            let mut watermark = self.engine.watermark_mut();
            if plan.is_noop() {
                watermark.observe(plan.target_scn);
            } else {
                watermark.rewind(plan.new_tail, plan.target_scn);
            }
            *watermark
        };
        self.engine.finish_flashback(record)?;
        let outcome = FlashbackOutcome {
            epoch: self.epoch,
            target_scn: plan.target_scn,
            previous_tail: plan.previous_tail,
            new_tail: plan.new_tail,
            truncated_bytes: plan.previous_tail - plan.new_tail,
            watermark,
        };
        info!(
            "event=flashback_commit stream_id={} epoch={} target_scn={} previous_tail={} new_tail={} truncated_bytes={}",
            self.engine.stream_id(),
            outcome.epoch,
            outcome.target_scn,
            outcome.previous_tail,
            outcome.new_tail,
            outcome.truncated_bytes
        );
        Ok(outcome)
    }
}

impl Drop for TruncationPermit<'_> {
    fn drop(&mut self) {
        if let Some(plan) = self.plan.take() {
            debug!(
                "event=flashback_abandoned stream_id={} epoch={} target_scn={}",
                self.engine.stream_id(),
                self.epoch,
                plan.target_scn
            );
        }
    }
}

struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    fn check(&self) -> LogResult<()> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.timeout {
            return Err(LogError::Timeout { elapsed });
        }
        Ok(())
    }
}

/// Newest block whose first entry has an SCN at or below `target_scn`.
fn last_block_starting_at_or_below(
    stream: &LogStream,
    min: u64,
    max: u64,
    target_scn: Scn,
    deadline: &Deadline,
) -> LogResult<Option<u64>> {
    let tail = stream.tail();
    let block_size = stream.block_size();
    let (mut lo, mut hi) = (min, max);
    let mut found = None;
    while lo <= hi {
        deadline.check()?;
        let mid = lo + (hi - lo) / 2;
        let start = Lsn::block_start(mid, block_size);
        let first_scn = if start < tail {
            Some(stream.read_entry(start)?.scn())
        } else {
            None
        };
        match first_scn {
            Some(scn) if scn <= target_scn => {
                found = Some(mid);
                lo = mid + 1;
            }
            _ => {
                if mid == min {
                    break;
                }
                hi = mid - 1;
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogEngineConfig;
    use crate::quota::{DiskOptions, QuotaRegistry};
    use std::sync::Arc;
    use tempfile::TempDir;

    const BLOCK: u64 = 64 * 1024;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn engine(tmp: &TempDir) -> LogEngine {
        let config = LogEngineConfig::new(tmp.path(), 1)
            .block_size(BLOCK)
            .meta_block_size(16 * 1024)
            .disk_options(DiskOptions::new(64 * BLOCK, 100, 80));
        LogEngine::open(config, &Arc::new(QuotaRegistry::new())).unwrap()
    }

    #[test]
    fn begin_requires_matching_fence() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        let controller = engine.truncation_controller();
        assert!(matches!(
            controller.begin(1),
            Err(LogError::StateNotMatch(_))
        ));
        engine.fence().fence(2).unwrap();
        assert!(controller.begin(1).is_err());
        assert!(controller.begin(2).is_ok());
    }

    #[test]
    fn dropped_permit_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        for scn in 1..=10 {
            engine.append(Scn(scn), &[scn as u8; 64]).unwrap();
        }
        let tail = engine.tail();
        engine.fence().fence(1).unwrap();
        {
            let mut permit = engine.truncation_controller().begin(1).unwrap();
            let plan = permit.locate(Scn(4), TIMEOUT).unwrap();
            assert!(plan.new_tail < tail);
        }
        assert_eq!(engine.tail(), tail);
        assert!(engine.last_flashback().is_none());
    }

    #[test]
    fn commit_without_locate_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        engine.fence().fence(1).unwrap();
        let permit = engine.truncation_controller().begin(1).unwrap();
        assert!(matches!(permit.commit(), Err(LogError::StateNotMatch(_))));
    }

    #[test]
    fn zero_timeout_reports_timeout_and_keeps_tail() {
        let tmp = TempDir::new().unwrap();
        let engine = engine(&tmp);
        for scn in 1..=10 {
            engine.append(Scn(scn), b"entry").unwrap();
        }
        let tail = engine.tail();
        engine.fence().fence(1).unwrap();
        assert!(matches!(
            engine.flashback(1, Scn(3), Duration::ZERO),
            Err(LogError::Timeout { .. })
        ));
        assert_eq!(engine.tail(), tail);
    }
}
