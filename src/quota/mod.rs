//! Disk quota state machine and the append gate it drives.

pub mod recycle;
pub mod registry;
pub mod ticker;

pub use recycle::{plan_recycle, RecycleDecision, RecycleRequest, RecycleSkipReason};
pub use registry::QuotaRegistry;
pub use ticker::{QuotaTicker, QuotaTickerHandle};

use crate::util::error::{LogError, LogResult};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const GIB: u64 = 1024 * 1024 * 1024;

/// Asked before every append whether the stream may grow to
/// `projected_used_bytes`.
pub trait AppendGate: Send + Sync {
    fn check_append(&self, projected_used_bytes: u64, requested_bytes: u64) -> LogResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOptions {
    pub usage_limit_size: u64,
    pub utilization_limit_threshold_pct: u8,
    pub utilization_threshold_pct: u8,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            usage_limit_size: 10 * GIB,
            utilization_limit_threshold_pct: 95,
            utilization_threshold_pct: 80,
        }
    }
}

impl DiskOptions {
    pub fn new(
        usage_limit_size: u64,
        utilization_limit_threshold_pct: u8,
        utilization_threshold_pct: u8,
    ) -> Self {
        Self {
            usage_limit_size,
            utilization_limit_threshold_pct,
            utilization_threshold_pct,
        }
    }

    pub fn validate(&self) -> LogResult<()> {
        if self.usage_limit_size == 0 {
            return Err(LogError::InvalidArgument(
                "usage_limit_size must be non-zero".into(),
            ));
        }
        for (name, pct) in [
            (
                "utilization_limit_threshold_pct",
                self.utilization_limit_threshold_pct,
            ),
            ("utilization_threshold_pct", self.utilization_threshold_pct),
        ] {
            if !(1..=100).contains(&pct) {
                return Err(LogError::InvalidArgument(format!(
                    "{name}={pct} outside 1..=100"
                )));
            }
        }
        if self.utilization_threshold_pct > self.utilization_limit_threshold_pct {
            return Err(LogError::InvalidArgument(format!(
                "utilization_threshold_pct {} above utilization_limit_threshold_pct {}",
                self.utilization_threshold_pct, self.utilization_limit_threshold_pct
            )));
        }
        Ok(())
    }

    /// Usage at which appends are refused.
    pub fn stop_write_bytes(&self) -> u64 {
        percent_of(self.usage_limit_size, self.utilization_limit_threshold_pct)
    }

    /// Usage above which GC starts recycling blocks.
    pub fn recycle_trigger_bytes(&self) -> u64 {
        percent_of(self.usage_limit_size, self.utilization_threshold_pct)
    }
}

/// Ordered by `usage_limit_size` only; equal sizes with different
/// percentages are incomparable.
impl PartialOrd for DiskOptions {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.usage_limit_size.cmp(&other.usage_limit_size) {
            Ordering::Equal if self != other => None,
            ordering => Some(ordering),
        }
    }
}

fn percent_of(size: u64, pct: u8) -> u64 {
    (u128::from(size) * u128::from(pct) / 100) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaStatus {
    Normal,
    Shrinking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub stream_id: u64,
    pub status: QuotaStatus,
    pub opts_for_stopping_writes: DiskOptions,
    pub opts_for_recycling_blocks: DiskOptions,
}

#[derive(Debug)]
struct QuotaState {
    status: QuotaStatus,
    stopping: DiskOptions,
    recycling: DiskOptions,
}

/// Two-option quota state machine of one stream.
///
/// Writers are held to `opts_for_stopping_writes`; GC recycles toward
/// `opts_for_recycling_blocks`. A shrink lowers the recycling options at once
/// and lets the stop-write ceiling follow as usage drops, so
/// `recycling.usage_limit_size <= stopping.usage_limit_size` throughout.
#[derive(Debug)]
pub struct DiskQuotaController {
    stream_id: u64,
    state: Mutex<QuotaState>,
}

impl DiskQuotaController {
    pub fn new(stream_id: u64, options: DiskOptions) -> LogResult<Self> {
        options.validate()?;
        Ok(Self {
            stream_id,
            state: Mutex::new(QuotaState {
                status: QuotaStatus::Normal,
                stopping: options,
                recycling: options,
            }),
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn status(&self) -> QuotaStatus {
        self.state.lock().status
    }

    pub fn opts_for_stopping_writes(&self) -> DiskOptions {
        self.state.lock().stopping
    }

    pub fn opts_for_recycling_blocks(&self) -> DiskOptions {
        self.state.lock().recycling
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let state = self.state.lock();
        QuotaSnapshot {
            stream_id: self.stream_id,
            status: state.status,
            opts_for_stopping_writes: state.stopping,
            opts_for_recycling_blocks: state.recycling,
        }
    }

    /// Applies new options. Growing (or keeping) the limit takes effect on
    /// both sides at once. Shrinking applies to the recycling side at once
    /// while the stop-write ceiling stays at the old size, to be lowered by
    /// [`DiskQuotaController::tick`] as usage falls; recycling never exceeds
    /// stopping. Only one shrink may be in flight.
    pub fn update_options(&self, new_options: DiskOptions) -> LogResult<()> {
        new_options.validate()?;
        let mut state = self.state.lock();
        if new_options.usage_limit_size >= state.stopping.usage_limit_size {
            let previous = state.status;
            state.stopping = new_options;
            state.recycling = new_options;
            state.status = QuotaStatus::Normal;
            info!(
                "event=quota_expand stream_id={} usage_limit_size={} previous_status={:?}",
                self.stream_id, new_options.usage_limit_size, previous
            );
            return Ok(());
        }
        if state.status == QuotaStatus::Shrinking {
            warn!(
                "event=quota_shrink_rejected stream_id={} requested={} recycling={} stopping={}",
                self.stream_id,
                new_options.usage_limit_size,
                state.recycling.usage_limit_size,
                state.stopping.usage_limit_size
            );
            return Err(LogError::state_not_match(format!(
                "stream {} is already shrinking toward {} bytes",
                self.stream_id, state.recycling.usage_limit_size
            )));
        }
        state.recycling = new_options;
        state.status = QuotaStatus::Shrinking;
        info!(
            "event=quota_shrink_begin stream_id={} from={} to={}",
            self.stream_id, state.stopping.usage_limit_size, new_options.usage_limit_size
        );
        Ok(())
    }

    /// Periodic step: lowers the stop-write ceiling toward the recycling
    /// options as `used_bytes` allows, finishing the shrink once they meet.
    pub fn tick(&self, used_bytes: u64) -> QuotaStatus {
        let mut state = self.state.lock();
        if state.status == QuotaStatus::Normal {
            return QuotaStatus::Normal;
        }
        if state.recycling == state.stopping {
            state.status = QuotaStatus::Normal;
            info!("event=quota_shrink_done stream_id={}", self.stream_id);
            return QuotaStatus::Normal;
        }
        let pct = u128::from(state.stopping.utilization_limit_threshold_pct);
        let needed = (u128::from(used_bytes) * 100).div_ceil(pct);
        let needed = u64::try_from(needed).unwrap_or(u64::MAX);
        let ceiling = needed.clamp(
            state.recycling.usage_limit_size,
            state.stopping.usage_limit_size,
        );
        if ceiling <= state.recycling.usage_limit_size {
            state.stopping = state.recycling;
            state.status = QuotaStatus::Normal;
            info!(
                "event=quota_shrink_done stream_id={} usage_limit_size={} used_bytes={}",
                self.stream_id, state.stopping.usage_limit_size, used_bytes
            );
        } else if ceiling < state.stopping.usage_limit_size {
            state.stopping.usage_limit_size = ceiling;
            info!(
                "event=quota_shrink_progress stream_id={} stopping={} recycling={} used_bytes={}",
                self.stream_id, ceiling, state.recycling.usage_limit_size, used_bytes
            );
        }
        state.status
    }
}

impl AppendGate for DiskQuotaController {
    fn check_append(&self, projected_used_bytes: u64, requested_bytes: u64) -> LogResult<()> {
        let limit_bytes = self.state.lock().stopping.stop_write_bytes();
        if projected_used_bytes > limit_bytes {
            warn!(
                "event=append_refused_disk_full stream_id={} projected={} limit={}",
                self.stream_id, projected_used_bytes, limit_bytes
            );
            return Err(LogError::DiskFull {
                used_bytes: projected_used_bytes,
                requested_bytes,
                limit_bytes,
            });
        }
        Ok(())
    }
}
