//! Engine tying the data stream, the metadata stream, the quota controller
//! and the flashback machinery together.

pub mod meta;

pub use meta::{EngineMeta, FlashbackRecord, MetaStore, META_FORMAT_VERSION};

use crate::config::LogEngineConfig;
use crate::flashback::{CommitWatermark, EpochFence, FlashbackOutcome, TruncationController};
use crate::iter::BoundedLogIterator;
use crate::quota::{
    plan_recycle, DiskOptions, DiskQuotaController, QuotaRegistry, QuotaStatus, QuotaTicker,
    QuotaTickerHandle, RecycleRequest,
};
use crate::storage::entry::LogEntry;
use crate::storage::layout::{EngineLayout, EnginePaths};
use crate::storage::stream::{AppendResult, LogStream};
use crate::types::{Lsn, Scn};
use crate::util::error::{LogError, LogResult};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Block usage of the data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub min_block_id: Option<u64>,
    pub max_block_id: Option<u64>,
}

pub struct LogEngine {
    config: LogEngineConfig,
    paths: EnginePaths,
    data: LogStream,
    meta: MetaStore,
    quota: Arc<DiskQuotaController>,
    registry: Arc<QuotaRegistry>,
    fence: EpochFence,
    watermark: Mutex<CommitWatermark>,
}

impl LogEngine {
    /// Opens (or creates) the engine under `<root>/<stream_id>/` and registers
    /// its quota controller with `registry`.
    pub fn open(config: LogEngineConfig, registry: &Arc<QuotaRegistry>) -> LogResult<Self> {
        config.validate()?;
        let layout = EngineLayout::new(&config.root, config.stream_id);
        layout.ensure()?;
        let paths = layout.paths();

        let meta = MetaStore::open(&paths.meta_dir, config.meta_block_size)?;
        let data = LogStream::open("log", &paths.data_dir, config.block_size)?;
        let stored = match meta.load() {
            Some(stored) => {
                check_layout(&config, &stored, &data)?;
                if stored.disk_options != config.disk_options {
                    info!(
                        "event=engine_disk_options_restored stream_id={} usage_limit_size={}",
                        config.stream_id, stored.disk_options.usage_limit_size
                    );
                }
                stored
            }
            None => {
                if data.get_block_id_range().is_some() {
                    return Err(LogError::LayoutMismatch(format!(
                        "data blocks present in {} without metadata",
                        paths.data_dir.display()
                    )));
                }
                let initial = EngineMeta::initial(
                    config.block_size,
                    config.meta_block_size,
                    config.disk_options,
                );
                meta.persist(&initial)?;
                initial
            }
        };

        let stored = match stored.pending_flashback {
            Some(pending) => resume_flashback(&config, &data, &meta, pending)?,
            None => stored,
        };

        let quota = Arc::new(DiskQuotaController::new(
            config.stream_id,
            stored.disk_options,
        )?);
        registry.register(quota.clone())?;
        let data = data
            .with_gate(quota.clone())
            .with_fsync_on_append(config.fsync_on_append);

        let last_scn = data.last_scn().unwrap_or(Scn::min_scn());
        let mut watermark = CommitWatermark::new(data.tail(), last_scn);
        if let Some(record) = stored.flashback {
            watermark.observe(record.target_scn);
        }
        info!(
            "event=engine_open stream_id={} root={} tail={} base_lsn={} last_scn={}",
            config.stream_id,
            paths.stream_root.display(),
            data.tail(),
            stored.base_lsn,
            last_scn
        );
        Ok(Self {
            config,
            paths,
            data,
            meta,
            quota,
            registry: registry.clone(),
            fence: EpochFence::new(),
            watermark: Mutex::new(watermark),
        })
    }

    pub fn config(&self) -> &LogEngineConfig {
        &self.config
    }

    pub fn stream_id(&self) -> u64 {
        self.config.stream_id
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    pub fn data_stream(&self) -> &LogStream {
        &self.data
    }

    pub fn meta_store(&self) -> &MetaStore {
        &self.meta
    }

    pub fn quota(&self) -> &Arc<DiskQuotaController> {
        &self.quota
    }

    pub fn fence(&self) -> &EpochFence {
        &self.fence
    }

    pub fn append(&self, scn: Scn, payload: &[u8]) -> LogResult<AppendResult> {
        let guard = self.data.lock_appends();
        if let Some(epoch) = self.fence.current() {
            warn!(
                "event=append_refused_fenced stream_id={} epoch={}",
                self.config.stream_id, epoch
            );
            return Err(LogError::state_not_match(format!(
                "appends fenced at epoch {epoch}"
            )));
        }
        if let Some(pending) = self.meta.pending_flashback() {
            warn!(
                "event=append_refused_flashback_pending stream_id={} epoch={} target_scn={}",
                self.config.stream_id, pending.epoch, pending.target_scn
            );
            return Err(LogError::state_not_match(format!(
                "flashback to {} at epoch {} is unfinished",
                pending.target_scn, pending.epoch
            )));
        }
        let result = self.data.append_with(&guard, scn, payload)?;
        self.watermark.lock().observe(scn);
        Ok(result)
    }

    pub fn read(&self, lsn: Lsn, len: usize) -> LogResult<Vec<u8>> {
        self.data.read(lsn, len)
    }

    pub fn read_entry(&self, lsn: Lsn) -> LogResult<LogEntry> {
        self.data.read_entry(lsn)
    }

    pub fn flush(&self) -> LogResult<()> {
        self.data.flush()
    }

    pub fn tail(&self) -> Lsn {
        self.data.tail()
    }

    pub fn get_min_scn(&self) -> LogResult<Scn> {
        self.data.get_min_scn()
    }

    pub fn get_block_id_range(&self) -> Option<(u64, u64)> {
        self.data.get_block_id_range()
    }

    pub fn usage(&self) -> DiskUsage {
        let range = self.data.get_block_id_range();
        DiskUsage {
            used_bytes: self.data.used_bytes(),
            min_block_id: range.map(|(min, _)| min),
            max_block_id: range.map(|(_, max)| max),
        }
    }

    pub fn base_lsn(&self) -> Lsn {
        self.meta.load().map_or(Lsn::ZERO, |meta| meta.base_lsn)
    }

    /// Raises the GC floor. Lower values than the current floor are ignored.
    pub fn advance_base_lsn(&self, lsn: Lsn) -> LogResult<()> {
        let tail = self.data.tail();
        if lsn > tail {
            return Err(LogError::OutOfUpperBound { lsn, tail });
        }
        let stream_id = self.config.stream_id;
        self.meta.update(|meta| {
            if lsn <= meta.base_lsn {
                debug!(
                    "event=base_lsn_unchanged stream_id={} requested={} current={}",
                    stream_id, lsn, meta.base_lsn
                );
                return false;
            }
            meta.base_lsn = lsn;
            true
        })?;
        Ok(())
    }

    /// Applies new quota options and records them for restart.
    pub fn update_disk_options(&self, options: DiskOptions) -> LogResult<()> {
        self.quota.update_options(options)?;
        self.persist_disk_options()
    }

    /// One GC pass. Returns the ids of the deleted blocks.
    pub fn recycle_blocks(&self) -> LogResult<Vec<u64>> {
        let Some((min_block_id, max_block_id)) = self.data.get_block_id_range() else {
            return Ok(Vec::new());
        };
        let request = RecycleRequest {
            min_block_id,
            max_block_id,
            block_size: self.data.block_size(),
            tail: self.data.tail(),
            base_lsn: self.base_lsn(),
            used_bytes: self.data.used_bytes(),
            recycle_trigger_bytes: self
                .quota
                .opts_for_recycling_blocks()
                .recycle_trigger_bytes(),
        };
        let decision = plan_recycle(&request);
        if let Some(reason) = decision.stopped_by {
            debug!(
                "event=recycle_stopped stream_id={} reason={:?}",
                self.config.stream_id, reason
            );
        }
        let mut deleted = Vec::with_capacity(decision.deletable_blocks.len());
        for block_id in decision.deletable_blocks {
            self.data.delete_block(block_id)?;
            deleted.push(block_id);
        }
        if !deleted.is_empty() {
            info!(
                "event=recycle_blocks stream_id={} deleted={:?} used_bytes={}",
                self.config.stream_id,
                deleted,
                self.data.used_bytes()
            );
        }
        Ok(deleted)
    }

    /// GC followed by a quota step.
    pub fn tick(&self) -> LogResult<QuotaStatus> {
        self.recycle_blocks()?;
        let status = self.quota.tick(self.data.used_bytes());
        self.persist_disk_options()?;
        Ok(status)
    }

    /// Spawns the [`LogEngine::tick`] thread, one tick per configured
    /// interval. It stops when the handle is dropped or the engine goes away.
    pub fn start_background(self: &Arc<Self>) -> LogResult<QuotaTickerHandle> {
        let engine = Arc::downgrade(self);
        let name = format!("blocklog-quota-{}", self.config.stream_id);
        let handle = QuotaTicker::spawn(&name, self.config.tick_interval(), move || {
            let Some(engine) = engine.upgrade() else {
                return false;
            };
            if let Err(err) = engine.tick() {
                warn!(
                    "event=quota_tick_failed stream_id={} error={}",
                    engine.config.stream_id, err
                );
            }
            true
        })?;
        Ok(handle)
    }

    pub fn truncation_controller(&self) -> TruncationController<'_> {
        TruncationController::new(self)
    }

    /// Fenced flashback to `target_scn` in one call.
    pub fn flashback(
        &self,
        epoch: u64,
        target_scn: Scn,
        timeout: Duration,
    ) -> LogResult<FlashbackOutcome> {
        self.truncation_controller()
            .flashback(epoch, target_scn, timeout)
    }

    /// Newest completed flashback.
    pub fn last_flashback(&self) -> Option<FlashbackRecord> {
        self.meta.load().and_then(|meta| meta.flashback)
    }

    /// Flashback recorded as started but never confirmed. Appends are refused
    /// until it is retried or the engine is reopened.
    pub fn pending_flashback(&self) -> Option<FlashbackRecord> {
        self.meta.pending_flashback()
    }

    pub fn watermark(&self) -> CommitWatermark {
        *self.watermark.lock()
    }

    /// Reports a new committed end; regressions are ignored.
    pub fn advance_commit(&self, end_lsn: Lsn, scn: Scn) -> LogResult<bool> {
        let tail = self.data.tail();
        if end_lsn > tail {
            return Err(LogError::OutOfUpperBound { lsn: end_lsn, tail });
        }
        Ok(self.watermark.lock().advance(end_lsn, scn))
    }

    /// Iterator over the data stream starting at `start_lsn`.
    pub fn iterator<'a, F, E>(
        &'a self,
        start_lsn: Lsn,
        get_file_end_lsn: F,
        get_mode_epoch: E,
    ) -> BoundedLogIterator<'a>
    where
        F: Fn() -> Lsn + Send + 'a,
        E: Fn() -> i64 + Send + 'a,
    {
        BoundedLogIterator::new(&self.data, start_lsn, get_file_end_lsn, get_mode_epoch)
    }

    pub(crate) fn watermark_mut(&self) -> parking_lot::MutexGuard<'_, CommitWatermark> {
        self.watermark.lock()
    }

    /// Records the cut point ahead of any destructive step and pulls the GC
    /// floor down to it.
    pub(crate) fn begin_flashback(&self, record: FlashbackRecord) -> LogResult<()> {
        self.meta.update(|meta| {
            meta.pending_flashback = Some(record);
            meta.base_lsn = meta.base_lsn.min(record.tail_lsn);
            true
        })?;
        Ok(())
    }

    /// Marks `record` as the completed flashback.
    pub(crate) fn finish_flashback(&self, record: FlashbackRecord) -> LogResult<()> {
        self.meta.update(|meta| complete_flashback(meta, record))?;
        Ok(())
    }

    fn persist_disk_options(&self) -> LogResult<()> {
        self.meta.update(|meta| {
            let target = self.quota.opts_for_recycling_blocks();
            if meta.disk_options == target {
                return false;
            }
            meta.disk_options = target;
            true
        })?;
        Ok(())
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        if let Err(err) = self.data.flush() {
            warn!(
                "event=engine_close_flush_failed stream_id={} error={}",
                self.config.stream_id, err
            );
        }
        self.registry.deregister(self.config.stream_id);
    }
}

/// Moves `record` into the completed slot. Returns whether anything changed.
fn complete_flashback(meta: &mut EngineMeta, record: FlashbackRecord) -> bool {
    if meta.flashback == Some(record)
        && meta.pending_flashback.is_none()
        && meta.base_lsn <= record.tail_lsn
    {
        return false;
    }
    meta.base_lsn = meta.base_lsn.min(record.tail_lsn);
    meta.flashback = Some(record);
    meta.pending_flashback = None;
    true
}

/// Finishes a flashback interrupted after its intent was recorded.
fn resume_flashback(
    config: &LogEngineConfig,
    data: &LogStream,
    meta: &MetaStore,
    pending: FlashbackRecord,
) -> LogResult<EngineMeta> {
    let tail = data.tail();
    if tail > pending.tail_lsn {
        let guard = data.lock_appends();
        data.truncate_to(&guard, pending.tail_lsn)?;
    }
    let stored = meta.update(|meta| complete_flashback(meta, pending))?;
    info!(
        "event=flashback_resumed stream_id={} epoch={} target_scn={} previous_tail={} new_tail={}",
        config.stream_id,
        pending.epoch,
        pending.target_scn,
        tail,
        data.tail()
    );
    Ok(stored)
}

fn check_layout(config: &LogEngineConfig, stored: &EngineMeta, data: &LogStream) -> LogResult<()> {
    if stored.block_size != config.block_size || stored.meta_block_size != config.meta_block_size {
        return Err(LogError::LayoutMismatch(format!(
            "recorded block sizes {}/{} differ from configured {}/{}",
            stored.block_size, stored.meta_block_size, config.block_size, config.meta_block_size
        )));
    }
    if stored.base_lsn > data.tail() {
        return Err(LogError::LayoutMismatch(format!(
            "recorded base_lsn {} beyond data tail {}",
            stored.base_lsn,
            data.tail()
        )));
    }
    Ok(())
}
