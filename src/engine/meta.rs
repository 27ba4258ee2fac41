use crate::quota::DiskOptions;
use crate::storage::stream::LogStream;
use crate::types::{Lsn, Scn};
use crate::util::error::{LogError, LogResult};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const META_FORMAT_VERSION: u32 = 1;

/// Snapshot persisted to the metadata stream; the newest valid one wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMeta {
    pub version: u32,
    pub block_size: u64,
    pub meta_block_size: u64,
    pub base_lsn: Lsn,
    pub disk_options: DiskOptions,
    #[serde(default)]
    pub flashback: Option<FlashbackRecord>,
    /// Flashback whose truncation started but was not confirmed.
    #[serde(default)]
    pub pending_flashback: Option<FlashbackRecord>,
}

impl EngineMeta {
    pub fn initial(block_size: u64, meta_block_size: u64, disk_options: DiskOptions) -> Self {
        Self {
            version: META_FORMAT_VERSION,
            block_size,
            meta_block_size,
            base_lsn: Lsn::ZERO,
            disk_options,
            flashback: None,
            pending_flashback: None,
        }
    }
}

/// A flashback cut point, recorded before and after the truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashbackRecord {
    pub epoch: u64,
    pub target_scn: Scn,
    pub tail_lsn: Lsn,
}

/// Metadata snapshots stored as entries of their own stream. The entry SCN
/// carries the snapshot sequence.
pub struct MetaStore {
    stream: LogStream,
    current: Mutex<Option<(u64, EngineMeta)>>,
}

impl MetaStore {
    pub fn open(dir: impl Into<PathBuf>, meta_block_size: u64) -> LogResult<Self> {
        let stream = LogStream::open("meta", dir, meta_block_size)?;
        let mut latest = None;
        for item in stream.entries_from(stream.lower_bound()) {
            let (lsn, entry) = item?;
            if entry.is_padding() {
                continue;
            }
            match serde_json::from_slice::<EngineMeta>(&entry.payload) {
                Ok(meta) => latest = Some((entry.scn().value(), meta)),
                Err(err) => warn!(
                    "event=meta_snapshot_skipped lsn={} sequence={} error={}",
                    lsn,
                    entry.scn(),
                    err
                ),
            }
        }
        if let Some((_, meta)) = &latest {
            if meta.version > META_FORMAT_VERSION {
                return Err(LogError::LayoutMismatch(format!(
                    "metadata version {} is newer than supported {}",
                    meta.version, META_FORMAT_VERSION
                )));
            }
        }
        Ok(Self {
            stream,
            current: Mutex::new(latest),
        })
    }

    pub fn load(&self) -> Option<EngineMeta> {
        self.current.lock().as_ref().map(|(_, meta)| meta.clone())
    }

    pub fn sequence(&self) -> u64 {
        self.current.lock().as_ref().map_or(0, |(sequence, _)| *sequence)
    }

    pub fn stream(&self) -> &LogStream {
        &self.stream
    }

    pub fn pending_flashback(&self) -> Option<FlashbackRecord> {
        self.current
            .lock()
            .as_ref()
            .and_then(|(_, meta)| meta.pending_flashback)
    }

    /// Appends `meta` as the newest snapshot and drops metadata blocks older
    /// than the one holding it.
    pub fn persist(&self, meta: &EngineMeta) -> LogResult<()> {
        let mut current = self.current.lock();
        self.append_snapshot(&mut current, meta.clone())
    }

    /// Read-modify-write of the newest snapshot under the store lock. `edit`
    /// returns whether it changed anything; nothing is written otherwise.
    pub fn update<F>(&self, edit: F) -> LogResult<EngineMeta>
    where
        F: FnOnce(&mut EngineMeta) -> bool,
    {
        let mut current = self.current.lock();
        let mut meta = match current.as_ref() {
            Some((_, meta)) => meta.clone(),
            None => return Err(LogError::state_not_match("metadata has no snapshot yet")),
        };
        if !edit(&mut meta) {
            return Ok(meta);
        }
        self.append_snapshot(&mut current, meta.clone())?;
        Ok(meta)
    }

    fn append_snapshot(
        &self,
        current: &mut Option<(u64, EngineMeta)>,
        meta: EngineMeta,
    ) -> LogResult<()> {
        let sequence = current.as_ref().map_or(0, |(sequence, _)| *sequence) + 1;
        let payload = serde_json::to_vec(&meta)?;
        let result = self.stream.append_entry(Scn::new(sequence), &payload)?;
        self.stream.flush()?;
        *current = Some((sequence, meta));

        let block_size = self.stream.block_size();
        let keep_from = result.lsn.block_id(block_size);
        while let Some((min, _)) = self.stream.get_block_id_range() {
            if min >= keep_from {
                break;
            }
            self.stream.delete_block(min)?;
            debug!("event=meta_block_recycle block_id={}", min);
        }
        Ok(())
    }
}
