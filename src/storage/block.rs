use crate::storage::io::{read_exact_at, retry_io, write_all_at};
use crate::storage::layout::{block_path, discover_blocks, first_gap};
use crate::util::error::{LogError, LogResult};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fixed-size block files of one stream directory.
///
/// Every file is exactly `block_size` bytes. Handles are reference counted so
/// a reader that already holds one keeps reading valid bytes even if the
/// block is deleted underneath it.
#[derive(Debug)]
pub struct BlockStore {
    dir: PathBuf,
    block_size: u64,
    blocks: Mutex<BTreeMap<u64, Arc<File>>>,
}

impl BlockStore {
    pub fn open(dir: impl Into<PathBuf>, block_size: u64) -> LogResult<Self> {
        let dir = dir.into();
        if block_size == 0 {
            return Err(LogError::InvalidArgument("block size must be non-zero".into()));
        }
        fs::create_dir_all(&dir)?;
        let ids = discover_blocks(&dir)?;
        if let Some(missing) = first_gap(&ids) {
            return Err(LogError::LayoutMismatch(format!(
                "block {missing} missing from {}",
                dir.display()
            )));
        }
        let mut blocks = BTreeMap::new();
        for id in ids {
            let path = block_path(&dir, id);
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let len = file.metadata()?.len();
            if len > block_size {
                return Err(LogError::LayoutMismatch(format!(
                    "block {} is {len} bytes, configured block size is {block_size}",
                    path.display()
                )));
            }
            if len < block_size {
                warn!(
                    "event=block_reextend path={} len={} block_size={}",
                    path.display(),
                    len,
                    block_size
                );
                file.set_len(block_size)?;
            }
            blocks.insert(id, Arc::new(file));
        }
        if let (Some(min), Some(max)) = (blocks.keys().next(), blocks.keys().next_back()) {
            info!(
                "event=block_store_open dir={} min_block_id={} max_block_id={}",
                dir.display(),
                min,
                max
            );
        }
        Ok(Self {
            dir,
            block_size,
            blocks: Mutex::new(blocks),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// `(min_block_id, max_block_id)`, or `None` when no block exists.
    pub fn block_id_range(&self) -> Option<(u64, u64)> {
        let blocks = self.blocks.lock();
        let min = *blocks.keys().next()?;
        let max = *blocks.keys().next_back()?;
        Some((min, max))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn contains(&self, block_id: u64) -> bool {
        self.blocks.lock().contains_key(&block_id)
    }

    pub fn file(&self, block_id: u64) -> Option<Arc<File>> {
        self.blocks.lock().get(&block_id).cloned()
    }

    /// Creates `block_id` preallocated to the block size. The id must extend
    /// the current range by exactly one, unless the store is empty.
    pub fn create_block(&self, block_id: u64) -> LogResult<()> {
        let mut blocks = self.blocks.lock();
        if let Some(&max) = blocks.keys().next_back() {
            if block_id != max + 1 {
                return Err(LogError::InvalidArgument(format!(
                    "block {block_id} does not follow max block {max}"
                )));
            }
        }
        let path = block_path(&self.dir, block_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(self.block_size)?;
        debug!("event=block_create path={}", path.display());
        blocks.insert(block_id, Arc::new(file));
        Ok(())
    }

    pub fn write_at(&self, block_id: u64, offset: u64, bytes: &[u8]) -> LogResult<()> {
        self.check_span(block_id, offset, bytes.len())?;
        let file = self.require(block_id)?;
        let path = block_path(&self.dir, block_id);
        retry_io(
            || write_all_at(&file, bytes, offset),
            "block_write",
            &path,
        )?;
        Ok(())
    }

    pub fn read_at(&self, block_id: u64, offset: u64, buf: &mut [u8]) -> LogResult<()> {
        self.check_span(block_id, offset, buf.len())?;
        let file = self.require(block_id)?;
        let path = block_path(&self.dir, block_id);
        retry_io(|| read_exact_at(&file, buf, offset), "block_read", &path)?;
        Ok(())
    }

    pub fn sync(&self, block_id: u64) -> LogResult<()> {
        let file = self.require(block_id)?;
        file.sync_data()?;
        Ok(())
    }

    /// Zeroes everything from `offset` to the block end.
    pub fn truncate(&self, block_id: u64, offset: u64) -> LogResult<()> {
        if offset > self.block_size {
            return Err(LogError::InvalidArgument(format!(
                "truncate offset {offset} beyond block size {}",
                self.block_size
            )));
        }
        let file = self.require(block_id)?;
        file.set_len(offset)?;
        file.set_len(self.block_size)?;
        file.sync_all()?;
        debug!(
            "event=block_truncate block_id={} offset={}",
            block_id, offset
        );
        Ok(())
    }

    /// Removes the oldest or newest block. Interior blocks are never removed
    /// so the id range stays contiguous.
    pub fn delete_block(&self, block_id: u64) -> LogResult<()> {
        let mut blocks = self.blocks.lock();
        let min = blocks.keys().next().copied();
        let max = blocks.keys().next_back().copied();
        if !blocks.contains_key(&block_id) {
            return Err(LogError::EntryNotExist);
        }
        if Some(block_id) != min && Some(block_id) != max {
            return Err(LogError::InvalidArgument(format!(
                "block {block_id} is interior to the range"
            )));
        }
        let path = block_path(&self.dir, block_id);
        fs::remove_file(&path)?;
        blocks.remove(&block_id);
        debug!("event=block_delete path={}", path.display());
        Ok(())
    }

    fn require(&self, block_id: u64) -> LogResult<Arc<File>> {
        self.file(block_id)
            .ok_or_else(|| LogError::InvalidArgument(format!("block {block_id} does not exist")))
    }

    fn check_span(&self, block_id: u64, offset: u64, len: usize) -> LogResult<()> {
        let end = offset.saturating_add(len as u64);
        if end > self.block_size {
            return Err(LogError::InvalidArgument(format!(
                "span {offset}..{end} exceeds block {block_id} of {} bytes",
                self.block_size
            )));
        }
        Ok(())
    }
}
