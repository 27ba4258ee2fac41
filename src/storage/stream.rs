use crate::quota::AppendGate;
use crate::storage::block::BlockStore;
use crate::storage::entry::{EntryError, EntryHeader, LogEntry, ENTRY_HEADER_SIZE};
use crate::storage::io::read_exact_at;
use crate::storage::replay::BlockReplayScanner;
use crate::types::{Lsn, Scn};
use crate::util::error::{LogError, LogResult};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::path::PathBuf;
use std::sync::Arc;

/// Where an append landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub lsn: Lsn,
    pub end_lsn: Lsn,
    /// Start of the padding written ahead of the entry, if the entry rolled
    /// into a new block.
    pub padding: Option<Lsn>,
}

impl AppendResult {
    /// Blocks this append wrote to, oldest first.
    pub fn written_blocks(&self, block_size: u64) -> Vec<u64> {
        let entry_block = self.lsn.block_id(block_size);
        match self.padding {
            Some(padding) if padding.block_id(block_size) != entry_block => {
                vec![padding.block_id(block_size), entry_block]
            }
            _ => vec![entry_block],
        }
    }
}

/// Proof that the holder is the single writer of a stream.
pub struct AppendGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[derive(Debug, Clone, Copy)]
struct StreamState {
    tail: Lsn,
    last_scn: Option<Scn>,
}

/// Append-only byte stream laid over a [`BlockStore`].
pub struct LogStream {
    name: String,
    store: BlockStore,
    gate: Option<Arc<dyn AppendGate>>,
    fsync_on_append: bool,
    append_lock: Mutex<()>,
    state: Mutex<StreamState>,
    min_scn_cache: Mutex<Option<(u64, Scn)>>,
}

impl LogStream {
    /// Opens the stream in `dir`, recovering the tail from the newest block.
    pub fn open(name: impl Into<String>, dir: impl Into<PathBuf>, block_size: u64) -> LogResult<Self> {
        let name = name.into();
        if block_size <= 2 * ENTRY_HEADER_SIZE as u64 {
            return Err(LogError::InvalidArgument(format!(
                "block size {block_size} too small for stream {name}"
            )));
        }
        let store = BlockStore::open(dir, block_size)?;
        let state = recover_state(&name, &store)?;
        Ok(Self {
            name,
            store,
            gate: None,
            fsync_on_append: false,
            append_lock: Mutex::new(()),
            state: Mutex::new(state),
            min_scn_cache: Mutex::new(None),
        })
    }

    pub fn with_gate(mut self, gate: Arc<dyn AppendGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_fsync_on_append(mut self, enabled: bool) -> Self {
        self.fsync_on_append = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_size(&self) -> u64 {
        self.store.block_size()
    }

    /// First unwritten position.
    pub fn tail(&self) -> Lsn {
        self.state.lock().tail
    }

    /// SCN of the last NORMAL entry retained, if any.
    pub fn last_scn(&self) -> Option<Scn> {
        self.state.lock().last_scn
    }

    /// Oldest readable position: the start of the oldest block, or the tail
    /// when no block exists.
    pub fn lower_bound(&self) -> Lsn {
        let tail = self.tail();
        match self.store.block_id_range() {
            Some((min, _)) => Lsn::block_start(min, self.block_size()).min(tail),
            None => tail,
        }
    }

    pub fn get_block_id_range(&self) -> Option<(u64, u64)> {
        self.store.block_id_range()
    }

    /// Bytes held by block files.
    pub fn used_bytes(&self) -> u64 {
        self.store.block_count() as u64 * self.block_size()
    }

    pub fn lock_appends(&self) -> AppendGuard<'_> {
        AppendGuard {
            _guard: self.append_lock.lock(),
        }
    }

    pub fn append(&self, scn: Scn, payload: &[u8]) -> LogResult<Lsn> {
        Ok(self.append_entry(scn, payload)?.lsn)
    }

    pub fn append_entry(&self, scn: Scn, payload: &[u8]) -> LogResult<AppendResult> {
        let guard = self.lock_appends();
        self.append_with(&guard, scn, payload)
    }

    /// Appends while the caller already holds the writer guard.
    pub fn append_with(
        &self,
        _guard: &AppendGuard<'_>,
        scn: Scn,
        payload: &[u8],
    ) -> LogResult<AppendResult> {
        if !scn.is_valid() {
            return Err(LogError::InvalidArgument(format!(
                "entry scn must be above {}",
                Scn::min_scn()
            )));
        }
        let block_size = self.block_size();
        let entry = LogEntry::normal(scn, payload.to_vec())
            .map_err(|err| LogError::InvalidArgument(err.to_string()))?;
        let size = entry.entry_size();
        if size > block_size - ENTRY_HEADER_SIZE as u64 {
            return Err(LogError::InvalidArgument(format!(
                "entry of {size} bytes exceeds the {block_size} byte block"
            )));
        }
        let StreamState { tail, last_scn } = *self.state.lock();
        if let Some(previous) = last_scn {
            if scn < previous {
                return Err(LogError::ScnRegression {
                    previous,
                    attempted: scn,
                });
            }
        }

        let remaining = block_size - tail.block_offset(block_size);
        let fits = size == remaining || remaining >= size + ENTRY_HEADER_SIZE as u64;
        let entry_lsn = if fits { tail } else { tail + remaining };
        let entry_block = entry_lsn.block_id(block_size);
        self.admit(entry_block, size)?;

        let padding = if fits {
            None
        } else {
            self.ensure_block(tail.block_id(block_size))?;
            let padding = LogEntry::padding(scn, remaining)
                .map_err(|source| LogError::Corrupt { lsn: tail, source })?;
            self.write_at(tail, &padding.encode())?;
            Some(tail)
        };
        self.ensure_block(entry_block)?;
        self.write_at(entry_lsn, &entry.encode())?;
        let end_lsn = entry_lsn + size;
        let result = AppendResult {
            lsn: entry_lsn,
            end_lsn,
            padding,
        };
        if self.fsync_on_append {
            for block_id in result.written_blocks(block_size) {
                self.store.sync(block_id)?;
            }
        }

        {
            let mut state = self.state.lock();
            state.tail = end_lsn;
            state.last_scn = Some(scn);
        }
        if end_lsn.block_offset(block_size) == 0 {
            self.try_preallocate(end_lsn.block_id(block_size));
        }
        if let Some(padding_lsn) = padding {
            debug!(
                "event=block_rollover stream={} padding_lsn={} entry_lsn={} block_id={}",
                self.name, padding_lsn, entry_lsn, entry_block
            );
        }
        Ok(result)
    }

    /// Copies `len` bytes starting at `lsn`, clamped at the tail.
    pub fn read(&self, lsn: Lsn, len: usize) -> LogResult<Vec<u8>> {
        let (lower, tail) = (self.lower_bound(), self.tail());
        if lsn < lower {
            return Err(LogError::OutOfLowerBound { lsn, lower });
        }
        if lsn >= tail {
            return Err(LogError::OutOfUpperBound { lsn, tail });
        }
        let end = (lsn + len as u64).min(tail);
        let block_size = self.block_size();
        let mut bytes = vec![0u8; (end - lsn) as usize];
        let mut pos = lsn;
        let mut filled = 0usize;
        while pos < end {
            let offset = pos.block_offset(block_size);
            let chunk = (block_size - offset).min(end - pos) as usize;
            self.read_block_bytes(pos, &mut bytes[filled..filled + chunk])?;
            filled += chunk;
            pos += chunk as u64;
        }
        Ok(bytes)
    }

    /// Decodes the entry (NORMAL or PADDING) starting at `lsn`.
    pub fn read_entry(&self, lsn: Lsn) -> LogResult<LogEntry> {
        let (lower, tail) = (self.lower_bound(), self.tail());
        if lsn < lower {
            return Err(LogError::OutOfLowerBound { lsn, lower });
        }
        if lsn >= tail {
            return Err(LogError::OutOfUpperBound { lsn, tail });
        }
        let block_size = self.block_size();
        let mut header_bytes = [0u8; ENTRY_HEADER_SIZE];
        self.read_block_bytes(lsn, &mut header_bytes)?;
        let header = EntryHeader::decode(&header_bytes)
            .map_err(|source| LogError::Corrupt { lsn, source })?;
        let block_remaining = block_size - lsn.block_offset(block_size);
        let readable = block_remaining.min(tail - lsn);
        if header.entry_size() > readable {
            return Err(LogError::Corrupt {
                lsn,
                source: EntryError::PayloadOverflow {
                    entry_size: header.entry_size(),
                    remaining: readable,
                },
            });
        }
        let payload = if header.is_padding() {
            Vec::new()
        } else {
            let mut payload = vec![0u8; header.payload_len as usize];
            self.read_block_bytes(lsn + ENTRY_HEADER_SIZE as u64, &mut payload)?;
            payload
        };
        LogEntry::decode(header, payload).map_err(|source| LogError::Corrupt { lsn, source })
    }

    /// Forward scan from `lsn` to the tail, padding included.
    pub fn entries_from(&self, lsn: Lsn) -> StreamEntries<'_> {
        StreamEntries {
            stream: self,
            next: lsn,
            failed: false,
        }
    }

    /// SCN of the first NORMAL entry in the oldest block.
    pub fn get_min_scn(&self) -> LogResult<Scn> {
        let (min_block, _) = self.get_block_id_range().ok_or(LogError::EntryNotExist)?;
        if let Some((block_id, scn)) = *self.min_scn_cache.lock() {
            if block_id == min_block {
                return Ok(scn);
            }
        }
        let start = Lsn::block_start(min_block, self.block_size());
        for item in self.entries_from(start) {
            let (lsn, entry) = item?;
            if entry.is_padding() {
                continue;
            }
            if lsn.block_id(self.block_size()) == min_block {
                *self.min_scn_cache.lock() = Some((min_block, entry.scn()));
            }
            return Ok(entry.scn());
        }
        Err(LogError::EntryNotExist)
    }

    /// Deletes the oldest block. The newest block and the block holding the
    /// tail are never deleted.
    pub fn delete_block(&self, block_id: u64) -> LogResult<()> {
        let (min, max) = self.get_block_id_range().ok_or(LogError::EntryNotExist)?;
        let tail_block = self.tail().block_id(self.block_size());
        if block_id != min {
            return Err(LogError::InvalidArgument(format!(
                "block {block_id} is not the oldest block {min}"
            )));
        }
        if block_id >= max || block_id >= tail_block {
            return Err(LogError::state_not_match(format!(
                "block {block_id} holds the tail of stream {}",
                self.name
            )));
        }
        self.store.delete_block(block_id)?;
        let mut cache = self.min_scn_cache.lock();
        if matches!(*cache, Some((cached, _)) if cached == block_id) {
            *cache = None;
        }
        Ok(())
    }

    /// Moves the tail back to `new_tail` and zeroes every byte behind it.
    ///
    /// Blocks are removed newest first and the in-memory tail is re-read from
    /// disk afterwards, so a failure part way leaves the stream describing
    /// exactly the bytes that survived. Calling again with the same `new_tail`
    /// finishes the job.
    pub fn truncate_to(&self, _guard: &AppendGuard<'_>, new_tail: Lsn) -> LogResult<()> {
        let old_tail = self.tail();
        if new_tail > old_tail {
            return Err(LogError::OutOfUpperBound {
                lsn: new_tail,
                tail: old_tail,
            });
        }
        let lower = self.lower_bound();
        if new_tail < lower {
            return Err(LogError::OutOfLowerBound {
                lsn: new_tail,
                lower,
            });
        }
        let discarded = self.discard_from(new_tail);
        let recovered = recover_state(&self.name, &self.store);
        *self.min_scn_cache.lock() = None;
        match recovered {
            Ok(state) => *self.state.lock() = state,
            Err(err) => {
                warn!(
                    "event=stream_truncate_recover_failed stream={} new_tail={} error={}",
                    self.name, new_tail, err
                );
                discarded?;
                return Err(err);
            }
        }
        if let Err(err) = discarded {
            warn!(
                "event=stream_truncate_incomplete stream={} new_tail={} tail={} error={}",
                self.name,
                new_tail,
                self.tail(),
                err
            );
            return Err(err);
        }
        info!(
            "event=stream_truncate stream={} old_tail={} new_tail={}",
            self.name, old_tail, new_tail
        );
        Ok(())
    }

    fn discard_from(&self, new_tail: Lsn) -> LogResult<()> {
        let block_size = self.block_size();
        let keep_block = new_tail.block_id(block_size);
        while let Some((min, max)) = self.get_block_id_range() {
            if max <= keep_block || max == min {
                break;
            }
            self.store.delete_block(max)?;
        }
        if self.store.contains(keep_block) {
            self.store.truncate(keep_block, new_tail.block_offset(block_size))?;
        }
        Ok(())
    }

    pub fn flush(&self) -> LogResult<()> {
        let tail = self.tail();
        let block_size = self.block_size();
        let mut block_id = tail.block_id(block_size);
        if tail.block_offset(block_size) == 0 && block_id > 0 {
            block_id -= 1;
        }
        if self.store.contains(block_id) {
            self.store.sync(block_id)?;
        }
        Ok(())
    }

    fn admit(&self, entry_block: u64, requested: u64) -> LogResult<()> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        let mut projected = self.used_bytes();
        if !self.store.contains(entry_block) {
            projected += self.block_size();
        }
        gate.check_append(projected, requested)
    }

    fn try_preallocate(&self, block_id: u64) {
        if self.store.contains(block_id) {
            return;
        }
        if let Some(gate) = &self.gate {
            let projected = self.used_bytes() + self.block_size();
            if gate.check_append(projected, 0).is_err() {
                debug!(
                    "event=block_preallocate_deferred stream={} block_id={}",
                    self.name, block_id
                );
                return;
            }
        }
        if let Err(err) = self.store.create_block(block_id) {
            debug!(
                "event=block_preallocate_failed stream={} block_id={} error={}",
                self.name, block_id, err
            );
        }
    }

    fn ensure_block(&self, block_id: u64) -> LogResult<()> {
        if self.store.contains(block_id) {
            return Ok(());
        }
        self.store.create_block(block_id)
    }

    fn write_at(&self, lsn: Lsn, bytes: &[u8]) -> LogResult<()> {
        let block_size = self.block_size();
        self.store
            .write_at(lsn.block_id(block_size), lsn.block_offset(block_size), bytes)
    }

    /// Reads a span contained in a single block. A block recycled between the
    /// bounds check and the read reports the new lower bound.
    fn read_block_bytes(&self, lsn: Lsn, buf: &mut [u8]) -> LogResult<()> {
        let block_size = self.block_size();
        let file = self
            .store
            .file(lsn.block_id(block_size))
            .ok_or_else(|| LogError::OutOfLowerBound {
                lsn,
                lower: self.lower_bound(),
            })?;
        read_exact_at(&file, buf, lsn.block_offset(block_size))?;
        Ok(())
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("name", &self.name)
            .field("dir", &self.store.dir())
            .field("tail", &self.tail())
            .field("blocks", &self.get_block_id_range())
            .finish()
    }
}

/// Iterator returned by [`LogStream::entries_from`]. Stops at the tail or
/// after the first error.
pub struct StreamEntries<'a> {
    stream: &'a LogStream,
    next: Lsn,
    failed: bool,
}

impl Iterator for StreamEntries<'_> {
    type Item = LogResult<(Lsn, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.stream.tail() {
            return None;
        }
        let lsn = self.next;
        match self.stream.read_entry(lsn) {
            Ok(entry) => {
                self.next = lsn + entry.entry_size();
                Some(Ok((lsn, entry)))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn recover_state(name: &str, store: &BlockStore) -> LogResult<StreamState> {
    let Some((min, max)) = store.block_id_range() else {
        return Ok(StreamState {
            tail: Lsn::ZERO,
            last_scn: None,
        });
    };
    let block_size = store.block_size();
    let scan = BlockReplayScanner::scan(store, max)?;
    scan.enforce_truncation(store)?;
    let tail = Lsn::block_start(max, block_size) + scan.valid_bytes;

    let mut last_scn = scan.last_normal_scn;
    let mut block_id = max;
    while last_scn.is_none() && block_id > min {
        block_id -= 1;
        last_scn = BlockReplayScanner::scan(store, block_id)?.last_normal_scn;
    }
    info!(
        "event=stream_recover stream={} min_block_id={} max_block_id={} tail={} dropped_bytes={}",
        name,
        min,
        max,
        tail,
        scan.truncation
            .as_ref()
            .map(|truncation| truncation.truncated_bytes)
            .unwrap_or(0)
    );
    Ok(StreamState { tail, last_scn })
}
