//! Replay iterator bounded by a caller-owned readable frontier and a
//! replayable-point SCN.

use crate::storage::entry::LogEntry;
use crate::storage::stream::LogStream;
use crate::types::{Lsn, Scn};
use crate::util::error::LogError;
use log::trace;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IterError {
    /// Nothing can be returned yet; retry once an entry with an SCN of at
    /// least `next_min_scn` may be replayed.
    #[error("need more data: next_min_scn={next_min_scn} blocked_by_replay_point={blocked_by_replay_point}")]
    NeedMoreData {
        next_min_scn: Scn,
        blocked_by_replay_point: bool,
    },
    #[error("iterator reached its stop position")]
    IterEnd,
    #[error(transparent)]
    Log(#[from] LogError),
}

impl IterError {
    pub fn is_need_more_data(&self) -> bool {
        matches!(self, IterError::NeedMoreData { .. })
    }
}

type FileEndFn<'a> = Box<dyn Fn() -> Lsn + Send + 'a>;
type ModeEpochFn<'a> = Box<dyn Fn() -> i64 + Send + 'a>;

/// Single-consumer iterator over a [`LogStream`].
///
/// `start_lsn` is the position of the next entry not yet returned. The entry
/// found there is cached across calls until it is returned or a strictly
/// higher mode epoch is observed. Calls never block.
pub struct BoundedLogIterator<'a> {
    stream: &'a LogStream,
    get_file_end_lsn: FileEndFn<'a>,
    get_mode_epoch: ModeEpochFn<'a>,
    start_lsn: Lsn,
    end_lsn: Lsn,
    stop_lsn: Option<Lsn>,
    curr_entry: Option<LogEntry>,
    prev_entry_scn: Scn,
    cache_epoch: i64,
    reported_next_min_scn: Option<Scn>,
}

impl<'a> BoundedLogIterator<'a> {
    pub fn new<F, E>(
        stream: &'a LogStream,
        start_lsn: Lsn,
        get_file_end_lsn: F,
        get_mode_epoch: E,
    ) -> Self
    where
        F: Fn() -> Lsn + Send + 'a,
        E: Fn() -> i64 + Send + 'a,
    {
        Self {
            stream,
            get_file_end_lsn: Box::new(get_file_end_lsn),
            get_mode_epoch: Box::new(get_mode_epoch),
            start_lsn,
            end_lsn: start_lsn,
            stop_lsn: None,
            curr_entry: None,
            prev_entry_scn: Scn::min_scn(),
            cache_epoch: -1,
            reported_next_min_scn: None,
        }
    }

    /// Makes the iterator finite: once `start_lsn` reaches `stop_lsn`, `next`
    /// returns `IterEnd`. `stop_lsn` must be an entry boundary.
    pub fn with_stop_lsn(mut self, stop_lsn: Lsn) -> Self {
        self.stop_lsn = Some(stop_lsn);
        self
    }

    /// Resumes after an entry with SCN `scn` was already consumed elsewhere.
    pub fn with_prev_entry_scn(mut self, scn: Scn) -> Self {
        self.prev_entry_scn = scn;
        self
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    pub fn end_lsn(&self) -> Lsn {
        self.end_lsn
    }

    pub fn prev_entry_scn(&self) -> Scn {
        self.prev_entry_scn
    }

    pub fn cached_epoch(&self) -> i64 {
        self.cache_epoch
    }

    pub fn has_cached_entry(&self) -> bool {
        self.curr_entry.is_some()
    }

    /// Returns the next NORMAL entry with an SCN at or below
    /// `replayable_point_scn` whose bytes lie below the readable frontier.
    pub fn next(&mut self, replayable_point_scn: Scn) -> Result<(Lsn, LogEntry), IterError> {
        let epoch = (self.get_mode_epoch)();
        if epoch >= 0 && epoch > self.cache_epoch {
            if self.curr_entry.take().is_some() {
                trace!(
                    "event=iterator_cache_invalidated start_lsn={} cached_epoch={} epoch={}",
                    self.start_lsn,
                    self.cache_epoch,
                    epoch
                );
            }
            self.cache_epoch = epoch;
        }

        self.end_lsn = (self.get_file_end_lsn)();
        if let Some(stop_lsn) = self.stop_lsn {
            if self.start_lsn >= stop_lsn {
                return Err(IterError::IterEnd);
            }
            self.end_lsn = self.end_lsn.min(stop_lsn);
        }

        if self.curr_entry.is_none() {
            if self.start_lsn >= self.end_lsn {
                return Err(self.need_more_data(self.prev_entry_scn.plus(1), false));
            }
            if !self.fill_cache()? {
                return Err(self.need_more_data(self.prev_entry_scn.plus(1), false));
            }
        }
        let Some((entry_scn, entry_size)) = self
            .curr_entry
            .as_ref()
            .map(|entry| (entry.scn(), entry.entry_size()))
        else {
            return Err(self.need_more_data(self.prev_entry_scn.plus(1), false));
        };

        if entry_scn > replayable_point_scn {
            if self.prev_entry_scn < replayable_point_scn {
                self.prev_entry_scn = replayable_point_scn;
            }
            return Err(self.need_more_data(replayable_point_scn.plus(1), true));
        }
        let entry_end = self.start_lsn + entry_size;
        if entry_end > self.end_lsn {
            return Err(self.need_more_data(self.prev_entry_scn.plus(1), false));
        }

        let lsn = self.start_lsn;
        let Some(entry) = self.curr_entry.take() else {
            return Err(self.need_more_data(self.prev_entry_scn.plus(1), false));
        };
        self.prev_entry_scn = entry.scn();
        self.start_lsn = entry_end;
        Ok((lsn, entry))
    }

    /// Loads the NORMAL entry at `start_lsn`, stepping over fully readable
    /// padding. Returns `false` when no such entry is available yet.
    fn fill_cache(&mut self) -> Result<bool, IterError> {
        loop {
            let tail = self.stream.tail();
            if self.start_lsn >= tail || self.start_lsn >= self.end_lsn {
                return Ok(false);
            }
            let entry = self.stream.read_entry(self.start_lsn)?;
            if entry.is_padding() {
                let padding_end = self.start_lsn + entry.entry_size();
                if padding_end > self.end_lsn {
                    return Ok(false);
                }
                self.start_lsn = padding_end;
                continue;
            }
            self.curr_entry = Some(entry);
            return Ok(true);
        }
    }

    fn need_more_data(&mut self, next_min_scn: Scn, blocked_by_replay_point: bool) -> IterError {
        let next_min_scn = match self.reported_next_min_scn {
            Some(reported) => next_min_scn.max(reported),
            None => next_min_scn,
        };
        self.reported_next_min_scn = Some(next_min_scn);
        IterError::NeedMoreData {
            next_min_scn,
            blocked_by_replay_point,
        }
    }
}
