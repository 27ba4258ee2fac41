use crate::storage::block::BlockStore;
use crate::storage::entry::{EntryError, EntryHeader, LogEntry, ENTRY_HEADER_SIZE};
use crate::types::Scn;
use crate::util::error::LogResult;
use log::warn;

/// Outcome of scanning one block from its start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockScan {
    pub block_id: u64,
    /// Bytes occupied by the valid entry prefix.
    pub valid_bytes: u64,
    pub last_normal_scn: Option<Scn>,
    pub truncation: Option<BlockTruncation>,
}

/// Garbage found behind the valid prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTruncation {
    pub block_id: u64,
    pub offset: u64,
    pub truncated_bytes: u64,
    pub error: EntryError,
}

impl BlockScan {
    /// Zeroes the garbage behind the valid prefix, if there is any.
    pub fn enforce_truncation(&self, store: &BlockStore) -> LogResult<()> {
        if let Some(truncation) = &self.truncation {
            warn!(
                "event=block_tail_truncate block_id={} offset={} dropped_bytes={} error={}",
                truncation.block_id,
                truncation.offset,
                truncation.truncated_bytes,
                truncation.error
            );
            store.truncate(truncation.block_id, truncation.offset)?;
        }
        Ok(())
    }
}

pub struct BlockReplayScanner;

impl BlockReplayScanner {
    pub fn scan(store: &BlockStore, block_id: u64) -> LogResult<BlockScan> {
        let block_size = store.block_size();
        let mut buf = vec![0u8; block_size as usize];
        store.read_at(block_id, 0, &mut buf)?;

        let mut scan = BlockScan {
            block_id,
            valid_bytes: 0,
            last_normal_scn: None,
            truncation: None,
        };
        let mut cursor = 0usize;
        let stop = loop {
            if cursor == buf.len() {
                break None;
            }
            match decode_at(&buf, cursor) {
                Ok(entry) => {
                    if !entry.is_padding() {
                        scan.last_normal_scn = Some(entry.scn());
                    }
                    cursor += entry.entry_size() as usize;
                }
                Err(err) => break Some(err),
            }
        };
        scan.valid_bytes = cursor as u64;
        if let Some(error) = stop {
            let rest = &buf[cursor..];
            if rest.iter().any(|byte| *byte != 0) {
                scan.truncation = Some(BlockTruncation {
                    block_id,
                    offset: cursor as u64,
                    truncated_bytes: rest.len() as u64,
                    error,
                });
            }
        }
        Ok(scan)
    }
}

/// Decodes the entry starting at `cursor` inside a whole-block buffer.
pub fn decode_at(buf: &[u8], cursor: usize) -> Result<LogEntry, EntryError> {
    let header = EntryHeader::decode(&buf[cursor..])?;
    let remaining = (buf.len() - cursor) as u64;
    let entry_size = header.entry_size();
    if entry_size > remaining {
        return Err(EntryError::PayloadOverflow {
            entry_size,
            remaining,
        });
    }
    let payload = if header.is_padding() {
        Vec::new()
    } else {
        let start = cursor + ENTRY_HEADER_SIZE;
        buf[start..start + header.payload_len as usize].to_vec()
    };
    LogEntry::decode(header, payload)
}
