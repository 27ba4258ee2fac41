//! Entry wire format.
//!
//! ```text
//! +-------+------+------+-------------+-----+---------------+-----------------+---------+
//! | magic | type | rsvd | payload_len | scn | data_checksum | header_checksum | payload |
//! |  u16  |  u8  |  u8  |     u32     | u64 |      u32      |       u32       |  bytes  |
//! +-------+------+------+-------------+-----+---------------+-----------------+---------+
//! ```
//!
//! Integers are little-endian. `header_checksum` covers the first 20 header
//! bytes. PADDING payloads are filler and are never checksummed.

use crate::types::Scn;
use crc32fast::Hasher as Crc32Hasher;
use thiserror::Error;

pub const ENTRY_MAGIC: u16 = 0x4C42;
pub const ENTRY_HEADER_SIZE: usize = 24;
const HEADER_CHECKSUM_OFFSET: usize = 20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Normal = 0,
    Padding = 1,
}

impl EntryType {
    fn from_byte(byte: u8) -> Result<Self, EntryError> {
        match byte {
            0 => Ok(EntryType::Normal),
            1 => Ok(EntryType::Padding),
            other => Err(EntryError::UnknownEntryType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub entry_type: EntryType,
    pub payload_len: u32,
    pub scn: Scn,
    pub data_checksum: u32,
}

impl EntryHeader {
    pub fn is_padding(&self) -> bool {
        self.entry_type == EntryType::Padding
    }

    /// Header plus payload, i.e. the LSN space the entry occupies.
    pub fn entry_size(&self) -> u64 {
        ENTRY_HEADER_SIZE as u64 + u64::from(self.payload_len)
    }

    pub fn encode(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        buf[0..2].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        buf[2] = self.entry_type as u8;
        buf[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.scn.value().to_le_bytes());
        buf[16..20].copy_from_slice(&self.data_checksum.to_le_bytes());
        let header_crc = crc32(&buf[..HEADER_CHECKSUM_OFFSET]);
        buf[20..24].copy_from_slice(&header_crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EntryError> {
        if bytes.len() < ENTRY_HEADER_SIZE {
            return Err(EntryError::TooShort {
                needed: ENTRY_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != ENTRY_MAGIC {
            return Err(EntryError::BadMagic(magic));
        }
        let stored_crc = read_u32(&bytes[20..24]);
        if stored_crc != crc32(&bytes[..HEADER_CHECKSUM_OFFSET]) {
            return Err(EntryError::HeaderChecksumMismatch);
        }
        Ok(Self {
            entry_type: EntryType::from_byte(bytes[2])?,
            payload_len: read_u32(&bytes[4..8]),
            scn: Scn(read_u64(&bytes[8..16])),
            data_checksum: read_u32(&bytes[16..20]),
        })
    }
}

/// A decoded `(header, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub header: EntryHeader,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn normal(scn: Scn, payload: Vec<u8>) -> Result<Self, EntryError> {
        let payload_len = payload_len(payload.len())?;
        Ok(Self {
            header: EntryHeader {
                entry_type: EntryType::Normal,
                payload_len,
                scn,
                data_checksum: crc32(&payload),
            },
            payload,
        })
    }

    /// Padding that fills exactly `span` bytes (header included).
    pub fn padding(scn: Scn, span: u64) -> Result<Self, EntryError> {
        let payload_len = span
            .checked_sub(ENTRY_HEADER_SIZE as u64)
            .and_then(|len| u32::try_from(len).ok())
            .ok_or(EntryError::PaddingSpan(span))?;
        Ok(Self {
            header: EntryHeader {
                entry_type: EntryType::Padding,
                payload_len,
                scn,
                data_checksum: 0,
            },
            payload: Vec::new(),
        })
    }

    pub fn scn(&self) -> Scn {
        self.header.scn
    }

    pub fn is_padding(&self) -> bool {
        self.header.is_padding()
    }

    pub fn entry_size(&self) -> u64 {
        self.header.entry_size()
    }

    /// Encoded bytes. Padding encodes only its header; the span behind it is
    /// left as filler.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENTRY_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.encode());
        if !self.is_padding() {
            bytes.extend_from_slice(&self.payload);
        }
        bytes
    }

    pub fn decode(header: EntryHeader, payload: Vec<u8>) -> Result<Self, EntryError> {
        if header.is_padding() {
            return Ok(Self {
                header,
                payload: Vec::new(),
            });
        }
        if payload.len() != header.payload_len as usize {
            return Err(EntryError::TooShort {
                needed: header.payload_len as usize,
                available: payload.len(),
            });
        }
        if crc32(&payload) != header.data_checksum {
            return Err(EntryError::DataChecksumMismatch);
        }
        Ok(Self { header, payload })
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum EntryError {
    #[error("entry truncated: needed {needed} bytes, {available} available")]
    TooShort { needed: usize, available: usize },
    #[error("bad entry magic {0:#06x}")]
    BadMagic(u16),
    #[error("header checksum mismatch")]
    HeaderChecksumMismatch,
    #[error("payload checksum mismatch")]
    DataChecksumMismatch,
    #[error("unknown entry type {0}")]
    UnknownEntryType(u8),
    #[error("entry of {entry_size} bytes overflows block remainder {remaining}")]
    PayloadOverflow { entry_size: u64, remaining: u64 },
    #[error("padding span {0} is smaller than an entry header")]
    PaddingSpan(u64),
    #[error("payload of {0} bytes exceeds the u32 length field")]
    PayloadTooLarge(usize),
}

/// Header length field for a payload of `len` bytes.
pub fn payload_len(len: usize) -> Result<u32, EntryError> {
    u32::try_from(len).map_err(|_| EntryError::PayloadTooLarge(len))
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(array)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(array)
}
