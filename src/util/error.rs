use crate::storage::entry::EntryError;
use crate::types::{Lsn, Scn};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("disk quota exhausted: used={used_bytes} requested={requested_bytes} limit={limit_bytes}")]
    DiskFull {
        used_bytes: u64,
        requested_bytes: u64,
        limit_bytes: u64,
    },
    #[error("lsn {lsn} precedes the oldest retained position {lower}")]
    OutOfLowerBound { lsn: Lsn, lower: Lsn },
    #[error("lsn {lsn} is at or beyond the log tail {tail}")]
    OutOfUpperBound { lsn: Lsn, tail: Lsn },
    #[error("state not match: {0}")]
    StateNotMatch(String),
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error("no entry exists")]
    EntryNotExist,
    #[error("scn regression: previous={previous}, attempted={attempted}")]
    ScnRegression { previous: Scn, attempted: Scn },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("on-disk layout mismatch: {0}")]
    LayoutMismatch(String),
    #[error("corrupt entry at lsn {lsn}: {source}")]
    Corrupt {
        lsn: Lsn,
        #[source]
        source: EntryError,
    },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LogError {
    /// Layout and metadata damage need an operator; everything else can be
    /// retried once the caller has freed disk, advanced its epoch, etc.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LogError::LayoutMismatch(_) | LogError::Serialization(_)
        )
    }

    pub fn state_not_match(reason: impl Into<String>) -> Self {
        LogError::StateNotMatch(reason.into())
    }
}

pub type LogResult<T> = Result<T, LogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_mismatch_is_not_retryable() {
        assert!(!LogError::LayoutMismatch("meta missing".into()).is_retryable());
        assert!(LogError::DiskFull {
            used_bytes: 1,
            requested_bytes: 1,
            limit_bytes: 1
        }
        .is_retryable());
        assert!(LogError::Timeout {
            elapsed: Duration::from_millis(5)
        }
        .is_retryable());
    }

    #[test]
    fn display_names_positions() {
        let err = LogError::OutOfUpperBound {
            lsn: Lsn(10),
            tail: Lsn(4),
        };
        assert_eq!(
            err.to_string(),
            "lsn 10 is at or beyond the log tail 4"
        );
    }
}
