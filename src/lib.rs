//! Block-segmented append-only log engine.
//!
//! A [`LogEngine`] keeps a data stream of fixed-size block files and a
//! metadata stream, governs growth through a [`DiskQuotaController`],
//! recycles blocks below an externally advanced base LSN, and supports
//! flashback to an earlier SCN under an epoch fence. Consumers replay the
//! data stream through a [`BoundedLogIterator`].

pub mod config;
pub mod engine;
pub mod flashback;
pub mod iter;
pub mod quota;
pub mod storage;
pub mod timeouts;
pub mod types;
pub mod util;

pub use config::LogEngineConfig;
pub use engine::{DiskUsage, EngineMeta, FlashbackRecord, LogEngine, MetaStore};
pub use flashback::{
    CommitWatermark, EpochFence, FenceError, FlashbackOutcome, TruncationController,
    TruncationPermit, TruncationPlan,
};
pub use iter::{BoundedLogIterator, IterError};
pub use quota::{
    AppendGate, DiskOptions, DiskQuotaController, QuotaRegistry, QuotaSnapshot, QuotaStatus,
    QuotaTickerHandle,
};
pub use storage::{
    AppendResult, BlockStore, EntryError, EntryHeader, EntryType, LogEntry, LogStream,
    ENTRY_HEADER_SIZE,
};
pub use types::{Lsn, Scn};
pub use util::{LogError, LogResult};
