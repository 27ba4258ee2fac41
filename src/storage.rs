//! Block storage: entry codec, fixed-size block files, restart scanning and
//! the append-only stream laid over them.

pub mod block;
pub mod entry;
pub mod io;
pub mod layout;
pub mod replay;
pub mod stream;

pub use block::BlockStore;
pub use entry::{EntryError, EntryHeader, EntryType, LogEntry, ENTRY_HEADER_SIZE, ENTRY_MAGIC};
pub use layout::{EngineLayout, EnginePaths};
pub use replay::{BlockReplayScanner, BlockScan, BlockTruncation};
pub use stream::{AppendGuard, AppendResult, LogStream, StreamEntries};
