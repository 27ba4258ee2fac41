#![allow(dead_code)]

use blocklog::{
    DiskOptions, LogEngine, LogEngineConfig, Lsn, QuotaRegistry, Scn, ENTRY_HEADER_SIZE,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const BLOCK_SIZE: u64 = 64 * 1024;
pub const META_BLOCK_SIZE: u64 = 16 * 1024;

/// Engine plus the directory and registry it lives in. The engine is declared
/// first so it drops before its directory.
pub struct TestEngine {
    pub engine: LogEngine,
    pub registry: Arc<QuotaRegistry>,
    pub dir: TempDir,
}

impl TestEngine {
    pub fn new(options: DiskOptions) -> Self {
        init_logging();
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(QuotaRegistry::new());
        let engine = LogEngine::open(config(dir.path(), options), &registry).unwrap();
        Self {
            engine,
            registry,
            dir,
        }
    }

    /// Closes and reopens the engine over the same directory.
    pub fn reopen(self) -> Self {
        let TestEngine {
            engine,
            registry,
            dir,
        } = self;
        let config = engine.config().clone();
        drop(engine);
        let engine = LogEngine::open(config, &registry).unwrap();
        Self {
            engine,
            registry,
            dir,
        }
    }

    pub fn append_all(&self, scns: impl IntoIterator<Item = u64>, entry_size: u64) -> Vec<Lsn> {
        scns.into_iter()
            .map(|scn| {
                self.engine
                    .append(Scn(scn), &payload(scn, entry_size))
                    .unwrap()
                    .lsn
            })
            .collect()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn roomy_options() -> DiskOptions {
    DiskOptions::new(64 * BLOCK_SIZE, 100, 80)
}

pub fn config(root: &Path, options: DiskOptions) -> LogEngineConfig {
    LogEngineConfig::new(root, 1)
        .block_size(BLOCK_SIZE)
        .meta_block_size(META_BLOCK_SIZE)
        .disk_options(options)
}

/// Payload whose encoded entry occupies exactly `entry_size` bytes.
pub fn payload(scn: u64, entry_size: u64) -> Vec<u8> {
    let len = entry_size as usize - ENTRY_HEADER_SIZE;
    (0..len).map(|i| (scn as usize + i) as u8).collect()
}

/// Counts NORMAL entries in the data stream.
pub fn normal_entry_count(engine: &LogEngine) -> usize {
    let stream = engine.data_stream();
    stream
        .entries_from(stream.lower_bound())
        .map(|item| item.unwrap())
        .filter(|(_, entry)| !entry.is_padding())
        .count()
}
