use crate::quota::DiskOptions;
use crate::storage::entry::ENTRY_HEADER_SIZE;
use crate::timeouts::QUOTA_TICK_INTERVAL;
use crate::util::error::{LogError, LogResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * MIB;
pub const DEFAULT_META_BLOCK_SIZE: u64 = MIB;
/// Overrides `fsync_on_append` when set to `1`/`true` or `0`/`false`.
pub const FSYNC_ON_APPEND_ENV: &str = "BLOCKLOG_FSYNC_ON_APPEND";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogEngineConfig {
    pub root: PathBuf,
    pub stream_id: u64,
    pub block_size: u64,
    pub meta_block_size: u64,
    pub disk_options: DiskOptions,
    pub quota_tick_interval_ms: u64,
    pub fsync_on_append: bool,
}

impl Default for LogEngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("blocklog"),
            stream_id: 1,
            block_size: DEFAULT_BLOCK_SIZE,
            meta_block_size: DEFAULT_META_BLOCK_SIZE,
            disk_options: DiskOptions::default(),
            quota_tick_interval_ms: QUOTA_TICK_INTERVAL.as_millis() as u64,
            fsync_on_append: false,
        }
    }
}

impl LogEngineConfig {
    pub fn new(root: impl Into<PathBuf>, stream_id: u64) -> Self {
        Self {
            root: root.into(),
            stream_id,
            ..Self::default()
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn meta_block_size(mut self, meta_block_size: u64) -> Self {
        self.meta_block_size = meta_block_size;
        self
    }

    pub fn disk_options(mut self, disk_options: DiskOptions) -> Self {
        self.disk_options = disk_options;
        self
    }

    pub fn quota_tick_interval(mut self, interval: Duration) -> Self {
        self.quota_tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn fsync_on_append(mut self, enabled: bool) -> Self {
        self.fsync_on_append = enabled;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.quota_tick_interval_ms)
    }

    pub fn validate(&self) -> LogResult<()> {
        let min_block = 4 * ENTRY_HEADER_SIZE as u64;
        for (name, size) in [
            ("block_size", self.block_size),
            ("meta_block_size", self.meta_block_size),
        ] {
            if size < min_block {
                return Err(LogError::InvalidArgument(format!(
                    "{name}={size} below the {min_block} byte minimum"
                )));
            }
        }
        if self.quota_tick_interval_ms == 0 {
            return Err(LogError::InvalidArgument(
                "quota_tick_interval_ms must be non-zero".into(),
            ));
        }
        self.disk_options.validate()
    }

    /// Loads a JSON config; missing fields take their defaults and the
    /// environment override is applied.
    pub fn from_json_file(path: impl AsRef<Path>) -> LogResult<Self> {
        let bytes = fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var(FSYNC_ON_APPEND_ENV) {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" => self.fsync_on_append = true,
                "0" | "false" => self.fsync_on_append = false,
                _ => log::warn!(
                    "event=config_env_ignored key={} value={}",
                    FSYNC_ON_APPEND_ENV,
                    value
                ),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use tempfile::TempDir;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        original: Option<String>,
        _lock: MutexGuard<'static, ()>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key,
                original,
                _lock: lock,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn defaults_validate() {
        let config = LogEngineConfig::default();
        assert_eq!(config.block_size, 64 * MIB);
        assert_eq!(config.tick_interval(), QUOTA_TICK_INTERVAL);
        config.validate().unwrap();
    }

    #[test]
    fn builder_and_validation() {
        let config = LogEngineConfig::new("/tmp/x", 3)
            .block_size(64)
            .meta_block_size(16 * 1024);
        assert!(matches!(
            config.validate(),
            Err(LogError::InvalidArgument(_))
        ));
        let config = config
            .block_size(64 * 1024)
            .disk_options(DiskOptions::new(1 << 20, 50, 70));
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_file_fills_defaults_and_env_override() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("engine.json");
        fs::write(&path, br#"{"root":"/data/log","stream_id":9,"block_size":65536}"#).unwrap();

        let _guard = EnvGuard::set(FSYNC_ON_APPEND_ENV, "true");
        let config = LogEngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.stream_id, 9);
        assert_eq!(config.block_size, 65536);
        assert_eq!(config.meta_block_size, DEFAULT_META_BLOCK_SIZE);
        assert!(config.fsync_on_append);
    }
}
