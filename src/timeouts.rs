//! Shared durations for background work.

use std::time::Duration;

/// Period of the quota/GC ticker.
pub const QUOTA_TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Longest sleep slice of the ticker thread, bounding how long a shutdown
/// request waits before the thread notices it.
pub const TICKER_SHUTDOWN_GRACE: Duration = Duration::from_millis(50);
