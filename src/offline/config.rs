use std::time::Duration;

pub const DEFAULT_MAX_CACHE_SIZE_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Tuning for [`OfflineStorage`](crate::offline::OfflineStorage).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Upper bound on the bytes held by the cache keys. A write past it is handled like a
    /// store quota error.
    pub max_cache_size_bytes: usize,
    /// A pending change is removed once this many flush attempts have failed.
    pub max_retry_attempts: u32,
    pub sync_interval: Duration,
    pub enable_auto_sync: bool,
    /// Record changes dropped after exhausting their retries instead of discarding them.
    pub keep_dropped_changes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE_BYTES,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            enable_auto_sync: true,
            keep_dropped_changes: true,
        }
    }
}
