use std::time::Duration;

use crate::offline::CacheConfig;
use crate::sync::SyncConfig;

/// Switches for [`DataService`](crate::data::DataService), replaced wholesale on update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataServiceConfig {
    /// Serve reads from the cache and queue writes when the backend is out of reach.
    pub enable_offline_mode: bool,
    pub enable_real_time_sync: bool,
    pub auto_sync_interval: Duration,
    pub max_retry_attempts: u32,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            enable_offline_mode: true,
            enable_real_time_sync: true,
            auto_sync_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
        }
    }
}

impl DataServiceConfig {
    /// Cache settings derived from this config, keeping the fields it does not cover.
    pub(crate) fn cache_config(&self, base: CacheConfig) -> CacheConfig {
        CacheConfig {
            enable_auto_sync: self.enable_offline_mode && self.enable_real_time_sync,
            sync_interval: self.auto_sync_interval,
            max_retry_attempts: self.max_retry_attempts,
            ..base
        }
    }

    pub(crate) fn sync_config(&self, base: SyncConfig) -> SyncConfig {
        SyncConfig {
            enable_realtime: self.enable_real_time_sync,
            retry_attempts: self.max_retry_attempts,
            ..base
        }
    }
}
