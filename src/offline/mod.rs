#![doc = include_str!("README.md")]

pub mod config;
pub mod error;
pub mod pending;
mod service;
pub mod storage;

#[doc(inline)]
pub use config::CacheConfig;
#[doc(inline)]
pub use error::{StorageError, StorageErrorCode, StorageResult};
#[doc(inline)]
pub use pending::{ChangeOperation, ChangeType, DroppedChange, FlushReport, PendingChange};
pub use service::{
    CacheState, CacheStateCallback, OfflineStorage, CACHE_VERSION, CACHE_VERSION_KEY,
    DROPPED_CHANGES_KEY, ID_MAP_KEY, LAST_SYNC_KEY, PENDING_CHANGES_KEY, STAFF_KEY, USERS_KEY,
};
#[doc(inline)]
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
