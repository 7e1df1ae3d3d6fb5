use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::{DatabaseResult, DocumentGateway, QueryOptions};
use crate::logger::Logger;
use crate::model::{Collection, Staff, User};
use crate::offline::config::CacheConfig;
use crate::offline::error::{quota_exceeded, serialization_error, StorageResult};
use crate::offline::pending::{ChangeOperation, DroppedChange, FlushReport, PendingChange};
use crate::offline::storage::KeyValueStore;
use crate::platform::runtime::{sleep, spawn_detached};
use crate::platform::Connectivity;
use crate::util::subscribe::Unsubscribe;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@care-sync/offline"));

/// Schema marker of everything persisted by this module. Bump it whenever a persisted
/// shape changes; a mismatch wipes the cache on startup.
pub const CACHE_VERSION: &str = "1.0.0";

pub const USERS_KEY: &str = "offline_users";
pub const STAFF_KEY: &str = "offline_staff";
pub const PENDING_CHANGES_KEY: &str = "offline_pending_changes";
pub const LAST_SYNC_KEY: &str = "offline_last_sync";
pub const CACHE_VERSION_KEY: &str = "offline_cache_version";
pub const DROPPED_CHANGES_KEY: &str = "offline_dropped_changes";
pub const ID_MAP_KEY: &str = "offline_id_map";

const ALL_KEYS: [&str; 7] = [
    USERS_KEY,
    STAFF_KEY,
    PENDING_CHANGES_KEY,
    LAST_SYNC_KEY,
    CACHE_VERSION_KEY,
    DROPPED_CHANGES_KEY,
    ID_MAP_KEY,
];

const MAX_DROPPED_CHANGES: usize = 100;
const MAX_ID_MAPPINGS: usize = 100;
const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(10);

/// Snapshot of the local cache, recomputed on demand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheState {
    pub is_offline: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub pending_changes: usize,
    /// Bytes currently held by the cache keys.
    pub cache_size: usize,
    pub cache_version: String,
    pub dropped_changes: usize,
}

pub type CacheStateCallback = Arc<dyn Fn(&CacheState) + Send + Sync + 'static>;

enum FlushOutcome {
    Remove,
    Retry(u32),
}

/// Persistent local cache of users and staff plus the pending-change queue.
///
/// Cheap to clone; clones share the same state. All persisted data lives in the injected
/// [`KeyValueStore`] as JSON blobs.
#[derive(Clone)]
pub struct OfflineStorage {
    inner: Arc<OfflineInner>,
}

struct OfflineInner {
    store: Arc<dyn KeyValueStore>,
    gateway: DocumentGateway,
    connectivity: Connectivity,
    config: RwLock<CacheConfig>,
    listeners: Mutex<BTreeMap<u64, CacheStateCallback>>,
    next_listener_id: AtomicU64,
    queue_lock: Mutex<()>,
    flush_lock: async_lock::Mutex<()>,
    auto_sync_cancel: Mutex<Option<Arc<AtomicBool>>>,
    connectivity_subscription: Mutex<Option<Unsubscribe>>,
}

impl fmt::Debug for OfflineStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineStorage")
            .field("config", &self.config())
            .field("connectivity", &self.inner.connectivity)
            .finish()
    }
}

impl OfflineStorage {
    /// Opens the cache, wiping it when the stored schema version differs from
    /// [`CACHE_VERSION`].
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        gateway: DocumentGateway,
        connectivity: Connectivity,
        config: CacheConfig,
    ) -> Self {
        let storage = Self {
            inner: Arc::new(OfflineInner {
                store,
                gateway,
                connectivity,
                config: RwLock::new(config),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(1),
                queue_lock: Mutex::new(()),
                flush_lock: async_lock::Mutex::new(()),
                auto_sync_cancel: Mutex::new(None),
                connectivity_subscription: Mutex::new(None),
            }),
        };
        storage.check_cache_version();

        let weak: Weak<OfflineInner> = Arc::downgrade(&storage.inner);
        let unsubscribe = storage.inner.connectivity.on_change(move |online| {
            if let Some(inner) = weak.upgrade() {
                if online {
                    LOGGER.info("Network online");
                } else {
                    LOGGER.info("Network offline, switching to cached data");
                }
                OfflineStorage { inner }.notify_state_change();
            }
        });
        *storage.inner.connectivity_subscription.lock().unwrap() = Some(unsubscribe);
        storage
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.config.read().unwrap().clone()
    }

    /// Replaces the configuration wholesale and restarts auto-sync when its settings moved.
    pub fn update_config(&self, config: CacheConfig) {
        let previous = {
            let mut guard = self.inner.config.write().unwrap();
            std::mem::replace(&mut *guard, config.clone())
        };

        if !config.enable_auto_sync {
            self.stop_auto_sync();
        } else if !previous.enable_auto_sync || previous.sync_interval != config.sync_interval {
            self.stop_auto_sync();
            self.start_auto_sync();
        }
    }

    pub fn cache_state(&self) -> CacheState {
        CacheState {
            is_offline: !self.inner.connectivity.is_online(),
            last_sync_time: self.last_sync_time(),
            pending_changes: self.pending_changes().len(),
            cache_size: self.cache_size(),
            cache_version: CACHE_VERSION.to_string(),
            dropped_changes: self.dropped_changes().len(),
        }
    }

    pub fn on_cache_state_change<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&CacheState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));

        let weak: Weak<OfflineInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    /// Overwrites the cached user list.
    pub fn cache_users(&self, users: &[User]) -> StorageResult<()> {
        self.write_json(USERS_KEY, users)?;
        self.notify_state_change();
        Ok(())
    }

    /// Last cached user list; empty when absent or unreadable.
    pub fn cached_users(&self) -> Vec<User> {
        self.read_json(USERS_KEY).unwrap_or_default()
    }

    pub fn cache_staff(&self, staff: &[Staff]) -> StorageResult<()> {
        self.write_json(STAFF_KEY, staff)?;
        self.notify_state_change();
        Ok(())
    }

    pub fn cached_staff(&self) -> Vec<Staff> {
        self.read_json(STAFF_KEY).unwrap_or_default()
    }

    /// Appends a change to the end of the queue and persists the whole queue.
    pub fn add_pending_change(
        &self,
        collection: Collection,
        operation: ChangeOperation,
    ) -> StorageResult<PendingChange> {
        let change = PendingChange::new(collection, operation);
        let stored = {
            let _queue = self.inner.queue_lock.lock().unwrap();
            let mut changes = self.pending_changes();
            changes.push(change.clone());
            self.store_json(PENDING_CHANGES_KEY, &changes)
        };
        self.wipe_on_quota(&stored);
        stored?;
        LOGGER.debug(format!(
            "Queued {} on {} ({})",
            change.change_type().as_str(),
            collection,
            change.id
        ));
        self.notify_state_change();
        Ok(change)
    }

    /// The queue in insertion order; empty when absent or unreadable.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.read_json(PENDING_CHANGES_KEY).unwrap_or_default()
    }

    /// Replays the pending queue against the backend.
    ///
    /// Skipped while offline or while another flush is running. Changes are dispatched in
    /// queue order; a failure bumps `retry_count` and the change is removed once it reaches
    /// `max_retry_attempts`. The queue is persisted once after the pass, keeping anything
    /// appended in the meantime.
    pub async fn sync_pending_changes(&self) -> FlushReport {
        if !self.inner.connectivity.is_online() {
            LOGGER.log("Still offline, skipping sync");
            return FlushReport::default();
        }

        let Some(_flush) = self.inner.flush_lock.try_lock() else {
            LOGGER.debug("Pending changes are already being synced");
            return FlushReport::default();
        };

        let changes = self.pending_changes();
        if changes.is_empty() {
            return FlushReport::default();
        }

        LOGGER.info(format!("Syncing {} pending changes", changes.len()));
        let config = self.config();
        let mut report = FlushReport {
            attempted: changes.len(),
            ..Default::default()
        };
        let mut outcomes = HashMap::with_capacity(changes.len());
        let mut dropped = Vec::new();

        for change in changes {
            match self.dispatch(&change).await {
                Ok(()) => {
                    report.succeeded += 1;
                    outcomes.insert(change.id.clone(), FlushOutcome::Remove);
                }
                Err(err) => {
                    LOGGER.error(format!("Failed to sync change {}: {}", change.id, err));
                    let retry_count = change.retry_count + 1;
                    if retry_count >= config.max_retry_attempts {
                        LOGGER.warn(format!(
                            "Removing change {} after {} failed attempts",
                            change.id, retry_count
                        ));
                        report.dropped += 1;
                        outcomes.insert(change.id.clone(), FlushOutcome::Remove);
                        dropped.push(DroppedChange {
                            change: PendingChange {
                                retry_count,
                                ..change
                            },
                            dropped_at: Utc::now(),
                            last_error: err.to_string(),
                        });
                    } else {
                        report.failed += 1;
                        outcomes.insert(change.id.clone(), FlushOutcome::Retry(retry_count));
                    }
                }
            }
        }

        self.apply_outcomes(&outcomes);
        if config.keep_dropped_changes && !dropped.is_empty() {
            self.record_dropped(dropped);
        }
        self.update_last_sync_time();
        report
    }

    /// Re-fetches users and staff from the backend into the cache. No-op while offline.
    pub async fn refresh_cache(&self) -> DatabaseResult<()> {
        if !self.inner.connectivity.is_online() {
            LOGGER.log("Offline, using cached data");
            return Ok(());
        }

        match self.fetch_into_cache().await {
            Ok(()) => {
                self.update_last_sync_time();
                LOGGER.info("Cache refreshed successfully");
                Ok(())
            }
            Err(err) => {
                LOGGER.error(format!("Failed to refresh cache: {err}"));
                Err(err)
            }
        }
    }

    /// Removes every cache key, then stamps the current schema version.
    pub fn clear_cache(&self) {
        for key in ALL_KEYS {
            if let Err(err) = self.inner.store.remove(key) {
                LOGGER.error(format!("Failed to remove {key}: {err}"));
            }
        }
        if let Err(err) = self.inner.store.set(CACHE_VERSION_KEY, CACHE_VERSION) {
            LOGGER.error(format!("Failed to write cache version: {err}"));
        }
        self.notify_state_change();
    }

    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.inner.store.get(LAST_SYNC_KEY).ok().flatten()?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|time| time.with_timezone(&Utc))
            .ok()
    }

    /// Bytes held by the cache keys.
    pub fn cache_size(&self) -> usize {
        ALL_KEYS
            .iter()
            .filter_map(|key| self.inner.store.get(key).ok().flatten())
            .map(|value| value.len())
            .sum()
    }

    /// Changes removed after exhausting their retries, oldest first.
    pub fn dropped_changes(&self) -> Vec<DroppedChange> {
        self.read_json(DROPPED_CHANGES_KEY).unwrap_or_default()
    }

    pub fn clear_dropped_changes(&self) -> StorageResult<()> {
        self.inner.store.remove(DROPPED_CHANGES_KEY)?;
        self.notify_state_change();
        Ok(())
    }

    /// Maps a temporary id handed out while offline to the id the backend assigned once
    /// the queued create went through. Unknown ids are returned unchanged.
    pub fn resolve_id(&self, id: &str) -> String {
        self.id_map()
            .remove(id)
            .unwrap_or_else(|| id.to_string())
    }

    /// Starts the periodic flush loop when auto-sync is enabled and not already running.
    pub fn start_auto_sync(&self) {
        let config = self.config();
        if !config.enable_auto_sync {
            return;
        }

        let cancel_flag = {
            let mut slot = self.inner.auto_sync_cancel.lock().unwrap();
            if slot.is_some() {
                return;
            }
            let flag = Arc::new(AtomicBool::new(false));
            *slot = Some(flag.clone());
            flag
        };

        let interval = config.sync_interval.max(MIN_SYNC_INTERVAL);
        let weak: Weak<OfflineInner> = Arc::downgrade(&self.inner);
        spawn_detached(async move {
            loop {
                sleep(interval).await;
                if cancel_flag.load(Ordering::SeqCst) {
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let storage = OfflineStorage { inner };
                if storage.inner.connectivity.is_online() {
                    let report = storage.sync_pending_changes().await;
                    if !report.is_empty() {
                        log::debug!("auto-sync flushed pending changes: {report:?}");
                    }
                }
            }
        });
    }

    pub fn stop_auto_sync(&self) {
        if let Some(flag) = self.inner.auto_sync_cancel.lock().unwrap().take() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.inner.auto_sync_cancel.lock().unwrap().is_some()
    }

    /// Stops auto-sync and drops every listener. Persisted data is kept.
    pub fn destroy(&self) {
        self.stop_auto_sync();
        self.inner.listeners.lock().unwrap().clear();
        if let Some(unsubscribe) = self.inner.connectivity_subscription.lock().unwrap().take() {
            unsubscribe();
        }
    }

    fn check_cache_version(&self) {
        let stored = self.inner.store.get(CACHE_VERSION_KEY).ok().flatten();
        if stored.as_deref() != Some(CACHE_VERSION) {
            LOGGER.info(format!(
                "Cache version changed ({} -> {}), clearing cache",
                stored.as_deref().unwrap_or("none"),
                CACHE_VERSION
            ));
            self.clear_cache();
        }
    }

    async fn fetch_into_cache(&self) -> DatabaseResult<()> {
        let options = QueryOptions::default();
        let users: Vec<User> = self
            .inner
            .gateway
            .list(Collection::Users.as_str(), &options)
            .await?;
        // write failures are logged and recovered inside the cache writer
        let _ = self.cache_users(&users);

        let staff: Vec<Staff> = self
            .inner
            .gateway
            .list(Collection::Staff.as_str(), &options)
            .await?;
        let _ = self.cache_staff(&staff);
        Ok(())
    }

    async fn dispatch(&self, change: &PendingChange) -> DatabaseResult<()> {
        let collection = change.collection.as_str();
        let gateway = &self.inner.gateway;
        match &change.operation {
            ChangeOperation::Create { data, temp_id } => {
                let id = gateway.create(collection, data).await?;
                if let Some(temp_id) = temp_id {
                    self.remember_id(temp_id, &id);
                }
                Ok(())
            }
            ChangeOperation::Update { entity_id, data } => {
                let id = self.resolve_id(entity_id);
                gateway.update(collection, &id, data).await
            }
            ChangeOperation::Delete { entity_id } => {
                let id = self.resolve_id(entity_id);
                gateway.delete(collection, &id).await
            }
        }
    }

    fn apply_outcomes(&self, outcomes: &HashMap<String, FlushOutcome>) {
        let stored = {
            let _queue = self.inner.queue_lock.lock().unwrap();
            let remaining: Vec<PendingChange> = self
                .pending_changes()
                .into_iter()
                .filter_map(|mut change| match outcomes.get(&change.id) {
                    Some(FlushOutcome::Remove) => None,
                    Some(FlushOutcome::Retry(retry_count)) => {
                        change.retry_count = *retry_count;
                        Some(change)
                    }
                    None => Some(change),
                })
                .collect();
            self.store_json(PENDING_CHANGES_KEY, &remaining)
        };
        // logged by the writer
        self.wipe_on_quota(&stored);
    }

    fn record_dropped(&self, dropped: Vec<DroppedChange>) {
        let mut all = self.dropped_changes();
        all.extend(dropped);
        if all.len() > MAX_DROPPED_CHANGES {
            let excess = all.len() - MAX_DROPPED_CHANGES;
            all.drain(..excess);
        }
        let _ = self.write_json(DROPPED_CHANGES_KEY, &all);
    }

    fn id_map(&self) -> BTreeMap<String, String> {
        self.read_json(ID_MAP_KEY).unwrap_or_default()
    }

    fn remember_id(&self, temp_id: &str, server_id: &str) {
        let mut map = self.id_map();
        map.insert(temp_id.to_string(), server_id.to_string());
        // temp ids sort by creation time, so the first keys are the oldest
        while map.len() > MAX_ID_MAPPINGS {
            map.pop_first();
        }
        let _ = self.write_json(ID_MAP_KEY, &map);
    }

    fn update_last_sync_time(&self) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let _ = self.write_raw(LAST_SYNC_KEY, now);
        self.notify_state_change();
    }

    fn read_json<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let raw = match self.inner.store.get(key) {
            Ok(raw) => raw?,
            Err(err) => {
                LOGGER.error(format!("Failed to read {key}: {err}"));
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                LOGGER.error(format!("Ignoring unreadable {key}: {err}"));
                None
            }
        }
    }

    fn write_json<T>(&self, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized,
    {
        let result = self.store_json(key, value);
        self.wipe_on_quota(&result);
        result
    }

    /// Writes a blob, wiping the cache when the configured size or the store quota would
    /// be exceeded.
    fn write_raw(&self, key: &str, raw: String) -> StorageResult<()> {
        let result = self.store_raw(key, &raw);
        self.wipe_on_quota(&result);
        result
    }

    /// Like [`write_json`](Self::write_json) but leaves the quota wipe to the caller, which
    /// must run it after releasing `queue_lock`.
    fn store_json<T>(&self, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value).map_err(|err| {
            let err = serialization_error(format!("Failed to serialize {key}: {err}"));
            LOGGER.error(err.to_string());
            err
        })?;
        self.store_raw(key, &raw)
    }

    fn store_raw(&self, key: &str, raw: &str) -> StorageResult<()> {
        let result = self
            .ensure_capacity(key, raw.len())
            .and_then(|()| self.inner.store.set(key, raw));
        if let Err(err) = &result {
            LOGGER.error(format!("Failed to write {key}: {err}"));
        }
        result
    }

    fn wipe_on_quota(&self, result: &StorageResult<()>) {
        if matches!(result, Err(err) if err.is_quota_exceeded()) {
            LOGGER.warn("Storage quota exceeded, clearing old cache");
            self.clear_cache();
        }
    }

    fn ensure_capacity(&self, key: &str, incoming: usize) -> StorageResult<()> {
        let limit = self.inner.config.read().unwrap().max_cache_size_bytes;
        let others: usize = ALL_KEYS
            .iter()
            .filter(|other| **other != key)
            .filter_map(|other| self.inner.store.get(other).ok().flatten())
            .map(|value| value.len())
            .sum();
        if others + incoming > limit {
            return Err(quota_exceeded(format!(
                "Cache would grow to {} bytes, limit is {}",
                others + incoming,
                limit
            )));
        }
        Ok(())
    }

    fn notify_state_change(&self) {
        let listeners: Vec<CacheStateCallback> = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        if listeners.is_empty() {
            return;
        }

        let state = self.cache_state();
        for listener in listeners {
            listener(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryBackend;
    use crate::offline::storage::MemoryKeyValueStore;
    use serde_json::json;

    struct Harness {
        backend: InMemoryBackend,
        store: MemoryKeyValueStore,
        connectivity: Connectivity,
        storage: OfflineStorage,
    }

    fn harness_with(store: MemoryKeyValueStore, online: bool, config: CacheConfig) -> Harness {
        let backend = InMemoryBackend::new();
        let connectivity = Connectivity::new(online);
        let storage = OfflineStorage::new(
            Arc::new(store.clone()),
            DocumentGateway::new(Arc::new(backend.clone())),
            connectivity.clone(),
            config,
        );
        Harness {
            backend,
            store,
            connectivity,
            storage,
        }
    }

    fn harness(online: bool) -> Harness {
        harness_with(MemoryKeyValueStore::new(), online, CacheConfig::default())
    }

    fn user(id: &str, name: &str) -> User {
        serde_json::from_value(json!({ "id": id, "name": name })).unwrap()
    }

    #[test]
    fn caching_twice_returns_the_same_list() {
        let h = harness(true);
        let users = vec![user("u1", "山田"), user("u2", "田中")];

        h.storage.cache_users(&users).unwrap();
        assert_eq!(h.storage.cached_users(), users);
        h.storage.cache_users(&users).unwrap();
        assert_eq!(h.storage.cached_users(), users);
    }

    #[test]
    fn corrupt_blobs_read_as_empty() {
        let h = harness(true);
        h.store.set(USERS_KEY, "{not json").unwrap();
        h.store.set(PENDING_CHANGES_KEY, "[1, 2").unwrap();

        assert!(h.storage.cached_users().is_empty());
        assert!(h.storage.pending_changes().is_empty());
    }

    #[test]
    fn queue_grows_by_one_and_keeps_insertion_order() {
        let h = harness(false);
        let mut ids = Vec::new();
        for index in 0..5 {
            let change = h
                .storage
                .add_pending_change(
                    Collection::Users,
                    ChangeOperation::update(format!("u{index}"), json!({ "careLevel": index })),
                )
                .unwrap();
            ids.push(change.id);
            assert_eq!(h.storage.pending_changes().len(), index + 1);
        }

        let queued: Vec<_> = h.storage.pending_changes().into_iter().map(|c| c.id).collect();
        assert_eq!(queued, ids);
    }

    #[test]
    fn version_mismatch_wipes_cache_and_queue() {
        let store = MemoryKeyValueStore::new();
        store.set(CACHE_VERSION_KEY, "0.9.0").unwrap();
        store.set(USERS_KEY, r#"[{"id":"u1","name":"山田"}]"#).unwrap();
        store
            .set(
                PENDING_CHANGES_KEY,
                r#"[{"id":"p1","type":"delete","collection":"users","entityId":"u1","timestamp":"2024-01-01T00:00:00Z","retryCount":0}]"#,
            )
            .unwrap();

        let h = harness_with(store, true, CacheConfig::default());
        assert!(h.storage.pending_changes().is_empty());
        assert!(h.storage.cached_users().is_empty());
        assert_eq!(
            h.store.get(CACHE_VERSION_KEY).unwrap().as_deref(),
            Some(CACHE_VERSION)
        );
    }

    #[test]
    fn matching_version_keeps_data() {
        let store = MemoryKeyValueStore::new();
        store.set(CACHE_VERSION_KEY, CACHE_VERSION).unwrap();
        store.set(USERS_KEY, r#"[{"id":"u1","name":"山田"}]"#).unwrap();

        let h = harness_with(store, true, CacheConfig::default());
        assert_eq!(h.storage.cached_users().len(), 1);
    }

    #[tokio::test]
    async fn flush_replays_changes_and_empties_queue() {
        let h = harness(true);
        h.backend.seed("users", "u1", json!({ "name": "山田", "careLevel": 1 }));
        h.backend.seed("users", "u2", json!({ "name": "田中" }));

        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::create(json!({ "name": "佐藤" })))
            .unwrap();
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::update("u1", json!({ "careLevel": 3 })))
            .unwrap();
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u2"))
            .unwrap();

        let report = h.storage.sync_pending_changes().await;
        assert_eq!(
            report,
            FlushReport {
                attempted: 3,
                succeeded: 3,
                failed: 0,
                dropped: 0
            }
        );
        assert!(h.storage.pending_changes().is_empty());
        assert!(h.storage.last_sync_time().is_some());
        assert_eq!(h.backend.document_count("users"), 2);
        let u1 = h.backend.document("users", "u1").unwrap();
        assert_eq!(u1.data["careLevel"], json!(3));
    }

    #[tokio::test]
    async fn flush_is_skipped_while_offline() {
        let h = harness(false);
        h.storage
            .add_pending_change(Collection::Staff, ChangeOperation::delete("s1"))
            .unwrap();

        let report = h.storage.sync_pending_changes().await;
        assert!(report.is_empty());
        assert_eq!(h.backend.request_count(), 0);
        assert_eq!(h.storage.pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_drops_after_max_attempts() {
        let h = harness(true);
        h.backend.fail_with("unavailable", "backend down");
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::update("u1", json!({ "careLevel": 2 })))
            .unwrap();

        for attempt in 1..=2u32 {
            let report = h.storage.sync_pending_changes().await;
            assert_eq!(report.failed, 1);
            let queue = h.storage.pending_changes();
            assert_eq!(queue.len(), 1);
            assert_eq!(queue[0].retry_count, attempt);
        }

        let report = h.storage.sync_pending_changes().await;
        assert_eq!(report.dropped, 1);
        assert!(h.storage.pending_changes().is_empty());

        let dropped = h.storage.dropped_changes();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].change.retry_count, 3);
        assert!(dropped[0].last_error.contains("サービスが利用できません"));

        h.storage.clear_dropped_changes().unwrap();
        assert!(h.storage.dropped_changes().is_empty());
    }

    #[tokio::test]
    async fn dropped_changes_are_discarded_when_not_kept() {
        let config = CacheConfig {
            max_retry_attempts: 1,
            keep_dropped_changes: false,
            ..Default::default()
        };
        let h = harness_with(MemoryKeyValueStore::new(), true, config);
        h.backend.fail_next("permission-denied", "denied");
        h.storage
            .add_pending_change(Collection::Staff, ChangeOperation::delete("s1"))
            .unwrap();

        let report = h.storage.sync_pending_changes().await;
        assert_eq!(report.dropped, 1);
        assert!(h.storage.pending_changes().is_empty());
        assert!(h.storage.dropped_changes().is_empty());
    }

    #[tokio::test]
    async fn queued_updates_follow_temp_id_to_server_id() {
        let h = harness(true);
        h.storage
            .add_pending_change(
                Collection::Users,
                ChangeOperation::create_with_temp_id(json!({ "name": "佐藤" }), "temp_1700000000000"),
            )
            .unwrap();
        h.storage
            .add_pending_change(
                Collection::Users,
                ChangeOperation::update("temp_1700000000000", json!({ "careLevel": 4 })),
            )
            .unwrap();

        let report = h.storage.sync_pending_changes().await;
        assert_eq!(report.succeeded, 2);

        let server_id = h.storage.resolve_id("temp_1700000000000");
        assert_ne!(server_id, "temp_1700000000000");
        let document = h.backend.document("users", &server_id).unwrap();
        assert_eq!(document.data["name"], json!("佐藤"));
        assert_eq!(document.data["careLevel"], json!(4));
        assert_eq!(h.storage.resolve_id("other"), "other");
    }

    #[tokio::test]
    async fn concurrent_flush_is_skipped() {
        let h = harness(true);
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u1"))
            .unwrap();

        let _running = h.storage.inner.flush_lock.try_lock().unwrap();
        let report = h.storage.sync_pending_changes().await;
        assert!(report.is_empty());
        assert_eq!(h.backend.request_count(), 0);
        assert_eq!(h.storage.pending_changes().len(), 1);
    }

    #[test]
    fn outcomes_keep_changes_appended_during_a_flush() {
        let h = harness(true);
        let first = h
            .storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u1"))
            .unwrap();
        let second = h
            .storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u2"))
            .unwrap();
        // appended after the flush took its snapshot
        let late = h
            .storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u3"))
            .unwrap();

        let mut outcomes = HashMap::new();
        outcomes.insert(first.id.clone(), FlushOutcome::Remove);
        outcomes.insert(second.id.clone(), FlushOutcome::Retry(1));
        h.storage.apply_outcomes(&outcomes);

        let queue = h.storage.pending_changes();
        let ids: Vec<_> = queue.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, [second.id.as_str(), late.id.as_str()]);
        assert_eq!(queue[0].retry_count, 1);
        assert_eq!(queue[1].retry_count, 0);
    }

    #[test]
    fn quota_exceeded_clears_the_cache() {
        let h = harness_with(MemoryKeyValueStore::with_quota(4_000), true, CacheConfig::default());
        h.storage.cache_users(&[user("u1", "山田")]).unwrap();
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u9"))
            .unwrap();

        let crowd: Vec<User> = (0..100).map(|i| user(&format!("u{i}"), "名前")).collect();
        let err = h.storage.cache_users(&crowd).unwrap_err();
        assert!(err.is_quota_exceeded());

        assert!(h.storage.cached_users().is_empty());
        assert!(h.storage.pending_changes().is_empty());
        assert_eq!(
            h.store.get(CACHE_VERSION_KEY).unwrap().as_deref(),
            Some(CACHE_VERSION)
        );
    }

    #[test]
    fn state_listeners_may_queue_changes_after_a_quota_wipe() {
        let config = CacheConfig {
            max_cache_size_bytes: 1_000,
            ..Default::default()
        };
        let h = harness_with(MemoryKeyValueStore::new(), false, config);
        let storage = h.storage.clone();
        let requeued = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&requeued);
        let _unsubscribe = h.storage.on_cache_state_change(move |state| {
            if state.pending_changes == 0 && !flag.swap(true, Ordering::SeqCst) {
                storage
                    .add_pending_change(Collection::Users, ChangeOperation::delete("u1"))
                    .unwrap();
            }
        });

        let err = h
            .storage
            .add_pending_change(
                Collection::Users,
                ChangeOperation::create(json!({ "name": "名前".repeat(400) })),
            )
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(requeued.load(Ordering::SeqCst));

        let queue = h.storage.pending_changes();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].entity_id(), Some("u1"));
    }

    #[test]
    fn id_mappings_keep_only_the_most_recent() {
        let h = harness(true);
        for index in 0..=MAX_ID_MAPPINGS {
            let temp = format!("temp_{}", 1_700_000_000_000_u64 + index as u64);
            h.storage.remember_id(&temp, &format!("server-{index}"));
        }

        assert_eq!(h.storage.id_map().len(), MAX_ID_MAPPINGS);
        assert_eq!(h.storage.resolve_id("temp_1700000000000"), "temp_1700000000000");
        assert_eq!(h.storage.resolve_id("temp_1700000000001"), "server-1");
        assert_eq!(
            h.storage.resolve_id(&format!("temp_{}", 1_700_000_000_000_u64 + MAX_ID_MAPPINGS as u64)),
            format!("server-{MAX_ID_MAPPINGS}")
        );
    }

    #[test]
    fn configured_cache_size_limit_also_triggers_wipe() {
        let config = CacheConfig {
            max_cache_size_bytes: 64,
            ..Default::default()
        };
        let h = harness_with(MemoryKeyValueStore::new(), true, config);
        let crowd: Vec<User> = (0..10).map(|i| user(&format!("u{i}"), "名前")).collect();

        assert!(h.storage.cache_users(&crowd).is_err());
        assert!(h.storage.cached_users().is_empty());
    }

    #[test]
    fn state_listeners_see_queue_and_connectivity_changes() {
        let h = harness(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let unsubscribe = h.storage.on_cache_state_change(move |state| {
            sink.lock()
                .unwrap()
                .push((state.is_offline, state.pending_changes));
        });

        h.connectivity.set_online(false);
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::delete("u1"))
            .unwrap();
        unsubscribe();
        h.connectivity.set_online(true);

        assert_eq!(seen.lock().unwrap().as_slice(), &[(true, 0), (true, 1)]);
    }

    #[test]
    fn cache_state_reports_sizes_and_version() {
        let h = harness(true);
        h.storage.cache_users(&[user("u1", "山田")]).unwrap();

        let state = h.storage.cache_state();
        assert!(!state.is_offline);
        assert_eq!(state.cache_version, CACHE_VERSION);
        assert_eq!(state.cache_size, h.storage.cache_size());
        assert!(state.cache_size > CACHE_VERSION.len());
        assert!(state.last_sync_time.is_none());
    }

    #[tokio::test]
    async fn refresh_cache_pulls_both_collections() {
        let h = harness(true);
        h.backend.seed("users", "u1", json!({ "name": "山田" }));
        h.backend.seed("staff", "s1", json!({ "name": "佐藤", "role": "nurse" }));

        h.storage.refresh_cache().await.unwrap();
        assert_eq!(h.storage.cached_users().len(), 1);
        assert_eq!(h.storage.cached_staff()[0].name, "佐藤");
        assert!(h.storage.last_sync_time().is_some());
    }

    #[tokio::test]
    async fn refresh_cache_failure_keeps_previous_snapshot() {
        let h = harness(true);
        h.storage.cache_users(&[user("u1", "山田")]).unwrap();
        h.backend.fail_next("unavailable", "down");

        assert!(h.storage.refresh_cache().await.is_err());
        assert_eq!(h.storage.cached_users().len(), 1);
    }

    #[tokio::test]
    async fn auto_sync_flushes_in_the_background() {
        let config = CacheConfig {
            sync_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let h = harness_with(MemoryKeyValueStore::new(), true, config);
        h.storage
            .add_pending_change(Collection::Users, ChangeOperation::create(json!({ "name": "佐藤" })))
            .unwrap();

        h.storage.start_auto_sync();
        assert!(h.storage.is_auto_sync_running());
        for _ in 0..100 {
            if h.storage.pending_changes().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(h.storage.pending_changes().is_empty());
        assert_eq!(h.backend.document_count("users"), 1);

        h.storage.destroy();
        assert!(!h.storage.is_auto_sync_running());
    }

    #[test]
    fn disabling_auto_sync_through_config_stops_the_loop() {
        let h = harness(true);
        h.storage.start_auto_sync();
        assert!(h.storage.is_auto_sync_running());

        h.storage.update_config(CacheConfig {
            enable_auto_sync: false,
            ..Default::default()
        });
        assert!(!h.storage.is_auto_sync_running());
    }
}
