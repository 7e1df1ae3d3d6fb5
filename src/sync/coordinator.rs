use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::database::{
    DatabaseError, DatabaseErrorKind, DocumentGateway, QueryOptions, StaffRepository,
    UserRepository,
};
use crate::logger::Logger;
use crate::model::{Entity, Staff, User};
use crate::offline::{FlushReport, OfflineStorage};
use crate::platform::runtime::spawn_detached;
use crate::platform::Connectivity;
use crate::sync::diff::SnapshotDiffer;
use crate::sync::types::{
    ChangeEvent, ConflictKind, ConflictStrategy, SubscriptionState, SyncConfig, SyncError,
    SyncErrorKind, SyncState,
};
use crate::util::ids::random_id;
use crate::util::subscribe::{noop_unsubscribe, Unsubscribe};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@care-sync/sync"));

const MAX_SYNC_ERRORS: usize = 10;
const USERS_SUBSCRIPTION: &str = "users";
const STAFF_SUBSCRIPTION: &str = "staff";

pub type SyncStateCallback = Arc<dyn Fn(&SyncState) + Send + Sync + 'static>;

struct SubscriptionSlot {
    token: u64,
    handle: Option<Unsubscribe>,
}

/// Sync coordinator: live subscriptions turned into change events, connectivity tracking
/// and conflict resolution.
///
/// Going online triggers one flush of the offline queue followed by a cache refresh; the
/// flush itself is single-flight, so overlapping triggers collapse.
#[derive(Clone)]
pub struct DataSync {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    users: UserRepository,
    staff: StaffRepository,
    offline: OfflineStorage,
    connectivity: Connectivity,
    config: RwLock<SyncConfig>,
    state: Mutex<SyncState>,
    subscriptions: Mutex<HashMap<String, SubscriptionSlot>>,
    next_subscription_token: AtomicU64,
    listeners: Mutex<BTreeMap<u64, SyncStateCallback>>,
    next_listener_id: AtomicU64,
    connectivity_subscription: Mutex<Option<Unsubscribe>>,
}

impl fmt::Debug for DataSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSync")
            .field("config", &self.config())
            .field("state", &self.sync_state())
            .finish()
    }
}

impl DataSync {
    pub fn new(
        gateway: DocumentGateway,
        offline: OfflineStorage,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        let state = SyncState {
            is_online: connectivity.is_online(),
            ..Default::default()
        };
        let sync = Self {
            inner: Arc::new(SyncInner {
                users: UserRepository::new(gateway.clone()),
                staff: StaffRepository::new(gateway),
                offline,
                connectivity,
                config: RwLock::new(config),
                state: Mutex::new(state),
                subscriptions: Mutex::new(HashMap::new()),
                next_subscription_token: AtomicU64::new(1),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(1),
                connectivity_subscription: Mutex::new(None),
            }),
        };

        let weak: Weak<SyncInner> = Arc::downgrade(&sync.inner);
        let unsubscribe = sync.inner.connectivity.on_change(move |online| {
            if let Some(inner) = weak.upgrade() {
                let sync = DataSync { inner };
                sync.set_online(online);
                if online {
                    spawn_detached(async move {
                        sync.force_sync().await;
                    });
                }
            }
        });
        *sync.inner.connectivity_subscription.lock().unwrap() = Some(unsubscribe);
        sync
    }

    pub fn config(&self) -> SyncConfig {
        self.inner.config.read().unwrap().clone()
    }

    pub fn update_config(&self, config: SyncConfig) {
        *self.inner.config.write().unwrap() = config;
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn on_sync_state_change<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));

        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    /// Streams change events for the `users` collection. Returns a no-op handle when
    /// realtime sync is disabled.
    pub fn sync_users<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Vec<ChangeEvent<User>>) + Send + Sync + 'static,
    {
        if !self.config().enable_realtime {
            return noop_unsubscribe();
        }
        let handle = self
            .inner
            .users
            .subscribe_to_users(&QueryOptions::default(), self.diffing(callback));
        self.register(USERS_SUBSCRIPTION, handle)
    }

    pub fn sync_staff<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Vec<ChangeEvent<Staff>>) + Send + Sync + 'static,
    {
        if !self.config().enable_realtime {
            return noop_unsubscribe();
        }
        let handle = self
            .inner
            .staff
            .subscribe_to_staff(&QueryOptions::default(), self.diffing(callback));
        self.register(STAFF_SUBSCRIPTION, handle)
    }

    pub fn sync_user<F>(&self, id: &str, callback: F) -> Unsubscribe
    where
        F: Fn(Option<User>) + Send + Sync + 'static,
    {
        if !self.config().enable_realtime {
            return noop_unsubscribe();
        }
        let handle = self
            .inner
            .users
            .subscribe_to_user(id, self.stamping(callback));
        self.register(&format!("user-{id}"), handle)
    }

    pub fn sync_staff_member<F>(&self, id: &str, callback: F) -> Unsubscribe
    where
        F: Fn(Option<Staff>) + Send + Sync + 'static,
    {
        if !self.config().enable_realtime {
            return noop_unsubscribe();
        }
        let handle = self
            .inner
            .staff
            .subscribe_to_staff_member(id, self.stamping(callback));
        self.register(&format!("staff-{id}"), handle)
    }

    /// Lifecycle of a named subscription (`users`, `staff`, `user-<id>`, `staff-<id>`).
    pub fn subscription_state(&self, subscription_id: &str) -> SubscriptionState {
        match self.inner.subscriptions.lock().unwrap().get(subscription_id) {
            None => SubscriptionState::Idle,
            Some(slot) if slot.handle.is_some() => SubscriptionState::Subscribed,
            Some(_) => SubscriptionState::Unsubscribed,
        }
    }

    /// Picks the winner of a conflict according to the configured strategy.
    ///
    /// `Manual` keeps neither side and records one `Conflict` sync error carrying both.
    pub fn resolve_conflict<T>(&self, local: T, server: T, kind: ConflictKind) -> Option<T>
    where
        T: Serialize,
    {
        match self.config().conflict_resolution {
            ConflictStrategy::ServerWins => Some(server),
            ConflictStrategy::ClientWins => Some(local),
            ConflictStrategy::Manual => {
                let data = json!({
                    "local": serde_json::to_value(&local).unwrap_or(Value::Null),
                    "server": serde_json::to_value(&server).unwrap_or(Value::Null),
                });
                self.add_sync_error(
                    SyncErrorKind::Conflict,
                    format!("データの競合が発生しました: {}", kind.as_str()),
                    Some(data),
                );
                None
            }
        }
    }

    /// Flushes the offline queue and refreshes the cache. No-op while offline.
    pub async fn force_sync(&self) -> FlushReport {
        if !self.inner.connectivity.is_online() {
            LOGGER.log("Offline, skipping sync");
            return FlushReport::default();
        }

        let _in_flight = InFlightSync::begin(self);

        let report = self.inner.offline.sync_pending_changes().await;
        if report.dropped > 0 {
            self.add_sync_error(
                SyncErrorKind::Network,
                format!("{} 件の変更を同期できませんでした", report.dropped),
                None,
            );
        }
        if let Err(err) = self.inner.offline.refresh_cache().await {
            self.add_sync_error(
                error_kind(&err),
                format!("同期エラー: {}", err.message()),
                None,
            );
        }

        self.update_state(|state| state.last_sync_time = Some(Utc::now()));
        report
    }

    /// Records a connectivity transition; going online runs [`force_sync`](Self::force_sync).
    pub async fn handle_connectivity_change(&self, online: bool) -> FlushReport {
        self.set_online(online);
        if online {
            self.force_sync().await
        } else {
            FlushReport::default()
        }
    }

    /// Unsubscribes every live subscription.
    pub fn stop_all_sync(&self) {
        let handles: Vec<Unsubscribe> = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .values_mut()
            .filter_map(|slot| slot.handle.take())
            .collect();
        for handle in handles {
            handle();
        }
    }

    pub fn clear_sync_errors(&self) {
        self.update_state(|state| state.sync_errors.clear());
    }

    pub fn destroy(&self) {
        self.stop_all_sync();
        self.inner.listeners.lock().unwrap().clear();
        if let Some(unsubscribe) = self.inner.connectivity_subscription.lock().unwrap().take() {
            unsubscribe();
        }
    }

    fn diffing<T, F>(&self, callback: F) -> impl Fn(Vec<T>) + Send + Sync + 'static
    where
        T: Entity + Serialize + 'static,
        F: Fn(Vec<ChangeEvent<T>>) + Send + Sync + 'static,
    {
        let differ = Mutex::new(SnapshotDiffer::<T>::new());
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        move |records: Vec<T>| {
            let changes = differ.lock().unwrap().diff(records);
            if changes.is_empty() {
                return;
            }
            callback(changes);
            if let Some(inner) = weak.upgrade() {
                DataSync { inner }.touch_last_sync();
            }
        }
    }

    fn stamping<T, F>(&self, callback: F) -> impl Fn(Option<T>) + Send + Sync + 'static
    where
        T: 'static,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        move |record: Option<T>| {
            callback(record);
            if let Some(inner) = weak.upgrade() {
                DataSync { inner }.touch_last_sync();
            }
        }
    }

    /// Stores `handle` under `subscription_id`, unsubscribing any handle it replaces.
    ///
    /// The returned handle only tears down this registration, never a later replacement.
    fn register(&self, subscription_id: &str, handle: Unsubscribe) -> Unsubscribe {
        let token = self
            .inner
            .next_subscription_token
            .fetch_add(1, Ordering::SeqCst);
        let replaced = self.inner.subscriptions.lock().unwrap().insert(
            subscription_id.to_string(),
            SubscriptionSlot {
                token,
                handle: Some(handle),
            },
        );
        if let Some(previous) = replaced.and_then(|slot| slot.handle) {
            LOGGER.debug(format!("Replacing subscription {subscription_id}"));
            previous();
        }

        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let subscription_id = subscription_id.to_string();
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let handle = {
                let mut subscriptions = inner.subscriptions.lock().unwrap();
                match subscriptions.get_mut(&subscription_id) {
                    Some(slot) if slot.token == token => slot.handle.take(),
                    _ => None,
                }
            };
            if let Some(handle) = handle {
                handle();
            }
        })
    }

    fn set_online(&self, online: bool) {
        self.update_state(|state| state.is_online = online);
    }

    fn touch_last_sync(&self) {
        self.update_state(|state| state.last_sync_time = Some(Utc::now()));
    }

    fn add_sync_error(&self, kind: SyncErrorKind, message: String, data: Option<Value>) {
        LOGGER.warn(format!("Sync error ({kind:?}): {message}"));
        let error = SyncError {
            id: random_id(),
            kind,
            message,
            timestamp: Utc::now(),
            data,
        };
        self.update_state(|state| {
            state.sync_errors.push(error);
            if state.sync_errors.len() > MAX_SYNC_ERRORS {
                let excess = state.sync_errors.len() - MAX_SYNC_ERRORS;
                state.sync_errors.drain(..excess);
            }
        });
    }

    fn update_state<F>(&self, update: F)
    where
        F: FnOnce(&mut SyncState),
    {
        let snapshot = {
            let mut state = self.inner.state.lock().unwrap();
            update(&mut state);
            state.clone()
        };

        let listeners: Vec<SyncStateCallback> = self
            .inner
            .listeners
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

fn error_kind(error: &DatabaseError) -> SyncErrorKind {
    match error.kind() {
        DatabaseErrorKind::Permission => SyncErrorKind::Permission,
        _ => SyncErrorKind::Network,
    }
}

/// Counts one sync pass in `SyncState::pending_changes` until dropped, including when the
/// `force_sync` future is cancelled mid-flight.
struct InFlightSync {
    sync: DataSync,
}

impl InFlightSync {
    fn begin(sync: &DataSync) -> Self {
        sync.update_state(|state| state.pending_changes += 1);
        Self { sync: sync.clone() }
    }
}

impl Drop for InFlightSync {
    fn drop(&mut self) {
        self.sync
            .update_state(|state| state.pending_changes = state.pending_changes.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{
        BackendResult, Document, DocumentBackend, DocumentCallback, DocumentData, InMemoryBackend,
        SnapshotCallback, WriteOperation,
    };
    use crate::model::Collection;
    use crate::offline::{CacheConfig, ChangeOperation, MemoryKeyValueStore};
    use crate::platform::runtime::sleep;
    use crate::sync::types::ChangeKind;
    use std::time::Duration;

    struct Harness {
        backend: InMemoryBackend,
        connectivity: Connectivity,
        offline: OfflineStorage,
        sync: DataSync,
    }

    fn harness_with(online: bool, config: SyncConfig) -> Harness {
        let backend = InMemoryBackend::new();
        let gateway = DocumentGateway::new(Arc::new(backend.clone()));
        let connectivity = Connectivity::new(online);
        let offline = OfflineStorage::new(
            Arc::new(MemoryKeyValueStore::new()),
            gateway.clone(),
            connectivity.clone(),
            CacheConfig::default(),
        );
        let sync = DataSync::new(gateway, offline.clone(), connectivity.clone(), config);
        Harness {
            backend,
            connectivity,
            offline,
            sync,
        }
    }

    fn harness(online: bool) -> Harness {
        harness_with(online, SyncConfig::default())
    }

    fn with_strategy(strategy: ConflictStrategy) -> Harness {
        harness_with(
            true,
            SyncConfig {
                conflict_resolution: strategy,
                ..Default::default()
            },
        )
    }

    #[test]
    fn conflict_strategies_pick_their_side() {
        let server_wins = with_strategy(ConflictStrategy::ServerWins);
        assert_eq!(
            server_wins.sync.resolve_conflict("local", "server", ConflictKind::Update),
            Some("server")
        );

        let client_wins = with_strategy(ConflictStrategy::ClientWins);
        assert_eq!(
            client_wins.sync.resolve_conflict("local", "server", ConflictKind::Update),
            Some("local")
        );
        assert!(client_wins.sync.sync_state().sync_errors.is_empty());
    }

    #[test]
    fn manual_conflicts_record_exactly_one_error() {
        let h = with_strategy(ConflictStrategy::Manual);
        let resolved = h
            .sync
            .resolve_conflict(json!({ "v": 1 }), json!({ "v": 2 }), ConflictKind::Delete);
        assert!(resolved.is_none());

        let errors = h.sync.sync_state().sync_errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, SyncErrorKind::Conflict);
        assert_eq!(errors[0].message, "データの競合が発生しました: delete");
        assert_eq!(errors[0].data, Some(json!({ "local": { "v": 1 }, "server": { "v": 2 } })));

        h.sync.clear_sync_errors();
        assert!(h.sync.sync_state().sync_errors.is_empty());
    }

    #[test]
    fn sync_errors_keep_the_ten_most_recent() {
        let h = with_strategy(ConflictStrategy::Manual);
        for index in 0..15 {
            h.sync.resolve_conflict(index, index + 100, ConflictKind::Update);
        }

        let errors = h.sync.sync_state().sync_errors;
        assert_eq!(errors.len(), MAX_SYNC_ERRORS);
        assert_eq!(errors[0].data, Some(json!({ "local": 5, "server": 105 })));
    }

    /// Delegates to an in-memory backend but never answers queries.
    struct StalledQueries(InMemoryBackend);

    #[async_trait::async_trait]
    impl DocumentBackend for StalledQueries {
        async fn add(&self, collection: &str, data: DocumentData) -> BackendResult<String> {
            self.0.add(collection, data).await
        }
        async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>> {
            self.0.get(collection, id).await
        }
        async fn update(&self, collection: &str, id: &str, data: DocumentData) -> BackendResult<()> {
            self.0.update(collection, id, data).await
        }
        async fn delete(&self, collection: &str, id: &str) -> BackendResult<()> {
            self.0.delete(collection, id).await
        }
        async fn query(&self, _collection: &str, _query: &QueryOptions) -> BackendResult<Vec<Document>> {
            futures::future::pending().await
        }
        async fn commit(&self, writes: Vec<WriteOperation>) -> BackendResult<()> {
            self.0.commit(writes).await
        }
        fn listen_collection(
            &self,
            collection: &str,
            query: &QueryOptions,
            callback: SnapshotCallback,
        ) -> BackendResult<Unsubscribe> {
            self.0.listen_collection(collection, query, callback)
        }
        fn listen_document(
            &self,
            collection: &str,
            id: &str,
            callback: DocumentCallback,
        ) -> BackendResult<Unsubscribe> {
            self.0.listen_document(collection, id, callback)
        }
    }

    #[tokio::test]
    async fn cancelled_force_sync_releases_its_pending_count() {
        let gateway = DocumentGateway::new(Arc::new(StalledQueries(InMemoryBackend::new())));
        let connectivity = Connectivity::new(true);
        let offline = OfflineStorage::new(
            Arc::new(MemoryKeyValueStore::new()),
            gateway.clone(),
            connectivity.clone(),
            CacheConfig {
                enable_auto_sync: false,
                ..Default::default()
            },
        );
        let sync = DataSync::new(gateway, offline, connectivity, SyncConfig::default());

        let outcome = tokio::time::timeout(Duration::from_millis(20), sync.force_sync()).await;
        assert!(outcome.is_err());
        assert_eq!(sync.sync_state().pending_changes, 0);
        assert!(sync.sync_state().last_sync_time.is_none());
    }

    #[test]
    fn undecodable_record_is_not_reported_as_removed() {
        let h = harness(true);
        h.backend.seed("users", "u1", json!({ "name": "山田" }));
        h.backend.seed("users", "u2", json!({ "name": "田中" }));
        let seen: Arc<Mutex<Vec<(ChangeKind, String)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let unsubscribe = h.sync.sync_users(move |changes| {
            sink.lock()
                .unwrap()
                .extend(changes.into_iter().map(|c| (c.kind, c.id)));
        });

        h.backend.seed(
            "users",
            "u1",
            json!({ "name": "山田", "birthDate": "1940-01-01T00:00:00Z" }),
        );
        assert_eq!(h.backend.document_count("users"), 2);
        h.backend.seed("users", "u1", json!({ "name": "山田", "birthDate": "1940-01-01" }));
        unsubscribe();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                (ChangeKind::Added, "u1".to_string()),
                (ChangeKind::Added, "u2".to_string()),
                (ChangeKind::Modified, "u1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn sync_users_emits_change_events() {
        let h = harness(true);
        h.backend.seed("users", "u1", json!({ "name": "山田" }));
        let seen: Arc<Mutex<Vec<Vec<(ChangeKind, String)>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let unsubscribe = h.sync.sync_users(move |changes| {
            sink.lock()
                .unwrap()
                .push(changes.into_iter().map(|c| (c.kind, c.id)).collect());
        });

        h.backend.seed("users", "u1", json!({ "name": "山田太郎" }));
        h.backend.seed("users", "u2", json!({ "name": "田中" }));
        h.backend.delete("users", "u1").await.unwrap();
        unsubscribe();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[
                vec![(ChangeKind::Added, "u1".to_string())],
                vec![(ChangeKind::Modified, "u1".to_string())],
                vec![(ChangeKind::Added, "u2".to_string())],
                vec![(ChangeKind::Removed, "u1".to_string())],
            ]
        );
        assert!(h.sync.sync_state().last_sync_time.is_some());
    }

    #[test]
    fn stream_errors_do_not_look_like_removals() {
        let h = harness(true);
        h.backend.seed("staff", "s1", json!({ "name": "佐藤" }));
        let kinds: Arc<Mutex<Vec<ChangeKind>>> = Arc::default();
        let sink = Arc::clone(&kinds);
        let _unsubscribe = h.sync.sync_staff(move |changes| {
            sink.lock()
                .unwrap()
                .extend(changes.into_iter().map(|c| c.kind));
        });

        h.backend
            .emit_error("staff", crate::database::BackendError::new("unavailable", "reset"));
        h.backend.seed("staff", "s2", json!({ "name": "鈴木" }));

        assert_eq!(
            kinds.lock().unwrap().as_slice(),
            &[ChangeKind::Added, ChangeKind::Added]
        );
    }

    #[test]
    fn subscription_lifecycle_and_replacement() {
        let h = harness(true);
        assert_eq!(h.sync.subscription_state("users"), SubscriptionState::Idle);

        let first = h.sync.sync_users(|_| {});
        assert_eq!(h.sync.subscription_state("users"), SubscriptionState::Subscribed);
        assert_eq!(h.backend.listener_count(), 1);

        let second = h.sync.sync_users(|_| {});
        assert_eq!(h.backend.listener_count(), 1);

        // the replaced handle no longer controls the slot
        first();
        assert_eq!(h.sync.subscription_state("users"), SubscriptionState::Subscribed);
        assert_eq!(h.backend.listener_count(), 1);

        second();
        assert_eq!(h.sync.subscription_state("users"), SubscriptionState::Unsubscribed);
        assert_eq!(h.backend.listener_count(), 0);
    }

    #[test]
    fn realtime_disabled_returns_noop_handles() {
        let h = harness_with(
            true,
            SyncConfig {
                enable_realtime: false,
                ..Default::default()
            },
        );
        let unsubscribe = h.sync.sync_user("u1", |_| panic!("must not be called"));
        unsubscribe();
        assert_eq!(h.sync.subscription_state("user-u1"), SubscriptionState::Idle);
        assert_eq!(h.backend.listener_count(), 0);
    }

    #[test]
    fn stop_all_sync_releases_every_listener() {
        let h = harness(true);
        let _users = h.sync.sync_users(|_| {});
        let _member = h.sync.sync_staff_member("s1", |_| {});
        assert_eq!(h.backend.listener_count(), 2);

        h.sync.stop_all_sync();
        assert_eq!(h.backend.listener_count(), 0);
        assert_eq!(
            h.sync.subscription_state("staff-s1"),
            SubscriptionState::Unsubscribed
        );
    }

    #[tokio::test]
    async fn handle_connectivity_change_flushes_queue() {
        let h = harness(true);
        h.offline
            .add_pending_change(Collection::Users, ChangeOperation::create(json!({ "name": "佐藤" })))
            .unwrap();

        let report = h.sync.handle_connectivity_change(true).await;
        assert_eq!(report.succeeded, 1);
        assert!(h.offline.pending_changes().is_empty());

        let state = h.sync.sync_state();
        assert!(state.is_online);
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_time.is_some());
        assert_eq!(h.offline.cached_users().len(), 1);
    }

    #[tokio::test]
    async fn reconnecting_triggers_a_background_flush() {
        let h = harness(false);
        h.offline
            .add_pending_change(Collection::Users, ChangeOperation::delete("u1"))
            .unwrap();
        h.backend.seed("users", "u1", json!({ "name": "山田" }));
        assert!(!h.sync.sync_state().is_online);

        h.connectivity.set_online(true);
        assert!(h.sync.sync_state().is_online);
        for _ in 0..100 {
            if h.offline.pending_changes().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(h.offline.pending_changes().is_empty());
        assert_eq!(h.backend.document_count("users"), 0);

        h.connectivity.set_online(false);
        assert!(!h.sync.sync_state().is_online);
    }

    #[tokio::test]
    async fn refresh_failures_are_recorded_as_sync_errors() {
        let h = harness(true);
        h.backend.fail_next("permission-denied", "denied");

        h.sync.force_sync().await;
        let errors = h.sync.sync_state().sync_errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, SyncErrorKind::Permission);
        assert_eq!(errors[0].message, "同期エラー: アクセス権限がありません");
    }

    #[tokio::test]
    async fn force_sync_is_a_noop_offline() {
        let h = harness(false);
        let report = h.sync.force_sync().await;
        assert!(report.is_empty());
        assert!(h.sync.sync_state().last_sync_time.is_none());
        assert_eq!(h.backend.request_count(), 0);
    }
}
