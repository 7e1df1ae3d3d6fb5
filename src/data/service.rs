use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::data::config::DataServiceConfig;
use crate::data::error::{offline_mode_disabled, DataError, DataResult};
use crate::database::{
    DocumentBackend, DocumentGateway, QueryOptions, StaffRepository, UserRepository,
};
use crate::logger::Logger;
use crate::model::{Collection, Entity, NewStaff, NewUser, Staff, StaffPatch, User, UserPatch};
use crate::offline::error::serialization_error;
use crate::offline::{CacheConfig, ChangeOperation, FlushReport, KeyValueStore, OfflineStorage};
use crate::platform::runtime::spawn_detached;
use crate::platform::Connectivity;
use crate::sync::{DataSync, SyncConfig};
use crate::util::ids::temp_id;
use crate::util::subscribe::{noop_unsubscribe, Unsubscribe};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@care-sync/data"));

/// Snapshot of the façade combined from the cache and the sync coordinator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataServiceState {
    pub is_online: bool,
    pub is_initialized: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Queued changes plus sync passes in flight.
    pub pending_changes: usize,
    pub sync_errors: usize,
}

pub type DataServiceStateCallback = Arc<dyn Fn(&DataServiceState) + Send + Sync + 'static>;

/// Builder for [`DataService`]; the composition root of the crate.
pub struct DataServiceBuilder {
    backend: Arc<dyn DocumentBackend>,
    store: Arc<dyn KeyValueStore>,
    connectivity: Option<Connectivity>,
    config: DataServiceConfig,
    cache_config: CacheConfig,
    sync_config: SyncConfig,
}

impl DataServiceBuilder {
    fn new(backend: Arc<dyn DocumentBackend>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            store,
            connectivity: None,
            config: DataServiceConfig::default(),
            cache_config: CacheConfig::default(),
            sync_config: SyncConfig::default(),
        }
    }

    /// Shares an existing connectivity signal. Defaults to a fresh one that starts online.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    pub fn with_config(mut self, config: DataServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Base cache settings; the fields covered by [`DataServiceConfig`] are overridden.
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Base sync settings such as the conflict strategy.
    pub fn with_sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    pub fn build(self) -> DataService {
        let connectivity = self.connectivity.unwrap_or_else(|| Connectivity::new(true));
        let gateway = DocumentGateway::new(self.backend);
        let offline = OfflineStorage::new(
            self.store,
            gateway.clone(),
            connectivity.clone(),
            self.config.cache_config(self.cache_config),
        );
        let sync = DataSync::new(
            gateway.clone(),
            offline.clone(),
            connectivity.clone(),
            self.config.sync_config(self.sync_config),
        );

        let service = DataService {
            inner: Arc::new(DataInner {
                users: UserRepository::new(gateway.clone()),
                staff: StaffRepository::new(gateway),
                offline,
                sync,
                connectivity,
                config: RwLock::new(self.config),
                initialized: AtomicBool::new(false),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(1),
                forwarders: Mutex::new(Vec::new()),
            }),
        };
        service.forward_state_changes();
        service
    }
}

/// Single entry point for reading and writing residents and staff.
///
/// Each call picks the remote gateway or the local cache and queue depending on
/// connectivity and [`DataServiceConfig::enable_offline_mode`]:
///
/// * list reads go to the backend while online and refresh the cache; they fall back to the
///   cache when the backend fails or connectivity is gone.
/// * writes while offline are queued; creates then return a `temp_<millis>` id.
/// * a write that fails online is queued as well, and the error is still returned.
#[derive(Clone)]
pub struct DataService {
    inner: Arc<DataInner>,
}

struct DataInner {
    users: UserRepository,
    staff: StaffRepository,
    offline: OfflineStorage,
    sync: DataSync,
    connectivity: Connectivity,
    config: RwLock<DataServiceConfig>,
    initialized: AtomicBool,
    listeners: Mutex<BTreeMap<u64, DataServiceStateCallback>>,
    next_listener_id: AtomicU64,
    forwarders: Mutex<Vec<Unsubscribe>>,
}

impl fmt::Debug for DataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataService")
            .field("config", &self.config())
            .field("state", &self.state())
            .finish()
    }
}

impl DataService {
    pub fn builder(
        backend: Arc<dyn DocumentBackend>,
        store: Arc<dyn KeyValueStore>,
    ) -> DataServiceBuilder {
        DataServiceBuilder::new(backend, store)
    }

    pub fn offline(&self) -> &OfflineStorage {
        &self.inner.offline
    }

    pub fn sync(&self) -> &DataSync {
        &self.inner.sync
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// Pushes the configuration down, loads the cache when online and starts auto-sync.
    ///
    /// Calling it again after a successful run does nothing.
    pub async fn initialize(&self) {
        if self.inner.initialized.load(Ordering::SeqCst) {
            return;
        }

        self.apply_config(&self.config());
        if self.inner.connectivity.is_online() {
            if let Err(err) = self.inner.offline.refresh_cache().await {
                LOGGER.warn(format!("Failed to load initial data from server: {err}"));
            }
        }
        self.inner.offline.start_auto_sync();

        self.inner.initialized.store(true, Ordering::SeqCst);
        LOGGER.info("Data service initialized");
        self.notify_state_change();
    }

    pub fn config(&self) -> DataServiceConfig {
        self.inner.config.read().unwrap().clone()
    }

    pub fn update_config(&self, config: DataServiceConfig) {
        *self.inner.config.write().unwrap() = config.clone();
        self.apply_config(&config);
    }

    pub fn state(&self) -> DataServiceState {
        let sync_state = self.inner.sync.sync_state();
        let cache_state = self.inner.offline.cache_state();
        DataServiceState {
            is_online: self.inner.connectivity.is_online(),
            is_initialized: self.inner.initialized.load(Ordering::SeqCst),
            last_sync_time: sync_state.last_sync_time.or(cache_state.last_sync_time),
            pending_changes: sync_state.pending_changes + cache_state.pending_changes,
            sync_errors: sync_state.sync_errors.len(),
        }
    }

    pub fn on_state_change<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&DataServiceState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));

        let weak: Weak<DataInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    // residents

    /// All residents. With offline mode on, `options` are ignored so the cache always holds
    /// the full collection.
    pub async fn get_users(&self, options: &QueryOptions) -> DataResult<Vec<User>> {
        if !self.offline_mode() {
            return Ok(self.inner.users.list_users(options).await?);
        }
        if !self.inner.connectivity.is_online() {
            return Ok(self.inner.offline.cached_users());
        }

        match self.inner.users.list_users(&QueryOptions::default()).await {
            Ok(users) => {
                if let Err(err) = self.inner.offline.cache_users(&users) {
                    LOGGER.warn(format!("Failed to cache users: {err}"));
                }
                Ok(users)
            }
            Err(err) => {
                LOGGER.warn(format!("Failed to fetch users online, using cache: {err}"));
                Ok(self.inner.offline.cached_users())
            }
        }
    }

    pub async fn get_user(&self, id: &str) -> DataResult<Option<User>> {
        if self.inner.connectivity.is_online() {
            let remote_id = self.inner.offline.resolve_id(id);
            match self.inner.users.get_user(&remote_id).await {
                Ok(user) => Ok(user),
                Err(err) if self.offline_mode() => {
                    LOGGER.warn(format!("Failed to fetch user {id}, using cache: {err}"));
                    Ok(self.find_cached(self.inner.offline.cached_users(), id))
                }
                Err(err) => Err(err.into()),
            }
        } else if self.offline_mode() {
            Ok(self.find_cached(self.inner.offline.cached_users(), id))
        } else {
            Err(offline_mode_disabled())
        }
    }

    pub async fn create_user(&self, user: &NewUser) -> DataResult<String> {
        if !self.offline_mode() {
            return Ok(self.inner.users.create_user(user).await?);
        }
        if !self.inner.connectivity.is_online() {
            return self.queue_offline_create(Collection::Users, user);
        }

        match self.inner.users.create_user(user).await {
            Ok(id) => Ok(id),
            Err(err) => {
                let operation = to_payload(user).map(ChangeOperation::create);
                self.queue_after_failure(Collection::Users, operation);
                Err(err.into())
            }
        }
    }

    pub async fn update_user(&self, id: &str, patch: &UserPatch) -> DataResult<()> {
        if !self.offline_mode() {
            return Ok(self.inner.users.update_user(id, patch).await?);
        }
        let operation = || to_payload(patch).map(|data| ChangeOperation::update(id, data));
        if !self.inner.connectivity.is_online() {
            self.inner
                .offline
                .add_pending_change(Collection::Users, operation()?)?;
            return Ok(());
        }

        let remote_id = self.inner.offline.resolve_id(id);
        match self.inner.users.update_user(&remote_id, patch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.queue_after_failure(Collection::Users, operation());
                Err(err.into())
            }
        }
    }

    pub async fn delete_user(&self, id: &str) -> DataResult<()> {
        self.delete(Collection::Users, id).await
    }

    /// Residents whose name or kana name contains `term`.
    pub async fn search_users(&self, term: &str) -> DataResult<Vec<User>> {
        let users = self.get_users(&QueryOptions::default()).await?;
        Ok(users
            .into_iter()
            .filter(|user| user.name.contains(term) || user.name_kana.contains(term))
            .collect())
    }

    /// Delivers the refreshed resident list whenever the remote collection changes.
    pub fn subscribe_to_users<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Vec<User>) + Send + Sync + 'static,
    {
        if !self.config().enable_real_time_sync {
            return noop_unsubscribe();
        }
        let callback = Arc::new(callback);
        let weak: Weak<DataInner> = Arc::downgrade(&self.inner);
        self.inner.sync.sync_users(move |_changes| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = DataService { inner };
            let callback = Arc::clone(&callback);
            spawn_detached(async move {
                match service.get_users(&QueryOptions::default()).await {
                    Ok(users) => callback(users),
                    Err(err) => LOGGER.warn(format!("Failed to reload users: {err}")),
                }
            });
        })
    }

    // staff

    pub async fn get_staff(&self, options: &QueryOptions) -> DataResult<Vec<Staff>> {
        if !self.offline_mode() {
            return Ok(self.inner.staff.list_staff(options).await?);
        }
        if !self.inner.connectivity.is_online() {
            return Ok(self.inner.offline.cached_staff());
        }

        match self.inner.staff.list_staff(&QueryOptions::default()).await {
            Ok(staff) => {
                if let Err(err) = self.inner.offline.cache_staff(&staff) {
                    LOGGER.warn(format!("Failed to cache staff: {err}"));
                }
                Ok(staff)
            }
            Err(err) => {
                LOGGER.warn(format!("Failed to fetch staff online, using cache: {err}"));
                Ok(self.inner.offline.cached_staff())
            }
        }
    }

    pub async fn get_staff_member(&self, id: &str) -> DataResult<Option<Staff>> {
        if self.inner.connectivity.is_online() {
            let remote_id = self.inner.offline.resolve_id(id);
            match self.inner.staff.get_staff(&remote_id).await {
                Ok(staff) => Ok(staff),
                Err(err) if self.offline_mode() => {
                    LOGGER.warn(format!("Failed to fetch staff {id}, using cache: {err}"));
                    Ok(self.find_cached(self.inner.offline.cached_staff(), id))
                }
                Err(err) => Err(err.into()),
            }
        } else if self.offline_mode() {
            Ok(self.find_cached(self.inner.offline.cached_staff(), id))
        } else {
            Err(offline_mode_disabled())
        }
    }

    pub async fn create_staff(&self, staff: &NewStaff) -> DataResult<String> {
        if !self.offline_mode() {
            return Ok(self.inner.staff.create_staff(staff).await?);
        }
        if !self.inner.connectivity.is_online() {
            return self.queue_offline_create(Collection::Staff, staff);
        }

        match self.inner.staff.create_staff(staff).await {
            Ok(id) => Ok(id),
            Err(err) => {
                let operation = to_payload(staff).map(ChangeOperation::create);
                self.queue_after_failure(Collection::Staff, operation);
                Err(err.into())
            }
        }
    }

    pub async fn update_staff(&self, id: &str, patch: &StaffPatch) -> DataResult<()> {
        if !self.offline_mode() {
            return Ok(self.inner.staff.update_staff(id, patch).await?);
        }
        let operation = || to_payload(patch).map(|data| ChangeOperation::update(id, data));
        if !self.inner.connectivity.is_online() {
            self.inner
                .offline
                .add_pending_change(Collection::Staff, operation()?)?;
            return Ok(());
        }

        let remote_id = self.inner.offline.resolve_id(id);
        match self.inner.staff.update_staff(&remote_id, patch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.queue_after_failure(Collection::Staff, operation());
                Err(err.into())
            }
        }
    }

    pub async fn delete_staff(&self, id: &str) -> DataResult<()> {
        self.delete(Collection::Staff, id).await
    }

    pub async fn get_active_staff(&self) -> DataResult<Vec<Staff>> {
        let staff = self.get_staff(&QueryOptions::default()).await?;
        Ok(staff.into_iter().filter(|member| member.is_active).collect())
    }

    pub fn subscribe_to_staff<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Vec<Staff>) + Send + Sync + 'static,
    {
        if !self.config().enable_real_time_sync {
            return noop_unsubscribe();
        }
        let callback = Arc::new(callback);
        let weak: Weak<DataInner> = Arc::downgrade(&self.inner);
        self.inner.sync.sync_staff(move |_changes| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = DataService { inner };
            let callback = Arc::clone(&callback);
            spawn_detached(async move {
                match service.get_staff(&QueryOptions::default()).await {
                    Ok(staff) => callback(staff),
                    Err(err) => LOGGER.warn(format!("Failed to reload staff: {err}")),
                }
            });
        })
    }

    // sync and cache management

    /// Flushes the queue and refreshes the cache. Does nothing while offline.
    pub async fn force_sync(&self) -> FlushReport {
        if !self.inner.connectivity.is_online() {
            return FlushReport::default();
        }
        let report = self.inner.sync.force_sync().await;
        self.notify_state_change();
        report
    }

    /// Wipes the local cache and queue. Ignored when offline mode is off.
    pub fn clear_cache(&self) {
        if self.offline_mode() {
            self.inner.offline.clear_cache();
            self.notify_state_change();
        }
    }

    pub fn destroy(&self) {
        let forwarders: Vec<Unsubscribe> =
            self.inner.forwarders.lock().unwrap().drain(..).collect();
        for unsubscribe in forwarders {
            unsubscribe();
        }
        self.inner.sync.destroy();
        self.inner.offline.destroy();
        self.inner.listeners.lock().unwrap().clear();
    }

    fn offline_mode(&self) -> bool {
        self.inner.config.read().unwrap().enable_offline_mode
    }

    fn apply_config(&self, config: &DataServiceConfig) {
        let offline = &self.inner.offline;
        offline.update_config(config.cache_config(offline.config()));
        let sync = &self.inner.sync;
        sync.update_config(config.sync_config(sync.config()));
    }

    async fn delete(&self, collection: Collection, id: &str) -> DataResult<()> {
        if !self.inner.connectivity.is_online() {
            if !self.offline_mode() {
                return Err(offline_mode_disabled());
            }
            self.inner
                .offline
                .add_pending_change(collection, ChangeOperation::delete(id))?;
            return Ok(());
        }

        let remote_id = self.inner.offline.resolve_id(id);
        let result = match collection {
            Collection::Users => self.inner.users.delete_user(&remote_id).await,
            Collection::Staff => self.inner.staff.delete_staff(&remote_id).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.offline_mode() {
                    self.queue_after_failure(collection, Ok(ChangeOperation::delete(id)));
                }
                Err(err.into())
            }
        }
    }

    fn queue_offline_create<T: Serialize>(
        &self,
        collection: Collection,
        record: &T,
    ) -> DataResult<String> {
        let id = temp_id();
        let operation = ChangeOperation::create_with_temp_id(to_payload(record)?, id.clone());
        self.inner.offline.add_pending_change(collection, operation)?;
        LOGGER.debug(format!("Created {collection} {id} offline"));
        Ok(id)
    }

    /// Queues a write whose online attempt failed. The caller still reports the original
    /// failure, so problems here are only logged.
    fn queue_after_failure(&self, collection: Collection, operation: DataResult<ChangeOperation>) {
        let queued = operation.and_then(|operation| {
            self.inner
                .offline
                .add_pending_change(collection, operation)
                .map_err(DataError::from)
        });
        if let Err(err) = queued {
            LOGGER.error(format!("Failed to queue {collection} change: {err}"));
        }
    }

    fn find_cached<T: Entity>(&self, records: Vec<T>, id: &str) -> Option<T> {
        let remote_id = self.inner.offline.resolve_id(id);
        records
            .into_iter()
            .find(|record| record.id() == id || record.id() == remote_id)
    }

    fn forward_state_changes(&self) {
        let weak: Weak<DataInner> = Arc::downgrade(&self.inner);
        let from_cache = self.inner.offline.on_cache_state_change(move |_| {
            if let Some(inner) = weak.upgrade() {
                DataService { inner }.notify_state_change();
            }
        });
        let weak: Weak<DataInner> = Arc::downgrade(&self.inner);
        let from_sync = self.inner.sync.on_sync_state_change(move |_| {
            if let Some(inner) = weak.upgrade() {
                DataService { inner }.notify_state_change();
            }
        });
        self.inner
            .forwarders
            .lock()
            .unwrap()
            .extend([from_cache, from_sync]);
    }

    fn notify_state_change(&self) {
        let listeners: Vec<DataServiceStateCallback> = self
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
        let state = self.state();
        for listener in listeners {
            listener(&state);
        }
    }
}

fn to_payload<T: Serialize>(record: &T) -> DataResult<Value> {
    serde_json::to_value(record)
        .map_err(|err| DataError::from(serialization_error(format!("Failed to encode payload: {err}"))))
}
