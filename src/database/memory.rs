use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::database::backend::{
    BackendError, BackendResult, Document, DocumentBackend, DocumentCallback, DocumentData,
    SnapshotCallback, WriteOperation,
};
use crate::database::query::{compare_values, field_value, OrderDirection, QueryOptions};
use crate::util::ids::auto_id;
use crate::util::subscribe::Unsubscribe;

type Collections = BTreeMap<String, BTreeMap<String, DocumentData>>;

/// Process-local document database used by tests and embedded deployments.
///
/// Supports fault injection so callers can exercise their failure paths: a persistent
/// fault (`fail_with`) fails every request and listener registration until cleared, while
/// queued faults (`fail_next`) fail exactly one request each.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<InMemoryInner>,
}

#[derive(Default)]
struct InMemoryInner {
    collections: Mutex<Collections>,
    listeners: Mutex<BTreeMap<u64, Listener>>,
    next_listener_id: AtomicU64,
    faults: Mutex<FaultPlan>,
    requests: AtomicUsize,
}

#[derive(Default)]
struct FaultPlan {
    persistent: Option<BackendError>,
    queued: VecDeque<BackendError>,
}

#[derive(Clone)]
enum Listener {
    Collection {
        collection: String,
        query: QueryOptions,
        callback: SnapshotCallback,
    },
    Document {
        collection: String,
        id: String,
        callback: DocumentCallback,
    },
}

impl Listener {
    fn collection(&self) -> &str {
        match self {
            Listener::Collection { collection, .. } | Listener::Document { collection, .. } => {
                collection
            }
        }
    }

    fn is_affected_by(&self, collection: &str, changed_ids: &[String]) -> bool {
        match self {
            Listener::Collection { collection: own, .. } => own == collection,
            Listener::Document {
                collection: own,
                id,
                ..
            } => own == collection && changed_ids.iter().any(|changed| changed == id),
        }
    }
}

impl fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("requests", &self.request_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every subsequent request with `code` until [`clear_faults`](Self::clear_faults).
    pub fn fail_with(&self, code: impl Into<String>, message: impl Into<String>) {
        self.inner.faults.lock().unwrap().persistent = Some(BackendError::new(code, message));
    }

    /// Fails the next request with `code`; calls queue up.
    pub fn fail_next(&self, code: impl Into<String>, message: impl Into<String>) {
        self.inner
            .faults
            .lock()
            .unwrap()
            .queued
            .push_back(BackendError::new(code, message));
    }

    pub fn clear_faults(&self) {
        let mut faults = self.inner.faults.lock().unwrap();
        faults.persistent = None;
        faults.queued.clear();
    }

    /// Number of data requests (reads and writes) received so far.
    pub fn request_count(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().unwrap().len()
    }

    /// Stores a document as-is, bypassing faults and timestamps, and notifies listeners.
    pub fn seed(&self, collection: &str, id: &str, data: Value) {
        let data = match data {
            Value::Object(map) => map,
            _ => DocumentData::new(),
        };
        self.inner
            .collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
        self.notify(collection, &[id.to_string()]);
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        let collections = self.inner.collections.lock().unwrap();
        collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .map(|data| Document::new(id, data.clone()))
    }

    pub fn document_count(&self, collection: &str) -> usize {
        let collections = self.inner.collections.lock().unwrap();
        collections.get(collection).map_or(0, BTreeMap::len)
    }

    /// Delivers a stream error to every listener on `collection`.
    pub fn emit_error(&self, collection: &str, error: BackendError) {
        let listeners = self.listeners_where(|listener| listener.collection() == collection);
        for listener in listeners {
            match listener {
                Listener::Collection { callback, .. } => callback(Err(error.clone())),
                Listener::Document { callback, .. } => callback(Err(error.clone())),
            }
        }
    }

    fn begin_request(&self) -> BackendResult<()> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.inner.faults.lock().unwrap();
        if let Some(error) = faults.queued.pop_front() {
            return Err(error);
        }
        match &faults.persistent {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn check_listen(&self) -> BackendResult<()> {
        match &self.inner.faults.lock().unwrap().persistent {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn register(&self, listener: Listener) -> Unsubscribe {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .unwrap()
            .insert(id, listener.clone());

        self.deliver(&listener);

        let weak: Weak<InMemoryInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().unwrap().remove(&id);
            }
        })
    }

    fn listeners_where<P>(&self, predicate: P) -> Vec<Listener>
    where
        P: Fn(&Listener) -> bool,
    {
        self.inner
            .listeners
            .lock()
            .unwrap()
            .values()
            .filter(|listener| predicate(listener))
            .cloned()
            .collect()
    }

    fn notify(&self, collection: &str, changed_ids: &[String]) {
        let listeners =
            self.listeners_where(|listener| listener.is_affected_by(collection, changed_ids));
        for listener in listeners {
            self.deliver(&listener);
        }
    }

    fn deliver(&self, listener: &Listener) {
        match listener {
            Listener::Collection {
                collection,
                query,
                callback,
            } => {
                let documents = {
                    let collections = self.inner.collections.lock().unwrap();
                    run_query(collections.get(collection.as_str()), query)
                };
                callback(Ok(documents));
            }
            Listener::Document {
                collection,
                id,
                callback,
            } => {
                callback(Ok(self.document(collection, id)));
            }
        }
    }
}

fn now_timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Applies one write to `collections`, returning the `(collection, id)` it touched.
fn apply_write(
    collections: &mut Collections,
    write: WriteOperation,
) -> BackendResult<(String, String)> {
    match write {
        WriteOperation::Create {
            collection,
            id,
            mut data,
        } => {
            let documents = collections.entry(collection.clone()).or_default();
            let id = id.unwrap_or_else(|| unique_id(documents));
            let now = now_timestamp();
            data.insert("createdAt".to_string(), now.clone());
            data.insert("updatedAt".to_string(), now);
            documents.insert(id.clone(), data);
            Ok((collection, id))
        }
        WriteOperation::Update {
            collection,
            id,
            data,
        } => {
            let current = collections
                .get_mut(&collection)
                .and_then(|documents| documents.get_mut(&id))
                .ok_or_else(|| {
                    BackendError::new("not-found", format!("Document {collection}/{id} does not exist"))
                })?;
            for (field, value) in data {
                current.insert(field, value);
            }
            current.insert("updatedAt".to_string(), now_timestamp());
            Ok((collection, id))
        }
        WriteOperation::Delete { collection, id } => {
            if let Some(documents) = collections.get_mut(&collection) {
                documents.remove(&id);
            }
            Ok((collection, id))
        }
    }
}

fn unique_id(documents: &BTreeMap<String, DocumentData>) -> String {
    loop {
        let id = auto_id();
        if !documents.contains_key(&id) {
            return id;
        }
    }
}

fn run_query(
    documents: Option<&BTreeMap<String, DocumentData>>,
    query: &QueryOptions,
) -> Vec<Document> {
    let Some(documents) = documents else {
        return Vec::new();
    };

    let mut results: Vec<Document> = documents
        .iter()
        .filter(|(_, data)| query.filters.iter().all(|filter| filter.matches(data)))
        .map(|(id, data)| Document::new(id.clone(), data.clone()))
        .collect();

    if let Some(order) = &query.order_by {
        results.sort_by(|left, right| {
            let ordering = compare_field(&left.data, &right.data, &order.field);
            match order.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            }
        });
    }

    if let Some(cursor) = &query.start_after {
        results.retain(|document| match &query.order_by {
            Some(order) => {
                let value = field_value(&document.data, &order.field).unwrap_or(&Value::Null);
                let ordering = compare_values(value, cursor).unwrap_or(CmpOrdering::Equal);
                match order.direction {
                    OrderDirection::Ascending => ordering == CmpOrdering::Greater,
                    OrderDirection::Descending => ordering == CmpOrdering::Less,
                }
            }
            None => cursor
                .as_str()
                .is_some_and(|cursor| document.id.as_str() > cursor),
        });
    }

    if let Some(limit) = query.limit {
        results.truncate(limit);
    }

    results
}

fn compare_field(left: &DocumentData, right: &DocumentData, field: &str) -> CmpOrdering {
    let left = field_value(left, field).unwrap_or(&Value::Null);
    let right = field_value(right, field).unwrap_or(&Value::Null);
    compare_values(left, right).unwrap_or(CmpOrdering::Equal)
}

#[async_trait]
impl DocumentBackend for InMemoryBackend {
    async fn add(&self, collection: &str, data: DocumentData) -> BackendResult<String> {
        self.begin_request()?;
        let (collection, id) = {
            let mut collections = self.inner.collections.lock().unwrap();
            apply_write(
                &mut collections,
                WriteOperation::Create {
                    collection: collection.to_string(),
                    id: None,
                    data,
                },
            )?
        };
        self.notify(&collection, std::slice::from_ref(&id));
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>> {
        self.begin_request()?;
        Ok(self.document(collection, id))
    }

    async fn update(&self, collection: &str, id: &str, data: DocumentData) -> BackendResult<()> {
        self.begin_request()?;
        {
            let mut collections = self.inner.collections.lock().unwrap();
            apply_write(
                &mut collections,
                WriteOperation::Update {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    data,
                },
            )?;
        }
        self.notify(collection, &[id.to_string()]);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> BackendResult<()> {
        self.begin_request()?;
        {
            let mut collections = self.inner.collections.lock().unwrap();
            apply_write(
                &mut collections,
                WriteOperation::Delete {
                    collection: collection.to_string(),
                    id: id.to_string(),
                },
            )?;
        }
        self.notify(collection, &[id.to_string()]);
        Ok(())
    }

    async fn query(&self, collection: &str, query: &QueryOptions) -> BackendResult<Vec<Document>> {
        self.begin_request()?;
        let collections = self.inner.collections.lock().unwrap();
        Ok(run_query(collections.get(collection), query))
    }

    async fn commit(&self, writes: Vec<WriteOperation>) -> BackendResult<()> {
        self.begin_request()?;
        let touched = {
            let mut collections = self.inner.collections.lock().unwrap();
            let mut staged = collections.clone();
            let mut touched = Vec::with_capacity(writes.len());
            for write in writes {
                touched.push(apply_write(&mut staged, write)?);
            }
            *collections = staged;
            touched
        };

        let mut by_collection: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (collection, id) in touched {
            by_collection.entry(collection).or_default().push(id);
        }
        for (collection, ids) in by_collection {
            self.notify(&collection, &ids);
        }
        Ok(())
    }

    fn listen_collection(
        &self,
        collection: &str,
        query: &QueryOptions,
        callback: SnapshotCallback,
    ) -> BackendResult<Unsubscribe> {
        self.check_listen()?;
        Ok(self.register(Listener::Collection {
            collection: collection.to_string(),
            query: query.clone(),
            callback,
        }))
    }

    fn listen_document(
        &self,
        collection: &str,
        id: &str,
        callback: DocumentCallback,
    ) -> BackendResult<Unsubscribe> {
        self.check_listen()?;
        Ok(self.register(Listener::Document {
            collection: collection.to_string(),
            id: id.to_string(),
            callback,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::query::{FilterOperator, SearchFilter};
    use serde_json::json;

    fn data(value: Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn add_stamps_server_timestamps() {
        let backend = InMemoryBackend::new();
        let id = backend.add("users", data(json!({ "name": "A" }))).await.unwrap();

        let document = backend.get("users", &id).await.unwrap().unwrap();
        assert!(document.data.contains_key("createdAt"));
        assert!(document.data.contains_key("updatedAt"));
        assert_eq!(backend.request_count(), 2);
    }

    #[tokio::test]
    async fn update_of_missing_document_is_not_found() {
        let backend = InMemoryBackend::new();
        let error = backend
            .update("users", "missing", data(json!({ "name": "B" })))
            .await
            .unwrap_err();
        assert_eq!(error.code, "not-found");
    }

    #[tokio::test]
    async fn query_filters_orders_and_pages() {
        let backend = InMemoryBackend::new();
        backend.seed("staff", "s1", json!({ "name": "C", "isActive": true }));
        backend.seed("staff", "s2", json!({ "name": "A", "isActive": true }));
        backend.seed("staff", "s3", json!({ "name": "B", "isActive": false }));
        backend.seed("staff", "s4", json!({ "name": "D", "isActive": true }));

        let query = QueryOptions::new()
            .with_filter(SearchFilter::new("isActive", FilterOperator::Equal, true))
            .order_by("name", OrderDirection::Ascending)
            .start_after("A")
            .limit(1);
        let results = backend.query("staff", &query).await.unwrap();
        let ids: Vec<_> = results.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, ["s1"]);
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let backend = InMemoryBackend::new();
        let result = backend
            .commit(vec![
                WriteOperation::Create {
                    collection: "users".into(),
                    id: Some("u1".into()),
                    data: data(json!({ "name": "A" })),
                },
                WriteOperation::Update {
                    collection: "users".into(),
                    id: "missing".into(),
                    data: data(json!({ "name": "B" })),
                },
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(backend.document_count("users"), 0);
    }

    #[tokio::test]
    async fn queued_faults_fail_one_request_each() {
        let backend = InMemoryBackend::new();
        backend.fail_next("unavailable", "offline");
        assert_eq!(
            backend.get("users", "x").await.unwrap_err().code,
            "unavailable"
        );
        assert!(backend.get("users", "x").await.is_ok());
    }

    #[test]
    fn listeners_receive_initial_and_subsequent_snapshots() {
        let backend = InMemoryBackend::new();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let unsubscribe = backend
            .listen_collection(
                "users",
                &QueryOptions::default(),
                Arc::new(move |result: BackendResult<Vec<Document>>| {
                    sink.lock().unwrap().push(result.unwrap().len());
                }),
            )
            .unwrap();

        backend.seed("users", "u1", json!({ "name": "A" }));
        backend.seed("staff", "s1", json!({ "name": "S" }));
        unsubscribe();
        backend.seed("users", "u2", json!({ "name": "B" }));

        assert_eq!(seen.lock().unwrap().as_slice(), &[0, 1]);
        assert_eq!(backend.listener_count(), 0);
    }

    #[test]
    fn persistent_fault_rejects_listener_registration() {
        let backend = InMemoryBackend::new();
        backend.fail_with("permission-denied", "nope");
        let result = backend.listen_document(
            "users",
            "u1",
            Arc::new(|_: BackendResult<Option<Document>>| {}),
        );
        assert!(result.is_err());
    }
}
