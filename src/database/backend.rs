use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::database::query::QueryOptions;
use crate::util::subscribe::Unsubscribe;

/// Body of a stored document, without its id.
pub type DocumentData = Map<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: DocumentData,
}

impl Document {
    pub fn new(id: impl Into<String>, data: DocumentData) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Flattens the document into `{ "id": ..., ...data }`.
    pub fn into_json(self) -> Value {
        let mut map = self.data;
        map.insert("id".to_string(), Value::String(self.id));
        Value::Object(map)
    }
}

/// Failure reported by the hosted database, carrying its raw error code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOperation {
    Create {
        collection: String,
        id: Option<String>,
        data: DocumentData,
    },
    Update {
        collection: String,
        id: String,
        data: DocumentData,
    },
    Delete {
        collection: String,
        id: String,
    },
}

pub type SnapshotCallback = Arc<dyn Fn(BackendResult<Vec<Document>>) + Send + Sync + 'static>;
pub type DocumentCallback = Arc<dyn Fn(BackendResult<Option<Document>>) + Send + Sync + 'static>;

/// The hosted document database, treated as an opaque collaborator.
///
/// Implementations stamp `createdAt` on creation and `updatedAt` on every write.
/// Listeners deliver the current state right after registration and again after every
/// change that affects them.
#[async_trait]
pub trait DocumentBackend: Send + Sync + 'static {
    async fn add(&self, collection: &str, data: DocumentData) -> BackendResult<String>;
    async fn get(&self, collection: &str, id: &str) -> BackendResult<Option<Document>>;
    async fn update(&self, collection: &str, id: &str, data: DocumentData) -> BackendResult<()>;
    async fn delete(&self, collection: &str, id: &str) -> BackendResult<()>;
    async fn query(&self, collection: &str, query: &QueryOptions) -> BackendResult<Vec<Document>>;
    /// Applies every write or none of them.
    async fn commit(&self, writes: Vec<WriteOperation>) -> BackendResult<()>;

    fn listen_collection(
        &self,
        collection: &str,
        query: &QueryOptions,
        callback: SnapshotCallback,
    ) -> BackendResult<Unsubscribe>;

    fn listen_document(
        &self,
        collection: &str,
        id: &str,
        callback: DocumentCallback,
    ) -> BackendResult<Unsubscribe>;
}
