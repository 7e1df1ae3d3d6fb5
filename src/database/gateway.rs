use std::fmt;
use std::sync::{Arc, LazyLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::database::backend::{
    BackendResult, Document, DocumentBackend, DocumentData, WriteOperation,
};
use crate::database::error::{
    invalid_argument, invalid_document, map_backend_error, DatabaseResult,
};
use crate::database::query::{QueryOptions, SearchFilter};
use crate::logger::Logger;
use crate::util::subscribe::{noop_unsubscribe, Unsubscribe};

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@care-sync/database"));

/// One entry of a [`DocumentGateway::batch_write`] call.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchOperation {
    Create {
        collection: String,
        id: Option<String>,
        data: Value,
    },
    Update {
        collection: String,
        id: String,
        data: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Typed CRUD, query and live-subscription façade over a [`DocumentBackend`].
///
/// Payloads are any `serde` types that serialize to a JSON object; results are
/// deserialized from `{ "id": ..., ...fields }`. Backend failures are mapped to
/// [`DatabaseError`](crate::database::DatabaseError).
#[derive(Clone)]
pub struct DocumentGateway {
    backend: Arc<dyn DocumentBackend>,
}

impl fmt::Debug for DocumentGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentGateway")
            .field("backend", &"dynamic")
            .finish()
    }
}

impl DocumentGateway {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    pub async fn create<T>(&self, collection: &str, data: &T) -> DatabaseResult<String>
    where
        T: Serialize + ?Sized,
    {
        let data = to_document_data(data)?;
        self.backend
            .add(collection, data)
            .await
            .map_err(map_backend_error)
    }

    pub async fn read<T>(&self, collection: &str, id: &str) -> DatabaseResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let document = self
            .backend
            .get(collection, id)
            .await
            .map_err(map_backend_error)?;
        document.map(from_document).transpose()
    }

    pub async fn update<T>(&self, collection: &str, id: &str, data: &T) -> DatabaseResult<()>
    where
        T: Serialize + ?Sized,
    {
        let data = to_document_data(data)?;
        self.backend
            .update(collection, id, data)
            .await
            .map_err(map_backend_error)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> DatabaseResult<()> {
        self.backend
            .delete(collection, id)
            .await
            .map_err(map_backend_error)
    }

    pub async fn list<T>(&self, collection: &str, options: &QueryOptions) -> DatabaseResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let documents = self
            .backend
            .query(collection, options)
            .await
            .map_err(map_backend_error)?;
        documents.into_iter().map(from_document).collect()
    }

    pub async fn search<T>(&self, collection: &str, filters: Vec<SearchFilter>) -> DatabaseResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let options = QueryOptions {
            filters,
            ..Default::default()
        };
        self.list(collection, &options).await
    }

    /// Streams the query result set to `callback` on every change.
    ///
    /// Never fails: a registration error is logged and a no-op handle returned. Stream
    /// errors are logged and the subscription keeps delivering later snapshots. A snapshot
    /// holding a document that does not decode as `T` is treated the same way and never
    /// reaches `callback`, so a partial result set is never delivered.
    pub fn subscribe<T, F>(&self, collection: &str, options: &QueryOptions, callback: F) -> Unsubscribe
    where
        T: DeserializeOwned,
        F: Fn(Vec<T>) + Send + Sync + 'static,
    {
        let name = collection.to_string();
        let registration = self.backend.listen_collection(
            collection,
            options,
            Arc::new(move |result: BackendResult<Vec<Document>>| match result {
                Ok(documents) => {
                    match documents.into_iter().map(from_document::<T>).collect() {
                        Ok(records) => callback(records),
                        Err(err) => {
                            LOGGER.warn(format!("Skipping {name} snapshot: {err}"));
                        }
                    }
                }
                Err(err) => LOGGER.error(format!("Subscription error on {name}: {err}")),
            }),
        );

        registration.unwrap_or_else(|err| {
            LOGGER.error(format!("Subscribe error on {collection}: {err}"));
            noop_unsubscribe()
        })
    }

    /// Streams a single document (`None` when it does not exist) to `callback`.
    pub fn subscribe_to_document<T, F>(&self, collection: &str, id: &str, callback: F) -> Unsubscribe
    where
        T: DeserializeOwned,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let path = format!("{collection}/{id}");
        let registration = self.backend.listen_document(
            collection,
            id,
            Arc::new(move |result: BackendResult<Option<Document>>| match result {
                Ok(Some(document)) => match from_document::<T>(document) {
                    Ok(record) => callback(Some(record)),
                    Err(err) => LOGGER.warn(format!("Skipping undecodable document {path}: {err}")),
                },
                Ok(None) => callback(None),
                Err(err) => LOGGER.error(format!("Document subscription error on {path}: {err}")),
            }),
        );

        registration.unwrap_or_else(|err| {
            LOGGER.error(format!("Subscribe to document error on {collection}/{id}: {err}"));
            noop_unsubscribe()
        })
    }

    pub async fn batch_write(&self, operations: Vec<BatchOperation>) -> DatabaseResult<()> {
        let writes = operations
            .into_iter()
            .map(|operation| match operation {
                BatchOperation::Create {
                    collection,
                    id,
                    data,
                } => Ok(WriteOperation::Create {
                    collection,
                    id,
                    data: to_document_data(&data)?,
                }),
                BatchOperation::Update {
                    collection,
                    id,
                    data,
                } => Ok(WriteOperation::Update {
                    collection,
                    id,
                    data: to_document_data(&data)?,
                }),
                BatchOperation::Delete { collection, id } => {
                    Ok(WriteOperation::Delete { collection, id })
                }
            })
            .collect::<DatabaseResult<Vec<_>>>()?;

        self.backend
            .commit(writes)
            .await
            .map_err(map_backend_error)
    }
}

/// Serializes a payload into a document body; `id` is never written as a field.
fn to_document_data<T>(data: &T) -> DatabaseResult<DocumentData>
where
    T: Serialize + ?Sized,
{
    match serde_json::to_value(data) {
        Ok(Value::Object(mut map)) => {
            map.remove("id");
            Ok(map)
        }
        Ok(other) => Err(invalid_argument(format!(
            "Document data must be an object, got {}",
            json_type_name(&other)
        ))),
        Err(err) => Err(invalid_argument(format!(
            "Failed to serialize document data: {err}"
        ))),
    }
}

fn from_document<T>(document: Document) -> DatabaseResult<T>
where
    T: DeserializeOwned,
{
    let id = document.id.clone();
    serde_json::from_value(document.into_json())
        .map_err(|err| invalid_document(format!("Failed to decode document {id}: {err}")))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
