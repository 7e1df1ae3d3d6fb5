use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Collection;
use crate::util::ids::random_id;

/// A locally queued mutation not yet confirmed by the backend.
///
/// Serialized as `{id, type, collection, entityId?, data?, tempId?, timestamp, retryCount}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: String,
    pub collection: Collection,
    #[serde(flatten)]
    pub operation: ChangeOperation,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingChange {
    /// Fresh change with a new opaque id, the current time and no retries.
    pub fn new(collection: Collection, operation: ChangeOperation) -> Self {
        Self {
            id: random_id(),
            collection,
            operation,
            timestamp: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        self.operation.change_type()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.operation.entity_id()
    }
}

/// What a pending change does. Creates never carry an entity id; updates and deletes
/// always do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeOperation {
    #[serde(rename_all = "camelCase")]
    Create {
        data: Value,
        /// Placeholder id handed to the caller while offline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Update { entity_id: String, data: Value },
    #[serde(rename_all = "camelCase")]
    Delete { entity_id: String },
}

impl ChangeOperation {
    pub fn create(data: Value) -> Self {
        ChangeOperation::Create {
            data,
            temp_id: None,
        }
    }

    pub fn create_with_temp_id(data: Value, temp_id: impl Into<String>) -> Self {
        ChangeOperation::Create {
            data,
            temp_id: Some(temp_id.into()),
        }
    }

    pub fn update(entity_id: impl Into<String>, data: Value) -> Self {
        ChangeOperation::Update {
            entity_id: entity_id.into(),
            data,
        }
    }

    pub fn delete(entity_id: impl Into<String>) -> Self {
        ChangeOperation::Delete {
            entity_id: entity_id.into(),
        }
    }

    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangeOperation::Create { .. } => ChangeType::Create,
            ChangeOperation::Update { .. } => ChangeType::Update,
            ChangeOperation::Delete { .. } => ChangeType::Delete,
        }
    }

    pub fn entity_id(&self) -> Option<&str> {
        match self {
            ChangeOperation::Create { .. } => None,
            ChangeOperation::Update { entity_id, .. } | ChangeOperation::Delete { entity_id } => {
                Some(entity_id)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Update => "update",
            ChangeType::Delete => "delete",
        }
    }
}

/// A change removed from the queue after exhausting its retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroppedChange {
    pub change: PendingChange,
    pub dropped_at: DateTime<Utc>,
    pub last_error: String,
}

/// Outcome of one pass over the pending queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed but kept for another attempt.
    pub failed: usize,
    /// Failed and removed after reaching the retry limit.
    pub dropped: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}
