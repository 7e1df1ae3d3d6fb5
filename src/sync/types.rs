use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Policy applied when local and server state disagree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    ServerWins,
    ClientWins,
    /// Record the conflict and keep neither side.
    Manual,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Update,
    Delete,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Update => "update",
            ConflictKind::Delete => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub enable_realtime: bool,
    pub conflict_resolution: ConflictStrategy,
    pub retry_attempts: u32,
    /// Carried for callers that schedule their own retries; the coordinator never sleeps
    /// on it.
    pub retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_realtime: true,
            conflict_resolution: ConflictStrategy::ServerWins,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncErrorKind {
    Conflict,
    Network,
    Permission,
}

/// A sync-layer problem recorded for display, not a Rust error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncError {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SyncErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Sync passes currently in flight.
    pub pending_changes: usize,
    /// Most recent errors, oldest first.
    pub sync_errors: Vec<SyncError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One record-level difference between two successive snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent<T> {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub id: String,
    /// `None` for removals.
    pub data: Option<T>,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of a named subscription: `Idle → Subscribed → Unsubscribed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriptionState {
    #[default]
    Idle,
    Subscribed,
    Unsubscribed,
}
