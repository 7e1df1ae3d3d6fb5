use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::Entity;
use crate::sync::types::{ChangeEvent, ChangeKind};

type ContentHash = [u8; 32];

/// Turns successive collection snapshots into added / modified / removed events.
///
/// Only a SHA-256 digest of each record's JSON form is remembered between snapshots. A
/// record whose serialization fails is always reported as modified.
pub struct SnapshotDiffer<T> {
    previous: HashMap<String, Option<ContentHash>>,
    previous_order: Vec<String>,
    _records: PhantomData<fn(T)>,
}

impl<T> Default for SnapshotDiffer<T> {
    fn default() -> Self {
        Self {
            previous: HashMap::new(),
            previous_order: Vec::new(),
            _records: PhantomData,
        }
    }
}

impl<T> SnapshotDiffer<T>
where
    T: Entity + Serialize,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the remembered snapshot.
    pub fn len(&self) -> usize {
        self.previous_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous_order.is_empty()
    }

    /// Compares `snapshot` with the remembered one and remembers `snapshot`.
    ///
    /// Events for added and modified records follow snapshot order, removals come last in
    /// the order they were previously seen. Repeated ids keep their first occurrence.
    pub fn diff(&mut self, snapshot: Vec<T>) -> Vec<ChangeEvent<T>> {
        let now = Utc::now();
        let mut current = HashMap::with_capacity(snapshot.len());
        let mut current_order = Vec::with_capacity(snapshot.len());
        let mut seen = HashSet::with_capacity(snapshot.len());
        let mut events = Vec::new();

        for record in snapshot {
            let id = record.id().to_string();
            if !seen.insert(id.clone()) {
                continue;
            }
            let hash = content_hash(&record);
            let kind = match self.previous.get(&id) {
                None => Some(ChangeKind::Added),
                Some(previous) if previous.is_none() || hash.is_none() || *previous != hash => {
                    Some(ChangeKind::Modified)
                }
                Some(_) => None,
            };
            if let Some(kind) = kind {
                events.push(ChangeEvent {
                    kind,
                    id: id.clone(),
                    data: Some(record),
                    timestamp: now,
                });
            }
            current.insert(id.clone(), hash);
            current_order.push(id);
        }

        for id in &self.previous_order {
            if !current.contains_key(id) {
                events.push(ChangeEvent {
                    kind: ChangeKind::Removed,
                    id: id.clone(),
                    data: None,
                    timestamp: now,
                });
            }
        }

        self.previous = current;
        self.previous_order = current_order;
        events
    }
}

fn content_hash<T: Serialize>(record: &T) -> Option<ContentHash> {
    let bytes = serde_json::to_vec(record).ok()?;
    Some(Sha256::digest(&bytes).into())
}
