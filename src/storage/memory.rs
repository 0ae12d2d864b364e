//! In-memory storage engine.
//!
//! Keeps every entity's events and snapshots in process-local maps. Suitable
//! for tests and single-process deployments that don't need
//! durability. Committed events are also broadcast to [`watch`] streams.
//!
//! [`watch`]: MemoryStorage::watch

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use super::{Loaded, StorageEngine};
use crate::error::StorageError;
use crate::event::Event;
use crate::snapshot::Snapshot;

/// Buffered committed events per watcher before the slowest one starts
/// losing them.
const WATCH_BUFFER_CAPACITY: usize = 1024;

/// In-memory [`StorageEngine`].
///
/// `Clone` is cheap and clones share the same data.
///
/// Saves are checked for revision continuity: a batch whose first revision
/// is not the next one expected for its entity is rejected with
/// [`StorageError::Conflict`] and nothing is persisted. Events with an empty
/// entity id are dropped and left out of the committed result.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<Event>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, Vec<Event>>,
    snapshots: HashMap<String, Vec<Snapshot>>,
}

impl Inner {
    /// Revision the next committed event for `id` must carry.
    fn next_revision(&self, id: &str) -> u64 {
        let last_event = self
            .events
            .get(id)
            .and_then(|events| events.last())
            .map_or(0, |event| event.revision);
        let last_snapshot = self
            .snapshots
            .get(id)
            .and_then(|snaps| snaps.last())
            .map_or(0, |snap| snap.revision);
        last_event.max(last_snapshot) + 1
    }
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_BUFFER_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
        }
    }

    /// Stream of every event committed from now on, across all entities.
    ///
    /// A watcher that falls more than the buffer size behind silently skips
    /// the events it missed.
    pub fn watch(&self) -> impl Stream<Item = Event> + Send + Unpin + 'static {
        BroadcastStream::new(self.changes.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(error = %err, "storage watcher lagged");
                None
            }
        })
    }

    /// All stored events for `id`, including those covered by snapshots.
    pub fn events(&self, id: &str) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.events.get(id).cloned().unwrap_or_default()
    }

    /// All stored snapshots for `id`, oldest first.
    pub fn snapshots(&self, id: &str) -> Vec<Snapshot> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.snapshots.get(id).cloned().unwrap_or_default()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage").finish_non_exhaustive()
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn load(&self, id: &str) -> Result<Loaded, StorageError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = inner.snapshots.get(id).and_then(|snaps| snaps.last()).cloned();
        let after = snapshot.as_ref().map_or(0, |snap| snap.revision);
        let events = inner
            .events
            .get(id)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.revision > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        tracing::trace!(entity_id = %id, snapshot = ?snapshot.as_ref().map(|s| s.revision), "loaded from memory");
        Ok(Loaded { events, snapshot })
    }

    async fn save(
        &self,
        events: Vec<Event>,
        snapshot: Option<Snapshot>,
    ) -> Result<Vec<Event>, StorageError> {
        let requested = events.len();
        let committed: Vec<Event> = events
            .into_iter()
            .filter(|event| !event.entity_id.is_empty())
            .collect();
        // The snapshot describes the requested batch, not a filtered one.
        let snapshot = snapshot.filter(|_| committed.len() == requested);

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        // Validate the whole batch before touching anything.
        let mut expected: HashMap<&str, u64> = HashMap::new();
        for event in &committed {
            let next = expected
                .entry(event.entity_id.as_str())
                .or_insert_with(|| inner.next_revision(&event.entity_id));
            if event.revision != *next {
                return Err(StorageError::Conflict {
                    id: event.entity_id.clone(),
                    expected: *next,
                    actual: event.revision,
                });
            }
            *next += 1;
        }

        for event in &committed {
            inner
                .events
                .entry(event.entity_id.clone())
                .or_default()
                .push(event.clone());
        }
        if let Some(snapshot) = snapshot.filter(Snapshot::is_usable) {
            inner
                .snapshots
                .entry(snapshot.id.clone())
                .or_default()
                .push(snapshot);
        }
        drop(inner);

        for event in &committed {
            // No receivers is fine.
            let _ = self.changes.send(event.clone());
        }

        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::command::EntityRef;

    fn event(id: &str, revision: u64) -> Event {
        Event {
            kind: "incremented".into(),
            payload: json!({"value": 1}),
            meta: Default::default(),
            id: Uuid::new_v4(),
            entity_id: id.into(),
            entity: EntityRef {
                name: String::new(),
                id: id.into(),
            },
            causation_id: Uuid::new_v4(),
            revision,
            timestamp: 0,
            user: None,
        }
    }

    #[tokio::test]
    async fn load_unknown_entity_is_empty() {
        let storage = MemoryStorage::new();
        let loaded = storage.load("nobody").await.expect("load should succeed");
        assert_eq!(loaded, Loaded::default());
    }

    #[tokio::test]
    async fn save_then_load_returns_events_in_order() {
        let storage = MemoryStorage::new();
        storage
            .save(vec![event("a", 1), event("a", 2)], None)
            .await
            .expect("save should succeed");
        storage.save(vec![event("a", 3)], None).await.unwrap();

        let loaded = storage.load("a").await.unwrap();
        let revisions: Vec<u64> = loaded.events.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
        assert!(loaded.snapshot.is_none());
    }

    #[tokio::test]
    async fn load_returns_only_events_after_snapshot() {
        let storage = MemoryStorage::new();
        let batch: Vec<Event> = (1..=5).map(|r| event("a", r)).collect();
        storage
            .save(batch, Some(Snapshot::new("a", 3, json!({"value": 3}))))
            .await
            .unwrap();

        let loaded = storage.load("a").await.unwrap();
        assert_eq!(loaded.snapshot.map(|s| s.revision), Some(3));
        let revisions: Vec<u64> = loaded.events.iter().map(|e| e.revision).collect();
        assert_eq!(revisions, vec![4, 5]);
    }

    #[tokio::test]
    async fn gap_in_revisions_is_rejected_atomically() {
        let storage = MemoryStorage::new();
        storage.save(vec![event("a", 1)], None).await.unwrap();

        let err = storage
            .save(vec![event("a", 2), event("a", 4)], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Conflict {
                expected: 3,
                actual: 4,
                ..
            }
        ));
        assert_eq!(storage.events("a").len(), 1, "nothing from the batch persisted");
    }

    #[tokio::test]
    async fn events_without_entity_are_not_committed() {
        let storage = MemoryStorage::new();
        let committed = storage
            .save(vec![event("", 1), event("a", 1)], None)
            .await
            .unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].entity_id, "a");
    }

    #[tokio::test]
    async fn filtered_batch_drops_its_snapshot() {
        let storage = MemoryStorage::new();
        storage
            .save(
                vec![event("a", 1), event("", 2)],
                Some(Snapshot::new("a", 2, json!({"value": 2}))),
            )
            .await
            .unwrap();
        assert_eq!(storage.events("a").len(), 1);
        assert!(storage.snapshots("a").is_empty());
    }

    #[tokio::test]
    async fn unusable_snapshots_are_ignored() {
        let storage = MemoryStorage::new();
        storage
            .save(vec![event("a", 1)], Some(Snapshot::new("a", 0, json!({}))))
            .await
            .unwrap();
        assert!(storage.snapshots("a").is_empty());
    }

    #[tokio::test]
    async fn watch_sees_committed_events() {
        let storage = MemoryStorage::new();
        let mut changes = storage.watch();

        storage
            .save(vec![event("a", 1), event("b", 1)], None)
            .await
            .unwrap();

        let first = changes.next().await.expect("first change");
        let second = changes.next().await.expect("second change");
        assert_eq!(first.entity_id, "a");
        assert_eq!(second.entity_id, "b");
    }

    #[tokio::test]
    async fn clones_share_data() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.save(vec![event("a", 1)], None).await.unwrap();
        assert_eq!(other.events("a").len(), 1);
    }
}
