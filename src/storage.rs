//! Storage engine contract and built-in backends.
//!
//! The engine core only talks to [`StorageEngine`]; backends never leak
//! their own types past it. Two backends ship with the crate:
//!
//! - [`MemoryStorage`]: process-local maps, with a change stream.
//! - [`FileStorage`]: JSON-lines event logs and snapshot files on disk.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::event::Event;
use crate::snapshot::Snapshot;

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Result of loading an entity from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Loaded {
    /// Events in strictly increasing revision order. When `snapshot` is
    /// present, only events after its revision.
    pub events: Vec<Event>,
    /// Most recent usable snapshot, if any.
    pub snapshot: Option<Snapshot>,
}

/// Pluggable persistence for event logs and snapshots.
///
/// # Contract
///
/// - [`load`](StorageEngine::load) returns events with strictly increasing
///   revisions; if it returns a snapshot, only events newer than it.
/// - [`save`](StorageEngine::save) is atomic per batch: either every
///   returned event is durable or the call fails. It returns the events it
///   actually committed, which may be fewer than requested if the backend
///   filters some out. The engine folds exactly the returned events.
/// - A backend that filters or rewrites any event of a batch must not
///   persist the snapshot passed with it; that snapshot describes the
///   requested batch.
/// - A snapshot passed to `save` that is not
///   [usable](Snapshot::is_usable) is ignored without error.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Load the snapshot and the events after it for entity `id`.
    async fn load(&self, id: &str) -> Result<Loaded, StorageError>;

    /// Persist `events` and, optionally, a snapshot taken after them.
    async fn save(
        &self,
        events: Vec<Event>,
        snapshot: Option<Snapshot>,
    ) -> Result<Vec<Event>, StorageError>;
}
