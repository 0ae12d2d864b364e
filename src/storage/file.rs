//! File-backed storage engine.
//!
//! On-disk layout:
//!
//! ```text
//! <base_dir>/
//!     streams/
//!         <entity_id>/
//!             events.jsonl      -- one JSON event per line, revision order
//!     snapshots/
//!         <entity_id>/
//!             snapshot.json     -- latest snapshot, replaced atomically
//! ```
//!
//! Blocking filesystem work runs on tokio's blocking pool.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{Loaded, StorageEngine};
use crate::error::StorageError;
use crate::event::Event;
use crate::snapshot::{Snapshot, load_snapshot, save_snapshot};

/// File-backed [`StorageEngine`].
///
/// Each save appends the whole batch to the entity's log with a single
/// write followed by `fsync`, then replaces the snapshot file if one was
/// given. The log is the source of truth: a failed append is truncated back
/// to its previous length, and a failed snapshot write is logged while the
/// save still succeeds. Events are written before the snapshot so a
/// snapshot never refers to revisions missing from the log.
///
/// Entity ids are used as directory names; ids that are empty, contain a
/// path separator, or equal `.`/`..` are rejected with
/// [`StorageError::InvalidId`].
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: Arc<PathBuf>,
}

impl FileStorage {
    /// Create a storage engine rooted at `base_dir`.
    ///
    /// The directory is created lazily on first save.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Arc::new(base_dir.into()),
        }
    }

    /// Returns the root directory of this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path of an entity's event log.
    ///
    /// # Returns
    ///
    /// `<base_dir>/streams/<entity_id>/events.jsonl`
    pub fn log_path(&self, entity_id: &str) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(entity_id)
            .join("events.jsonl")
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StorageError> + Send + 'static,
    {
        let base_dir = Arc::clone(&self.base_dir);
        tokio::task::spawn_blocking(move || f(&base_dir))
            .await
            .map_err(|e| StorageError::Io(io::Error::other(format!("storage task failed: {e}"))))?
    }
}

fn check_id(id: &str) -> Result<(), StorageError> {
    let bad = id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']);
    if bad {
        return Err(StorageError::InvalidId(id.to_owned()));
    }
    Ok(())
}

fn read_log(path: &Path, after: u64) -> Result<Vec<Event>, StorageError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut events = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)?;
        if event.revision > after {
            events.push(event);
        }
    }
    Ok(events)
}

/// Append `events` to the log at `path`, returning its previous length.
fn append_log(path: &Path, events: &[Event]) -> Result<u64, StorageError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    // Encode the whole batch up front so a serialization failure writes
    // nothing.
    let mut buf = Vec::new();
    for event in events {
        serde_json::to_writer(&mut buf, event)?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    if let Err(err) = file.write_all(&buf).and_then(|()| file.sync_data()) {
        // Never leave a partial line behind for the next load to trip on.
        truncate_log(path, len);
        return Err(err.into());
    }
    Ok(len)
}

fn truncate_log(path: &Path, len: u64) {
    let rolled_back = OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|file| file.set_len(len).and_then(|()| file.sync_data()));
    if let Err(err) = rolled_back {
        tracing::error!(
            path = %path.display(),
            error = %err,
            "failed to roll back appended events"
        );
    }
}

#[async_trait]
impl StorageEngine for FileStorage {
    async fn load(&self, id: &str) -> Result<Loaded, StorageError> {
        check_id(id)?;
        let id = id.to_owned();
        let log_path = self.log_path(&id);

        self.blocking(move |base_dir| {
            let snapshot = load_snapshot(base_dir, &id)?.filter(|snap| snap.id == id);
            let after = snapshot.as_ref().map_or(0, |snap| snap.revision);
            let events = read_log(&log_path, after)?;
            tracing::debug!(
                entity_id = %id,
                events = events.len(),
                snapshot = ?snapshot.as_ref().map(|s| s.revision),
                "loaded from disk"
            );
            Ok(Loaded { events, snapshot })
        })
        .await
    }

    async fn save(
        &self,
        events: Vec<Event>,
        snapshot: Option<Snapshot>,
    ) -> Result<Vec<Event>, StorageError> {
        let mut batches: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in &events {
            check_id(&event.entity_id)?;
            batches
                .entry(event.entity_id.clone())
                .or_default()
                .push(event.clone());
        }
        let snapshot = snapshot.filter(Snapshot::is_usable);
        if let Some(snap) = &snapshot {
            check_id(&snap.id)?;
        }
        let this = self.clone();

        self.blocking(move |base_dir| {
            let mut appended: Vec<(PathBuf, u64)> = Vec::with_capacity(batches.len());
            for (id, batch) in &batches {
                let path = this.log_path(id);
                match append_log(&path, batch) {
                    Ok(len) => appended.push((path, len)),
                    Err(err) => {
                        for (path, len) in &appended {
                            truncate_log(path, *len);
                        }
                        return Err(err);
                    }
                }
            }
            if let Some(snap) = &snapshot
                && let Err(err) = save_snapshot(base_dir, snap)
            {
                // The events are durable; the next due snapshot retries.
                tracing::warn!(
                    entity_id = %snap.id,
                    revision = snap.revision,
                    error = %err,
                    "snapshot write failed; events committed without it"
                );
            }
            Ok(events)
        })
        .await
    }
}
