//! Snapshots: compaction checkpoints of materialized entity state.
//!
//! A snapshot records the state of an entity at a given revision so that
//! replay only has to fold the events written after it. On disk (see
//! [`FileStorage`](crate::FileStorage)) snapshots live at
//! `<base_dir>/snapshots/<entity_id>/snapshot.json` and are written
//! atomically via a temp-rename.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State of one entity at `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Entity id.
    pub id: String,
    /// Revision of the last event folded into `state`.
    pub revision: u64,
    /// Materialized state at `revision`.
    pub state: Value,
}

impl Snapshot {
    /// Create a snapshot.
    pub fn new(id: impl Into<String>, revision: u64, state: Value) -> Self {
        Self {
            id: id.into(),
            revision,
            state,
        }
    }

    /// Whether the snapshot can stand in for history.
    ///
    /// Requires a non-empty `id` and a revision of at least 1; a snapshot at
    /// revision 0 describes no events and is treated as absent.
    pub fn is_usable(&self) -> bool {
        !self.id.is_empty() && self.revision > 0
    }

    /// Leniently read a snapshot from an untyped document.
    ///
    /// Accepts `version` as an alias for `revision`. Returns `None` when the
    /// document lacks an id or a revision, or describes an unusable
    /// snapshot.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        let id = match obj.remove("id")? {
            Value::String(id) => id,
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let revision = obj
            .remove("revision")
            .or_else(|| obj.remove("version"))?
            .as_u64()?;
        let state = obj.remove("state").unwrap_or(Value::Null);

        Some(Self::new(id, revision, state)).filter(Self::is_usable)
    }
}

/// Compute the filesystem path for an entity's snapshot file.
///
/// # Returns
///
/// `<base_dir>/snapshots/<entity_id>/snapshot.json`
pub fn snapshot_path(base_dir: &Path, entity_id: &str) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(entity_id)
        .join("snapshot.json")
}

/// Save a snapshot atomically to disk.
///
/// Writes `snapshot.json.tmp` next to the target and renames it into place
/// so readers never observe a partially written file.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, writing, or renaming fails.
pub fn save_snapshot(base_dir: &Path, snapshot: &Snapshot) -> io::Result<()> {
    let path = snapshot_path(base_dir, &snapshot.id);
    let Some(dir) = path.parent() else {
        return Err(io::Error::other("snapshot path has no parent directory"));
    };
    std::fs::create_dir_all(dir)?;

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Load an entity's snapshot from disk.
///
/// # Returns
///
/// - `Ok(Some(snapshot))` if the file exists and holds a usable snapshot.
/// - `Ok(None)` if the file is missing, corrupt, or unusable. Corrupt files
///   are logged with `tracing::warn!`.
///
/// # Errors
///
/// Returns `io::Error` only for unexpected I/O failures.
pub fn load_snapshot(base_dir: &Path, entity_id: &str) -> io::Result<Option<Snapshot>> {
    let path = snapshot_path(base_dir, entity_id);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(doc) => Ok(Snapshot::from_value(doc)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize snapshot; treating as absent"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usable_requires_id_and_positive_revision() {
        assert!(Snapshot::new("a", 1, json!({})).is_usable());
        assert!(!Snapshot::new("", 3, json!({})).is_usable());
        assert!(!Snapshot::new("a", 0, json!({})).is_usable());
    }

    #[test]
    fn from_value_accepts_version_alias() {
        let snap = Snapshot::from_value(json!({"id": "a", "version": 4, "state": {"v": 1}}))
            .expect("usable snapshot");
        assert_eq!(snap.revision, 4);
        assert_eq!(snap.state, json!({"v": 1}));
    }

    #[test]
    fn from_value_rejects_incomplete_documents() {
        assert!(Snapshot::from_value(json!({"revision": 2})).is_none());
        assert!(Snapshot::from_value(json!({"id": "a"})).is_none());
        assert!(Snapshot::from_value(json!({"id": "a", "revision": 0})).is_none());
        assert!(Snapshot::from_value(json!({"id": "a", "revision": "2"})).is_none());
        assert!(Snapshot::from_value(json!("snapshot")).is_none());
    }

    #[test]
    fn snapshot_path_returns_expected_path() {
        let path = snapshot_path(Path::new("/data/app"), "c-1");
        assert_eq!(path, PathBuf::from("/data/app/snapshots/c-1/snapshot.json"));
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let snap = Snapshot::new("c-1", 7, json!({"value": 42}));

        save_snapshot(dir.path(), &snap).expect("save should succeed");
        let loaded = load_snapshot(dir.path(), "c-1")
            .expect("load should succeed")
            .expect("snapshot should exist");

        assert_eq!(loaded, snap);
        assert!(!snapshot_path(dir.path(), "c-1").with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_or_corrupt_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        assert!(load_snapshot(dir.path(), "nobody").unwrap().is_none());

        let path = snapshot_path(dir.path(), "c-bad");
        std::fs::create_dir_all(path.parent().unwrap()).expect("create dir");
        std::fs::write(&path, b"not json").expect("write corrupt file");
        assert!(load_snapshot(dir.path(), "c-bad").unwrap().is_none());
    }
}
