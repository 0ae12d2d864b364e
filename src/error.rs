//! Crate-level error types for command validation, storage, and dispatch.

use std::io;
use std::sync::Arc;

/// Boxed error returned by user-supplied deciders, reducers, and storage
/// backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A command or event did not have the shape the engine requires.
///
/// Raised before anything reaches storage, so a command rejected with a
/// `ShapeError` is never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    /// The command was not a keyed mapping.
    #[error("command must be a plain object")]
    CommandNotObject,

    /// The command `type` is missing, empty, or not a string.
    #[error("command must have a valid type")]
    MissingType,

    /// The command `payload` is missing or not a keyed mapping.
    #[error("command must have a payload object")]
    PayloadNotObject,

    /// The payload does not carry the entity id under the configured key.
    #[error("an entity id is required in command payload under `{key}`")]
    MissingId {
        /// The configured id key (e.g. `"id"`).
        key: String,
    },

    /// A decider produced something that is not a keyed mapping.
    #[error("event must be a plain object")]
    EventNotObject,

    /// A decider produced an event without a non-empty string `type`.
    #[error("event must have a valid type")]
    EventMissingType,

    /// A decider produced an event without a `payload`.
    #[error("event must have a payload")]
    EventMissingPayload,
}

/// Error raised by a [`StorageEngine`](crate::StorageEngine) while loading or
/// saving.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored data could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The batch does not continue the stored revision sequence.
    ///
    /// Nothing from the batch was persisted.
    #[error("revision conflict for `{id}`: expected {expected}, got {actual}")]
    Conflict {
        /// Entity id of the rejected batch.
        id: String,
        /// The revision the store expected next.
        expected: u64,
        /// The revision carried by the batch.
        actual: u64,
    },

    /// The entity id cannot be used by this backend.
    #[error("invalid entity id: {0:?}")]
    InvalidId(String),

    /// Any other backend failure.
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StorageError {
    /// Wrap an arbitrary backend error.
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }
}

/// Error returned when dispatching a command fails.
///
/// `Clone` because a single load failure is delivered to every command that
/// was queued behind that load; collaborator errors are kept behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    /// The command, or an event produced for it, was malformed.
    #[error(transparent)]
    Shape(#[from] ShapeError),

    /// The decider rejected the command.
    #[error("decider failed: {0}")]
    Decider(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// The reducer failed while folding an event.
    #[error("reducer failed: {0}")]
    Reducer(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    /// Loading or saving through the storage engine failed.
    #[error("storage failed: {0}")]
    Storage(#[source] Arc<StorageError>),

    /// The entity context stopped before answering.
    #[error("entity context is no longer running")]
    ContextGone,
}

impl DispatchError {
    pub(crate) fn decider(err: BoxError) -> Self {
        Self::Decider(Arc::from(err))
    }

    pub(crate) fn reducer(err: BoxError) -> Self {
        Self::Reducer(Arc::from(err))
    }

    /// Returns `true` if the failure came from the storage backend rather
    /// than from caller input or domain logic.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<StorageError> for DispatchError {
    fn from(err: StorageError) -> Self {
        Self::Storage(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_error_messages_name_the_contract() {
        assert_eq!(
            ShapeError::MissingType.to_string(),
            "command must have a valid type"
        );
        assert_eq!(
            ShapeError::PayloadNotObject.to_string(),
            "command must have a payload object"
        );
        let err = ShapeError::MissingId { key: "id".into() };
        assert!(err.to_string().contains("`id`"));
    }

    #[test]
    fn dispatch_error_from_shape_is_transparent() {
        let err = DispatchError::from(ShapeError::EventMissingPayload);
        assert_eq!(err.to_string(), "event must have a payload");
        assert!(!err.is_storage());
    }

    #[test]
    fn dispatch_error_from_storage() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "log missing");
        let err = DispatchError::from(StorageError::from(io_err));
        assert!(err.is_storage());
        assert!(err.to_string().contains("log missing"));
    }

    #[test]
    fn decider_error_keeps_source_message() {
        let err = DispatchError::decider("insufficient funds".into());
        assert_eq!(err.to_string(), "decider failed: insufficient funds");
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn storage_conflict_display() {
        let err = StorageError::Conflict {
            id: "a-1".into(),
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "revision conflict for `a-1`: expected 3, got 5"
        );
    }

    // Errors cross the context task boundary through tokio channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<DispatchError>();
            assert_send_sync::<StorageError>();
            assert_send_sync::<ShapeError>();
        }
    };
}
