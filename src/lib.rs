//! Event-sourced entity store.
//!
//! Consumer code supplies a [`Decider`] (state + command -> events) and a
//! [`Reducer`] (state + event -> patch). A [`CommandStore`] turns commands
//! addressed to entity ids into a durable, revisioned event log and a
//! materialized state per id, loading each entity lazily and exactly once
//! while keeping commands for one id in arrival order.

mod aggregate;
pub use aggregate::{Decider, DeciderFn, Decision, Reducer, ReducerFn, decider_fn, reducer_fn};
mod bus;
pub use bus::{EventBus, Notification, Subscription, Topic};
mod command;
pub use command::{Command, CommandRequest, EntityRef};
mod context;
pub use context::Status;
mod error;
pub use error::{BoxError, DispatchError, ShapeError, StorageError};
mod event;
pub use event::{Event, EventDraft, INIT_EVENT_TYPE};
pub mod merge;
mod snapshot;
pub use snapshot::{Snapshot, load_snapshot, save_snapshot, snapshot_path};
mod storage;
pub use storage::{FileStorage, Loaded, MemoryStorage, StorageEngine};
mod store;
pub use store::{CommandStore, CommandStoreBuilder, EntityHandle, StoreConfig};
