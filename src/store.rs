//! Top-level entry point that routes commands to per-entity contexts.
//!
//! A [`CommandStore`] is built with [`CommandStoreBuilder`] from a decider,
//! a reducer, and optionally a storage engine and event bus. It validates
//! commands, spawns one context task per entity id on first use, and caches
//! the handles for the lifetime of the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::{Decider, Reducer};
use crate::bus::{EventBus, Notification, Subscription, Topic};
use crate::command::{Command, CommandRequest, EntityRef};
use crate::context::{ContextHandle, Engine, Status};
use crate::error::DispatchError;
use crate::storage::{MemoryStorage, StorageEngine};

/// Store-wide settings.
///
/// Deserializable so it can be read from a configuration file; missing
/// fields take their defaults.
///
/// # Examples
///
/// ```
/// use entity_store::StoreConfig;
///
/// let config: StoreConfig = serde_json::from_str(r#"{"snapshot_every": 50}"#).unwrap();
/// assert_eq!(config.id_key, "id");
/// assert_eq!(config.snapshot_every, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Payload key that holds the target entity id. Default: `"id"`.
    pub id_key: String,
    /// Entity type name stamped onto commands and events. Default: empty.
    pub entity_name: String,
    /// Take a snapshot every this many revisions; `0` disables snapshots.
    /// Default: `0`.
    pub snapshot_every: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            id_key: "id".to_owned(),
            entity_name: String::new(),
            snapshot_every: 0,
        }
    }
}

/// Routes commands to entity contexts and exposes their state.
///
/// `Clone` is cheap; clones share contexts, storage, and subscribers.
/// Several independent stores may live in one process.
///
/// Must be used from within a tokio runtime.
///
/// # Examples
///
/// ```
/// use entity_store::{CommandRequest, CommandStore, Decision, EventDraft, decider_fn, reducer_fn};
/// use serde_json::{Value, json};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), entity_store::DispatchError> {
/// let decider = decider_fn(|_state: &Value, cmd| {
///     Ok(EventDraft::new("renamed", json!({"name": cmd.payload["name"]})).into())
/// });
/// let reducer = reducer_fn(|_state: &Value, event| Ok(event.payload.clone()));
/// let store = CommandStore::builder(decider, reducer).build();
///
/// let state = store
///     .dispatch(CommandRequest::new("rename", json!({"id": "u-1", "name": "ada"})))
///     .await?;
/// assert_eq!(state["name"], "ada");
/// assert_eq!(state["revision"], 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CommandStore {
    engine: Arc<Engine>,
    contexts: Arc<Mutex<HashMap<String, Arc<ContextHandle>>>>,
}

impl std::fmt::Debug for CommandStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStore")
            .field("config", &self.engine.config)
            .finish_non_exhaustive()
    }
}

impl CommandStore {
    /// Start building a store around `decider` and `reducer`.
    pub fn builder<D, R>(decider: D, reducer: R) -> CommandStoreBuilder
    where
        D: Decider,
        R: Reducer,
    {
        CommandStoreBuilder {
            decider: Arc::new(decider),
            reducer: Arc::new(reducer),
            storage: None,
            bus: None,
            config: StoreConfig::default(),
        }
    }

    /// Validate and execute one command.
    ///
    /// Commands for the same entity run strictly in the order their
    /// `dispatch` futures are first polled, including those that arrive
    /// while the entity is still loading.
    ///
    /// # Returns
    ///
    /// The entity state after the command. A command producing no events
    /// returns the unchanged state.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Shape`] -- the command or a produced event is
    ///   malformed. Raised before anything reaches storage.
    /// * [`DispatchError::Decider`] / [`DispatchError::Reducer`] -- domain
    ///   code failed; nothing was persisted.
    /// * [`DispatchError::Storage`] -- loading or saving failed; state and
    ///   revision are unchanged.
    /// * [`DispatchError::ContextGone`] -- the entity's task stopped; the
    ///   next call starts a fresh one.
    pub async fn dispatch(&self, request: CommandRequest) -> Result<Arc<Value>, DispatchError> {
        let command = self.validate(request)?;
        self.execute(command).await
    }

    /// Execute several commands strictly one after another.
    ///
    /// Every command is validated before any of them runs, so a malformed
    /// entry anywhere in the list means none are applied. Order holds
    /// across different entity ids. Execution stops at the first failure.
    ///
    /// # Returns
    ///
    /// The state produced by the last command, or `None` for an empty list.
    ///
    /// # Errors
    ///
    /// The first error encountered, as for [`dispatch`](CommandStore::dispatch).
    pub async fn dispatch_all<I>(&self, requests: I) -> Result<Option<Arc<Value>>, DispatchError>
    where
        I: IntoIterator<Item = CommandRequest>,
    {
        let commands = requests
            .into_iter()
            .map(|request| self.validate(request))
            .collect::<Result<Vec<_>, _>>()?;

        let mut last = None;
        for command in commands {
            last = Some(self.execute(command).await?);
        }
        Ok(last)
    }

    /// Current state of entity `id`, or `None` if it is not loaded.
    ///
    /// The returned value is shared and immutable; later commands never
    /// change it.
    pub fn get_state(&self, id: &str) -> Option<Arc<Value>> {
        self.lock_contexts().get(id)?.view().state
    }

    /// States of every loaded entity, keyed by id.
    pub fn states(&self) -> HashMap<String, Arc<Value>> {
        self.lock_contexts()
            .iter()
            .filter_map(|(id, handle)| Some((id.clone(), handle.view().state?)))
            .collect()
    }

    /// Load status of entity `id`. Unknown ids are [`Status::Empty`].
    pub fn status(&self, id: &str) -> Status {
        self.lock_contexts()
            .get(id)
            .map_or(Status::Empty, |handle| handle.view().status)
    }

    /// Revision of the last event applied to entity `id`, `0` if none.
    pub fn revision(&self, id: &str) -> u64 {
        self.lock_contexts()
            .get(id)
            .map_or(0, |handle| handle.view().revision)
    }

    /// Load entity `id` from storage without executing a command.
    ///
    /// Does nothing if the entity is already loaded.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Storage`] or [`DispatchError::Reducer`] if loading
    /// or replay fails; the entity stays unloaded.
    pub async fn preload(&self, id: &str) -> Result<(), DispatchError> {
        self.context(id).preload().await
    }

    /// Drop the cached state of entity `id`.
    ///
    /// The next command for `id` loads it from storage again. If the entity
    /// is loading, the reset waits until the load and every command queued
    /// behind it have finished. A context nobody else is using is evicted
    /// afterwards, which stops its task.
    pub async fn clear_state(&self, id: &str) {
        let handle = self.lock_contexts().get(id).cloned();
        let Some(handle) = handle else {
            return;
        };
        handle.clear().await;
        drop(handle);

        let mut contexts = self.lock_contexts();
        // Handles are only cloned under this lock, so a count of one means
        // no command is in flight on this context.
        let evict = contexts
            .get(id)
            .is_some_and(|handle| Arc::strong_count(handle) == 1 || !handle.is_alive());
        if evict {
            contexts.remove(id);
        }
        tracing::debug!(entity_id = %id, evicted = evict, "entity state cleared");
    }

    /// Drop the cached state of every entity.
    pub async fn clear_all(&self) {
        let ids: Vec<String> = self.lock_contexts().keys().cloned().collect();
        for id in ids {
            self.clear_state(&id).await;
        }
    }

    /// Subscribe to every committed event.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.engine.bus.subscribe(Topic::All, handler)
    }

    /// Subscribe to committed events of type `kind`.
    pub fn subscribe_to<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.engine.bus.subscribe(Topic::event_type(kind), handler)
    }

    /// Subscribe to committed events of entity `id`.
    pub fn subscribe_entity<F>(&self, id: &str, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.engine.bus.subscribe(Topic::entity(id), handler)
    }

    /// A handle scoped to entity `id`.
    pub fn entity(&self, id: impl Into<String>) -> EntityHandle {
        EntityHandle {
            store: self.clone(),
            id: id.into(),
        }
    }

    /// The event bus notifications are published on.
    pub fn bus(&self) -> &EventBus {
        &self.engine.bus
    }

    /// The storage engine behind this store.
    pub fn storage(&self) -> Arc<dyn StorageEngine> {
        Arc::clone(&self.engine.storage)
    }

    /// The store's configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.engine.config
    }

    fn validate(&self, request: CommandRequest) -> Result<Command, DispatchError> {
        let config = &self.engine.config;
        Ok(request.validate(&config.id_key, &config.entity_name)?)
    }

    async fn execute(&self, command: Command) -> Result<Arc<Value>, DispatchError> {
        let handle = self.context(command.entity_id());
        handle.execute(command).await
    }

    /// Get the context for `id`, spawning it if it is missing or its task
    /// has stopped.
    fn context(&self, id: &str) -> Arc<ContextHandle> {
        let mut contexts = self.lock_contexts();
        if let Some(handle) = contexts.get(id)
            && handle.is_alive()
        {
            return Arc::clone(handle);
        }

        tracing::debug!(entity_id = %id, "spawning entity context");
        let entity = EntityRef {
            name: self.engine.config.entity_name.clone(),
            id: id.to_owned(),
        };
        let handle = Arc::new(ContextHandle::spawn(entity, Arc::clone(&self.engine)));
        contexts.insert(id.to_owned(), Arc::clone(&handle));
        handle
    }

    fn lock_contexts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ContextHandle>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`CommandStore`].
///
/// # Examples
///
/// ```
/// use entity_store::{CommandStore, Decision, EventBus, MemoryStorage, decider_fn, reducer_fn};
/// use serde_json::{Value, json};
///
/// let store = CommandStore::builder(
///     decider_fn(|_: &Value, _| Ok(Decision::none())),
///     reducer_fn(|_: &Value, _| Ok(json!({}))),
/// )
/// .id_key("account")
/// .entity_name("account")
/// .snapshot_every(100)
/// .storage(MemoryStorage::new())
/// .event_bus(EventBus::new())
/// .build();
///
/// assert_eq!(store.config().id_key, "account");
/// ```
pub struct CommandStoreBuilder {
    decider: Arc<dyn Decider>,
    reducer: Arc<dyn Reducer>,
    storage: Option<Arc<dyn StorageEngine>>,
    bus: Option<EventBus>,
    config: StoreConfig,
}

impl CommandStoreBuilder {
    /// Set the payload key holding the entity id.
    pub fn id_key(mut self, key: impl Into<String>) -> Self {
        self.config.id_key = key.into();
        self
    }

    /// Set the entity type name stamped onto commands and events.
    pub fn entity_name(mut self, name: impl Into<String>) -> Self {
        self.config.entity_name = name.into();
        self
    }

    /// Take a snapshot every `revisions` revisions. `0` disables snapshots.
    pub fn snapshot_every(mut self, revisions: u64) -> Self {
        self.config.snapshot_every = revisions;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist through `storage` instead of a fresh [`MemoryStorage`].
    pub fn storage<S: StorageEngine>(mut self, storage: S) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Publish notifications on `bus` instead of a private one.
    ///
    /// Sharing a bus lets several stores feed the same subscribers.
    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Build the store.
    pub fn build(self) -> CommandStore {
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let engine = Engine {
            decider: self.decider,
            reducer: self.reducer,
            storage,
            bus: self.bus.unwrap_or_default(),
            config: self.config,
        };
        CommandStore {
            engine: Arc::new(engine),
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// A [`CommandStore`] view scoped to one entity id.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    store: CommandStore,
    id: String,
}

impl EntityHandle {
    /// The entity id this handle targets.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dispatch `request` to this entity.
    ///
    /// The entity id is written into the payload under the configured key
    /// unless the payload already has one; a `null` payload becomes an
    /// object holding just the id.
    ///
    /// # Errors
    ///
    /// As for [`CommandStore::dispatch`].
    pub async fn dispatch(&self, request: CommandRequest) -> Result<Arc<Value>, DispatchError> {
        self.store.dispatch(self.addressed(request)).await
    }

    /// Dispatch several commands to this entity, in order.
    ///
    /// # Errors
    ///
    /// As for [`CommandStore::dispatch_all`].
    pub async fn dispatch_all<I>(&self, requests: I) -> Result<Option<Arc<Value>>, DispatchError>
    where
        I: IntoIterator<Item = CommandRequest>,
    {
        let requests: Vec<CommandRequest> = requests
            .into_iter()
            .map(|request| self.addressed(request))
            .collect();
        self.store.dispatch_all(requests).await
    }

    /// Current state, or `None` if not loaded.
    pub fn get_state(&self) -> Option<Arc<Value>> {
        self.store.get_state(&self.id)
    }

    /// Load status.
    pub fn status(&self) -> Status {
        self.store.status(&self.id)
    }

    /// Revision of the last applied event.
    pub fn revision(&self) -> u64 {
        self.store.revision(&self.id)
    }

    /// Load from storage without running a command.
    ///
    /// # Errors
    ///
    /// As for [`CommandStore::preload`].
    pub async fn preload(&self) -> Result<(), DispatchError> {
        self.store.preload(&self.id).await
    }

    /// Drop the cached state.
    pub async fn clear_state(&self) {
        self.store.clear_state(&self.id).await;
    }

    /// Subscribe to this entity's events, optionally only those of type
    /// `kind`.
    pub fn subscribe<F>(&self, kind: Option<&str>, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let kind = kind.map(str::to_owned);
        self.store.subscribe_entity(&self.id, move |notification| {
            if kind
                .as_deref()
                .is_none_or(|kind| kind == notification.event.kind)
            {
                handler(notification);
            }
        })
    }

    fn addressed(&self, mut request: CommandRequest) -> CommandRequest {
        let id_key = self.store.config().id_key.as_str();
        match &mut request.payload {
            Value::Object(payload) => {
                payload
                    .entry(id_key)
                    .or_insert_with(|| Value::String(self.id.clone()));
            }
            payload @ Value::Null => {
                let mut map = serde_json::Map::new();
                map.insert(id_key.to_owned(), Value::String(self.id.clone()));
                *payload = Value::Object(map);
            }
            _ => {}
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::aggregate::test_fixtures::{counter_decider, counter_reducer};

    fn store() -> CommandStore {
        CommandStore::builder(counter_decider(), counter_reducer()).build()
    }

    fn increment(id: &str, value: i64) -> CommandRequest {
        CommandRequest::new("increment", json!({"id": id, "value": value}))
    }

    #[tokio::test]
    async fn dispatch_returns_new_state() {
        let store = store();
        let state = store.dispatch(increment("1", 10)).await.unwrap();
        assert_eq!(*state, json!({"id": "1", "value": 10, "revision": 1}));
        assert_eq!(store.get_state("1"), Some(state));
        assert_eq!(store.status("1"), Status::Loaded);
        assert_eq!(store.revision("1"), 1);
    }

    #[tokio::test]
    async fn unknown_entity_has_no_state() {
        let store = store();
        assert!(store.get_state("nobody").is_none());
        assert_eq!(store.status("nobody"), Status::Empty);
        assert_eq!(store.revision("nobody"), 0);
    }

    #[tokio::test]
    async fn missing_id_is_rejected_before_spawning() {
        let store = store();
        let err = store
            .dispatch(CommandRequest::new("increment", json!({"value": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Shape(_)));
        assert!(store.states().is_empty());
    }

    #[tokio::test]
    async fn dispatch_all_validates_everything_first() {
        let storage = MemoryStorage::new();
        let store = CommandStore::builder(counter_decider(), counter_reducer())
            .storage(storage.clone())
            .build();

        let err = store
            .dispatch_all(vec![
                increment("1", 1),
                CommandRequest::new("increment", json!("not an object")),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Shape(_)));
        assert!(storage.events("1").is_empty());
    }

    #[tokio::test]
    async fn dispatch_all_of_nothing_is_none() {
        let result = store().dispatch_all(Vec::new()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn states_lists_loaded_entities() {
        let store = store();
        store
            .dispatch_all(vec![increment("a", 1), increment("b", 2)])
            .await
            .unwrap();

        let states = store.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states["a"]["value"], 1);
        assert_eq!(states["b"]["value"], 2);
    }

    #[tokio::test]
    async fn custom_id_key_and_entity_name() {
        let storage = MemoryStorage::new();
        let store = CommandStore::builder(counter_decider(), counter_reducer())
            .config(StoreConfig {
                id_key: "counter".into(),
                entity_name: "counter".into(),
                snapshot_every: 0,
            })
            .storage(storage.clone())
            .build();

        store
            .dispatch(CommandRequest::new("increment", json!({"counter": 9, "value": 2})))
            .await
            .unwrap();

        let events = storage.events("9");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity.name, "counter");
        assert_eq!(store.get_state("9").unwrap()["value"], 2);
    }

    #[tokio::test]
    async fn entity_handle_fills_in_id() {
        let store = store();
        let counter = store.entity("c-7");

        counter
            .dispatch(CommandRequest::new("increment", json!({"value": 3})))
            .await
            .unwrap();
        let state = counter
            .dispatch(CommandRequest::new("noop", Value::Null))
            .await
            .unwrap();

        assert_eq!(state["id"], "c-7");
        assert_eq!(counter.get_state().unwrap()["value"], 3);
        assert_eq!(counter.revision(), 1);
    }

    #[tokio::test]
    async fn entity_subscription_filters_by_type() {
        let store = store();
        let counter = store.entity("1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = counter.subscribe(Some("decremented"), move |n| {
            sink.lock().unwrap().push(n.event.kind.clone());
        });

        counter
            .dispatch_all(vec![
                CommandRequest::new("increment", json!({"value": 1})),
                CommandRequest::new("decrement", json!({"value": 1})),
            ])
            .await
            .unwrap();
        store.dispatch(CommandRequest::new("decrement", json!({"id": "2"}))).await.unwrap();
        store.bus().flush().await;

        assert_eq!(*seen.lock().unwrap(), vec!["decremented".to_owned()]);
    }

    #[tokio::test]
    async fn clear_all_drops_every_state() {
        let store = store();
        store
            .dispatch_all(vec![increment("a", 1), increment("b", 1)])
            .await
            .unwrap();
        store.clear_all().await;
        assert!(store.states().is_empty());
        assert_eq!(store.status("a"), Status::Empty);
    }

    #[tokio::test]
    async fn clear_evicts_contexts_nobody_holds() {
        let store = store();
        store
            .dispatch_all(vec![increment("a", 1), increment("b", 1)])
            .await
            .unwrap();

        let held = store.context("a");
        store.clear_all().await;
        {
            let contexts = store.lock_contexts();
            assert!(!contexts.contains_key("b"));
            assert!(contexts.contains_key("a"), "a context in use stays registered");
        }
        assert_eq!(held.view().status, Status::Empty);

        drop(held);
        store.clear_state("a").await;
        assert!(store.lock_contexts().is_empty());

        let state = store.dispatch(increment("a", 2)).await.unwrap();
        assert_eq!(*state, json!({"id": "a", "value": 3, "revision": 2}));
    }

    #[test]
    fn config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.id_key, "id");
        assert!(config.entity_name.is_empty());
        assert_eq!(config.snapshot_every, 0);
    }
}
