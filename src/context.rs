//! Per-entity context: a task that owns one aggregate's history and state.
//!
//! Every entity id gets its own tokio task that receives messages from an
//! unbounded `mpsc` mailbox and handles them one at a time. The task owns
//! the load status, the command queue used while loading, the folded state,
//! and the revision counter; nothing else ever mutates them.
//!
//! Public surface: [`Status`]. The store talks to contexts through the
//! crate-private [`ContextHandle`].

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::aggregate::{Decider, Reducer};
use crate::bus::{EventBus, Notification};
use crate::command::{Command, EntityRef};
use crate::error::DispatchError;
use crate::event::Event;
use crate::merge::merge;
use crate::snapshot::Snapshot;
use crate::storage::{Loaded, StorageEngine};
use crate::store::StoreConfig;

/// Load status of an entity context.
///
/// ```text
/// Empty -> Loading -> Replaying -> Loaded
///   ^                                |
///   +------------ clear -------------+
/// ```
///
/// A failed load returns the context to `Empty`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// Nothing fetched from storage yet.
    #[default]
    Empty,
    /// A storage load is in flight; commands are queued.
    Loading,
    /// Loaded history is being folded into state.
    Replaying,
    /// Commands execute immediately.
    Loaded,
}

/// Collaborators shared by every context of one store.
pub(crate) struct Engine {
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) reducer: Arc<dyn Reducer>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) bus: EventBus,
    pub(crate) config: StoreConfig,
}

/// Observable part of a context, published after every transition.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextView {
    pub(crate) status: Status,
    pub(crate) state: Option<Arc<Value>>,
    pub(crate) revision: u64,
}

type ExecuteReply = oneshot::Sender<Result<Arc<Value>, DispatchError>>;

enum Message {
    Execute {
        command: Command,
        reply: ExecuteReply,
    },
    Preload {
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

/// Work that arrived while the context was loading.
enum Pending {
    Execute {
        command: Command,
        reply: ExecuteReply,
    },
    Preload {
        reply: oneshot::Sender<Result<(), DispatchError>>,
    },
}

struct EntityContext {
    entity: EntityRef,
    engine: Arc<Engine>,
    status: Status,
    history: Vec<Arc<Event>>,
    queue: VecDeque<Pending>,
    state: Option<Arc<Value>>,
    revision: u64,
    snapshot_revision: u64,
    view: watch::Sender<ContextView>,
}

impl EntityContext {
    fn id(&self) -> &str {
        &self.entity.id
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Execute { command, reply } => {
                    if self.status == Status::Empty {
                        self.queue.push_back(Pending::Execute { command, reply });
                        self.load(&mut rx).await;
                    } else {
                        let result = self.execute(command).await;
                        // The caller may have given up waiting.
                        let _ = reply.send(result);
                    }
                }
                Message::Preload { reply } => {
                    if self.status == Status::Empty {
                        self.queue.push_back(Pending::Preload { reply });
                        self.load(&mut rx).await;
                    } else {
                        let _ = reply.send(Ok(()));
                    }
                }
                Message::Clear { reply } => {
                    self.reset();
                    let _ = reply.send(());
                }
            }
        }
        tracing::trace!(entity_id = %self.entity.id, "context mailbox closed");
    }

    /// Fetch from storage while queueing everything that arrives, then
    /// replay and drain the queue in arrival order.
    ///
    /// A clear received mid-load is held back until the queue is drained,
    /// and the mailbox is not read again until it has been applied.
    async fn load(&mut self, rx: &mut mpsc::UnboundedReceiver<Message>) {
        self.set_status(Status::Loading);
        tracing::debug!(entity_id = %self.id(), "loading entity");

        let storage = Arc::clone(&self.engine.storage);
        let id = self.entity.id.clone();
        let fetch = async move { storage.load(&id).await };
        tokio::pin!(fetch);

        let mut deferred_clear: Option<oneshot::Sender<()>> = None;
        let mut mailbox_open = true;
        let fetched = loop {
            tokio::select! {
                biased;
                result = &mut fetch => break result,
                msg = rx.recv(), if mailbox_open && deferred_clear.is_none() => match msg {
                    Some(Message::Execute { command, reply }) => {
                        self.queue.push_back(Pending::Execute { command, reply });
                    }
                    Some(Message::Preload { reply }) => {
                        self.queue.push_back(Pending::Preload { reply });
                    }
                    Some(Message::Clear { reply }) => deferred_clear = Some(reply),
                    None => mailbox_open = false,
                },
            }
        };

        let replayed = fetched
            .map_err(DispatchError::from)
            .and_then(|loaded| self.replay(loaded));

        match replayed {
            Ok(()) => {
                self.set_status(Status::Loaded);
                tracing::debug!(
                    entity_id = %self.id(),
                    revision = self.revision,
                    queued = self.queue.len(),
                    "entity loaded"
                );
                while let Some(pending) = self.queue.pop_front() {
                    match pending {
                        Pending::Execute { command, reply } => {
                            let result = self.execute(command).await;
                            let _ = reply.send(result);
                        }
                        Pending::Preload { reply } => {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
            }
            Err(err) => {
                tracing::error!(entity_id = %self.id(), error = %err, "entity load failed");
                let queued: Vec<Pending> = self.queue.drain(..).collect();
                self.reset();
                for pending in queued {
                    match pending {
                        Pending::Execute { reply, .. } => {
                            let _ = reply.send(Err(err.clone()));
                        }
                        Pending::Preload { reply } => {
                            let _ = reply.send(Err(err.clone()));
                        }
                    }
                }
            }
        }

        if let Some(reply) = deferred_clear {
            self.reset();
            let _ = reply.send(());
        }
    }

    /// Fold the loaded snapshot and events into state without notifying.
    fn replay(&mut self, loaded: Loaded) -> Result<(), DispatchError> {
        self.set_status(Status::Replaying);
        let Loaded { events, snapshot } = loaded;
        let snapshot = snapshot.filter(|snap| snap.is_usable() && snap.id == self.entity.id);

        let mut state = match &snapshot {
            Some(snap) => {
                let mut state = snap.state.clone();
                stamp(&mut state, &self.entity.id, snap.revision);
                self.revision = snap.revision;
                self.snapshot_revision = snap.revision;
                state
            }
            None => {
                let seed = Event::seed(&self.entity);
                self.fold(&Value::Null, &seed)?
            }
        };

        let mut history = Vec::with_capacity(events.len());
        for event in events {
            if event.revision <= self.revision {
                tracing::warn!(
                    entity_id = %self.id(),
                    revision = event.revision,
                    current = self.revision,
                    "skipping already applied event during replay"
                );
                continue;
            }
            state = self.fold(&state, &event)?;
            self.revision = event.revision;
            history.push(Arc::new(event));
        }

        self.history = history;
        self.state = Some(Arc::new(state));
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> Result<Arc<Value>, DispatchError> {
        let span = tracing::info_span!(
            "execute",
            entity_id = %self.entity.id,
            command = %command.kind,
        );
        self.decide_and_commit(command).instrument(span).await
    }

    async fn decide_and_commit(&mut self, command: Command) -> Result<Arc<Value>, DispatchError> {
        let current = self
            .state
            .clone()
            .unwrap_or_else(|| Arc::new(Value::Null));

        let decision = self
            .engine
            .decider
            .decide(&current, &command)
            .await
            .map_err(DispatchError::decider)?;
        let drafts = decision.into_drafts()?;
        if drafts.is_empty() {
            return Ok(current);
        }

        let id_key = self.engine.config.id_key.as_str();
        let events: Vec<Event> = drafts
            .into_iter()
            .zip(self.revision + 1..)
            .map(|(draft, revision)| draft.into_event(&command, id_key, revision))
            .collect();

        // Fold ahead of the save so a reducer failure never reaches storage
        // and a due snapshot can carry the post-commit state.
        let tentative = self.fold_all(&current, &events)?;
        let last_revision = self.revision + events.len() as u64;
        let snapshot = if self.snapshot_due(last_revision) {
            tentative
                .last()
                .map(|state| Snapshot::new(self.entity.id.clone(), last_revision, (**state).clone()))
        } else {
            None
        };

        let snapshot_revision = snapshot.as_ref().map(|snap| snap.revision);
        let committed = self.engine.storage.save(events.clone(), snapshot).await?;

        let contiguous = committed
            .iter()
            .zip(self.revision + 1..)
            .all(|(event, revision)| event.entity_id == self.entity.id && event.revision == revision);
        if !contiguous {
            return self.resync().await;
        }

        // State is always the fold of what storage kept. The tentative fold
        // only stands in for it when nothing was filtered or rewritten.
        let states = if committed == events {
            if let Some(revision) = snapshot_revision {
                self.snapshot_revision = revision;
            }
            tentative
        } else {
            tracing::warn!(
                entity_id = %self.id(),
                requested = events.len(),
                committed = committed.len(),
                "storage committed a different batch than requested"
            );
            match self.fold_all(&current, &committed) {
                Ok(states) => states,
                Err(err) => {
                    // Storage and memory disagree; reload on next access.
                    self.reset();
                    return Err(err);
                }
            }
        };

        self.apply(command, &current, committed, states);
        Ok(self.state.clone().unwrap_or(current))
    }

    /// Storage committed revisions that do not continue the history: drop
    /// everything in memory and rebuild from what storage now holds.
    async fn resync(&mut self) -> Result<Arc<Value>, DispatchError> {
        tracing::warn!(
            entity_id = %self.id(),
            revision = self.revision,
            "storage committed non-contiguous revisions; reloading"
        );
        self.reset();
        self.set_status(Status::Loading);
        let fetched = self.engine.storage.load(&self.entity.id).await;
        match fetched
            .map_err(DispatchError::from)
            .and_then(|loaded| self.replay(loaded))
        {
            Ok(()) => {
                self.set_status(Status::Loaded);
                Ok(self
                    .state
                    .clone()
                    .unwrap_or_else(|| Arc::new(Value::Null)))
            }
            Err(err) => {
                self.reset();
                Err(err)
            }
        }
    }

    /// Fold `events` on top of `state`, returning the state after each.
    fn fold_all(&self, state: &Arc<Value>, events: &[Event]) -> Result<Vec<Arc<Value>>, DispatchError> {
        let mut states = Vec::with_capacity(events.len());
        let mut current = Arc::clone(state);
        for event in events {
            let next = Arc::new(self.fold(&current, event)?);
            states.push(Arc::clone(&next));
            current = next;
        }
        Ok(states)
    }

    fn fold(&self, state: &Value, event: &Event) -> Result<Value, DispatchError> {
        let patch = self
            .engine
            .reducer
            .reduce(state, event)
            .map_err(DispatchError::reducer)?;
        let mut next = merge(state, &patch);
        stamp(&mut next, &self.entity.id, event.revision);
        Ok(next)
    }

    /// Record committed events and notify subscribers, one per event.
    fn apply(
        &mut self,
        command: Command,
        before: &Arc<Value>,
        events: Vec<Event>,
        states: Vec<Arc<Value>>,
    ) {
        let Some(last) = events.last() else {
            return;
        };
        self.revision = last.revision;

        let command = Arc::new(command);
        let mut old_state = Arc::clone(before);
        let mut notifications = Vec::with_capacity(events.len());
        for (event, new_state) in events.into_iter().zip(states) {
            let event = Arc::new(event);
            self.history.push(Arc::clone(&event));
            notifications.push(Notification {
                event,
                command: Arc::clone(&command),
                old_state: Arc::clone(&old_state),
                new_state: Arc::clone(&new_state),
            });
            old_state = new_state;
        }
        self.state = Some(old_state);
        self.publish();

        tracing::info!(
            count = notifications.len(),
            revision = self.revision,
            "events committed"
        );
        for notification in notifications {
            self.engine.bus.emit(notification);
        }
    }

    fn snapshot_due(&self, revision: u64) -> bool {
        let cadence = self.engine.config.snapshot_every;
        cadence > 0 && revision >= self.snapshot_revision + cadence
    }

    fn reset(&mut self) {
        self.status = Status::Empty;
        self.history.clear();
        self.state = None;
        self.revision = 0;
        self.snapshot_revision = 0;
        self.publish();
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
        self.publish();
    }

    fn publish(&self) {
        self.view.send_replace(ContextView {
            status: self.status,
            state: self.state.clone(),
            revision: self.revision,
        });
    }
}

/// Write the bookkeeping fields into an object state.
fn stamp(state: &mut Value, id: &str, revision: u64) {
    if let Value::Object(map) = state {
        map.insert("id".to_owned(), Value::String(id.to_owned()));
        map.insert("revision".to_owned(), Value::from(revision));
    }
}

/// Cloneable handle to a running entity context.
#[derive(Clone)]
pub(crate) struct ContextHandle {
    sender: mpsc::UnboundedSender<Message>,
    view: watch::Receiver<ContextView>,
}

impl ContextHandle {
    /// Start a context task for `entity`. Must be called inside a tokio
    /// runtime.
    pub(crate) fn spawn(entity: EntityRef, engine: Arc<Engine>) -> Self {
        let (sender, rx) = mpsc::unbounded_channel();
        let (view_tx, view) = watch::channel(ContextView::default());
        let context = EntityContext {
            entity,
            engine,
            status: Status::Empty,
            history: Vec::new(),
            queue: VecDeque::new(),
            state: None,
            revision: 0,
            snapshot_revision: 0,
            view: view_tx,
        };
        tokio::spawn(context.run(rx));
        Self { sender, view }
    }

    /// Run a validated command, loading the entity first if needed.
    pub(crate) async fn execute(&self, command: Command) -> Result<Arc<Value>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Message::Execute { command, reply })
            .map_err(|_| DispatchError::ContextGone)?;
        rx.await.map_err(|_| DispatchError::ContextGone)?
    }

    /// Load the entity without running a command.
    pub(crate) async fn preload(&self) -> Result<(), DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Message::Preload { reply })
            .map_err(|_| DispatchError::ContextGone)?;
        rx.await.map_err(|_| DispatchError::ContextGone)?
    }

    /// Reset the context to `Empty`. Returns `false` if the task is gone.
    pub(crate) async fn clear(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.sender.send(Message::Clear { reply }).is_err() {
            return false;
        }
        rx.await.is_ok()
    }

    pub(crate) fn view(&self) -> ContextView {
        self.view.borrow().clone()
    }

    /// Whether the task behind this handle is still running.
    pub(crate) fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}
