//! Topic-based notification of committed events.
//!
//! Every committed event is published on three topics: [`Topic::All`], the
//! event's type, and its entity id. Delivery runs on a background task fed
//! by a FIFO channel, so a command never waits for its subscribers while
//! subscribers still see one entity's events in commit order.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::command::Command;
use crate::event::Event;

/// A channel subscribers can listen on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every event of every entity (`*`).
    All,
    /// Events of one type, e.g. `"incremented"`.
    EventType(String),
    /// Events of one entity id.
    Entity(String),
}

impl Topic {
    /// Topic for events of type `kind`.
    pub fn event_type(kind: impl Into<String>) -> Self {
        Self::EventType(kind.into())
    }

    /// Topic for events of entity `id`.
    pub fn entity(id: impl Into<String>) -> Self {
        Self::Entity(id.into())
    }
}

/// A committed event together with the command that produced it and the
/// state transition it caused.
#[derive(Debug, Clone)]
pub struct Notification {
    /// The committed event.
    pub event: Arc<Event>,
    /// The command whose decision produced `event`. Its `id` equals the
    /// event's `causation_id`.
    pub command: Arc<Command>,
    /// Entity state before the event.
    pub old_state: Arc<Value>,
    /// Entity state after the event.
    pub new_state: Arc<Value>,
}

type Handler = Arc<dyn Fn(&Notification) + Send + Sync + 'static>;

enum Delivery {
    Notify(Notification),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct BusInner {
    handlers: RwLock<HashMap<Topic, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    worker: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

impl BusInner {
    fn deliver(&self, notification: &Notification) {
        let topics = [
            Topic::All,
            Topic::EventType(notification.event.kind.clone()),
            Topic::Entity(notification.event.entity_id.clone()),
        ];

        // Snapshot the handler list so callbacks may (un)subscribe freely.
        let handlers: Vec<Handler> = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            topics
                .iter()
                .filter_map(|topic| map.get(topic))
                .flatten()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                tracing::warn!(
                    event_type = %notification.event.kind,
                    entity_id = %notification.event.entity_id,
                    revision = notification.event.revision,
                    "subscriber panicked; notification dropped for it"
                );
            }
        }
    }
}

/// Publish/subscribe hub for committed events.
///
/// `Clone` is cheap and clones share subscribers. Outside a tokio runtime
/// notifications are delivered inline on the emitting thread.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self
            .inner
            .handlers
            .read()
            .map(|map| map.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `topic`.
    ///
    /// Handlers run on the bus worker task and should return quickly; a
    /// panicking handler is logged and skipped. The subscription stays
    /// active until [`Subscription::unsubscribe`] is called, even if the
    /// returned value is dropped.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler = Arc::new(handler);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.clone())
            .or_default()
            .push((id, handler));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
        }
    }

    /// Number of handlers currently registered on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Queue `notification` for delivery on its three topics.
    pub fn emit(&self, notification: Notification) {
        let Some(worker) = self.worker(true) else {
            self.inner.deliver(&notification);
            return;
        };
        if let Err(mpsc::error::SendError(Delivery::Notify(notification))) =
            worker.send(Delivery::Notify(notification))
        {
            self.inner.deliver(&notification);
        }
    }

    /// Wait until every notification emitted before this call has been
    /// delivered.
    pub async fn flush(&self) {
        let Some(worker) = self.worker(false) else {
            return;
        };
        let (done, rx) = oneshot::channel();
        if worker.send(Delivery::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }

    /// The live worker channel, starting a worker if `start` is set and a
    /// runtime is available.
    fn worker(&self, start: bool) -> Option<mpsc::UnboundedSender<Delivery>> {
        let mut slot = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.as_ref()
            && !worker.is_closed()
        {
            return Some(worker.clone());
        }
        if !start {
            return None;
        }

        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_worker(Arc::downgrade(&self.inner), rx));
        *slot = Some(tx.clone());
        Some(tx)
    }
}

async fn run_worker(bus: Weak<BusInner>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Notify(notification) => {
                let Some(inner) = bus.upgrade() else {
                    break;
                };
                inner.deliver(&notification);
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Registration returned by [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// The topic this subscription listens on.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Remove the handler. Returns `false` if it was already removed or the
    /// bus no longer exists.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.bus.upgrade() else {
            return false;
        };
        let mut map = inner.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = map.get_mut(&self.topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != self.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            map.remove(&self.topic);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::command::EntityRef;

    fn notification(kind: &str, entity_id: &str, revision: u64) -> Notification {
        let entity = EntityRef {
            name: String::new(),
            id: entity_id.into(),
        };
        let command = Command {
            kind: "ping".into(),
            payload: Default::default(),
            meta: Default::default(),
            user: None,
            entity: entity.clone(),
            id: Uuid::new_v4(),
            timestamp: 0,
        };
        let event = Event {
            kind: kind.into(),
            payload: json!({}),
            meta: Default::default(),
            id: Uuid::new_v4(),
            entity_id: entity_id.into(),
            entity,
            causation_id: command.id,
            revision,
            timestamp: 0,
            user: None,
        };
        Notification {
            event: Arc::new(event),
            command: Arc::new(command),
            old_state: Arc::new(json!({})),
            new_state: Arc::new(json!({"revision": revision})),
        }
    }

    fn recorder(bus: &EventBus, topic: Topic) -> (Subscription, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = bus.subscribe(topic, move |n| {
            sink.lock().unwrap().push(n.event.revision);
        });
        (sub, seen)
    }

    #[tokio::test]
    async fn fans_out_to_all_three_topics() {
        let bus = EventBus::new();
        let (_all, all) = recorder(&bus, Topic::All);
        let (_kind, kind) = recorder(&bus, Topic::event_type("incremented"));
        let (_entity, entity) = recorder(&bus, Topic::entity("1"));
        let (_other, other) = recorder(&bus, Topic::entity("2"));

        bus.emit(notification("incremented", "1", 1));
        bus.flush().await;

        assert_eq!(*all.lock().unwrap(), vec![1]);
        assert_eq!(*kind.lock().unwrap(), vec![1]);
        assert_eq!(*entity.lock().unwrap(), vec![1]);
        assert!(other.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivers_in_emit_order() {
        let bus = EventBus::new();
        let (_sub, seen) = recorder(&bus, Topic::All);
        for revision in 1..=50 {
            bus.emit(notification("incremented", "1", revision));
        }
        bus.flush().await;
        assert_eq!(*seen.lock().unwrap(), (1..=50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (sub, seen) = recorder(&bus, Topic::All);

        bus.emit(notification("incremented", "1", 1));
        bus.flush().await;
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(bus.subscriber_count(&Topic::All), 0);

        bus.emit(notification("incremented", "1", 2));
        bus.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let _bad = bus.subscribe(Topic::All, |_| panic!("subscriber bug"));
        let (_good, seen) = recorder(&bus, Topic::All);

        bus.emit(notification("incremented", "1", 1));
        bus.emit(notification("incremented", "1", 2));
        bus.flush().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn delivers_inline_without_runtime() {
        let bus = EventBus::new();
        let (_sub, seen) = recorder(&bus, Topic::event_type("pinged"));
        bus.emit(notification("pinged", "1", 7));
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn flush_without_emits_returns() {
        EventBus::new().flush().await;
    }
}
