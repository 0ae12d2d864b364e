//! Decider and reducer contracts supplied by consumer code.

use async_trait::async_trait;
use serde_json::Value;

use crate::command::Command;
use crate::error::{BoxError, ShapeError};
use crate::event::{Event, EventDraft};

/// Decides which events a command produces given the current state.
///
/// # Contract
///
/// - Must not mutate anything reachable from `state`; it only receives a
///   shared reference.
/// - Returns an empty [`Decision`] to signal a no-op command.
/// - Returning `Err` rejects the command; nothing is persisted.
///
/// Synchronous closures can be adapted with [`decider_fn`].
#[async_trait]
pub trait Decider: Send + Sync + 'static {
    /// Produce zero or more raw event candidates for `command`.
    async fn decide(&self, state: &Value, command: &Command) -> Result<Decision, BoxError>;
}

/// Folds one event into a state patch.
///
/// The returned value is merged into the current state with
/// [`merge`](crate::merge::merge), so a reducer may return only the keys it
/// changes. Called exactly once per event, in revision order. The first call
/// for a fresh entity receives a `Null` state and an
/// [`INIT_EVENT_TYPE`](crate::INIT_EVENT_TYPE) event.
///
/// Closures can be adapted with [`reducer_fn`].
pub trait Reducer: Send + Sync + 'static {
    /// Compute the patch produced by `event` on top of `state`.
    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, BoxError>;
}

/// The raw event candidates returned by a [`Decider`].
///
/// Candidates are plain JSON so that shape checking happens in one place,
/// inside the engine, regardless of how the decider built them.
///
/// # Examples
///
/// ```
/// use entity_store::{Decision, EventDraft};
/// use serde_json::json;
///
/// let one: Decision = EventDraft::new("incremented", json!({"value": 1})).into();
/// assert_eq!(one.len(), 1);
///
/// let none = Decision::none();
/// assert!(none.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision(Vec<Value>);

impl Decision {
    /// A decision producing no events.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// A decision producing a single event candidate.
    pub fn event(candidate: impl Into<Value>) -> Self {
        Self(vec![candidate.into()])
    }

    /// A decision producing several event candidates, in order.
    pub fn events<I>(candidates: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        Self(candidates.into_iter().map(Into::into).collect())
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the decision produces no events.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shape-check every candidate, failing on the first bad one.
    pub(crate) fn into_drafts(self) -> Result<Vec<EventDraft>, ShapeError> {
        self.0.into_iter().map(EventDraft::from_value).collect()
    }
}

impl From<EventDraft> for Decision {
    fn from(draft: EventDraft) -> Self {
        Self::event(draft)
    }
}

impl From<Vec<EventDraft>> for Decision {
    fn from(drafts: Vec<EventDraft>) -> Self {
        Self::events(drafts)
    }
}

/// `null` is no events, an array is one candidate per element, anything
/// else is a single candidate.
impl From<Value> for Decision {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::none(),
            Value::Array(items) => Self(items),
            other => Self(vec![other]),
        }
    }
}

impl From<Vec<Value>> for Decision {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// [`Decider`] adapter for synchronous closures. Built by [`decider_fn`].
pub struct DeciderFn<F>(F);

#[async_trait]
impl<F> Decider for DeciderFn<F>
where
    F: Fn(&Value, &Command) -> Result<Decision, BoxError> + Send + Sync + 'static,
{
    async fn decide(&self, state: &Value, command: &Command) -> Result<Decision, BoxError> {
        (self.0)(state, command)
    }
}

/// Wrap a synchronous closure as a [`Decider`].
pub fn decider_fn<F>(f: F) -> DeciderFn<F>
where
    F: Fn(&Value, &Command) -> Result<Decision, BoxError> + Send + Sync + 'static,
{
    DeciderFn(f)
}

/// [`Reducer`] adapter for closures. Built by [`reducer_fn`].
pub struct ReducerFn<F>(F);

impl<F> Reducer for ReducerFn<F>
where
    F: Fn(&Value, &Event) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    fn reduce(&self, state: &Value, event: &Event) -> Result<Value, BoxError> {
        (self.0)(state, event)
    }
}

/// Wrap a closure as a [`Reducer`].
pub fn reducer_fn<F>(f: F) -> ReducerFn<F>
where
    F: Fn(&Value, &Event) -> Result<Value, BoxError> + Send + Sync + 'static,
{
    ReducerFn(f)
}
