//! Event types, event-candidate validation, and identity stamping.
//!
//! Deciders hand back raw JSON candidates. [`EventDraft::from_value`] checks
//! their shape and [`EventDraft::into_event`] turns a valid draft into a
//! committed-to-be [`Event`] carrying identity, causation, and revision.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::command::{Command, EntityRef};
use crate::error::ShapeError;

/// Event type fed to the reducer once, before replay, to seed the initial
/// state of an entity that has no usable snapshot.
pub const INIT_EVENT_TYPE: &str = "__init__";

/// Milliseconds since the Unix epoch, or `0` if the clock is before it.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An immutable, revisioned fact about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `"incremented"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload as produced by the decider.
    pub payload: Value,
    /// Metadata: the command's metadata overlaid with the draft's.
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Unique event id.
    pub id: Uuid,
    /// Id of the entity this event belongs to.
    pub entity_id: String,
    /// Entity reference copied from the producing command.
    pub entity: EntityRef,
    /// Id of the command that produced this event.
    pub causation_id: Uuid,
    /// Per-entity sequence number, starting at 1.
    pub revision: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Issuing user, copied from the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

impl Event {
    /// The synthetic event used to seed a fresh entity's state.
    pub(crate) fn seed(entity: &EntityRef) -> Self {
        Self {
            kind: INIT_EVENT_TYPE.to_owned(),
            payload: Value::Object(Map::new()),
            meta: Map::new(),
            id: Uuid::nil(),
            entity_id: entity.id.clone(),
            entity: entity.clone(),
            causation_id: Uuid::nil(),
            revision: 0,
            timestamp: now_millis(),
            user: None,
        }
    }
}

/// A shape-checked event candidate that has not been assigned identity yet.
///
/// # Examples
///
/// ```
/// use entity_store::EventDraft;
/// use serde_json::json;
///
/// let draft = EventDraft::new("incremented", json!({"value": 10}));
/// assert_eq!(draft.kind, "incremented");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Event payload.
    pub payload: Value,
    /// Event-specific metadata.
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl EventDraft {
    /// Create a draft with the given type and payload.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            meta: Map::new(),
        }
    }

    /// Attach event-specific metadata. Non-object values are ignored.
    pub fn with_meta(mut self, meta: Value) -> Self {
        if let Value::Object(map) = meta {
            self.meta = map;
        }
        self
    }

    /// Check the shape of a raw event candidate.
    ///
    /// # Errors
    ///
    /// * [`ShapeError::EventNotObject`] if `value` is not an object.
    /// * [`ShapeError::EventMissingType`] if `type` is absent, empty, or not a string.
    /// * [`ShapeError::EventMissingPayload`] if `payload` is absent.
    pub fn from_value(value: Value) -> Result<Self, ShapeError> {
        let Value::Object(mut obj) = value else {
            return Err(ShapeError::EventNotObject);
        };
        let kind = match obj.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(ShapeError::EventMissingType),
        };
        let payload = obj.remove("payload").ok_or(ShapeError::EventMissingPayload)?;
        let meta = match obj.remove("meta") {
            Some(Value::Object(meta)) => meta,
            _ => Map::new(),
        };
        Ok(Self {
            kind,
            payload,
            meta,
        })
    }

    /// Stamp identity, causation, and revision onto the draft.
    ///
    /// If the payload is an object without `id_key`, the entity id is filled
    /// in so every stored payload names its entity.
    pub(crate) fn into_event(self, command: &Command, id_key: &str, revision: u64) -> Event {
        let mut payload = self.payload;
        if let Value::Object(map) = &mut payload
            && !map.contains_key(id_key)
        {
            map.insert(id_key.to_owned(), Value::String(command.entity.id.clone()));
        }

        let mut meta = command.meta.clone();
        meta.extend(self.meta);

        Event {
            kind: self.kind,
            payload,
            meta,
            id: Uuid::new_v4(),
            entity_id: command.entity.id.clone(),
            entity: command.entity.clone(),
            causation_id: command.id,
            revision,
            timestamp: now_millis(),
            user: command.user.clone(),
        }
    }
}

impl From<EventDraft> for Value {
    fn from(draft: EventDraft) -> Self {
        let mut obj = Map::new();
        obj.insert("type".to_owned(), Value::String(draft.kind));
        obj.insert("payload".to_owned(), draft.payload);
        if !draft.meta.is_empty() {
            obj.insert("meta".to_owned(), Value::Object(draft.meta));
        }
        Value::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRequest;
    use serde_json::json;

    fn command() -> Command {
        CommandRequest::new("increment", json!({"id": "7", "value": 1}))
            .with_meta(json!({"source": "test", "trace": "cmd"}))
            .with_user(json!({"name": "alice"}))
            .validate("id", "counter")
            .unwrap()
    }

    #[test]
    fn from_value_accepts_valid_candidate() {
        let draft = EventDraft::from_value(json!({"type": "incremented", "payload": {"value": 1}}))
            .expect("valid draft");
        assert_eq!(draft.kind, "incremented");
        assert_eq!(draft.payload, json!({"value": 1}));
    }

    #[test]
    fn from_value_rejects_bad_shapes() {
        assert_eq!(
            EventDraft::from_value(json!(["incremented"])).unwrap_err(),
            ShapeError::EventNotObject
        );
        assert_eq!(
            EventDraft::from_value(json!({"type": "", "payload": {}})).unwrap_err(),
            ShapeError::EventMissingType
        );
        assert_eq!(
            EventDraft::from_value(json!({"type": "incremented"})).unwrap_err(),
            ShapeError::EventMissingPayload
        );
    }

    #[test]
    fn null_payload_counts_as_present() {
        let draft = EventDraft::from_value(json!({"type": "pinged", "payload": null}))
            .expect("null payload is present");
        assert!(draft.payload.is_null());
    }

    #[test]
    fn into_event_stamps_identity_and_causation() {
        let cmd = command();
        let event = EventDraft::new("incremented", json!({"value": 1}))
            .with_meta(json!({"trace": "evt"}))
            .into_event(&cmd, "id", 3);

        assert_eq!(event.entity_id, "7");
        assert_eq!(event.entity.name, "counter");
        assert_eq!(event.causation_id, cmd.id);
        assert_eq!(event.revision, 3);
        assert_eq!(event.user, Some(json!({"name": "alice"})));
        // Draft meta overrides command meta key by key.
        assert_eq!(event.meta["source"], "test");
        assert_eq!(event.meta["trace"], "evt");
        // Entity id is filled into object payloads.
        assert_eq!(event.payload["id"], "7");
    }

    #[test]
    fn into_event_keeps_existing_id_and_scalar_payloads() {
        let cmd = command();
        let event = EventDraft::new("moved", json!({"id": "other"})).into_event(&cmd, "id", 1);
        assert_eq!(event.payload["id"], "other");

        let event = EventDraft::new("pinged", json!(5)).into_event(&cmd, "id", 2);
        assert_eq!(event.payload, json!(5));
    }

    #[test]
    fn draft_converts_back_to_candidate() {
        let value: Value = EventDraft::new("incremented", json!({"value": 2})).into();
        let parsed = EventDraft::from_value(value).unwrap();
        assert_eq!(parsed.payload["value"], 2);
    }

    #[test]
    fn event_serializes_type_field() {
        let event = EventDraft::new("incremented", json!({})).into_event(&command(), "id", 1);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "incremented");
        assert_eq!(value["revision"], 1);
    }
}
