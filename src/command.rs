//! Command request, validated command, and entity reference types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ShapeError;
use crate::event::now_millis;

/// Identifies the aggregate a command or event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity type name (e.g. `"account"`). Empty when not configured.
    pub name: String,
    /// Entity instance id.
    pub id: String,
}

/// A command as submitted by a caller, before validation.
///
/// Fields are deliberately loose (`payload` is any JSON value) so that
/// malformed input can be represented and rejected with a precise
/// [`ShapeError`] instead of a generic deserialization failure.
///
/// # Examples
///
/// ```
/// use entity_store::CommandRequest;
/// use serde_json::json;
///
/// let request = CommandRequest::new("increment", json!({"id": "1", "value": 10}))
///     .with_user(json!({"name": "alice"}))
///     .with_meta(json!({"source": "api"}));
///
/// assert_eq!(request.kind, "increment");
/// assert!(request.user.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command type, e.g. `"increment"`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Command payload; must be an object carrying the entity id.
    #[serde(default)]
    pub payload: Value,
    /// Arbitrary metadata forwarded to every produced event.
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Identity of whoever issued the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
}

impl CommandRequest {
    /// Create a request with the given type and payload.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            meta: Map::new(),
            user: None,
        }
    }

    /// Set the issuing user.
    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    /// Set metadata. Non-object values are ignored.
    pub fn with_meta(mut self, meta: Value) -> Self {
        if let Value::Object(map) = meta {
            self.meta = map;
        }
        self
    }

    /// Parse a request from an untyped JSON value.
    ///
    /// # Errors
    ///
    /// * [`ShapeError::CommandNotObject`] if `value` is not an object.
    /// * [`ShapeError::MissingType`] if `type` is absent, empty, or not a string.
    /// * [`ShapeError::PayloadNotObject`] if `payload` is absent or not an object.
    pub fn from_value(value: Value) -> Result<Self, ShapeError> {
        let Value::Object(mut obj) = value else {
            return Err(ShapeError::CommandNotObject);
        };

        let kind = match obj.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(ShapeError::MissingType),
        };
        let payload = match obj.remove("payload") {
            Some(payload @ Value::Object(_)) => payload,
            _ => return Err(ShapeError::PayloadNotObject),
        };
        let meta = match obj.remove("meta") {
            Some(Value::Object(meta)) => meta,
            _ => Map::new(),
        };
        let user = obj.remove("user").filter(|user| !user.is_null());

        Ok(Self {
            kind,
            payload,
            meta,
            user,
        })
    }

    /// Validate the request and stamp identity fields onto it.
    ///
    /// # Arguments
    ///
    /// * `id_key` - Payload key holding the target entity id.
    /// * `entity_name` - Entity type name recorded on the command.
    ///
    /// # Errors
    ///
    /// Returns a [`ShapeError`] naming the first violated requirement.
    pub fn validate(self, id_key: &str, entity_name: &str) -> Result<Command, ShapeError> {
        if self.kind.is_empty() {
            return Err(ShapeError::MissingType);
        }
        let Value::Object(payload) = self.payload else {
            return Err(ShapeError::PayloadNotObject);
        };
        let entity_id = entity_id(&payload, id_key).ok_or_else(|| ShapeError::MissingId {
            key: id_key.to_owned(),
        })?;

        Ok(Command {
            kind: self.kind,
            payload,
            meta: self.meta,
            user: self.user,
            entity: EntityRef {
                name: entity_name.to_owned(),
                id: entity_id,
            },
            id: Uuid::new_v4(),
            timestamp: now_millis(),
        })
    }
}

impl TryFrom<Value> for CommandRequest {
    type Error = ShapeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

/// Read the entity id out of a payload. Strings are used as-is, numbers are
/// rendered in decimal; anything else counts as missing.
pub(crate) fn entity_id(payload: &Map<String, Value>, id_key: &str) -> Option<String> {
    match payload.get(id_key)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A validated, immutable command addressed to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Command payload.
    pub payload: Map<String, Value>,
    /// Metadata forwarded to produced events.
    pub meta: Map<String, Value>,
    /// Issuing user, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    /// Target entity.
    pub entity: EntityRef,
    /// Unique command id; becomes the `causation_id` of produced events.
    pub id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Command {
    /// The id of the entity this command targets.
    pub fn entity_id(&self) -> &str {
        &self.entity.id
    }
}
