//! Change events delivered on a topic.
//!
//! A [`ChangeEvent`] is the normalized form of every notification the engine
//! handles, whether it came from the server (`Origin::Remote`) or was produced
//! locally by an optimistic write (`Origin::Speculative`). Events are
//! ephemeral: produced, applied and dispatched, never stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{EntityId, SyncError, Topic};

/// Field holding the entity identifier inside a record.
pub const ID_FIELD: &str = "id";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A new entity was created.
    #[serde(alias = "insert", alias = "INSERT", alias = "CREATE")]
    Create,
    /// An existing entity changed.
    #[serde(alias = "UPDATE")]
    Update,
    /// An entity was deleted.
    #[serde(alias = "DELETE")]
    Delete,
}

impl EventKind {
    /// Lowercase name, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Which event kinds a subscription wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventFilter {
    /// Only creates.
    Create,
    /// Only updates.
    Update,
    /// Only deletes.
    Delete,
    /// Every kind.
    #[default]
    #[serde(alias = "*")]
    Any,
}

impl EventFilter {
    /// Check whether an event kind passes this filter.
    pub fn matches(&self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (Self::Any, _)
                | (Self::Create, EventKind::Create)
                | (Self::Update, EventKind::Update)
                | (Self::Delete, EventKind::Delete)
        )
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Delivered by the server-of-record.
    #[default]
    Remote,
    /// Produced locally by an optimistic write awaiting confirmation.
    Speculative,
}

/// A normalized change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Mutation kind.
    pub kind: EventKind,
    /// Topic the event was delivered on.
    pub topic: Topic,
    /// Record before the change (updates and deletes).
    #[serde(default)]
    pub old: Option<Value>,
    /// Record after the change (creates and updates).
    #[serde(default)]
    pub new: Option<Value>,
    /// Remote or speculative.
    #[serde(default)]
    pub origin: Origin,
    /// Commit time in milliseconds since the Unix epoch.
    #[serde(default = "now_ms")]
    pub timestamp_ms: u64,
    /// Free-form correlation metadata (schema, commit id, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ChangeEvent {
    /// Create a remote event stamped with the current time.
    pub fn remote(
        kind: EventKind,
        topic: impl Into<Topic>,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Self {
        Self {
            kind,
            topic: topic.into(),
            old,
            new,
            origin: Origin::Remote,
            timestamp_ms: now_ms(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create an event for a known entity.
    ///
    /// The entity id is stamped into object records so listeners and the
    /// synchronizer can address it the same way as a wire event.
    pub fn for_entity(
        kind: EventKind,
        topic: impl Into<Topic>,
        id: &EntityId,
        old: Option<Value>,
        new: Option<Value>,
        origin: Origin,
    ) -> Self {
        Self {
            kind,
            topic: topic.into(),
            old: old.map(|v| with_id(v, id)),
            new: new.map(|v| with_id(v, id)),
            origin,
            timestamp_ms: now_ms(),
            metadata: BTreeMap::new(),
        }
    }

    /// Create a speculative event for an optimistic write.
    pub fn speculative(
        kind: EventKind,
        topic: impl Into<Topic>,
        id: &EntityId,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Self {
        Self::for_entity(kind, topic, id, old, new, Origin::Speculative)
    }

    /// Set the commit timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// The record that identifies the entity: `old` for deletes, `new` otherwise.
    ///
    /// Falls back to the other side when the preferred one is absent.
    pub fn record(&self) -> Option<&Value> {
        match self.kind {
            EventKind::Delete => self.old.as_ref().or(self.new.as_ref()),
            EventKind::Create | EventKind::Update => self.new.as_ref().or(self.old.as_ref()),
        }
    }

    /// Id of the entity this event targets, if the record carries one.
    pub fn entity_id(&self) -> Option<EntityId> {
        self.record()
            .and_then(|r| r.get(ID_FIELD))
            .and_then(EntityId::from_value)
    }

    /// Check the identifying fields and return the entity id.
    ///
    /// Creates and updates also need a `new` record to apply.
    pub fn validate(&self) -> Result<EntityId, SyncError> {
        if self.topic.as_str().is_empty() {
            return Err(SyncError::InvalidData("event has empty topic".into()));
        }
        if self.kind != EventKind::Delete && self.new.is_none() {
            return Err(SyncError::InvalidData(format!(
                "{} event without new record",
                self.kind.as_str()
            )));
        }
        self.entity_id()
            .ok_or_else(|| SyncError::InvalidData(format!("record missing `{}` field", ID_FIELD)))
    }

    /// Parse an event from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize an event to JSON.
    pub fn to_json(&self) -> Result<String, SyncError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Insert the entity id into an object record; other values pass through.
fn with_id(mut value: Value, id: &EntityId) -> Value {
    if let Value::Object(map) = &mut value {
        map.entry(ID_FIELD)
            .or_insert_with(|| Value::String(id.as_str().to_string()));
    }
    value
}
