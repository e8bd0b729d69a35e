//! Canonical image events and the payloads carried by event queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Attribute naming the processing path a subscriber should take
pub const COMMENT_TYPE: &str = "commentType";
/// Attribute carrying the raw storage event name (e.g. `ObjectCreated:Put`)
pub const EVENT_NAME: &str = "eventName";
/// Attribute carrying the bucket the object lives in
pub const BUCKET: &str = "bucket";
/// Attribute carrying a free-form image description on updates
pub const DESCRIPTION: &str = "description";

/// `commentType` value routing removals to the delete path
pub const PROCESS_DELETE: &str = "ProcessDelete";
/// `commentType` value routing metadata updates to the update path
pub const UPDATE_TABLE: &str = "UpdateTable";

/// What happened to the image object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Object uploaded
    Created,
    /// Object deleted
    Removed,
    /// Object metadata changed
    Updated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Removed => "removed",
            EventKind::Updated => "updated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image event as published to topics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageEvent {
    pub kind: EventKind,
    /// Object key; an empty key marks a malformed event
    #[serde(default)]
    pub object_key: String,
    pub occurred_at: DateTime<Utc>,
    /// Routing metadata evaluated by subscription filters
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ImageEvent {
    /// Create an event for `object_key` stamped with the current time
    pub fn new(kind: EventKind, object_key: impl Into<String>) -> Self {
        Self {
            kind,
            object_key: object_key.into(),
            occurred_at: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    /// Override the time the change happened
    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Attach a routing attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up a routing attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    /// The `commentType` attribute, if any
    pub fn comment_type(&self) -> Option<&str> {
        self.attribute(COMMENT_TYPE)
    }

    /// Whether the object key is present
    pub fn has_object_key(&self) -> bool {
        !self.object_key.trim().is_empty()
    }
}

/// Body of a message on an event queue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    /// A decodable image event
    Event(ImageEvent),
    /// Anything else that was put on the queue
    Raw(serde_json::Value),
}

impl Payload {
    /// Classify an arbitrary JSON value
    pub fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<ImageEvent>(value.clone()) {
            Ok(event) => Payload::Event(event),
            Err(_) => Payload::Raw(value),
        }
    }

    /// Classify raw bytes; undecodable bytes become a JSON string
    pub fn from_slice(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => Self::from_value(value),
            Err(_) => Payload::Raw(serde_json::Value::String(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }

    pub fn event(&self) -> Option<&ImageEvent> {
        match self {
            Payload::Event(event) => Some(event),
            Payload::Raw(_) => None,
        }
    }
}

impl From<ImageEvent> for Payload {
    fn from(event: ImageEvent) -> Self {
        Payload::Event(event)
    }
}
