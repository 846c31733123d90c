//! The dynamic message envelope
//!
//! A [`Message`] is a mapping from string keys to JSON values. The source
//! freely dictates keys and types; processors may add or override. Three
//! keys are always present: `timestamp` (ISO-8601 UTC), `source` (URI of
//! the originating endpoint), and `route` (the route name, stamped when the
//! message enters the route queue).
//!
//! Messages are immutable by contract: a processor consumes its input and
//! returns a new message, so no stage ever observes a later stage's
//! post-state. The map itself stays private; callers go through typed
//! accessors, which keeps the collection type out of the processor
//! interface.
//!
//! Byte-valued fields are stored base64-encoded so that every message
//! round-trips through JSON unchanged - the same representation the
//! external-processor wire format uses.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::{keys, Result, RouteError};

/// Current time as an ISO-8601 UTC string, microsecond precision
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The unit of flow through a route
///
/// # Example
///
/// ```
/// use virta_core::{keys, Message};
///
/// let msg = Message::new("timer://5s").with_field(keys::TICK_ID, 7);
/// assert_eq!(msg.source(), Some("timer://5s"));
/// assert_eq!(msg.as_i64(keys::TICK_ID), Some(7));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    /// Create a new message originating from `source`, stamped with the
    /// current timestamp
    pub fn new(source: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(keys::TIMESTAMP.to_string(), Value::String(now_iso8601()));
        fields.insert(keys::SOURCE.to_string(), Value::String(source.into()));
        Self { fields }
    }

    /// Rebuild a message from a JSON value (the external-processor wire)
    ///
    /// # Errors
    /// `Processing` if the value is not a JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(RouteError::processing(
                "message",
                format!("expected a JSON object, got {}", type_name(&other)),
            )),
        }
    }

    /// The message as a JSON object
    pub fn to_json(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether a field is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the message has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over all fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Get a field as a string slice
    pub fn as_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Get a field as an integer
    pub fn as_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    /// Get a field as a float (integers coerce)
    pub fn as_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Get a field as a boolean
    pub fn as_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// Decode a base64-encoded byte field
    pub fn as_bytes(&self, key: &str) -> Option<Bytes> {
        self.as_str(key)
            .and_then(|s| BASE64.decode(s).ok())
            .map(Bytes::from)
    }

    /// Set a field, replacing any existing value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Builder-style [`set`](Self::set)
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Store raw bytes under `key`, base64-encoded
    pub fn with_bytes(mut self, key: impl Into<String>, bytes: &[u8]) -> Self {
        self.set(key, BASE64.encode(bytes));
        self
    }

    /// Copy `key` from `other` unless this message already has it
    pub fn inherit(&mut self, key: &str, other: &Message) {
        if !self.fields.contains_key(key) {
            if let Some(v) = other.get(key) {
                self.fields.insert(key.to_string(), v.clone());
            }
        }
    }

    /// The `timestamp` field
    pub fn timestamp(&self) -> Option<&str> {
        self.as_str(keys::TIMESTAMP)
    }

    /// The `source` field
    pub fn source(&self) -> Option<&str> {
        self.as_str(keys::SOURCE)
    }

    /// The `route` field
    pub fn route(&self) -> Option<&str> {
        self.as_str(keys::ROUTE)
    }

    /// The stringified body: the `body` field if present (strings verbatim,
    /// anything else as JSON), otherwise the whole message as JSON
    pub fn body_str(&self) -> String {
        match self.fields.get(keys::BODY) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => self.to_json().to_string(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
