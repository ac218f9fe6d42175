//! Core type definitions for the synchronization core
//!
//! Property values are kept in an in-memory representation that may differ
//! from what goes over the wire: tracked collections carry change state and a
//! version, server objects are opaque handles.

use crate::delta::{TrackedList, TrackedMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Name of a property; may be dotted to address nested maps
pub type PropertyName = String;

/// Identifier of a browser window bound to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowId(pub uuid::Uuid);

impl WindowId {
    /// Generate a new random window ID
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference to a server-side object
///
/// Only the handle travels to the client; the object itself never leaves the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerObject {
    /// Kind of object, used by converters to pick a wire representation
    pub kind: String,
    /// Server-side handle
    pub handle: u64,
}

/// A property value in its in-memory representation
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PropertyValue {
    /// Null / unset
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Str(String),
    /// Nested plain map (replaced as a whole)
    Map(BTreeMap<String, PropertyValue>),
    /// Nested plain list (replaced as a whole)
    List(Vec<PropertyValue>),
    /// Ordered collection with granular change tracking
    TrackedList(TrackedList),
    /// Keyed collection with granular change tracking
    TrackedMap(TrackedMap),
    /// Opaque server object
    Object(ServerObject),
}

impl PropertyValue {
    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Str(_) => "string",
            PropertyValue::Map(_) => "map",
            PropertyValue::List(_) => "list",
            PropertyValue::TrackedList(_) => "tracked_list",
            PropertyValue::TrackedMap(_) => "tracked_map",
            PropertyValue::Object(_) => "object",
        }
    }

    /// Whether this value records its own structural changes
    pub fn is_tracked(&self) -> bool {
        matches!(self, PropertyValue::TrackedList(_) | PropertyValue::TrackedMap(_))
    }

    /// Whether a tracked value has changes its owner has not collected yet
    pub fn has_pending_changes(&self) -> bool {
        match self {
            PropertyValue::TrackedList(list) => list.has_changes(),
            PropertyValue::TrackedMap(map) => map.has_changes(),
            _ => false,
        }
    }

    /// Forget pending change state, as done when the value is attached somewhere new
    pub fn mark_clean(&mut self) {
        match self {
            PropertyValue::TrackedList(list) => list.mark_clean(),
            PropertyValue::TrackedMap(map) => map.mark_clean(),
            _ => {}
        }
    }

    /// Get a boolean if this is a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get a string slice if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get an integer if this is an integer value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the tracked list if this is one
    pub fn as_tracked_list(&self) -> Option<&TrackedList> {
        match self {
            PropertyValue::TrackedList(list) => Some(list),
            _ => None,
        }
    }

    /// Get the tracked map if this is one
    pub fn as_tracked_map(&self) -> Option<&TrackedMap> {
        match self {
            PropertyValue::TrackedMap(map) => Some(map),
            _ => None,
        }
    }

    /// Build a plain value from JSON; objects become maps, arrays become lists
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PropertyValue::Int(i),
                None => PropertyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => PropertyValue::Str(s.clone()),
            Value::Array(items) => PropertyValue::List(items.iter().map(Self::from_json).collect()),
            Value::Object(entries) => PropertyValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Plain JSON representation, without versions or change state
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropertyValue::Str(s) => Value::String(s.clone()),
            PropertyValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            PropertyValue::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            PropertyValue::TrackedList(list) => {
                Value::Array(list.iter().map(Self::to_json).collect())
            }
            PropertyValue::TrackedMap(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            PropertyValue::Object(object) => serde_json::json!({
                "kind": object.kind,
                "handle": object.handle,
            }),
        }
    }

    /// Wire representation of the whole value
    ///
    /// Tracked collections are wrapped with their version (`{"vEr": n, "v": ...}`)
    /// and their change state is consumed, since the client gets everything.
    pub fn take_wire_value(&mut self) -> Value {
        match self {
            PropertyValue::TrackedList(list) => list.take_full(),
            PropertyValue::TrackedMap(map) => map.take_full(),
            other => other.to_json(),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Str(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Str(value)
    }
}

impl From<TrackedList> for PropertyValue {
    fn from(value: TrackedList) -> Self {
        PropertyValue::TrackedList(value)
    }
}

impl From<TrackedMap> for PropertyValue {
    fn from(value: TrackedMap) -> Self {
        PropertyValue::TrackedMap(value)
    }
}

impl From<ServerObject> for PropertyValue {
    fn from(value: ServerObject) -> Self {
        PropertyValue::Object(value)
    }
}
