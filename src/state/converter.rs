//! Conversion between wire values and property values

use super::ObjectState;
use crate::core::error::{Error, Result};
use crate::core::types::PropertyValue;
use crate::delta::wire::unwrap_versioned;
use crate::delta::{TrackedList, TrackedMap};
use serde_json::Value;

/// Converts property values to and from their wire form
///
/// `to_wire` gets the owning object mutably: a conversion is allowed to change
/// other properties of its owner, which then have to be serialized as well.
pub trait PropertyConverter: Send + Sync {
    /// Convert a value received from the client
    fn from_wire(
        &self,
        name: &str,
        raw: &Value,
        previous: Option<&PropertyValue>,
    ) -> Result<PropertyValue>;

    /// Convert a changed value for sending
    fn to_wire(&self, owner: &mut ObjectState, name: &str, value: &PropertyValue) -> Result<Value>;
}

/// Plain JSON conversion
///
/// Client values replacing a tracked collection stay tracked, and server
/// objects can never be written by the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl PropertyConverter for JsonConverter {
    fn from_wire(
        &self,
        name: &str,
        raw: &Value,
        previous: Option<&PropertyValue>,
    ) -> Result<PropertyValue> {
        let value = unwrap_versioned(raw);
        match (previous, value) {
            (Some(PropertyValue::Object(_)), _) => Err(Error::conversion(format!(
                "{} holds a server object and cannot be written by the client",
                name
            ))),
            (Some(PropertyValue::TrackedList(_)), Value::Array(items)) => Ok(TrackedList::new(
                items.iter().map(PropertyValue::from_json).collect(),
            )
            .into()),
            (Some(PropertyValue::TrackedMap(_)), Value::Object(entries)) => Ok(TrackedMap::new(
                entries
                    .iter()
                    .map(|(key, value)| (key.as_str(), PropertyValue::from_json(value))),
            )
            .into()),
            (_, value) => Ok(PropertyValue::from_json(value)),
        }
    }

    fn to_wire(&self, _owner: &mut ObjectState, _name: &str, value: &PropertyValue) -> Result<Value> {
        Ok(value.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tracked_lists_stay_tracked() {
        let previous = PropertyValue::from(TrackedList::default());
        let value = JsonConverter
            .from_wire("rows", &json!({"vEr": 3, "v": [1, 2]}), Some(&previous))
            .unwrap();

        assert_eq!(value.as_tracked_list().map(TrackedList::len), Some(2));
    }

    #[test]
    fn test_server_objects_are_read_only() {
        let previous = PropertyValue::Object(crate::core::types::ServerObject {
            kind: "record".into(),
            handle: 7,
        });
        let result = JsonConverter.from_wire("record", &json!(1), Some(&previous));
        assert!(matches!(result, Err(Error::Conversion(_))));
    }

    #[test]
    fn test_plain_values() {
        let value = JsonConverter.from_wire("text", &json!("hi"), None).unwrap();
        assert_eq!(value, PropertyValue::from("hi"));
    }
}
