//! Wire shapes of versioned collections
//!
//! Full value: `{"vEr": n, "v": [...]}` or `{"vEr": n, "v": {...}}`.
//!
//! List granular update: `{"vEr": n, "u": [{"i", "v"}], "i": [{"i", "v": [..]}],
//! "a": [..], "d": [..]}`. A receiver applies it in this order:
//! 1. remove the `d` indices, which address the collection before the update;
//! 2. insert every `i` entry in ascending order at its final index;
//! 3. apply each `u` entry at its final index;
//! 4. append `a`.
//!
//! Map granular update: `{"vEr": n, "u": [{"k", "v"}]}`.

use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version key shared by every collection shape
pub const VERSION_KEY: &str = "vEr";

/// Whole collection value with its version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Collection version
    #[serde(rename = "vEr")]
    pub version: u32,
    /// Full value
    #[serde(rename = "v")]
    pub value: Value,
}

/// Replacement value for one row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedValue {
    /// Final index of the row
    #[serde(rename = "i")]
    pub index: usize,
    /// Whole row, or a nested update when only some of its fields changed
    #[serde(rename = "v")]
    pub value: Value,
}

/// Rows inserted at one position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedRows {
    /// Final index of the first inserted row
    #[serde(rename = "i")]
    pub index: usize,
    /// Inserted rows in order
    #[serde(rename = "v")]
    pub values: Vec<Value>,
}

/// Granular update of an ordered collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListUpdate {
    /// Collection version after the update
    #[serde(rename = "vEr")]
    pub version: u32,
    /// Changed rows
    #[serde(rename = "u", default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<IndexedValue>,
    /// Rows inserted before the end
    #[serde(rename = "i", default, skip_serializing_if = "Vec::is_empty")]
    pub inserts: Vec<IndexedRows>,
    /// Rows appended at the end
    #[serde(rename = "a", default, skip_serializing_if = "Vec::is_empty")]
    pub appended: Vec<Value>,
    /// Deleted indices, relative to the collection before the update
    #[serde(rename = "d", default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<usize>,
}

impl ListUpdate {
    /// Whether the update only changes existing rows
    pub fn is_update_only(&self) -> bool {
        self.inserts.is_empty() && self.appended.is_empty() && self.deleted.is_empty()
    }
}

/// Replacement value for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyedValue {
    /// Entry key
    #[serde(rename = "k")]
    pub key: String,
    /// New value
    #[serde(rename = "v")]
    pub value: Value,
}

/// Granular update of a keyed collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapUpdate {
    /// Collection version after the update
    #[serde(rename = "vEr")]
    pub version: u32,
    /// Changed entries
    #[serde(rename = "u", default)]
    pub updates: Vec<KeyedValue>,
}

/// Whether a raw value is a versioned granular update (`{"vEr", "u", ...}`)
pub fn is_granular_update(raw: &Value) -> bool {
    raw.get(VERSION_KEY).is_some() && raw.get("v").is_none()
}

/// Whether a raw value is a versioned full value (`{"vEr", "v"}`)
pub fn is_versioned_value(raw: &Value) -> bool {
    raw.get(VERSION_KEY).is_some() && raw.get("v").is_some()
}

/// Unwrap `{"vEr", "v"}` to its value; anything else is returned as is
pub fn unwrap_versioned(raw: &Value) -> &Value {
    if is_versioned_value(raw) {
        &raw["v"]
    } else {
        raw
    }
}

/// Apply a list update to a plain JSON mirror of the collection
///
/// This is what a receiving peer does with the update; nested map updates are
/// merged into object rows and wrapped full values are unwrapped.
pub fn apply_list_update(target: &mut Vec<Value>, update: &ListUpdate) -> Result<()> {
    let mut deleted = update.deleted.clone();
    deleted.sort_unstable();
    deleted.dedup();
    for &index in deleted.iter().rev() {
        if index >= target.len() {
            return Err(Error::invalid_operation(format!(
                "deleted index {} out of range for {} rows",
                index,
                target.len()
            )));
        }
        target.remove(index);
    }

    for rows in &update.inserts {
        if rows.index > target.len() {
            return Err(Error::invalid_operation(format!(
                "insert index {} out of range for {} rows",
                rows.index,
                target.len()
            )));
        }
        for (offset, value) in rows.values.iter().enumerate() {
            target.insert(rows.index + offset, unwrap_versioned(value).clone());
        }
    }

    for entry in &update.updates {
        let row = target.get_mut(entry.index).ok_or_else(|| {
            Error::invalid_operation(format!("updated index {} out of range", entry.index))
        })?;
        apply_row_value(row, &entry.value)?;
    }

    target.extend(update.appended.iter().map(|value| unwrap_versioned(value).clone()));
    Ok(())
}

/// Apply a map update to a plain JSON object mirror
pub fn apply_map_update(target: &mut serde_json::Map<String, Value>, update: &MapUpdate) -> Result<()> {
    for entry in &update.updates {
        match target.get_mut(&entry.key) {
            Some(existing) => apply_row_value(existing, &entry.value)?,
            None => {
                target.insert(entry.key.clone(), unwrap_versioned(&entry.value).clone());
            }
        }
    }
    Ok(())
}

fn apply_row_value(row: &mut Value, value: &Value) -> Result<()> {
    if is_granular_update(value) {
        if let Some(object) = row.as_object_mut() {
            let nested: MapUpdate = serde_json::from_value(value.clone())?;
            return apply_map_update(object, &nested);
        }
        if let Some(items) = row.as_array_mut() {
            let mut list = std::mem::take(items);
            let nested: ListUpdate = serde_json::from_value(value.clone())?;
            apply_list_update(&mut list, &nested)?;
            *row = Value::Array(list);
            return Ok(());
        }
        return Err(Error::conversion("nested update for a row that is not a collection"));
    }
    *row = unwrap_versioned(value).clone();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_list_update_skips_empty_parts() {
        let update = ListUpdate {
            version: 4,
            updates: vec![IndexedValue {
                index: 1,
                value: json!("b"),
            }],
            ..Default::default()
        };

        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"vEr": 4, "u": [{"i": 1, "v": "b"}]})
        );
    }

    #[test]
    fn test_apply_list_update_order() {
        // a b c d -> delete b, insert x before c, change d, append y
        let mut rows = vec![json!("a"), json!("b"), json!("c"), json!("d")];
        let update: ListUpdate = serde_json::from_value(json!({
            "vEr": 2,
            "d": [1],
            "i": [{"i": 1, "v": ["x"]}],
            "u": [{"i": 3, "v": "D"}],
            "a": ["y"],
        }))
        .unwrap();

        apply_list_update(&mut rows, &update).unwrap();
        assert_eq!(rows, vec![json!("a"), json!("x"), json!("c"), json!("D"), json!("y")]);
    }

    #[test]
    fn test_nested_map_update_merges_fields() {
        let mut rows = vec![json!({"name": "a", "size": 1})];
        let update = ListUpdate {
            version: 1,
            updates: vec![IndexedValue {
                index: 0,
                value: json!({"vEr": 3, "u": [{"k": "size", "v": 2}]}),
            }],
            ..Default::default()
        };

        apply_list_update(&mut rows, &update).unwrap();
        assert_eq!(rows[0], json!({"name": "a", "size": 2}));
    }

    #[test]
    fn test_shape_detection() {
        assert!(is_versioned_value(&json!({"vEr": 1, "v": []})));
        assert!(is_granular_update(&json!({"vEr": 1, "u": []})));
        assert!(!is_granular_update(&json!({"u": []})));
        assert_eq!(unwrap_versioned(&json!({"vEr": 1, "v": [1]})), &json!([1]));
    }
}
