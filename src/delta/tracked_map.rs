//! Keyed collection with granular change tracking

use super::tracked_list::apply_client_value;
use super::wire::{KeyedValue, MapUpdate, VersionedValue};
use crate::core::error::{Error, Result};
use crate::core::types::PropertyValue;
use serde_json::Value;
use std::collections::{btree_map, BTreeMap, BTreeSet};
use tracing::warn;

/// Keyed collection that records which keys changed between sends
///
/// Removing a key cannot be expressed granularly, so it schedules a full send.
#[derive(Debug, Clone)]
pub struct TrackedMap {
    entries: BTreeMap<String, PropertyValue>,
    changed_keys: BTreeSet<String>,
    version: u32,
    send_all: bool,
}

impl PartialEq for TrackedMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Default for TrackedMap {
    fn default() -> Self {
        Self::new(std::iter::empty::<(String, PropertyValue)>())
    }
}

impl TrackedMap {
    /// Create a map the client has never seen; the first send is a full one
    pub fn new<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, PropertyValue)>,
        K: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(key, mut value)| {
                value.mark_clean();
                (key.into(), value)
            })
            .collect();
        Self {
            entries,
            changed_keys: BTreeSet::new(),
            version: 0,
            send_all: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, PropertyValue> {
        self.entries.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, String, PropertyValue> {
        self.entries.keys()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Keys changed since the last send
    pub fn changed_keys(&self) -> &BTreeSet<String> {
        &self.changed_keys
    }

    pub fn sends_everything(&self) -> bool {
        self.send_all
    }

    pub fn has_changes(&self) -> bool {
        self.send_all || !self.changed_keys.is_empty()
    }

    pub fn mark_send_everything(&mut self) {
        self.send_all = true;
    }

    /// Continue numbering from a collection this one replaces on the client
    pub fn inherit_version(&mut self, version: u32) {
        self.version = self.version.max(version);
    }

    /// Forget all pending changes, nested ones included
    pub fn mark_clean(&mut self) {
        self.send_all = false;
        self.changed_keys.clear();
        self.entries.values_mut().for_each(PropertyValue::mark_clean);
    }

    fn touch(&mut self, key: &str) {
        if !self.send_all {
            self.changed_keys.insert(key.to_string());
        }
    }

    /// Set an entry; returns whether the stored value actually changed
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> bool {
        let key = key.into();
        let mut value = value.into();
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        value.mark_clean();
        self.touch(&key);
        self.entries.insert(key, value);
        true
    }

    /// Remove an entry; the next send is a full one
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.changed_keys.remove(key);
            self.send_all = true;
        }
        removed
    }

    /// Replace the whole content; the next send is a full one
    pub fn replace_all<I, K>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, PropertyValue)>,
        K: Into<String>,
    {
        let version = self.version;
        *self = Self::new(entries);
        self.version = version;
    }

    /// Mutate one entry in place; the key is marked changed if the value moved
    pub fn with_entry_mut<R>(
        &mut self,
        key: &str,
        f: impl FnOnce(&mut PropertyValue) -> R,
    ) -> Result<R> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("map key {}", key)))?;

        let (outcome, changed) = if entry.is_tracked() {
            let outcome = f(&mut *entry);
            (outcome, entry.has_pending_changes() || !entry.is_tracked())
        } else {
            let before = entry.clone();
            let outcome = f(&mut *entry);
            let changed = *entry != before;
            (outcome, changed)
        };

        if changed {
            // the entry is resent whole
            entry.mark_clean();
            self.touch(key);
        }
        Ok(outcome)
    }

    /// Full wire value; consumes all pending changes
    pub fn take_full(&mut self) -> Value {
        self.version += 1;
        let value = self
            .entries
            .iter_mut()
            .map(|(key, value)| (key.clone(), value.take_wire_value()))
            .collect::<serde_json::Map<String, Value>>();
        self.send_all = false;
        self.changed_keys.clear();

        let full = VersionedValue {
            version: self.version,
            value: Value::Object(value),
        };
        serde_json::to_value(full).unwrap_or(Value::Null)
    }

    /// Wire value of the pending changes, or `None` when there are none
    pub fn take_delta(&mut self) -> Option<Value> {
        if !self.has_changes() {
            return None;
        }
        if self.send_all || self.changed_keys.len() >= self.entries.len() {
            return Some(self.take_full());
        }
        let keys = std::mem::take(&mut self.changed_keys);
        Some(self.partial_update(&keys))
    }

    /// Granular update carrying the given keys; consumes all pending changes
    ///
    /// Used by an owning collection that already knows which keys changed.
    pub fn partial_update(&mut self, keys: &BTreeSet<String>) -> Value {
        self.version += 1;
        let updates = keys
            .iter()
            .filter_map(|key| {
                self.entries.get_mut(key).map(|value| KeyedValue {
                    key: key.clone(),
                    value: value.take_wire_value(),
                })
            })
            .collect();
        self.mark_clean();

        let update = MapUpdate {
            version: self.version,
            updates,
        };
        serde_json::to_value(update).unwrap_or(Value::Null)
    }

    /// Apply entry updates sent by the client
    ///
    /// Returns `Ok(false)` when the update was computed against another version.
    pub fn apply_client_update(&mut self, update: &MapUpdate) -> Result<bool> {
        if update.version != self.version {
            warn!(
                expected = self.version,
                received = update.version,
                "dropping client update for stale collection version"
            );
            return Ok(false);
        }

        let mut staged: BTreeMap<&str, PropertyValue> = BTreeMap::new();
        for entry in &update.updates {
            match staged.entry(entry.key.as_str()) {
                btree_map::Entry::Occupied(mut existing) => {
                    apply_client_value(existing.get_mut(), &entry.value)?
                }
                btree_map::Entry::Vacant(slot) => match self.entries.get(&entry.key) {
                    Some(existing) => {
                        let mut value = existing.clone();
                        apply_client_value(&mut value, &entry.value)?;
                        slot.insert(value);
                    }
                    None => {
                        let value = super::wire::unwrap_versioned(&entry.value);
                        slot.insert(PropertyValue::from_json(value));
                    }
                },
            }
        }
        for (key, value) in staged {
            self.entries.insert(key.to_string(), value);
        }
        Ok(true)
    }

    /// Take over the content the client sent, without scheduling a send
    pub(crate) fn replace_from_client(&mut self, entries: &serde_json::Map<String, Value>) {
        self.entries = entries
            .iter()
            .map(|(key, value)| (key.clone(), PropertyValue::from_json(value)))
            .collect();
        self.changed_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sent(entries: &[(&str, i64)]) -> TrackedMap {
        let mut map = TrackedMap::new(entries.iter().map(|(k, v)| (*k, PropertyValue::from(*v))));
        map.take_full();
        map
    }

    #[test]
    fn test_first_send_is_full() {
        let mut map = TrackedMap::new([("a", PropertyValue::from(1))]);
        assert_eq!(map.take_delta(), Some(json!({"vEr": 1, "v": {"a": 1}})));
        assert_eq!(map.take_delta(), None);
    }

    #[test]
    fn test_changed_keys_are_granular() {
        let mut map = sent(&[("a", 1), ("b", 2), ("c", 3)]);
        assert!(map.insert("b", 20));
        assert!(!map.insert("c", 3));

        assert_eq!(
            map.take_delta(),
            Some(json!({"vEr": 2, "u": [{"k": "b", "v": 20}]}))
        );
    }

    #[test]
    fn test_new_key_is_granular() {
        let mut map = sent(&[("a", 1), ("b", 2)]);
        map.insert("c", 3);
        assert_eq!(
            map.take_delta(),
            Some(json!({"vEr": 2, "u": [{"k": "c", "v": 3}]}))
        );
    }

    #[test]
    fn test_remove_forces_full_send() {
        let mut map = sent(&[("a", 1), ("b", 2)]);
        map.remove("a");
        assert_eq!(map.take_delta(), Some(json!({"vEr": 2, "v": {"b": 2}})));
    }

    #[test]
    fn test_nested_entry_mutation() {
        let mut map = sent(&[("a", 1)]);
        map.insert("list", crate::delta::TrackedList::new(vec![1.into()]));
        map.take_full();

        map.with_entry_mut("list", |value| {
            if let PropertyValue::TrackedList(list) = value {
                list.push(2);
            }
        })
        .unwrap();
        assert_eq!(map.changed_keys().len(), 1);
        assert!(map.with_entry_mut("missing", |_| ()).is_err());
    }

    #[test]
    fn test_replace_all_keeps_version() {
        let mut map = sent(&[("a", 1)]);
        map.replace_all([("b", PropertyValue::from(2))]);
        assert!(map.sends_everything());
        assert_eq!(map.take_delta(), Some(json!({"vEr": 2, "v": {"b": 2}})));
    }

    #[test]
    fn test_client_update_versions() {
        let mut map = sent(&[("a", 1)]);
        let update: MapUpdate =
            serde_json::from_value(json!({"vEr": 1, "u": [{"k": "a", "v": 5}]})).unwrap();
        assert!(map.apply_client_update(&update).unwrap());
        assert_eq!(map.get("a"), Some(&PropertyValue::Int(5)));
        assert!(!map.has_changes());

        let stale: MapUpdate =
            serde_json::from_value(json!({"vEr": 0, "u": [{"k": "a", "v": 6}]})).unwrap();
        assert!(!map.apply_client_update(&stale).unwrap());
        assert_eq!(map.get("a"), Some(&PropertyValue::Int(5)));
    }

    #[test]
    fn test_failed_client_update_changes_nothing() {
        let mut map = sent(&[("a", 1), ("b", 2)]);
        let update: MapUpdate = serde_json::from_value(json!({
            "vEr": 1,
            "u": [{"k": "a", "v": 5}, {"k": "b", "v": {"vEr": 0, "u": []}}]
        }))
        .unwrap();

        assert!(matches!(map.apply_client_update(&update), Err(Error::Conversion(_))));
        assert_eq!(map.get("a"), Some(&PropertyValue::Int(1)));
        assert_eq!(map.get("b"), Some(&PropertyValue::Int(2)));
    }
}
