//! Ordered collection with granular change tracking

use super::coalescer::OperationCoalescer;
use super::operation::{ArrayOperation, OperationKind};
use super::wire::{IndexedRows, IndexedValue, ListUpdate, VersionedValue};
use crate::core::error::{Error, Result};
use crate::core::types::PropertyValue;
use serde_json::Value;
use std::collections::{btree_map, BTreeMap};
use std::mem::discriminant;
use tracing::{debug, warn};

/// Ordered collection that records structural operations between sends
///
/// Every mutation goes through this type, so the recorded operations always
/// describe exactly how the collection moved away from what the client holds.
/// A version is bumped each time the client is sent something, and client
/// updates computed against another version are dropped.
#[derive(Debug, Clone)]
pub struct TrackedList {
    elements: Vec<PropertyValue>,
    keeper: OperationCoalescer,
    version: u32,
    send_all: bool,
}

impl PartialEq for TrackedList {
    fn eq(&self, other: &Self) -> bool {
        self.elements == other.elements
    }
}

impl Default for TrackedList {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl TrackedList {
    /// Create a list the client has never seen; the first send is a full one
    pub fn new(mut elements: Vec<PropertyValue>) -> Self {
        elements.iter_mut().for_each(PropertyValue::mark_clean);
        Self {
            keeper: OperationCoalescer::new(elements.len()),
            elements,
            version: 0,
            send_all: true,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PropertyValue> {
        self.elements.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PropertyValue> {
        self.elements.iter()
    }

    pub fn as_slice(&self) -> &[PropertyValue] {
        &self.elements
    }

    /// Version of the last content sent to or acknowledged from the client
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Whether the next send has to carry the whole collection
    pub fn sends_everything(&self) -> bool {
        self.send_all
    }

    /// Whether anything has to be sent
    pub fn has_changes(&self) -> bool {
        self.send_all || self.keeper.has_changes()
    }

    /// Force the next send to be a full one
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
        self.keeper.reset(self.elements.len(), self.elements.len());
        self.elements.iter_mut().for_each(PropertyValue::mark_clean);
    }

    /// Operations recorded since the last send
    pub fn pending_operations(&self) -> Vec<ArrayOperation> {
        if self.send_all {
            Vec::new()
        } else {
            self.keeper.equivalent_operations()
        }
    }

    fn record(&mut self, operation: ArrayOperation) -> Result<()> {
        if self.send_all {
            return Ok(());
        }
        self.keeper.process_operation(&operation)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.elements.len() {
            return Err(Error::invalid_operation(format!(
                "index {} out of range for {} rows",
                index,
                self.elements.len()
            )));
        }
        Ok(())
    }

    /// Append a row
    pub fn push(&mut self, value: impl Into<PropertyValue>) {
        let index = self.elements.len();
        let mut value = value.into();
        value.mark_clean();
        self.elements.push(value);
        // the index is always valid here
        let _ = self.record(ArrayOperation::insert(index, index));
    }

    /// Insert a row at `index`, shifting later rows
    pub fn insert(&mut self, index: usize, value: impl Into<PropertyValue>) -> Result<()> {
        if index > self.elements.len() {
            return Err(Error::invalid_operation(format!(
                "insert index {} beyond {} rows",
                index,
                self.elements.len()
            )));
        }
        self.record(ArrayOperation::insert(index, index))?;
        let mut value = value.into();
        value.mark_clean();
        self.elements.insert(index, value);
        Ok(())
    }

    /// Replace the row at `index`; returns whether the value actually changed
    pub fn set(&mut self, index: usize, value: impl Into<PropertyValue>) -> Result<bool> {
        self.check_index(index)?;
        let mut value = value.into();
        if self.elements[index] == value {
            return Ok(false);
        }
        self.record(ArrayOperation::change(index, index))?;
        value.mark_clean();
        self.elements[index] = value;
        Ok(true)
    }

    /// Remove the row at `index`
    pub fn remove(&mut self, index: usize) -> Result<PropertyValue> {
        self.check_index(index)?;
        self.record(ArrayOperation::delete(index, index))?;
        Ok(self.elements.remove(index))
    }

    /// Drop every row from `len` on
    pub fn truncate(&mut self, len: usize) {
        if len < self.elements.len() {
            let _ = self.record(ArrayOperation::delete(len, self.elements.len() - 1));
            self.elements.truncate(len);
        }
    }

    /// Remove every row
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Replace the whole content; the next send is a full one
    pub fn replace_all(&mut self, mut elements: Vec<PropertyValue>) {
        elements.iter_mut().for_each(PropertyValue::mark_clean);
        self.elements = elements;
        self.send_all = true;
    }

    /// Mutate one row in place and record what changed
    ///
    /// Nested tracked maps report the keys they changed, which become a
    /// column-restricted change; anything else is compared before and after.
    pub fn with_element_mut<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut PropertyValue) -> R,
    ) -> Result<R> {
        self.check_index(index)?;
        let element = &mut self.elements[index];

        let (outcome, operation) = if element.is_tracked() {
            let kind = discriminant(&*element);
            let outcome = f(&mut *element);
            let operation = if discriminant(&*element) != kind {
                Some(ArrayOperation::change(index, index))
            } else {
                nested_change(index, element)
            };
            (outcome, operation)
        } else {
            let before = element.clone();
            let outcome = f(&mut *element);
            let operation = (*element != before).then(|| ArrayOperation::change(index, index));
            (outcome, operation)
        };

        if let Some(operation) = operation {
            self.record(operation)?;
        }
        Ok(outcome)
    }

    /// Full wire value; consumes all pending changes
    pub fn take_full(&mut self) -> Value {
        self.version += 1;
        let values = self
            .elements
            .iter_mut()
            .map(PropertyValue::take_wire_value)
            .collect();
        self.send_all = false;
        self.keeper.reset(self.elements.len(), self.elements.len());

        let full = VersionedValue {
            version: self.version,
            value: Value::Array(values),
        };
        serde_json::to_value(full).unwrap_or(Value::Null)
    }

    /// Wire value of the pending changes, or `None` when there are none
    ///
    /// Falls back to a full value when every row would be resent anyway.
    pub fn take_delta(&mut self) -> Option<Value> {
        if !self.has_changes() {
            return None;
        }
        let resends_everything =
            !self.elements.is_empty() && self.keeper.rows_to_send() >= self.elements.len();
        if self.send_all || resends_everything {
            return Some(self.take_full());
        }
        Some(self.take_granular())
    }

    fn take_granular(&mut self) -> Value {
        let operations = self.keeper.equivalent_operations();
        self.version += 1;
        let mut update = ListUpdate {
            version: self.version,
            ..Default::default()
        };

        // replay position minus original index
        let mut inserted = 0usize;
        let mut deleted = 0usize;
        let last = self.elements.len().saturating_sub(1);

        for operation in &operations {
            let range = operation.start_index..=operation.end_index;
            match operation.kind {
                OperationKind::Delete => {
                    let original = operation.start_index + deleted - inserted;
                    update
                        .deleted
                        .extend(original..original + operation.len());
                    deleted += operation.len();
                }
                OperationKind::Insert => {
                    let values: Vec<Value> = self.elements[range]
                        .iter_mut()
                        .map(PropertyValue::take_wire_value)
                        .collect();
                    if operation.end_index == last {
                        update.appended.extend(values);
                    } else {
                        update.inserts.push(IndexedRows {
                            index: operation.start_index,
                            values,
                        });
                    }
                    inserted += operation.len();
                }
                OperationKind::Change => {
                    for index in range {
                        let element = &mut self.elements[index];
                        let value = match (&operation.column_names, element) {
                            (Some(columns), PropertyValue::TrackedMap(map)) => {
                                map.partial_update(columns)
                            }
                            (_, element) => element.take_wire_value(),
                        };
                        update.updates.push(IndexedValue { index, value });
                    }
                }
            }
        }

        debug!(
            version = self.version,
            operations = operations.len(),
            "granular list update"
        );
        self.keeper.reset(self.elements.len(), self.elements.len());
        serde_json::to_value(update).unwrap_or(Value::Null)
    }

    /// Apply row updates sent by the client
    ///
    /// Returns `Ok(false)` when the update was computed against another version;
    /// the client will get the current content with the next send.
    pub fn apply_client_update(&mut self, update: &ListUpdate) -> Result<bool> {
        if update.version != self.version {
            warn!(
                expected = self.version,
                received = update.version,
                "dropping client update for stale collection version"
            );
            return Ok(false);
        }
        if !update.is_update_only() {
            return Err(Error::conversion(
                "clients may only update existing rows of a collection",
            ));
        }

        // stage every row first so a bad entry leaves the collection untouched
        let mut staged: BTreeMap<usize, PropertyValue> = BTreeMap::new();
        for entry in &update.updates {
            self.check_index(entry.index)?;
            let row = match staged.entry(entry.index) {
                btree_map::Entry::Occupied(row) => row.into_mut(),
                btree_map::Entry::Vacant(row) => row.insert(self.elements[entry.index].clone()),
            };
            apply_client_value(row, &entry.value)?;
        }
        for (index, row) in staged {
            self.elements[index] = row;
        }
        Ok(true)
    }
}

/// Operation describing pending changes inside a nested tracked value
fn nested_change(index: usize, element: &mut PropertyValue) -> Option<ArrayOperation> {
    match element {
        PropertyValue::TrackedMap(map) if map.sends_everything() => {
            map.mark_clean();
            Some(ArrayOperation::change(index, index))
        }
        PropertyValue::TrackedMap(map) if map.has_changes() => {
            let columns = map.changed_keys().clone();
            Some(ArrayOperation::new(
                index,
                index,
                OperationKind::Change,
                Some(columns),
            ))
        }
        PropertyValue::TrackedList(list) if list.has_changes() => {
            list.mark_clean();
            Some(ArrayOperation::change(index, index))
        }
        _ => None,
    }
}

/// Store a value received from the client into a row or entry
///
/// Nested granular updates go to the tracked collection they address; plain
/// values replace the row. Nothing is recorded since the client already has it.
pub(crate) fn apply_client_value(target: &mut PropertyValue, raw: &Value) -> Result<()> {
    if super::wire::is_granular_update(raw) {
        return match target {
            PropertyValue::TrackedMap(map) => {
                let nested = serde_json::from_value(raw.clone())?;
                map.apply_client_update(&nested).map(|_| ())
            }
            PropertyValue::TrackedList(list) => {
                let nested = serde_json::from_value(raw.clone())?;
                list.apply_client_update(&nested).map(|_| ())
            }
            other => Err(Error::conversion(format!(
                "nested update for a {} value",
                other.type_name()
            ))),
        };
    }

    let value = super::wire::unwrap_versioned(raw);
    match target {
        PropertyValue::TrackedMap(map) => {
            if let Value::Object(entries) = value {
                map.replace_from_client(entries);
                return Ok(());
            }
        }
        PropertyValue::TrackedList(list) => {
            if let Value::Array(items) = value {
                list.replace_from_client(items);
                return Ok(());
            }
        }
        _ => {}
    }
    *target = PropertyValue::from_json(value);
    Ok(())
}

impl TrackedList {
    /// Take over the content the client sent, without scheduling a send
    pub(crate) fn replace_from_client(&mut self, items: &[Value]) {
        self.elements = items.iter().map(PropertyValue::from_json).collect();
        self.keeper.reset(self.elements.len(), self.elements.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::wire::apply_list_update;
    use crate::delta::TrackedMap;
    use serde_json::json;

    fn clean(values: &[&str]) -> TrackedList {
        let mut list = TrackedList::new(values.iter().map(|v| PropertyValue::from(*v)).collect());
        list.take_full();
        list
    }

    fn mirror(list: &TrackedList) -> Vec<Value> {
        list.iter().map(PropertyValue::to_json).collect()
    }

    #[test]
    fn test_first_send_is_full() {
        let mut list = TrackedList::new(vec!["a".into(), "b".into()]);
        assert_eq!(list.take_delta(), Some(json!({"vEr": 1, "v": ["a", "b"]})));
        assert_eq!(list.take_delta(), None);
    }

    #[test]
    fn test_set_to_equal_value_is_not_a_change() {
        let mut list = clean(&["a"]);
        assert!(!list.set(0, "a").unwrap());
        assert!(!list.has_changes());
    }

    #[test]
    fn test_single_change_is_granular() {
        let mut list = clean(&["a", "b", "c"]);
        list.set(1, "B").unwrap();

        assert_eq!(
            list.take_delta(),
            Some(json!({"vEr": 2, "u": [{"i": 1, "v": "B"}]}))
        );
        assert_eq!(list.version(), 2);
    }

    #[test]
    fn test_all_rows_changed_falls_back_to_full() {
        let mut list = clean(&["a", "b"]);
        list.set(0, "A").unwrap();
        list.set(1, "B").unwrap();

        assert_eq!(list.take_delta(), Some(json!({"vEr": 2, "v": ["A", "B"]})));
    }

    #[test]
    fn test_structural_update_reproduces_collection() {
        let mut list = clean(&["a", "b", "c", "d", "e"]);
        let mut client = mirror(&list);

        list.remove(1).unwrap();
        list.insert(1, "x").unwrap();
        list.set(3, "D").unwrap();
        list.push("z");

        let delta = list.take_delta().unwrap();
        let update: ListUpdate = serde_json::from_value(delta).unwrap();
        assert_eq!(update.deleted, vec![1]);
        assert_eq!(update.appended, vec![json!("z")]);

        apply_list_update(&mut client, &update).unwrap();
        assert_eq!(client, mirror(&list));
    }

    #[test]
    fn test_nested_map_change_is_column_restricted() {
        let mut row = TrackedMap::new([("name", "a".into()), ("size", 1.into())]);
        row.mark_clean();
        let mut list = TrackedList::new(vec![row.into(), "other".into()]);
        list.take_full();

        list.with_element_mut(0, |element| {
            if let PropertyValue::TrackedMap(map) = element {
                map.insert("size", 2);
            }
        })
        .unwrap();

        assert_eq!(
            list.pending_operations(),
            vec![ArrayOperation::partial_change(0, 0, ["size"])]
        );
        let delta = list.take_delta().unwrap();
        assert_eq!(delta["u"][0]["i"], json!(0));
        assert_eq!(delta["u"][0]["v"]["u"], json!([{"k": "size", "v": 2}]));
    }

    #[test]
    fn test_untouched_element_records_nothing() {
        let mut list = clean(&["a"]);
        let len = list.with_element_mut(0, |element| element.type_name().len()).unwrap();
        assert_eq!(len, 6);
        assert!(!list.has_changes());
    }

    #[test]
    fn test_replace_all_is_sticky_until_sent() {
        let mut list = clean(&["a"]);
        list.replace_all(vec!["b".into(), "c".into()]);
        list.set(0, "B").unwrap();

        assert!(list.pending_operations().is_empty());
        assert_eq!(list.take_delta(), Some(json!({"vEr": 2, "v": ["B", "c"]})));
    }

    #[test]
    fn test_stale_client_update_is_dropped() {
        let mut list = clean(&["a", "b"]);
        let stale = ListUpdate {
            version: 0,
            updates: vec![IndexedValue {
                index: 0,
                value: json!("x"),
            }],
            ..Default::default()
        };
        assert!(!list.apply_client_update(&stale).unwrap());
        assert_eq!(list.get(0), Some(&PropertyValue::from("a")));

        let current = ListUpdate {
            version: 1,
            ..stale
        };
        assert!(list.apply_client_update(&current).unwrap());
        assert_eq!(list.get(0), Some(&PropertyValue::from("x")));
        assert!(!list.has_changes());
    }

    #[test]
    fn test_client_update_with_bad_row_changes_nothing() {
        let mut list = clean(&["a", "b"]);
        let update: ListUpdate =
            serde_json::from_value(json!({"vEr": 1, "u": [{"i": 0, "v": "x"}, {"i": 7, "v": "y"}]}))
                .unwrap();

        assert!(list.apply_client_update(&update).is_err());
        assert_eq!(mirror(&list), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_client_may_not_restructure() {
        let mut list = clean(&["a"]);
        let update = ListUpdate {
            version: 1,
            deleted: vec![0],
            ..Default::default()
        };
        assert!(matches!(
            list.apply_client_update(&update),
            Err(Error::Conversion(_))
        ));
    }

    #[test]
    fn test_out_of_range_mutations_fail() {
        let mut list = clean(&["a"]);
        assert!(list.set(1, "b").is_err());
        assert!(list.remove(1).is_err());
        assert!(list.insert(2, "b").is_err());
        assert!(!list.has_changes());
    }
}
