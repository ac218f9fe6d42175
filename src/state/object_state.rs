//! Property values and change markers of one component or service

use super::capabilities::HasVisibilityGate;
use super::converter::PropertyConverter;
use crate::core::error::{Error, Result};
use crate::core::types::{PropertyName, PropertyValue};
use crate::delta::wire::{is_granular_update, is_versioned_value, ListUpdate, MapUpdate, VERSION_KEY};
use crate::delta::{TrackedList, TrackedMap};
use crate::security::{AccessGate, GateOutcome, ObjectSpec, UpdateDepth};
use serde_json::{Map, Value};
use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hook run after a property changed: `(name, old, new)`
pub type PropertyChangeListener = Arc<dyn Fn(&str, &PropertyValue, &PropertyValue) + Send + Sync>;

/// Server-side implementation of a declared event handler
pub type EventHandler = Arc<dyn Fn(&mut ObjectState, &[Value]) -> Result<Value> + Send + Sync>;

/// A drained change
#[derive(Debug, Clone, PartialEq)]
pub enum ChangedValue {
    /// Plain value, still to be converted for the wire
    Value(PropertyValue),
    /// Prepared wire delta of a tracked collection
    Delta(Value),
}

/// Changes taken from an object by one drain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<PropertyName, ChangedValue>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ChangedValue> {
        self.changes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, PropertyName, ChangedValue> {
        self.changes.iter()
    }
}

impl IntoIterator for ChangeSet {
    type Item = (PropertyName, ChangedValue);
    type IntoIter = btree_map::IntoIter<PropertyName, ChangedValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

/// Properties of one object plus the set of properties changed since the last drain
///
/// Server writes through [`set`](Self::set) are trusted; client writes go
/// through [`apply_from_client`](Self::apply_from_client) and the access gate.
pub struct ObjectState {
    name: String,
    spec: Arc<ObjectSpec>,
    properties: BTreeMap<PropertyName, PropertyValue>,
    changed: BTreeSet<PropertyName>,
    listeners: Vec<PropertyChangeListener>,
    handlers: BTreeMap<String, EventHandler>,
    dotted_paths: bool,
}

impl fmt::Debug for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectState")
            .field("name", &self.name)
            .field("spec", &self.spec.name)
            .field("properties", &self.properties)
            .field("changed", &self.changed)
            .field("listeners", &self.listeners.len())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ObjectState {
    /// Create an object seeded with its spec's default values
    ///
    /// Defaults are part of what the client is created with, so they are not
    /// marked changed.
    pub fn new(name: impl Into<String>, spec: Arc<ObjectSpec>) -> Self {
        let properties = spec
            .default_values()
            .map(|(name, value)| {
                let mut value = value.clone();
                value.mark_clean();
                (name.to_string(), value)
            })
            .collect();
        Self {
            name: name.into(),
            spec,
            properties,
            changed: BTreeSet::new(),
            listeners: Vec::new(),
            handlers: BTreeMap::new(),
            dotted_paths: true,
        }
    }

    /// Enable or disable addressing nested maps with dotted names
    pub fn with_dotted_paths(mut self, enabled: bool) -> Self {
        self.dotted_paths = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &Arc<ObjectSpec> {
        &self.spec
    }

    /// Register a hook run after every effective change
    pub fn add_listener(
        &mut self,
        listener: impl Fn(&str, &PropertyValue, &PropertyValue) + Send + Sync + 'static,
    ) {
        self.listeners.push(Arc::new(listener));
    }

    /// Register the implementation of a declared handler
    pub fn on_event(
        &mut self,
        handler: impl Into<String>,
        f: impl Fn(&mut ObjectState, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.handlers.insert(handler.into(), Arc::new(f));
    }

    /// Current value of a property
    ///
    /// With dotted paths enabled, `"a.b"` reads key `b` of map property `a`
    /// when no property is literally named `"a.b"`.
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        if let Some(value) = self.properties.get(name) {
            return Some(value);
        }
        if !self.dotted_paths || !name.contains('.') {
            return None;
        }

        let mut segments = name.split('.');
        let mut current = self.properties.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                PropertyValue::Map(entries) => entries.get(segment)?,
                PropertyValue::TrackedMap(map) => map.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Names of all properties
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Store a value; returns whether it differed from the current one
    ///
    /// Replacing a tracked collection with another one continues its version
    /// and makes the next send carry the whole new collection.
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> bool {
        let mut value = value.into();
        if self.dotted_paths && name.contains('.') && !self.properties.contains_key(name) {
            return self.set_nested(name, value);
        }

        let old = self.properties.get(name);
        if old == Some(&value) {
            return false;
        }
        match (old, &mut value) {
            (Some(PropertyValue::TrackedList(old)), PropertyValue::TrackedList(new)) => {
                new.inherit_version(old.version());
                new.mark_send_everything();
            }
            (Some(PropertyValue::TrackedMap(old)), PropertyValue::TrackedMap(new)) => {
                new.inherit_version(old.version());
                new.mark_send_everything();
            }
            _ => {}
        }

        let old = self
            .properties
            .insert(name.to_string(), value)
            .unwrap_or_default();
        self.changed.insert(name.to_string());
        trace!(object = %self.name, property = name, "property changed");
        self.notify(name, &old);
        true
    }

    fn set_nested(&mut self, name: &str, value: PropertyValue) -> bool {
        let path: Vec<&str> = name.split('.').collect();
        let root = path[0];
        let before = self.properties.get(root).cloned().unwrap_or_default();

        let target = self.properties.entry(root.to_string()).or_default();
        if !set_path(target, &path[1..], value) {
            if *target == PropertyValue::Null && before == PropertyValue::Null {
                self.properties.remove(root);
            }
            return false;
        }

        self.changed.insert(root.to_string());
        self.notify(root, &before);
        true
    }

    fn notify(&self, name: &str, old: &PropertyValue) {
        if self.listeners.is_empty() {
            return;
        }
        let new = self.properties.get(name).cloned().unwrap_or_default();
        for listener in &self.listeners {
            listener(name, old, &new);
        }
    }

    /// Tracked list property for in-place mutation; marks it changed
    pub fn list_mut(&mut self, name: &str) -> Option<&mut TrackedList> {
        match self.properties.get_mut(name) {
            Some(PropertyValue::TrackedList(list)) => {
                self.changed.insert(name.to_string());
                Some(list)
            }
            _ => None,
        }
    }

    /// Tracked map property for in-place mutation; marks it changed
    pub fn map_mut(&mut self, name: &str) -> Option<&mut TrackedMap> {
        match self.properties.get_mut(name) {
            Some(PropertyValue::TrackedMap(map)) => {
                self.changed.insert(name.to_string());
                Some(map)
            }
            _ => None,
        }
    }

    /// Whether anything was changed since the last drain
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Names of the properties changed since the last drain
    pub fn changed_properties(&self) -> impl Iterator<Item = &str> {
        self.changed.iter().map(String::as_str)
    }

    /// Whether `raw` carries a version other than the one of the tracked
    /// collection stored under `name`
    pub fn is_stale_client_value(&self, name: &str, raw: &Value) -> bool {
        let Some(received) = raw.get(VERSION_KEY).and_then(Value::as_u64) else {
            return false;
        };
        match self.properties.get(name) {
            Some(PropertyValue::TrackedList(list)) => received != u64::from(list.version()),
            Some(PropertyValue::TrackedMap(map)) => received != u64::from(map.version()),
            _ => false,
        }
    }

    /// Apply a value sent by the client
    ///
    /// The gate is consulted first; a rejection leaves the object untouched.
    /// Versioned granular updates (`{"vEr", "u"}`) go straight to the tracked
    /// collection they address and are not echoed back. Versioned values of
    /// either shape computed against another version are dropped and return
    /// `Accepted(false)`.
    pub fn apply_from_client(
        &mut self,
        name: &str,
        raw: &Value,
        converter: &dyn PropertyConverter,
    ) -> Result<GateOutcome<bool>> {
        let tracked = self.properties.get(name).is_some_and(PropertyValue::is_tracked);
        if tracked && is_granular_update(raw) {
            return self.apply_granular_from_client(name, raw);
        }

        if let GateOutcome::Rejected(rejection) = AccessGate::check_property(self, name) {
            return Ok(GateOutcome::Rejected(rejection));
        }
        if tracked && is_versioned_value(raw) && self.is_stale_client_value(name, raw) {
            warn!(
                object = %self.name,
                property = name,
                received = ?raw.get(VERSION_KEY),
                "dropping client value for stale collection version"
            );
            return Ok(GateOutcome::Accepted(false));
        }
        let value = converter.from_wire(name, raw, self.get(name))?;
        Ok(GateOutcome::Accepted(self.set(name, value)))
    }

    fn apply_granular_from_client(&mut self, name: &str, raw: &Value) -> Result<GateOutcome<bool>> {
        let nested = raw
            .get("u")
            .and_then(Value::as_array)
            .is_some_and(|updates| {
                updates
                    .iter()
                    .any(|entry| entry.get("v").is_some_and(is_granular_update))
            });
        let depth = if nested {
            UpdateDepth::Deep
        } else {
            UpdateDepth::Shallow
        };
        if let GateOutcome::Rejected(rejection) = AccessGate::check_granular(self, name, depth) {
            return Ok(GateOutcome::Rejected(rejection));
        }

        let applied = match self.properties.get_mut(name) {
            Some(PropertyValue::TrackedList(list)) => {
                let update: ListUpdate = serde_json::from_value(raw.clone())?;
                list.apply_client_update(&update)?
            }
            Some(PropertyValue::TrackedMap(map)) => {
                let update: MapUpdate = serde_json::from_value(raw.clone())?;
                map.apply_client_update(&update)?
            }
            _ => return Err(Error::not_found(format!("tracked property {}", name))),
        };
        debug!(object = %self.name, property = name, applied, "granular client update");
        Ok(GateOutcome::Accepted(applied))
    }

    /// Run a declared event handler for the client
    pub fn execute_event(&mut self, handler: &str, args: &[Value]) -> Result<GateOutcome<Value>> {
        if let GateOutcome::Rejected(rejection) = AccessGate::check_event(self, handler) {
            return Ok(GateOutcome::Rejected(rejection));
        }
        let implementation = self.handlers.get(handler).cloned().ok_or_else(|| {
            Error::not_found(format!("handler {} on {}", handler, self.name))
        })?;
        Ok(GateOutcome::Accepted(implementation(self, args)?))
    }

    /// Take every pending change at once
    ///
    /// Tracked collections hand over their prepared delta; collections whose
    /// delta turns out empty are left out.
    pub fn drain_changes(&mut self) -> ChangeSet {
        let names = std::mem::take(&mut self.changed);
        let mut changes = BTreeMap::new();
        for name in names {
            let Some(value) = self.properties.get_mut(&name) else {
                continue;
            };
            let change = match value {
                PropertyValue::TrackedList(list) => list.take_delta().map(ChangedValue::Delta),
                PropertyValue::TrackedMap(map) => map.take_delta().map(ChangedValue::Delta),
                other => Some(ChangedValue::Value(other.clone())),
            };
            if let Some(change) = change {
                changes.insert(name, change);
            }
        }
        ChangeSet { changes }
    }

    /// Drain and write all changes into `out`, converting plain values
    ///
    /// A collection already present in `out` is written in full, since the
    /// earlier delta is overwritten. Returns the number of values written.
    pub fn write_changes(
        &mut self,
        converter: &dyn PropertyConverter,
        out: &mut Map<String, Value>,
    ) -> Result<usize> {
        for name in &self.changed {
            if !out.contains_key(name) {
                continue;
            }
            match self.properties.get_mut(name) {
                Some(PropertyValue::TrackedList(list)) => list.mark_send_everything(),
                Some(PropertyValue::TrackedMap(map)) => map.mark_send_everything(),
                _ => {}
            }
        }

        let changes = self.drain_changes();
        let drained: Vec<PropertyName> = changes.names().map(str::to_string).collect();
        let mut converted = Vec::with_capacity(changes.len());
        for (name, change) in changes {
            let wire = match change {
                ChangedValue::Delta(wire) => wire,
                ChangedValue::Value(value) => match converter.to_wire(self, &name, &value) {
                    Ok(wire) => wire,
                    Err(err) => {
                        for name in &drained {
                            self.mark_for_resend(name);
                        }
                        return Err(err);
                    }
                },
            };
            converted.push((name, wire));
        }

        let written = converted.len();
        out.extend(converted);
        Ok(written)
    }

    /// Mark a property changed again after its drained value was not sent
    ///
    /// Tracked collections send everything, since their delta is gone.
    pub fn mark_for_resend(&mut self, name: &str) {
        match self.properties.get_mut(name) {
            Some(PropertyValue::TrackedList(list)) => list.mark_send_everything(),
            Some(PropertyValue::TrackedMap(map)) => map.mark_send_everything(),
            Some(_) => {}
            None => return,
        }
        self.changed.insert(name.to_string());
    }

    /// Drop pending changes without sending them; returns how many were dropped
    ///
    /// Tracked collections keep their content and send it whole next time.
    pub fn discard_changes(&mut self) -> usize {
        let names = std::mem::take(&mut self.changed);
        for name in &names {
            match self.properties.get_mut(name) {
                Some(PropertyValue::TrackedList(list)) => list.mark_send_everything(),
                Some(PropertyValue::TrackedMap(map)) => map.mark_send_everything(),
                _ => {}
            }
        }
        names.len()
    }
}

impl HasVisibilityGate for ObjectState {
    fn object_name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &ObjectSpec {
        &self.spec
    }

    fn gate_value(&self, property: &str) -> Option<&PropertyValue> {
        self.properties.get(property)
    }
}

/// Write `value` at `path` inside `target`, creating plain maps on the way
fn set_path(target: &mut PropertyValue, path: &[&str], value: PropertyValue) -> bool {
    let Some((key, rest)) = path.split_first() else {
        return false;
    };
    if *target == PropertyValue::Null {
        *target = PropertyValue::Map(BTreeMap::new());
    }

    match target {
        PropertyValue::Map(entries) => {
            if rest.is_empty() {
                if entries.get(*key) == Some(&value) {
                    return false;
                }
                entries.insert(key.to_string(), value);
                true
            } else {
                set_path(entries.entry(key.to_string()).or_default(), rest, value)
            }
        }
        PropertyValue::TrackedMap(map) => {
            if rest.is_empty() {
                map.insert(*key, value)
            } else {
                if !map.contains_key(key) {
                    map.insert(*key, PropertyValue::Null);
                }
                map.with_entry_mut(key, |entry| set_path(entry, rest, value))
                    .unwrap_or(false)
            }
        }
        _ => false,
    }
}
