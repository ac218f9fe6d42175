//! Object specifications: push policies, gate rules and handlers
//!
//! Specs are built once through [`SpecRegistryBuilder`], then shared read-only.

use crate::core::error::{Error, Result};
use crate::core::types::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// How far the client may push changes to a property
///
/// Policies are ordered: each one allows everything the previous one allows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushPolicy {
    /// The client may not change the property at all
    #[default]
    Reject,
    /// The client may replace the whole value
    Allow,
    /// The client may also update single rows or entries of a collection
    Shallow,
    /// The client may also update content nested inside rows or entries
    Deep,
}

impl fmt::Display for PushPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PushPolicy::Reject => "reject",
            PushPolicy::Allow => "allow",
            PushPolicy::Shallow => "shallow",
            PushPolicy::Deep => "deep",
        };
        f.write_str(name)
    }
}

/// Gate role of a property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateKind {
    /// Ordinary property
    Plain,
    /// Blocks client writes and events while its value equals `blocking_on`
    ///
    /// The property itself can never be written by the client.
    Protected {
        /// Value that blocks
        blocking_on: bool,
        /// Constrained siblings; `None` constrains the whole object
        for_entries: Option<Vec<String>>,
    },
    /// Blocks client writes and events while its value is `false`
    Visibility {
        /// Constrained siblings; `None` constrains the whole object
        for_entries: Option<Vec<String>>,
    },
}

/// Declaration of one property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    /// Property name
    pub name: String,
    /// What the client may push
    pub push_policy: PushPolicy,
    /// Gate role
    pub gate: GateKind,
    /// Initial value seeded into new objects
    pub default: Option<PropertyValue>,
}

impl PropertySpec {
    /// Plain property the client may not write
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            push_policy: PushPolicy::Reject,
            gate: GateKind::Plain,
            default: None,
        }
    }

    /// Protecting property; blocks while its value is `blocking_on`
    pub fn protected(name: impl Into<String>, blocking_on: bool) -> Self {
        Self {
            gate: GateKind::Protected {
                blocking_on,
                for_entries: None,
            },
            default: Some(PropertyValue::Bool(!blocking_on)),
            ..Self::new(name)
        }
    }

    /// Visibility property; blocks while `false`
    pub fn visibility(name: impl Into<String>) -> Self {
        Self {
            gate: GateKind::Visibility { for_entries: None },
            default: Some(PropertyValue::Bool(true)),
            ..Self::new(name)
        }
    }

    /// Set the push policy
    pub fn push(mut self, policy: PushPolicy) -> Self {
        self.push_policy = policy;
        self
    }

    /// Restrict a gate rule to the named siblings
    pub fn for_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = entries.into_iter().map(Into::into).collect();
        match &mut self.gate {
            GateKind::Protected { for_entries, .. } | GateKind::Visibility { for_entries } => {
                *for_entries = Some(names)
            }
            GateKind::Plain => {}
        }
        self
    }

    /// Set the initial value
    pub fn with_default(mut self, value: impl Into<PropertyValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Whether this property is a gate rule
    pub fn is_gate(&self) -> bool {
        self.gate != GateKind::Plain
    }

    /// Whether the client can never write this property, whatever the gates say
    pub fn is_intrinsically_protected(&self) -> bool {
        matches!(self.gate, GateKind::Protected { .. }) || self.push_policy == PushPolicy::Reject
    }

    /// Whether this gate rule constrains `entry` (a property or handler name)
    pub fn constrains(&self, entry: &str) -> bool {
        if entry == self.name {
            return false;
        }
        match &self.gate {
            GateKind::Plain => false,
            GateKind::Protected { for_entries, .. } | GateKind::Visibility { for_entries } => {
                for_entries
                    .as_ref()
                    .map_or(true, |names| names.iter().any(|name| name == entry))
            }
        }
    }

    /// Whether this gate rule blocks given the live value of its property
    pub fn is_blocking(&self, value: Option<&PropertyValue>) -> bool {
        let flag = value.and_then(PropertyValue::as_bool);
        match &self.gate {
            GateKind::Plain => false,
            GateKind::Protected { blocking_on, .. } => flag == Some(*blocking_on),
            GateKind::Visibility { .. } => flag == Some(false),
        }
    }
}

/// Declaration of one event handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// Handler name
    pub name: String,
}

impl HandlerSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Declaration of a component or service type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSpec {
    /// Spec name
    pub name: String,
    properties: Vec<PropertySpec>,
    handlers: BTreeMap<String, HandlerSpec>,
}

impl ObjectSpec {
    /// Create an empty spec
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a property; a redeclaration replaces the earlier one in place
    pub fn property(mut self, spec: PropertySpec) -> Self {
        match self.properties.iter_mut().find(|p| p.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.properties.push(spec),
        }
        self
    }

    /// Declare an event handler
    pub fn handler(mut self, name: impl Into<String>) -> Self {
        let handler = HandlerSpec::new(name);
        self.handlers.insert(handler.name.clone(), handler);
        self
    }

    /// Look up a property declaration
    pub fn get_property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a handler declaration
    pub fn get_handler(&self, name: &str) -> Option<&HandlerSpec> {
        self.handlers.get(name)
    }

    /// All property declarations in declaration order
    pub fn properties(&self) -> &[PropertySpec] {
        &self.properties
    }

    /// Gate rules in declaration order
    pub fn gate_rules(&self) -> impl Iterator<Item = &PropertySpec> {
        self.properties.iter().filter(|p| p.is_gate())
    }

    /// Initial values for a new object
    pub fn default_values(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties
            .iter()
            .filter_map(|p| p.default.as_ref().map(|value| (p.name.as_str(), value)))
    }
}

/// Immutable set of object specs, shared by reference
#[derive(Debug, Default)]
pub struct SpecRegistry {
    specs: HashMap<String, Arc<ObjectSpec>>,
}

impl SpecRegistry {
    /// Start building a registry
    pub fn builder() -> SpecRegistryBuilder {
        SpecRegistryBuilder::default()
    }

    /// Look up a spec by name
    pub fn get(&self, name: &str) -> Result<Arc<ObjectSpec>> {
        self.specs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("object spec {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Builder for [`SpecRegistry`]
#[derive(Debug, Default)]
pub struct SpecRegistryBuilder {
    specs: HashMap<String, Arc<ObjectSpec>>,
}

impl SpecRegistryBuilder {
    /// Add a spec; names must be unique
    pub fn register(mut self, spec: ObjectSpec) -> Result<Self> {
        if self.specs.contains_key(&spec.name) {
            return Err(Error::config(format!(
                "object spec {} registered twice",
                spec.name
            )));
        }
        self.specs.insert(spec.name.clone(), Arc::new(spec));
        Ok(self)
    }

    /// Freeze the registry
    pub fn build(self) -> Arc<SpecRegistry> {
        Arc::new(SpecRegistry { specs: self.specs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_policy_order() {
        assert!(PushPolicy::Reject < PushPolicy::Allow);
        assert!(PushPolicy::Allow < PushPolicy::Shallow);
        assert!(PushPolicy::Shallow < PushPolicy::Deep);
        assert_eq!(PushPolicy::default(), PushPolicy::Reject);
    }

    #[test]
    fn test_rule_scope() {
        let whole = PropertySpec::visibility("visible");
        let scoped = PropertySpec::protected("locked", true).for_entries(["text"]);

        assert!(whole.constrains("text"));
        assert!(whole.constrains("onClick"));
        assert!(!whole.constrains("visible"));
        assert!(scoped.constrains("text"));
        assert!(!scoped.constrains("size"));
    }

    #[test]
    fn test_blocking_evaluation() {
        let enabled = PropertySpec::protected("enabled", false);
        assert!(enabled.is_blocking(Some(&PropertyValue::Bool(false))));
        assert!(!enabled.is_blocking(Some(&PropertyValue::Bool(true))));
        assert!(!enabled.is_blocking(None));
        assert_eq!(enabled.default, Some(PropertyValue::Bool(true)));

        let visible = PropertySpec::visibility("visible");
        assert!(visible.is_blocking(Some(&PropertyValue::Bool(false))));
        assert!(!visible.is_blocking(Some(&PropertyValue::Null)));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SpecRegistry::builder()
            .register(ObjectSpec::new("button").handler("onClick"))
            .unwrap()
            .build();

        assert!(registry.get("button").unwrap().get_handler("onClick").is_some());
        assert!(matches!(registry.get("label"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_spec_is_config_error() {
        let result = SpecRegistry::builder()
            .register(ObjectSpec::new("button"))
            .unwrap()
            .register(ObjectSpec::new("button"));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
