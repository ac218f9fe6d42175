//! Window object model: forms holding components, and client services

use crate::outbound::CallTarget;
use crate::state::{HasChildren, InvokesRemote, ObjectState};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// A component inside a form
#[derive(Debug)]
pub struct Component {
    form: String,
    state: ObjectState,
}

impl Component {
    pub fn new(form: impl Into<String>, state: ObjectState) -> Self {
        Self {
            form: form.into(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn form(&self) -> &str {
        &self.form
    }

    pub fn state(&self) -> &ObjectState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ObjectState {
        &mut self.state
    }
}

impl InvokesRemote for Component {
    fn call_target(&self) -> CallTarget {
        CallTarget::Component {
            form: self.form.clone(),
            component: self.state.name().to_string(),
        }
    }
}

/// A form and its components
#[derive(Debug)]
pub struct Form {
    name: String,
    components: BTreeMap<String, Component>,
    loaded: bool,
}

impl Form {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: BTreeMap::new(),
            loaded: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the client has loaded this form
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    /// Add a component, replacing one with the same name
    pub fn add(&mut self, state: ObjectState) -> &mut Component {
        let component = Component::new(self.name.clone(), state);
        match self.components.entry(component.name().to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(component);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(component),
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn components_mut(&mut self) -> impl Iterator<Item = &mut Component> {
        self.components.values_mut()
    }
}

impl HasChildren for Form {
    type Child = Component;

    fn child(&self, name: &str) -> Option<&Component> {
        self.components.get(name)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Component> {
        self.components.get_mut(name)
    }

    fn child_names(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }
}

/// A client-side service with server-synchronized state
#[derive(Debug)]
pub struct ClientService {
    state: ObjectState,
}

impl ClientService {
    pub fn new(state: ObjectState) -> Self {
        Self { state }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn state(&self) -> &ObjectState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ObjectState {
        &mut self.state
    }
}

impl InvokesRemote for ClientService {
    fn call_target(&self) -> CallTarget {
        CallTarget::Service {
            service: self.state.name().to_string(),
        }
    }
}
