//! Capability traits attached per concrete object kind
//!
//! Components, forms and services share one [`ObjectState`] type for their
//! properties and pick up behaviour through these traits.
//!
//! [`ObjectState`]: super::ObjectState

use crate::core::types::PropertyValue;
use crate::outbound::{CallTarget, PendingCall};
use crate::security::ObjectSpec;
use serde_json::Value;

/// Objects whose client writes are gated by their spec's rules
pub trait HasVisibilityGate {
    /// Name reported in rejections
    fn object_name(&self) -> &str;

    /// Spec declaring the push policies and gate rules
    fn spec(&self) -> &ObjectSpec;

    /// Live value of a gate property
    fn gate_value(&self, property: &str) -> Option<&PropertyValue>;
}

/// Containers of named children
pub trait HasChildren {
    type Child;

    fn child(&self, name: &str) -> Option<&Self::Child>;

    fn child_mut(&mut self, name: &str) -> Option<&mut Self::Child>;

    /// Child names in a stable order
    fn child_names(&self) -> Vec<String>;
}

/// Objects that can have functions called on their client-side counterpart
pub trait InvokesRemote {
    /// Where calls for this object go
    fn call_target(&self) -> CallTarget;

    /// Build a fire-and-forget call
    fn remote_call(&self, function: impl Into<String>, args: Vec<Value>) -> PendingCall
    where
        Self: Sized,
    {
        PendingCall::new(self.call_target(), function, args)
    }
}
