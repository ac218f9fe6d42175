//! Per-object property storage with change tracking
//!
//! An [`ObjectState`] holds the properties of one component or service and
//! the set of properties changed since the last drain. Client writes are
//! checked by the access gate before they reach the store.

pub mod capabilities;
pub mod converter;
pub mod object_state;

pub use capabilities::{HasChildren, HasVisibilityGate, InvokesRemote};
pub use converter::{JsonConverter, PropertyConverter};
pub use object_state::{ChangeSet, ChangedValue, EventHandler, ObjectState, PropertyChangeListener};
