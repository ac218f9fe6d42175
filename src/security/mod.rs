//! Access control for client-originated changes
//!
//! Object specs declare push policies and gate rules; the access gate
//! evaluates them against live property values.

pub mod gate;
pub mod schema;

// Re-export commonly used types
pub use gate::{AccessGate, GateOutcome, Rejection, UpdateDepth};
pub use schema::{GateKind, HandlerSpec, ObjectSpec, PropertySpec, PushPolicy, SpecRegistry};
