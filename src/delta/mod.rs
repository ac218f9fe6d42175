//! Granular change tracking for collection properties
//!
//! This module provides the pieces that let a collection send only what
//! changed since the client last saw it:
//! - structural operations over ordered collections
//! - the coalescer that folds any history of operations into the minimal
//!   equivalent sequence
//! - tracked list and map types that record their own mutations
//! - the versioned wire shapes exchanged with the client

pub mod coalescer;
pub mod operation;
pub mod tracked_list;
pub mod tracked_map;
pub mod wire;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use coalescer::{Interval, IntervalKind, OperationCoalescer};
pub use operation::{ArrayOperation, OperationKind};
pub use tracked_list::TrackedList;
pub use tracked_map::TrackedMap;
pub use wire::{ListUpdate, MapUpdate, VersionedValue};
