//! System-level monitoring
//!
//! This module contains the prometheus metrics of the synchronization core.

pub mod metrics;

pub use metrics::{MetricsSnapshot, SyncMetrics};
