//! Core system types and foundations
//!
//! Property values and identifiers, error handling, configuration and logging
//! setup shared by every other module.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used items
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use types::{PropertyName, PropertyValue, ServerObject, WindowId};
