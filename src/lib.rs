//! UI State Sync - server-authoritative UI state synchronization
//!
//! The server owns every component's state. Changes are tracked per property,
//! ordered collections are diffed into granular row updates, and everything
//! pending for a window goes to the client as one message per flush. Client
//! writes pass an access gate before they touch server state.

// Core foundational modules
pub mod core;
pub mod system;

// Main functional modules
pub mod delta;
pub mod outbound;
pub mod security;
pub mod session;
pub mod state;

// Re-export commonly used items for convenience
pub use core::{Config, Error, PropertyValue, Result, WindowId};
pub use delta::{OperationCoalescer, TrackedList, TrackedMap};
pub use outbound::{OutboundMessageAssembler, PendingCall, Transport};
pub use security::{AccessGate, GateOutcome, ObjectSpec, PropertySpec, PushPolicy, SpecRegistry};
pub use session::{EventDispatcher, Priority, SessionRegistry, Window};
pub use state::ObjectState;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize logging from the configuration
pub fn init(config: &Config) -> Result<()> {
    core::init_logging(&config.logging)?;
    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}
