//! Session layer: the per-session dispatcher, the ambient window and the
//! window object model

pub mod component;
pub mod context;
pub mod dispatcher;
pub mod incoming;
pub mod registry;
pub mod window;

pub use component::{ClientService, Component, Form};
pub use context::{current_window, WindowScope};
pub use dispatcher::{DispatcherHandle, EventDispatcher, Priority, SuspendOutcome, Task, WaitToken};
pub use incoming::IncomingMessage;
pub use registry::SessionRegistry;
pub use window::Window;
