//! Outbound side of the synchronization core
//!
//! Queued remote calls, the boundary to the transport layer and the
//! assembler that turns everything pending into one message per flush.

pub mod assembler;
pub mod calls;
pub mod transport;

pub use assembler::{FlushReport, FlushSource, OutboundMessage, OutboundMessageAssembler};
pub use calls::{CallQueue, CallTarget, PendingCall, ReadyCalls};
pub use transport::{ChannelTransport, PendingReply, ReplyRegistry, Transport};
