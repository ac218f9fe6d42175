//! Boundary to the transport layer and tracking of round-trip replies
//!
//! Socket handling itself lives outside this crate. [`ChannelTransport`] hands
//! serialized frames to whatever writer owns the connection.

use crate::core::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::debug;

/// Outgoing side of a client connection
pub trait Transport: Send + Sync {
    /// Whether a live connection exists
    fn is_connected(&self) -> bool;

    /// Send one message; fire-and-forget from the caller's point of view
    fn send(&self, message: Value) -> Result<()>;
}

/// Transport that forwards serialized frames over a channel
#[derive(Debug)]
pub struct ChannelTransport {
    sender: flume::Sender<String>,
    connected: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its frames
    pub fn new() -> (Self, flume::Receiver<String>) {
        let (sender, receiver) = flume::unbounded();
        let transport = Self {
            sender,
            connected: AtomicBool::new(true),
        };
        (transport, receiver)
    }

    /// Mark the connection as closed
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Mark the connection as open again
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
    }
}

impl Transport for ChannelTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.sender.is_disconnected()
    }

    fn send(&self, message: Value) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::transport_unavailable("connection closed"));
        }
        let frame = serde_json::to_string(&message)?;
        self.sender
            .send(frame)
            .map_err(|_| Error::transport_unavailable("frame receiver dropped"))
    }
}

/// Reply to a round-trip call: a value, or the client's exception text
pub type ReplyResult = std::result::Result<Value, String>;

/// Round-trip calls waiting for their reply
#[derive(Debug, Default)]
pub struct ReplyRegistry {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<ReplyResult>>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a reply id
    pub fn register(&mut self) -> (u64, PendingReply) {
        self.next_id += 1;
        let id = self.next_id;
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);
        (id, PendingReply { id, receiver })
    }

    /// Deliver the reply for `id`; returns whether anyone was waiting
    pub fn resolve(&mut self, id: u64, result: ReplyResult) -> bool {
        match self.pending.remove(&id) {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                debug!(id, "reply for unknown or abandoned call");
                false
            }
        }
    }

    /// Stop waiting for `id`; its waiter sees a cancellation
    pub fn cancel(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Cancel every pending call
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending.len();
        self.pending.clear();
        cancelled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Receiving end of one round-trip call
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    receiver: oneshot::Receiver<ReplyResult>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the reply
    ///
    /// Timeouts, cancellations and client-side failures are distinct errors.
    pub async fn wait(self, timeout: Duration) -> Result<Value> {
        let id = self.id;
        match tokio::time::timeout(timeout, self.receiver).await {
            Err(_) => Err(Error::TimedOut(timeout)),
            Ok(Err(_)) => Err(Error::Cancelled(format!("reply {} cancelled", id))),
            Ok(Ok(reply)) => reply.map_err(Error::RemoteFailure),
        }
    }

    /// Take the reply if it already arrived
    pub fn try_take(&mut self) -> Option<Result<Value>> {
        match self.receiver.try_recv() {
            Ok(reply) => Some(reply.map_err(Error::RemoteFailure)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => {
                Some(Err(Error::Cancelled(format!("reply {} cancelled", self.id))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_transport_frames() {
        let (transport, frames) = ChannelTransport::new();
        transport.send(json!({"msg": 1})).unwrap();
        assert_eq!(frames.try_recv().unwrap(), r#"{"msg":1}"#);

        transport.disconnect();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(json!({})),
            Err(Error::TransportUnavailable(_))
        ));
    }

    #[test]
    fn test_dropped_receiver_is_unavailable() {
        let (transport, frames) = ChannelTransport::new();
        drop(frames);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_reply_arrives() {
        let mut registry = ReplyRegistry::new();
        let (id, reply) = registry.register();
        assert!(registry.resolve(id, Ok(json!(42))));
        assert_eq!(reply.wait(Duration::from_secs(1)).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_reply_errors_are_distinct() {
        let mut registry = ReplyRegistry::new();

        let (_, timed_out) = registry.register();
        let err = timed_out.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::TimedOut(_)));

        let (id, cancelled) = registry.register();
        registry.cancel(id);
        let err = cancelled.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));

        let (id, failed) = registry.register();
        registry.resolve(id, Err("boom".into()));
        let err = failed.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::RemoteFailure(ref msg) if msg == "boom"));
    }

    #[test]
    fn test_try_take() {
        let mut registry = ReplyRegistry::new();
        let (id, mut reply) = registry.register();
        assert!(reply.try_take().is_none());
        registry.resolve(id, Ok(json!("ok")));
        assert_eq!(reply.try_take().unwrap().unwrap(), json!("ok"));
        assert_eq!(registry.cancel_all(), 0);
    }
}
