//! Outbound message assembly
//!
//! One flush collects everything pending for a window into a single message:
//! property changes, the caller's payload, service calls, component calls and
//! the response to a client-initiated call. Serializing a change may record
//! new changes; those get a bounded number of extra rounds.

use super::calls::{ComponentCallEnvelope, ReadyCalls, ServiceCallEnvelope};
use super::transport::Transport;
use crate::core::config::SyncConfig;
use crate::core::error::{Error, Result};
use crate::system::metrics::{SyncMetrics, Timer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, trace, warn};

/// Property changes of one object
pub type PropertyChanges = Map<String, Value>;

/// One message to the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// `form -> component -> property -> value`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub forms: BTreeMap<String, BTreeMap<String, PropertyChanges>>,
    /// `service -> property -> value`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, PropertyChanges>,
    /// Caller-provided payload
    #[serde(rename = "msg", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Service calls in queue order
    #[serde(rename = "serviceApis", default, skip_serializing_if = "Vec::is_empty")]
    pub service_calls: Vec<ServiceCallEnvelope>,
    /// Component calls in queue order
    #[serde(rename = "calls", default, skip_serializing_if = "Vec::is_empty")]
    pub component_calls: Vec<ComponentCallEnvelope>,
    /// Response to a client-initiated call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl OutboundMessage {
    /// Changes of a component, created on first use
    pub fn component_changes(&mut self, form: &str, component: &str) -> &mut PropertyChanges {
        self.forms
            .entry(form.to_string())
            .or_default()
            .entry(component.to_string())
            .or_default()
    }

    /// Changes of a service, created on first use
    pub fn service_changes(&mut self, service: &str) -> &mut PropertyChanges {
        self.services.entry(service.to_string()).or_default()
    }

    /// Drop objects without changes
    pub fn prune(&mut self) {
        for components in self.forms.values_mut() {
            components.retain(|_, changes| !changes.is_empty());
        }
        self.forms.retain(|_, components| !components.is_empty());
        self.services.retain(|_, changes| !changes.is_empty());
    }

    /// Number of property values carried
    pub fn change_count(&self) -> usize {
        let components: usize = self
            .forms
            .values()
            .flat_map(|components| components.values())
            .map(Map::len)
            .sum();
        let services: usize = self.services.values().map(Map::len).sum();
        components + services
    }

    /// Number of calls carried
    pub fn call_count(&self) -> usize {
        self.service_calls.len() + self.component_calls.len()
    }

    /// Whether there is nothing to send
    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
            && self.payload.is_none()
            && self.call_count() == 0
            && self.response.is_none()
    }
}

/// Everything a flush needs from a window
pub trait FlushSource {
    /// Whether any object has unsent changes
    fn has_pending_changes(&self) -> bool;

    /// Drain all pending changes into the message; returns the number written
    fn write_changes(&mut self, message: &mut OutboundMessage) -> Result<usize>;

    /// Drop all pending changes; returns the number dropped
    fn discard_pending_changes(&mut self) -> usize;

    /// Calls that can be sent now, in queue order
    fn take_ready_calls(&mut self) -> ReadyCalls;

    /// Response to a client-initiated call waiting to be shipped
    fn take_response(&mut self) -> Option<Value>;

    /// Take back a message that could not be sent
    ///
    /// Its properties are marked changed again and its calls and response are
    /// queued for the next flush.
    fn restore(&mut self, message: OutboundMessage);
}

/// What one flush did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Whether a message went to the transport
    pub sent: bool,
    /// Property values written
    pub changes: usize,
    /// Calls written
    pub calls: usize,
    /// Extra serialization rounds run
    pub extra_rounds: usize,
    /// Changes dropped at the round cap
    pub dropped_changes: usize,
}

/// Builds and sends one message per flush
#[derive(Clone)]
pub struct OutboundMessageAssembler {
    max_extra_rounds: usize,
    metrics: Option<SyncMetrics>,
}

impl Default for OutboundMessageAssembler {
    fn default() -> Self {
        Self::new(&SyncConfig::default())
    }
}

impl OutboundMessageAssembler {
    /// Create an assembler with the configured extra round cap
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            max_extra_rounds: config.max_extra_serialization_rounds,
            metrics: None,
        }
    }

    /// Record flushes into `metrics`
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_extra_rounds(&self) -> usize {
        self.max_extra_rounds
    }

    /// Send everything pending; returns whether a message went out
    pub fn flush<S>(&self, source: &mut S, transport: &dyn Transport, payload: Option<Value>) -> Result<bool>
    where
        S: FlushSource + ?Sized,
    {
        self.flush_with_report(source, transport, payload)
            .map(|report| report.sent)
    }

    /// Send everything pending and report what happened
    ///
    /// A disconnected transport fails with [`Error::TransportUnavailable`]
    /// before anything is drained, so the next flush finds the same state.
    /// Any later failure hands the assembled message back to the source.
    pub fn flush_with_report<S>(
        &self,
        source: &mut S,
        transport: &dyn Transport,
        payload: Option<Value>,
    ) -> Result<FlushReport>
    where
        S: FlushSource + ?Sized,
    {
        let timer = self
            .metrics
            .as_ref()
            .map(|metrics| Timer::start(metrics.flush.flush_duration.clone()));
        let result = self.assemble_and_send(source, transport, payload);
        if let Some(timer) = timer {
            timer.finish();
        }
        result
    }

    fn assemble_and_send<S>(
        &self,
        source: &mut S,
        transport: &dyn Transport,
        payload: Option<Value>,
    ) -> Result<FlushReport>
    where
        S: FlushSource + ?Sized,
    {
        if !transport.is_connected() {
            debug!("transport unavailable, keeping pending state for the next flush");
            return Err(Error::transport_unavailable("no live connection"));
        }

        let mut report = FlushReport::default();
        let mut message = OutboundMessage::default();

        if let Err(err) = source.write_changes(&mut message) {
            return Err(self.give_back(source, message, err));
        }
        message.payload = payload;
        let ready = source.take_ready_calls();
        message.service_calls = ready.services;
        message.component_calls = ready.components;
        message.response = source.take_response();

        while source.has_pending_changes() {
            if report.extra_rounds == self.max_extra_rounds {
                let dropped = source.discard_pending_changes();
                let overflow = Error::SerializationCycleExceeded {
                    rounds: report.extra_rounds,
                    dropped,
                };
                error!(error = %overflow, "changes keep appearing while serializing changes");
                report.dropped_changes = dropped;
                if let Some(metrics) = &self.metrics {
                    metrics.flush.cycle_overflows.inc();
                    metrics.flush.dropped_changes.inc_by(dropped as u64);
                }
                break;
            }
            report.extra_rounds += 1;
            trace!(round = report.extra_rounds, "extra serialization round");
            if let Err(err) = source.write_changes(&mut message) {
                return Err(self.give_back(source, message, err));
            }
        }

        message.prune();
        report.changes = message.change_count();
        report.calls = message.call_count();

        if let Some(metrics) = &self.metrics {
            metrics.flush.extra_rounds.inc_by(report.extra_rounds as u64);
        }

        if message.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.flush.empty_flushes.inc();
            }
            return Ok(report);
        }

        let sent = serde_json::to_value(&message)
            .map_err(Error::from)
            .and_then(|frame| transport.send(frame));
        if let Err(err) = sent {
            return Err(self.give_back(source, message, err));
        }
        report.sent = true;
        debug!(
            changes = report.changes,
            calls = report.calls,
            extra_rounds = report.extra_rounds,
            "message sent"
        );

        if let Some(metrics) = &self.metrics {
            metrics.flush.messages_sent.inc();
            metrics.flush.calls_sent.inc_by(report.calls as u64);
        }
        Ok(report)
    }

    /// Return an unsent message to its source; passes `err` through
    fn give_back<S>(&self, source: &mut S, mut message: OutboundMessage, err: Error) -> Error
    where
        S: FlushSource + ?Sized,
    {
        message.prune();
        warn!(
            error = %err,
            changes = message.change_count(),
            calls = message.call_count(),
            "flush failed, keeping the message for the next flush"
        );
        if let Some(metrics) = &self.metrics {
            metrics.flush.failed_flushes.inc();
        }
        source.restore(message);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::calls::{CallQueue, PendingCall};
    use crate::outbound::transport::ChannelTransport;
    use serde_json::json;

    /// Source whose serialization of `a` bumps `b` a fixed number of times
    #[derive(Default)]
    struct Feedback {
        pending: BTreeMap<String, i64>,
        echoes_left: usize,
        calls: CallQueue,
        response: Option<Value>,
    }

    impl FlushSource for Feedback {
        fn has_pending_changes(&self) -> bool {
            !self.pending.is_empty()
        }

        fn write_changes(&mut self, message: &mut OutboundMessage) -> Result<usize> {
            let pending = std::mem::take(&mut self.pending);
            let written = pending.len();
            for (name, value) in pending {
                message.component_changes("main", "field").insert(name, json!(value));
                if self.echoes_left > 0 {
                    self.echoes_left -= 1;
                    self.pending.insert("b".into(), value + 1);
                }
            }
            Ok(written)
        }

        fn discard_pending_changes(&mut self) -> usize {
            std::mem::take(&mut self.pending).len()
        }

        fn take_ready_calls(&mut self) -> ReadyCalls {
            self.calls.take_ready(|_| true)
        }

        fn take_response(&mut self) -> Option<Value> {
            self.response.take()
        }

        fn restore(&mut self, message: OutboundMessage) {
            for changes in message.forms.into_values().flat_map(BTreeMap::into_values) {
                for (name, value) in changes {
                    self.pending.insert(name, value.as_i64().unwrap_or_default());
                }
            }
            self.calls.requeue_front(ReadyCalls {
                services: message.service_calls,
                components: message.component_calls,
            });
            self.response = self.response.take().or(message.response);
        }
    }

    /// Connected, but every write fails
    struct Broken;

    impl Transport for Broken {
        fn is_connected(&self) -> bool {
            true
        }

        fn send(&self, _message: Value) -> Result<()> {
            Err(Error::transport_unavailable("write failed"))
        }
    }

    fn frames(receiver: &flume::Receiver<String>) -> Vec<Value> {
        receiver
            .try_iter()
            .map(|frame| serde_json::from_str(&frame).unwrap())
            .collect()
    }

    #[test]
    fn test_nothing_to_send() {
        let (transport, receiver) = ChannelTransport::new();
        let mut source = Feedback::default();

        let sent = OutboundMessageAssembler::default()
            .flush(&mut source, &transport, None)
            .unwrap();
        assert!(!sent);
        assert!(frames(&receiver).is_empty());
    }

    #[test]
    fn test_message_layout() {
        let (transport, receiver) = ChannelTransport::new();
        let mut source = Feedback::default();
        source.pending.insert("a".into(), 1);
        source.calls.push(PendingCall::component("main", "field", "focus", vec![]));
        source.calls.push(PendingCall::service("dialogs", "show", vec![json!("hi")]));
        source.response = Some(json!({"cmsgid": 4, "ret": true}));

        let sent = OutboundMessageAssembler::default()
            .flush(&mut source, &transport, Some(json!("payload")))
            .unwrap();
        assert!(sent);
        assert_eq!(
            frames(&receiver),
            vec![json!({
                "forms": {"main": {"field": {"a": 1}}},
                "msg": "payload",
                "serviceApis": [{"name": "dialogs", "call": "show", "args": ["hi"]}],
                "calls": [{"form": "main", "bean": "field", "api": "focus", "args": []}],
                "response": {"cmsgid": 4, "ret": true},
            })]
        );
    }

    #[test]
    fn test_changes_made_while_serializing_ship_in_same_message() {
        let (transport, receiver) = ChannelTransport::new();
        let mut source = Feedback {
            echoes_left: 2,
            ..Default::default()
        };
        source.pending.insert("a".into(), 1);

        let report = OutboundMessageAssembler::default()
            .flush_with_report(&mut source, &transport, None)
            .unwrap();
        assert_eq!(report.extra_rounds, 2);
        assert_eq!(report.dropped_changes, 0);
        assert_eq!(frames(&receiver)[0]["forms"]["main"]["field"], json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_round_cap_drops_excess_and_still_sends() {
        let (transport, receiver) = ChannelTransport::new();
        let mut source = Feedback {
            echoes_left: usize::MAX,
            ..Default::default()
        };
        source.pending.insert("a".into(), 1);

        let config = SyncConfig {
            max_extra_serialization_rounds: 3,
            ..Default::default()
        };
        let report = OutboundMessageAssembler::new(&config)
            .flush_with_report(&mut source, &transport, None)
            .unwrap();

        assert!(report.sent);
        assert_eq!(report.extra_rounds, 3);
        assert_eq!(report.dropped_changes, 1);
        assert!(!source.has_pending_changes());
        assert_eq!(frames(&receiver)[0]["forms"]["main"]["field"]["b"], json!(4));
    }

    #[test]
    fn test_disconnected_transport_keeps_state() {
        let (transport, _receiver) = ChannelTransport::new();
        transport.disconnect();
        let mut source = Feedback::default();
        source.pending.insert("a".into(), 1);
        source.calls.push(PendingCall::service("dialogs", "show", vec![]));

        let result = OutboundMessageAssembler::default().flush(&mut source, &transport, None);
        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
        assert!(source.has_pending_changes());
        assert_eq!(source.calls.len(), 1);
    }

    #[test]
    fn test_failed_send_hands_the_message_back() {
        let metrics = SyncMetrics::register(&prometheus::Registry::new(), "test").unwrap();
        let assembler = OutboundMessageAssembler::default().with_metrics(metrics.clone());
        let mut source = Feedback::default();
        source.pending.insert("a".into(), 1);
        source.calls.push(PendingCall::service("dialogs", "show", vec![]));
        source.response = Some(json!({"cmsgid": 1, "ret": null}));

        let result = assembler.flush(&mut source, &Broken, Some(json!("payload")));
        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
        assert_eq!(source.pending.get("a"), Some(&1));
        assert_eq!(source.calls.len(), 1);
        assert!(source.response.is_some());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failed_flushes, 1);
        assert_eq!(snapshot.timed_flushes, 1);
        assert_eq!(snapshot.messages_sent, 0);
    }
}
