//! Queued remote calls and their wire envelopes

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// Client-side receiver of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTarget {
    /// A component inside a form
    Component {
        /// Form name
        form: String,
        /// Component name
        component: String,
    },
    /// A client service
    Service {
        /// Service name
        service: String,
    },
}

/// A call waiting for the next flush
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    /// Receiver
    pub target: CallTarget,
    /// Function to call on the receiver
    pub function: String,
    /// Call arguments
    pub args: Vec<Value>,
    /// Whether the server waits for the reply
    pub blocking: bool,
    /// Hold the call until the target form is loaded on the client
    pub delay_until_form_loads: bool,
    /// Reply id of a blocking call
    pub reply_id: Option<u64>,
}

impl PendingCall {
    /// Fire-and-forget call
    pub fn new(target: CallTarget, function: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target,
            function: function.into(),
            args,
            blocking: false,
            delay_until_form_loads: false,
            reply_id: None,
        }
    }

    /// Call a component function
    pub fn component(
        form: impl Into<String>,
        component: impl Into<String>,
        function: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        let target = CallTarget::Component {
            form: form.into(),
            component: component.into(),
        };
        Self::new(target, function, args)
    }

    /// Call a service function
    pub fn service(service: impl Into<String>, function: impl Into<String>, args: Vec<Value>) -> Self {
        let target = CallTarget::Service {
            service: service.into(),
        };
        Self::new(target, function, args)
    }

    /// Hold the call until the target form is loaded
    pub fn delayed_until_form_loads(mut self) -> Self {
        self.delay_until_form_loads = true;
        self
    }

    /// Mark the call as waiting for reply `reply_id`
    pub fn blocking(mut self, reply_id: u64) -> Self {
        self.blocking = true;
        self.reply_id = Some(reply_id);
        self
    }

    /// Form the call is addressed to, for component calls
    pub fn form(&self) -> Option<&str> {
        match &self.target {
            CallTarget::Component { form, .. } => Some(form),
            CallTarget::Service { .. } => None,
        }
    }

    pub fn is_service_call(&self) -> bool {
        matches!(self.target, CallTarget::Service { .. })
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// `{"name", "call", "args"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCallEnvelope {
    pub name: String,
    pub call: String,
    pub args: Vec<Value>,
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u64>,
}

/// `{"form", "bean", "api", "args", "delayUntilFormLoads"?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCallEnvelope {
    pub form: String,
    pub bean: String,
    pub api: String,
    pub args: Vec<Value>,
    #[serde(rename = "delayUntilFormLoads", default, skip_serializing_if = "is_false")]
    pub delay_until_form_loads: bool,
    #[serde(rename = "msgId", default, skip_serializing_if = "Option::is_none")]
    pub reply_id: Option<u64>,
}

/// Calls released by one flush, service calls first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadyCalls {
    pub services: Vec<ServiceCallEnvelope>,
    pub components: Vec<ComponentCallEnvelope>,
}

impl ReadyCalls {
    pub fn len(&self) -> usize {
        self.services.len() + self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.components.is_empty()
    }
}

/// Calls in the order they were queued
#[derive(Debug, Clone, Default)]
pub struct CallQueue {
    calls: VecDeque<PendingCall>,
}

impl CallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a call behind every call already queued
    pub fn push(&mut self, call: PendingCall) {
        self.calls.push_back(call);
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drop every queued call
    pub fn clear(&mut self) -> usize {
        let dropped = self.calls.len();
        self.calls.clear();
        dropped
    }

    /// Drop the blocking call waiting for reply `reply_id`
    pub fn remove_blocking(&mut self, reply_id: u64) -> bool {
        let before = self.calls.len();
        self.calls.retain(|call| call.reply_id != Some(reply_id));
        self.calls.len() != before
    }

    /// Put calls that could not be sent back in front of the queue
    ///
    /// Service calls go first, the same order a flush writes them in.
    pub fn requeue_front(&mut self, ready: ReadyCalls) {
        let services = ready.services.into_iter().map(|envelope| PendingCall {
            target: CallTarget::Service {
                service: envelope.name,
            },
            function: envelope.call,
            args: envelope.args,
            blocking: envelope.reply_id.is_some(),
            delay_until_form_loads: false,
            reply_id: envelope.reply_id,
        });
        let components = ready.components.into_iter().map(|envelope| PendingCall {
            target: CallTarget::Component {
                form: envelope.form,
                component: envelope.bean,
            },
            function: envelope.api,
            args: envelope.args,
            blocking: envelope.reply_id.is_some(),
            delay_until_form_loads: envelope.delay_until_form_loads,
            reply_id: envelope.reply_id,
        });

        let mut calls: VecDeque<PendingCall> = services.chain(components).collect();
        calls.append(&mut self.calls);
        self.calls = calls;
    }

    /// Take every call that can go out now
    ///
    /// Calls held for a form the client has not loaded yet stay queued,
    /// unchanged and in their original order.
    pub fn take_ready(&mut self, is_form_loaded: impl Fn(&str) -> bool) -> ReadyCalls {
        let mut ready = ReadyCalls::default();
        let mut held = VecDeque::new();

        for call in self.calls.drain(..) {
            let waiting = call.delay_until_form_loads
                && call.form().is_some_and(|form| !is_form_loaded(form));
            if waiting {
                held.push_back(call);
                continue;
            }

            let PendingCall {
                target,
                function,
                args,
                delay_until_form_loads,
                reply_id,
                ..
            } = call;
            match target {
                CallTarget::Service { service } => ready.services.push(ServiceCallEnvelope {
                    name: service,
                    call: function,
                    args,
                    reply_id,
                }),
                CallTarget::Component { form, component } => {
                    ready.components.push(ComponentCallEnvelope {
                        form,
                        bean: component,
                        api: function,
                        args,
                        delay_until_form_loads,
                        reply_id,
                    })
                }
            }
        }

        self.calls = held;
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_services_go_first_in_queue_order() {
        let mut queue = CallQueue::new();
        queue.push(PendingCall::component("main", "grid", "scrollTo", vec![json!(4)]));
        queue.push(PendingCall::service("dialogs", "show", vec![]));
        queue.push(PendingCall::component("main", "field", "focus", vec![]));
        queue.push(PendingCall::service("busy", "start", vec![]));

        let ready = queue.take_ready(|_| true);
        let services: Vec<_> = ready.services.iter().map(|c| c.name.as_str()).collect();
        let components: Vec<_> = ready.components.iter().map(|c| c.bean.as_str()).collect();
        assert_eq!(services, vec!["dialogs", "busy"]);
        assert_eq!(components, vec!["grid", "field"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_delayed_calls_wait_for_their_form() {
        let mut queue = CallQueue::new();
        let delayed = PendingCall::component("detail", "field", "focus", vec![]).delayed_until_form_loads();
        queue.push(delayed.clone());
        queue.push(PendingCall::component("detail", "field", "select", vec![]));

        let ready = queue.take_ready(|form| form != "detail");
        assert_eq!(ready.components.len(), 1);
        assert_eq!(ready.components[0].api, "select");
        assert_eq!(queue.len(), 1);

        let ready = queue.take_ready(|_| true);
        assert!(ready.components[0].delay_until_form_loads);
        assert_eq!(ready.components[0].api, delayed.function);
    }

    #[test]
    fn test_requeued_calls_go_out_first() {
        let mut queue = CallQueue::new();
        queue.push(PendingCall::component("main", "grid", "scrollTo", vec![json!(4)]));
        queue.push(PendingCall::service("dialogs", "ask", vec![]).blocking(7));
        let unsent = queue.take_ready(|_| true);

        queue.push(PendingCall::component("main", "field", "focus", vec![]));
        queue.requeue_front(unsent.clone());
        assert_eq!(queue.len(), 3);

        let ready = queue.take_ready(|_| true);
        assert_eq!(ready.services, unsent.services);
        assert_eq!(ready.components[0], unsent.components[0]);
        assert_eq!(ready.components[1].api, "focus");
    }

    #[test]
    fn test_remove_blocking_call() {
        let mut queue = CallQueue::new();
        queue.push(PendingCall::service("dialogs", "ask", vec![]).blocking(3));
        queue.push(PendingCall::service("dialogs", "show", vec![]));

        assert!(queue.remove_blocking(3));
        assert!(!queue.remove_blocking(3));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_envelope_shapes() {
        let component = ComponentCallEnvelope {
            form: "main".into(),
            bean: "grid".into(),
            api: "scrollTo".into(),
            args: vec![json!(4)],
            delay_until_form_loads: false,
            reply_id: None,
        };
        assert_eq!(
            serde_json::to_value(&component).unwrap(),
            json!({"form": "main", "bean": "grid", "api": "scrollTo", "args": [4]})
        );

        let service = ServiceCallEnvelope {
            name: "dialogs".into(),
            call: "show".into(),
            args: vec![],
            reply_id: Some(3),
        };
        assert_eq!(
            serde_json::to_value(&service).unwrap(),
            json!({"name": "dialogs", "call": "show", "args": [], "msgId": 3})
        );
    }
}
