//! A browser window bound to a session
//!
//! The window owns the forms, components and services the client shows, the
//! calls waiting for the next flush, and the round-trip calls waiting for a
//! client reply. It is the state the session's [`EventDispatcher`] runs
//! tasks against.

use super::component::{ClientService, Component, Form};
use super::dispatcher::{EventDispatcher, Priority, WaitToken};
use super::incoming::IncomingMessage;
use crate::core::config::{Config, MetricsConfig};
use crate::core::error::{Error, Result};
use crate::core::types::WindowId;
use crate::outbound::{
    CallQueue, FlushReport, FlushSource, OutboundMessage, OutboundMessageAssembler, PendingCall,
    ReadyCalls, ReplyRegistry, Transport,
};
use crate::security::{GateOutcome, SpecRegistry};
use crate::state::{HasChildren, InvokesRemote, JsonConverter, ObjectState, PropertyConverter};
use crate::system::metrics::SyncMetrics;
use prometheus::Registry;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Server-side model of one client window
pub struct Window {
    id: WindowId,
    specs: Arc<SpecRegistry>,
    transport: Arc<dyn Transport>,
    converter: Arc<dyn PropertyConverter>,
    assembler: OutboundMessageAssembler,
    metrics: Option<SyncMetrics>,
    forms: BTreeMap<String, Form>,
    services: BTreeMap<String, ClientService>,
    calls: CallQueue,
    response: Option<Value>,
    replies: ReplyRegistry,
    reply_tokens: HashMap<u64, WaitToken>,
    call_timeout: Duration,
    dotted_paths: bool,
    metrics_config: MetricsConfig,
    disposed: bool,
}

impl Window {
    pub fn new(specs: Arc<SpecRegistry>, transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self {
            id: WindowId::random(),
            specs,
            transport,
            converter: Arc::new(JsonConverter),
            assembler: OutboundMessageAssembler::new(&config.sync),
            metrics: None,
            forms: BTreeMap::new(),
            services: BTreeMap::new(),
            calls: CallQueue::new(),
            response: None,
            replies: ReplyRegistry::new(),
            reply_tokens: HashMap::new(),
            call_timeout: config.dispatcher.call_timeout,
            dotted_paths: config.sync.dotted_property_paths,
            metrics_config: config.metrics.clone(),
            disposed: false,
        }
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.assembler = self.assembler.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Register this window's metrics into `registry` as configured
    ///
    /// Leaves the window without metrics when they are disabled. Windows
    /// sharing one registry share one [`SyncMetrics`] through
    /// [`with_metrics`](Self::with_metrics) instead.
    pub fn with_registry(self, registry: &Registry) -> Result<Self> {
        match SyncMetrics::from_config(&self.metrics_config, registry)? {
            Some(metrics) => Ok(self.with_metrics(metrics)),
            None => Ok(self),
        }
    }

    pub fn metrics(&self) -> Option<&SyncMetrics> {
        self.metrics.as_ref()
    }

    pub fn with_converter(mut self, converter: Arc<dyn PropertyConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn new_state(&self, name: &str, spec: &str) -> Result<ObjectState> {
        let spec = self.specs.get(spec)?;
        Ok(ObjectState::new(name, spec).with_dotted_paths(self.dotted_paths))
    }

    /// Create a component of kind `spec` in `form`, creating the form if needed
    pub fn create_component(&mut self, form: &str, name: &str, spec: &str) -> Result<&mut Component> {
        let state = self.new_state(name, spec)?;
        let form = self
            .forms
            .entry(form.to_string())
            .or_insert_with(|| Form::new(form));
        Ok(form.add(state))
    }

    /// Create a client service of kind `spec`
    pub fn create_service(&mut self, name: &str, spec: &str) -> Result<&mut ClientService> {
        let service = ClientService::new(self.new_state(name, spec)?);
        self.services.insert(name.to_string(), service);
        self.service_mut(name)
    }

    /// Record that the client finished loading `form`
    pub fn mark_form_loaded(&mut self, form: &str) {
        self.forms
            .entry(form.to_string())
            .or_insert_with(|| Form::new(form))
            .set_loaded(true);
    }

    pub fn form(&self, name: &str) -> Option<&Form> {
        self.forms.get(name)
    }

    pub fn component(&self, form: &str, name: &str) -> Result<&Component> {
        self.forms
            .get(form)
            .and_then(|form| form.child(name))
            .ok_or_else(|| Error::not_found(format!("component {}.{}", form, name)))
    }

    pub fn component_mut(&mut self, form: &str, name: &str) -> Result<&mut Component> {
        self.forms
            .get_mut(form)
            .and_then(|form| form.child_mut(name))
            .ok_or_else(|| Error::not_found(format!("component {}.{}", form, name)))
    }

    pub fn service(&self, name: &str) -> Result<&ClientService> {
        self.services
            .get(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))
    }

    pub fn service_mut(&mut self, name: &str) -> Result<&mut ClientService> {
        self.services
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("service {}", name)))
    }

    /// Apply a property value the client sent for a component
    pub fn apply_client_change(
        &mut self,
        form: &str,
        component: &str,
        property: &str,
        raw: &Value,
    ) -> Result<GateOutcome<bool>> {
        let converter = Arc::clone(&self.converter);
        let state = self.component_mut(form, component)?.state_mut();
        let stale = state.is_stale_client_value(property, raw);
        let outcome = state.apply_from_client(property, raw, converter.as_ref())?;
        self.count_client_outcome(&outcome, stale);
        Ok(outcome)
    }

    /// Apply a property value the client sent for a service
    pub fn apply_service_change(
        &mut self,
        service: &str,
        property: &str,
        raw: &Value,
    ) -> Result<GateOutcome<bool>> {
        let converter = Arc::clone(&self.converter);
        let state = self.service_mut(service)?.state_mut();
        let stale = state.is_stale_client_value(property, raw);
        let outcome = state.apply_from_client(property, raw, converter.as_ref())?;
        self.count_client_outcome(&outcome, stale);
        Ok(outcome)
    }

    fn count_client_outcome(&self, outcome: &GateOutcome<bool>, stale: bool) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        match outcome {
            GateOutcome::Rejected(_) => metrics.client.rejected_changes.inc(),
            GateOutcome::Accepted(false) if stale => {
                metrics.client.stale_updates.inc()
            }
            GateOutcome::Accepted(_) => {}
        }
    }

    /// Run a component event handler for the client
    pub fn execute_event(
        &mut self,
        form: &str,
        component: &str,
        handler: &str,
        args: &[Value],
    ) -> Result<GateOutcome<Value>> {
        let state = self.component_mut(form, component)?.state_mut();
        let outcome = state.execute_event(handler, args)?;
        if outcome.is_rejected() {
            if let Some(metrics) = &self.metrics {
                metrics.client.rejected_changes.inc();
            }
        }
        Ok(outcome)
    }

    /// Process one client message
    ///
    /// Every property of a data push is attempted; the first failure is
    /// returned after the rest were applied.
    pub fn handle_incoming(&mut self, message: IncomingMessage) -> Result<()> {
        match message {
            IncomingMessage::DataPush {
                form,
                bean,
                changes,
            } => {
                let mut first_error = None;
                for (property, raw) in &changes {
                    if let Err(err) = self.apply_client_change(&form, &bean, property, raw) {
                        first_error.get_or_insert(err);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            IncomingMessage::ServiceDataPush { service, changes } => {
                let mut first_error = None;
                for (property, raw) in &changes {
                    if let Err(err) = self.apply_service_change(&service, property, raw) {
                        first_error.get_or_insert(err);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            IncomingMessage::Event {
                form,
                bean,
                event,
                args,
                cmsgid,
            } => {
                let outcome = self.execute_event(&form, &bean, &event, &args);
                let Some(id) = cmsgid else {
                    return outcome.map(|_| ());
                };
                match outcome {
                    Ok(GateOutcome::Accepted(ret)) => {
                        self.set_response(json!({"cmsgid": id, "ret": ret}));
                        Ok(())
                    }
                    Ok(GateOutcome::Rejected(rejection)) => {
                        self.set_response(json!({"cmsgid": id, "exception": rejection.to_json()}));
                        Ok(())
                    }
                    Err(err) => {
                        self.set_response(json!({"cmsgid": id, "exception": err.to_string()}));
                        Err(err)
                    }
                }
            }
            IncomingMessage::Reply { id, ret, exception } => {
                let result = match exception {
                    Some(exception) => Err(exception),
                    None => Ok(ret),
                };
                self.replies.resolve(id, result);
                if let Some(token) = self.reply_tokens.remove(&id) {
                    token.resume();
                }
                Ok(())
            }
        }
    }

    /// Queue a call for the next flush
    pub fn queue_call(&mut self, call: PendingCall) {
        self.calls.push(call);
    }

    /// Queue a call to a component function
    pub fn call_component(
        &mut self,
        form: &str,
        component: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let call = self.component(form, component)?.remote_call(function, args);
        self.queue_call(call);
        Ok(())
    }

    /// Queue a call to a service function
    pub fn call_service(&mut self, service: &str, function: &str, args: Vec<Value>) -> Result<()> {
        let call = self.service(service)?.remote_call(function, args);
        self.queue_call(call);
        Ok(())
    }

    /// Response to the client-initiated call being handled
    pub fn set_response(&mut self, response: Value) {
        if self.response.replace(response).is_some() {
            warn!(window = %self.id, "overwriting an unsent response");
        }
    }

    /// Call a client function and wait for its return value
    ///
    /// The call is flushed right away together with every pending change, so
    /// the client sees the state the call depends on. While waiting, the
    /// dispatcher only runs tasks of high priority or above.
    pub fn call_sync(
        &mut self,
        dispatcher: &mut EventDispatcher<Window>,
        call: PendingCall,
    ) -> Result<Value> {
        if !self.transport.is_connected() {
            return Err(Error::transport_unavailable("no live connection for a blocking call"));
        }
        let (id, mut reply) = self.replies.register();
        let token = WaitToken::new();
        self.reply_tokens.insert(id, token.clone());
        self.queue_call(call.blocking(id));

        if let Err(err) = self.flush() {
            self.calls.remove_blocking(id);
            self.replies.cancel(id);
            self.reply_tokens.remove(&id);
            return Err(err);
        }

        let timeout = self.call_timeout;
        let waited = dispatcher.suspend_blocking(self, &token, Priority::High, timeout);
        self.reply_tokens.remove(&id);
        if let Err(err) = waited {
            self.replies.cancel(id);
            debug!(window = %self.id, reply = id, error = %err, "blocking call abandoned");
            return Err(err);
        }

        reply
            .try_take()
            .unwrap_or_else(|| Err(Error::Cancelled(format!("reply {} missing", id))))
    }

    /// Send everything pending; returns whether a message went out
    pub fn flush(&mut self) -> Result<bool> {
        self.flush_with_payload(None)
    }

    /// Send everything pending together with `payload`
    pub fn flush_with_payload(&mut self, payload: Option<Value>) -> Result<bool> {
        self.flush_with_report(payload).map(|report| report.sent)
    }

    pub fn flush_with_report(&mut self, payload: Option<Value>) -> Result<FlushReport> {
        if self.disposed {
            return Err(Error::transport_unavailable("window disposed"));
        }
        let assembler = self.assembler.clone();
        let transport = Arc::clone(&self.transport);
        assembler.flush_with_report(self, transport.as_ref(), payload)
    }

    /// Tear the window down; waiting blocking calls are cancelled
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for token in self.reply_tokens.values() {
            token.cancel();
        }
        self.reply_tokens.clear();
        let cancelled = self.replies.cancel_all();
        let dropped = self.calls.clear();
        info!(window = %self.id, cancelled, dropped, "window disposed");
    }
}

impl FlushSource for Window {
    fn has_pending_changes(&self) -> bool {
        self.forms
            .values()
            .flat_map(Form::components)
            .any(|component| component.state().has_changes())
            || self
                .services
                .values()
                .any(|service| service.state().has_changes())
    }

    fn write_changes(&mut self, message: &mut OutboundMessage) -> Result<usize> {
        let converter = self.converter.as_ref();
        let mut written = 0;
        for (form_name, form) in &mut self.forms {
            for component in form.components_mut() {
                if !component.state().has_changes() {
                    continue;
                }
                let out = message.component_changes(form_name, component.name());
                written += component.state_mut().write_changes(converter, out)?;
            }
        }
        for (name, service) in &mut self.services {
            if !service.state().has_changes() {
                continue;
            }
            let out = message.service_changes(name);
            written += service.state_mut().write_changes(converter, out)?;
        }
        Ok(written)
    }

    fn discard_pending_changes(&mut self) -> usize {
        let components: usize = self
            .forms
            .values_mut()
            .flat_map(Form::components_mut)
            .map(|component| component.state_mut().discard_changes())
            .sum();
        let services: usize = self
            .services
            .values_mut()
            .map(|service| service.state_mut().discard_changes())
            .sum();
        components + services
    }

    fn take_ready_calls(&mut self) -> ReadyCalls {
        let forms = &self.forms;
        self.calls
            .take_ready(|form| forms.get(form).is_some_and(Form::is_loaded))
    }

    fn take_response(&mut self) -> Option<Value> {
        self.response.take()
    }

    fn restore(&mut self, message: OutboundMessage) {
        let OutboundMessage {
            forms,
            services,
            service_calls,
            component_calls,
            response,
            ..
        } = message;

        for (form_name, components) in forms {
            for (component_name, changes) in components {
                let Some(component) = self
                    .forms
                    .get_mut(&form_name)
                    .and_then(|form| form.child_mut(&component_name))
                else {
                    continue;
                };
                for name in changes.keys() {
                    component.state_mut().mark_for_resend(name);
                }
            }
        }
        for (service_name, changes) in services {
            let Some(service) = self.services.get_mut(&service_name) else {
                continue;
            };
            for name in changes.keys() {
                service.state_mut().mark_for_resend(name);
            }
        }

        self.calls.requeue_front(ReadyCalls {
            services: service_calls,
            components: component_calls,
        });
        if let Some(response) = response {
            if self.response.is_none() {
                self.response = Some(response);
            } else {
                warn!(window = %self.id, "dropping an unsent response superseded by a newer one");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::ChannelTransport;
    use crate::security::{ObjectSpec, PropertySpec, PushPolicy};

    fn specs() -> Arc<SpecRegistry> {
        SpecRegistry::builder()
            .register(
                ObjectSpec::new("textfield")
                    .property(PropertySpec::new("text").push(PushPolicy::Allow))
                    .property(PropertySpec::new("readOnlyText"))
                    .property(PropertySpec::protected("enabled", false))
                    .handler("onAction"),
            )
            .unwrap()
            .register(ObjectSpec::new("dialogs").property(PropertySpec::new("title").push(PushPolicy::Allow)))
            .unwrap()
            .build()
    }

    fn window() -> (Window, flume::Receiver<String>, SyncMetrics) {
        let (transport, frames) = ChannelTransport::new();
        let metrics = SyncMetrics::register(&Registry::new(), "test").unwrap();
        let mut window = Window::new(specs(), Arc::new(transport), &Config::default())
            .with_metrics(metrics.clone());
        window.create_component("main", "name", "textfield").unwrap();
        window.create_service("dialogs", "dialogs").unwrap();
        (window, frames, metrics)
    }

    fn next_frame(frames: &flume::Receiver<String>) -> Value {
        serde_json::from_str(&frames.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn test_client_change_is_echoed_in_next_flush() {
        let (mut window, frames, _) = window();
        let outcome = window
            .apply_client_change("main", "name", "text", &json!("Ada"))
            .unwrap();
        assert_eq!(outcome, GateOutcome::Accepted(true));

        assert!(window.flush().unwrap());
        assert_eq!(next_frame(&frames), json!({"forms": {"main": {"name": {"text": "Ada"}}}}));
        assert!(!window.flush().unwrap());
    }

    #[test]
    fn test_rejected_changes_are_counted() {
        let (mut window, _, metrics) = window();
        let outcome = window
            .apply_client_change("main", "name", "readOnlyText", &json!("x"))
            .unwrap();
        assert!(outcome.is_rejected());
        assert!(!window.has_pending_changes());

        window
            .component_mut("main", "name")
            .unwrap()
            .state_mut()
            .set("enabled", false);
        let outcome = window.execute_event("main", "name", "onAction", &[]).unwrap();
        assert_eq!(outcome.rejection().unwrap().blocked_by_property.as_deref(), Some("enabled"));
        assert_eq!(metrics.snapshot().rejected_changes, 2);
    }

    #[test]
    fn test_unknown_component_is_not_found() {
        let (mut window, _, _) = window();
        let err = window
            .apply_client_change("main", "missing", "text", &json!(1))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_event_response_rides_the_next_flush() {
        let (mut window, frames, _) = window();
        window
            .component_mut("main", "name")
            .unwrap()
            .state_mut()
            .on_event("onAction", |state, args| {
                state.set("text", args[0].as_str().unwrap_or_default());
                Ok(json!("done"))
            });

        window
            .handle_incoming(IncomingMessage::Event {
                form: "main".into(),
                bean: "name".into(),
                event: "onAction".into(),
                args: vec![json!("clicked")],
                cmsgid: Some(9),
            })
            .unwrap();
        window.flush().unwrap();
        assert_eq!(
            next_frame(&frames),
            json!({
                "forms": {"main": {"name": {"text": "clicked"}}},
                "response": {"cmsgid": 9, "ret": "done"},
            })
        );
    }

    #[test]
    fn test_service_push_and_calls() {
        let (mut window, frames, _) = window();
        window
            .handle_incoming(IncomingMessage::ServiceDataPush {
                service: "dialogs".into(),
                changes: serde_json::from_value(json!({"title": "Hello"})).unwrap(),
            })
            .unwrap();
        window.call_service("dialogs", "show", vec![json!(1)]).unwrap();
        window.call_component("main", "name", "requestFocus", vec![]).unwrap();

        window.flush().unwrap();
        assert_eq!(
            next_frame(&frames),
            json!({
                "services": {"dialogs": {"title": "Hello"}},
                "serviceApis": [{"name": "dialogs", "call": "show", "args": [1]}],
                "calls": [{"form": "main", "bean": "name", "api": "requestFocus", "args": []}],
            })
        );
    }

    #[test]
    fn test_dispose_cancels_waiting_replies() {
        let (mut window, _, _) = window();
        let (id, mut reply) = window.replies.register();
        let token = WaitToken::new();
        window.reply_tokens.insert(id, token.clone());

        window.dispose();
        assert!(token.is_cancelled());
        assert!(matches!(reply.try_take(), Some(Err(Error::Cancelled(_)))));
        assert!(matches!(window.flush(), Err(Error::TransportUnavailable(_))));
    }
}
