//! Per-session serial task queue with priority floors
//!
//! Every mutation of a session's state runs as a task on its dispatcher, one
//! at a time. A running task may suspend on a [`WaitToken`]; while it waits,
//! the dispatcher keeps running queued tasks whose priority reaches the
//! suspension floor. Floors of nested suspensions only ever rise and are
//! restored when a suspension ends.

use super::context::WindowScope;
use crate::core::error::{Error, Result};
use crate::core::types::WindowId;
use crate::system::metrics::DispatcherMetrics;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// How often a blocking suspension rechecks its token without new input
const WAKE_INTERVAL: Duration = Duration::from_millis(5);

/// Task priority; a suspended task only lets tasks at or above its floor run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Work item run against the session state
pub type Task<S> = Box<dyn FnOnce(&mut S, &mut EventDispatcher<S>) -> Result<()> + Send>;

struct Envelope<S> {
    priority: Priority,
    window: Option<WindowId>,
    task: Task<S>,
}

struct Queued<S> {
    priority: Priority,
    sequence: u64,
    window: Option<WindowId>,
    task: Task<S>,
}

impl<S> PartialEq for Queued<S> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<S> Eq for Queued<S> {}

impl<S> PartialOrd for Queued<S> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Queued<S> {
    // Max-heap: higher priority first, then earlier sequence
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

const WAITING: u8 = 0;
const RESUMED: u8 = 1;
const CANCELLED: u8 = 2;

/// Resumable handle of one suspended task
///
/// The first of `resume` and `cancel` wins; later calls have no effect.
#[derive(Clone, Default)]
pub struct WaitToken {
    state: Arc<AtomicU8>,
}

impl WaitToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let the suspended task continue; returns whether this call did it
    pub fn resume(&self) -> bool {
        self.settle(RESUMED)
    }

    /// Abandon the wait; returns whether this call did it
    pub fn cancel(&self) -> bool {
        self.settle(CANCELLED)
    }

    fn settle(&self, outcome: u8) -> bool {
        self.state
            .compare_exchange(WAITING, outcome, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }

    pub fn is_resumed(&self) -> bool {
        self.state.load(Ordering::Acquire) == RESUMED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl fmt::Debug for WaitToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            RESUMED => "resumed",
            CANCELLED => "cancelled",
            _ => "waiting",
        };
        f.debug_tuple("WaitToken").field(&state).finish()
    }
}

/// How a non-blocking suspension ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// The token was resumed
    Resumed,
    /// The token was cancelled
    Cancelled,
    /// Nothing eligible was left to run and the token is still waiting
    Starved,
}

/// Cross-thread entry point into a dispatcher
pub struct DispatcherHandle<S> {
    sender: flume::Sender<Envelope<S>>,
}

impl<S> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: 'static> DispatcherHandle<S> {
    /// Queue a task for the dispatcher's own window
    pub fn post<F>(&self, priority: Priority, task: F) -> Result<()>
    where
        F: FnOnce(&mut S, &mut EventDispatcher<S>) -> Result<()> + Send + 'static,
    {
        self.send(priority, None, Box::new(task))
    }

    /// Queue a task acting for `window`
    pub fn post_for<F>(&self, window: WindowId, priority: Priority, task: F) -> Result<()>
    where
        F: FnOnce(&mut S, &mut EventDispatcher<S>) -> Result<()> + Send + 'static,
    {
        self.send(priority, Some(window), Box::new(task))
    }

    fn send(&self, priority: Priority, window: Option<WindowId>, task: Task<S>) -> Result<()> {
        self.sender
            .send(Envelope {
                priority,
                window,
                task,
            })
            .map_err(|_| Error::dispatcher("dispatcher is gone"))
    }

    /// Whether the dispatcher still accepts tasks
    pub fn is_alive(&self) -> bool {
        !self.sender.is_disconnected()
    }
}

/// Serial, priority-aware task queue of one session
pub struct EventDispatcher<S> {
    queue: BinaryHeap<Queued<S>>,
    sequence: u64,
    floor: Priority,
    window: Option<WindowId>,
    sender: flume::Sender<Envelope<S>>,
    receiver: flume::Receiver<Envelope<S>>,
    metrics: Option<DispatcherMetrics>,
}

impl<S: 'static> Default for EventDispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> EventDispatcher<S> {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            queue: BinaryHeap::new(),
            sequence: 0,
            floor: Priority::Low,
            window: None,
            sender,
            receiver,
            metrics: None,
        }
    }

    /// Window tasks act for unless posted for another one
    pub fn with_window(mut self, window: WindowId) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_metrics(mut self, metrics: DispatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> DispatcherHandle<S> {
        DispatcherHandle {
            sender: self.sender.clone(),
        }
    }

    /// Lowest priority currently allowed to run
    pub fn floor(&self) -> Priority {
        self.floor
    }

    /// Tasks waiting to run, including ones not yet picked up from handles
    pub fn pending(&self) -> usize {
        self.queue.len() + self.receiver.len()
    }

    /// Queue a task from the dispatcher thread
    pub fn post<F>(&mut self, priority: Priority, task: F)
    where
        F: FnOnce(&mut S, &mut EventDispatcher<S>) -> Result<()> + Send + 'static,
    {
        self.enqueue(Envelope {
            priority,
            window: None,
            task: Box::new(task),
        });
    }

    /// Queue a task acting for `window`
    pub fn post_for<F>(&mut self, window: WindowId, priority: Priority, task: F)
    where
        F: FnOnce(&mut S, &mut EventDispatcher<S>) -> Result<()> + Send + 'static,
    {
        self.enqueue(Envelope {
            priority,
            window: Some(window),
            task: Box::new(task),
        });
    }

    fn enqueue(&mut self, envelope: Envelope<S>) {
        self.sequence += 1;
        self.queue.push(Queued {
            priority: envelope.priority,
            sequence: self.sequence,
            window: envelope.window,
            task: envelope.task,
        });
        self.report_depth();
    }

    fn drain_inbox(&mut self) {
        while let Ok(envelope) = self.receiver.try_recv() {
            self.enqueue(envelope);
        }
    }

    fn report_depth(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.queue_depth.set(self.queue.len() as i64);
        }
    }

    /// Run the most urgent eligible task; returns whether one ran
    ///
    /// The task sees its window as current for exactly its own duration. A
    /// failing task is logged and counted; the dispatcher carries on.
    pub fn run_next(&mut self, state: &mut S) -> bool {
        self.drain_inbox();
        let floor = self.floor;
        if !self.queue.peek().is_some_and(|next| next.priority >= floor) {
            return false;
        }
        let Some(next) = self.queue.pop() else {
            return false;
        };
        self.report_depth();

        let _scope = WindowScope::enter(next.window.or(self.window));
        trace!(priority = ?next.priority, sequence = next.sequence, "dispatching task");
        let result = (next.task)(state, self);

        if let Some(metrics) = &self.metrics {
            metrics.tasks_dispatched.inc();
        }
        if let Err(err) = result {
            error!(error = %err, priority = ?next.priority, "dispatched task failed");
            if let Some(metrics) = &self.metrics {
                metrics.task_failures.inc();
            }
        }
        true
    }

    /// Run eligible tasks until none is left; returns how many ran
    pub fn run_pending(&mut self, state: &mut S) -> usize {
        let mut ran = 0;
        while self.run_next(state) {
            ran += 1;
        }
        ran
    }

    fn raise_floor(&mut self, floor: Priority) -> Priority {
        let outer = self.floor;
        self.floor = outer.max(floor);
        outer
    }

    /// Run other eligible tasks until `token` settles or nothing is left
    pub fn suspend(&mut self, state: &mut S, token: &WaitToken, floor: Priority) -> SuspendOutcome {
        let outer = self.raise_floor(floor);
        trace!(floor = ?self.floor, "suspending");
        let outcome = loop {
            if token.is_resumed() {
                break SuspendOutcome::Resumed;
            }
            if token.is_cancelled() {
                break SuspendOutcome::Cancelled;
            }
            if !self.run_next(state) {
                break SuspendOutcome::Starved;
            }
        };
        self.floor = outer;
        outcome
    }

    /// Like [`suspend`](Self::suspend), but block for new tasks until `token`
    /// settles or `timeout` elapses
    ///
    /// Tasks arriving below the floor are queued and wait for the floor to
    /// drop again.
    pub fn suspend_blocking(
        &mut self,
        state: &mut S,
        token: &WaitToken,
        floor: Priority,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let outer = self.raise_floor(floor);
        trace!(floor = ?self.floor, ?timeout, "suspending until settled");
        let result = loop {
            if token.is_resumed() {
                break Ok(());
            }
            if token.is_cancelled() {
                break Err(Error::Cancelled("suspended task cancelled".into()));
            }
            if self.run_next(state) {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::TimedOut(timeout));
            }
            // the dispatcher holds a sender itself, so the channel never disconnects
            if let Ok(envelope) = self.receiver.recv_timeout((deadline - now).min(WAKE_INTERVAL)) {
                self.enqueue(envelope);
            }
        };
        self.floor = outer;
        result
    }

    /// Block until a task arrives from a handle or `timeout` elapses
    ///
    /// Returns whether a task was queued.
    pub fn await_input(&mut self, timeout: Duration) -> bool {
        if !self.receiver.is_empty() {
            self.drain_inbox();
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => {
                self.enqueue(envelope);
                self.drain_inbox();
                true
            }
            Err(_) => false,
        }
    }
}
