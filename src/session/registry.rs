//! Dispatcher handles of all live windows

use super::dispatcher::{DispatcherHandle, Priority};
use crate::core::error::{Error, Result};
use crate::core::types::WindowId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Live sessions, reachable from any thread
pub struct SessionRegistry<S> {
    sessions: RwLock<HashMap<WindowId, DispatcherHandle<S>>>,
}

impl<S: 'static> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Register the dispatcher of `window`; returns the handle it replaced
    pub fn register(&self, window: WindowId, handle: DispatcherHandle<S>) -> Option<DispatcherHandle<S>> {
        debug!(%window, "session registered");
        self.sessions.write().insert(window, handle)
    }

    pub fn unregister(&self, window: WindowId) -> Option<DispatcherHandle<S>> {
        debug!(%window, "session unregistered");
        self.sessions.write().remove(&window)
    }

    pub fn get(&self, window: WindowId) -> Option<DispatcherHandle<S>> {
        self.sessions.read().get(&window).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Registered windows in a stable order
    pub fn windows(&self) -> Vec<WindowId> {
        let mut windows: Vec<_> = self.sessions.read().keys().copied().collect();
        windows.sort();
        windows
    }

    /// Queue a task on the dispatcher of `window`
    pub fn post_to<F>(&self, window: WindowId, priority: Priority, task: F) -> Result<()>
    where
        F: FnOnce(&mut S, &mut super::EventDispatcher<S>) -> Result<()> + Send + 'static,
    {
        let handle = self
            .get(window)
            .ok_or_else(|| Error::not_found(format!("session {}", window)))?;
        handle.post_for(window, priority, task)
    }

    /// Queue `task` on every session, one dispatcher after the other
    ///
    /// Sessions whose dispatcher is gone are dropped from the registry.
    /// Returns the number of sessions the task was queued on.
    pub fn broadcast<F>(&self, priority: Priority, task: F) -> usize
    where
        F: Fn(&mut S) -> Result<()> + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let mut handles: Vec<_> = self
            .sessions
            .read()
            .iter()
            .map(|(window, handle)| (*window, handle.clone()))
            .collect();
        handles.sort_by_key(|(window, _)| *window);

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (window, handle) in handles {
            let task = Arc::clone(&task);
            match handle.post_for(window, priority, move |state, _| (*task)(state)) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(%window, error = %err, "dropping session with a closed dispatcher");
                    gone.push(window);
                }
            }
        }

        if !gone.is_empty() {
            let mut sessions = self.sessions.write();
            for window in gone {
                sessions.remove(&window);
            }
        }
        delivered
    }
}
