//! Ambient "current window" for the task being dispatched

use crate::core::types::WindowId;
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static CURRENT_WINDOW: Cell<Option<WindowId>> = const { Cell::new(None) };
}

/// Window the running task acts for, if any
pub fn current_window() -> Option<WindowId> {
    CURRENT_WINDOW.with(Cell::get)
}

/// Scope guard establishing the current window
///
/// The previous value comes back when the guard drops, also on early return.
/// Guards are bound to the thread that created them.
#[must_use = "the window is only current while the scope is alive"]
pub struct WindowScope {
    previous: Option<WindowId>,
    _thread_bound: PhantomData<*const ()>,
}

impl WindowScope {
    pub fn enter(window: Option<WindowId>) -> Self {
        let previous = CURRENT_WINDOW.with(|current| current.replace(window));
        Self {
            previous,
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for WindowScope {
    fn drop(&mut self) {
        CURRENT_WINDOW.with(|current| current.set(self.previous));
    }
}
