//! LIFO cleanup-action stack run on error unwind
//!
//! Request logic registers an action for anything that must be undone if the
//! request fails partway — releasing a lock held for one computation, closing
//! a handle, returning a pooled resource. When the owning operation completes
//! normally the action is popped without running; on unwind every remaining
//! action runs exactly once, newest first.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

type Action = Box<dyn FnOnce() + Send>;

/// Ordered stack of cleanup actions
#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<Action>,
}

impl CleanupStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action to run on unwind
    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.entries.push(Box::new(action));
    }

    /// Remove and discard the most recent entry without running it.
    ///
    /// # Panics
    /// Panics when the stack is empty; popping a cleanup that was never
    /// pushed is a programming error.
    pub fn pop(&mut self) {
        if self.entries.pop().is_none() {
            panic!("pop_cleanup on empty cleanup stack");
        }
    }

    /// Run all remaining entries in reverse-of-registration order.
    ///
    /// Each action runs exactly once. An action has no way to observe or
    /// suppress failures raised by other actions; a panicking action is
    /// contained and logged so the rest of the stack still runs.
    pub fn unwind(&mut self) {
        while let Some(action) = self.entries.pop() {
            if catch_unwind(AssertUnwindSafe(action)).is_err() {
                error!("cleanup action panicked during unwind");
            }
        }
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
