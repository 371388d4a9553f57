//! Transactional-hook registry coordinating commit/rollback across backends
//!
//! A request may touch several independent backends (two data stores, a
//! message broker, a cache). Each enrolls once per request as a
//! [`Transactional`] participant; at the request boundary the whole set is
//! committed or rolled back together, decided once by the request outcome —
//! there is no per-participant voting. Participants are independent, not
//! nested, so both commit and rollback run in registration order.

use quay_core::{Abort, RequestResult};
use thiserror::Error;

/// Error from a participant's commit callback
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HookError {
    /// What the backend reported
    pub message: String,
}

impl HookError {
    /// Create a hook error with the given message
    pub fn new(message: impl Into<String>) -> Self {
        HookError {
            message: message.into(),
        }
    }
}

/// One backend participating in the current request
///
/// Exactly one of `commit`/`rollback` is invoked per request, followed
/// unconditionally by `release`. `rollback` and `release` cannot fail —
/// enforced by their signatures, since neither runs in a position where a
/// failure could still be handled.
pub trait Transactional: Send {
    /// Make the participant's effects visible. A failure here aborts the
    /// whole request as fatal.
    fn commit(&mut self) -> Result<(), HookError>;

    /// Discard the participant's effects.
    fn rollback(&mut self);

    /// Free resources associated with the participation. Runs after either
    /// outcome.
    fn release(&mut self);
}

/// Participants enrolled for the lifetime of the current request
#[derive(Default)]
pub struct TransactionalRegistry {
    hooks: Vec<Box<dyn Transactional>>,
}

impl TransactionalRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll one participant; may be called multiple times per request.
    pub fn register(&mut self, hook: Box<dyn Transactional>) {
        self.hooks.push(hook);
    }

    /// Number of enrolled participants
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no participants are enrolled
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Commit every participant in registration order, then release all.
    ///
    /// The first commit failure stops further commits: the not-yet-committed
    /// tail is rolled back, every participant is released, and the failure
    /// surfaces as fatal. The participant whose own commit failed receives
    /// only release — its backend already saw the failed commit.
    pub fn commit_all(&mut self) -> RequestResult<()> {
        let mut hooks = std::mem::take(&mut self.hooks);
        let mut failure: Option<(usize, HookError)> = None;

        for (i, hook) in hooks.iter_mut().enumerate() {
            if let Err(e) = hook.commit() {
                failure = Some((i, e));
                break;
            }
        }

        if let Some((failed_at, err)) = failure {
            for hook in hooks.iter_mut().skip(failed_at + 1) {
                hook.rollback();
            }
            for hook in hooks.iter_mut() {
                hook.release();
            }
            return Err(Abort::Fatal(format!("transactional commit failed: {}", err)));
        }

        for hook in hooks.iter_mut() {
            hook.release();
        }
        Ok(())
    }

    /// Roll back every participant in registration order, then release all.
    pub fn rollback_all(&mut self) {
        let mut hooks = std::mem::take(&mut self.hooks);
        for hook in hooks.iter_mut() {
            hook.rollback();
        }
        for hook in hooks.iter_mut() {
            hook.release();
        }
    }
}
