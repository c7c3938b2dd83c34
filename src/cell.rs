//! The write-once completion cell of a node.

use std::sync::Arc;

use crate::{
    sync::{Condvar, Mutex},
    Error,
};

/// The state of a node.
///
/// `Pending` is its own variant rather than an absent value, so a node that succeeded with `()` or
/// `None` is never mistaken for one that hasn't completed. The value sits behind an [`Arc`] so it
/// can be cloned after the lock is released.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Pending,
    Success(Arc<T>),
    Failure(Error),
    Cancelled,
}

/// A completed outcome as seen by one callback.
pub(crate) enum Settled<T> {
    /// The value is only cloned if the callback has a success branch.
    Success(Option<T>),
    /// A failure, or [`Error::Cancelled`].
    Failure(Error),
}

/// Holds the [`Outcome`] of a node and lets threads block until it is available.
///
/// The mutex is only ever held to inspect or swap the outcome, never while user code runs.
pub(crate) struct Cell<T> {
    outcome: Mutex<Outcome<T>>,
    gate: Condvar,
}

impl<T: Clone> Cell<T> {
    pub(crate) fn new() -> Self {
        Self {
            outcome: Mutex::new(Outcome::Pending),
            gate: Condvar::new(),
        }
    }

    /// Moves the cell from `Pending` to the given result.
    ///
    /// Returns `false` and leaves the cell untouched if it has already completed or was cancelled.
    pub(crate) fn complete(&self, result: Result<T, Error>) -> bool {
        let mut outcome = self.outcome.lock();
        if !matches!(*outcome, Outcome::Pending) {
            return false;
        }
        *outcome = match result {
            Ok(value) => Outcome::Success(Arc::new(value)),
            Err(error) => Outcome::Failure(error),
        };
        drop(outcome);
        self.gate.notify_all();
        true
    }

    /// Marks the cell as cancelled.
    ///
    /// Returns `true` if the cell was still pending, in which case the caller is responsible for
    /// delivering the cancellation. If the cell had already completed, the stored value is
    /// released and the cell reports cancellation from now on, but `false` is returned since the
    /// outcome was already delivered.
    pub(crate) fn cancel(&self) -> bool {
        let mut outcome = self.outcome.lock();
        let was_pending = matches!(*outcome, Outcome::Pending);
        let released = std::mem::replace(&mut *outcome, Outcome::Cancelled);
        drop(outcome);
        drop(released);
        if was_pending {
            self.gate.notify_all();
        }
        was_pending
    }

    /// Blocks until the cell is no longer pending, then returns its result.
    pub(crate) fn wait(&self) -> Result<T, Error> {
        let outcome = self.outcome.lock();
        let outcome = self
            .gate
            .wait_while(outcome, |outcome| matches!(outcome, Outcome::Pending));
        let result = match &*outcome {
            Outcome::Success(value) => Ok(value.clone()),
            Outcome::Failure(error) => Err(error.clone()),
            Outcome::Cancelled => Err(Error::Cancelled),
            Outcome::Pending => unreachable!("`wait_while` returned while pending"),
        };
        drop(outcome);
        result.map(|value| T::clone(&value))
    }

    /// Returns the success value, if the cell holds one.
    pub(crate) fn value(&self) -> Option<T> {
        let value = match &*self.outcome.lock() {
            Outcome::Success(value) => Some(value.clone()),
            _ => None,
        };
        value.map(|value| T::clone(&value))
    }

    /// Returns the settled outcome, or `None` while pending.
    pub(crate) fn settled(&self, clone_value: bool) -> Option<Settled<T>> {
        let seen = match &*self.outcome.lock() {
            Outcome::Pending => return None,
            Outcome::Success(value) => Ok(clone_value.then(|| value.clone())),
            Outcome::Failure(error) => Err(error.clone()),
            Outcome::Cancelled => Err(Error::Cancelled),
        };
        Some(match seen {
            Ok(value) => Settled::Success(value.map(|value| T::clone(&value))),
            Err(error) => Settled::Failure(error),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(*self.outcome.lock(), Outcome::Cancelled)
    }

    pub(crate) fn is_done(&self) -> bool {
        !matches!(*self.outcome.lock(), Outcome::Pending)
    }
}
