//! The shared state behind every [`Valuable`][crate::Valuable] handle.
//!
//! A node owns its completion cell and its consumer queue, and knows how to reach the nodes it was
//! derived from. Those links are [`Weak`]: strong references only ever point downstream (from an
//! upstream's queued callbacks to the node they complete), so dropping the last handle to a
//! derived valuable never keeps its upstreams alive, and an upstream that has gone away simply
//! isn't cancelled.

use std::{
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use crate::{
    cell::Cell,
    consumers::{Callback, Consumers},
    sync::Mutex,
    Error, Scheduler,
};

/// Type-erased cancellation, the only operation that travels upstream.
pub(crate) trait Cancel: Send + Sync {
    fn cancel(&self) -> Result<(), Error>;
}

/// The cancellation target of a `flat_map` node.
///
/// Starts out as the upstream. Once the mapping function has produced the inner valuable, the slot
/// is switched over to it. Cancelling releases the slot, and a mapping function that finishes
/// after that has its inner valuable cancelled instead of subscribed to.
pub(crate) enum Target {
    Upstream(Weak<dyn Cancel>),
    Inner(Weak<dyn Cancel>),
    Released,
}

impl Target {
    /// Releases the slot if it still holds the upstream.
    pub(crate) fn release_upstream(&mut self) -> bool {
        if let Target::Upstream(_) = self {
            *self = Target::Released;
            true
        } else {
            false
        }
    }

    /// Switches the slot from the upstream to `inner`.
    ///
    /// Returns `false` if the slot was released in the meantime.
    pub(crate) fn install(&mut self, inner: Weak<dyn Cancel>) -> bool {
        if let Target::Upstream(_) = self {
            *self = Target::Inner(inner);
            true
        } else {
            false
        }
    }

    fn take(&mut self) -> Option<Weak<dyn Cancel>> {
        match mem::replace(self, Target::Released) {
            Target::Upstream(node) | Target::Inner(node) => Some(node),
            Target::Released => None,
        }
    }
}

/// What a node cancels after cancelling itself.
pub(crate) enum Link {
    /// A top-level node.
    Source,
    Upstream(Weak<dyn Cancel>),
    Target(Arc<Mutex<Target>>),
    Combine {
        upstreams: Vec<Weak<dyn Cancel>>,
        /// Drops the values gathered so far.
        release: Box<dyn Fn() + Send + Sync>,
    },
    /// Refuses cancellation altogether.
    Sealed,
}

pub(crate) struct Node<T> {
    cell: Cell<T>,
    consumers: Consumers<T>,
    link: Link,
}

impl<T: Clone + Send + 'static> Node<T> {
    pub(crate) fn new(origin: Scheduler, link: Link) -> Arc<Self> {
        Arc::new(Self {
            cell: Cell::new(),
            consumers: Consumers::new(origin),
            link,
        })
    }

    /// Schedules `work` on the node's origin and completes the node with its result.
    ///
    /// If the origin refuses the job, the node fails with the rejection instead.
    pub(crate) fn spawn<F>(self: &Arc<Self>, work: F)
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let node = self.clone();
        let scheduled = self.origin().schedule(move || {
            if node.is_done() {
                return;
            }
            let result = run_guarded(work);
            node.complete(result, true);
        });
        if let Err(error) = scheduled {
            log::warn!("failed to schedule valuable work: {error}");
            self.complete(Err(error), false);
        }
    }

    #[inline]
    pub(crate) fn origin(&self) -> &Scheduler {
        self.consumers.origin()
    }

    #[inline]
    pub(crate) fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        matches!(self.link, Link::Sealed)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// The single completion path.
    ///
    /// `on_origin` must only be `true` if the calling thread is running on the node's origin
    /// scheduler. Returns `false` if the node had already completed or was cancelled.
    pub(crate) fn complete(&self, result: Result<T, Error>, on_origin: bool) -> bool {
        if self.cell.complete(result) {
            self.consumers.deliver(&self.cell, on_origin);
            true
        } else {
            false
        }
    }

    pub(crate) fn register(&self, callback: Callback<T>) {
        self.consumers.register(callback, &self.cell);
    }

    pub(crate) fn weak(self: &Arc<Self>) -> Weak<dyn Cancel> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }
}

impl<T: Clone + Send + 'static> Cancel for Node<T> {
    fn cancel(&self) -> Result<(), Error> {
        if self.is_sealed() {
            return Err(Error::Unsupported("a `forever` valuable can't be cancelled"));
        }
        if self.cell.cancel() {
            self.consumers.deliver(&self.cell, false);
        }

        match &self.link {
            Link::Source | Link::Sealed => Ok(()),
            Link::Upstream(upstream) => propagate(upstream),
            Link::Target(target) => {
                let held = target.lock().take();
                match held {
                    Some(held) => propagate(&held),
                    None => Ok(()),
                }
            }
            Link::Combine { upstreams, release } => {
                release();
                // Every upstream is cancelled even if an earlier one refused.
                upstreams
                    .iter()
                    .map(propagate)
                    .fold(Ok(()), |first, next| first.and(next))
            }
        }
    }
}

/// Cancels `node` if it is still alive.
///
/// A node that has already been dropped counts as cancelled.
pub(crate) fn propagate(node: &Weak<dyn Cancel>) -> Result<(), Error> {
    match node.upgrade() {
        Some(node) => node.cancel(),
        None => Ok(()),
    }
}

/// Runs user code, turning a panic into [`Error::Panicked`].
pub(crate) fn run_guarded<R>(f: impl FnOnce() -> Result<R, Error>) -> Result<R, Error> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Error::from_panic(payload)))
}
