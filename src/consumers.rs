//! The consumer notification queue.
//!
//! Callbacks may be registered at any time: before a node completes, while its completion is being
//! delivered, or long after. Every callback must fire exactly once, without taking a lock that
//! could be held by a concurrent delivery.
//!
//! The queue is a FIFO channel plus an in-flight counter that starts at 1, with one sentinel
//! callback queued. The counter is the number of queued callbacks a delivery still has to account
//! for, so it only drops to zero once the node has completed *and* the delivery has drained
//! everything that was admitted into the queue.
//!
//! - Registering increments the counter. If it was non-zero, a delivery has not finished yet
//!   (or not started), and the callback is queued for it. If it was zero, the node has completed
//!   and nobody is draining, so the increment is undone and the callback fires right away.
//! - Delivering (done once, by the thread that completed or cancelled the node) drains the queue,
//!   then subtracts the number of callbacks it fired. If the counter is still non-zero, a callback
//!   was admitted while draining and may not even be in the queue yet, so it waits for it and
//!   drains again.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    cell::{Cell, Settled},
    Error, Scheduler,
};

/// One side of a [`Callback`]: its body and the scheduler it asked to run on.
pub(crate) struct Branch<A> {
    body: Box<dyn FnOnce(A) + Send>,
    scheduler: Scheduler,
}

impl<A: Send + 'static> Branch<A> {
    fn new<F: FnOnce(A) + Send + 'static>(body: F, scheduler: Scheduler) -> Self {
        Self {
            body: Box::new(body),
            scheduler,
        }
    }

    /// Runs the body with `arg`, inline or on the requested scheduler.
    ///
    /// `on_origin` tells whether the calling thread is already executing on `origin`. Only then
    /// may a callback asking for `origin` (or for [`Scheduler::upstream`]) run inline. Otherwise
    /// the callback is always dispatched, which also keeps deliveries from an arbitrary thread off
    /// that thread's stack.
    fn run(self, arg: A, origin: &Scheduler, on_origin: bool) {
        let Branch { body, scheduler } = self;
        let job = move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || body(arg))) {
                log::error!("valuable callback panicked: {}", Error::from_panic(payload));
            }
        };

        let inline = on_origin && (scheduler.is_upstream() || scheduler == *origin);
        if inline {
            job();
            return;
        }
        let target = if scheduler.is_upstream() {
            origin
        } else {
            &scheduler
        };
        if let Err(err) = target.schedule(job) {
            log::warn!("dropping valuable callback: {err}");
        }
    }
}

/// A registered observer of a node's outcome.
///
/// A callback with a success branch only fires for a success, one with a failure branch only for a
/// failure or cancellation. A callback with both fires exactly one of them. The sentinel has
/// neither.
pub(crate) struct Callback<T> {
    success: Option<Branch<T>>,
    failure: Option<Branch<Error>>,
}

impl<T: Clone + Send + 'static> Callback<T> {
    fn sentinel() -> Self {
        Self {
            success: None,
            failure: None,
        }
    }

    pub(crate) fn success<F>(body: F, scheduler: Scheduler) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            success: Some(Branch::new(body, scheduler)),
            failure: None,
        }
    }

    pub(crate) fn failure<F>(body: F, scheduler: Scheduler) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        Self {
            success: None,
            failure: Some(Branch::new(body, scheduler)),
        }
    }

    pub(crate) fn both<S, F>(
        on_success: S,
        success_scheduler: Scheduler,
        on_failure: F,
        failure_scheduler: Scheduler,
    ) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        Self {
            success: Some(Branch::new(on_success, success_scheduler)),
            failure: Some(Branch::new(on_failure, failure_scheduler)),
        }
    }

    /// Fires the branch matching the cell's current outcome.
    ///
    /// The cell is read here rather than once per delivery, so a cancellation that lands while a
    /// delivery is in progress is observed by every callback that hasn't fired yet.
    fn fire(self, cell: &Cell<T>, origin: &Scheduler, on_origin: bool) {
        let Callback { success, failure } = self;
        if success.is_none() && failure.is_none() {
            return;
        }
        match cell.settled(success.is_some()) {
            Some(Settled::Success(Some(value))) => {
                if let Some(branch) = success {
                    branch.run(value, origin, on_origin);
                }
            }
            Some(Settled::Success(None)) => {}
            Some(Settled::Failure(error)) => {
                if let Some(branch) = failure {
                    branch.run(error, origin, on_origin);
                }
            }
            None => log::error!("valuable callback fired before completion"),
        }
    }
}

/// The notification queue of one node.
pub(crate) struct Consumers<T> {
    origin: Scheduler,
    in_flight: AtomicUsize,
    sender: Sender<Callback<T>>,
    receiver: Receiver<Callback<T>>,
}

impl<T: Clone + Send + 'static> Consumers<T> {
    pub(crate) fn new(origin: Scheduler) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        // Both ends live in `self`, so sending can't fail.
        let _ = sender.send(Callback::sentinel());
        Self {
            origin,
            in_flight: AtomicUsize::new(1),
            sender,
            receiver,
        }
    }

    /// The scheduler the node's outcome is produced on.
    #[inline]
    pub(crate) fn origin(&self) -> &Scheduler {
        &self.origin
    }

    /// Registers `callback`, firing it right away if the node's outcome has been delivered.
    pub(crate) fn register(&self, callback: Callback<T>, cell: &Cell<T>) {
        if self.in_flight.fetch_add(1, Ordering::AcqRel) > 0 {
            let _ = self.sender.send(callback);
        } else {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            callback.fire(cell, &self.origin, false);
        }
    }

    /// Fires every queued callback, and every callback registered until the queue settles.
    ///
    /// Must be called exactly once, after `cell` has left the pending state.
    pub(crate) fn deliver(&self, cell: &Cell<T>, on_origin: bool) {
        let mut fired = 0;
        loop {
            while let Ok(callback) = self.receiver.try_recv() {
                callback.fire(cell, &self.origin, on_origin);
                fired += 1;
            }
            if self.in_flight.fetch_sub(fired, Ordering::AcqRel) == fired {
                return;
            }

            // Someone was admitted but hasn't sent yet. They will, so block until they do.
            match self.receiver.recv() {
                Ok(callback) => {
                    callback.fire(cell, &self.origin, on_origin);
                    fired = 1;
                }
                Err(_) => {
                    log::error!("valuable consumer queue disconnected during delivery");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::Duration,
    };

    use crate::{sync::Mutex, Dispatcher};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || c.load(Ordering::SeqCst))
    }

    #[test]
    fn queued_callbacks_fire_on_delivery() {
        let cell = Cell::new();
        let consumers = Consumers::new(Scheduler::immediate());
        let (hits, read) = counter();
        for _ in 0..3 {
            let hits = hits.clone();
            consumers.register(
                Callback::success(
                    move |v: i32| {
                        assert_eq!(v, 7);
                        hits.fetch_add(1, Ordering::SeqCst);
                    },
                    Scheduler::upstream(),
                ),
                &cell,
            );
        }
        assert_eq!(read(), 0);

        cell.complete(Ok(7));
        consumers.deliver(&cell, true);
        assert_eq!(read(), 3);
        assert_eq!(consumers.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_callbacks_fire_immediately() {
        let cell = Cell::new();
        let consumers = Consumers::new(Scheduler::immediate());
        cell.complete(Err(Error::Unsupported("nope")));
        consumers.deliver(&cell, true);

        let (hits, read) = counter();
        let h = hits.clone();
        consumers.register(
            Callback::both(
                |_: i32| panic!("wrong branch"),
                Scheduler::immediate(),
                move |e| {
                    assert!(matches!(e, Error::Unsupported("nope")));
                    h.fetch_add(1, Ordering::SeqCst);
                },
                Scheduler::immediate(),
            ),
            &cell,
        );
        assert_eq!(read(), 1);
    }

    #[test]
    fn branch_selection() {
        let cell = Cell::new();
        let consumers = Consumers::new(Scheduler::immediate());
        let (hits, read) = counter();
        let h = hits.clone();
        consumers.register(
            Callback::failure(
                move |_| {
                    h.fetch_add(100, Ordering::SeqCst);
                },
                Scheduler::immediate(),
            ),
            &cell,
        );
        let h = hits.clone();
        consumers.register(
            Callback::success(
                move |_: ()| {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                Scheduler::immediate(),
            ),
            &cell,
        );
        cell.complete(Ok(()));
        consumers.deliver(&cell, false);
        assert_eq!(read(), 1);
    }

    #[test]
    fn cancellation_during_delivery_is_observed() {
        let cell = Arc::new(Cell::new());
        let consumers = Consumers::new(Scheduler::immediate());
        let seen = Arc::new(Mutex::new(Vec::new()));

        // The first callback cancels the node; the second must see the cancellation.
        let c = cell.clone();
        let s = seen.clone();
        consumers.register(
            Callback::both(
                move |v: i32| {
                    s.lock().push(Ok(v));
                    c.cancel();
                },
                Scheduler::upstream(),
                |_| panic!("first callback sees the value"),
                Scheduler::upstream(),
            ),
            &cell,
        );
        let s = seen.clone();
        let s2 = seen.clone();
        consumers.register(
            Callback::both(
                move |v| s.lock().push(Ok(v)),
                Scheduler::upstream(),
                move |e: Error| s2.lock().push(Err(e.is_cancelled())),
                Scheduler::upstream(),
            ),
            &cell,
        );

        cell.complete(Ok(1));
        consumers.deliver(&cell, true);
        assert_eq!(*seen.lock(), [Ok(1), Err(true)]);
    }

    #[test]
    fn dispatch_targets() {
        let cell = Cell::new();
        let origin = Dispatcher::new("origin");
        let other = Dispatcher::new("other");
        let consumers = Consumers::new(origin.scheduler());
        let (hits, read) = counter();

        let register = |scheduler: Scheduler| {
            let h = hits.clone();
            consumers.register(
                Callback::success(
                    move |_: ()| {
                        h.fetch_add(1, Ordering::SeqCst);
                    },
                    scheduler,
                ),
                &cell,
            );
        };
        register(Scheduler::upstream());
        register(origin.scheduler());
        register(other.scheduler());

        // Delivered on the origin: `upstream` and `origin` callbacks run inline.
        cell.complete(Ok(()));
        consumers.deliver(&cell, true);
        assert_eq!(read(), 2);
        assert_eq!(other.run_pending(), 1);
        assert_eq!(read(), 3);

        // Registered from a foreign thread after completion: everything is dispatched.
        register(Scheduler::upstream());
        register(origin.scheduler());
        register(other.scheduler());
        assert_eq!(read(), 3);
        assert_eq!(origin.run_pending(), 2);
        assert_eq!(other.run_pending(), 1);
        assert_eq!(read(), 6);
    }

    #[test]
    fn panicking_callback_does_not_break_delivery() {
        let cell = Cell::new();
        let consumers = Consumers::new(Scheduler::immediate());
        let (hits, read) = counter();
        consumers.register(
            Callback::success(
                |_: i32| panic::resume_unwind(Box::new("callback panic")),
                Scheduler::upstream(),
            ),
            &cell,
        );
        let h = hits.clone();
        consumers.register(
            Callback::success(
                move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                },
                Scheduler::upstream(),
            ),
            &cell,
        );
        cell.complete(Ok(0));
        consumers.deliver(&cell, true);
        assert_eq!(read(), 1);
    }

    /// Hammers registration against delivery: every callback must fire exactly once.
    #[test]
    fn racing_registration_fires_each_once() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;

        for _ in 0..20 {
            let cell = Arc::new(Cell::new());
            let consumers = Arc::new(Consumers::new(Scheduler::immediate()));
            let (hits, read) = counter();
            let barrier = Arc::new(Barrier::new(THREADS + 1));

            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let (cell, consumers, hits, barrier) =
                        (cell.clone(), consumers.clone(), hits.clone(), barrier.clone());
                    thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..PER_THREAD {
                            let hits = hits.clone();
                            consumers.register(
                                Callback::success(
                                    move |_: u8| {
                                        hits.fetch_add(1, Ordering::SeqCst);
                                    },
                                    Scheduler::immediate(),
                                ),
                                &cell,
                            );
                        }
                    })
                })
                .collect();

            barrier.wait();
            cell.complete(Ok(1));
            consumers.deliver(&cell, false);
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(read(), THREADS * PER_THREAD);
            assert_eq!(consumers.in_flight.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn delivery_waits_for_an_admitted_registration() {
        let cell = Arc::new(Cell::new());
        let consumers = Arc::new(Consumers::<i32>::new(Scheduler::immediate()));
        let (hits, read) = counter();

        // Admitted, but not queued yet.
        consumers.in_flight.fetch_add(1, Ordering::SeqCst);
        cell.complete(Ok(5));
        let deliverer = thread::spawn({
            let (cell, consumers) = (cell.clone(), consumers.clone());
            move || consumers.deliver(&cell, false)
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!deliverer.is_finished());

        let h = hits.clone();
        let _ = consumers.sender.send(Callback::success(
            move |v| {
                assert_eq!(v, 5);
                h.fetch_add(1, Ordering::SeqCst);
            },
            Scheduler::immediate(),
        ));
        deliverer.join().unwrap();
        assert_eq!(read(), 1);
        assert_eq!(consumers.in_flight.load(Ordering::SeqCst), 0);
    }
}
