//! Internal unit test utilities.

use std::{
    future::Future,
    pin::pin,
    sync::Arc,
    task::{Context, Poll, Wake, Waker},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use crate::sync::{Condvar, Mutex};

/// Polls a future to completion, returning its result.
pub fn block_on<R, F: Future<Output = R>>(fut: F) -> R {
    #[derive(Default)]
    struct RealWaker {
        /// Waiters are signaled by incrementing this number and notifying the `Condvar`.
        mtx: Mutex<u64>,
        condvar: Condvar,
    }
    impl Wake for RealWaker {
        fn wake(self: Arc<Self>) {
            *self.mtx.lock() += 1;
            self.condvar.notify_all();
        }
    }

    let arc = Arc::new(RealWaker::default());
    let waker = Waker::from(arc.clone());
    let mut cx = Context::from_waker(&waker);

    let mut fut = pin!(fut);
    loop {
        // Read the counter before polling, so a wake-up that races with `poll` isn't lost.
        let before = *arc.mtx.lock();
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => {
                let guard = arc.mtx.lock();
                drop(arc.condvar.wait_while(guard, |n| *n == before));
            }
        }
    }
}

/// Records which values arrived, and on which thread.
#[derive(Clone)]
pub struct Recorder<E> {
    events: Arc<Mutex<Vec<(E, ThreadId)>>>,
}

impl<E: Clone + Send + 'static> Recorder<E> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, event: E) {
        self.events.lock().push((event, thread::current().id()));
    }

    /// Returns a closure that records whatever it is called with.
    pub fn sink(&self) -> impl FnOnce(E) + Send + 'static {
        let this = self.clone();
        move |event| this.record(event)
    }

    pub fn events(&self) -> Vec<E> {
        self.events.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn threads(&self) -> Vec<ThreadId> {
        self.events.lock().iter().map(|(_, t)| *t).collect()
    }

    /// Blocks until `count` events have been recorded, panicking after a generous timeout.
    pub fn wait_for(&self, count: usize) -> Vec<E> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if self.events.lock().len() >= count {
                return self.events();
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} events, got {}",
                self.events.lock().len(),
            );
            thread::sleep(Duration::from_millis(1));
        }
    }
}
