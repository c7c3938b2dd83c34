//! Awaiting a [`Valuable`] from `async` code.

use std::{
    fmt,
    future::{Future, IntoFuture},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use crate::{consumers::Callback, sync::Mutex, Error, Scheduler, Valuable};

struct Slot<T> {
    result: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

/// A [`Future`] that resolves to the outcome of a [`Valuable`].
///
/// Returned by [`Valuable::wait`]. Resolves to the same result [`Valuable::get`] would return, but
/// without blocking the polling thread. Dropping the future does not cancel the valuable.
#[must_use = "futures do nothing unless polled"]
pub struct Wait<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T: Clone + Send + 'static> Wait<T> {
    pub(crate) fn new(valuable: &Valuable<T>) -> Self {
        let slot = Arc::new(Mutex::new(Slot {
            result: None,
            waker: None,
        }));
        let (on_value, on_error) = (slot.clone(), slot.clone());
        valuable.node().register(Callback::both(
            move |value| fill(&on_value, Ok(value)),
            Scheduler::immediate(),
            move |error| fill(&on_error, Err(error)),
            Scheduler::immediate(),
        ));
        Self { slot }
    }
}

fn fill<T>(slot: &Mutex<Slot<T>>, result: Result<T, Error>) {
    let waker = {
        let mut slot = slot.lock();
        slot.result = Some(result);
        slot.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T> Future for Wait<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for Wait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("ready", &self.slot.lock().result.is_some())
            .finish()
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Valuable<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Wait<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait()
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use crate::test::block_on;

    use super::*;

    #[test]
    fn ready_valuable_resolves_on_first_poll() {
        let valuable = Valuable::result(7);
        assert_eq!(block_on(valuable.wait()).unwrap(), 7);
    }

    #[test]
    fn await_matches_get() {
        let valuable = Valuable::<i32>::empty(Scheduler::immediate()).unwrap();
        let v = valuable.clone();
        let bg = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            v.notify_error(Error::Unsupported("late"));
        });
        let awaited = block_on(async { valuable.clone().await });
        bg.join().unwrap();
        assert!(matches!(awaited, Err(Error::Unsupported("late"))));
        assert!(matches!(valuable.get(), Err(Error::Unsupported("late"))));
    }

    #[test]
    fn cancellation_resolves_the_future() {
        let valuable = Valuable::<()>::empty(Scheduler::immediate()).unwrap();
        let wait = valuable.wait();
        valuable.cancel().unwrap();
        assert!(block_on(wait).unwrap_err().is_cancelled());
    }
}
