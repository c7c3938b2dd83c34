//! A message-queue scheduler pumped by a host thread.
//!
//! GUI toolkits and event loops usually require certain work to happen on one particular thread.
//! A [`Dispatcher`] models that: its [`Scheduler`] posts work into a queue, and whichever thread
//! calls [`Dispatcher::run_until`] (or one of the other pumping methods) runs it, in FIFO order.
//!
//! [`Dispatcher::main`] is the process-wide instance behind [`Scheduler::main`]. Private instances
//! created with [`Dispatcher::new`] are useful for deterministic tests, since nothing runs until
//! the owner pumps the queue.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{scheduler::Job, Error, Scheduler};

/// How long [`Dispatcher::run_until`] waits for work before re-checking its condition.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

static MAIN: OnceLock<Dispatcher> = OnceLock::new();

/// A queue of work for one host thread.
pub struct Dispatcher {
    receiver: Receiver<Job>,
    /// Owns a [`Sender`] for the queue, so `receiver` never observes a disconnect.
    scheduler: Scheduler,
}

struct Post {
    name: Arc<str>,
    sender: Sender<Job>,
}

impl Post {
    fn post(&self, job: Job) -> Result<(), Error> {
        self.sender.send(job).map_err(|_| Error::Rejected {
            scheduler: self.name.clone(),
            reason: Arc::from("dispatcher was dropped"),
        })
    }
}

impl Dispatcher {
    /// Creates a new dispatcher with an empty queue.
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let post = Post {
            name: Arc::from(name),
            sender,
        };
        let scheduler = Scheduler::from_executor(name.to_owned(), move |job: Job| post.post(job));
        Self {
            receiver,
            scheduler,
        }
    }

    /// Returns the process-wide dispatcher backing [`Scheduler::main`].
    ///
    /// The host application is expected to pump it from its main thread.
    pub fn main() -> &'static Dispatcher {
        MAIN.get_or_init(|| Dispatcher::new("main"))
    }

    /// Returns the [`Scheduler`] that posts work to this dispatcher.
    #[inline]
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Returns the number of jobs waiting in the queue.
    #[inline]
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Runs all currently queued jobs (and any they post in turn) without blocking.
    ///
    /// Returns the number of jobs that were run.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(job) = self.receiver.try_recv() {
            run(job);
            count += 1;
        }
        count
    }

    /// Blocks until a job is available and runs it.
    pub fn run_once(&self) {
        // We hold a sender through `self.scheduler`, so the channel can't disconnect.
        if let Ok(job) = self.receiver.recv() {
            run(job);
        }
    }

    /// Runs jobs on the calling thread until `done` returns `true`.
    ///
    /// `done` is checked before every job, and at least every few milliseconds while the queue is
    /// empty, so it may also be satisfied by other threads.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) {
        while !done() {
            match self.receiver.recv_timeout(POLL_INTERVAL) {
                Ok(job) => run(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn run(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("job panicked on dispatcher thread");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc,
        },
        thread,
    };

    use super::*;

    #[test]
    fn nothing_runs_until_pumped() {
        let dispatcher = Dispatcher::new("test");
        let (tx, rx) = mpsc::channel();
        for i in 0..3 {
            let tx = tx.clone();
            dispatcher.scheduler().schedule(move || tx.send(i).unwrap()).unwrap();
        }
        assert_eq!(dispatcher.pending(), 3);
        assert!(rx.try_recv().is_err());

        assert_eq!(dispatcher.run_pending(), 3);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(dispatcher.run_pending(), 0);
    }

    #[test]
    fn jobs_run_on_pumping_thread() {
        let dispatcher = Dispatcher::new("test");
        let scheduler = dispatcher.scheduler();
        let here = thread::current().id();
        let ran_on = Arc::new(crate::sync::Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));

        let (r, d) = (ran_on.clone(), done.clone());
        let bg = thread::spawn(move || {
            scheduler
                .schedule(move || {
                    *r.lock() = Some(thread::current().id());
                    d.store(true, Ordering::Release);
                })
                .unwrap();
        });
        dispatcher.run_until(|| done.load(Ordering::Acquire));
        bg.join().unwrap();
        assert_eq!(*ran_on.lock(), Some(here));
    }

    #[test]
    fn dropped_dispatcher_rejects_work() {
        let dispatcher = Dispatcher::new("gone");
        let scheduler = dispatcher.scheduler();
        drop(dispatcher);
        let err = scheduler.schedule(|| {}).unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
    }

    #[test]
    fn main_dispatcher_is_shared() {
        assert_eq!(Scheduler::main(), Dispatcher::main().scheduler());
        assert_eq!(Scheduler::main().name(), "main");
    }
}
