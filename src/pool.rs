//! Thread pools backing the built-in [`Scheduler`][crate::Scheduler]s.
//!
//! [`ThreadPool`] is modelled after a classic thread-pool executor: it keeps up to
//! `core_threads` long-lived threads, queues work once those are busy, and grows up to
//! `max_threads` when the queue refuses work. Threads started beyond the core size exit after
//! `keep_alive` without work.
//!
//! The built-in configurations are:
//!
//! - a fixed pool: `core_threads == max_threads`, [`Queue::Unbounded`];
//! - an elastic pool: no core threads, unlimited maximum, [`Queue::Handoff`], so every job is
//!   either handed to an idle thread or starts a new one.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::{scheduler::Job, Error, Executor};

/// How a [`ThreadPool`] holds work that no thread is ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    /// Work is queued without limit and processed in FIFO order.
    Unbounded,
    /// Nothing is queued: a job is handed directly to an idle thread, or a new thread is started.
    Handoff,
}

/// A builder object that can be used to configure and build a [`ThreadPool`].
#[derive(Debug, Clone)]
pub struct ThreadPoolBuilder {
    name: Option<String>,
    core_threads: usize,
    max_threads: usize,
    queue: Queue,
    keep_alive: Duration,
}

impl ThreadPoolBuilder {
    /// Sets the base name of the pool's threads.
    ///
    /// Each thread spawned will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of threads that are kept alive even when idle.
    #[inline]
    pub fn core_threads(self, core_threads: usize) -> Self {
        Self {
            core_threads,
            ..self
        }
    }

    /// Sets the maximum number of threads the pool may run at once.
    #[inline]
    pub fn max_threads(self, max_threads: usize) -> Self {
        Self {
            max_threads,
            ..self
        }
    }

    /// Sets how work is queued while all threads are busy.
    #[inline]
    pub fn queue(self, queue: Queue) -> Self {
        Self { queue, ..self }
    }

    /// Sets how long threads above the core size wait for new work before exiting.
    #[inline]
    pub fn keep_alive(self, keep_alive: Duration) -> Self {
        Self { keep_alive, ..self }
    }

    /// Builds the [`ThreadPool`].
    ///
    /// No threads are started until work arrives.
    pub fn build(self) -> ThreadPool {
        assert_ne!(self.max_threads, 0, "max_threads must be at least 1");
        assert!(
            self.core_threads <= self.max_threads,
            "core_threads must not exceed max_threads"
        );

        let (sender, receiver) = match self.queue {
            Queue::Unbounded => crossbeam_channel::unbounded(),
            Queue::Handoff => crossbeam_channel::bounded(0),
        };
        ThreadPool {
            sender,
            shared: Arc::new(Shared {
                name: self.name.unwrap_or_else(|| String::from("valuable-pool")),
                receiver,
                core_threads: self.core_threads,
                max_threads: self.max_threads,
                keep_alive: self.keep_alive,
                workers: AtomicUsize::new(0),
                next_index: AtomicUsize::new(0),
            }),
        }
    }
}

struct Shared {
    name: String,
    receiver: Receiver<Job>,
    core_threads: usize,
    max_threads: usize,
    keep_alive: Duration,
    /// Number of live threads.
    workers: AtomicUsize,
    next_index: AtomicUsize,
}

/// A pool of threads that runs [`Job`]s.
///
/// Dropping the pool closes its queue. Threads finish the work already queued and then exit; they
/// are not joined, since the pool may well be dropped from one of its own threads.
pub struct ThreadPool {
    sender: Sender<Job>,
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Returns a builder that can be used to configure and build a [`ThreadPool`].
    ///
    /// The default configuration is a single-thread pool with an unbounded queue.
    #[inline]
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder {
            name: None,
            core_threads: 1,
            max_threads: 1,
            queue: Queue::Unbounded,
            keep_alive: Duration::from_secs(60),
        }
    }

    /// Returns the number of threads currently alive in this pool.
    pub fn thread_count(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    /// Reserves a thread slot below `limit` and starts a thread running `job` first.
    ///
    /// Gives the job back if the pool is already at `limit`.
    fn start_thread(&self, job: Job, limit: usize, core: bool) -> Result<Result<(), Error>, Job> {
        let mut current = self.shared.workers.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return Err(job);
            }
            match self.shared.workers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let index = self.shared.next_index.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{index}", self.shared.name);
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || work(shared, job, core));
        Ok(match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                self.shared.workers.fetch_sub(1, Ordering::AcqRel);
                log::warn!("failed to spawn pool thread '{name}': {err}");
                Err(Error::Rejected {
                    scheduler: Arc::from(self.shared.name.as_str()),
                    reason: Arc::from(err.to_string()),
                })
            }
        })
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) -> Result<(), Error> {
        let job = match self.start_thread(job, self.shared.core_threads, true) {
            Ok(started) => return started,
            Err(job) => job,
        };
        let job = match self.sender.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => job,
        };
        match self.start_thread(job, self.shared.max_threads, false) {
            Ok(started) => started,
            Err(_job) => Err(Error::Rejected {
                scheduler: Arc::from(self.shared.name.as_str()),
                reason: Arc::from("pool is saturated"),
            }),
        }
    }
}

/// Decrements the worker count and logs when a pool thread exits, including by unwinding.
struct ExitGuard {
    shared: Arc<Shared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.workers.fetch_sub(1, Ordering::AcqRel);
        if let Some(name) = thread::current().name() {
            log::trace!("pool thread '{name}' exiting");
        }
    }
}

fn work(shared: Arc<Shared>, first: Job, core: bool) {
    if let Some(name) = thread::current().name() {
        log::trace!("pool thread '{name}' starting");
    }
    let _guard = ExitGuard {
        shared: shared.clone(),
    };

    run(first);
    loop {
        let job = if core {
            shared.receiver.recv().ok()
        } else {
            match shared.receiver.recv_timeout(shared.keep_alive) {
                Ok(job) => Some(job),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
            }
        };
        match job {
            Some(job) => run(job),
            None => break,
        }
    }
}

/// Runs a job, keeping the thread alive if it panics.
fn run(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!(
            "job panicked on pool thread '{}'",
            thread::current().name().unwrap_or("<unnamed>")
        );
    }
}

/// An [`Executor`] that spawns a fresh thread for every job.
pub struct NewThread {
    name: String,
    next_index: AtomicUsize,
}

impl NewThread {
    /// Creates an executor whose threads are named after `name` and a running index.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            next_index: AtomicUsize::new(0),
        }
    }
}

impl Executor for NewThread {
    fn execute(&self, job: Job) -> Result<(), Error> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{index}", self.name))
            .spawn(move || run(job))
            .map(drop)
            .map_err(|err| Error::Rejected {
                scheduler: Arc::from(self.name.as_str()),
                reason: Arc::from(err.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{mpsc, Barrier},
        time::Instant,
    };

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn fixed_pool_never_exceeds_its_size() {
        let pool = ThreadPool::builder()
            .name("fixed")
            .core_threads(2)
            .max_threads(2)
            .build();
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                tx.send((i, thread::current().name().map(String::from)))
                    .unwrap();
            }))
            .unwrap();
        }
        drop(tx);

        let results: Vec<_> = rx.iter().collect();
        assert_eq!(results.len(), 16);
        let names: HashSet<_> = results.into_iter().map(|(_, name)| name).collect();
        assert!(names.len() <= 2);
        assert!(names.iter().all(|n| n.as_deref().unwrap().starts_with("fixed-")));
        assert_eq!(pool.thread_count(), 2);
    }

    #[test]
    fn single_thread_pool_is_fifo() {
        let pool = ThreadPool::builder().name("fifo").build();
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            pool.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        drop(tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn handoff_pool_grows_and_retires() {
        let pool = ThreadPool::builder()
            .name("elastic")
            .core_threads(0)
            .max_threads(usize::MAX)
            .queue(Queue::Handoff)
            .keep_alive(Duration::from_millis(100))
            .build();

        // Three jobs that block on each other need three threads.
        let barrier = Arc::new(Barrier::new(4));
        for _ in 0..3 {
            let barrier = barrier.clone();
            pool.execute(Box::new(move || {
                barrier.wait();
            }))
            .unwrap();
        }
        barrier.wait();
        assert_eq!(pool.thread_count(), 3);

        wait_for("idle threads to exit", || pool.thread_count() == 0);
    }

    #[test]
    fn handoff_pool_reuses_idle_threads() {
        let pool = ThreadPool::builder()
            .name("reuse")
            .core_threads(0)
            .max_threads(usize::MAX)
            .queue(Queue::Handoff)
            .keep_alive(Duration::from_secs(5))
            .build();

        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        pool.execute(Box::new(move || tx.send(thread::current().id()).unwrap()))
            .unwrap();
        let first = rx.recv().unwrap();

        // Give the thread time to go back to waiting for work.
        thread::sleep(Duration::from_millis(50));
        pool.execute(Box::new(move || tx2.send(thread::current().id()).unwrap()))
            .unwrap();
        assert_eq!(rx.recv().unwrap(), first);
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn saturated_pool_rejects() {
        let pool = ThreadPool::builder()
            .name("tiny")
            .core_threads(0)
            .max_threads(1)
            .queue(Queue::Handoff)
            .build();
        let (release, gate) = mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            gate.recv().ok();
        }))
        .unwrap();

        let err = pool.execute(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
        release.send(()).unwrap();
    }

    #[test]
    fn panicking_job_keeps_thread_alive() {
        let pool = ThreadPool::builder().name("sturdy").build();
        pool.execute(Box::new(|| {
            panic::resume_unwind(Box::new("job panic"));
        }))
        .unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv().unwrap();
        assert_eq!(pool.thread_count(), 1);
    }

    #[test]
    fn new_thread_per_job() {
        let executor = NewThread::new("fresh");
        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            executor
                .execute(Box::new(move || {
                    tx.send(thread::current().name().map(String::from)).unwrap()
                }))
                .unwrap();
        }
        drop(tx);
        let names: HashSet<_> = rx.iter().collect();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn pools_are_send_sync() {
        assert_send_sync::<ThreadPool>();
        assert_send_sync::<NewThread>();
    }
}
