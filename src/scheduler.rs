//! Schedulers decide which thread runs a unit of work.
//!
//! A [`Scheduler`] is a cheap, clonable handle. Two handles compare equal if and only if they were
//! cloned from the same construction, so `Scheduler::io() == Scheduler::io()` holds while two
//! separately created dispatchers are never equal.
//!
//! Besides the concrete schedulers, there are two markers:
//!
//! - [`Scheduler::immediate`] runs work synchronously on the calling thread.
//! - [`Scheduler::upstream`] means "whatever scheduler produced the value I'm reacting to". It is
//!   only meaningful when passed to a transformation or observer, and is resolved to a concrete
//!   scheduler when the derived [`Valuable`][crate::Valuable] is constructed.

use std::{
    borrow::Cow,
    fmt,
    num::NonZeroUsize,
    sync::{Arc, OnceLock},
    thread,
    time::Duration,
};

use crate::{
    dispatcher::Dispatcher,
    pool::{NewThread, Queue, ThreadPool},
    Error,
};

/// A unit of work: no arguments, no result.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run [`Job`]s, typically on other threads.
///
/// Implement this to plug a custom executor into [`Scheduler::from_executor`]. Closures of type
/// `Fn(Job) -> Result<(), Error>` implement it as well.
///
/// Implementations must not drop accepted jobs silently: a job is either eventually run, or
/// `execute` reports an error.
pub trait Executor: Send + Sync + 'static {
    /// Arranges for `job` to run.
    fn execute(&self, job: Job) -> Result<(), Error>;
}

impl<F> Executor for F
where
    F: Fn(Job) -> Result<(), Error> + Send + Sync + 'static,
{
    fn execute(&self, job: Job) -> Result<(), Error> {
        self(job)
    }
}

/// Runs every job on the calling thread.
struct Inline;

impl Executor for Inline {
    fn execute(&self, job: Job) -> Result<(), Error> {
        job();
        Ok(())
    }
}

/// A handle to a scheduler.
///
/// See the [module documentation](self) for the available kinds.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    name: Cow<'static, str>,
    kind: Kind,
}

enum Kind {
    Immediate,
    Upstream,
    Executor(Arc<dyn Executor>),
    /// Built on first use and cached afterwards.
    Lazy {
        executor: OnceLock<Arc<dyn Executor>>,
        init: fn() -> Arc<dyn Executor>,
    },
}

static IMMEDIATE: OnceLock<Scheduler> = OnceLock::new();
static UPSTREAM: OnceLock<Scheduler> = OnceLock::new();
static IO: OnceLock<Scheduler> = OnceLock::new();
static COMPUTATION: OnceLock<Scheduler> = OnceLock::new();
static SINGLE: OnceLock<Scheduler> = OnceLock::new();
static NEW_THREAD: OnceLock<Scheduler> = OnceLock::new();

const IO_KEEP_ALIVE: Duration = Duration::from_secs(60);

impl Scheduler {
    fn new(name: impl Into<Cow<'static, str>>, kind: Kind) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                kind,
            }),
        }
    }

    fn lazy(name: &'static str, init: fn() -> Arc<dyn Executor>) -> Self {
        Self::new(
            name,
            Kind::Lazy {
                executor: OnceLock::new(),
                init,
            },
        )
    }

    /// Wraps a custom [`Executor`] into a new [`Scheduler`].
    pub fn from_executor<E: Executor>(name: impl Into<Cow<'static, str>>, executor: E) -> Self {
        Self::new(name, Kind::Executor(Arc::new(executor)))
    }

    /// Runs work synchronously on the calling thread.
    pub fn immediate() -> Self {
        IMMEDIATE
            .get_or_init(|| Scheduler::new("immediate", Kind::Immediate))
            .clone()
    }

    /// The marker for "use the scheduler of my upstream".
    ///
    /// Scheduling work on this marker directly fails with [`Error::InvalidArgument`].
    pub fn upstream() -> Self {
        UPSTREAM
            .get_or_init(|| Scheduler::new("upstream", Kind::Upstream))
            .clone()
    }

    /// An unbounded, elastic pool for blocking I/O.
    ///
    /// Idle threads are reused, and exit after 60 seconds without work.
    pub fn io() -> Self {
        IO.get_or_init(|| {
            Scheduler::lazy("io", || -> Arc<dyn Executor> {
                Arc::new(
                    ThreadPool::builder()
                        .name("valuable-io")
                        .core_threads(0)
                        .max_threads(usize::MAX)
                        .queue(Queue::Handoff)
                        .keep_alive(IO_KEEP_ALIVE)
                        .build(),
                )
            })
        })
        .clone()
    }

    /// A fixed-size pool for CPU-bound work, with one thread per available core.
    pub fn computation() -> Self {
        COMPUTATION
            .get_or_init(|| {
                Scheduler::lazy("computation", || -> Arc<dyn Executor> {
                    let threads = thread::available_parallelism()
                        .map(NonZeroUsize::get)
                        .unwrap_or(1);
                    Arc::new(
                        ThreadPool::builder()
                            .name("valuable-computation")
                            .core_threads(threads)
                            .max_threads(threads)
                            .build(),
                    )
                })
            })
            .clone()
    }

    /// A single dedicated thread. Work runs in FIFO order.
    pub fn single() -> Self {
        SINGLE
            .get_or_init(|| {
                Scheduler::lazy("single", || -> Arc<dyn Executor> {
                    Arc::new(
                        ThreadPool::builder()
                            .name("valuable-single")
                            .core_threads(1)
                            .max_threads(1)
                            .build(),
                    )
                })
            })
            .clone()
    }

    /// Spawns a new thread for every unit of work.
    pub fn new_thread() -> Self {
        NEW_THREAD
            .get_or_init(|| {
                Scheduler::lazy("new-thread", || -> Arc<dyn Executor> {
                    Arc::new(NewThread::new("valuable-new"))
                })
            })
            .clone()
    }

    /// The scheduler of the process-wide host dispatcher.
    ///
    /// Work scheduled here runs on whichever thread pumps [`Dispatcher::main`].
    pub fn main() -> Self {
        Dispatcher::main().scheduler()
    }

    /// Returns the name this scheduler was created with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `true` for the [`Scheduler::upstream`] marker.
    #[inline]
    pub fn is_upstream(&self) -> bool {
        matches!(self.inner.kind, Kind::Upstream)
    }

    /// Returns `true` for [`Scheduler::immediate`].
    #[inline]
    pub fn is_immediate(&self) -> bool {
        matches!(self.inner.kind, Kind::Immediate)
    }

    /// Returns the [`Executor`] backing this scheduler, constructing it if necessary.
    ///
    /// This allows interop with code that wants to submit work directly. Fails with
    /// [`Error::InvalidArgument`] for [`Scheduler::upstream`], which has no executor.
    pub fn executor(&self) -> Result<Arc<dyn Executor>, Error> {
        match &self.inner.kind {
            Kind::Immediate => Ok(Arc::new(Inline)),
            Kind::Upstream => Err(Error::InvalidArgument(
                "`Scheduler::upstream()` has no executor",
            )),
            Kind::Executor(executor) => Ok(executor.clone()),
            Kind::Lazy { executor, init } => Ok(executor.get_or_init(*init).clone()),
        }
    }

    /// Arranges for `work` to run on this scheduler.
    pub fn schedule<F>(&self, work: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(Box::new(work))
    }

    pub(crate) fn dispatch(&self, job: Job) -> Result<(), Error> {
        match &self.inner.kind {
            Kind::Immediate => {
                job();
                Ok(())
            }
            Kind::Upstream => Err(Error::InvalidArgument(
                "`Scheduler::upstream()` can't run work directly",
            )),
            Kind::Executor(executor) => executor.execute(job),
            Kind::Lazy { executor, init } => executor.get_or_init(*init).execute(job),
        }
    }

    /// Resolves the [`Scheduler::upstream`] marker against the origin of an upstream node.
    pub(crate) fn resolve(&self, upstream: &Scheduler) -> Scheduler {
        if self.is_upstream() {
            upstream.clone()
        } else {
            self.clone()
        }
    }

    /// Rejects the [`Scheduler::upstream`] marker for nodes that have no upstream.
    pub(crate) fn top_level(self) -> Result<Scheduler, Error> {
        if self.is_upstream() {
            Err(Error::InvalidArgument(
                "`Scheduler::upstream()` can't be used to create a top-level valuable",
            ))
        } else {
            Ok(self)
        }
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Scheduler {}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Scheduler").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn globals_are_cached() {
        assert_eq!(Scheduler::io(), Scheduler::io());
        assert_eq!(Scheduler::immediate(), Scheduler::immediate());
        assert_ne!(Scheduler::io(), Scheduler::computation());
        assert_ne!(Scheduler::single(), Scheduler::new_thread());
        assert!(Scheduler::upstream().is_upstream());
        assert!(Scheduler::immediate().is_immediate());
    }

    #[test]
    fn upstream_cannot_run_work() {
        let err = Scheduler::upstream().schedule(|| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(Scheduler::upstream().executor().is_err());
    }

    #[test]
    fn immediate_runs_inline() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        Scheduler::immediate()
            .schedule(move || {
                h.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn pools_run_off_thread() {
        let caller = thread::current().id();
        for scheduler in [
            Scheduler::io(),
            Scheduler::computation(),
            Scheduler::single(),
            Scheduler::new_thread(),
        ] {
            let (tx, rx) = mpsc::channel();
            scheduler
                .schedule(move || tx.send(thread::current().id()).unwrap())
                .unwrap();
            assert_ne!(rx.recv().unwrap(), caller, "{scheduler:?}");
        }
    }

    #[test]
    fn custom_executor() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let scheduler = Scheduler::from_executor("counting", move |job: Job| {
            c.fetch_add(1, Ordering::Relaxed);
            job();
            Ok(())
        });
        scheduler.schedule(|| {}).unwrap();
        scheduler.executor().unwrap().execute(Box::new(|| {})).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 2);
        assert_eq!(scheduler.name(), "counting");
        assert_eq!(scheduler, scheduler.clone());
    }

    #[test]
    fn resolve_upstream() {
        let io = Scheduler::io();
        assert_eq!(Scheduler::upstream().resolve(&io), io);
        assert_eq!(Scheduler::single().resolve(&io), Scheduler::single());
        assert!(Scheduler::upstream().top_level().is_err());
        assert!(Scheduler::io().top_level().is_ok());
    }
}
