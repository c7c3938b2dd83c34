use std::{fmt, sync::Arc};

use crate::{
    consumers::Callback,
    node::{Cancel, Link, Node},
    ops::{self, Arm},
    BoxError, Error, Scheduler, Wait,
};

/// A single eventual value, produced on one [`Scheduler`] and observable from any thread.
///
/// A [`Valuable`] eventually completes exactly once: with a value, with an [`Error`], or by being
/// cancelled. It can be transformed into new [`Valuable`]s (see [`Valuable::map`],
/// [`Valuable::flat_map`], [`Valuable::combine`], [`Valuable::on_error_resume`]), observed with
/// callbacks (see [`Valuable::success`], [`Valuable::complete`], [`Valuable::catch_error`]), and
/// waited for, either by blocking ([`Valuable::get`]) or by `.await`ing it.
///
/// Every callback registered on a [`Valuable`] fires exactly once, no matter whether it was
/// registered before, during, or after completion. Callbacks that fail to match the outcome (for
/// example a [`Valuable::success`] callback when the valuable fails) are dropped without running.
///
/// # Schedulers
///
/// Every method that runs user code has an `_on` variant that takes the [`Scheduler`] to run it
/// on. Transformations and observers accept [`Scheduler::upstream`], which means "run on the
/// scheduler that produced the value", and which is also their default. Top-level constructors
/// reject it, since there is no upstream to defer to.
///
/// # Ownership
///
/// [`Valuable`] is a cheap, clonable handle. A derived valuable is kept alive by the valuable it
/// was derived from until it has received its outcome, but it only holds a weak reference back.
/// Cancelling a derived valuable cancels its upstreams if they are still alive.
pub struct Valuable<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Valuable<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Valuable<T> {
    fn from_node(node: Arc<Node<T>>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<Node<T>> {
        &self.node
    }

    /// `scheduler` must already be a top-level scheduler.
    fn spawn<F>(scheduler: Scheduler, work: F) -> Self
    where
        F: FnOnce() -> Result<T, Error> + Send + 'static,
    {
        let node = Node::new(scheduler, Link::Source);
        node.spawn(work);
        Self::from_node(node)
    }

    /// Creates a [`Valuable`] without any work attached.
    ///
    /// It completes when [`Valuable::notify_result`] or [`Valuable::notify_error`] is called.
    /// Callbacks that run on [`Scheduler::upstream`] will run on `scheduler`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `scheduler` is [`Scheduler::upstream`].
    pub fn empty(scheduler: Scheduler) -> Result<Self, Error> {
        Ok(Self::from_node(Node::new(
            scheduler.top_level()?,
            Link::Source,
        )))
    }

    /// Runs `work` on [`Scheduler::io`].
    pub fn call<F>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        Self::spawn(Scheduler::io(), move || work().map_err(Error::from_boxed))
    }

    /// Runs `work` on `scheduler`.
    ///
    /// The returned [`Valuable`] completes with the result of `work`. If `work` panics, it fails
    /// with [`Error::Panicked`]. If `scheduler` refuses the work, it fails with the scheduler's
    /// error.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `scheduler` is [`Scheduler::upstream`].
    pub fn call_on<F>(work: F, scheduler: Scheduler) -> Result<Self, Error>
    where
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        Ok(Self::spawn(scheduler.top_level()?, move || {
            work().map_err(Error::from_boxed)
        }))
    }

    /// Runs the infallible `work` on [`Scheduler::computation`].
    pub fn supply<F>(work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::spawn(Scheduler::computation(), move || Ok(work()))
    }

    /// Runs the infallible `work` on `scheduler`.
    pub fn supply_on<F>(work: F, scheduler: Scheduler) -> Result<Self, Error>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Ok(Self::spawn(scheduler.top_level()?, move || Ok(work())))
    }

    /// Creates a [`Valuable`] that has already succeeded with `value`.
    pub fn result(value: T) -> Self {
        Self::spawn(Scheduler::immediate(), move || Ok(value))
    }

    /// Creates a [`Valuable`] that succeeds with `value` once `scheduler` gets to it.
    pub fn result_on(value: T, scheduler: Scheduler) -> Result<Self, Error> {
        Ok(Self::spawn(scheduler.top_level()?, move || Ok(value)))
    }

    /// Creates a [`Valuable`] that has already failed with `error`.
    ///
    /// Foreign errors are wrapped in [`Error::Failed`], while an [`Error`] is used as is.
    pub fn error<E: Into<BoxError>>(error: E) -> Self {
        let error = Error::failed(error);
        Self::spawn(Scheduler::immediate(), move || Err(error))
    }

    /// Creates a [`Valuable`] that fails with `error` once `scheduler` gets to it.
    pub fn error_on<E: Into<BoxError>>(error: E, scheduler: Scheduler) -> Result<Self, Error> {
        let error = Error::failed(error);
        Ok(Self::spawn(scheduler.top_level()?, move || Err(error)))
    }

    /// Combines several valuables of the same type, running `combiner` on
    /// [`Scheduler::computation`].
    ///
    /// See [`Valuable::combine_on`].
    pub fn combine<S, F>(upstreams: &[Valuable<S>], combiner: F) -> Result<Self, Error>
    where
        S: Clone + Send + 'static,
        F: FnOnce(Vec<S>) -> Result<T, BoxError> + Send + 'static,
    {
        Self::combine_on(upstreams, combiner, Scheduler::computation())
    }

    /// Combines several valuables of the same type.
    ///
    /// Once all `upstreams` have succeeded, `combiner` is called on `scheduler` with their values,
    /// in the same order as `upstreams`. If any of them fails or is cancelled, the combined
    /// valuable fails right away with the same error, and all other upstreams are cancelled.
    /// Cancelling the combined valuable cancels every upstream.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `upstreams` is empty or if `scheduler` is
    /// [`Scheduler::upstream`].
    pub fn combine_on<S, F>(
        upstreams: &[Valuable<S>],
        combiner: F,
        scheduler: Scheduler,
    ) -> Result<Self, Error>
    where
        S: Clone + Send + 'static,
        F: FnOnce(Vec<S>) -> Result<T, BoxError> + Send + 'static,
    {
        let arms = upstreams
            .iter()
            .map(|upstream| Arm::new(&upstream.node, |value| value))
            .collect();
        let node = ops::combine(
            arms,
            move |values| combiner(values).map_err(Error::from_boxed),
            scheduler,
        )?;
        Ok(Self::from_node(node))
    }

    /// Transforms the value with `f`, on the scheduler that produced it.
    pub fn map<R, F>(&self, f: F) -> Valuable<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.map_on(f, Scheduler::upstream())
    }

    /// Transforms the value with `f`, which runs on `scheduler`.
    ///
    /// If `self` fails, the returned valuable fails with the same error, and `f` is never called.
    pub fn map_on<R, F>(&self, f: F, scheduler: Scheduler) -> Valuable<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
    {
        Valuable::from_node(ops::map(&self.node, move |value| Ok(f(value)), scheduler))
    }

    /// Transforms the value with the fallible `f`, on the scheduler that produced it.
    pub fn try_map<R, F>(&self, f: F) -> Valuable<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Result<R, BoxError> + Send + 'static,
    {
        self.try_map_on(f, Scheduler::upstream())
    }

    /// Transforms the value with the fallible `f`, which runs on `scheduler`.
    ///
    /// An error returned by `f` becomes the failure of the returned valuable.
    pub fn try_map_on<R, F>(&self, f: F, scheduler: Scheduler) -> Valuable<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Result<R, BoxError> + Send + 'static,
    {
        Valuable::from_node(ops::map(
            &self.node,
            move |value| f(value).map_err(Error::from_boxed),
            scheduler,
        ))
    }

    /// Chains another asynchronous computation, started on the scheduler that produced the value.
    pub fn flat_map<R, F>(&self, f: F) -> Valuable<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Valuable<R> + Send + 'static,
    {
        self.flat_map_on(f, Scheduler::upstream())
    }

    /// Chains another asynchronous computation.
    ///
    /// `f` runs on `scheduler` and returns the valuable whose outcome the returned valuable takes
    /// on. Cancelling the returned valuable cancels `self` while `f` hasn't run, and the valuable
    /// returned by `f` afterwards. If the cancellation happens while `f` is running, the valuable
    /// it returns is cancelled as soon as it is available.
    pub fn flat_map_on<R, F>(&self, f: F, scheduler: Scheduler) -> Valuable<R>
    where
        R: Clone + Send + 'static,
        F: FnOnce(T) -> Valuable<R> + Send + 'static,
    {
        Valuable::from_node(ops::flat_map(
            &self.node,
            move |value| Ok(f(value).node),
            scheduler,
        ))
    }

    /// Combines `self` with `other`, running `combiner` on [`Scheduler::computation`].
    pub fn combine_with<U, R, F>(
        &self,
        other: &Valuable<U>,
        combiner: F,
    ) -> Result<Valuable<R>, Error>
    where
        U: Clone + Send + 'static,
        R: Clone + Send + 'static,
        F: FnOnce(T, U) -> Result<R, BoxError> + Send + 'static,
    {
        self.combine_with_on(other, combiner, Scheduler::computation())
    }

    /// Combines `self` with a valuable of a different type.
    ///
    /// This behaves like [`Valuable::combine_on`] with two upstreams.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidArgument`] if `scheduler` is [`Scheduler::upstream`].
    pub fn combine_with_on<U, R, F>(
        &self,
        other: &Valuable<U>,
        combiner: F,
        scheduler: Scheduler,
    ) -> Result<Valuable<R>, Error>
    where
        U: Clone + Send + 'static,
        R: Clone + Send + 'static,
        F: FnOnce(T, U) -> Result<R, BoxError> + Send + 'static,
    {
        let node = ops::combine_with(
            &self.node,
            &other.node,
            move |first, second| combiner(first, second).map_err(Error::from_boxed),
            scheduler,
        )?;
        Ok(Valuable::from_node(node))
    }

    /// Replaces any failure (including cancellation of `self`) with `value`.
    pub fn on_error_return(&self, value: T) -> Self {
        self.on_error_resume(move |_| Ok(value))
    }

    /// Recovers from a failure by running `recover` on the thread that observed the failure.
    pub fn on_error_resume<F>(&self, recover: F) -> Self
    where
        F: FnOnce(Error) -> Result<T, BoxError> + Send + 'static,
    {
        self.on_error_resume_on(recover, Scheduler::immediate())
    }

    /// Recovers from a failure by running `recover` on `scheduler`.
    ///
    /// Successes are passed through unchanged. If `recover` returns an error, the returned
    /// valuable fails with it.
    pub fn on_error_resume_on<F>(&self, recover: F, scheduler: Scheduler) -> Self
    where
        F: FnOnce(Error) -> Result<T, BoxError> + Send + 'static,
    {
        Self::from_node(ops::on_error_resume(
            &self.node,
            move |error| recover(error).map_err(Error::from_boxed),
            scheduler,
        ))
    }

    /// Returns a valuable with the same outcome as `self` that can't be cancelled.
    ///
    /// [`Valuable::cancel`] on the returned valuable fails with [`Error::Unsupported`], and
    /// cancelling a valuable derived from it does not reach `self` and reports the same error.
    /// Calling this on a valuable that is already uncancelable returns it unchanged.
    pub fn forever(&self) -> Self {
        Self::from_node(ops::forever(&self.node))
    }

    /// Registers `on_success` to be called with the value, on the scheduler that produced it.
    pub fn success<F>(&self, on_success: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.success_on(on_success, Scheduler::upstream())
    }

    /// Registers `on_success` to be called with the value, on `scheduler`.
    ///
    /// Returns a handle to `self`.
    pub fn success_on<F>(&self, on_success: F, scheduler: Scheduler) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.node.register(Callback::success(on_success, scheduler));
        self.clone()
    }

    /// Registers callbacks for both outcomes, run on the scheduler that produced the outcome.
    pub fn complete<S, E>(&self, on_success: S, on_failure: E) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.complete_on(on_success, on_failure, Scheduler::upstream())
    }

    /// Registers callbacks for both outcomes, run on `scheduler`.
    ///
    /// Exactly one of them is called. A cancellation is reported to `on_failure` as
    /// [`Error::Cancelled`].
    pub fn complete_on<S, E>(&self, on_success: S, on_failure: E, scheduler: Scheduler) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.node.register(Callback::both(
            on_success,
            scheduler.clone(),
            on_failure,
            scheduler,
        ));
        self.clone()
    }

    /// Registers `on_failure` to be called with the error, on the scheduler that produced it.
    pub fn catch_error<F>(&self, on_failure: F) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.catch_error_on(on_failure, Scheduler::upstream())
    }

    /// Registers `on_failure` to be called with the error (or [`Error::Cancelled`]), on
    /// `scheduler`.
    pub fn catch_error_on<F>(&self, on_failure: F, scheduler: Scheduler) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        self.node.register(Callback::failure(on_failure, scheduler));
        self.clone()
    }

    /// Blocks the calling thread until the valuable has completed, and returns its outcome.
    ///
    /// Returns [`Error::Cancelled`] if the valuable was cancelled, even if that happened after it
    /// had completed.
    pub fn get(&self) -> Result<T, Error> {
        self.node.cell().wait()
    }

    /// Returns the value if the valuable has already succeeded, or `default` otherwise.
    ///
    /// Never blocks.
    pub fn get_or_default(&self, default: T) -> T {
        self.node.cell().value().unwrap_or(default)
    }

    /// Returns a [`Future`][std::future::Future] that resolves to the outcome of this valuable.
    pub fn wait(&self) -> Wait<T> {
        Wait::new(self)
    }

    /// Cancels the valuable, and everything it was derived from that is still alive.
    ///
    /// If the valuable is still pending, its failure callbacks receive [`Error::Cancelled`].
    /// Otherwise, callbacks that have already fired are unaffected, but the stored value is
    /// released and [`Valuable::get`] reports the cancellation from now on. Work that is already
    /// running is not interrupted, but its result is discarded.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Unsupported`] for valuables created by [`Valuable::forever`], and for
    /// valuables derived from one. A derived valuable is still cancelled itself, and so is every
    /// other upstream of a combine.
    pub fn cancel(&self) -> Result<(), Error> {
        self.node.cancel()
    }

    /// Returns `true` once the valuable has been cancelled, including by a [`Valuable::cancel`]
    /// that arrived after it completed.
    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    /// Returns `true` once the valuable has succeeded, failed, or been cancelled.
    pub fn is_done(&self) -> bool {
        self.node.is_done()
    }

    /// Returns the scheduler this valuable's outcome is produced on.
    ///
    /// This is what [`Scheduler::upstream`] resolves to for callbacks and transformations of this
    /// valuable.
    pub fn scheduler(&self) -> Scheduler {
        self.node.origin().clone()
    }

    /// Completes the valuable with `value`, unless it has completed already.
    pub fn notify_result(&self, value: T) {
        self.node.complete(Ok(value), false);
    }

    /// Fails the valuable with `error`, unless it has completed already.
    pub fn notify_error<E: Into<BoxError>>(&self, error: E) {
        self.node.complete(Err(Error::failed(error)), false);
    }
}

impl Valuable<()> {
    /// Runs `work` on [`Scheduler::computation`].
    pub fn run<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(Scheduler::computation(), move || {
            work();
            Ok(())
        })
    }

    /// Runs `work` on `scheduler`.
    pub fn run_on<F>(work: F, scheduler: Scheduler) -> Result<Self, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(Self::spawn(scheduler.top_level()?, move || {
            work();
            Ok(())
        }))
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Valuable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Valuable")
            .field("scheduler", self.node.origin())
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
