use std::{any::Any, error::Error as StdError, sync::Arc};

use thiserror::Error;

/// A type-erased error returned by user-supplied closures.
///
/// Any error type that implements [`std::error::Error`] converts into this with `?`.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The error type of this library.
///
/// Every failure observed through a [`Valuable`][crate::Valuable] is one of these. Errors produced
/// by user code are wrapped in [`Error::Failed`], with the original error available via
/// [`std::error::Error::source`] and [`Error::cause`].
///
/// [`Error`] is cheap to clone, since the same failure is handed to every registered failure
/// callback of a node.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The valuable (or one it depends on) was cancelled.
    #[error("valuable was cancelled")]
    Cancelled,
    /// A unit of work, transform, combiner, or recovery function returned an error.
    #[error("valuable failed: {0}")]
    Failed(#[source] Arc<dyn StdError + Send + Sync + 'static>),
    /// A unit of work, transform, combiner, or recovery function panicked.
    #[error("valuable panicked: {0}")]
    Panicked(Arc<str>),
    /// An argument was rejected at construction time, e.g. `Scheduler::upstream()` used for a
    /// node that has no upstream.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation is not supported by this valuable, e.g. cancelling a
    /// [`forever`][crate::Valuable::forever] valuable.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// A scheduler refused to accept a unit of work.
    #[error("scheduler '{scheduler}' rejected work: {reason}")]
    Rejected {
        scheduler: Arc<str>,
        reason: Arc<str>,
    },
}

impl Error {
    /// Converts an error returned by user code into an [`Error`].
    ///
    /// If `error` already is an [`Error`], it is returned unwrapped, so failures pass through
    /// chains of valuables without being wrapped again at every step.
    pub fn from_boxed(error: BoxError) -> Self {
        match error.downcast::<Error>() {
            Ok(error) => *error,
            Err(error) => Error::Failed(Arc::from(error)),
        }
    }

    /// Wraps an arbitrary error value as a failure.
    pub fn failed<E: Into<BoxError>>(error: E) -> Self {
        Self::from_boxed(error.into())
    }

    /// Returns the error produced by user code, if this is an [`Error::Failed`].
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            Error::Failed(cause) => Some(&**cause),
            _ => None,
        }
    }

    /// Returns `true` if this error reports a cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("<non-string panic payload>")
        };
        Error::Panicked(message)
    }
}
