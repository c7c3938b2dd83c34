//! Composable single-value promises with exact scheduler targeting and weak cancellation.
//!
//! (if you're looking for streams of values, check out a channel or a reactive-streams library
//! instead; if you're running large numbers of I/O tasks, you're probably better served by an
//! `async` runtime)
//!
//! # Overview
//!
//! A [`Valuable`] is one eventual value: produced by a unit of work on some [`Scheduler`],
//! transformed through a chain of derived valuables on other schedulers, combined with sibling
//! computations, and observed by any number of callbacks. Every callback fires exactly once,
//! whether it was registered before or after the value became available, and it runs on exactly
//! the scheduler it asked for.
//!
//! ## Schedulers
//!
//! A [`Scheduler`] decides which thread runs a piece of work. The built-in ones are lazily created
//! process-wide singletons:
//!
//! - [`Scheduler::io`]: an elastic pool for blocking I/O, the default for [`Valuable::call`].
//! - [`Scheduler::computation`]: one thread per core, the default for [`Valuable::supply`] and
//!   [`Valuable::combine`].
//! - [`Scheduler::single`]: one dedicated thread.
//! - [`Scheduler::new_thread`]: a fresh thread for every piece of work.
//! - [`Scheduler::main`]: the host thread that pumps [`Dispatcher::main`].
//! - [`Scheduler::immediate`]: runs work right away, on the calling thread.
//!
//! [`Scheduler::upstream`] is not a scheduler but a marker. Passed to a transformation or an
//! observer, it means "wherever the value I'm reacting to was produced", and it is the default for
//! all of them.
//!
//! ## Cancellation
//!
//! [`Valuable::cancel`] cancels a valuable and walks *upstream*, cancelling whatever it was derived
//! from. Derived valuables only hold weak references to their upstreams, so a long chain never
//! keeps its earlier stages alive once nothing else refers to them.
//!
//! # Usage
//!
//! Running blocking work in the background and transforming its result:
//!
//! ```
//! use valuable::{Scheduler, Valuable};
//!
//! let greeting = Valuable::call(|| Ok(String::from("HELLO")))
//!     .map(|s| s.to_lowercase())
//!     .map_on(|s| format!("{s}, world"), Scheduler::computation());
//!
//! assert_eq!(greeting.get().unwrap(), "hello, world");
//! ```
//!
//! Combining computations, and recovering from failure:
//!
//! ```
//! use std::io;
//! use valuable::Valuable;
//!
//! let a = Valuable::supply(|| 20);
//! let b = Valuable::supply(|| 22);
//! let sum = Valuable::combine(&[a, b], |v| Ok(v.iter().sum::<i32>())).unwrap();
//! assert_eq!(sum.get().unwrap(), 42);
//!
//! let broken = Valuable::<i32>::call(|| Err(io::Error::new(io::ErrorKind::Other, "oops").into()));
//! assert_eq!(broken.on_error_return(0).get().unwrap(), 0);
//! ```
//!
//! Completing a valuable by hand, and delivering callbacks to a thread of your choosing:
//!
//! ```
//! use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
//! use valuable::{Dispatcher, Valuable};
//!
//! let ui = Dispatcher::new("ui");
//! let valuable = Valuable::<u32>::empty(ui.scheduler()).unwrap();
//!
//! let seen = Arc::new(AtomicBool::new(false));
//! let flag = seen.clone();
//! valuable.success(move |n| {
//!     println!("got {n} on the ui thread");
//!     flag.store(true, Ordering::Release);
//! });
//!
//! std::thread::spawn({
//!     let valuable = valuable.clone();
//!     move || valuable.notify_result(7)
//! });
//!
//! // The callback runs here, once the dispatcher is pumped.
//! ui.run_until(|| seen.load(Ordering::Acquire));
//! ```

mod cell;
mod consumers;
mod dispatcher;
mod error;
mod node;
mod ops;
mod pool;
mod scheduler;
mod sync;
mod valuable;
mod wait;

#[cfg(test)]
mod test;

pub use dispatcher::Dispatcher;
pub use error::{BoxError, Error};
pub use pool::{NewThread, Queue, ThreadPool, ThreadPoolBuilder};
pub use scheduler::{Executor, Job, Scheduler};
pub use valuable::Valuable;
pub use wait::Wait;
