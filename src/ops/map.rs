use std::sync::Arc;

use crate::{
    consumers::Callback,
    node::{run_guarded, Link, Node},
    Error, Scheduler,
};

/// Transforms the upstream's value with `f`, which runs on `scheduler`.
///
/// Failures are forwarded as they are, on the upstream's origin.
pub(crate) fn map<T, R, F>(upstream: &Arc<Node<T>>, f: F, scheduler: Scheduler) -> Arc<Node<R>>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce(T) -> Result<R, Error> + Send + 'static,
{
    let node = Node::new(
        scheduler.resolve(upstream.origin()),
        Link::Upstream(upstream.weak()),
    );
    let forward_on_origin = upstream.origin() == node.origin();

    let (on_value, on_error) = (node.clone(), node.clone());
    upstream.register(Callback::both(
        move |value| {
            if on_value.is_cancelled() {
                return;
            }
            let result = run_guarded(|| f(value));
            on_value.complete(result, true);
        },
        scheduler,
        move |error| {
            on_error.complete(Err(error), forward_on_origin);
        },
        Scheduler::upstream(),
    ));
    node
}
