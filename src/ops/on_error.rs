use std::sync::Arc;

use crate::{
    consumers::Callback,
    node::{run_guarded, Link, Node},
    Error, Scheduler,
};

/// Replaces a failure of the upstream with the result of `recover`, which runs on `scheduler`.
pub(crate) fn on_error_resume<T, F>(
    upstream: &Arc<Node<T>>,
    recover: F,
    scheduler: Scheduler,
) -> Arc<Node<T>>
where
    T: Clone + Send + 'static,
    F: FnOnce(Error) -> Result<T, Error> + Send + 'static,
{
    let node = Node::new(
        scheduler.resolve(upstream.origin()),
        Link::Upstream(upstream.weak()),
    );
    let forward_on_origin = upstream.origin() == node.origin();

    let (on_value, on_error) = (node.clone(), node.clone());
    upstream.register(Callback::both(
        move |value| {
            on_value.complete(Ok(value), forward_on_origin);
        },
        Scheduler::upstream(),
        move |error| {
            if on_error.is_cancelled() {
                return;
            }
            let result = run_guarded(|| recover(error));
            on_error.complete(result, true);
        },
        scheduler,
    ));
    node
}
