use std::sync::Arc;

use crate::{
    consumers::Callback,
    node::{Link, Node},
    Scheduler,
};

/// Mirrors the upstream into a node that refuses cancellation.
///
/// The mirror holds no link to the upstream, so cancelling anything derived from it stops here.
pub(crate) fn forever<T>(upstream: &Arc<Node<T>>) -> Arc<Node<T>>
where
    T: Clone + Send + 'static,
{
    if upstream.is_sealed() {
        return upstream.clone();
    }

    let node = Node::new(upstream.origin().clone(), Link::Sealed);
    let (on_value, on_error) = (node.clone(), node.clone());
    upstream.register(Callback::both(
        move |value| {
            on_value.complete(Ok(value), true);
        },
        Scheduler::upstream(),
        move |error| {
            on_error.complete(Err(error), true);
        },
        Scheduler::upstream(),
    ));
    node
}
