use std::sync::Arc;

use crate::{
    consumers::Callback,
    node::{propagate, run_guarded, Link, Node, Target},
    sync::Mutex,
    Error, Scheduler,
};

/// Runs `f` on `scheduler` to obtain an inner node, then follows that node's outcome.
pub(crate) fn flat_map<T, R, F>(upstream: &Arc<Node<T>>, f: F, scheduler: Scheduler) -> Arc<Node<R>>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce(T) -> Result<Arc<Node<R>>, Error> + Send + 'static,
{
    let target = Arc::new(Mutex::new(Target::Upstream(upstream.weak())));
    let node = Node::new(
        scheduler.resolve(upstream.origin()),
        Link::Target(target.clone()),
    );
    let forward_on_origin = upstream.origin() == node.origin();

    let (on_value, on_error) = (node.clone(), node.clone());
    let error_target = target.clone();
    upstream.register(Callback::both(
        move |value| {
            if on_value.is_cancelled() {
                return;
            }
            match run_guarded(|| f(value)) {
                Ok(inner) => follow(&on_value, &target, inner),
                Err(error) => {
                    if target.lock().release_upstream() {
                        on_value.complete(Err(error), true);
                    }
                }
            }
        },
        scheduler,
        move |error| {
            if error_target.lock().release_upstream() {
                on_error.complete(Err(error), forward_on_origin);
            }
        },
        Scheduler::upstream(),
    ));
    node
}

fn follow<R>(node: &Arc<Node<R>>, target: &Mutex<Target>, inner: Arc<Node<R>>)
where
    R: Clone + Send + 'static,
{
    let installed = target.lock().install(inner.weak());
    if !installed {
        // `node` was cancelled while `f` ran.
        if let Err(error) = propagate(&inner.weak()) {
            log::debug!("inner valuable kept running: {error}");
        }
        return;
    }

    let on_origin = inner.origin() == node.origin();
    let (on_value, on_error) = (node.clone(), node.clone());
    inner.register(Callback::both(
        move |value| {
            on_value.complete(Ok(value), on_origin);
        },
        Scheduler::upstream(),
        move |error| {
            on_error.complete(Err(error), on_origin);
        },
        Scheduler::upstream(),
    ));
}
