use std::sync::{Arc, Weak};

use crate::{
    consumers::Callback,
    node::{propagate, run_guarded, Cancel, Link, Node},
    sync::Mutex,
    Error, Scheduler,
};

type Subscribe<S> =
    Box<dyn FnOnce(Box<dyn FnOnce(S) + Send>, Scheduler, Box<dyn FnOnce(Error) + Send>) + Send>;

/// One upstream of a combine, with its value type erased into the slot type `S`.
pub(crate) struct Arm<S> {
    upstream: Weak<dyn Cancel>,
    origin: Scheduler,
    subscribe: Subscribe<S>,
}

impl<S: Send + 'static> Arm<S> {
    pub(crate) fn new<T>(upstream: &Arc<Node<T>>, wrap: fn(T) -> S) -> Self
    where
        T: Clone + Send + 'static,
    {
        let node = upstream.clone();
        Self {
            upstream: upstream.weak(),
            origin: upstream.origin().clone(),
            subscribe: Box::new(
                move |on_value: Box<dyn FnOnce(S) + Send>,
                      scheduler: Scheduler,
                      on_error: Box<dyn FnOnce(Error) + Send>| {
                    node.register(Callback::both(
                        move |value| on_value(wrap(value)),
                        scheduler,
                        on_error,
                        Scheduler::upstream(),
                    ));
                },
            ),
        }
    }
}

struct Gather<S> {
    values: Vec<Option<S>>,
    arrived: usize,
}

/// Waits for every arm to succeed, then runs `combiner` on `scheduler` over the values in arm
/// order.
///
/// The first failure of any arm fails the combine and cancels the other arms.
pub(crate) fn combine<S, R, F>(
    arms: Vec<Arm<S>>,
    combiner: F,
    scheduler: Scheduler,
) -> Result<Arc<Node<R>>, Error>
where
    S: Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce(Vec<S>) -> Result<R, Error> + Send + 'static,
{
    if arms.is_empty() {
        return Err(Error::InvalidArgument("`combine` needs at least one upstream"));
    }
    let scheduler = scheduler.top_level()?;

    let gather = Arc::new(Mutex::new(Some(Gather {
        values: arms.iter().map(|_| None).collect(),
        arrived: 0,
    })));
    let combiner = Arc::new(Mutex::new(Some(combiner)));
    let upstreams: Arc<[Weak<dyn Cancel>]> = arms.iter().map(|arm| arm.upstream.clone()).collect();

    let release = {
        let gather = gather.clone();
        Box::new(move || {
            let released = gather.lock().take();
            drop(released);
        })
    };
    let node = Node::new(
        scheduler.clone(),
        Link::Combine {
            upstreams: upstreams.to_vec(),
            release,
        },
    );

    for (index, arm) in arms.into_iter().enumerate() {
        let on_value = {
            let (node, gather, combiner) = (node.clone(), gather.clone(), combiner.clone());
            move |value: S| {
                if node.is_cancelled() {
                    return;
                }
                let all_arrived = match gather.lock().as_mut() {
                    Some(gathered) => {
                        gathered.values[index] = Some(value);
                        gathered.arrived += 1;
                        gathered.arrived == gathered.values.len()
                    }
                    None => return,
                };
                if !all_arrived {
                    return;
                }

                let Some(gathered) = gather.lock().take() else {
                    return;
                };
                let Some(combiner) = combiner.lock().take() else {
                    return;
                };
                let values = gathered.values.into_iter().flatten().collect();
                let result = run_guarded(|| combiner(values));
                node.complete(result, true);
            }
        };

        let on_error = {
            let (node, gather, upstreams) = (node.clone(), gather.clone(), upstreams.clone());
            let on_origin = arm.origin == *node.origin();
            move |error: Error| {
                let released = gather.lock().take();
                node.complete(Err(error), on_origin);
                if released.is_some() {
                    drop(released);
                    for (i, sibling) in upstreams.iter().enumerate() {
                        if i == index {
                            continue;
                        }
                        if let Err(error) = propagate(sibling) {
                            log::debug!("combine sibling kept running: {error}");
                        }
                    }
                }
            }
        };

        (arm.subscribe)(Box::new(on_value), scheduler.clone(), Box::new(on_error));
    }
    Ok(node)
}

/// Slot type of a two-armed, heterogeneous combine.
enum Pair<T, U> {
    First(T),
    Second(U),
}

pub(crate) fn combine_with<T, U, R, F>(
    first: &Arc<Node<T>>,
    second: &Arc<Node<U>>,
    combiner: F,
    scheduler: Scheduler,
) -> Result<Arc<Node<R>>, Error>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    R: Clone + Send + 'static,
    F: FnOnce(T, U) -> Result<R, Error> + Send + 'static,
{
    let arms = vec![Arm::new(first, Pair::First), Arm::new(second, Pair::Second)];
    combine(
        arms,
        move |values| {
            let mut values = values.into_iter();
            match (values.next(), values.next()) {
                (Some(Pair::First(t)), Some(Pair::Second(u))) => combiner(t, u),
                _ => unreachable!("combine delivers values in arm order"),
            }
        },
        scheduler,
    )
}
