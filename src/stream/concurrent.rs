use std::sync::Arc;

use crate::effect::{Capabilities, Data, Effect};
use crate::exit::Cause;
use crate::fiber::Fiber;
use crate::managed::{Managed, Scope};
use crate::sync::{Queue, Ref, Semaphore};

use super::{Pull, Stream};

/// What producer fibers hand to the consuming pull.
#[derive(Clone)]
enum Signal<E, A> {
    Item(A),
    Failed(Cause<E>),
    End,
}

fn receive<R: Capabilities, E: Data, A: Data>(signal: Signal<E, A>) -> Pull<R, E, A> {
    match signal {
        Signal::Item(a) => Effect::succeed(Some(a)),
        Signal::Failed(cause) => Effect::halt(cause),
        Signal::End => Effect::succeed(None),
    }
}

/// Offer every element of `pull` to `queue`, wrapped by `wrap`.
fn pump<R, E, A, T, W>(pull: Pull<R, E, A>, queue: Queue<T>, wrap: W) -> Effect<R, E, ()>
where
    R: Capabilities,
    E: Data,
    A: Data,
    T: Data,
    W: Fn(Signal<E, A>) -> T + Clone + Send + Sync + 'static,
{
    let again = pull.clone();
    pull.and_then(move |item| match item {
        Some(a) => {
            let (again, queue2, wrap2) = (again.clone(), queue.clone(), wrap.clone());
            queue
                .offer::<R, E>(wrap(Signal::Item(a)))
                .then(pump(again, queue2, wrap2))
        }
        None => Effect::unit(),
    })
}

/// Start `driver` on its own fiber and interrupt it, then everything `children`
/// returns, when `scope` closes.
fn supervise<R, E, C>(scope: &Scope, driver: Effect<R, E, ()>, children: C) -> Effect<R, E, ()>
where
    R: Capabilities,
    E: Data,
    C: Fn() -> Vec<Fiber<E, ()>> + Send + Sync + 'static,
{
    let scope = scope.clone();
    let children = Arc::new(children);
    driver
        .fork::<E>()
        .and_then(move |driver| {
            let children = children.clone();
            scope.add(move |_| {
                let children = children.clone();
                driver
                    .interrupt::<R, E>()
                    .then(Effect::suspend(move || {
                        let stops = children().iter().map(|child| child.interrupt::<R, E>().as_unit()).collect();
                        Effect::collect_all(stops).as_unit()
                    }))
            })
        })
        .uninterruptible()
}

struct Merge<E, A> {
    queue: Queue<Signal<E, A>>,
    permits: Semaphore,
    children: Ref<Vec<Fiber<E, ()>>>,
    max_active: usize,
}

impl<E, A> Clone for Merge<E, A> {
    fn clone(&self) -> Self {
        Merge {
            queue: self.queue.clone(),
            permits: self.permits.clone(),
            children: self.children.clone(),
            max_active: self.max_active,
        }
    }
}

impl<E: Data, A: Data> Merge<E, A> {
    /// Pull inner streams from `outer`, running each on a child fiber once a permit
    /// is free. Signals the end after every child has given its permit back.
    fn drive<R: Capabilities>(&self, outer: Pull<R, E, Stream<R, E, A>>) -> Effect<R, E, ()> {
        let this = self.clone();
        let again = outer.clone();
        outer.and_then(move |next| match next {
            Some(inner) => this.spawn(inner).then(this.drive(again.clone())),
            None => this
                .permits
                .acquire_n::<R, E>(this.max_active)
                .then(this.queue.offer(Signal::End))
                .as_unit(),
        })
    }

    fn spawn<R: Capabilities>(&self, inner: Stream<R, E, A>) -> Effect<R, E, ()> {
        let (queue, failed) = (self.queue.clone(), self.queue.clone());
        let child = inner
            .into_managed()
            .use_(move |pull| pump(pull, queue.clone(), |signal| signal))
            .fold_exit(
                move |cause| failed.offer::<R, E>(Signal::Failed(cause)).as_unit(),
                |()| Effect::unit(),
            )
            .ensuring(self.permits.release());
        let children = self.children.clone();
        self.permits.acquire::<R, E>().then(
            child
                .fork::<E>()
                .and_then(move |fiber| {
                    let children = children.clone();
                    Effect::sync(move || {
                        children.modify_now(|children| {
                            children.retain(|child| !child.is_finished());
                            children.push(fiber.clone());
                        })
                    })
                })
                .uninterruptible(),
        )
    }
}

struct Switch<E, A> {
    queue: Queue<(Option<u64>, Signal<E, A>)>,
    generation: Ref<u64>,
    current: Ref<Option<Fiber<E, ()>>>,
}

impl<E, A> Clone for Switch<E, A> {
    fn clone(&self) -> Self {
        Switch {
            queue: self.queue.clone(),
            generation: self.generation.clone(),
            current: self.current.clone(),
        }
    }
}

impl<E: Data, A: Data> Switch<E, A> {
    fn drive<R: Capabilities>(&self, outer: Pull<R, E, Stream<R, E, A>>) -> Effect<R, E, ()> {
        let this = self.clone();
        let again = outer.clone();
        outer.and_then(move |next| match next {
            Some(inner) => this.switch_to(inner).then(this.drive(again.clone())),
            None => {
                let current = this.current.clone();
                Effect::suspend(move || match current.modify_now(|slot| slot.clone()) {
                    Some(fiber) => fiber.wait::<R, E>().as_unit(),
                    None => Effect::unit(),
                })
                .then(this.queue.offer((None, Signal::End)))
                .as_unit()
            }
        })
    }

    /// Retire the running inner stream and start draining `inner`.
    fn switch_to<R: Capabilities>(&self, inner: Stream<R, E, A>) -> Effect<R, E, ()> {
        let this = self.clone();
        Effect::suspend(move || {
            let previous = this.current.modify_now(Option::take);
            let generation = this.generation.modify_now(|generation| {
                *generation += 1;
                *generation
            });
            let stop = match previous {
                Some(fiber) => fiber.interrupt::<R, E>().as_unit(),
                None => Effect::unit(),
            };
            let current = this.current.clone();
            stop.then(this.child(inner.clone(), generation).fork::<E>())
                .and_then(move |fiber| {
                    let current = current.clone();
                    Effect::sync(move || current.modify_now(|slot| *slot = Some(fiber.clone())))
                })
        })
        .uninterruptible()
    }

    fn child<R: Capabilities>(&self, inner: Stream<R, E, A>, generation: u64) -> Effect<R, E, ()> {
        let (queue, failed) = (self.queue.clone(), self.queue.clone());
        inner
            .into_managed()
            .use_(move |pull| pump(pull, queue.clone(), move |signal| (Some(generation), signal)))
            .fold_exit(
                move |cause| {
                    failed
                        .offer::<R, E>((Some(generation), Signal::Failed(cause)))
                        .as_unit()
                },
                |()| Effect::unit(),
            )
    }

    /// Take signals, skipping those sent by inner streams that have been switched away.
    fn pull<R: Capabilities>(&self) -> Pull<R, E, A> {
        let this = self.clone();
        self.queue.take::<R, E>().and_then(move |(sender, signal)| {
            let latest = this.generation.modify_now(|generation| *generation);
            match sender {
                Some(generation) if generation != latest => this.pull(),
                _ => receive(signal),
            }
        })
    }
}

impl<R: Capabilities, E: Data, A: Data> Stream<R, E, Stream<R, E, A>> {
    /// The elements of the inner streams, drained concurrently, at most `max_active`
    /// at a time. Order is preserved within each inner stream only.
    ///
    /// The first failure of any inner stream, or of the outer one, fails the merged
    /// stream. Closing the merged stream interrupts everything still running.
    pub fn merge(self, max_active: usize) -> Stream<R, E, A> {
        let max_active = max_active.max(1);
        let outer = self.into_managed();
        Stream::from_managed(Managed::scoped(move |scope| {
            let (outer, scope) = (outer.clone(), scope.clone());
            Queue::<Signal<E, A>>::bounded::<R, E>(max_active).and_then(move |queue| {
                let merge = Merge {
                    queue: queue.clone(),
                    permits: Semaphore::new(max_active),
                    children: Ref::new(Vec::new()),
                    max_active,
                };
                let (failed, driving) = (queue.clone(), merge.clone());
                let driver = outer
                    .clone()
                    .use_(move |pull| driving.drive(pull))
                    .fold_exit(
                        move |cause| failed.offer::<R, E>(Signal::Failed(cause)).as_unit(),
                        |()| Effect::unit(),
                    );
                let children = merge.children.clone();
                supervise(&scope, driver, move || children.modify_now(std::mem::take))
                    .as_(queue.take::<R, E>().and_then(receive))
            })
        }))
    }

    /// The elements of the most recent inner stream only. A new inner stream
    /// interrupts the one before it; elements the old one produced but that were not
    /// yet pulled are dropped.
    pub fn switch_latest(self) -> Stream<R, E, A> {
        let outer = self.into_managed();
        Stream::from_managed(Managed::scoped(move |scope| {
            let (outer, scope) = (outer.clone(), scope.clone());
            Queue::bounded::<R, E>(1).and_then(move |queue| {
                let switch = Switch {
                    queue: queue.clone(),
                    generation: Ref::new(0),
                    current: Ref::new(None),
                };
                let (failed, driving) = (queue.clone(), switch.clone());
                let driver = outer
                    .clone()
                    .use_(move |pull| driving.drive(pull))
                    .fold_exit(
                        move |cause| failed.offer::<R, E>((None, Signal::Failed(cause))).as_unit(),
                        |()| Effect::unit(),
                    );
                let current = switch.current.clone();
                supervise(&scope, driver, move || current.modify_now(Option::take).into_iter().collect())
                    .as_(switch.pull::<R>())
            })
        }))
    }
}

impl<R: Capabilities, E: Data, A: Data> Stream<R, E, A> {
    /// Map each element to a stream and merge them, at most `max_active` at a time.
    pub fn flat_map_merge<B: Data, F>(self, max_active: usize, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        self.map(f).merge(max_active)
    }

    /// Map each element to a stream, keeping only the latest.
    pub fn flat_map_switch<B: Data, F>(self, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        self.map(f).switch_latest()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;

    type Io<A> = Effect<(), String, A>;
    type Numbers = Stream<(), String, i32>;

    fn runtime() -> Runtime {
        crate::test_logging::init_test_logging();
        Runtime::new(RuntimeConfig::default().with_workers(4)).unwrap()
    }

    /// `items`, counting how many tracked streams are open at once.
    fn tracked(active: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>, items: Numbers) -> Numbers {
        let (enter, leave, peak) = (active.clone(), active.clone(), peak.clone());
        let held = Managed::bracket(
            Io::sync(move || {
                let now = enter.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
            }),
            move |()| {
                let leave = leave.clone();
                Io::sync(move || {
                    leave.fetch_sub(1, Ordering::SeqCst);
                })
            },
        );
        let items = items.map_effect(|n| Io::yield_now().as_(n));
        Stream::from_managed(held.and_then(move |()| items.clone().into_managed()))
    }

    #[test]
    fn test_merge_sees_every_element_with_bounded_concurrency() {
        let (active, peak) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let (a, p) = (active.clone(), peak.clone());
        let program = Numbers::from_vec((0..6).collect())
            .flat_map_merge(2, move |n| tracked(&a, &p, Numbers::from_vec(vec![n * 10, n * 10 + 1, n * 10 + 2])))
            .collect();

        let mut merged = runtime().run(program, ()).done().unwrap_or_default();
        merged.sort_unstable();
        let expected: Vec<i32> = (0..6).flat_map(|n| [n * 10, n * 10 + 1, n * 10 + 2]).collect();
        assert_eq!(merged, expected);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_merge_keeps_order_within_a_stream() {
        let program = Stream::<(), String, Numbers>::once(Numbers::from_vec((0..50).collect()))
            .merge(3)
            .collect();
        assert_eq!(runtime().run(program, ()), Exit::Done((0..50).collect::<Vec<_>>()));
    }

    #[test]
    fn test_merge_fails_with_the_first_failure() {
        let program = Stream::<(), String, Numbers>::from_vec(vec![
            Numbers::from_vec(vec![1, 2]),
            Numbers::once(3).concat(Numbers::raise("inner".into())),
        ])
        .merge(2)
        .drain();
        assert_eq!(runtime().run(program, ()), Exit::Raise("inner".to_string()));
    }

    #[test]
    fn test_stopping_a_merge_releases_running_streams() {
        let (active, peak) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let (a, p) = (active.clone(), peak.clone());
        let program = Numbers::from_vec(vec![1, 2, 3])
            .flat_map_merge(3, move |n| {
                let endless = Numbers::repeat_effect(Io::succeed(n).delay(Duration::from_millis(1)));
                tracked(&a, &p, endless)
            })
            .take(10)
            .collect();

        let collected = runtime().run(program, ()).done().unwrap_or_default();
        assert_eq!(collected.len(), 10);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_switch_latest_only_emits_the_newest() {
        let program = Stream::<(), String, Numbers>::from_vec(vec![
            Numbers::repeat_effect(Io::succeed(1)),
            Numbers::from_vec(vec![2, 3]),
        ])
        .switch_latest()
        .collect();
        assert_eq!(runtime().run(program, ()), Exit::Done(vec![2, 3]));
    }

    #[test]
    fn test_switch_interrupts_the_previous_inner_stream() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_log = log.clone();
        let program = Stream::<(), String, u64>::periodically(Duration::from_millis(20))
            .take(2)
            .flat_map_switch(move |tick| {
                let (open, close) = (inner_log.clone(), inner_log.clone());
                let held = Managed::bracket_exit(
                    Io::sync(move || open.lock().push(format!("open {tick}"))),
                    move |(), tag| {
                        let close = close.clone();
                        Io::sync(move || close.lock().push(format!("close {tick} {tag}")))
                    },
                );
                // The first inner stream never ends on its own.
                let ticks = Stream::<(), String, u64>::periodically(Duration::from_millis(1))
                    .map(move |n| tick * 100 + n)
                    .take(if tick == 0 { usize::MAX } else { 5 });
                Stream::from_managed(held.and_then(move |()| ticks.clone().into_managed()))
            })
            .collect();

        let collected = runtime().run(program, ()).done().unwrap_or_default();
        let latest: Vec<u64> = collected.iter().copied().filter(|n| *n >= 100).collect();
        assert_eq!(latest, vec![100, 101, 102, 103, 104]);
        assert!(collected.ends_with(&latest));

        let log = log.lock().clone();
        assert_eq!(log[log.len() - 2..], ["open 1", "close 1 done"]);
        if log.contains(&"open 0".to_string()) {
            assert_eq!(log[..2], ["open 0", "close 0 interrupt"]);
        }
    }
}
