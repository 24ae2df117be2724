use std::collections::VecDeque;
use std::fmt;

use crate::effect::node::unit;
use crate::effect::{no_cancel, Callback, Capabilities, Data, Effect};
use crate::fiber::Resume;

use super::Ref;

/// A counting semaphore for fibers.
///
/// Waiters are served in arrival order: a large request at the head of the queue
/// holds back smaller ones behind it. Interrupting a waiter removes it from the queue
/// without taking any permits.
#[derive(Clone)]
pub struct Semaphore {
    state: Ref<Permits>,
}

struct Permits {
    created: usize,
    available: usize,
    waiters: VecDeque<Waiter>,
    next_ticket: u64,
}

struct Waiter {
    ticket: u64,
    permits: usize,
    resume: Resume,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (available, waiting) = self
            .state
            .modify_now(|permits| (permits.available, permits.waiters.len()));
        f.debug_struct("Semaphore")
            .field("available", &available)
            .field("waiting", &waiting)
            .finish()
    }
}

impl Semaphore {
    pub fn make<R: Capabilities, E: Data>(permits: usize) -> Effect<R, E, Semaphore> {
        Effect::sync(move || Semaphore::new(permits))
    }

    pub(crate) fn new(permits: usize) -> Self {
        Semaphore {
            state: Ref::new(Permits {
                created: permits,
                available: permits,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
        }
    }

    pub fn available<R: Capabilities, E: Data>(&self) -> Effect<R, E, usize> {
        let state = self.state.clone();
        Effect::sync(move || state.modify_now(|permits| permits.available))
    }

    /// Wait for `n` permits.
    ///
    /// A request for more permits than the semaphore was made with can only be met
    /// after [`release_n`](Self::release_n) has added the difference. Until then it
    /// waits at the head of the queue and every later waiter waits behind it.
    pub fn acquire_n<R: Capabilities, E: Data>(&self, n: usize) -> Effect<R, E, ()> {
        let state = self.state.clone();
        Effect::async_register(move |callback: Callback<E, ()>| {
            let resume = callback.into_resume();
            let queued = state.modify_now(|permits| {
                if n > permits.created {
                    tracing::warn!(
                        requested = n,
                        created = permits.created,
                        "semaphore request exceeds the permits it was made with"
                    );
                }
                if permits.waiters.is_empty() && permits.available >= n {
                    permits.available -= n;
                    return Err(resume);
                }
                permits.next_ticket += 1;
                let ticket = permits.next_ticket;
                permits.waiters.push_back(Waiter {
                    ticket,
                    permits: n,
                    resume,
                });
                Ok(ticket)
            });
            match queued {
                Ok(ticket) => {
                    let state = state.clone();
                    Box::new(move || {
                        state.modify_now(|permits| permits.waiters.retain(|w| w.ticket != ticket));
                        // Leaving the head of the queue may unblock the waiters behind us.
                        release_permits(&state, 0);
                    })
                }
                Err(resume) => {
                    if !resume.resume(Ok(unit())) {
                        release_permits(&state, n);
                    }
                    no_cancel()
                }
            }
        })
    }

    pub fn acquire<R: Capabilities, E: Data>(&self) -> Effect<R, E, ()> {
        self.acquire_n(1)
    }

    pub fn release_n<R: Capabilities, E: Data>(&self, n: usize) -> Effect<R, E, ()> {
        let state = self.state.clone();
        Effect::sync(move || release_permits(&state, n))
    }

    pub fn release<R: Capabilities, E: Data>(&self) -> Effect<R, E, ()> {
        self.release_n(1)
    }

    /// Run `body` holding `n` permits, returning them however it ends.
    pub fn with_permits_n<R: Capabilities, E: Data, A: Data>(
        &self,
        n: usize,
        body: Effect<R, E, A>,
    ) -> Effect<R, E, A> {
        let release = self.clone();
        self.acquire_n::<R, E>(n)
            .interruptible()
            .bracket(move |()| release.release_n(n), move |()| body.clone())
    }

    pub fn with_permit<R: Capabilities, E: Data, A: Data>(&self, body: Effect<R, E, A>) -> Effect<R, E, A> {
        self.with_permits_n(1, body)
    }
}

/// Return `n` permits and wake every waiter at the head of the queue that can now
/// be satisfied.
fn release_permits(state: &Ref<Permits>, n: usize) {
    let mut returned = n;
    loop {
        let woken = state.modify_now(|permits| {
            permits.available += returned;
            let mut woken = Vec::new();
            while let Some(head) = permits.waiters.front() {
                if head.permits > permits.available {
                    break;
                }
                permits.available -= head.permits;
                if let Some(waiter) = permits.waiters.pop_front() {
                    woken.push(waiter);
                }
            }
            woken
        });
        if woken.is_empty() {
            return;
        }
        returned = woken
            .into_iter()
            .filter_map(|waiter| (!waiter.resume.resume(Ok(unit()))).then_some(waiter.permits))
            .sum();
        if returned == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;

    type Io<A> = Effect<(), Infallible, A>;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_workers(4)).unwrap()
    }

    #[test]
    fn test_with_permit_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, p, c) = (active.clone(), peak.clone(), counter.clone());
        let program = Semaphore::make::<(), Infallible>(10).and_then(move |sem| {
            let tasks = (0..10_000)
                .map(|_| {
                    let (enter, leave, count) = (a.clone(), a.clone(), c.clone());
                    let p = p.clone();
                    let body = Io::sync(move || {
                        let now = enter.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                    .then(Io::yield_now())
                    .then(Io::sync(move || {
                        leave.fetch_sub(1, Ordering::SeqCst);
                    }));
                    sem.with_permit(body)
                })
                .collect();
            Io::collect_all_par(tasks).then(sem.available())
        });

        assert_eq!(runtime().run(program, ()), Exit::Done(10));
        assert_eq!(counter.load(Ordering::SeqCst), 10_000);
        assert!(peak.load(Ordering::SeqCst) <= 10);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_waiters_are_served_in_order() {
        let program = Semaphore::make::<(), Infallible>(0).and_then(|sem| {
            let sem2 = sem.clone();
            let big = sem.acquire_n::<(), Infallible>(3).as_("big");
            let small = sem.acquire_n::<(), Infallible>(1).as_("small");
            big.fork::<Infallible>().and_then(move |big| {
                let sem = sem2.clone();
                let small = small.clone();
                Io::<()>::sleep(Duration::from_millis(10))
                    .then(small.fork::<Infallible>())
                    .and_then(move |small| {
                        let big = big.clone();
                        Io::<()>::sleep(Duration::from_millis(10))
                            .then(sem.release_n(2))
                            .then(Io::<()>::sleep(Duration::from_millis(10)))
                            .then(big.poll::<(), Infallible>().zip(small.poll()))
                    })
            })
        });

        // Two permits are not enough for the head waiter, so neither may proceed.
        assert_eq!(runtime().run(program, ()), Exit::Done((None, None)));
    }

    #[test]
    fn test_interrupted_waiter_takes_nothing() {
        let program = Semaphore::make::<(), Infallible>(1).and_then(|sem| {
            let held = sem.acquire::<(), Infallible>();
            let waiting = sem.acquire::<(), Infallible>();
            let after = sem.clone();
            held.then(waiting.fork::<Infallible>())
                .and_then(|fiber| Io::<()>::sleep(Duration::from_millis(10)).then(fiber.interrupt::<(), Infallible>()))
                .then(after.release())
                .then(after.available())
        });

        assert_eq!(runtime().run(program, ()), Exit::Done(1));
    }

    #[test]
    fn test_oversized_request_waits_for_released_permits() {
        let program = Semaphore::make::<(), Infallible>(2).and_then(|sem| {
            let after = sem.clone();
            sem.acquire_n::<(), Infallible>(5)
                .fork::<Infallible>()
                .and_then(move |big| {
                    let sem = after.clone();
                    Io::<()>::sleep(Duration::from_millis(10))
                        .then(big.poll::<(), Infallible>().map(|exit| exit.is_some()))
                        .zip(sem.release_n(3).then(big.join()).then(sem.available()))
                })
        });

        assert_eq!(runtime().run(program, ()), Exit::Done((false, 0)));
    }

    #[derive(Debug, Clone, Copy)]
    enum Holder {
        Joined,
        Interrupted,
        Manual,
    }

    fn holder() -> impl Strategy<Value = Holder> {
        prop_oneof![Just(Holder::Joined), Just(Holder::Interrupted), Just(Holder::Manual)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn test_permits_are_conserved(
            total in 1usize..6,
            requests in proptest::collection::vec((1usize..4, holder(), 0u64..3), 1..12),
        ) {
            let program = Semaphore::make::<(), Infallible>(total).and_then(move |sem| {
                let work: Vec<Io<()>> = requests
                    .iter()
                    .map(|&(n, holder, hold_ms)| {
                        let n = n.min(total);
                        let hold = Io::<()>::sleep(Duration::from_millis(hold_ms)).then(Io::yield_now());
                        match holder {
                            Holder::Manual => sem
                                .acquire_n::<(), Infallible>(n)
                                .then(hold)
                                .then(sem.release_n(n)),
                            Holder::Joined | Holder::Interrupted => sem.with_permits_n(n, hold),
                        }
                    })
                    .collect();
                let forks = work.into_iter().map(|effect| effect.fork::<Infallible>()).collect();
                let requests = requests.clone();
                let sem = sem.clone();
                Io::collect_all(forks).and_then(move |fibers| {
                    let endings = fibers
                        .iter()
                        .zip(&requests)
                        .map(|(fiber, &(_, holder, _))| match holder {
                            Holder::Interrupted => fiber.interrupt::<(), Infallible>().as_(()),
                            Holder::Joined | Holder::Manual => fiber.join(),
                        })
                        .collect();
                    Io::<()>::sleep(Duration::from_millis(1))
                        .then(Io::collect_all(endings))
                        .then(sem.available())
                })
            });

            prop_assert_eq!(runtime().run(program, ()), Exit::Done(total));
        }
    }
}
