use std::collections::VecDeque;
use std::fmt;

use crate::effect::node::value;
use crate::effect::{no_cancel, Callback, Capabilities, Data, Effect};
use crate::fiber::Resume;

use super::Ref;

/// What a queue does with an offer when its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Never full.
    Unbounded,
    /// The offering fiber suspends until there is room.
    Bounded,
    /// The oldest buffered element is evicted.
    Sliding,
    /// The new element is discarded and `offer` returns `false`.
    Dropping,
}

/// An asynchronous FIFO queue between fibers.
pub struct Queue<A> {
    state: Ref<Slots<A>>,
    strategy: Strategy,
    capacity: usize,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Queue {
            state: self.state.clone(),
            strategy: self.strategy,
            capacity: self.capacity,
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("strategy", &self.strategy)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

struct Slots<A> {
    buffer: VecDeque<A>,
    takers: VecDeque<(u64, Resume)>,
    offerers: VecDeque<Offerer<A>>,
    next_ticket: u64,
}

struct Offerer<A> {
    ticket: u64,
    item: A,
    resume: Resume,
}

impl<A> Slots<A> {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

impl<A: Data> Slots<A> {
    /// Hand `item` to the oldest taker still waiting. Gives the item back if none is.
    fn hand_off(&mut self, item: A) -> Option<A> {
        while let Some((_, taker)) = self.takers.pop_front() {
            if taker.resume(Ok(value(item.clone()))) {
                return None;
            }
        }
        Some(item)
    }

    /// Admit parked offerers while there is room.
    fn refill(&mut self, capacity: usize) {
        while self.buffer.len() < capacity {
            let Some(offerer) = self.offerers.pop_front() else {
                return;
            };
            if offerer.resume.resume(Ok(value(true))) {
                self.buffer.push_back(offerer.item);
            }
        }
    }

    fn pop(&mut self, capacity: usize) -> Option<A> {
        let item = self.buffer.pop_front();
        self.refill(capacity);
        item
    }
}

impl<A: Data> Queue<A> {
    fn with_strategy<R: Capabilities, E: Data>(strategy: Strategy, capacity: usize) -> Effect<R, E, Queue<A>> {
        Effect::sync(move || Queue {
            state: Ref::new(Slots {
                buffer: VecDeque::new(),
                takers: VecDeque::new(),
                offerers: VecDeque::new(),
                next_ticket: 0,
            }),
            strategy,
            capacity: capacity.max(1),
        })
    }

    pub fn unbounded<R: Capabilities, E: Data>() -> Effect<R, E, Queue<A>> {
        Self::with_strategy(Strategy::Unbounded, usize::MAX)
    }

    /// Capacity 0 is treated as 1.
    pub fn bounded<R: Capabilities, E: Data>(capacity: usize) -> Effect<R, E, Queue<A>> {
        Self::with_strategy(Strategy::Bounded, capacity)
    }

    pub fn sliding<R: Capabilities, E: Data>(capacity: usize) -> Effect<R, E, Queue<A>> {
        Self::with_strategy(Strategy::Sliding, capacity)
    }

    pub fn dropping<R: Capabilities, E: Data>(capacity: usize) -> Effect<R, E, Queue<A>> {
        Self::with_strategy(Strategy::Dropping, capacity)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue `item`. Returns whether it was accepted; only a dropping queue says no.
    pub fn offer<R: Capabilities, E: Data>(&self, item: A) -> Effect<R, E, bool> {
        let this = self.clone();
        Effect::async_register(move |callback: Callback<E, bool>| {
            let resume = callback.into_resume();
            let item = item.clone();
            // The offerer is resumed under the lock; the buffer only changes if it was
            // still waiting.
            let parked = this.state.modify_now(|slots| {
                let Some(item) = slots.hand_off(item) else {
                    resume.resume(Ok(value(true)));
                    return None;
                };
                if slots.buffer.len() < this.capacity || this.strategy == Strategy::Unbounded {
                    if resume.resume(Ok(value(true))) {
                        slots.buffer.push_back(item);
                    }
                    return None;
                }
                match this.strategy {
                    Strategy::Sliding => {
                        if resume.resume(Ok(value(true))) {
                            slots.buffer.pop_front();
                            slots.buffer.push_back(item);
                        }
                        None
                    }
                    Strategy::Dropping => {
                        resume.resume(Ok(value(false)));
                        None
                    }
                    Strategy::Unbounded | Strategy::Bounded => {
                        let ticket = slots.ticket();
                        slots.offerers.push_back(Offerer { ticket, item, resume });
                        Some(ticket)
                    }
                }
            });
            match parked {
                None => no_cancel(),
                Some(ticket) => {
                    let state = this.state.clone();
                    Box::new(move || {
                        state.modify_now(|slots| slots.offerers.retain(|o| o.ticket != ticket));
                    })
                }
            }
        })
    }

    /// Offer each item in order, returning the ones that were refused.
    pub fn offer_all<R: Capabilities, E: Data>(&self, items: Vec<A>) -> Effect<R, E, Vec<A>> {
        let offers = items
            .into_iter()
            .map(|item| {
                let keep = item.clone();
                self.offer::<R, E>(item)
                    .map(move |accepted| (!accepted).then(|| keep.clone()))
            })
            .collect();
        Effect::collect_all(offers).map(|refused| refused.into_iter().flatten().collect())
    }

    /// Dequeue the oldest element, suspending while the queue is empty.
    pub fn take<R: Capabilities, E: Data>(&self) -> Effect<R, E, A> {
        let this = self.clone();
        Effect::async_register(move |callback: Callback<E, A>| {
            let resume = callback.into_resume();
            // The head is removed only once a taker has actually received it, so an
            // interrupted registration leaves the buffer and the parked offerers alone.
            let parked = this.state.modify_now(|slots| {
                if let Some(head) = slots.buffer.front() {
                    if resume.resume(Ok(value(head.clone()))) {
                        slots.pop(this.capacity);
                    }
                    return None;
                }
                let ticket = slots.ticket();
                slots.takers.push_back((ticket, resume));
                Some(ticket)
            });
            match parked {
                None => no_cancel(),
                Some(ticket) => {
                    let state = this.state.clone();
                    Box::new(move || {
                        state.modify_now(|slots| slots.takers.retain(|(t, _)| *t != ticket));
                    })
                }
            }
        })
    }

    /// Dequeue without waiting.
    pub fn poll<R: Capabilities, E: Data>(&self) -> Effect<R, E, Option<A>> {
        let this = self.clone();
        Effect::sync(move || this.state.modify_now(|slots| slots.pop(this.capacity)))
    }

    /// Buffered elements plus suspended offerers.
    pub fn size<R: Capabilities, E: Data>(&self) -> Effect<R, E, usize> {
        let state = self.state.clone();
        Effect::sync(move || state.modify_now(|slots| slots.buffer.len() + slots.offerers.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;

    type Io<A> = Effect<(), Infallible, A>;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_workers(2)).unwrap()
    }

    #[test]
    fn test_take_waits_for_an_offer() {
        let program = Queue::<i32>::unbounded::<(), Infallible>().and_then(|queue| {
            let producer = queue.offer::<(), Infallible>(42).delay(Duration::from_millis(10));
            producer.fork::<Infallible>().then(queue.take())
        });
        assert_eq!(runtime().run(program, ()), Exit::Done(42));
    }

    #[test]
    fn test_bounded_offer_suspends_until_taken() {
        let program = Queue::<i32>::bounded::<(), Infallible>(1).and_then(|queue| {
            let q = queue.clone();
            queue
                .offer::<(), Infallible>(1)
                .then(queue.offer::<(), Infallible>(2).fork::<Infallible>())
                .and_then(move |second| {
                    let q = q.clone();
                    Io::<()>::sleep(Duration::from_millis(10))
                        .then(second.poll::<(), Infallible>().map(|exit| exit.is_some()))
                        .zip(q.take())
                        .zip(second.join().then(q.take()))
                })
        });
        assert_eq!(runtime().run(program, ()), Exit::Done(((false, 1), 2)));
    }

    #[test]
    fn test_sliding_keeps_the_newest() {
        let program = Queue::<i32>::sliding::<(), Infallible>(2).and_then(|queue| {
            let q = queue.clone();
            queue
                .offer_all::<(), Infallible>(vec![1, 2, 3, 4])
                .zip(q.take().zip(q.take()))
        });
        assert_eq!(runtime().run(program, ()), Exit::Done((vec![], (3, 4))));
    }

    #[test]
    fn test_dropping_refuses_when_full() {
        let program = Queue::<i32>::dropping::<(), Infallible>(2).and_then(|queue| {
            let q = queue.clone();
            queue
                .offer_all::<(), Infallible>(vec![1, 2, 3, 4])
                .zip(q.poll().zip(q.poll()).zip(q.poll()))
        });
        assert_eq!(
            runtime().run(program, ()),
            Exit::Done((vec![3, 4], ((Some(1), Some(2)), None)))
        );
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let program = Queue::<i32>::bounded::<(), Infallible>(0).map(|queue| queue.capacity());
        assert_eq!(runtime().run(program, ()), Exit::Done(1));
    }

    #[test]
    fn test_interrupted_taker_does_not_swallow_elements() {
        let program = Queue::<i32>::unbounded::<(), Infallible>().and_then(|queue| {
            let q = queue.clone();
            queue
                .take::<(), Infallible>()
                .fork::<Infallible>()
                .and_then(move |taker| {
                    let q = q.clone();
                    Io::<()>::sleep(Duration::from_millis(10))
                        .then(taker.interrupt::<(), Infallible>())
                        .then(q.offer(7))
                        .then(q.take())
                })
        });
        assert_eq!(runtime().run(program, ()), Exit::Done(7));
    }

    /// Buffered elements and parked takers.
    fn shape(queue: &Queue<u8>) -> Io<(usize, usize)> {
        let state = queue.state.clone();
        Io::sync(move || state.modify_now(|slots| (slots.buffer.len(), slots.takers.len())))
    }

    #[test]
    fn test_interrupted_takers_neither_lose_nor_overfill() {
        let runtime = Runtime::new(RuntimeConfig::default().with_workers(3).with_yield_after(1)).unwrap();

        for round in 0..200u64 {
            let program = Queue::<u8>::bounded::<(), Infallible>(1).and_then(move |queue| {
                let q = queue.clone();
                queue
                    .offer::<(), Infallible>(0)
                    .then(queue.offer::<(), Infallible>(1).fork::<Infallible>())
                    .zip(queue.take::<(), Infallible>().fork::<Infallible>())
                    .and_then(move |(offerer, taker)| {
                        let q = q.clone();
                        Io::<()>::sleep(Duration::from_micros(round % 40))
                            .then(taker.interrupt::<(), Infallible>())
                            .zip(shape(&q))
                            .and_then(move |(taken, shape)| {
                                let drained = q
                                    .poll::<(), Infallible>()
                                    .zip(q.poll())
                                    .zip(offerer.join().then(q.poll()));
                                drained.map(move |((a, b), c)| (taken.clone().done(), shape, vec![a, b, c]))
                            })
                    })
            });

            let Exit::Done((taken, (buffered, takers), drained)) = runtime.run(program, ()) else {
                panic!("round {round} did not finish");
            };
            assert!(buffered <= 1, "round {round}: {buffered} buffered");
            assert!(buffered == 0 || takers == 0, "round {round}: takers wait beside elements");

            let mut seen: Vec<u8> = taken.into_iter().chain(drained.into_iter().flatten()).collect();
            seen.sort_unstable();
            assert_eq!(seen, vec![0, 1], "round {round}");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_bounded_buffer_holds_under_concurrent_offers(
            capacity in 1usize..4,
            producers in 1usize..5,
            per_producer in 1usize..16,
        ) {
            let total = producers * per_producer;
            let program = Queue::<u8>::bounded::<(), Infallible>(capacity).and_then(move |queue| {
                let offers = (0..producers)
                    .map(|p| {
                        let items = (0..per_producer).map(|i| (p * per_producer + i) as u8).collect();
                        queue.offer_all::<(), Infallible>(items).as_(())
                    })
                    .collect();
                let takes = (0..total).map(|_| queue.take::<(), Infallible>().zip(shape(&queue))).collect();
                Io::collect_all_par(offers).zip_par(Io::collect_all(takes)).map(|(_, taken)| taken)
            });

            let taken = runtime().run(program, ()).done().unwrap_or_default();
            prop_assert_eq!(taken.len(), total);
            prop_assert!(taken.iter().all(|(_, (buffered, _))| *buffered <= capacity));

            let mut items: Vec<usize> = taken.iter().map(|(item, _)| *item as usize).collect();
            items.sort_unstable();
            prop_assert_eq!(items, (0..total).collect::<Vec<_>>());
        }

        #[test]
        fn test_buffer_never_exceeds_capacity(
            capacity in 1usize..6,
            items in proptest::collection::vec(any::<u8>(), 0..40),
            sliding in any::<bool>(),
        ) {
            let make = if sliding {
                Queue::<u8>::sliding::<(), Infallible>(capacity)
            } else {
                Queue::<u8>::dropping::<(), Infallible>(capacity)
            };
            let sizes = make.and_then(move |queue| {
                let steps = items
                    .iter()
                    .map(|item| queue.offer::<(), Infallible>(*item).then(queue.size()))
                    .collect();
                Io::collect_all(steps)
            });

            let exit = runtime().run(sizes, ());
            let sizes = exit.done().unwrap_or_default();
            prop_assert!(sizes.iter().all(|size| *size <= capacity));
        }
    }
}
