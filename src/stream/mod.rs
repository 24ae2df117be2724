//! Lazy, pull-based streams and the sinks that consume them.
//!
//! A [`Stream<R, E, A>`] is a [`Managed`] resource whose value is a *pull*: an effect
//! that yields `Some(a)` for the next element or `None` once the stream is over.
//! Acquiring the stream sets up whatever it reads from; using it pulls until `None`;
//! closing it releases what was acquired. After a pull has returned `None`, every
//! later pull on the same acquisition returns `None` as well.
//!
//! A [`Sink`] folds elements into a result and may stop early, handing back what it
//! did not consume. [`Stream::into`] runs one sink over the whole stream;
//! [`Stream::transduce`] runs a sink repeatedly, turning each run into one output
//! element.
//!
//! # Examples
//!
//! ```rust
//! use spindle::prelude::*;
//!
//! let words = Stream::<(), String, &str>::from_vec(vec!["a", "bb", "ccc", "dd", "e"]);
//! let program = words
//!     .filter(|w| w.len() > 1)
//!     .map(|w| w.len())
//!     .transduce(Sink::collect_n(2))
//!     .collect();
//!
//! let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//! assert_eq!(runtime.run(program, ()), Exit::Done(vec![vec![2, 3], vec![2]]));
//! ```

mod concurrent;
mod sink;
mod source;
mod step;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::effect::{Capabilities, Data, Effect};
use crate::exit::ExitTag;
use crate::managed::{Allocated, Managed};
use crate::sync::{Queue, Ref};

pub use sink::Sink;
pub use step::SinkStep;

use source::{feed, Outcome, Source};

/// One pull: the next element, or `None` at the end.
pub type Pull<R, E, A> = Effect<R, E, Option<A>>;

/// A possibly infinite sequence of `A`s, produced on demand.
pub struct Stream<R, E, A> {
    managed: Managed<R, E, Pull<R, E, A>>,
}

impl<R, E, A> Clone for Stream<R, E, A> {
    fn clone(&self) -> Self {
        Stream {
            managed: self.managed.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Stream<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

/// Make `pull` return `None` forever once it has returned `None`.
fn fuse<R: Capabilities, E: Data, A: Data>(pull: Pull<R, E, A>) -> Pull<R, E, A> {
    let ended = Ref::new(false);
    Effect::suspend(move || {
        if ended.modify_now(|ended| *ended) {
            return Effect::succeed(None);
        }
        let ended = ended.clone();
        pull.clone().map(move |item| {
            if item.is_none() {
                ended.modify_now(|ended| *ended = true);
            }
            item
        })
    })
}

impl<R: Capabilities, E: Data, A: Data> Stream<R, E, A> {
    pub fn from_managed(managed: Managed<R, E, Pull<R, E, A>>) -> Self {
        Stream {
            managed: managed.map(fuse),
        }
    }

    pub fn into_managed(self) -> Managed<R, E, Pull<R, E, A>> {
        self.managed
    }

    /// A stream that calls `pull` for every element.
    pub fn from_pull(pull: Pull<R, E, A>) -> Self {
        Self::from_managed(Managed::succeed(pull))
    }

    /// Build a fresh pull, with fresh state, on every acquisition.
    fn stateful<F>(make: F) -> Self
    where
        F: Fn() -> Pull<R, E, A> + Send + Sync + 'static,
    {
        Self::from_managed(Managed::from_effect(Effect::sync(make)))
    }

    /// Derive a new pull from this stream's on every acquisition.
    fn lift<B: Data, F>(self, f: F) -> Stream<R, E, B>
    where
        F: Fn(Pull<R, E, A>) -> Pull<R, E, B> + Send + Sync + 'static,
    {
        Stream::from_managed(self.managed.map(f))
    }

    pub fn empty() -> Self {
        Self::from_pull(Effect::succeed(None))
    }

    pub fn once(a: A) -> Self {
        Self::from_vec(vec![a])
    }

    pub fn from_vec(items: Vec<A>) -> Self {
        let items = Arc::new(items);
        Self::stateful(move || {
            let (items, cursor) = (items.clone(), Ref::new(0usize));
            Effect::sync(move || {
                cursor.modify_now(|at| {
                    let item = items.get(*at).cloned();
                    *at += 1;
                    item
                })
            })
        })
    }

    /// Elements produced from a seed until `f` returns `None`.
    pub fn unfold<S: Data, F>(seed: S, f: F) -> Self
    where
        F: Fn(S) -> Option<(A, S)> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::stateful(move || {
            let (f, state) = (f.clone(), Ref::new(Some(seed.clone())));
            Effect::sync(move || {
                state.modify_now(|slot| {
                    let (a, next) = f(slot.take()?)?;
                    *slot = Some(next);
                    Some(a)
                })
            })
        })
    }

    /// Like [`unfold`](Self::unfold), with an effectful step. A failed step leaves
    /// the seed in place.
    pub fn unfold_effect<S: Data, F>(seed: S, f: F) -> Self
    where
        F: Fn(S) -> Effect<R, E, Option<(A, S)>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::stateful(move || {
            let (f, state) = (f.clone(), Ref::new(Some(seed.clone())));
            Effect::suspend(move || {
                let Some(seed) = state.modify_now(|slot| slot.clone()) else {
                    return Effect::succeed(None);
                };
                let state = state.clone();
                f(seed).map(move |next| {
                    state.modify_now(|slot| *slot = next.as_ref().map(|(_, s)| s.clone()));
                    next.map(|(a, _)| a)
                })
            })
        })
    }

    /// The single value of `effect`, run when first pulled.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        Self::stateful(move || {
            let (effect, fired) = (effect.clone(), Ref::new(false));
            Effect::suspend(move || {
                if fired.modify_now(|fired| std::mem::replace(fired, true)) {
                    Effect::succeed(None)
                } else {
                    effect.clone().map(Some)
                }
            })
        })
    }

    /// Run `effect` for every element, forever.
    pub fn repeat_effect(effect: Effect<R, E, A>) -> Self {
        Self::from_pull(effect.map(Some))
    }

    /// Elements taken from `queue`; never ends by itself.
    pub fn from_queue(queue: Queue<A>) -> Self {
        Self::from_pull(queue.take().map(Some))
    }

    /// A stream that fails with `e` when pulled.
    pub fn raise(e: E) -> Self {
        Self::from_pull(Effect::raise(e))
    }

    pub fn map<B: Data, F>(self, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.lift(move |pull| {
            let f = f.clone();
            pull.map(move |item| item.map(|a| f(a)))
        })
    }

    pub fn map_effect<B: Data, F>(self, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.lift(move |pull| {
            let f = f.clone();
            pull.and_then(move |item| match item {
                Some(a) => f(a).map(Some),
                None => Effect::succeed(None),
            })
        })
    }

    pub fn filter<P>(self, pred: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        self.lift(move |pull| filtered(pull, pred.clone()))
    }

    /// At most `n` elements. Stops pulling upstream after the `n`th.
    pub fn take(self, n: usize) -> Self {
        self.lift(move |pull| {
            let taken = Ref::new(0usize);
            Effect::suspend(move || {
                let more = taken.modify_now(|taken| {
                    if *taken < n {
                        *taken += 1;
                        true
                    } else {
                        false
                    }
                });
                if more {
                    pull.clone()
                } else {
                    Effect::succeed(None)
                }
            })
        })
    }

    /// Elements up to, not including, the first that fails `pred`.
    pub fn take_while<P>(self, pred: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        self.lift(move |pull| {
            let pred = pred.clone();
            pull.map(move |item| item.filter(|a| pred(a)))
        })
    }

    pub fn drop(self, n: usize) -> Self {
        self.lift(move |pull| skipping(pull, Ref::new(n)))
    }

    pub fn drop_while<P>(self, pred: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        self.lift(move |pull| dropping_while(pull, Ref::new(true), pred.clone()))
    }

    /// Pairs of elements, ending with the shorter stream.
    pub fn zip<B: Data>(self, that: Stream<R, E, B>) -> Stream<R, E, (A, B)> {
        Stream::from_managed(self.managed.zip(that.managed).map(|(left, right)| {
            left.and_then(move |a| match a {
                Some(a) => right.clone().map(move |b| b.map(|b| (a.clone(), b))),
                None => Effect::succeed(None),
            })
        }))
    }

    /// This stream, then `that`. `that` is acquired once this one is released.
    pub fn concat(self, that: Stream<R, E, A>) -> Self {
        Stream::from_vec(vec![self, that]).flatten()
    }

    pub fn flat_map<B: Data, F>(self, f: F) -> Stream<R, E, B>
    where
        F: Fn(A) -> Stream<R, E, B> + Send + Sync + 'static,
    {
        self.map(f).flatten()
    }

    /// Run `sink` repeatedly over the stream, emitting one result per run. Elements a
    /// run hands back are fed to the next run.
    ///
    /// A run that makes no progress while the upstream is still open emits its result
    /// once and ends the stream.
    pub fn transduce<S: Data, B: Data>(self, sink: Sink<R, E, S, A, B>) -> Stream<R, E, B> {
        self.lift(move |pull| transduced(Source::new(pull), sink.clone()))
    }

    /// Run `sink` over a prefix and hand back its result with the rest of the stream.
    ///
    /// The rest is only valid while the returned [`Managed`] is in use.
    pub fn peel<S: Data, B: Data>(self, sink: Sink<R, E, S, A, B>) -> Managed<R, E, (B, Stream<R, E, A>)> {
        let managed = self.managed;
        Managed::scoped(move |scope| {
            let sink = sink.clone();
            managed.run_in(scope).and_then(move |pull| {
                let source = Source::new(pull);
                let sink = sink.clone();
                feed(&sink, &source).map(move |outcome| {
                    let (state, leftover) = outcome.into_parts();
                    source.push_front(leftover);
                    (sink.extract(state), Stream::from_pull(source.next()))
                })
            })
        })
    }

    /// Run `sink` over the stream and return its result with whatever it left over.
    pub fn into_leftover<S: Data, B: Data>(self, sink: Sink<R, E, S, A, B>) -> Effect<R, E, (B, Vec<A>)> {
        self.managed.use_(move |pull| {
            let (sink, source) = (sink.clone(), Source::new(pull));
            feed(&sink, &source).map(move |outcome| {
                let (state, leftover) = outcome.into_parts();
                (sink.extract(state), leftover)
            })
        })
    }

    pub fn into<S: Data, B: Data>(self, sink: Sink<R, E, S, A, B>) -> Effect<R, E, B> {
        self.into_leftover(sink).map(|(b, _)| b)
    }

    pub fn collect(self) -> Effect<R, E, Vec<A>> {
        self.into(Sink::collect())
    }

    pub fn fold<S: Data, F>(self, zero: S, f: F) -> Effect<R, E, S>
    where
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        self.into(Sink::fold(zero, f))
    }

    /// Pull everything, discarding the elements.
    pub fn drain(self) -> Effect<R, E, ()> {
        self.into(Sink::drain())
    }
}

impl<R: Capabilities, E: Data> Stream<R, E, i64> {
    /// `start`, `start + 1`, ... up to but excluding `end`.
    pub fn range(start: i64, end: i64) -> Self {
        Self::unfold(start, move |n| (n < end).then_some((n, n + 1)))
    }
}

impl<R: Capabilities, E: Data> Stream<R, E, u64> {
    /// `0, 1, 2, ...`, one every `period`, the first after one period.
    pub fn periodically(period: Duration) -> Self {
        Self::stateful(move || {
            let ticks = Ref::new(0u64);
            Effect::<R, E, ()>::sleep(period).then(Effect::sync(move || {
                Some(ticks.modify_now(|ticks| {
                    *ticks += 1;
                    *ticks - 1
                }))
            }))
        })
    }
}

impl<R: Capabilities, E: Data, A: Data> Stream<R, E, Stream<R, E, A>> {
    /// The elements of each inner stream in turn. Each inner stream is released
    /// before the next is acquired.
    pub fn flatten(self) -> Stream<R, E, A> {
        let outer = self.managed;
        Stream::from_managed(Managed::scoped(move |scope| {
            let current: Ref<Option<Inner<R, E, A>>> = Ref::new(None);
            let scope = scope.clone();
            outer.run_in(&scope).and_then(move |pull| {
                let release = current.clone();
                let next = flattened(pull, current.clone());
                scope
                    .add(move |tag| match release.modify_now(Option::take) {
                        Some(inner) => inner.release(tag),
                        None => Effect::unit(),
                    })
                    .as_(next)
            })
        }))
    }
}

type Inner<R, E, A> = Allocated<R, E, Pull<R, E, A>>;

fn flattened<R: Capabilities, E: Data, A: Data>(
    outer: Pull<R, E, Stream<R, E, A>>,
    current: Ref<Option<Inner<R, E, A>>>,
) -> Pull<R, E, A> {
    Effect::suspend(move || {
        let (outer, current) = (outer.clone(), current.clone());
        match current.modify_now(|slot| slot.clone()) {
            Some(inner) => inner.value.clone().and_then(move |item| match item {
                Some(a) => Effect::succeed(Some(a)),
                None => {
                    let finished = current.clone();
                    Effect::suspend(move || match finished.modify_now(Option::take) {
                        Some(inner) => inner.release(ExitTag::Done),
                        None => Effect::unit(),
                    })
                    .uninterruptible()
                    .then(flattened(outer.clone(), current.clone()))
                }
            }),
            None => {
                let rest = outer.clone();
                outer.and_then(move |next| match next {
                    None => Effect::succeed(None),
                    Some(stream) => {
                        let store = current.clone();
                        stream
                            .managed
                            .allocate()
                            .tap(move |inner| {
                                let (inner, store) = (inner.clone(), store.clone());
                                Effect::sync(move || store.modify_now(|slot| *slot = Some(inner.clone())))
                            })
                            .uninterruptible()
                            .then(flattened(rest.clone(), current.clone()))
                    }
                })
            }
        }
    })
}

fn transduced<R, E, S, A, B>(source: Source<R, E, A>, sink: Sink<R, E, S, A, B>) -> Pull<R, E, B>
where
    R: Capabilities,
    E: Data,
    S: Data,
    A: Data,
    B: Data,
{
    Effect::suspend(move || {
        if source.exhausted() {
            return Effect::succeed(None);
        }
        let (source, sink) = (source.clone(), sink.clone());
        feed(&sink, &source).map(move |outcome| match outcome {
            Outcome::Finished { state, leftover, taken } => {
                let stalled = leftover.len() >= taken;
                source.push_front(leftover);
                if stalled {
                    source.halt();
                }
                Some(sink.extract(state))
            }
            Outcome::Exhausted { state, taken } => (taken > 0).then(|| sink.extract(state)),
        })
    })
}

fn filtered<R, E, A, P>(pull: Pull<R, E, A>, pred: Arc<P>) -> Pull<R, E, A>
where
    R: Capabilities,
    E: Data,
    A: Data,
    P: Fn(&A) -> bool + Send + Sync + 'static,
{
    let again = pull.clone();
    pull.and_then(move |item| match item {
        Some(a) if !pred(&a) => filtered(again.clone(), pred.clone()),
        other => Effect::succeed(other),
    })
}

fn skipping<R: Capabilities, E: Data, A: Data>(pull: Pull<R, E, A>, remaining: Ref<usize>) -> Pull<R, E, A> {
    Effect::suspend(move || {
        let skip = remaining.modify_now(|left| {
            let skip = *left > 0;
            *left = left.saturating_sub(1);
            skip
        });
        if !skip {
            return pull.clone();
        }
        let (again, remaining) = (pull.clone(), remaining.clone());
        pull.clone().and_then(move |item| match item {
            Some(_) => skipping(again.clone(), remaining.clone()),
            None => Effect::succeed(None),
        })
    })
}

fn dropping_while<R, E, A, P>(pull: Pull<R, E, A>, dropping: Ref<bool>, pred: Arc<P>) -> Pull<R, E, A>
where
    R: Capabilities,
    E: Data,
    A: Data,
    P: Fn(&A) -> bool + Send + Sync + 'static,
{
    Effect::suspend(move || {
        if !dropping.modify_now(|dropping| *dropping) {
            return pull.clone();
        }
        let (again, dropping, pred) = (pull.clone(), dropping.clone(), pred.clone());
        pull.clone().and_then(move |item| match item {
            Some(a) if pred(&a) => dropping_while(again.clone(), dropping.clone(), pred.clone()),
            other => {
                dropping.modify_now(|dropping| *dropping = false);
                Effect::succeed(other)
            }
        })
    })
}
