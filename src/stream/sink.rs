use std::fmt;
use std::sync::Arc;

use crate::effect::{Capabilities, Data, Effect};

use super::SinkStep;

type StepFn<R, E, S, A> = Arc<dyn Fn(S, A) -> Effect<R, E, SinkStep<S, A>> + Send + Sync>;
type ExtractFn<S, B> = Arc<dyn Fn(S) -> B + Send + Sync>;

/// A consumer of stream elements: a state machine over `S` that produces a `B`.
///
/// The machine starts from an initial step, is fed one element at a time, and may
/// stop early, returning the elements it did not use. Whatever the final state,
/// `extract` turns it into the result.
pub struct Sink<R, E, S, A, B> {
    initial: Effect<R, E, SinkStep<S, A>>,
    step: StepFn<R, E, S, A>,
    extract: ExtractFn<S, B>,
}

impl<R, E, S, A, B> Clone for Sink<R, E, S, A, B> {
    fn clone(&self) -> Self {
        Sink {
            initial: self.initial.clone(),
            step: self.step.clone(),
            extract: self.extract.clone(),
        }
    }
}

impl<R, E, S, A, B> fmt::Debug for Sink<R, E, S, A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

impl<R: Capabilities, E: Data, S: Data, A: Data, B: Data> Sink<R, E, S, A, B> {
    /// A sink with a pure step function.
    pub fn new<F, X>(initial: SinkStep<S, A>, step: F, extract: X) -> Self
    where
        F: Fn(S, A) -> SinkStep<S, A> + Send + Sync + 'static,
        X: Fn(S) -> B + Send + Sync + 'static,
    {
        Sink {
            initial: Effect::succeed(initial),
            step: Arc::new(move |s, a| Effect::succeed(step(s, a))),
            extract: Arc::new(extract),
        }
    }

    /// A sink whose start and steps are effects.
    pub fn effectful<F, X>(initial: Effect<R, E, SinkStep<S, A>>, step: F, extract: X) -> Self
    where
        F: Fn(S, A) -> Effect<R, E, SinkStep<S, A>> + Send + Sync + 'static,
        X: Fn(S) -> B + Send + Sync + 'static,
    {
        Sink {
            initial,
            step: Arc::new(step),
            extract: Arc::new(extract),
        }
    }

    pub(crate) fn initial(&self) -> Effect<R, E, SinkStep<S, A>> {
        self.initial.clone()
    }

    pub(crate) fn step(&self, state: S, a: A) -> Effect<R, E, SinkStep<S, A>> {
        (self.step)(state, a)
    }

    pub(crate) fn extract(&self, state: S) -> B {
        (self.extract)(state)
    }

    /// Transform the result.
    pub fn map<C: Data, F>(self, f: F) -> Sink<R, E, S, A, C>
    where
        F: Fn(B) -> C + Send + Sync + 'static,
    {
        let extract = self.extract;
        Sink {
            initial: self.initial,
            step: self.step,
            extract: Arc::new(move |s| f(extract(s))),
        }
    }
}

impl<R: Capabilities, E: Data, A: Data> Sink<R, E, Vec<A>, A, Vec<A>> {
    /// Every element, in order.
    pub fn collect() -> Self {
        Sink::new(
            SinkStep::Cont(Vec::new()),
            |mut acc: Vec<A>, a| {
                acc.push(a);
                SinkStep::Cont(acc)
            },
            |acc| acc,
        )
    }

    /// The first `n` elements. Stops as soon as it has them.
    pub fn collect_n(n: usize) -> Self {
        let initial = match n {
            0 => SinkStep::done(Vec::new()),
            _ => SinkStep::Cont(Vec::new()),
        };
        Sink::new(
            initial,
            move |mut acc: Vec<A>, a| {
                acc.push(a);
                if acc.len() >= n {
                    SinkStep::done(acc)
                } else {
                    SinkStep::Cont(acc)
                }
            },
            |acc| acc,
        )
    }

    /// Elements up to the first one failing `pred`, which is handed back as leftover.
    pub fn take_while<P>(pred: P) -> Self
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        Sink::new(
            SinkStep::Cont(Vec::new()),
            move |mut acc: Vec<A>, a| {
                if pred(&a) {
                    acc.push(a);
                    SinkStep::Cont(acc)
                } else {
                    SinkStep::Done(acc, vec![a])
                }
            },
            |acc| acc,
        )
    }
}

impl<R: Capabilities, E: Data, A: Data> Sink<R, E, (), A, ()> {
    /// Consume and discard everything.
    pub fn drain() -> Self {
        Sink::new(SinkStep::Cont(()), |(), _| SinkStep::Cont(()), |()| ())
    }

    /// Run `f` on every element.
    pub fn for_each<F>(f: F) -> Self
    where
        F: Fn(A) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        Sink::effectful(
            Effect::succeed(SinkStep::Cont(())),
            move |(), a| f(a).as_(SinkStep::Cont(())),
            |()| (),
        )
    }
}

impl<R: Capabilities, E: Data, A: Data> Sink<R, E, Option<A>, A, Option<A>> {
    /// The first element, if any. Consumes exactly one.
    pub fn head() -> Self {
        Sink::new(SinkStep::Cont(None), |_, a| SinkStep::done(Some(a)), |head| head)
    }

    /// The last element, if any.
    pub fn last() -> Self {
        Sink::new(SinkStep::Cont(None), |_, a| SinkStep::Cont(Some(a)), |last| last)
    }
}

impl<R: Capabilities, E: Data, S: Data, A: Data> Sink<R, E, S, A, S> {
    pub fn fold<F>(zero: S, f: F) -> Self
    where
        F: Fn(S, A) -> S + Send + Sync + 'static,
    {
        Sink::new(SinkStep::Cont(zero), move |s, a| SinkStep::Cont(f(s, a)), |s| s)
    }

    pub fn fold_effect<F>(zero: S, f: F) -> Self
    where
        F: Fn(S, A) -> Effect<R, E, S> + Send + Sync + 'static,
    {
        Sink::effectful(
            Effect::succeed(SinkStep::Cont(zero)),
            move |s, a| f(s, a).map(SinkStep::Cont),
            |s| s,
        )
    }
}
