use std::collections::VecDeque;

use crate::effect::{Capabilities, Data, Effect};
use crate::sync::Ref;

use super::{Pull, Sink, SinkStep};

/// A pull with a pushback buffer in front of it.
pub(crate) struct Source<R, E, A> {
    pull: Pull<R, E, A>,
    state: Ref<Buffered<A>>,
}

struct Buffered<A> {
    items: VecDeque<A>,
    ended: bool,
}

impl<R, E, A> Clone for Source<R, E, A> {
    fn clone(&self) -> Self {
        Source {
            pull: self.pull.clone(),
            state: self.state.clone(),
        }
    }
}

impl<R: Capabilities, E: Data, A: Data> Source<R, E, A> {
    pub(crate) fn new(pull: Pull<R, E, A>) -> Self {
        Source {
            pull,
            state: Ref::new(Buffered {
                items: VecDeque::new(),
                ended: false,
            }),
        }
    }

    /// Buffered elements first, then the upstream.
    pub(crate) fn next(&self) -> Pull<R, E, A> {
        let this = self.clone();
        Effect::suspend(move || {
            let buffered = this.state.modify_now(|state| match state.items.pop_front() {
                Some(item) => Ok(Some(item)),
                None if state.ended => Ok(None),
                None => Err(()),
            });
            match buffered {
                Ok(item) => Effect::succeed(item),
                Err(()) => {
                    let state = this.state.clone();
                    this.pull.clone().map(move |item| {
                        if item.is_none() {
                            state.modify_now(|state| state.ended = true);
                        }
                        item
                    })
                }
            }
        })
    }

    /// Put elements back so that the next pulls see them in order.
    pub(crate) fn push_front(&self, items: Vec<A>) {
        self.state.modify_now(|state| {
            for item in items.into_iter().rev() {
                state.items.push_front(item);
            }
        });
    }

    /// The upstream has ended and nothing is buffered.
    pub(crate) fn exhausted(&self) -> bool {
        self.state.modify_now(|state| state.ended && state.items.is_empty())
    }

    /// Stop producing, discarding anything buffered.
    pub(crate) fn halt(&self) {
        self.state.modify_now(|state| {
            state.ended = true;
            state.items.clear();
        });
    }
}

/// How one run of a sink over a source ended.
#[derive(Clone)]
pub(crate) enum Outcome<S, A> {
    /// The sink stopped on its own.
    Finished { state: S, leftover: Vec<A>, taken: usize },
    /// The source ran dry while the sink still wanted more.
    Exhausted { state: S, taken: usize },
}

impl<S, A> Outcome<S, A> {
    pub(crate) fn into_parts(self) -> (S, Vec<A>) {
        match self {
            Outcome::Finished { state, leftover, .. } => (state, leftover),
            Outcome::Exhausted { state, .. } => (state, Vec::new()),
        }
    }
}

/// Run `sink` from its initial step, pulling from `source` until it finishes or the
/// source runs dry.
pub(crate) fn feed<R, E, S, A, B>(sink: &Sink<R, E, S, A, B>, source: &Source<R, E, A>) -> Effect<R, E, Outcome<S, A>>
where
    R: Capabilities,
    E: Data,
    S: Data,
    A: Data,
    B: Data,
{
    let (sink, source) = (sink.clone(), source.clone());
    let initial = sink.initial();
    initial.and_then(move |step| drive(sink.clone(), source.clone(), step, 0))
}

fn drive<R, E, S, A, B>(
    sink: Sink<R, E, S, A, B>,
    source: Source<R, E, A>,
    step: SinkStep<S, A>,
    taken: usize,
) -> Effect<R, E, Outcome<S, A>>
where
    R: Capabilities,
    E: Data,
    S: Data,
    A: Data,
    B: Data,
{
    let state = match step {
        SinkStep::Done(state, leftover) => {
            return Effect::succeed(Outcome::Finished { state, leftover, taken });
        }
        SinkStep::Cont(state) => state,
    };
    source.next().and_then(move |item| match item {
        None => Effect::succeed(Outcome::Exhausted {
            state: state.clone(),
            taken,
        }),
        Some(a) => {
            let (sink, source) = (sink.clone(), source.clone());
            let stepped = sink.step(state.clone(), a);
            stepped.and_then(move |step| drive(sink.clone(), source.clone(), step, taken + 1))
        }
    })
}
