use std::fmt;

use crate::effect::node::RawExit;
use crate::effect::{no_cancel, Callback, Capabilities, Data, Effect};
use crate::exit::Exit;
use crate::fiber::Resume;

use super::Ref;

/// A write-once cell that fibers can wait on.
pub struct Deferred<E, A> {
    state: Ref<Slot<E, A>>,
}

impl<E, A> Clone for Deferred<E, A> {
    fn clone(&self) -> Self {
        Deferred {
            state: self.state.clone(),
        }
    }
}

impl<E, A> fmt::Debug for Deferred<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self.state.modify_now(|slot| matches!(slot, Slot::Done(_)));
        f.debug_struct("Deferred").field("done", &done).finish()
    }
}

enum Slot<E, A> {
    Pending {
        waiters: Vec<(u64, Resume)>,
        next_ticket: u64,
    },
    Done(Exit<E, A>),
}

enum Waited<E, A> {
    Now(Exit<E, A>, Resume),
    Parked(u64),
}

impl<E: Data, A: Data> Deferred<E, A> {
    pub fn make<R: Capabilities, E2: Data>() -> Effect<R, E2, Deferred<E, A>> {
        Effect::sync(|| Deferred {
            state: Ref::new(Slot::Pending {
                waiters: Vec::new(),
                next_ticket: 0,
            }),
        })
    }

    /// Suspend until the cell is completed, then adopt its exit.
    pub fn wait<R: Capabilities>(&self) -> Effect<R, E, A> {
        let state = self.state.clone();
        Effect::async_register(move |callback: Callback<E, A>| {
            let resume = callback.into_resume();
            let waited = state.modify_now(|slot| match slot {
                Slot::Done(exit) => Waited::Now(exit.clone(), resume),
                Slot::Pending {
                    waiters,
                    next_ticket,
                } => {
                    *next_ticket += 1;
                    waiters.push((*next_ticket, resume));
                    Waited::Parked(*next_ticket)
                }
            });
            match waited {
                Waited::Now(exit, resume) => {
                    resume.resume(exit.into_raw());
                    no_cancel()
                }
                Waited::Parked(ticket) => {
                    let state = state.clone();
                    Box::new(move || {
                        state.modify_now(|slot| {
                            if let Slot::Pending { waiters, .. } = slot {
                                waiters.retain(|(t, _)| *t != ticket);
                            }
                        });
                    })
                }
            }
        })
    }

    /// Complete the cell. Returns `false` if it was already completed.
    pub fn complete<R: Capabilities, E2: Data>(&self, exit: Exit<E, A>) -> Effect<R, E2, bool> {
        let state = self.state.clone();
        Effect::sync(move || {
            let raw: RawExit = exit.clone().into_raw();
            let waiters = state.modify_now(|slot| match slot {
                Slot::Done(_) => None,
                Slot::Pending { waiters, .. } => {
                    let waiters = std::mem::take(waiters);
                    *slot = Slot::Done(exit.clone());
                    Some(waiters)
                }
            });
            match waiters {
                Some(waiters) => {
                    for (_, resume) in waiters {
                        resume.resume(raw.clone());
                    }
                    true
                }
                None => false,
            }
        })
    }

    pub fn succeed<R: Capabilities, E2: Data>(&self, a: A) -> Effect<R, E2, bool> {
        self.complete(Exit::Done(a))
    }

    pub fn raise<R: Capabilities, E2: Data>(&self, e: E) -> Effect<R, E2, bool> {
        self.complete(Exit::Raise(e))
    }

    /// The exit, if the cell has been completed.
    pub fn poll<R: Capabilities, E2: Data>(&self) -> Effect<R, E2, Option<Exit<E, A>>> {
        let state = self.state.clone();
        Effect::sync(move || {
            state.modify_now(|slot| match slot {
                Slot::Done(exit) => Some(exit.clone()),
                Slot::Pending { .. } => None,
            })
        })
    }
}
