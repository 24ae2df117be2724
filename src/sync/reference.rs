use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Capabilities, Data, Effect};

/// A mutable cell shared between fibers. Every operation is atomic.
pub struct Ref<A> {
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Ref {
            cell: self.cell.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&*self.cell.lock()).finish()
    }
}

impl<A> Ref<A> {
    /// Create a cell outside of any effect.
    pub fn new(initial: A) -> Self {
        Ref {
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// Mutate in place, right now, from inside the runtime.
    pub(crate) fn modify_now<B>(&self, f: impl FnOnce(&mut A) -> B) -> B {
        f(&mut self.cell.lock())
    }
}

impl<A: Data> Ref<A> {
    pub fn make<R: Capabilities, E: Data>(initial: A) -> Effect<R, E, Ref<A>> {
        Effect::sync(move || Ref::new(initial.clone()))
    }

    pub fn get<R: Capabilities, E: Data>(&self) -> Effect<R, E, A> {
        let this = self.clone();
        Effect::sync(move || this.cell.lock().clone())
    }

    pub fn set<R: Capabilities, E: Data>(&self, a: A) -> Effect<R, E, ()> {
        let this = self.clone();
        Effect::sync(move || *this.cell.lock() = a.clone())
    }

    /// Apply `f` and return the new value.
    pub fn update<R: Capabilities, E: Data, F>(&self, f: F) -> Effect<R, E, A>
    where
        F: Fn(A) -> A + Send + Sync + 'static,
    {
        let this = self.clone();
        Effect::sync(move || {
            this.modify_now(|current| {
                let next = f(current.clone());
                *current = next.clone();
                next
            })
        })
    }

    /// Replace the value with the second half of `f`'s result and return the first.
    pub fn modify<R: Capabilities, E: Data, B: Data, F>(&self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> (B, A) + Send + Sync + 'static,
    {
        let this = self.clone();
        Effect::sync(move || {
            this.modify_now(|current| {
                let (out, next) = f(current.clone());
                *current = next;
                out
            })
        })
    }
}
