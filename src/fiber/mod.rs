//! Fibers: lightweight, interruptible threads of effect execution.
//!
//! A [`Fiber`] is the handle returned by [`Effect::fork`]. It can be joined, waited
//! on, polled, or interrupted.
//!
//! # Examples
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::time::Duration;
//! use spindle::prelude::*;
//!
//! let program: Effect<(), Infallible, Exit<Infallible, ()>> = Effect::<(), Infallible, ()>::never()
//!     .fork()
//!     .and_then(|fiber| fiber.interrupt());
//!
//! let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
//! assert_eq!(runtime.run(program, ()), Exit::Done(Exit::Interrupt));
//! ```

pub(crate) mod runloop;
mod state;

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::node::{value, Node, RawExit};
use crate::effect::{Capabilities, Data, Effect};
use crate::exit::Exit;

pub(crate) use state::FiberInner;

/// Process-unique fiber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        FiberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One-shot capability to complete a particular suspension of a fiber.
pub(crate) struct Resume {
    fiber: Arc<FiberInner>,
    suspension: u64,
}

impl Resume {
    pub(crate) fn new(fiber: Arc<FiberInner>, suspension: u64) -> Self {
        Resume { fiber, suspension }
    }

    pub(crate) fn resume(self, result: RawExit) -> bool {
        self.fiber.resume(self.suspension, result)
    }
}

/// Handle to a running fiber that fails with `E` or succeeds with `A`.
pub struct Fiber<E, A> {
    inner: Arc<FiberInner>,
    _marker: PhantomData<fn() -> Exit<E, A>>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Fiber {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.inner.id())
    }
}

impl<E, A> Fiber<E, A> {
    pub(crate) fn new(inner: Arc<FiberInner>) -> Self {
        Fiber {
            inner,
            _marker: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<FiberInner> {
        &self.inner
    }

    pub fn id(&self) -> FiberId {
        self.inner.id()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.poll_exit().is_some()
    }
}

impl<E: Data, A: Data> Fiber<E, A> {
    /// Wait for the fiber and observe its exit as a value.
    pub fn wait<R: Capabilities, E2: Data>(&self) -> Effect<R, E2, Exit<E, A>> {
        let inner = self.inner.clone();
        Effect::from_node(Node::Async(Arc::new(move |resume: Resume| {
            let token = inner.observe(Box::new(move |raw| {
                resume.resume(Ok(value(Exit::<E, A>::from_raw(raw))));
            }));
            let inner = inner.clone();
            Box::new(move || {
                if let Some(token) = token {
                    inner.unobserve(token);
                }
            })
        })))
    }

    /// Wait for the fiber and adopt its outcome.
    pub fn join<R: Capabilities>(&self) -> Effect<R, E, A> {
        self.wait::<R, E>().and_then(Effect::<R, E, A>::from_exit)
    }

    /// Interrupt the fiber and wait until it has finished its finalizers.
    pub fn interrupt<R: Capabilities, E2: Data>(&self) -> Effect<R, E2, Exit<E, A>> {
        let inner = self.inner.clone();
        Effect::<R, E2, ()>::sync(move || inner.request_interrupt()).then(self.wait())
    }

    /// The exit, if the fiber has already finished.
    pub fn poll<R: Capabilities, E2: Data>(&self) -> Effect<R, E2, Option<Exit<E, A>>> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.poll_exit().map(Exit::from_raw))
    }
}
