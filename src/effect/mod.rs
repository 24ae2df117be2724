//! Typed effect descriptions.
//!
//! An [`Effect<R, E, A>`] is an immutable description of a computation that needs an
//! environment `R`, may fail with `E`, and succeeds with `A`. Building an effect does
//! nothing; a [`Runtime`](crate::Runtime) interprets it on a fiber, as many times as
//! you like.
//!
//! # Examples
//!
//! ```rust
//! use spindle::prelude::*;
//!
//! let program: Effect<(), String, i32> = Effect::succeed(20)
//!     .and_then(|n| Effect::sync(move || n + 1))
//!     .map(|n| n * 2);
//!
//! let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
//! assert_eq!(runtime.run(program, ()), Exit::Done(42));
//! ```

mod concurrent;
pub(crate) mod node;

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::exit::{Cause, Exit, ExitTag, Fault};
use crate::fiber::{Fiber, FiberInner, Resume};

use node::{
    abort_node, cast, fail_node, succeed_node, value, Cont, Env, Erased, Handler, Node,
    RawCause, Release,
};

pub use node::{no_cancel, Canceler};

/// Payload types that can flow through effects.
pub trait Data: Clone + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + Send + Sync + 'static {}

/// Environment records effects can require.
///
/// Capabilities compose through ordinary trait bounds: an effect that needs a logger
/// and a clock is generic over `R: HasLogger + HasClock`, and the program provides one
/// struct implementing both.
pub trait Capabilities: Send + Sync + 'static {}

impl<T> Capabilities for T where T: Send + Sync + 'static {}

/// A description of a computation needing `R`, failing with `E`, succeeding with `A`.
pub struct Effect<R, E, A> {
    node: Erased,
    _marker: PhantomData<fn(&R) -> Result<A, E>>,
}

impl<R, E, A> Clone for Effect<R, E, A> {
    fn clone(&self) -> Self {
        Effect {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<R, E, A> fmt::Debug for Effect<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("output", &type_name::<A>())
            .finish_non_exhaustive()
    }
}

impl<R, E, A> Effect<R, E, A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self::from_erased(Arc::new(node))
    }

    pub(crate) fn from_erased(node: Erased) -> Self {
        Effect {
            node,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Erased {
        self.node
    }
}

fn pass() -> Cont {
    Arc::new(succeed_node)
}

fn with<A: Data>(v: node::Value, f: impl FnOnce(A) -> Erased) -> Erased {
    match cast::<A>(v) {
        Ok(a) => f(a),
        Err(fault) => abort_node(fault),
    }
}

impl<R: Capabilities, E: Data> Effect<R, E, ()> {
    pub fn unit() -> Self {
        Self::from_node(Node::Succeed(node::unit()))
    }

    /// Suspend the fiber for `duration` without blocking a worker thread.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_node(Node::Sleep(duration))
    }

    /// Give other ready fibers a chance to run.
    pub fn yield_now() -> Self {
        Self::from_node(Node::Yield)
    }
}

impl<R: Data, E: Data> Effect<R, E, R> {
    /// The whole environment.
    pub fn environment() -> Self {
        Self::access(|r: &R| r.clone())
    }
}

impl<R: Capabilities, E: Data, A: Data> Effect<R, E, A> {
    pub fn succeed(a: A) -> Self {
        Self::from_node(Node::Succeed(value(a)))
    }

    /// A synchronous thunk. A panic inside `f` ends the fiber with `Abort`.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_node(Node::Sync(Arc::new(move || value(f()))))
    }

    /// A synchronous computation whose `Err` becomes a typed `Raise`.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_node(Node::Try(Arc::new(move || match f() {
            Ok(a) => Ok(value(a)),
            Err(e) => Err(RawCause::Raise(value(e))),
        })))
    }

    /// A synchronous computation whose panics are mapped into a typed `Raise`.
    pub fn try_catch<F, H>(f: F, on_fault: H) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
        H: Fn(Fault) -> E + Send + Sync + 'static,
    {
        Self::from_node(Node::Try(Arc::new(move || {
            match catch_unwind(AssertUnwindSafe(|| f())) {
                Ok(a) => Ok(value(a)),
                Err(payload) => Err(RawCause::Raise(value(on_fault(Fault::from_panic(payload))))),
            }
        })))
    }

    pub fn raise(e: E) -> Self {
        Self::from_node(Node::Fail(RawCause::Raise(value(e))))
    }

    pub fn abort(fault: Fault) -> Self {
        Self::from_node(Node::Fail(RawCause::Abort(fault)))
    }

    pub fn interrupted() -> Self {
        Self::from_node(Node::Fail(RawCause::Interrupt))
    }

    /// Fail with an arbitrary cause.
    pub fn halt(cause: Cause<E>) -> Self {
        Self::from_node(Node::Fail(RawCause::from_cause(cause)))
    }

    pub fn from_exit(exit: Exit<E, A>) -> Self {
        match exit.into_raw() {
            Ok(v) => Self::from_node(Node::Succeed(v)),
            Err(cause) => Self::from_node(Node::Fail(cause)),
        }
    }

    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::raise(e),
        }
    }

    /// Build the effect lazily, each time it is interpreted.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Effect<R, E, A> + Send + Sync + 'static,
    {
        Self::from_node(Node::Suspend(Arc::new(move || f().node)))
    }

    /// An asynchronous computation.
    ///
    /// `register` receives a [`Callback`] to complete the effect from any thread and
    /// returns a [`Canceler`] that runs if the fiber is interrupted while waiting.
    /// Completing the callback before `register` returns continues the fiber without
    /// a trip through the scheduler.
    pub fn async_register<F>(register: F) -> Self
    where
        F: Fn(Callback<E, A>) -> Canceler + Send + Sync + 'static,
    {
        Self::from_node(Node::Async(Arc::new(move |resume| {
            register(Callback::new(resume))
        })))
    }

    /// Suspends until interrupted.
    pub fn never() -> Self {
        Self::async_register(|_callback| no_cancel())
    }

    pub fn access<F>(f: F) -> Self
    where
        F: Fn(&R) -> A + Send + Sync + 'static,
    {
        Self::access_effect(move |r| Effect::succeed(f(r)))
    }

    pub fn access_effect<F>(f: F) -> Self
    where
        F: Fn(&R) -> Effect<R, E, A> + Send + Sync + 'static,
    {
        Self::from_node(Node::Access(Arc::new(move |env: &Env| {
            match (**env).downcast_ref::<R>() {
                Some(r) => f(r).node,
                None => abort_node(Fault::new(format!(
                    "environment does not provide {}",
                    type_name::<R>()
                ))),
            }
        })))
    }

    /// Sequence a computation built from this one's value (monadic bind).
    ///
    /// Any failure of `self` short-circuits past `f`.
    pub fn and_then<B: Data, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        let k: Cont = Arc::new(move |v| with(v, |a: A| f(a).node));
        Effect::from_node(Node::FlatMap(self.node, k))
    }

    pub fn map<B: Data, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let k: Cont = Arc::new(move |v| with(v, |a: A| succeed_node(value(f(a)))));
        Effect::from_node(Node::FlatMap(self.node, k))
    }

    /// Run `next` after this effect, discarding this effect's value.
    pub fn then<B: Data>(self, next: Effect<R, E, B>) -> Effect<R, E, B> {
        let k: Cont = Arc::new(move |_| next.node.clone());
        Effect::from_node(Node::FlatMap(self.node, k))
    }

    pub fn as_<B: Data>(self, b: B) -> Effect<R, E, B> {
        self.map(move |_| b.clone())
    }

    pub fn as_unit(self) -> Effect<R, E, ()> {
        self.map(|_| ())
    }

    /// Run an effect on the value and keep the value.
    pub fn tap<F>(self, f: F) -> Self
    where
        F: Fn(&A) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        self.and_then(move |a| f(&a).as_(a))
    }

    pub fn zip_with<B: Data, C: Data, F>(self, that: Effect<R, E, B>, f: F) -> Effect<R, E, C>
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.and_then(move |a| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    pub fn zip<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Handle every outcome. The failure branch sees the full [`Cause`], so this can
    /// narrow the error type to anything, including [`std::convert::Infallible`].
    ///
    /// A handler installed in an interruptible region does not observe the
    /// interruption of its own fiber; use [`bracket_exit`](Self::bracket_exit) or
    /// [`on_interrupt`](Self::on_interrupt) for cleanup.
    pub fn fold_exit<E2: Data, B: Data, H, K>(self, on_failure: H, on_success: K) -> Effect<R, E2, B>
    where
        H: Fn(Cause<E>) -> Effect<R, E2, B> + Send + Sync + 'static,
        K: Fn(A) -> Effect<R, E2, B> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |cause: RawCause| on_failure(cause.typed::<E>()).node);
        let k: Cont = Arc::new(move |v| with(v, |a: A| on_success(a).node));
        Effect::from_node(Node::Fold(self.node, handler, k))
    }

    /// Recover from typed failures. `Abort` and `Interrupt` pass through untouched.
    pub fn chain_error<E2: Data, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(E) -> Effect<R, E2, A> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |cause: RawCause| match cause {
            RawCause::Raise(v) => with(v, |e: E| f(e).node),
            other => fail_node(other),
        });
        Effect::from_node(Node::Fold(self.node, handler, pass()))
    }

    pub fn map_err<E2: Data, F>(self, f: F) -> Effect<R, E2, A>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |cause: RawCause| match cause {
            RawCause::Raise(v) => with(v, |e: E| fail_node(RawCause::Raise(value(f(e))))),
            other => fail_node(other),
        });
        Effect::from_node(Node::Fold(self.node, handler, pass()))
    }

    /// Turn every outcome into a value.
    pub fn result<E2: Data>(self) -> Effect<R, E2, Exit<E, A>> {
        self.fold_exit(
            |cause| Effect::succeed(Exit::from(cause)),
            |a| Effect::succeed(Exit::Done(a)),
        )
    }

    /// Move typed failures into the value; `Abort` and `Interrupt` still propagate.
    pub fn either<E2: Data>(self) -> Effect<R, E2, Result<A, E>> {
        let handler: Handler = Arc::new(|cause: RawCause| match cause {
            RawCause::Raise(v) => with(v, |e: E| succeed_node(value(Err::<A, E>(e)))),
            other => fail_node(other),
        });
        let k: Cont = Arc::new(|v| with(v, |a: A| succeed_node(value(Ok::<A, E>(a)))));
        Effect::from_node(Node::Fold(self.node, handler, k))
    }

    /// Treat typed failures as faults.
    pub fn or_abort<E2: Data>(self) -> Effect<R, E2, A>
    where
        E: fmt::Debug,
    {
        let handler: Handler = Arc::new(|cause: RawCause| match cause {
            RawCause::Raise(v) => with(v, |e: E| abort_node(Fault::new(format!("{e:?}")))),
            other => fail_node(other),
        });
        Effect::from_node(Node::Fold(self.node, handler, pass()))
    }

    /// Discharge the environment requirement.
    pub fn provide<R2: Capabilities>(self, env: R) -> Effect<R2, E, A> {
        Effect::from_node(Node::Provide(Arc::new(env), self.node))
    }

    /// Derive this effect's environment from a larger one.
    pub fn provide_some<R2: Capabilities, F>(self, f: F) -> Effect<R2, E, A>
    where
        F: Fn(&R2) -> R + Send + Sync + 'static,
    {
        let inner = self.node;
        Effect::from_node(Node::Access(Arc::new(move |env: &Env| {
            match (**env).downcast_ref::<R2>() {
                Some(outer) => Arc::new(Node::Provide(Arc::new(f(outer)), inner.clone())),
                None => abort_node(Fault::new(format!(
                    "environment does not provide {}",
                    type_name::<R2>()
                ))),
            }
        })))
    }

    pub fn interruptible(self) -> Self {
        Self::from_node(Node::Region(true, self.node))
    }

    /// Defer interruption until this effect finishes.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::Region(false, self.node))
    }

    /// Run this effect on a new fiber and continue immediately with its handle.
    pub fn fork<E2: Data>(self) -> Effect<R, E2, Fiber<E, A>> {
        Effect::<R, E2, Arc<FiberInner>>::from_node(Node::Fork(self.node)).map(Fiber::new)
    }

    /// Acquire `self`, use it with `body`, and always run `release`.
    ///
    /// Acquisition is uninterruptible. `release` runs uninterruptibly on every exit of
    /// `body` and receives the exit's [`ExitTag`].
    pub fn bracket_exit<B: Data, Rel, Use>(self, release: Rel, body: Use) -> Effect<R, E, B>
    where
        Rel: Fn(A, ExitTag) -> Effect<R, E, ()> + Send + Sync + 'static,
        Use: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        let release: Release = Arc::new(move |v, tag| with(v, |a: A| release(a, tag).node));
        let body: Cont = Arc::new(move |v| with(v, |a: A| body(a).node));
        Effect::from_node(Node::Bracket {
            acquire: self.node,
            release,
            body,
        })
    }

    pub fn bracket<B: Data, Rel, Use>(self, release: Rel, body: Use) -> Effect<R, E, B>
    where
        Rel: Fn(A) -> Effect<R, E, ()> + Send + Sync + 'static,
        Use: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        self.bracket_exit(move |a, _| release(a), body)
    }

    /// Run `finalizer` after this effect, however it ends.
    pub fn ensuring(self, finalizer: Effect<R, E, ()>) -> Self {
        Effect::<R, E, ()>::unit().bracket_exit(move |_, _| finalizer.clone(), move |_| self.clone())
    }

    /// Run `cleanup` only if this effect is interrupted.
    pub fn on_interrupt(self, cleanup: Effect<R, E, ()>) -> Self {
        Effect::<R, E, ()>::unit().bracket_exit(
            move |_, tag| match tag {
                ExitTag::Interrupt => cleanup.clone(),
                _ => Effect::unit(),
            },
            move |_| self.clone(),
        )
    }

    pub fn delay(self, duration: Duration) -> Self {
        Effect::<R, E, ()>::sleep(duration).then(self)
    }

    /// Repeat until failure or interruption.
    pub fn forever<B: Data>(self) -> Effect<R, E, B> {
        let again = self.clone();
        self.and_then(move |_| again.clone().forever())
    }

    /// Run once, then `times` more times, keeping the last value.
    pub fn repeat_n(self, times: usize) -> Self {
        let again = self.clone();
        self.and_then(move |a| match times {
            0 => Effect::succeed(a),
            _ => again.clone().repeat_n(times - 1),
        })
    }
}

impl<R: Capabilities, E: Data, A: Data> Effect<R, E, Vec<A>> {
    /// Run effects one after another, collecting their values in order.
    pub fn collect_all(effects: Vec<Effect<R, E, A>>) -> Self {
        let effects = Arc::new(effects);
        Effect::suspend(move || {
            let acc = Arc::new(Mutex::new(Vec::with_capacity(effects.len())));
            collect_from(effects.clone(), 0, acc)
        })
    }

    pub fn for_each<T, F>(items: Vec<T>, f: F) -> Self
    where
        F: Fn(T) -> Effect<R, E, A>,
    {
        Self::collect_all(items.into_iter().map(f).collect())
    }

    /// Run effects on their own fibers and collect their values in order.
    ///
    /// If any of them fails, or the caller is interrupted, the others are interrupted.
    pub fn collect_all_par(effects: Vec<Effect<R, E, A>>) -> Self {
        let forks = effects.into_iter().map(|effect| effect.fork()).collect();
        Effect::<R, E, Vec<Fiber<E, A>>>::collect_all(forks).bracket_exit(
            |fibers, tag| match tag {
                ExitTag::Done => Effect::unit(),
                _ => Effect::collect_all(
                    fibers
                        .iter()
                        .map(|fiber| fiber.interrupt::<R, E>().as_unit())
                        .collect(),
                )
                .as_unit(),
            },
            |fibers| Effect::collect_all(fibers.iter().map(|fiber| fiber.join()).collect()),
        )
    }
}

fn collect_from<R: Capabilities, E: Data, A: Data>(
    effects: Arc<Vec<Effect<R, E, A>>>,
    index: usize,
    acc: Arc<Mutex<Vec<A>>>,
) -> Effect<R, E, Vec<A>> {
    match effects.get(index) {
        None => Effect::sync(move || std::mem::take(&mut *acc.lock())),
        Some(effect) => {
            let effects = effects.clone();
            effect.clone().and_then(move |a| {
                acc.lock().push(a);
                collect_from(effects.clone(), index + 1, acc.clone())
            })
        }
    }
}

/// Completes an [`Effect::async_register`] effect.
///
/// Each method returns `false` when the fiber had already moved on, for example
/// because it was interrupted while waiting.
pub struct Callback<E, A> {
    resume: Resume,
    _marker: PhantomData<fn(Exit<E, A>)>,
}

impl<E: Data, A: Data> Callback<E, A> {
    pub(crate) fn new(resume: Resume) -> Self {
        Callback {
            resume,
            _marker: PhantomData,
        }
    }

    pub(crate) fn into_resume(self) -> Resume {
        self.resume
    }

    pub fn succeed(self, a: A) -> bool {
        self.resume.resume(Ok(value(a)))
    }

    pub fn raise(self, e: E) -> bool {
        self.resume.resume(Err(RawCause::Raise(value(e))))
    }

    pub fn abort(self, fault: Fault) -> bool {
        self.resume.resume(Err(RawCause::Abort(fault)))
    }

    pub fn complete(self, result: Result<A, E>) -> bool {
        match result {
            Ok(a) => self.succeed(a),
            Err(e) => self.raise(e),
        }
    }

    pub fn exit(self, exit: Exit<E, A>) -> bool {
        self.resume.resume(exit.into_raw())
    }
}
