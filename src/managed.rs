//! Resources with a release obligation.
//!
//! A [`Managed<R, E, A>`] describes how to acquire an `A` and register its release on
//! a [`Scope`]. Nothing happens until the managed value is used: [`Managed::use_`]
//! opens a scope, acquires, runs the body, and closes the scope however the body
//! ends. Closing runs every registered finalizer in reverse order of registration.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use std::convert::Infallible;
//! use spindle::prelude::*;
//!
//! let log = Arc::new(Mutex::new(Vec::new()));
//! let resource = |name: &'static str| {
//!     let (open, close) = (log.clone(), log.clone());
//!     Managed::bracket(
//!         Effect::<(), Infallible, _>::sync(move || {
//!             open.lock().unwrap().push(format!("open {name}"));
//!             name
//!         }),
//!         move |name| {
//!             let close = close.clone();
//!             Effect::sync(move || close.lock().unwrap().push(format!("close {name}")))
//!         },
//!     )
//! };
//!
//! let program = resource("a").zip(resource("b")).use_(|(a, b)| Effect::succeed(format!("{a}{b}")));
//!
//! let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
//! assert_eq!(runtime.run(program, ()), Exit::Done("ab".to_string()));
//! assert_eq!(
//!     *log.lock().unwrap(),
//!     vec!["open a", "open b", "close b", "close a"]
//! );
//! ```

use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::effect::node::{
    cast, fail_node, protect, succeed_node, unit, value, Erased, Node, RawCause, Value,
};
use crate::effect::{Capabilities, Data, Effect};
use crate::exit::ExitTag;
use crate::sync::Ref;

type Finalizer = Arc<dyn Fn(ExitTag) -> Erased + Send + Sync>;
type Remap = Arc<dyn Fn(RawCause) -> RawCause + Send + Sync>;

/// A set of finalizers that are run together when the scope closes.
#[derive(Clone)]
pub struct Scope {
    state: Ref<ScopeState>,
    /// Translates finalizer failures into the error type of the scope's owner.
    remap: Option<Remap>,
}

struct ScopeState {
    finalizers: Vec<Finalizer>,
    closed: Option<ExitTag>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pending, closed) = self
            .state
            .modify_now(|state| (state.finalizers.len(), state.closed));
        f.debug_struct("Scope")
            .field("pending", &pending)
            .field("closed", &closed)
            .finish()
    }
}

impl Scope {
    pub(crate) fn new() -> Self {
        Scope {
            state: Ref::new(ScopeState {
                finalizers: Vec::new(),
                closed: None,
            }),
            remap: None,
        }
    }

    /// Register a finalizer. If the scope is already closed it runs immediately with
    /// the tag the scope was closed with.
    pub fn add<R, E, F>(&self, finalizer: F) -> Effect<R, E, ()>
    where
        R: Capabilities,
        E: Data,
        F: Fn(ExitTag) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        let finalizer = Arc::new(finalizer);
        let entry: Finalizer = {
            let finalizer = finalizer.clone();
            let remap = self.remap.clone();
            Arc::new(move |tag| {
                let node = finalizer(tag).into_node();
                match &remap {
                    Some(remap) => remapped(node, remap.clone()),
                    None => node,
                }
            })
        };
        let state = self.state.clone();
        Effect::from_node(Node::Suspend(Arc::new(move || {
            let closed = state.modify_now(|state| match state.closed {
                Some(tag) => Some(tag),
                None => {
                    state.finalizers.push(entry.clone());
                    None
                }
            });
            match closed {
                Some(tag) => finalizer(tag).into_node(),
                None => succeed_node(unit()),
            }
        })))
    }

    /// Run every finalizer in reverse order of registration, uninterruptibly.
    ///
    /// All finalizers run even if some fail. The first failure becomes the close's
    /// cause; later ones are recorded as suppressed. Closing twice is a no-op.
    pub fn close<R: Capabilities, E: Data>(&self, tag: ExitTag) -> Effect<R, E, ()> {
        let state = self.state.clone();
        Effect::<R, E, ()>::from_node(Node::Suspend(Arc::new(move || {
            let mut finalizers = state.modify_now(|state| {
                if state.closed.is_some() {
                    return Vec::new();
                }
                state.closed = Some(tag);
                mem::take(&mut state.finalizers)
            });
            finalizers.reverse();
            tracing::trace!(finalizers = finalizers.len(), %tag, "closing scope");
            run_finalizers(Arc::new(finalizers), 0, tag, None)
        })))
        .uninterruptible()
    }

    /// A view of this scope for an owner whose errors are translated by `remap`.
    fn mapped(&self, remap: Remap) -> Scope {
        let remap = match &self.remap {
            Some(outer) => {
                let outer = outer.clone();
                Arc::new(move |cause| outer(remap(cause))) as Remap
            }
            None => remap,
        };
        Scope {
            state: self.state.clone(),
            remap: Some(remap),
        }
    }
}

fn remapped(node: Erased, remap: Remap) -> Erased {
    Arc::new(Node::Fold(
        node,
        Arc::new(move |cause: RawCause| fail_node(remap(cause))),
        Arc::new(succeed_node),
    ))
}

fn run_finalizers(
    finalizers: Arc<Vec<Finalizer>>,
    index: usize,
    tag: ExitTag,
    failed: Option<RawCause>,
) -> Erased {
    let Some(finalizer) = finalizers.get(index) else {
        return match failed {
            Some(cause) => fail_node(cause),
            None => succeed_node(unit()),
        };
    };
    let node = protect(|| finalizer(tag));
    let rest = finalizers.clone();
    let first = failed.clone();
    Arc::new(Node::Fold(
        node,
        Arc::new(move |cause: RawCause| match &first {
            None => run_finalizers(rest.clone(), index + 1, tag, Some(cause)),
            Some(_) => {
                let rest = rest.clone();
                let first = first.clone();
                Arc::new(Node::FlatMap(
                    Arc::new(Node::Report(cause)),
                    Arc::new(move |_: Value| run_finalizers(rest.clone(), index + 1, tag, first.clone())),
                ))
            }
        }),
        Arc::new({
            let finalizers = finalizers.clone();
            move |_: Value| run_finalizers(finalizers.clone(), index + 1, tag, failed.clone())
        }),
    ))
}

/// A resource whose release is registered on a [`Scope`].
pub struct Managed<R, E, A> {
    run: Arc<dyn Fn(&Scope) -> Effect<R, E, A> + Send + Sync>,
}

impl<R, E, A> Clone for Managed<R, E, A> {
    fn clone(&self) -> Self {
        Managed {
            run: self.run.clone(),
        }
    }
}

impl<R, E, A> fmt::Debug for Managed<R, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed").finish_non_exhaustive()
    }
}

/// A resource acquired outside of [`Managed::use_`]; the owner decides when to release.
pub struct Allocated<R, E, A> {
    pub value: A,
    scope: Scope,
    _marker: std::marker::PhantomData<fn(&R) -> E>,
}

impl<R, E, A: Clone> Clone for Allocated<R, E, A> {
    fn clone(&self) -> Self {
        Allocated {
            value: self.value.clone(),
            scope: self.scope.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<R: Capabilities, E: Data, A> Allocated<R, E, A> {
    /// Run the resource's finalizers. Releasing twice is a no-op.
    pub fn release(&self, tag: ExitTag) -> Effect<R, E, ()> {
        self.scope.close(tag)
    }
}

impl<R: Capabilities, E: Data> Managed<R, E, ()> {
    /// A finalizer with no resource.
    pub fn finalizer(finalizer: Effect<R, E, ()>) -> Self {
        Managed::scoped(move |scope| {
            let finalizer = finalizer.clone();
            scope.add(move |_| finalizer.clone())
        })
    }
}

impl<R: Capabilities, E: Data, A: Data> Managed<R, E, A> {
    /// Build from a function that acquires within a given scope.
    pub fn scoped<F>(f: F) -> Self
    where
        F: Fn(&Scope) -> Effect<R, E, A> + Send + Sync + 'static,
    {
        Managed { run: Arc::new(f) }
    }

    pub(crate) fn run_in(&self, scope: &Scope) -> Effect<R, E, A> {
        (self.run)(scope)
    }

    pub fn succeed(a: A) -> Self {
        Self::from_effect(Effect::succeed(a))
    }

    /// Lift an effect with nothing to release.
    pub fn from_effect(effect: Effect<R, E, A>) -> Self {
        Managed::scoped(move |_| effect.clone())
    }

    /// Acquire with `acquire`; `release` receives how the scope ended.
    ///
    /// Acquisition and registration of `release` are uninterruptible, so an acquired
    /// resource is always released.
    pub fn bracket_exit<F>(acquire: Effect<R, E, A>, release: F) -> Self
    where
        F: Fn(A, ExitTag) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        let release = Arc::new(release);
        Managed::scoped(move |scope| {
            let scope = scope.clone();
            let release = release.clone();
            acquire
                .clone()
                .tap(move |a| {
                    let (a, release) = (a.clone(), release.clone());
                    scope.add(move |tag| release(a.clone(), tag))
                })
                .uninterruptible()
        })
    }

    pub fn bracket<F>(acquire: Effect<R, E, A>, release: F) -> Self
    where
        F: Fn(A) -> Effect<R, E, ()> + Send + Sync + 'static,
    {
        Self::bracket_exit(acquire, move |a, _| release(a))
    }

    /// Build the managed value lazily, each time it is used.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> Managed<R, E, A> + Send + Sync + 'static,
    {
        Managed::scoped(move |scope| f().run_in(scope))
    }

    pub fn map<B: Data, F>(self, f: F) -> Managed<R, E, B>
    where
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Managed::scoped(move |scope| {
            let f = f.clone();
            self.run_in(scope).map(move |a| f(a))
        })
    }

    pub fn map_effect<B: Data, F>(self, f: F) -> Managed<R, E, B>
    where
        F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Managed::scoped(move |scope| {
            let f = f.clone();
            self.run_in(scope).and_then(move |a| f(a))
        })
    }

    /// Acquire a second resource that depends on the first, in the same scope.
    pub fn and_then<B: Data, F>(self, f: F) -> Managed<R, E, B>
    where
        F: Fn(A) -> Managed<R, E, B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Managed::scoped(move |scope| {
            let (f, scope2) = (f.clone(), scope.clone());
            self.run_in(scope).and_then(move |a| f(a).run_in(&scope2))
        })
    }

    pub fn zip_with<B: Data, C: Data, F>(self, that: Managed<R, E, B>, f: F) -> Managed<R, E, C>
    where
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.and_then(move |a| {
            let f = f.clone();
            that.clone().map(move |b| f(a.clone(), b))
        })
    }

    pub fn zip<B: Data>(self, that: Managed<R, E, B>) -> Managed<R, E, (A, B)> {
        self.zip_with(that, |a, b| (a, b))
    }

    /// Translate the error type, including failures of the finalizers.
    pub fn map_err<E2: Data, F>(self, f: F) -> Managed<R, E2, A>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let remap: Remap = {
            let f = f.clone();
            Arc::new(move |cause| match cause {
                RawCause::Raise(v) => match cast::<E>(v) {
                    Ok(e) => RawCause::Raise(value(f(e))),
                    Err(fault) => RawCause::Abort(fault),
                },
                other => other,
            })
        };
        Managed::scoped(move |scope| {
            let f = f.clone();
            self.run_in(&scope.mapped(remap.clone())).map_err(move |e| f(e))
        })
    }

    /// Acquire, run `f`, and release, whatever happens.
    pub fn use_<B: Data, F>(self, f: F) -> Effect<R, E, B>
    where
        F: Fn(A) -> Effect<R, E, B> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Effect::<R, E, Scope>::sync(Scope::new).bracket_exit(
            |scope, tag| scope.close(tag),
            move |scope| {
                let f = f.clone();
                self.run_in(&scope).and_then(move |a| f(a))
            },
        )
    }

    /// Acquire now and hand back the value with its release action.
    ///
    /// Runs uninterruptibly. If acquisition fails, whatever was registered so far is
    /// released before the failure propagates.
    pub fn allocate(self) -> Effect<R, E, Allocated<R, E, A>> {
        Effect::<R, E, Scope>::sync(Scope::new)
            .and_then(move |scope| {
                let on_failure = scope.clone();
                let on_success = scope.clone();
                self.run_in(&scope).fold_exit(
                    move |cause| on_failure.close::<R, E>(cause.tag()).then(Effect::halt(cause)),
                    move |value| {
                        Effect::succeed(Allocated {
                            value,
                            scope: on_success.clone(),
                            _marker: std::marker::PhantomData,
                        })
                    },
                )
            })
            .uninterruptible()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;
    use crate::exit::Exit;
    use crate::runtime::Runtime;
    use crate::sync::Deferred;
    use crate::RuntimeConfig;

    type Io<A> = Effect<(), String, A>;
    type Log = Arc<Mutex<Vec<String>>>;

    fn runtime() -> Runtime {
        crate::test_logging::init_test_logging();
        Runtime::new(RuntimeConfig::default().with_workers(2)).unwrap()
    }

    fn resource(log: &Log, name: &'static str) -> Managed<(), String, &'static str> {
        let (open, close) = (log.clone(), log.clone());
        Managed::bracket_exit(
            Io::sync(move || {
                open.lock().push(format!("open {name}"));
                name
            }),
            move |name, tag| {
                let close = close.clone();
                Io::sync(move || close.lock().push(format!("close {name} {tag}")))
            },
        )
    }

    #[test]
    fn test_raising_use_closes_before_the_exit() {
        let log = Log::default();
        let program = resource(&log, "file").use_(|_| Io::<()>::raise("boom".into()));

        assert_eq!(runtime().run(program, ()), Exit::Raise("boom".to_string()));
        assert_eq!(*log.lock(), vec!["open file", "close file raise"]);
    }

    #[test]
    fn test_nested_resources_close_in_reverse() {
        let log = Log::default();
        let program = resource(&log, "a")
            .zip(resource(&log, "b"))
            .and_then({
                let log = log.clone();
                move |_| resource(&log, "c")
            })
            .use_(|_| Io::unit());

        assert_eq!(runtime().run(program, ()), Exit::Done(()));
        assert_eq!(
            *log.lock(),
            vec!["open a", "open b", "open c", "close c done", "close b done", "close a done"]
        );
    }

    #[test]
    fn test_every_finalizer_runs_and_the_first_failure_wins() {
        let log = Log::default();
        let failing = |message: &'static str| Managed::<(), String, ()>::finalizer(Io::raise(message.into()));
        let program = resource(&log, "outer")
            .zip(failing("second"))
            .zip(failing("first"))
            .use_(|_| Io::succeed(1));

        let report = runtime().run_report(program, ());
        assert_eq!(report.exit, Exit::Raise("first".to_string()));
        assert_eq!(report.suppressed.len(), 1);
        assert_eq!(report.suppressed[0].raised::<String>(), Some("second".to_string()));
        assert_eq!(*log.lock(), vec!["open outer", "close outer done"]);
    }

    #[test]
    fn test_map_err_translates_finalizer_failures() {
        let program = Managed::<(), u8, ()>::finalizer(Effect::raise(7))
            .map_err(|code| format!("code {code}"))
            .use_(|_| Io::succeed(()));

        assert_eq!(runtime().run(program, ()), Exit::Raise("code 7".to_string()));
    }

    #[test]
    fn test_failed_acquisition_releases_what_was_acquired() {
        let log = Log::default();
        let program = resource(&log, "first")
            .zip(Managed::from_effect(Io::<()>::raise("second failed".into())))
            .use_(|_| Io::unit());

        assert_eq!(runtime().run(program, ()), Exit::Raise("second failed".to_string()));
        assert_eq!(*log.lock(), vec!["open first", "close first raise"]);
    }

    #[test]
    fn test_allocate_hands_over_the_release() {
        let log = Log::default();
        let program = resource(&log, "kept").allocate().and_then({
            let log = log.clone();
            move |allocated| {
                let log = log.clone();
                let release = allocated.release(ExitTag::Done);
                Io::sync(move || log.lock().push(format!("using {}", allocated.value)))
                    .then(release.clone())
                    .then(release)
            }
        });

        assert_eq!(runtime().run(program, ()), Exit::Done(()));
        assert_eq!(*log.lock(), vec!["open kept", "using kept", "close kept done"]);
    }

    #[test]
    fn test_interrupted_use_releases_with_interrupt() {
        let log = Log::default();
        let managed = resource(&log, "socket");
        let program = Deferred::<String, ()>::make::<(), String>().and_then(move |started| {
            let s = started.clone();
            let user = managed
                .clone()
                .use_(move |_| s.succeed::<(), String>(()).then(Io::<()>::never()));
            user.fork::<String>()
                .and_then(move |fiber| started.wait().then(fiber.interrupt::<(), String>()))
        });

        assert_eq!(runtime().run(program, ()), Exit::Done(Exit::Interrupt));
        assert_eq!(*log.lock(), vec!["open socket", "close socket interrupt"]);
    }

    /// Like `resource`, but acquiring takes several scheduler steps.
    fn stepped(log: &Log, name: &'static str) -> Managed<(), String, &'static str> {
        let (open, close) = (log.clone(), log.clone());
        Managed::bracket_exit(
            Io::<()>::yield_now().repeat_n(3).then(Io::sync(move || {
                open.lock().push(format!("open {name}"));
                name
            })),
            move |name, tag| {
                let close = close.clone();
                Io::sync(move || close.lock().push(format!("close {name} {tag}")))
            },
        )
    }

    #[test]
    fn test_release_runs_once_wherever_the_interrupt_lands() {
        crate::test_logging::init_test_logging();
        // One worker and a small fuel budget: the parent's yield count picks the step
        // at which the interrupt arrives, from mid-acquire to after completion.
        let runtime = Runtime::new(RuntimeConfig::default().with_workers(1).with_yield_after(2)).unwrap();

        for point in 0..120 {
            let log = Log::default();
            let managed = stepped(&log, "a").zip(stepped(&log, "b")).zip(stepped(&log, "c"));
            let user = managed.use_(|_| Io::<()>::yield_now().repeat_n(12));
            let program = user.fork::<String>().and_then(move |fiber| {
                Io::<()>::yield_now()
                    .repeat_n(point)
                    .then(fiber.interrupt::<(), String>())
            });

            assert!(runtime.run(program, ()).is_done(), "interrupt point {point}");

            let log = log.lock().clone();
            for name in ["a", "b", "c"] {
                let opened = log.iter().filter(|line| **line == format!("open {name}")).count();
                let closed = log
                    .iter()
                    .filter(|line| line.starts_with(&format!("close {name} ")))
                    .count();
                assert!(opened <= 1, "point {point}: {log:?}");
                assert_eq!(opened, closed, "point {point}: {log:?}");
            }
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Ending {
        Done,
        Raise,
        Interrupt,
    }

    fn ending() -> impl Strategy<Value = Ending> {
        prop_oneof![Just(Ending::Done), Just(Ending::Raise), Just(Ending::Interrupt)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_finalizers_run_once_in_reverse_for_every_ending(
            count in 1usize..6,
            ending in ending(),
            delay_ms in 0u64..3,
        ) {
            let log = Log::default();
            let names = ["r0", "r1", "r2", "r3", "r4", "r5"];
            let mut managed = resource(&log, names[0]).map(|_| ());
            for name in &names[1..count] {
                managed = managed.zip(resource(&log, *name)).map(|_| ());
            }
            let body = move |_: ()| match ending {
                Ending::Done => Io::unit(),
                Ending::Raise => Io::raise("body".into()),
                Ending::Interrupt => Io::<()>::never(),
            };
            let used = managed.use_(body);
            let program = used
                .fork::<String>()
                .and_then(move |fiber| match ending {
                    Ending::Interrupt => Io::<()>::sleep(Duration::from_millis(delay_ms))
                        .then(fiber.interrupt::<(), String>()),
                    _ => fiber.wait(),
                });

            let exit = runtime().run(program, ());
            prop_assert!(exit.is_done());

            let log = log.lock().clone();
            let opened: Vec<_> = log.iter().filter(|line| line.starts_with("open")).cloned().collect();
            let closed: Vec<_> = log.iter().filter(|line| line.starts_with("close")).cloned().collect();
            prop_assert_eq!(opened.len(), closed.len());
            for (open, close) in opened.iter().rev().zip(&closed) {
                prop_assert_eq!(&open["open ".len()..], close.split(' ').nth(1).unwrap_or_default());
            }
        }
    }
}
