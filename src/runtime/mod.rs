//! The runtime: a pool of worker threads that interpret fibers.
//!
//! Fibers are multiplexed onto `workers` OS threads. A fiber runs until it suspends
//! on an async registration, exits, or spends its `yield_after` step budget, at which
//! point it goes to the back of the ready queue. Sleeping is handled by a dedicated
//! timer thread, so no worker ever blocks on a sleeping fiber.
//!
//! # Examples
//!
//! ```rust
//! use std::convert::Infallible;
//! use spindle::{Effect, Exit, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default().with_workers(2)).unwrap();
//! let exit = runtime.run(Effect::<(), Infallible, _>::succeed("ready"), ());
//! assert_eq!(exit, Exit::Done("ready"));
//! ```

pub(crate) mod scheduler;
pub(crate) mod timer;

use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use once_cell::sync::OnceCell;

use crate::config::RuntimeConfig;
use crate::effect::node::RawCause;
use crate::effect::{Capabilities, Data, Effect};
use crate::error::RuntimeError;
use crate::exit::{Cause, Exit, ExitTag};
use crate::fiber::{Fiber, FiberId, FiberInner};

use scheduler::Scheduler;

pub struct Runtime {
    scheduler: Arc<Scheduler>,
    threads: Vec<JoinHandle<()>>,
    config: RuntimeConfig,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime").field("config", &self.config).finish()
    }
}

/// The exit of a top-level run, plus failures that were suppressed on the way out,
/// such as release actions that failed while an earlier failure was unwinding.
#[derive(Debug, Clone)]
pub struct Report<E, A> {
    pub exit: Exit<E, A>,
    pub suppressed: Vec<Suppressed>,
}

/// A failure that did not become the exit.
#[derive(Clone)]
pub struct Suppressed(RawCause);

impl Suppressed {
    pub fn tag(&self) -> ExitTag {
        self.0.tag()
    }

    /// The cause, if its typed payload is an `E`.
    pub fn cause<E: Data>(&self) -> Cause<E> {
        self.0.clone().typed()
    }

    /// The typed error, if this is a `Raise` carrying an `E`.
    pub fn raised<E: Data>(&self) -> Option<E> {
        match &self.0 {
            RawCause::Raise(_) => self.cause::<E>().raised(),
            _ => None,
        }
    }
}

impl fmt::Debug for Suppressed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

/// Interrupts a fiber started with [`Runtime::run_callback`].
#[derive(Clone)]
pub struct CancelHandle {
    fiber: Arc<FiberInner>,
}

impl CancelHandle {
    pub fn id(&self) -> FiberId {
        self.fiber.id()
    }

    /// Request interruption. The callback still fires, with `Exit::Interrupt` unless
    /// the fiber finished first.
    pub fn cancel(&self) {
        self.fiber.request_interrupt();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancelHandle({})", self.fiber.id())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let scheduler = Scheduler::new(config.yield_after);
        let mut runtime = Runtime {
            scheduler: scheduler.clone(),
            threads: Vec::with_capacity(config.workers + 1),
            config,
        };

        let timer = scheduler.timer().clone();
        let name = format!("{}-timer", runtime.config.thread_name);
        runtime.threads.push(spawn_thread(name, move || timer.run())?);

        for index in 0..runtime.config.workers {
            let scheduler = scheduler.clone();
            let name = format!("{}-worker-{index}", runtime.config.thread_name);
            runtime.threads.push(spawn_thread(name, move || scheduler.work())?);
        }

        tracing::debug!(
            workers = runtime.config.workers,
            yield_after = runtime.config.yield_after,
            "runtime started"
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start `effect` on a new fiber with `env` as its environment.
    pub fn spawn<R, E, A>(&self, effect: Effect<R, E, A>, env: R) -> Fiber<E, A>
    where
        R: Capabilities,
        E: Data,
        A: Data,
    {
        Fiber::new(FiberInner::spawn(
            &self.scheduler,
            effect.into_node(),
            Some(Arc::new(env)),
        ))
    }

    /// Run `effect` to completion, blocking the calling thread.
    ///
    /// Must not be called from inside a fiber of this runtime.
    pub fn run<R, E, A>(&self, effect: Effect<R, E, A>, env: R) -> Exit<E, A>
    where
        R: Capabilities,
        E: Data,
        A: Data,
    {
        self.run_report(effect, env).exit
    }

    pub fn run_report<R, E, A>(&self, effect: Effect<R, E, A>, env: R) -> Report<E, A>
    where
        R: Capabilities,
        E: Data,
        A: Data,
    {
        let fiber = self.spawn(effect, env);
        let exit = Exit::from_raw(fiber.inner().block());
        let suppressed = fiber.inner().suppressed().into_iter().map(Suppressed).collect();
        Report { exit, suppressed }
    }

    /// Run `effect` without blocking; `callback` receives the exit on a worker thread.
    pub fn run_callback<R, E, A, F>(&self, effect: Effect<R, E, A>, env: R, callback: F) -> CancelHandle
    where
        R: Capabilities,
        E: Data,
        A: Data,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let fiber = self.spawn(effect, env);
        let id = fiber.id();
        fiber.inner().observe(Box::new(move |raw| {
            let exit = Exit::from_raw(raw);
            if catch_unwind(AssertUnwindSafe(|| callback(exit))).is_err() {
                tracing::error!(fiber = %id, "exit callback panicked");
            }
        }));
        CancelHandle {
            fiber: fiber.inner().clone(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        let current = thread::current().id();
        for handle in self.threads.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!("runtime stopped");
    }
}

fn spawn_thread<F>(name: String, body: F) -> Result<JoinHandle<()>, RuntimeError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source: io::Error| RuntimeError::Spawn { name, source })
}

static DEFAULT: OnceCell<Runtime> = OnceCell::new();

/// The process-wide runtime, configured from `SPINDLE_*` environment variables on
/// first use.
pub fn default_runtime() -> Result<&'static Runtime, RuntimeError> {
    DEFAULT.get_or_try_init(|| Runtime::new(RuntimeConfig::from_env()?))
}

/// Run `effect` on the process-wide runtime.
pub fn run<R, E, A>(effect: Effect<R, E, A>, env: R) -> Result<Exit<E, A>, RuntimeError>
where
    R: Capabilities,
    E: Data,
    A: Data,
{
    Ok(default_runtime()?.run(effect, env))
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Runtime::new(RuntimeConfig::default().with_workers(0)).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(ConfigError::NoWorkers)));
    }

    #[test]
    fn test_threads_carry_the_configured_name() {
        let runtime = Runtime::new(RuntimeConfig::default().with_workers(1).with_thread_name("probe")).unwrap();
        let name = runtime.run(
            Effect::<(), Infallible, _>::sync(|| thread::current().name().map(str::to_string)),
            (),
        );
        assert_eq!(name, Exit::Done(Some("probe-worker-0".to_string())));
    }

    #[test]
    fn test_run_callback_delivers_the_exit() {
        let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        runtime.run_callback(Effect::<(), String, i32>::succeed(3), (), move |exit| {
            tx.send(exit).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Exit::Done(3));
    }

    #[test]
    fn test_cancel_handle_interrupts() {
        let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        let handle = runtime.run_callback(Effect::<(), String, i32>::never(), (), move |exit| {
            tx.send(exit).unwrap();
        });
        handle.cancel();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Exit::Interrupt);
    }

    #[test]
    fn test_small_step_budget_interleaves_fibers() {
        let runtime = Runtime::new(RuntimeConfig::default().with_workers(1).with_yield_after(8)).unwrap();
        let spin = |n: u64| Effect::<(), Infallible, u64>::succeed(n).repeat_n(1_000);
        let both = spin(1).zip_par(spin(2));
        assert_eq!(runtime.run(both, ()), Exit::Done((1, 2)));
    }

    #[test]
    fn test_global_run() {
        let exit = run(Effect::<(), Infallible, u8>::succeed(1), ()).unwrap();
        assert_eq!(exit, Exit::Done(1));
    }
}
