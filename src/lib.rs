//! # Spindle: Typed Effects on Cooperative Fibers
//!
//! Describe programs as values, then run them on a small pool of threads with
//! interruption, guaranteed cleanup, and back-pressured streaming.
//!
//! ## Core Types
//!
//! - **[`Effect<R, E, A>`]**: A description of a computation that needs an environment
//!   `R`, may fail with `E`, and produces `A`
//! - **[`Exit<E, A>`]**: How a run ended: `Done`, `Raise`, `Abort` or `Interrupt`
//! - **[`Fiber<E, A>`]**: A running effect that can be joined or interrupted
//! - **[`Managed<R, E, A>`]**: A resource with a release action that always runs
//! - **[`Stream<R, E, A>`]** and **[`Sink`]**: Pull-based sequences and their consumers
//!
//! ## Key Features
//!
//! - **Stack-safe**: Loops of millions of steps run on a heap-allocated continuation stack
//! - **Interruptible**: Interruption is checked between steps and wakes suspended fibers
//! - **Resource-safe**: Release actions run on success, failure, and interruption
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use spindle::prelude::*;
//!
//! // Two workers share three permits; the slow one loses the race.
//! let program = Semaphore::make::<(), String>(3).and_then(|permits| {
//!     let fast = permits.with_permit(Effect::succeed("fast").delay(Duration::from_millis(1)));
//!     let slow = permits.with_permit(Effect::succeed("slow").delay(Duration::from_secs(5)));
//!     fast.race_first(slow)
//! });
//!
//! let runtime = Runtime::new(RuntimeConfig::default().with_workers(2)).unwrap();
//! assert_eq!(runtime.run(program, ()), Exit::Done("fast"));
//! ```
//!
//! ## Common Functions
//!
//! **Building Effects:**
//! - [`Effect::succeed`], [`Effect::sync`], [`Effect::try_sync`] - Lift values and thunks
//! - [`Effect::async_register`] - Wrap a callback-based API
//! - [`Effect::bracket`] - Acquire, use, release
//!
//! **Concurrency:**
//! - [`Effect::fork`], [`Fiber::join`], [`Fiber::interrupt`] - Manage fibers
//! - [`Effect::race`], [`Effect::zip_par`], [`Effect::collect_all_par`] - Combine in parallel
//! - [`Ref`], [`Semaphore`], [`Queue`], [`Deferred`] - Coordinate fibers
//!
//! **Execution:**
//! - [`Runtime::run`] - Run to completion and return the [`Exit`]
//! - [`run`] - Run on the process-wide default runtime

mod config;
mod effect;
mod error;
mod exit;
mod fiber;
mod managed;
mod runtime;
mod stream;
mod sync;

#[cfg(test)]
mod test_logging;

pub mod prelude;

pub use config::RuntimeConfig;
pub use effect::{no_cancel, Callback, Canceler, Capabilities, Data, Effect};
pub use error::{ConfigError, RuntimeError};
pub use exit::{Cause, Exit, ExitTag, Fault};
pub use fiber::{Fiber, FiberId};
pub use managed::{Allocated, Managed, Scope};
pub use runtime::{default_runtime, run, CancelHandle, Report, Runtime, Suppressed};
pub use stream::{Pull, Sink, SinkStep, Stream};
pub use sync::{Deferred, Queue, Ref, Semaphore, Strategy};

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::prelude::*;
    use crate::test_logging::init_test_logging;

    /// A capability the program asks its environment for.
    trait HasClock {
        fn now(&self) -> u64;
    }

    trait HasLog {
        fn log(&self) -> &Arc<Mutex<Vec<String>>>;
    }

    struct App {
        clock: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl HasClock for App {
        fn now(&self) -> u64 {
            self.clock
        }
    }

    impl HasLog for App {
        fn log(&self) -> &Arc<Mutex<Vec<String>>> {
            &self.log
        }
    }

    fn stamp<R: HasClock + HasLog + Capabilities>(message: &'static str) -> Effect<R, Infallible, ()> {
        Effect::access(move |env: &R| env.log().lock().push(format!("{} {message}", env.now())))
    }

    #[test]
    fn test_capabilities_are_trait_bounds_on_the_environment() {
        init_test_logging();
        let log = Arc::new(Mutex::new(Vec::new()));
        let app = App {
            clock: 7,
            log: log.clone(),
        };
        let program = stamp::<App>("start").then(stamp("stop"));

        let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
        assert_eq!(runtime.run(program, app), Exit::Done(()));
        assert_eq!(*log.lock(), vec!["7 start", "7 stop"]);
    }

    #[test]
    fn test_producer_consumer_pipeline() {
        init_test_logging();
        let program = Queue::<u32>::bounded::<(), String>(4).and_then(|queue| {
            let producer = Stream::<(), String, i64>::range(1, 101)
                .map_effect({
                    let queue = queue.clone();
                    move |n| queue.offer(n as u32)
                })
                .drain();
            let consumer = Stream::from_queue(queue).take(100).fold(0u32, |sum, n| sum + n);
            producer.zip_par(consumer).map(|((), sum)| sum)
        });

        let runtime = Runtime::new(RuntimeConfig::default().with_workers(3)).unwrap();
        assert_eq!(runtime.run(program, ()), Exit::Done(5050));
    }

    #[test]
    fn test_timeout_interrupts_and_releases() {
        init_test_logging();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (open, close) = (log.clone(), log.clone());
        let resource = Managed::bracket_exit(
            Effect::<(), String, _>::sync(move || open.lock().push("open".to_string())),
            move |(), tag| {
                let close = close.clone();
                Effect::sync(move || close.lock().push(format!("close {tag}")))
            },
        );
        let program = resource
            .use_(|()| Effect::<(), String, ()>::never())
            .timeout(Duration::from_millis(10));

        let runtime = Runtime::new(RuntimeConfig::default().with_workers(2)).unwrap();
        assert_eq!(runtime.run(program, ()), Exit::Done(None));
        assert_eq!(*log.lock(), vec!["open", "close interrupt"]);
    }
}
