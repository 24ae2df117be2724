//! Racing and parallel composition.

use std::sync::Arc;
use std::time::Duration;

use either::Either;
use parking_lot::Mutex;

use crate::exit::{Exit, ExitTag};
use crate::fiber::Fiber;

use super::node::RawExit;
use super::{Capabilities, Data, Effect};

impl<R: Capabilities, E: Data, A: Data> Effect<R, E, A> {
    /// Run `self` and `that` on two fibers and hand the first exit, together with the
    /// other fiber, to the matching continuation.
    ///
    /// If the caller is interrupted while waiting, both fibers are interrupted before
    /// the interruption propagates.
    pub fn race_with<B: Data, E2: Data, C: Data, L, Rt>(
        self,
        that: Effect<R, E, B>,
        on_left: L,
        on_right: Rt,
    ) -> Effect<R, E2, C>
    where
        L: Fn(Exit<E, A>, Fiber<E, B>) -> Effect<R, E2, C> + Send + Sync + 'static,
        Rt: Fn(Exit<E, B>, Fiber<E, A>) -> Effect<R, E2, C> + Send + Sync + 'static,
    {
        let on_left = Arc::new(on_left);
        let on_right = Arc::new(on_right);
        self.fork::<E2>().zip(that.fork::<E2>()).bracket_exit(
            |(left, right), tag| match tag {
                ExitTag::Interrupt => left
                    .interrupt::<R, E2>()
                    .zip(right.interrupt::<R, E2>())
                    .as_unit(),
                _ => Effect::unit(),
            },
            move |(left, right)| {
                let on_left = on_left.clone();
                let on_right = on_right.clone();
                first_exit(&left, &right).and_then(move |winner| match winner {
                    Either::Left(exit) => on_left(exit, right.clone()),
                    Either::Right(exit) => on_right(exit, left.clone()),
                })
            },
        )
    }

    /// The first of the two to finish, whatever its outcome. The loser is interrupted.
    pub fn race_first(self, that: Effect<R, E, A>) -> Self {
        self.race_with(
            that,
            |exit, loser| loser.interrupt::<R, E>().then(Effect::from_exit(exit)),
            |exit, loser| loser.interrupt::<R, E>().then(Effect::from_exit(exit)),
        )
    }

    /// The first of the two to succeed. If one fails, the result is the other's.
    pub fn race(self, that: Effect<R, E, A>) -> Self {
        self.race_with(that, settle, settle)
    }

    /// Run both concurrently and pair the results. The first failure interrupts the
    /// other side.
    pub fn zip_par<B: Data>(self, that: Effect<R, E, B>) -> Effect<R, E, (A, B)> {
        self.race_with(
            that,
            |exit, right| match exit.into_result() {
                Ok(a) => right.join().map(move |b| (a.clone(), b)),
                Err(cause) => right.interrupt::<R, E>().then(Effect::halt(cause)),
            },
            |exit, left| match exit.into_result() {
                Ok(b) => left.join().map(move |a| (a, b.clone())),
                Err(cause) => left.interrupt::<R, E>().then(Effect::halt(cause)),
            },
        )
    }

    /// `None` if `duration` elapses first, in which case `self` is interrupted.
    pub fn timeout(self, duration: Duration) -> Effect<R, E, Option<A>> {
        self.map(Some)
            .race_first(Effect::<R, E, ()>::sleep(duration).as_(None))
    }
}

fn settle<R: Capabilities, E: Data, A: Data>(exit: Exit<E, A>, loser: Fiber<E, A>) -> Effect<R, E, A> {
    match exit {
        Exit::Done(a) => loser.interrupt::<R, E>().as_(a),
        _ => loser.join(),
    }
}

/// Suspend until either fiber has finished.
fn first_exit<R: Capabilities, E: Data, E2: Data, A: Data, B: Data>(
    left: &Fiber<E, A>,
    right: &Fiber<E, B>,
) -> Effect<R, E2, Either<Exit<E, A>, Exit<E, B>>> {
    let (left, right) = (left.clone(), right.clone());
    Effect::async_register(move |callback| {
        let slot = Arc::new(Mutex::new(Some(callback)));

        let winner = slot.clone();
        let left_token = left.inner().observe(Box::new(move |raw: RawExit| {
            let callback = winner.lock().take();
            if let Some(callback) = callback {
                callback.succeed(Either::Left(Exit::from_raw(raw)));
            }
        }));

        let winner = slot.clone();
        let right_token = right.inner().observe(Box::new(move |raw: RawExit| {
            let callback = winner.lock().take();
            if let Some(callback) = callback {
                callback.succeed(Either::Right(Exit::from_raw(raw)));
            }
        }));

        let (left, right) = (left.clone(), right.clone());
        Box::new(move || {
            if let Some(token) = left_token {
                left.inner().unobserve(token);
            }
            if let Some(token) = right_token {
                right.inner().unobserve(token);
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::runtime::Runtime;
    use crate::RuntimeConfig;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default().with_workers(2)).unwrap()
    }

    type Io<A> = Effect<(), String, A>;

    #[test]
    fn test_race_prefers_the_faster_success() {
        let slow = Io::succeed("slow").delay(Duration::from_millis(200));
        let fast = Io::succeed("fast").delay(Duration::from_millis(5));
        assert_eq!(runtime().run(slow.race(fast), ()), Exit::Done("fast"));
    }

    #[test]
    fn test_race_falls_back_when_the_winner_fails() {
        let failing = Io::<&str>::raise("early".into());
        let late = Io::succeed("late").delay(Duration::from_millis(10));
        assert_eq!(runtime().run(failing.race(late), ()), Exit::Done("late"));
    }

    #[test]
    fn test_race_first_takes_a_failure_too() {
        let failing = Io::<&str>::raise("early".into());
        let late = Io::succeed("late").delay(Duration::from_millis(50));
        assert_eq!(
            runtime().run(failing.race_first(late), ()),
            Exit::Raise("early".to_string())
        );
    }

    #[test]
    fn test_race_interrupts_the_loser() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let loser = Io::<&str>::never().on_interrupt(Io::sync(move || flag.store(true, Ordering::SeqCst)));
        let winner = Io::succeed("won");

        assert_eq!(runtime().run(loser.race(winner), ()), Exit::Done("won"));
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timeout() {
        let runtime = runtime();
        let quick = Io::succeed(1).timeout(Duration::from_millis(500));
        assert_eq!(runtime.run(quick, ()), Exit::Done(Some(1)));

        let stuck = Io::<i32>::never().timeout(Duration::from_millis(10));
        assert_eq!(runtime.run(stuck, ()), Exit::Done(None));
    }

    #[test]
    fn test_zip_par_interrupts_the_sibling_on_failure() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let sibling = Io::<i32>::never().on_interrupt(Io::sync(move || flag.store(true, Ordering::SeqCst)));
        let failing = Io::<i32>::raise("boom".into()).delay(Duration::from_millis(5));

        assert_eq!(
            runtime().run(failing.zip_par(sibling), ()),
            Exit::Raise("boom".to_string())
        );
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zip_par_pairs_results() {
        let left = Effect::<(), Infallible, i32>::succeed(1).delay(Duration::from_millis(10));
        let right = Effect::<(), Infallible, &str>::succeed("b");
        assert_eq!(runtime().run(left.zip_par(right), ()), Exit::Done((1, "b")));
    }

    #[test]
    fn test_collect_all_par_keeps_order() {
        let effects = (0..8u64)
            .map(|n| Io::succeed(n).delay(Duration::from_millis(8 - n)))
            .collect();
        assert_eq!(
            runtime().run(Io::collect_all_par(effects), ()),
            Exit::Done((0..8).collect::<Vec<_>>())
        );
    }
}
