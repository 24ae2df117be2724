use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::effect::node::{Env, Erased, RawCause, RawExit, Register};
use crate::effect::Canceler;
use crate::exit::Fault;
use crate::runtime::scheduler::Scheduler;

use super::runloop::{self, Next, RunState, Slice};
use super::{FiberId, Resume};

pub(crate) type Observer = Box<dyn FnOnce(RawExit) + Send>;

/// The shared, untyped half of a fiber.
pub(crate) struct FiberInner {
    id: FiberId,
    scheduler: Arc<Scheduler>,
    interrupt: AtomicBool,
    state: Mutex<FiberState>,
    completion: Mutex<Completion>,
}

struct FiberState {
    status: Status,
    ctx: Option<Box<RunState>>,
    suspensions: u64,
    interrupted_suspension: Option<u64>,
}

enum Status {
    Queued,
    Running,
    Suspended {
        id: u64,
        interruptible: bool,
        /// The registration callback has not returned yet.
        registering: bool,
        canceler: Option<Canceler>,
    },
    /// Completed while still registering; the registering worker continues it.
    Resumed,
    Done,
}

#[derive(Default)]
struct Completion {
    exit: Option<RawExit>,
    suppressed: Vec<RawCause>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
}

impl FiberInner {
    pub(crate) fn spawn(scheduler: &Arc<Scheduler>, program: Erased, env: Option<Env>) -> Arc<Self> {
        let fiber = Arc::new(FiberInner {
            id: FiberId::next(),
            scheduler: scheduler.clone(),
            interrupt: AtomicBool::new(false),
            state: Mutex::new(FiberState {
                status: Status::Queued,
                ctx: Some(Box::new(RunState::new(program, env))),
                suspensions: 0,
                interrupted_suspension: None,
            }),
            completion: Mutex::new(Completion::default()),
        });
        scheduler.submit(fiber.clone());
        fiber
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub(crate) fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Run the fiber on the current worker until it yields, suspends or exits.
    pub(crate) fn execute(self: &Arc<Self>) {
        let Some(mut st) = self.begin() else {
            return;
        };
        let span = tracing::trace_span!("fiber", id = %self.id);
        let _entered = span.enter();
        let mut fuel = self.scheduler.yield_after();
        loop {
            match runloop::run(self, st, &mut fuel) {
                Slice::Yield(paused) => {
                    self.requeue(paused);
                    return;
                }
                Slice::Suspend(paused, register) => match self.suspend(paused, register) {
                    Some(resumed) => st = resumed,
                    None => return,
                },
                Slice::Exit(exit, suppressed) => {
                    self.complete(exit, suppressed);
                    return;
                }
            }
        }
    }

    fn begin(&self) -> Option<Box<RunState>> {
        let mut state = self.state.lock();
        match state.status {
            Status::Queued => {
                state.status = Status::Running;
                state.ctx.take()
            }
            _ => None,
        }
    }

    fn requeue(self: &Arc<Self>, st: Box<RunState>) {
        {
            let mut state = self.state.lock();
            state.ctx = Some(st);
            state.status = Status::Queued;
        }
        self.scheduler.submit(self.clone());
    }

    /// Park the fiber on `register`. Returns the run state if the fiber should keep
    /// running on this worker because it was completed during registration.
    fn suspend(self: &Arc<Self>, mut st: Box<RunState>, register: Register) -> Option<Box<RunState>> {
        let interruptible = st.interruptible;
        let id = {
            let mut state = self.state.lock();
            state.suspensions += 1;
            if interruptible && self.interrupt_requested() {
                st.next = Next::Fail(RawCause::Interrupt);
                return Some(st);
            }
            state.ctx = Some(st);
            state.status = Status::Suspended {
                id: state.suspensions,
                interruptible,
                registering: true,
                canceler: None,
            };
            state.suspensions
        };

        let canceler = match catch_unwind(AssertUnwindSafe(|| register(Resume::new(self.clone(), id)))) {
            Ok(canceler) => Some(canceler),
            Err(payload) => {
                let fault = Fault::from_panic(payload);
                tracing::warn!(fiber = %self.id, %fault, "async registration panicked");
                self.resume(id, Err(RawCause::Abort(fault)));
                None
            }
        };

        let mut state = self.state.lock();
        let parked = matches!(state.status, Status::Suspended { id: current, .. } if current == id);
        if parked {
            if let Status::Suspended {
                registering,
                canceler: slot,
                ..
            } = &mut state.status
            {
                *registering = false;
                *slot = canceler;
            }
            return None;
        }
        if !matches!(state.status, Status::Resumed) {
            return None;
        }
        state.status = Status::Running;
        let interrupted = state.interrupted_suspension == Some(id);
        let ctx = state.ctx.take();
        drop(state);
        if interrupted {
            if let Some(cancel) = canceler {
                cancel();
            }
        }
        ctx
    }

    /// Complete suspension `id` with `result`. Returns `false` if the fiber is no
    /// longer waiting on that suspension.
    pub(crate) fn resume(self: &Arc<Self>, id: u64, result: RawExit) -> bool {
        let mut state = self.state.lock();
        let registering = match state.status {
            Status::Suspended {
                id: current,
                registering,
                ..
            } if current == id => registering,
            _ => return false,
        };
        if let Some(ctx) = state.ctx.as_mut() {
            ctx.next = Next::from_exit(result);
        }
        if registering {
            state.status = Status::Resumed;
            return true;
        }
        state.status = Status::Queued;
        drop(state);
        self.scheduler.submit(self.clone());
        true
    }

    /// Ask the fiber to stop. Takes effect at the next interruptible point.
    pub(crate) fn request_interrupt(self: &Arc<Self>) {
        self.interrupt.store(true, Ordering::Release);
        let mut state = self.state.lock();
        let (id, registering) = match state.status {
            Status::Suspended {
                id,
                interruptible: true,
                registering,
                ..
            } => (id, registering),
            _ => return,
        };
        let canceler = match mem::replace(&mut state.status, Status::Resumed) {
            Status::Suspended { canceler, .. } => canceler,
            _ => None,
        };
        state.interrupted_suspension = Some(id);
        if let Some(ctx) = state.ctx.as_mut() {
            ctx.next = Next::Fail(RawCause::Interrupt);
        }
        if !registering {
            state.status = Status::Queued;
        }
        drop(state);
        tracing::trace!(fiber = %self.id, "interrupted while suspended");
        if let Some(cancel) = canceler {
            cancel();
        }
        if !registering {
            self.scheduler.submit(self.clone());
        }
    }

    fn complete(&self, exit: RawExit, suppressed: Vec<RawCause>) {
        {
            let mut state = self.state.lock();
            state.status = Status::Done;
            state.ctx = None;
        }
        match &exit {
            Ok(_) => tracing::trace!(fiber = %self.id, "fiber done"),
            Err(RawCause::Abort(fault)) => tracing::warn!(fiber = %self.id, %fault, "fiber aborted"),
            Err(cause) => tracing::trace!(fiber = %self.id, ?cause, "fiber failed"),
        }
        let observers = {
            let mut completion = self.completion.lock();
            completion.exit = Some(exit.clone());
            completion.suppressed = suppressed;
            mem::take(&mut completion.observers)
        };
        for (_, observer) in observers {
            observer(exit.clone());
        }
    }

    /// Call `observer` with the exit once the fiber is done. Returns a token for
    /// [`unobserve`](Self::unobserve), or `None` if the observer already ran.
    pub(crate) fn observe(&self, observer: Observer) -> Option<u64> {
        let mut completion = self.completion.lock();
        match completion.exit.clone() {
            Some(exit) => {
                drop(completion);
                observer(exit);
                None
            }
            None => {
                completion.next_observer += 1;
                let token = completion.next_observer;
                completion.observers.push((token, observer));
                Some(token)
            }
        }
    }

    pub(crate) fn unobserve(&self, token: u64) {
        let removed = {
            let mut completion = self.completion.lock();
            let index = completion.observers.iter().position(|(t, _)| *t == token);
            index.map(|index| completion.observers.swap_remove(index))
        };
        drop(removed);
    }

    pub(crate) fn poll_exit(&self) -> Option<RawExit> {
        self.completion.lock().exit.clone()
    }

    pub(crate) fn suppressed(&self) -> Vec<RawCause> {
        self.completion.lock().suppressed.clone()
    }

    /// Block the calling thread until the fiber is done.
    pub(crate) fn block(&self) -> RawExit {
        let slot = Arc::new((Mutex::new(None::<RawExit>), Condvar::new()));
        let signal = slot.clone();
        self.observe(Box::new(move |exit| {
            *signal.0.lock() = Some(exit);
            signal.1.notify_all();
        }));
        let (lock, ready) = &*slot;
        let mut guard = lock.lock();
        loop {
            if let Some(exit) = guard.take() {
                return exit;
            }
            ready.wait(&mut guard);
        }
    }
}
