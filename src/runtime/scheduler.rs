//! Ready queue shared by the worker threads.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::effect::node::{unit, Register};
use crate::fiber::{FiberInner, Resume};

use super::timer::Timer;

pub(crate) struct Scheduler {
    ready: Mutex<ReadyQueue>,
    available: Condvar,
    timer: Arc<Timer>,
    yield_after: u32,
}

#[derive(Default)]
struct ReadyQueue {
    fibers: VecDeque<Arc<FiberInner>>,
    shutdown: bool,
}

impl Scheduler {
    pub(crate) fn new(yield_after: u32) -> Arc<Self> {
        Arc::new(Scheduler {
            ready: Mutex::new(ReadyQueue::default()),
            available: Condvar::new(),
            timer: Timer::new(),
            yield_after,
        })
    }

    pub(crate) fn yield_after(&self) -> u32 {
        self.yield_after
    }

    pub(crate) fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    /// Make `fiber` runnable. Dropped silently once the runtime is shutting down.
    pub(crate) fn submit(&self, fiber: Arc<FiberInner>) {
        let mut ready = self.ready.lock();
        if ready.shutdown {
            return;
        }
        ready.fibers.push_back(fiber);
        drop(ready);
        self.available.notify_one();
    }

    /// A registration that resumes the fiber after `duration`.
    pub(crate) fn sleep(&self, duration: Duration) -> Register {
        let timer = self.timer.clone();
        Arc::new(move |resume: Resume| {
            let key = timer.schedule(
                duration,
                Box::new(move || {
                    resume.resume(Ok(unit()));
                }),
            );
            let timer = timer.clone();
            Box::new(move || timer.cancel(key))
        })
    }

    fn next(&self) -> Option<Arc<FiberInner>> {
        let mut ready = self.ready.lock();
        loop {
            if ready.shutdown {
                return None;
            }
            if let Some(fiber) = ready.fibers.pop_front() {
                return Some(fiber);
            }
            self.available.wait(&mut ready);
        }
    }

    /// Worker thread body.
    pub(crate) fn work(&self) {
        tracing::trace!("worker started");
        while let Some(fiber) = self.next() {
            fiber.execute();
        }
        tracing::trace!("worker stopped");
    }

    pub(crate) fn shutdown(&self) {
        let abandoned = {
            let mut ready = self.ready.lock();
            ready.shutdown = true;
            mem::take(&mut ready.fibers)
        };
        self.available.notify_all();
        self.timer.shutdown();
        if !abandoned.is_empty() {
            tracing::debug!(fibers = abandoned.len(), "dropping queued fibers at shutdown");
        }
    }
}
