//! A single timer thread per runtime.
//!
//! Tasks are ordered by `(Instant, key)`; a second index maps each key to its
//! deadline so that cancelling removes the task outright.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub(crate) type Task = Box<dyn FnOnce() + Send>;

pub(crate) struct Timer {
    state: Mutex<TimerState>,
    wake: Condvar,
}

#[derive(Default)]
struct TimerState {
    tasks: BTreeMap<(Instant, u64), Task>,
    deadlines: HashMap<u64, Instant>,
    next_key: u64,
    shutdown: bool,
}

impl Timer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Timer {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
        })
    }

    /// Run `task` on the timer thread after `delay`. Returns a key for [`cancel`](Self::cancel).
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> u64 {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        if state.shutdown {
            return key;
        }
        // A deadline past the end of time never fires.
        if let Some(deadline) = Instant::now().checked_add(delay) {
            state.tasks.insert((deadline, key), task);
            state.deadlines.insert(key, deadline);
        }
        drop(state);
        self.wake.notify_one();
        key
    }

    pub(crate) fn cancel(&self, key: u64) {
        let mut state = self.state.lock();
        let task = match state.deadlines.remove(&key) {
            Some(deadline) => state.tasks.remove(&(deadline, key)),
            None => None,
        };
        drop(state);
        drop(task);
    }

    /// Timer thread body.
    pub(crate) fn run(&self) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                let tasks = mem::take(&mut state.tasks);
                state.deadlines.clear();
                drop(state);
                drop(tasks);
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            loop {
                let Some((deadline, key)) = state.tasks.keys().next().copied() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                state.deadlines.remove(&key);
                if let Some(task) = state.tasks.remove(&(deadline, key)) {
                    due.push(task);
                }
            }
            if !due.is_empty() {
                drop(state);
                for task in due {
                    task();
                }
                state = self.state.lock();
                continue;
            }
            match state.tasks.keys().next().copied() {
                Some((deadline, _)) => {
                    self.wake.wait_until(&mut state, deadline);
                }
                None => self.wake.wait(&mut state),
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wake.notify_all();
    }
}
