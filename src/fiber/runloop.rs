//! The interpreter.
//!
//! A fiber's program is evaluated by [`run`] with an explicit continuation stack, so
//! deeply nested `and_then` chains and long loops never grow the native stack. `run`
//! returns whenever the fiber yields, suspends on an async registration, or exits.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::effect::node::{
    protect, unit, value, Cont, Env, Erased, Handler, Node, RawCause, RawExit, Register,
    Release, Value,
};
use crate::exit::{ExitTag, Fault};

use super::state::FiberInner;

pub(crate) enum Next {
    Eval(Erased),
    Succeed(Value),
    Fail(RawCause),
    Pending,
}

impl Next {
    pub(crate) fn from_exit(exit: RawExit) -> Self {
        match exit {
            Ok(v) => Next::Succeed(v),
            Err(cause) => Next::Fail(cause),
        }
    }
}

enum Frame {
    Apply(Cont),
    Fold {
        on_failure: Handler,
        on_success: Cont,
        interruptible: bool,
    },
    Region(bool),
    PopEnv,
    /// Waiting for a bracket's acquire step.
    Acquired {
        release: Release,
        body: Cont,
        restore: bool,
    },
    /// Guards a bracket's body.
    Finalizer {
        resource: Value,
        release: Release,
    },
    /// Waiting for a release action; resumes the body's outcome afterwards.
    Finalizing {
        outcome: RawExit,
        restore: bool,
    },
}

/// Everything needed to continue a fiber later.
pub(crate) struct RunState {
    pub(crate) next: Next,
    pub(crate) interruptible: bool,
    stack: Vec<Frame>,
    envs: Vec<Env>,
    suppressed: Vec<RawCause>,
}

impl RunState {
    pub(crate) fn new(program: Erased, env: Option<Env>) -> Self {
        RunState {
            next: Next::Eval(program),
            interruptible: true,
            stack: Vec::new(),
            envs: env.into_iter().collect(),
            suppressed: Vec::new(),
        }
    }
}

pub(crate) enum Slice {
    Yield(Box<RunState>),
    Suspend(Box<RunState>, Register),
    Exit(RawExit, Vec<RawCause>),
}

enum Step {
    Continue(Next),
    Suspend(Register),
    Yield,
}

/// Evaluate until the fiber yields, suspends or exits, spending one unit of `fuel`
/// per node.
pub(crate) fn run(fiber: &Arc<FiberInner>, mut st: Box<RunState>, fuel: &mut u32) -> Slice {
    loop {
        match mem::replace(&mut st.next, Next::Pending) {
            Next::Eval(node) => {
                if st.interruptible && fiber.interrupt_requested() {
                    st.next = Next::Fail(RawCause::Interrupt);
                    continue;
                }
                if *fuel == 0 {
                    st.next = Next::Eval(node);
                    return Slice::Yield(st);
                }
                *fuel -= 1;
                match eval(fiber, &mut st, &node) {
                    Step::Continue(next) => st.next = next,
                    Step::Suspend(register) => return Slice::Suspend(st, register),
                    Step::Yield => {
                        st.next = Next::Succeed(unit());
                        return Slice::Yield(st);
                    }
                }
            }
            Next::Succeed(v) => match st.stack.pop() {
                Some(frame) => st.next = on_success(&mut st, frame, v),
                None => {
                    let suppressed = mem::take(&mut st.suppressed);
                    return Slice::Exit(Ok(v), suppressed);
                }
            },
            Next::Fail(cause) => match st.stack.pop() {
                Some(frame) => st.next = on_failure(fiber, &mut st, frame, cause),
                None => {
                    let suppressed = mem::take(&mut st.suppressed);
                    return Slice::Exit(Err(cause), suppressed);
                }
            },
            Next::Pending => {
                st.next = Next::Fail(RawCause::Abort(Fault::new(
                    "fiber resumed without a result",
                )));
            }
        }
    }
}

fn eval(fiber: &Arc<FiberInner>, st: &mut RunState, node: &Node) -> Step {
    let next = match node {
        Node::Succeed(v) => Next::Succeed(v.clone()),
        Node::Sync(f) => match catch_unwind(AssertUnwindSafe(|| f())) {
            Ok(v) => Next::Succeed(v),
            Err(payload) => Next::Fail(RawCause::Abort(Fault::from_panic(payload))),
        },
        Node::Try(f) => match catch_unwind(AssertUnwindSafe(|| f())) {
            Ok(exit) => Next::from_exit(exit),
            Err(payload) => Next::Fail(RawCause::Abort(Fault::from_panic(payload))),
        },
        Node::Fail(cause) => Next::Fail(cause.clone()),
        Node::Suspend(f) => Next::Eval(protect(|| f())),
        Node::Async(register) => return Step::Suspend(register.clone()),
        Node::Access(f) => match st.envs.last() {
            Some(env) => Next::Eval(protect(|| f(env))),
            None => Next::Fail(RawCause::Abort(Fault::new("no environment has been provided"))),
        },
        Node::Provide(env, inner) => {
            st.envs.push(env.clone());
            st.stack.push(Frame::PopEnv);
            Next::Eval(inner.clone())
        }
        Node::FlatMap(inner, k) => {
            st.stack.push(Frame::Apply(k.clone()));
            Next::Eval(inner.clone())
        }
        Node::Fold(inner, on_failure, on_success) => {
            st.stack.push(Frame::Fold {
                on_failure: on_failure.clone(),
                on_success: on_success.clone(),
                interruptible: st.interruptible,
            });
            Next::Eval(inner.clone())
        }
        Node::Region(interruptible, inner) => {
            st.stack.push(Frame::Region(st.interruptible));
            st.interruptible = *interruptible;
            Next::Eval(inner.clone())
        }
        Node::Bracket {
            acquire,
            release,
            body,
        } => {
            st.stack.push(Frame::Acquired {
                release: release.clone(),
                body: body.clone(),
                restore: st.interruptible,
            });
            st.interruptible = false;
            Next::Eval(acquire.clone())
        }
        Node::Fork(program) => {
            let child = FiberInner::spawn(fiber.scheduler(), program.clone(), st.envs.last().cloned());
            tracing::trace!(parent = %fiber.id(), child = %child.id(), "fiber forked");
            Next::Succeed(value(child))
        }
        Node::Sleep(duration) => return Step::Suspend(fiber.scheduler().sleep(*duration)),
        Node::Yield => return Step::Yield,
        Node::Report(cause) => {
            tracing::warn!(fiber = %fiber.id(), ?cause, "finalizer failed");
            st.suppressed.push(cause.clone());
            Next::Succeed(unit())
        }
    };
    Step::Continue(next)
}

fn on_success(st: &mut RunState, frame: Frame, v: Value) -> Next {
    match frame {
        Frame::Apply(k) => Next::Eval(protect(|| k(v))),
        Frame::Fold { on_success, .. } => Next::Eval(protect(|| on_success(v))),
        Frame::Region(restore) => {
            st.interruptible = restore;
            Next::Succeed(v)
        }
        Frame::PopEnv => {
            st.envs.pop();
            Next::Succeed(v)
        }
        Frame::Acquired {
            release,
            body,
            restore,
        } => {
            st.stack.push(Frame::Finalizer {
                resource: v.clone(),
                release,
            });
            st.interruptible = restore;
            Next::Eval(protect(|| body(v)))
        }
        Frame::Finalizer { resource, release } => begin_release(st, resource, release, Ok(v)),
        Frame::Finalizing { outcome, restore } => {
            st.interruptible = restore;
            Next::from_exit(outcome)
        }
    }
}

fn on_failure(fiber: &FiberInner, st: &mut RunState, frame: Frame, cause: RawCause) -> Next {
    match frame {
        Frame::Apply(_) => Next::Fail(cause),
        Frame::Fold {
            on_failure,
            interruptible,
            ..
        } => {
            // An interruptible handler can't catch its own fiber's interruption.
            if interruptible && matches!(cause, RawCause::Interrupt) && fiber.interrupt_requested() {
                Next::Fail(cause)
            } else {
                Next::Eval(protect(|| on_failure(cause)))
            }
        }
        Frame::Region(restore) | Frame::Acquired { restore, .. } => {
            st.interruptible = restore;
            Next::Fail(cause)
        }
        Frame::PopEnv => {
            st.envs.pop();
            Next::Fail(cause)
        }
        Frame::Finalizer { resource, release } => begin_release(st, resource, release, Err(cause)),
        Frame::Finalizing { outcome, restore } => {
            st.interruptible = restore;
            match outcome {
                Ok(_) => Next::Fail(cause),
                Err(primary) => {
                    tracing::warn!(
                        fiber = %fiber.id(),
                        ?primary,
                        failure = ?cause,
                        "release failed while unwinding"
                    );
                    st.suppressed.push(cause);
                    Next::Fail(primary)
                }
            }
        }
    }
}

fn begin_release(st: &mut RunState, resource: Value, release: Release, outcome: RawExit) -> Next {
    let tag = match &outcome {
        Ok(_) => ExitTag::Done,
        Err(cause) => cause.tag(),
    };
    let restore = st.interruptible;
    st.stack.push(Frame::Finalizing { outcome, restore });
    st.interruptible = false;
    Next::Eval(protect(|| release(resource, tag)))
}
