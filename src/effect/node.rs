//! Type-erased effect nodes.
//!
//! The typed [`Effect`](super::Effect) API is a thin layer over this tree. Values,
//! errors and environments travel through the interpreter as
//! `Arc<dyn Any + Send + Sync>` and are cast back at the typed boundary, so the
//! interpreter itself is a single non-generic loop.

use std::any::{type_name, Any};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::exit::{Cause, Exit, ExitTag, Fault};
use crate::fiber::Resume;

use super::Data;

pub(crate) type Value = Arc<dyn Any + Send + Sync>;
pub(crate) type Env = Arc<dyn Any + Send + Sync>;
pub(crate) type Erased = Arc<Node>;
pub(crate) type RawExit = Result<Value, RawCause>;

pub(crate) type Cont = Arc<dyn Fn(Value) -> Erased + Send + Sync>;
pub(crate) type Handler = Arc<dyn Fn(RawCause) -> Erased + Send + Sync>;
pub(crate) type Release = Arc<dyn Fn(Value, ExitTag) -> Erased + Send + Sync>;
pub(crate) type Register = Arc<dyn Fn(Resume) -> Canceler + Send + Sync>;

/// Cancellation thunk returned by an async registration; run when the waiting fiber
/// is interrupted.
pub type Canceler = Box<dyn FnOnce() + Send>;

/// A canceler that does nothing.
pub fn no_cancel() -> Canceler {
    Box::new(|| {})
}

#[derive(Clone)]
pub(crate) enum RawCause {
    Raise(Value),
    Abort(Fault),
    Interrupt,
}

pub(crate) enum Node {
    Succeed(Value),
    Sync(Arc<dyn Fn() -> Value + Send + Sync>),
    Try(Arc<dyn Fn() -> RawExit + Send + Sync>),
    Fail(RawCause),
    Suspend(Arc<dyn Fn() -> Erased + Send + Sync>),
    Async(Register),
    Access(Arc<dyn Fn(&Env) -> Erased + Send + Sync>),
    Provide(Env, Erased),
    FlatMap(Erased, Cont),
    Fold(Erased, Handler, Cont),
    Region(bool, Erased),
    Bracket {
        acquire: Erased,
        release: Release,
        body: Cont,
    },
    Fork(Erased),
    Sleep(Duration),
    Yield,
    /// Record a failure on the fiber's suppressed list and continue with unit.
    Report(RawCause),
}

pub(crate) fn value<A: Send + Sync + 'static>(a: A) -> Value {
    Arc::new(a)
}

pub(crate) fn unit() -> Value {
    Arc::new(())
}

pub(crate) fn cast<A: Data>(v: Value) -> Result<A, Fault> {
    match v.downcast::<A>() {
        Ok(shared) => Ok(Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone())),
        Err(_) => Err(Fault::new(format!(
            "value is not a {}",
            type_name::<A>()
        ))),
    }
}

pub(crate) fn succeed_node(v: Value) -> Erased {
    Arc::new(Node::Succeed(v))
}

pub(crate) fn fail_node(cause: RawCause) -> Erased {
    Arc::new(Node::Fail(cause))
}

pub(crate) fn abort_node(fault: Fault) -> Erased {
    fail_node(RawCause::Abort(fault))
}

/// Run user code that builds the next node; a panic turns into an `Abort`.
pub(crate) fn protect(f: impl FnOnce() -> Erased) -> Erased {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(node) => node,
        Err(payload) => abort_node(Fault::from_panic(payload)),
    }
}

impl RawCause {
    pub(crate) fn from_cause<E: Data>(cause: Cause<E>) -> Self {
        match cause {
            Cause::Raise(e) => RawCause::Raise(value(e)),
            Cause::Abort(f) => RawCause::Abort(f),
            Cause::Interrupt => RawCause::Interrupt,
        }
    }

    pub(crate) fn typed<E: Data>(self) -> Cause<E> {
        match self {
            RawCause::Raise(v) => match cast::<E>(v) {
                Ok(e) => Cause::Raise(e),
                Err(fault) => Cause::Abort(fault),
            },
            RawCause::Abort(f) => Cause::Abort(f),
            RawCause::Interrupt => Cause::Interrupt,
        }
    }

    pub(crate) fn tag(&self) -> ExitTag {
        match self {
            RawCause::Raise(_) => ExitTag::Raise,
            RawCause::Abort(_) => ExitTag::Abort,
            RawCause::Interrupt => ExitTag::Interrupt,
        }
    }
}

impl std::fmt::Debug for RawCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawCause::Raise(_) => f.write_str("Raise(..)"),
            RawCause::Abort(fault) => write!(f, "Abort({fault})"),
            RawCause::Interrupt => f.write_str("Interrupt"),
        }
    }
}

impl<E: Data, A: Data> Exit<E, A> {
    pub(crate) fn from_raw(raw: RawExit) -> Self {
        match raw {
            Ok(v) => match cast::<A>(v) {
                Ok(a) => Exit::Done(a),
                Err(fault) => Exit::Abort(fault),
            },
            Err(cause) => cause.typed::<E>().into(),
        }
    }

    pub(crate) fn into_raw(self) -> RawExit {
        match self {
            Exit::Done(a) => Ok(value(a)),
            Exit::Raise(e) => Err(RawCause::Raise(value(e))),
            Exit::Abort(f) => Err(RawCause::Abort(f)),
            Exit::Interrupt => Err(RawCause::Interrupt),
        }
    }
}
