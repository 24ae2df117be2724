//! How a computation ended.
//!
//! [`Exit`] is the terminal outcome of every fiber: a success, a typed failure, an
//! untyped fault, or an interruption. [`Cause`] is the failure half of it, and is what
//! error handlers such as [`Effect::fold_exit`](crate::Effect::fold_exit) receive.
//!
//! # Examples
//!
//! ```rust
//! use spindle::{Exit, Fault};
//!
//! let done: Exit<String, i32> = Exit::Done(21);
//! assert_eq!(done.map(|n| n * 2), Exit::Done(42));
//!
//! let aborted: Exit<String, i32> = Exit::Abort(Fault::new("boom"));
//! let label = aborted.fold(|_| "done", |_| "raise", |_| "abort", || "interrupt");
//! assert_eq!(label, "abort");
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Terminal outcome of a computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Exit<E, A> {
    /// Completed with a value.
    Done(A),
    /// Failed with an expected, typed error.
    Raise(E),
    /// Failed with an unexpected fault, such as a panic inside a thunk.
    Abort(Fault),
    /// Cancelled by interruption.
    Interrupt,
}

/// The failure variants of an [`Exit`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cause<E> {
    Raise(E),
    Abort(Fault),
    Interrupt,
}

/// Payload-free discriminant of an [`Exit`], handed to release actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitTag {
    Done,
    Raise,
    Abort,
    Interrupt,
}

impl fmt::Display for ExitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitTag::Done => "done",
            ExitTag::Raise => "raise",
            ExitTag::Abort => "abort",
            ExitTag::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// An untyped failure.
///
/// Faults carry a message only. They are produced from panics caught at the thunk
/// boundary, from [`Effect::abort`](crate::Effect::abort), and from
/// [`Effect::or_abort`](crate::Effect::or_abort).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
#[error("{message}")]
pub struct Fault {
    message: Arc<str>,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Fault {
            message: Arc::from(message.into()),
        }
    }

    /// Build a fault from anything displayable, typically an error value.
    pub fn from_error(err: impl fmt::Display) -> Self {
        Fault::new(err.to_string())
    }

    /// Build a fault from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(message) = payload.downcast_ref::<&'static str>() {
            return Fault::new(format!("panicked: {message}"));
        }
        match payload.downcast::<String>() {
            Ok(message) => Fault::new(format!("panicked: {message}")),
            Err(_) => Fault::new("panicked with a non-string payload"),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl<E, A> Exit<E, A> {
    /// Dispatch on the variant.
    pub fn fold<T>(
        self,
        on_done: impl FnOnce(A) -> T,
        on_raise: impl FnOnce(E) -> T,
        on_abort: impl FnOnce(Fault) -> T,
        on_interrupt: impl FnOnce() -> T,
    ) -> T {
        match self {
            Exit::Done(a) => on_done(a),
            Exit::Raise(e) => on_raise(e),
            Exit::Abort(f) => on_abort(f),
            Exit::Interrupt => on_interrupt(),
        }
    }

    #[inline]
    pub const fn is_done(&self) -> bool {
        matches!(self, Exit::Done(_))
    }

    #[inline]
    pub const fn is_raise(&self) -> bool {
        matches!(self, Exit::Raise(_))
    }

    #[inline]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Exit::Abort(_))
    }

    #[inline]
    pub const fn is_interrupt(&self) -> bool {
        matches!(self, Exit::Interrupt)
    }

    pub fn tag(&self) -> ExitTag {
        match self {
            Exit::Done(_) => ExitTag::Done,
            Exit::Raise(_) => ExitTag::Raise,
            Exit::Abort(_) => ExitTag::Abort,
            Exit::Interrupt => ExitTag::Interrupt,
        }
    }

    /// Converts from `Exit<E, A>` to `Option<A>`, discarding any failure.
    pub fn done(self) -> Option<A> {
        match self {
            Exit::Done(a) => Some(a),
            _ => None,
        }
    }

    /// Splits the exit into a success or its [`Cause`].
    ///
    /// ```rust
    /// use spindle::{Cause, Exit};
    ///
    /// let exit: Exit<&str, i32> = Exit::Raise("nope");
    /// assert_eq!(exit.into_result(), Err(Cause::Raise("nope")));
    /// ```
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Done(a) => Ok(a),
            Exit::Raise(e) => Err(Cause::Raise(e)),
            Exit::Abort(f) => Err(Cause::Abort(f)),
            Exit::Interrupt => Err(Cause::Interrupt),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Done(a) => Exit::Done(f(a)),
            Exit::Raise(e) => Exit::Raise(e),
            Exit::Abort(fault) => Exit::Abort(fault),
            Exit::Interrupt => Exit::Interrupt,
        }
    }

    pub fn map_err<E2>(self, f: impl FnOnce(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Done(a) => Exit::Done(a),
            Exit::Raise(e) => Exit::Raise(f(e)),
            Exit::Abort(fault) => Exit::Abort(fault),
            Exit::Interrupt => Exit::Interrupt,
        }
    }
}

impl<E, A> From<Cause<E>> for Exit<E, A> {
    fn from(cause: Cause<E>) -> Self {
        match cause {
            Cause::Raise(e) => Exit::Raise(e),
            Cause::Abort(f) => Exit::Abort(f),
            Cause::Interrupt => Exit::Interrupt,
        }
    }
}

impl<E> Cause<E> {
    pub fn tag(&self) -> ExitTag {
        match self {
            Cause::Raise(_) => ExitTag::Raise,
            Cause::Abort(_) => ExitTag::Abort,
            Cause::Interrupt => ExitTag::Interrupt,
        }
    }

    pub fn map<E2>(self, f: impl FnOnce(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Raise(e) => Cause::Raise(f(e)),
            Cause::Abort(fault) => Cause::Abort(fault),
            Cause::Interrupt => Cause::Interrupt,
        }
    }

    /// Returns the typed error, if this is a `Raise`.
    pub fn raised(self) -> Option<E> {
        match self {
            Cause::Raise(e) => Some(e),
            _ => None,
        }
    }
}
