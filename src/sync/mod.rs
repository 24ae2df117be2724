//! Fiber-aware synchronization primitives.
//!
//! Each primitive is a [`Ref`] holding its state plus fiber suspension: waiting
//! never blocks a worker thread, and a waiter that is interrupted is removed from
//! the wait list before the interruption propagates.

mod deferred;
mod queue;
mod reference;
mod semaphore;

pub use deferred::Deferred;
pub use queue::{Queue, Strategy};
pub use reference::Ref;
pub use semaphore::Semaphore;
