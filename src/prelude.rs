//! Commonly used imports
//!
//! Use `use spindle::prelude::*;` for quick access to the most common types.

// Core types
pub use crate::{Capabilities, Data, Effect};

// Outcomes
pub use crate::{Cause, Exit, ExitTag, Fault};

// Fibers and execution
pub use crate::{Fiber, Runtime, RuntimeConfig};

// Resources
pub use crate::Managed;

// Coordination
pub use crate::{Deferred, Queue, Ref, Semaphore};

// Streaming
pub use crate::{Sink, SinkStep, Stream};
