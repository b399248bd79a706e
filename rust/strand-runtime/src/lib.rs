//! Strand: a structured-concurrency runtime for composable effects.
//!
//! Runs lazily described [`Effect`]s as cooperatively scheduled fibers over a
//! small work-stealing pool, with checkpointed interruption, scope-based
//! finalization, single-assignment [`Deferred`] values, back-pressured
//! [`Mailbox`]es, software transactional memory ([`stm`]) and interval-driven
//! retry/repeat [`schedule`]s.
#![warn(clippy::all)]

mod cell;

pub mod cause;
pub mod clock;
pub mod config;
pub mod defect;
pub mod deferred;
pub mod effect;
pub mod error;
pub mod fiber;
pub mod mailbox;
pub mod runtime;
pub mod schedule;
pub mod scope;
pub mod stm;

pub use cause::{Cause, Exit, ScopeExit};
pub use config::RuntimeConfig;
pub use defect::Defect;
pub use deferred::Deferred;
pub use effect::{Effect, Payload, Restore};
pub use error::{ConfigError, RuntimeError};
pub use fiber::{Fiber, FiberId, FiberStatus, Resume};
pub use mailbox::{Mailbox, Strategy};
pub use runtime::{Runtime, RuntimeStats};
pub use schedule::{Interval, Intervals, Schedule};
pub use scope::Scope;
pub use stm::{Stm, TMap, TPriorityQueue, TQueue, TRef, TSemaphore};
