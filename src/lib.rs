//! Core of the `ncron` scheduling daemon: the schedule-constraint model, the
//! next-execution-time computation, the run queue, and the durable execution
//! history. Everything that spawns processes, parses command-line flags,
//! installs signal handlers, or writes log records lives in the `ncron`
//! binary, which consumes the interfaces this library exposes.

pub mod config;
pub mod constraint;
pub mod error;
pub mod history;
pub mod job;
pub mod queue;
pub mod scheduler;
pub mod table;

pub use config::ConfigLoader;
pub use constraint::{Category, ConstraintSet};
pub use error::{ConfigError, HistoryError};
pub use history::{HistoryRecord, HistoryStore};
pub use job::Job;
pub use queue::RunQueue;
pub use scheduler::{DispatchOutcome, Scheduler};
pub use table::JobTable;

/// Unique, positive, dense identifier for a `Job`. Zero is never a valid id
/// (spec invariant: `id > 0`).
pub type JobId = u32;

/// Seconds-since-epoch, matching the original daemon's `time_t` semantics.
/// `0` is the sentinel for "never"/"unset" throughout this crate.
pub type Seconds = i64;
