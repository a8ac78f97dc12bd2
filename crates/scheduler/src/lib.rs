//! Durable job queue and processor
//!
//! Jobs move through `pending → processing → completed`, or on failure
//! `processing → retrying → processing ...` until `max_attempts` is reached
//! and the job lands in `failed`. The store is the only writer of status
//! changes and the processor is its only caller; what a handler's outcome
//! means for a job is decided by the pure `transition()` function.
//!
//! A pass (`Processor::run_once`):
//! 1. Run throttled periodic sub-tasks (credential refresh, sweeps)
//! 2. Fetch a batch of due jobs, highest priority first
//! 3. Claim each job atomically; a lost claim means another worker has it
//! 4. Dispatch to the registered handler under a timeout
//! 5. Apply the resulting transition

pub mod error;
pub mod guard;
pub mod job;
pub mod outcome;
pub mod processor;
pub mod registry;
pub mod store;
pub mod transition;

pub use error::{Error, Result};
pub use guard::{CallError, CallGuard, CallResult};
pub use job::{Job, JobId, JobStatus, NewJob};
pub use outcome::JobOutcome;
pub use processor::{
    CycleReport, PeriodicTask, PeriodicTasks, Processor, ProcessorConfig,
};
pub use registry::{HandlerRegistry, JobHandler, handler_fn};
pub use store::{JobCounts, JobStore, MemoryJobStore, SqliteJobStore};
pub use transition::{RetryPolicy, Transition, transition};
