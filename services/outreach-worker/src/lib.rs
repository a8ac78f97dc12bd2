//! Outreach worker
//!
//! Composition root for the execution core: loads config, builds the rate
//! limiter, response cache, connection pool, credential refresh manager and
//! job queue once, then runs the scheduler in run-once or continuous mode.

pub mod admin;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod runtime;
pub mod tasks;

pub use config::{Config, Mode};
pub use error::{Error, Result};
pub use runtime::{BoxedFactory, Runtime, RuntimeBuilder, WorkerPool};
