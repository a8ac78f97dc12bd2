//! Multi-window rate limiting and credit accounting for metered APIs
//!
//! Every guarded service has a set of request limits over trailing windows
//! (minute, hour, day, month) and an optional monthly credit budget. The
//! limiter answers "may I call now?" from an append-only usage log and never
//! writes during the check, so a denial never corrupts the log.
//!
//! Call sequence for a guarded request:
//! 1. `RateLimiter::check()` / `can_make_request()` before doing the work
//! 2. perform the external call
//! 3. `RateLimiter::record_request()` or `record_failure()` afterwards
//!
//! Check and record are deliberately separate calls and are not atomic across
//! processes. Two workers racing near a boundary can both be admitted; the
//! overshoot is bounded by the number of workers.

pub mod classify;
pub mod config;
pub mod error;
pub mod limiter;
pub mod store;
pub mod window;

pub use classify::{classify_429, classify_status};
pub use config::ServiceLimits;
pub use error::{Error, Result};
pub use limiter::{Admission, Denial, RateLimiter, ServiceUsage, WindowUsage};
pub use store::{MemoryUsageStore, SqliteUsageStore, UsageRecord, UsageStore, UsageTotals};
pub use window::Window;
