//! Error taxonomy shared by every component
//!
//! Each crate keeps its own error enum, but all of them map onto one of these
//! classes. The scheduler only looks at the class when deciding what happens
//! to a job, so a new component never needs scheduler changes.

use std::fmt;
use std::time::Duration;

/// Coarse classification of a failure, driving retry decisions.
///
/// - `Transient`: network hiccup, timeout, 5xx. Retry with backoff.
/// - `QuotaExceeded`: rate or credit limit hit. Back off without counting an attempt.
/// - `TerminalAuth`: credential revoked. Needs a human; never retried.
/// - `Configuration`: missing or invalid settings. Never retried per job.
/// - `PoolExhausted`: no connection slot after eviction. Retry at job level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    QuotaExceeded,
    TerminalAuth,
    Configuration,
    PoolExhausted,
}

impl ErrorClass {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::TerminalAuth => "terminal_auth",
            ErrorClass::Configuration => "configuration",
            ErrorClass::PoolExhausted => "pool_exhausted",
        }
    }

    /// Whether a job failing with this class may run again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::QuotaExceeded | ErrorClass::PoolExhausted
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Implemented by every crate error so callers can branch on the class.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// How long the caller should wait before trying again, when known.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}
