//! What a handler reports back for one attempt

use std::fmt;
use std::time::Duration;

use common::{Classify, ErrorClass};
use serde_json::Value;

/// Quota denials without a known reset time wait this long.
pub const DEFAULT_DEFER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success(Value),
    /// Counts an attempt; retried with backoff while attempts remain.
    RetryableFailure(String),
    /// Counts an attempt; the job fails now.
    TerminalFailure(String),
    /// Rate or credit limit hit. Rescheduled without counting an attempt.
    Deferred { retry_after: Duration, reason: String },
}

impl JobOutcome {
    pub fn success() -> Self {
        JobOutcome::Success(Value::Null)
    }

    /// Map a component error to an outcome by its class.
    pub fn from_error<E: Classify + fmt::Display + ?Sized>(error: &E) -> Self {
        let message = error.to_string();
        match error.class() {
            ErrorClass::Transient | ErrorClass::PoolExhausted => {
                JobOutcome::RetryableFailure(message)
            }
            ErrorClass::QuotaExceeded => JobOutcome::Deferred {
                retry_after: error.retry_after().unwrap_or(DEFAULT_DEFER),
                reason: message,
            },
            ErrorClass::TerminalAuth | ErrorClass::Configuration => {
                JobOutcome::TerminalFailure(message)
            }
        }
    }

    /// `Ok(data)` succeeds, `Err` goes through `from_error`.
    pub fn from_result<E: Classify + fmt::Display>(result: Result<Value, E>) -> Self {
        match result {
            Ok(data) => JobOutcome::Success(data),
            Err(e) => JobOutcome::from_error(&e),
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success(_) => "success",
            JobOutcome::RetryableFailure(_) => "retryable",
            JobOutcome::TerminalFailure(_) => "terminal",
            JobOutcome::Deferred { .. } => "deferred",
        }
    }
}
