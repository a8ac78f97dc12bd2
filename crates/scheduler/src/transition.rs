//! Pure job state transitions
//!
//! `transition()` decides what an outcome means for a claimed job; the store
//! only persists the decision. Keeping this free of I/O lets the whole retry
//! policy be tested with plain values.

use std::time::Duration;

use common::time::millis;
use serde_json::Value;

use crate::job::Job;
use crate::outcome::JobOutcome;

/// Exponential backoff: `min(cap, 2^attempts * base)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempts`-th failure (attempts already incremented).
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Persisted effect of one attempt on a `processing` job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// `processing → completed`
    Complete { result: Value, completed_at: u64 },
    /// `processing → retrying`, attempt counted.
    Retry {
        attempts: u32,
        scheduled_at: u64,
        error: String,
    },
    /// `processing → retrying`, attempt not counted.
    Defer { scheduled_at: u64, reason: String },
    /// `processing → failed`
    Fail {
        attempts: u32,
        completed_at: u64,
        error: String,
    },
}

impl Transition {
    pub fn label(&self) -> &'static str {
        match self {
            Transition::Complete { .. } => "completed",
            Transition::Retry { .. } => "retrying",
            Transition::Defer { .. } => "deferred",
            Transition::Fail { .. } => "failed",
        }
    }
}

pub fn transition(job: &Job, outcome: JobOutcome, now: u64, policy: &RetryPolicy) -> Transition {
    match outcome {
        JobOutcome::Success(result) => Transition::Complete {
            result,
            completed_at: now,
        },
        JobOutcome::RetryableFailure(error) => {
            let attempts = job.attempts.saturating_add(1);
            if attempts >= job.max_attempts {
                Transition::Fail {
                    attempts,
                    completed_at: now,
                    error,
                }
            } else {
                Transition::Retry {
                    attempts,
                    scheduled_at: now.saturating_add(millis(policy.backoff(attempts))),
                    error,
                }
            }
        }
        JobOutcome::TerminalFailure(error) => Transition::Fail {
            attempts: job.attempts.saturating_add(1),
            completed_at: now,
            error,
        },
        JobOutcome::Deferred {
            retry_after,
            reason,
        } => Transition::Defer {
            scheduled_at: now.saturating_add(millis(retry_after)),
            reason,
        },
    }
}
