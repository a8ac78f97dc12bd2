//! Job model

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JobId = i64;

/// Job status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, never attempted.
    Pending,
    /// Claimed by a worker.
    Processing,
    Completed,
    /// Out of attempts or terminally rejected. Kept as the error record.
    Failed,
    /// Waiting for `scheduled_at` before the next attempt.
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "retrying" => Some(JobStatus::Retrying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Eligible to be fetched and claimed.
    pub fn is_runnable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued unit of work. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Key into the handler registry.
    pub job_type: String,
    pub payload: Value,
    /// Higher runs sooner.
    pub priority: i64,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub scheduled_at: Option<u64>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
    /// Data returned by a successful handler.
    pub result: Option<Value>,
}

impl Job {
    /// Runnable and past its `scheduled_at` (or never scheduled).
    pub fn is_due(&self, now: u64) -> bool {
        self.status.is_runnable() && self.scheduled_at.is_none_or(|at| at <= now)
    }
}

/// Enqueue request.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: Value,
    pub priority: i64,
    pub max_attempts: u32,
    pub scheduled_at: Option<u64>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_attempts: 3,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Hold the job until `at` (unix ms).
    pub fn not_before(mut self, at: u64) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Materialize as a fresh `pending` row.
    pub fn into_job(self, id: JobId, now: u64) -> Job {
        Job {
            id,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            scheduled_at: self.scheduled_at,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            result: None,
        }
    }
}
