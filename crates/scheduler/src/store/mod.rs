//! Durable job queue storage

mod memory;
mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

use common::BoxFuture;
use serde::Serialize;

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::transition::Transition;

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
}

impl JobCounts {
    pub fn add(&mut self, status: JobStatus, n: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Retrying => &mut self.retrying,
        };
        *slot += n;
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Retrying => self.retrying,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Queue storage. Implementations are the sole writers of job status.
///
/// Every status change is conditional on the current status, so several
/// processors (threads or processes) can share one store: `claim()` succeeds
/// for exactly one caller and `apply()` only touches a job still
/// `processing`.
pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: NewJob, now: u64) -> BoxFuture<'_, Result<JobId>>;

    /// Up to `limit` runnable jobs due at `now`, ordered by priority desc,
    /// created_at asc, id asc.
    fn fetch_due(&self, now: u64, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>>;

    /// `pending|retrying → processing` for a job due at `now`, returning the
    /// row as claimed. `None` if another worker got there first or the job
    /// has been rescheduled since it was fetched.
    fn claim(&self, id: JobId, now: u64) -> BoxFuture<'_, Result<Option<Job>>>;

    /// Persist the outcome of an attempt. False if the job is no longer
    /// `processing` (recovered as stale and re-claimed elsewhere).
    fn apply<'a>(&'a self, id: JobId, transition: &'a Transition) -> BoxFuture<'a, Result<bool>>;

    fn get(&self, id: JobId) -> BoxFuture<'_, Result<Option<Job>>>;

    /// Most recently created first.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>>;

    fn counts(&self) -> BoxFuture<'_, Result<JobCounts>>;

    /// Return jobs stuck in `processing` since before `started_before` to
    /// `retrying` (counting the lost attempt), or `failed` if that was the
    /// last one.
    fn recover_stale(&self, started_before: u64, now: u64) -> BoxFuture<'_, Result<u64>>;

    /// Delete `completed` jobs finished before `completed_before`. Failed
    /// jobs are kept.
    fn purge_finished(&self, completed_before: u64) -> BoxFuture<'_, Result<u64>>;
}

/// Message recorded on a job recovered from a stalled worker.
pub(crate) const STALE_MESSAGE: &str = "worker stalled while processing; recovered";

#[cfg(test)]
pub(crate) mod contract {
    //! Behavior every `JobStore` must share; run against each implementation.

    use super::*;
    use serde_json::json;

    pub async fn orders_by_priority_then_age(store: &dyn JobStore) {
        let low = store.enqueue(NewJob::new("a", json!(1)), 100).await.unwrap();
        let high_late = store
            .enqueue(NewJob::new("a", json!(2)).with_priority(5), 300)
            .await
            .unwrap();
        let high_early = store
            .enqueue(NewJob::new("a", json!(3)).with_priority(5), 200)
            .await
            .unwrap();
        let future = store
            .enqueue(NewJob::new("a", json!(4)).with_priority(9).not_before(10_000), 50)
            .await
            .unwrap();

        let due: Vec<JobId> = store
            .fetch_due(1_000, 10)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(due, vec![high_early, high_late, low]);
        assert!(!due.contains(&future));

        let limited = store.fetch_due(1_000, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    pub async fn claim_is_exclusive(store: &dyn JobStore) {
        let id = store.enqueue(NewJob::new("a", json!({})), 0).await.unwrap();
        assert!(store.claim(id, 10).await.unwrap().is_some());
        assert!(store.claim(id, 11).await.unwrap().is_none());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.started_at, Some(10));
        assert!(store.fetch_due(20, 10).await.unwrap().is_empty());
    }

    pub async fn stale_fetch_cannot_skip_backoff(store: &dyn JobStore) {
        let id = store
            .enqueue(NewJob::new("a", json!({})).with_max_attempts(3), 0)
            .await
            .unwrap();
        let fetched = store.fetch_due(1_000, 10).await.unwrap();
        assert_eq!(fetched[0].attempts, 0);

        // Another worker runs the job first and it fails.
        let other = store.claim(id, 1_000).await.unwrap().unwrap();
        assert_eq!(other.attempts, 0);
        let retry = Transition::Retry {
            attempts: 1,
            scheduled_at: 121_000,
            error: "timeout".into(),
        };
        assert!(store.apply(id, &retry).await.unwrap());

        // The earlier fetch is stale: the job is backing off.
        assert!(store.claim(fetched[0].id, 1_002).await.unwrap().is_none());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);

        // Once due, the claimed row carries the recorded attempt.
        let claimed = store.claim(id, 121_000).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.started_at, Some(121_000));
    }

    pub async fn applies_transitions(store: &dyn JobStore) {
        let id = store.enqueue(NewJob::new("a", json!({})), 0).await.unwrap();

        // Not claimed yet: nothing to apply.
        let done = Transition::Complete {
            result: json!({"ok": true}),
            completed_at: 50,
        };
        assert!(!store.apply(id, &done).await.unwrap());

        store.claim(id, 10).await.unwrap();
        let retry = Transition::Retry {
            attempts: 1,
            scheduled_at: 500,
            error: "502".into(),
        };
        assert!(store.apply(id, &retry).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.scheduled_at, Some(500));
        assert_eq!(job.error_message.as_deref(), Some("502"));
        assert!(store.fetch_due(499, 10).await.unwrap().is_empty());
        assert_eq!(store.fetch_due(500, 10).await.unwrap().len(), 1);

        store.claim(id, 500).await.unwrap();
        let defer = Transition::Defer {
            scheduled_at: 900,
            reason: "quota".into(),
        };
        assert!(store.apply(id, &defer).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Retrying);

        store.claim(id, 900).await.unwrap();
        assert!(store.apply(id, &done).await.unwrap());
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_at, Some(50));
        assert_eq!(job.result, Some(json!({"ok": true})));
        assert!(job.error_message.is_none());
    }

    pub async fn recovers_and_purges(store: &dyn JobStore) {
        let stuck = store
            .enqueue(NewJob::new("a", json!({})).with_max_attempts(3), 0)
            .await
            .unwrap();
        let last_try = store
            .enqueue(NewJob::new("a", json!({})).with_max_attempts(1), 0)
            .await
            .unwrap();
        let recent = store.enqueue(NewJob::new("a", json!({})), 0).await.unwrap();
        store.claim(stuck, 100).await.unwrap();
        store.claim(last_try, 100).await.unwrap();
        store.claim(recent, 900).await.unwrap();

        assert_eq!(store.recover_stale(500, 1_000).await.unwrap(), 2);
        let job = store.get(stuck).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some(STALE_MESSAGE));
        let job = store.get(last_try).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.completed_at, Some(1_000));
        assert_eq!(
            store.get(recent).await.unwrap().unwrap().status,
            JobStatus::Processing
        );

        store
            .apply(
                recent,
                &Transition::Complete {
                    result: json!(null),
                    completed_at: 2_000,
                },
            )
            .await
            .unwrap();
        // Failed jobs survive the purge.
        assert_eq!(store.purge_finished(5_000).await.unwrap(), 1);
        assert!(store.get(recent).await.unwrap().is_none());
        assert!(store.get(last_try).await.unwrap().is_some());
    }

    pub async fn counts_and_lists(store: &dyn JobStore) {
        for i in 0..3 {
            store.enqueue(NewJob::new("a", json!(i)), i).await.unwrap();
        }
        let claimed = store.fetch_due(10, 1).await.unwrap()[0].id;
        store.claim(claimed, 10).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.total(), 3);

        let pending = store.list(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].created_at >= pending[1].created_at);
        assert_eq!(store.list(None, 2).await.unwrap().len(), 2);
    }
}
