//! In-process job queue

use std::collections::BTreeMap;

use common::BoxFuture;
use tokio::sync::Mutex;

use super::{JobCounts, JobStore, STALE_MESSAGE};
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::transition::Transition;

#[derive(Default)]
struct Queue {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
}

/// Job store for single-process runs and tests. Not durable.
#[derive(Default)]
pub struct MemoryJobStore {
    queue: Mutex<Queue>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn enqueue(&self, job: NewJob, now: u64) -> BoxFuture<'_, Result<JobId>> {
        Box::pin(async move {
            let mut queue = self.queue.lock().await;
            queue.next_id += 1;
            let id = queue.next_id;
            queue.jobs.insert(id, job.into_job(id, now));
            Ok(id)
        })
    }

    fn fetch_due(&self, now: u64, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            let queue = self.queue.lock().await;
            let mut due: Vec<Job> = queue
                .jobs
                .values()
                .filter(|j| j.is_due(now))
                .cloned()
                .collect();
            due.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });
            due.truncate(limit);
            Ok(due)
        })
    }

    fn claim(&self, id: JobId, now: u64) -> BoxFuture<'_, Result<Option<Job>>> {
        Box::pin(async move {
            let mut queue = self.queue.lock().await;
            match queue.jobs.get_mut(&id) {
                Some(job) if job.is_due(now) => {
                    job.status = JobStatus::Processing;
                    job.started_at = Some(now);
                    Ok(Some(job.clone()))
                }
                _ => Ok(None),
            }
        })
    }

    fn apply<'a>(&'a self, id: JobId, transition: &'a Transition) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut queue = self.queue.lock().await;
            let Some(job) = queue
                .jobs
                .get_mut(&id)
                .filter(|j| j.status == JobStatus::Processing)
            else {
                return Ok(false);
            };
            match transition {
                Transition::Complete {
                    result,
                    completed_at,
                } => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(*completed_at);
                    job.result = Some(result.clone());
                    job.error_message = None;
                }
                Transition::Retry {
                    attempts,
                    scheduled_at,
                    error,
                } => {
                    job.status = JobStatus::Retrying;
                    job.attempts = *attempts;
                    job.scheduled_at = Some(*scheduled_at);
                    job.error_message = Some(error.clone());
                }
                Transition::Defer {
                    scheduled_at,
                    reason,
                } => {
                    job.status = JobStatus::Retrying;
                    job.scheduled_at = Some(*scheduled_at);
                    job.error_message = Some(reason.clone());
                }
                Transition::Fail {
                    attempts,
                    completed_at,
                    error,
                } => {
                    job.status = JobStatus::Failed;
                    job.attempts = *attempts;
                    job.completed_at = Some(*completed_at);
                    job.error_message = Some(error.clone());
                }
            }
            Ok(true)
        })
    }

    fn get(&self, id: JobId) -> BoxFuture<'_, Result<Option<Job>>> {
        Box::pin(async move { Ok(self.queue.lock().await.jobs.get(&id).cloned()) })
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            let queue = self.queue.lock().await;
            let mut jobs: Vec<Job> = queue
                .jobs
                .values()
                .filter(|j| status.is_none_or(|s| j.status == s))
                .cloned()
                .collect();
            jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            jobs.truncate(limit);
            Ok(jobs)
        })
    }

    fn counts(&self) -> BoxFuture<'_, Result<JobCounts>> {
        Box::pin(async move {
            let queue = self.queue.lock().await;
            let mut counts = JobCounts::default();
            for job in queue.jobs.values() {
                counts.add(job.status, 1);
            }
            Ok(counts)
        })
    }

    fn recover_stale(&self, started_before: u64, now: u64) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut queue = self.queue.lock().await;
            let mut recovered = 0;
            for job in queue.jobs.values_mut() {
                if job.status != JobStatus::Processing
                    || job.started_at.is_some_and(|at| at > started_before)
                {
                    continue;
                }
                job.attempts = job.attempts.saturating_add(1);
                job.error_message = Some(STALE_MESSAGE.to_string());
                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                } else {
                    job.status = JobStatus::Retrying;
                    job.scheduled_at = None;
                }
                recovered += 1;
            }
            Ok(recovered)
        })
    }

    fn purge_finished(&self, completed_before: u64) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut queue = self.queue.lock().await;
            let before = queue.jobs.len();
            queue.jobs.retain(|_, j| {
                !(j.status == JobStatus::Completed
                    && j.completed_at.is_some_and(|at| at <= completed_before))
            });
            Ok((before - queue.jobs.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[tokio::test]
    async fn orders_by_priority_then_age() {
        contract::orders_by_priority_then_age(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        contract::claim_is_exclusive(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn stale_fetch_cannot_skip_backoff() {
        contract::stale_fetch_cannot_skip_backoff(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn applies_transitions() {
        contract::applies_transitions(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn recovers_and_purges() {
        contract::recovers_and_purges(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn counts_and_lists() {
        contract::counts_and_lists(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = std::sync::Arc::new(MemoryJobStore::new());
        let id = store
            .enqueue(NewJob::new("a", serde_json::json!({})), 0)
            .await
            .unwrap();

        let mut handles = vec![];
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(id, worker).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
