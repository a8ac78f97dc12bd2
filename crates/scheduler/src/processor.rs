//! Batch processor and continuous worker loop

use std::sync::Arc;
use std::time::Duration;

use common::BoxFuture;
use common::time::now_millis;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::job::Job;
use crate::outcome::JobOutcome;
use crate::registry::HandlerRegistry;
use crate::store::JobStore;
use crate::transition::{RetryPolicy, Transition, transition};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Jobs fetched per pass.
    pub batch_size: usize,
    /// Sleep between passes in continuous mode.
    pub poll_interval: Duration,
    /// Per-job handler timeout. Expiry is a retryable failure.
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(60),
            job_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Tally of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub completed: usize,
    pub retried: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Claimed or rescheduled by another worker first, or recovered while running.
    pub lost: usize,
    /// Store errors while claiming or recording; the job is left as-is.
    pub errors: usize,
    pub subtasks_run: usize,
}

impl CycleReport {
    fn count(&mut self, transition: &Transition) {
        match transition {
            Transition::Complete { .. } => self.completed += 1,
            Transition::Retry { .. } => self.retried += 1,
            Transition::Defer { .. } => self.deferred += 1,
            Transition::Fail { .. } => self.failed += 1,
        }
    }
}

/// Housekeeping run between job batches.
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self) -> BoxFuture<'_, std::result::Result<(), String>>;
}

struct Throttled {
    task: Arc<dyn PeriodicTask>,
    min_interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

/// Periodic sub-tasks, each throttled by its own minimum interval.
///
/// Shared between processors so a task runs at most once per interval no
/// matter how many workers are polling.
#[derive(Default)]
pub struct PeriodicTasks {
    tasks: Vec<Throttled>,
}

impl PeriodicTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: Arc<dyn PeriodicTask>, min_interval: Duration) {
        debug!(task = task.name(), interval_secs = min_interval.as_secs(), "periodic task registered");
        self.tasks.push(Throttled {
            task,
            min_interval,
            last_run: Mutex::new(None),
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task whose interval has elapsed. Failures are logged.
    ///
    /// A task's lock is held while it runs, so a concurrent caller waits and
    /// then sees the fresh timestamp instead of running it twice.
    pub async fn run_due(&self) -> usize {
        let mut ran = 0;
        for throttled in &self.tasks {
            let mut last_run = throttled.last_run.lock().await;
            let now = Instant::now();
            if last_run.is_some_and(|at| now.duration_since(at) < throttled.min_interval) {
                continue;
            }
            *last_run = Some(now);
            let name = throttled.task.name();
            let started = Instant::now();
            match throttled.task.run().await {
                Ok(()) => {
                    debug!(task = name, duration_ms = started.elapsed().as_millis() as u64, "periodic task done");
                }
                Err(e) => warn!(task = name, error = %e, "periodic task failed"),
            }
            ran += 1;
        }
        ran
    }
}

/// Pulls due jobs from the store and runs them through their handlers.
pub struct Processor {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    tasks: Arc<PeriodicTasks>,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            tasks: Arc::new(PeriodicTasks::new()),
            config,
        }
    }

    pub fn with_tasks(mut self, tasks: Arc<PeriodicTasks>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// One pass: sub-tasks, then one batch of due jobs.
    ///
    /// Per-job failures are recorded on the job and never abort the batch.
    /// Only a failure to fetch the batch is returned as an error.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport {
            subtasks_run: self.tasks.run_due().await,
            ..CycleReport::default()
        };

        let jobs = self
            .store
            .fetch_due(now_millis(), self.config.batch_size)
            .await?;
        report.fetched = jobs.len();

        for job in jobs {
            self.process(job, &mut report).await;
        }

        if report.fetched > 0 {
            info!(
                fetched = report.fetched,
                completed = report.completed,
                retried = report.retried,
                deferred = report.deferred,
                failed = report.failed,
                lost = report.lost,
                "processing pass complete"
            );
        }
        Ok(report)
    }

    /// Poll until `stop` flips to true (or its sender is dropped).
    ///
    /// The signal is checked before each pass and interrupts the sleep
    /// between passes; a pass in progress runs to completion.
    pub async fn run(&self, worker: usize, mut stop: watch::Receiver<bool>) {
        info!(worker, interval_secs = self.config.poll_interval.as_secs(), "worker started");
        loop {
            if *stop.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                error!(worker, error = %e, "processing pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker, "worker stopped");
    }

    async fn process(&self, job: Job, report: &mut CycleReport) {
        // Retry decisions use the row as claimed, not the fetched copy.
        let job = match self.store.claim(job.id, now_millis()).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(job_id = job.id, "job claimed or rescheduled by another worker");
                report.lost += 1;
                return;
            }
            Err(e) => {
                warn!(job_id = job.id, error = %e, "failed to claim job");
                report.errors += 1;
                return;
            }
        };

        let started = Instant::now();
        let outcome = self.dispatch(&job).await;
        let elapsed = started.elapsed();
        metrics::histogram!("job_duration_seconds", "job_type" => job.job_type.clone())
            .record(elapsed.as_secs_f64());

        let outcome_label = outcome.label();
        let next = transition(&job, outcome, now_millis(), &self.config.retry);
        metrics::counter!(
            "jobs_processed_total",
            "job_type" => job.job_type.clone(),
            "outcome" => next.label()
        )
        .increment(1);

        match self.store.apply(job.id, &next).await {
            Ok(true) => {
                report.count(&next);
                log_transition(&job, outcome_label, &next, elapsed);
            }
            Ok(false) => {
                warn!(job_id = job.id, job_type = %job.job_type, "job left processing before its result was recorded");
                report.lost += 1;
            }
            Err(e) => {
                error!(job_id = job.id, job_type = %job.job_type, error = %e, "failed to record job result");
                report.errors += 1;
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> JobOutcome {
        let Some(handler) = self.registry.get(&job.job_type) else {
            warn!(job_id = job.id, job_type = %job.job_type, "no handler registered for job type");
            return JobOutcome::TerminalFailure(format!(
                "no handler registered for job type {}",
                job.job_type
            ));
        };

        debug!(job_id = job.id, job_type = %job.job_type, attempt = job.attempts + 1, "running job");
        match tokio::time::timeout(self.config.job_timeout, handler.handle(job)).await {
            Ok(outcome) => outcome,
            Err(_) => JobOutcome::RetryableFailure(format!(
                "handler timed out after {}s",
                self.config.job_timeout.as_secs()
            )),
        }
    }
}

fn log_transition(job: &Job, outcome: &str, next: &Transition, elapsed: Duration) {
    let duration_ms = elapsed.as_millis() as u64;
    match next {
        Transition::Complete { .. } => {
            info!(job_id = job.id, job_type = %job.job_type, duration_ms, "job completed");
        }
        Transition::Retry {
            attempts,
            scheduled_at,
            error,
        } => {
            warn!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts,
                max_attempts = job.max_attempts,
                scheduled_at,
                error = %error,
                "job failed, retry scheduled"
            );
        }
        Transition::Defer {
            scheduled_at,
            reason,
        } => {
            info!(job_id = job.id, job_type = %job.job_type, scheduled_at, reason = %reason, "job deferred");
        }
        Transition::Fail {
            attempts, error, ..
        } => {
            error!(
                job_id = job.id,
                job_type = %job.job_type,
                attempts,
                outcome,
                error = %error,
                "job failed permanently"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewJob};
    use crate::registry::handler_fn;
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn processor(registry: HandlerRegistry) -> (Processor, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        let processor = Processor::new(
            store.clone(),
            Arc::new(registry),
            ProcessorConfig {
                job_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
                ..ProcessorConfig::default()
            },
        );
        (processor, store)
    }

    /// Make a retrying job due now.
    async fn make_due(store: &MemoryJobStore, id: i64) {
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        store
            .claim(id, job.scheduled_at.unwrap_or(0))
            .await
            .unwrap()
            .unwrap();
        store
            .apply(
                id,
                &Transition::Defer {
                    scheduled_at: 0,
                    reason: job.error_message.unwrap_or_default(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn always_failing_job_exhausts_attempts() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "flaky",
            handler_fn(|_job: Job| async { JobOutcome::RetryableFailure("upstream 502".into()) }),
        );
        let (processor, store) = processor(registry);
        let id = store
            .enqueue(NewJob::new("flaky", json!({})).with_max_attempts(3), 0)
            .await
            .unwrap();

        let mut seen = vec![store.get(id).await.unwrap().unwrap().status];
        for _ in 0..3 {
            let report = processor.run_once().await.unwrap();
            assert_eq!(report.fetched, 1);
            let job = store.get(id).await.unwrap().unwrap();
            seen.push(job.status);
            if job.status == JobStatus::Retrying {
                // Backoff holds the job out of the next pass until due.
                assert!(job.scheduled_at.unwrap() > now_millis());
                assert_eq!(processor.run_once().await.unwrap().fetched, 0);
                make_due(&store, id).await;
            }
        }

        assert_eq!(
            seen,
            vec![
                JobStatus::Pending,
                JobStatus::Retrying,
                JobStatus::Retrying,
                JobStatus::Failed
            ]
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_message.as_deref(), Some("upstream 502"));
        assert!(job.completed_at.is_some());

        // Never picked up again.
        assert_eq!(processor.run_once().await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn job_retried_elsewhere_is_not_rerun_from_stale_fetch() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(
            "flaky",
            handler_fn(move |_job: Job| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { JobOutcome::RetryableFailure("upstream 502".into()) }
            }),
        );
        let (processor, store) = processor(registry);
        let id = store
            .enqueue(NewJob::new("flaky", json!({})).with_max_attempts(3), 0)
            .await
            .unwrap();

        let stale = store.fetch_due(now_millis(), 10).await.unwrap();
        assert_eq!(processor.run_once().await.unwrap().retried, 1);

        let mut report = CycleReport::default();
        for job in stale {
            processor.process(job, &mut report).await;
        }
        assert_eq!(report.lost, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_immediately() {
        let (processor, store) = processor(HandlerRegistry::new());
        let id = store
            .enqueue(NewJob::new("ghost", json!({})).with_max_attempts(5), 0)
            .await
            .unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.unwrap().contains("ghost"));
        assert!(processor.run_once().await.unwrap().fetched == 0);
    }

    #[tokio::test]
    async fn success_stores_result() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "score_domain",
            handler_fn(|job: Job| async move {
                JobOutcome::Success(json!({"domain": job.payload["domain"], "score": 71}))
            }),
        );
        let (processor, store) = processor(registry);
        let id = store
            .enqueue(NewJob::new("score_domain", json!({"domain": "example.com"})), 0)
            .await
            .unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.completed, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.result, Some(json!({"domain": "example.com", "score": 71})));
    }

    #[tokio::test]
    async fn quota_deferral_keeps_attempts() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "find_email",
            handler_fn(|_job: Job| async {
                let err = ratelimit::Error::QuotaExceeded {
                    service: "hunter".into(),
                    reason: "2/2 requests in the last minute".into(),
                    retry_after: Duration::from_secs(40),
                };
                JobOutcome::from_error(&err)
            }),
        );
        let (processor, store) = processor(registry);
        let id = store
            .enqueue(NewJob::new("find_email", json!({})).with_max_attempts(1), 0)
            .await
            .unwrap();

        let before = now_millis();
        let report = processor.run_once().await.unwrap();
        assert_eq!(report.deferred, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.attempts, 0);
        assert!(job.scheduled_at.unwrap() >= before + 40_000);
    }

    #[tokio::test]
    async fn handler_timeout_is_retryable() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "slow",
            handler_fn(|_job: Job| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                JobOutcome::success()
            }),
        );
        let (processor, store) = processor(registry);
        let id = store.enqueue(NewJob::new("slow", json!({})), 0).await.unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!(report.retried, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_batch() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "ok",
            handler_fn(|_job: Job| async { JobOutcome::success() }),
        );
        registry.register(
            "bad",
            handler_fn(|_job: Job| async { JobOutcome::TerminalFailure("revoked".into()) }),
        );
        let (processor, store) = processor(registry);
        store.enqueue(NewJob::new("bad", json!({})).with_priority(1), 0).await.unwrap();
        store.enqueue(NewJob::new("ok", json!({})), 0).await.unwrap();

        let report = processor.run_once().await.unwrap();
        assert_eq!((report.failed, report.completed), (1, 1));
    }

    #[tokio::test]
    async fn batch_size_bounds_a_pass() {
        let mut registry = HandlerRegistry::new();
        registry.register("ok", handler_fn(|_job: Job| async { JobOutcome::success() }));
        let (processor, store) = processor(registry);
        for _ in 0..15 {
            store.enqueue(NewJob::new("ok", json!({})), 0).await.unwrap();
        }
        assert_eq!(processor.run_once().await.unwrap().completed, 10);
        assert_eq!(processor.run_once().await.unwrap().completed, 5);
    }

    struct CountingTask(AtomicUsize);

    impl PeriodicTask for CountingTask {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&self) -> BoxFuture<'_, std::result::Result<(), String>> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err("sweep target offline".into())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_tasks_are_throttled() {
        let task = Arc::new(CountingTask(AtomicUsize::new(0)));
        let mut tasks = PeriodicTasks::new();
        tasks.add(task.clone(), Duration::from_secs(60));

        assert_eq!(tasks.run_due().await, 1);
        assert_eq!(tasks.run_due().await, 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(tasks.run_due().await, 1);
        assert_eq!(task.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn continuous_mode_stops_on_signal() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("ok", handler_fn(|_job: Job| async { JobOutcome::success() }));
        let (processor, store) = processor(registry);
        let counter = Arc::new(CountingTask(AtomicUsize::new(0)));
        let mut tasks = PeriodicTasks::new();
        tasks.add(counter.clone(), Duration::ZERO);
        let processor = Arc::new(processor.with_tasks(Arc::new(tasks)));
        store.enqueue(NewJob::new("ok", json!({})), 0).await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn({
            let processor = processor.clone();
            let runs = runs.clone();
            async move {
                processor.run(0, stop_rx).await;
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(counter.0.load(Ordering::SeqCst) >= 2, "loop should have polled repeatedly");
        assert_eq!(store.counts().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn concurrent_workers_run_each_job_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = calls.clone();
        registry.register(
            "count",
            handler_fn(move |_job: Job| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    JobOutcome::success()
                }
            }),
        );
        let (processor, store) = processor(registry);
        let processor = Arc::new(processor);
        for _ in 0..10 {
            store.enqueue(NewJob::new("count", json!({})), 0).await.unwrap();
        }

        let mut handles = vec![];
        for _ in 0..4 {
            let processor = processor.clone();
            handles.push(tokio::spawn(async move { processor.run_once().await.unwrap() }));
        }
        let mut completed = 0;
        for h in handles {
            completed += h.await.unwrap().completed;
        }

        assert_eq!(completed, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }
}
