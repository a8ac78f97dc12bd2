//! Job type → handler mapping

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use common::BoxFuture;
use tracing::debug;

use crate::job::Job;
use crate::outcome::JobOutcome;

/// Work function for one job type.
///
/// Handlers report failures through `JobOutcome`; the processor never sees
/// their error types. Use `JobOutcome::from_error` to map component errors.
pub trait JobHandler: Send + Sync {
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, JobOutcome>;
}

/// Adapter so plain async closures can be registered.
pub struct FnHandler<F>(F);

impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, JobOutcome> {
        Box::pin((self.0)(job.clone()))
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    FnHandler(f)
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.register_arc(job_type, Arc::new(handler));
    }

    pub fn register_arc(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        debug!(job_type, "job handler registered");
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use serde_json::json;

    struct Echo;

    impl JobHandler for Echo {
        fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, JobOutcome> {
            Box::pin(async move { JobOutcome::Success(job.payload.clone()) })
        }
    }

    #[tokio::test]
    async fn dispatches_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Echo);
        registry.register(
            "score_domain",
            handler_fn(|job: Job| async move {
                if job.payload["domain"].is_string() {
                    JobOutcome::success()
                } else {
                    JobOutcome::TerminalFailure("missing domain".into())
                }
            }),
        );

        assert_eq!(registry.job_types(), vec!["echo", "score_domain"]);
        let job = NewJob::new("echo", json!({"x": 1})).into_job(1, 0);
        let outcome = registry.get("echo").unwrap().handle(&job).await;
        assert_eq!(outcome, JobOutcome::Success(json!({"x": 1})));

        let job = NewJob::new("score_domain", json!({})).into_job(2, 0);
        let outcome = registry.get("score_domain").unwrap().handle(&job).await;
        assert_eq!(outcome.label(), "terminal");

        assert!(registry.get("ghost").is_none());
    }
}
