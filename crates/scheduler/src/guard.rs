//! Rate-limited, cached external calls for job handlers
//!
//! `CallGuard` wraps one external call in the standard sequence:
//! cache lookup, limiter admission, the call itself, usage recording,
//! then cache store. Handlers turn a `CallError` into a job outcome with
//! `JobOutcome::from_error`, so a quota denial defers the job.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Classify, ErrorClass};
use ratelimit::RateLimiter;
use response_cache::ResponseCache;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Denied by the limiter, or the limiter could not be consulted.
    #[error(transparent)]
    Limiter(#[from] ratelimit::Error),

    #[error("{service} call failed: {message}")]
    Upstream {
        service: String,
        class: ErrorClass,
        retry_after: Option<Duration>,
        message: String,
    },
}

impl CallError {
    fn upstream<E: Classify + fmt::Display>(service: &str, e: &E) -> Self {
        CallError::Upstream {
            service: service.to_string(),
            class: e.class(),
            retry_after: e.retry_after(),
            message: e.to_string(),
        }
    }
}

impl Classify for CallError {
    fn class(&self) -> ErrorClass {
        match self {
            CallError::Limiter(e) => e.class(),
            CallError::Upstream { class, .. } => *class,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::Limiter(e) => e.retry_after(),
            CallError::Upstream { retry_after, .. } => *retry_after,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub value: Value,
    /// Served from cache; no call made and no usage recorded.
    pub from_cache: bool,
}

#[derive(Clone)]
pub struct CallGuard {
    limiter: Arc<RateLimiter>,
    cache: Option<Arc<ResponseCache>>,
}

impl CallGuard {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Admission, call, record. Nothing is cached.
    pub async fn call<F, Fut, E>(
        &self,
        service: &str,
        operation: &str,
        f: F,
    ) -> Result<CallResult, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Classify + fmt::Display,
    {
        self.run(service, operation, None, f).await
    }

    /// Like `call`, but a fresh cache entry under `key` skips the call, and
    /// a successful result is stored under `category`.
    pub async fn call_cached<F, Fut, E>(
        &self,
        service: &str,
        operation: &str,
        key: &str,
        category: &str,
        f: F,
    ) -> Result<CallResult, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Classify + fmt::Display,
    {
        self.run(service, operation, Some((key, category)), f).await
    }

    async fn run<F, Fut, E>(
        &self,
        service: &str,
        operation: &str,
        cached: Option<(&str, &str)>,
        f: F,
    ) -> Result<CallResult, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: Classify + fmt::Display,
    {
        let cache = self.cache.as_deref().zip(cached);
        if let Some((cache, (key, _))) = cache
            && let Some(value) = cache.get(key).await
        {
            debug!(service, operation, key, "served from cache");
            return Ok(CallResult {
                value,
                from_cache: true,
            });
        }

        let cost = self.limiter.cost_of(service, operation);
        self.limiter.ensure_allowed(service, cost).await?;

        let started = Instant::now();
        let result = f().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(service, operation, duration_ms, class = %e.class(), error = %e, "external call failed");
                if let Err(record_err) = self
                    .limiter
                    .record_failure(service, 0, &e.to_string())
                    .await
                {
                    warn!(service, error = %record_err, "failed call not recorded");
                }
                return Err(CallError::upstream(service, &e));
            }
        };

        debug!(service, operation, duration_ms, credits = cost, "external call succeeded");
        // The call already happened; losing the record only weakens the limit.
        if let Err(e) = self.limiter.record_request(service, cost).await {
            warn!(service, error = %e, "successful call not recorded");
        }

        if let Some((cache, (key, category))) = cache
            && let Err(e) = cache.set(key, category, value.clone(), None).await
        {
            warn!(service, key, error = %e, "failed to cache response");
        }

        Ok(CallResult {
            value,
            from_cache: false,
        })
    }
}
