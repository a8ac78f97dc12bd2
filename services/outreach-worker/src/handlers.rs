//! Built-in job handlers
//!
//! Pipeline work (scoring, discovery, sending) is registered by the
//! embedding application. The worker itself only ships handlers for its own
//! components, so operators can trigger maintenance through the queue:
//!
//! - `refresh_credential` `{"resource_id": "..."}`
//! - `invalidate_cache` `{"key": "..."}`, `{"category": "..."}` or `{"all": true}`

use std::sync::Arc;

use common::BoxFuture;
use credential_refresh::{RefreshManager, RefreshOutcome};
use response_cache::{Invalidation, ResponseCache};
use scheduler::{Job, JobHandler, JobOutcome};
use serde_json::json;

pub const REFRESH_CREDENTIAL: &str = "refresh_credential";
pub const INVALIDATE_CACHE: &str = "invalidate_cache";

pub struct RefreshCredential(pub Arc<RefreshManager>);

impl JobHandler for RefreshCredential {
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, JobOutcome> {
        Box::pin(async move {
            let Some(resource_id) = job.payload["resource_id"].as_str() else {
                return JobOutcome::TerminalFailure("payload missing resource_id".into());
            };
            match self.0.refresh(resource_id).await {
                Ok(RefreshOutcome::Refreshed { expires }) => {
                    JobOutcome::Success(json!({"refreshed": true, "expires": expires}))
                }
                Ok(RefreshOutcome::AlreadyFresh { expires }) => {
                    JobOutcome::Success(json!({"refreshed": false, "expires": expires}))
                }
                Err(e) => JobOutcome::from_error(&e),
            }
        })
    }
}

pub struct InvalidateCache(pub Arc<ResponseCache>);

fn invalidation_scope(payload: &serde_json::Value) -> Option<Invalidation> {
    if let Some(key) = payload["key"].as_str() {
        Some(Invalidation::Key(key.to_string()))
    } else if let Some(category) = payload["category"].as_str() {
        Some(Invalidation::Category(category.to_string()))
    } else if payload["all"].as_bool() == Some(true) {
        Some(Invalidation::All)
    } else {
        None
    }
}

impl JobHandler for InvalidateCache {
    fn handle<'a>(&'a self, job: &'a Job) -> BoxFuture<'a, JobOutcome> {
        Box::pin(async move {
            let Some(scope) = invalidation_scope(&job.payload) else {
                return JobOutcome::TerminalFailure(
                    "payload needs one of key, category or all=true".into(),
                );
            };
            match self.0.invalidate(scope).await {
                Ok(removed) => JobOutcome::Success(json!({"removed": removed})),
                Err(e) => JobOutcome::RetryableFailure(e.to_string()),
            }
        })
    }
}
