//! Housekeeping run between job batches
//!
//! Each task wraps one component's maintenance call. Intervals are applied
//! by `PeriodicTasks` when the runtime registers them.

use std::sync::Arc;
use std::time::Duration;

use common::BoxFuture;
use common::time::{millis, now_millis};
use credential_refresh::RefreshManager;
use ratelimit::RateLimiter;
use response_cache::ResponseCache;
use scheduler::{JobStore, PeriodicTask};
use tracing::{info, warn};

use crate::runtime::WorkerPool;

pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(3600);
pub const USAGE_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
pub const STALE_RECOVERY_INTERVAL: Duration = Duration::from_secs(300);
pub const FINISHED_PURGE_INTERVAL: Duration = Duration::from_secs(3600);
pub const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(60);

/// Refresh every credential expiring within the manager's threshold.
pub struct CredentialRefresh(pub Arc<RefreshManager>);

impl PeriodicTask for CredentialRefresh {
    fn name(&self) -> &str {
        "credential_refresh"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let summary = self.0.refresh_due().await;
            if summary.needs_reauth > 0 {
                warn!(
                    needs_reauth = summary.needs_reauth,
                    "credentials need re-authorization"
                );
            }
            if summary.failed > 0 {
                return Err(format!(
                    "{} of {} credential refreshes failed",
                    summary.failed, summary.checked
                ));
            }
            Ok(())
        })
    }
}

/// Close pooled connections past their TTL.
pub struct PoolSweep(pub Arc<WorkerPool>);

impl PeriodicTask for PoolSweep {
    fn name(&self) -> &str {
        "pool_sweep"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.0.sweep().await;
            Ok(())
        })
    }
}

pub struct CachePurge(pub Arc<ResponseCache>);

impl PeriodicTask for CachePurge {
    fn name(&self) -> &str {
        "cache_purge"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            self.0.purge_expired().await.map(|_| ()).map_err(|e| e.to_string())
        })
    }
}

/// Drop usage records older than the longest window.
pub struct UsagePrune(pub Arc<RateLimiter>);

impl PeriodicTask for UsagePrune {
    fn name(&self) -> &str {
        "usage_prune"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move { self.0.prune().await.map(|_| ()).map_err(|e| e.to_string()) })
    }
}

/// Return jobs orphaned in `processing` by a crashed worker to the queue.
pub struct StaleJobRecovery {
    pub store: Arc<dyn JobStore>,
    pub stale_after: Duration,
}

impl PeriodicTask for StaleJobRecovery {
    fn name(&self) -> &str {
        "stale_job_recovery"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let now = now_millis();
            let cutoff = now.saturating_sub(millis(self.stale_after));
            let recovered = self
                .store
                .recover_stale(cutoff, now)
                .await
                .map_err(|e| e.to_string())?;
            if recovered > 0 {
                info!(recovered, "recovered stale jobs");
            }
            Ok(())
        })
    }
}

/// Delete completed jobs past retention. Failed jobs stay as the error record.
pub struct FinishedJobPurge {
    pub store: Arc<dyn JobStore>,
    pub retention: Duration,
}

impl PeriodicTask for FinishedJobPurge {
    fn name(&self) -> &str {
        "finished_job_purge"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let cutoff = now_millis().saturating_sub(millis(self.retention));
            let purged = self
                .store
                .purge_finished(cutoff)
                .await
                .map_err(|e| e.to_string())?;
            if purged > 0 {
                info!(purged, "purged finished jobs");
            }
            Ok(())
        })
    }
}

/// Publish the `jobs_queued` gauge.
pub struct QueueDepth(pub Arc<dyn JobStore>);

impl PeriodicTask for QueueDepth {
    fn name(&self) -> &str {
        "queue_depth"
    }

    fn run(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async move {
            let counts = self.0.counts().await.map_err(|e| e.to_string())?;
            crate::metrics::record_queue_depth(&counts);
            Ok(())
        })
    }
}
