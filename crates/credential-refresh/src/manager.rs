//! Lock-guarded token refresh
//!
//! `refresh()` is safe to call from any number of tasks or processes at once:
//! the advisory lock admits one refresher per resource, and every waiter
//! re-reads the credential file after taking the lock, so it observes the
//! winner's token instead of spending the refresh token a second time.

use std::sync::Arc;
use std::time::Duration;

use common::time::{millis, now_millis};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::lock::{AdvisoryLock, LockLease};
use crate::token::TokenRefresher;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Refresh tokens expiring within this window.
    pub threshold: Duration,
    /// Bounded wait for the refresh lock.
    pub lock_wait: Duration,
    pub lock_poll: Duration,
    /// Locks older than this are reclaimable.
    pub stale_lock: Duration,
    pub request_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(900),
            lock_wait: Duration::from_secs(30),
            lock_poll: Duration::from_millis(500),
            stale_lock: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This call spent the refresh token.
    Refreshed { expires: u64 },
    /// Token was valid, possibly because another holder just refreshed it.
    AlreadyFresh { expires: u64 },
}

/// Tally of one `refresh_due()` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub checked: usize,
    pub refreshed: usize,
    pub already_fresh: usize,
    pub needs_reauth: usize,
    pub failed: usize,
}

/// Releases the lease on every path, including when the refresh future is
/// dropped mid-flight (a job timeout, a cancelled caller).
struct HeldLock {
    lock: Arc<dyn AdvisoryLock>,
    lease: Option<LockLease>,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.lock.release(&lease).await {
                warn!(resource_id = %lease.resource_id, error = %e, "failed to release refresh lock");
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(resource_id = %lease.resource_id, "no runtime to release abandoned refresh lock");
            return;
        };
        let lock = self.lock.clone();
        runtime.spawn(async move {
            match lock.release(&lease).await {
                Ok(()) => debug!(resource_id = %lease.resource_id, "abandoned refresh lock released"),
                Err(e) => warn!(resource_id = %lease.resource_id, error = %e, "failed to release abandoned refresh lock"),
            }
        });
    }
}

pub struct RefreshManager {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    lock: Arc<dyn AdvisoryLock>,
    config: RefreshConfig,
}

impl RefreshManager {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        lock: Arc<dyn AdvisoryLock>,
        config: RefreshConfig,
    ) -> Self {
        Self {
            store,
            refresher,
            lock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Refresh `resource_id` if its token expires within the threshold.
    pub async fn refresh(&self, resource_id: &str) -> Result<RefreshOutcome> {
        let credential = self.credential(resource_id).await?;
        if credential.needs_reauth() {
            metrics::counter!("credential_refresh_total", "outcome" => "needs_reauth")
                .increment(1);
            return Err(Error::NeedsReauth(resource_id.to_string()));
        }
        if !self.is_due(&credential, now_millis()) {
            return Ok(RefreshOutcome::AlreadyFresh {
                expires: credential.expires,
            });
        }

        let held = HeldLock {
            lock: self.lock.clone(),
            lease: Some(self.acquire_lock(resource_id).await?),
        };
        let result = self.refresh_locked(resource_id).await;
        held.release().await;

        let outcome = match &result {
            Ok(RefreshOutcome::Refreshed { .. }) => "refreshed",
            Ok(RefreshOutcome::AlreadyFresh { .. }) => "fresh",
            Err(Error::InvalidGrant(_) | Error::NeedsReauth(_)) => "needs_reauth",
            Err(_) => "failed",
        };
        metrics::counter!("credential_refresh_total", "outcome" => outcome).increment(1);
        result
    }

    /// Current access token for `resource_id`, refreshing first when due.
    pub async fn access_token(&self, resource_id: &str) -> Result<String> {
        self.refresh(resource_id).await?;
        Ok(self.credential(resource_id).await?.access)
    }

    /// One background pass over every active credential that is due.
    pub async fn refresh_due(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let now = now_millis();

        for id in self.store.resource_ids().await {
            let Some(credential) = self.store.get(&id).await else {
                continue;
            };
            summary.checked += 1;
            if credential.needs_reauth() {
                summary.needs_reauth += 1;
                continue;
            }
            if !self.is_due(&credential, now) {
                continue;
            }

            debug!(resource_id = id, "token expiring within threshold, refreshing");
            match self.refresh(&id).await {
                Ok(RefreshOutcome::Refreshed { .. }) => summary.refreshed += 1,
                Ok(RefreshOutcome::AlreadyFresh { .. }) => summary.already_fresh += 1,
                Err(Error::InvalidGrant(_) | Error::NeedsReauth(_)) => summary.needs_reauth += 1,
                Err(e) => {
                    warn!(resource_id = id, error = %e, "refresh failed (transient), will retry next cycle");
                    summary.failed += 1;
                }
            }
        }

        if summary.refreshed > 0 || summary.failed > 0 {
            info!(
                checked = summary.checked,
                refreshed = summary.refreshed,
                failed = summary.failed,
                needs_reauth = summary.needs_reauth,
                "credential refresh cycle complete"
            );
        }
        summary
    }

    /// Store a credential obtained out of band and clear `needs_reauth`.
    pub async fn reauthorize(&self, resource_id: &str, credential: Credential) -> Result<()> {
        self.store.reauthorize(resource_id, credential).await
    }

    async fn credential(&self, resource_id: &str) -> Result<Credential> {
        self.store
            .get(resource_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("resource {resource_id} not in credential store")))
    }

    fn is_due(&self, credential: &Credential, now: u64) -> bool {
        credential.expires_within(now, millis(self.config.threshold))
    }

    async fn acquire_lock(&self, resource_id: &str) -> Result<LockLease> {
        let deadline = tokio::time::Instant::now() + self.config.lock_wait;
        loop {
            if let Some(lease) = self
                .lock
                .try_acquire(resource_id, self.config.stale_lock)
                .await?
            {
                return Ok(lease);
            }
            if tokio::time::Instant::now() + self.config.lock_poll > deadline {
                warn!(
                    resource_id,
                    wait_secs = self.config.lock_wait.as_secs(),
                    "gave up waiting for refresh lock"
                );
                metrics::counter!("credential_refresh_total", "outcome" => "lock_timeout")
                    .increment(1);
                return Err(Error::LockTimeout(resource_id.to_string()));
            }
            tokio::time::sleep(self.config.lock_poll).await;
        }
    }

    /// Refresh with the lock held. Never returns without a decision about
    /// the credential's persisted state.
    async fn refresh_locked(&self, resource_id: &str) -> Result<RefreshOutcome> {
        self.store.reload().await?;
        let credential = self.credential(resource_id).await?;
        if credential.needs_reauth() {
            return Err(Error::NeedsReauth(resource_id.to_string()));
        }
        let now = now_millis();
        if !self.is_due(&credential, now) {
            debug!(resource_id, "token refreshed by another holder");
            return Ok(RefreshOutcome::AlreadyFresh {
                expires: credential.expires,
            });
        }

        let response = match tokio::time::timeout(
            self.config.request_timeout,
            self.refresher.refresh(&credential.refresh),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(Error::InvalidGrant(msg))) => {
                self.store.mark_needs_reauth(resource_id, &msg).await?;
                return Err(Error::InvalidGrant(msg));
            }
            Ok(Err(e)) => {
                warn!(resource_id, error = %e, "token refresh failed");
                return Err(e);
            }
            Err(_) => {
                warn!(resource_id, "token refresh timed out");
                return Err(Error::Timeout(format!(
                    "refreshing {resource_id} after {}s",
                    self.config.request_timeout.as_secs()
                )));
            }
        };

        let expires = now_millis().saturating_add(response.expires_in.saturating_mul(1000));
        let refresh = response.refresh_token.unwrap_or(credential.refresh);
        self.store
            .update_token(resource_id, response.access_token, refresh, expires)
            .await?;
        info!(resource_id, expires, "token refresh succeeded");
        Ok(RefreshOutcome::Refreshed { expires })
    }
}
