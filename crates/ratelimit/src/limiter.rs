//! Admission decisions over the usage log
//!
//! Failure policy when the usage store is unreachable:
//! - admission (`check`, `can_make_request`, `ensure_allowed`) fails closed:
//!   a store error denies the call;
//! - reporting reads (`time_until_reset`, `usage`, `remaining_credits`,
//!   `stats`) fail open: they log and return zero or empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ServiceLimits;
use crate::error::{Error, Result};
use crate::store::{UsageRecord, UsageStore};
use crate::window::Window;

/// Why a call was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The request count in `window` already reached `limit`.
    WindowFull {
        window: Window,
        used: u64,
        limit: u64,
    },
    /// The monthly credit budget cannot cover the requested cost.
    InsufficientCredits { remaining: u64, requested: u64 },
    /// No limits configured for the service.
    UnknownService,
    /// The usage log could not be read.
    StoreUnavailable,
}

impl Denial {
    pub fn label(&self) -> &'static str {
        match self {
            Denial::WindowFull { .. } => "window_full",
            Denial::InsufficientCredits { .. } => "insufficient_credits",
            Denial::UnknownService => "unknown_service",
            Denial::StoreUnavailable => "store_unavailable",
        }
    }

    fn describe(&self) -> String {
        match self {
            Denial::WindowFull {
                window,
                used,
                limit,
            } => format!("{used}/{limit} requests in the last {window}"),
            Denial::InsufficientCredits {
                remaining,
                requested,
            } => format!("{requested} credits requested, {remaining} remaining this month"),
            Denial::UnknownService => "service has no configured limits".into(),
            Denial::StoreUnavailable => "usage log unavailable".into(),
        }
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { reason: Denial, retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Usage of one window against its limit.
#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub window: Window,
    pub requests: u64,
    pub limit: Option<u64>,
    pub resets_in_secs: u64,
}

/// Snapshot of a service's consumption across all windows.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceUsage {
    pub service: String,
    pub windows: Vec<WindowUsage>,
    pub credits_used: u64,
    pub monthly_credits: Option<u64>,
    pub credits_remaining: Option<u64>,
}

/// Multi-window limiter for every configured service.
///
/// Holds no mutable state of its own: all counts come from the usage store,
/// so several limiter instances (one per worker process) can share a SQLite
/// store and see each other's traffic.
pub struct RateLimiter {
    limits: HashMap<String, ServiceLimits>,
    store: Arc<dyn UsageStore>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, ServiceLimits>, store: Arc<dyn UsageStore>) -> Self {
        debug!(services = limits.len(), "rate limiter initialized");
        Self { limits, store }
    }

    /// Configured services, sorted by name.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.limits.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn limits(&self, service: &str) -> Option<&ServiceLimits> {
        self.limits.get(service)
    }

    /// Credits an operation costs on `service`. Unknown services cost 1.
    pub fn cost_of(&self, service: &str, operation: &str) -> u64 {
        self.limits
            .get(service)
            .map(|l| l.cost_of(operation))
            .unwrap_or(1)
    }

    /// Whether a call costing `expected_cost` credits may be made now.
    pub async fn can_make_request(&self, service: &str, expected_cost: u64) -> bool {
        self.check(service, expected_cost).await.is_allowed()
    }

    /// Admission check with the reason for a denial.
    pub async fn check(&self, service: &str, expected_cost: u64) -> Admission {
        self.check_at(service, expected_cost, common::time::now_millis())
            .await
    }

    /// Admission check evaluated at an explicit unix-millisecond instant.
    pub async fn check_at(&self, service: &str, expected_cost: u64, now: u64) -> Admission {
        let admission = self.evaluate(service, expected_cost, now).await;
        if let Admission::Denied {
            reason,
            retry_after,
        } = &admission
        {
            debug!(
                service,
                reason = reason.label(),
                retry_after_ms = retry_after.as_millis() as u64,
                "request denied by rate limiter"
            );
            metrics::counter!(
                "ratelimit_denied_total",
                "service" => service.to_string(),
                "reason" => reason.label()
            )
            .increment(1);
        }
        admission
    }

    async fn evaluate(&self, service: &str, expected_cost: u64, now: u64) -> Admission {
        let Some(limits) = self.limits.get(service) else {
            warn!(service, "admission check for unconfigured service, denying");
            return Admission::Denied {
                reason: Denial::UnknownService,
                retry_after: Duration::ZERO,
            };
        };

        for (window, limit) in limits.enforced_windows() {
            let totals = match self.store.totals_since(service, window.since(now)).await {
                Ok(t) => t,
                Err(e) => return store_unavailable(service, &e),
            };
            if totals.requests >= limit {
                return Admission::Denied {
                    reason: Denial::WindowFull {
                        window,
                        used: totals.requests,
                        limit,
                    },
                    retry_after: self
                        .reset_after(service, window, now, totals.requests - limit)
                        .await,
                };
            }
        }

        if let Some(budget) = limits.monthly_credits {
            let used = match self
                .store
                .totals_since(service, Window::Month.since(now))
                .await
            {
                Ok(t) => t.credits,
                Err(e) => return store_unavailable(service, &e),
            };
            let remaining = budget.saturating_sub(used);
            if expected_cost > remaining {
                return Admission::Denied {
                    reason: Denial::InsufficientCredits {
                        remaining,
                        requested: expected_cost,
                    },
                    retry_after: self.reset_after(service, Window::Month, now, 0).await,
                };
            }
        }

        Admission::Allowed
    }

    /// Like `check`, but a denial becomes `Error::QuotaExceeded` so handlers
    /// can propagate it with `?`.
    pub async fn ensure_allowed(&self, service: &str, expected_cost: u64) -> Result<()> {
        match self.check(service, expected_cost).await {
            Admission::Allowed => Ok(()),
            Admission::Denied {
                reason: Denial::UnknownService,
                ..
            } => Err(Error::UnknownService(service.to_string())),
            Admission::Denied {
                reason,
                retry_after,
            } => Err(Error::QuotaExceeded {
                service: service.to_string(),
                reason: reason.describe(),
                retry_after,
            }),
        }
    }

    /// Record a successful call. Call only after the work was performed.
    pub async fn record_request(&self, service: &str, credits_used: u64) -> Result<()> {
        self.record(UsageRecord::success(
            service,
            credits_used,
            common::time::now_millis(),
        ))
        .await
    }

    /// Record a failed call attempt. It still counts toward request windows.
    pub async fn record_failure(&self, service: &str, credits_used: u64, error: &str) -> Result<()> {
        self.record(UsageRecord::failure(
            service,
            credits_used,
            error,
            common::time::now_millis(),
        ))
        .await
    }

    /// Append a fully formed record (explicit timestamp).
    pub async fn record(&self, record: UsageRecord) -> Result<()> {
        let service = record.service_name.clone();
        let success = record.success;
        if let Err(e) = self.store.append(record).await {
            warn!(service, error = %e, "failed to record usage");
            return Err(e);
        }
        metrics::counter!(
            "ratelimit_usage_recorded_total",
            "service" => service,
            "success" => if success { "true" } else { "false" }
        )
        .increment(1);
        Ok(())
    }

    /// Time until the oldest record in `window` ages out.
    ///
    /// Zero when the window is empty or the store cannot be read.
    pub async fn time_until_reset(&self, service: &str, window: Window) -> Duration {
        self.reset_after(service, window, common::time::now_millis(), 0)
            .await
    }

    pub async fn time_until_reset_at(&self, service: &str, window: Window, now: u64) -> Duration {
        self.reset_after(service, window, now, 0).await
    }

    /// Wait until `skip + 1` records have left `window`.
    async fn reset_after(&self, service: &str, window: Window, now: u64, skip: u64) -> Duration {
        match self
            .store
            .nth_oldest_since(service, window.since(now), skip)
            .await
        {
            Ok(Some(oldest)) => {
                Duration::from_millis((oldest + window.as_millis()).saturating_sub(now))
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!(service, window = %window, error = %e, "usage store unavailable, reporting no wait");
                Duration::ZERO
            }
        }
    }

    /// Credits left in the trailing 30-day budget, if one is configured.
    pub async fn remaining_credits(&self, service: &str) -> Option<u64> {
        self.usage(service).await.and_then(|u| u.credits_remaining)
    }

    /// Consumption snapshot for one service.
    pub async fn usage(&self, service: &str) -> Option<ServiceUsage> {
        self.usage_at(service, common::time::now_millis()).await
    }

    pub async fn usage_at(&self, service: &str, now: u64) -> Option<ServiceUsage> {
        let limits = self.limits.get(service)?;
        let mut windows = Vec::with_capacity(Window::ALL.len());
        let mut credits_used = 0;

        for window in Window::ALL {
            let totals = match self.store.totals_since(service, window.since(now)).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(service, error = %e, "usage store unavailable, reporting zero usage");
                    Default::default()
                }
            };
            if window == Window::Month {
                credits_used = totals.credits;
            }
            windows.push(WindowUsage {
                window,
                requests: totals.requests,
                limit: limits.limit(window),
                resets_in_secs: self.reset_after(service, window, now, 0).await.as_secs(),
            });
        }

        Some(ServiceUsage {
            service: service.to_string(),
            windows,
            credits_used,
            monthly_credits: limits.monthly_credits,
            credits_remaining: limits
                .monthly_credits
                .map(|budget| budget.saturating_sub(credits_used)),
        })
    }

    /// Usage of every configured service, keyed by name.
    pub async fn stats(&self) -> serde_json::Value {
        let mut services = serde_json::Map::new();
        for name in self.services() {
            if let Some(usage) = self.usage(name).await {
                services.insert(
                    name.to_string(),
                    serde_json::to_value(usage).unwrap_or_default(),
                );
            }
        }
        serde_json::Value::Object(services)
    }

    /// Drop records that no window can see any more.
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = Window::Month.since(common::time::now_millis());
        let removed = self.store.prune_before(cutoff).await?;
        if removed > 0 {
            debug!(removed, "pruned usage records");
        }
        Ok(removed)
    }
}

fn store_unavailable(service: &str, error: &Error) -> Admission {
    warn!(service, error = %error, "usage store unavailable, denying request");
    Admission::Denied {
        reason: Denial::StoreUnavailable,
        retry_after: Duration::from_secs(1),
    }
}
