//! Per-service limit configuration
//!
//! Limits are plain data loaded from the worker's TOML file, one table per
//! guarded service. Adding a new external API is a config change only.
//!
//! ```toml
//! [rate_limits.hunter]
//! per_minute = 10
//! per_day = 500
//! monthly_credits = 2000
//! default_cost = 1
//!
//! [rate_limits.hunter.costs]
//! domain_search = 1
//! email_verifier = 2
//! ```

use std::collections::HashMap;

use serde::Deserialize;

use crate::window::Window;

/// Request limits and credit costs for one external service.
///
/// A `None` limit means the window is not enforced for this service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceLimits {
    #[serde(default)]
    pub per_minute: Option<u64>,
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
    #[serde(default)]
    pub per_month: Option<u64>,
    /// Credit budget over the trailing 30-day window.
    #[serde(default)]
    pub monthly_credits: Option<u64>,
    /// Credits charged for operations not listed in `costs`.
    #[serde(default = "default_cost")]
    pub default_cost: u64,
    /// Credits charged per named operation.
    #[serde(default)]
    pub costs: HashMap<String, u64>,
}

fn default_cost() -> u64 {
    1
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            per_minute: None,
            per_hour: None,
            per_day: None,
            per_month: None,
            monthly_credits: None,
            default_cost: default_cost(),
            costs: HashMap::new(),
        }
    }
}

impl ServiceLimits {
    /// Configured request limit for a window, if any.
    pub fn limit(&self, window: Window) -> Option<u64> {
        match window {
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
            Window::Month => self.per_month,
        }
    }

    /// Builder-style setter for a window limit.
    pub fn with_limit(mut self, window: Window, limit: u64) -> Self {
        let slot = match window {
            Window::Minute => &mut self.per_minute,
            Window::Hour => &mut self.per_hour,
            Window::Day => &mut self.per_day,
            Window::Month => &mut self.per_month,
        };
        *slot = Some(limit);
        self
    }

    pub fn with_monthly_credits(mut self, credits: u64) -> Self {
        self.monthly_credits = Some(credits);
        self
    }

    pub fn with_cost(mut self, operation: impl Into<String>, credits: u64) -> Self {
        self.costs.insert(operation.into(), credits);
        self
    }

    /// Credits charged for `operation`, falling back to `default_cost`.
    pub fn cost_of(&self, operation: &str) -> u64 {
        self.costs
            .get(operation)
            .copied()
            .unwrap_or(self.default_cost)
    }

    /// Windows that carry a limit, shortest first.
    pub fn enforced_windows(&self) -> impl Iterator<Item = (Window, u64)> + '_ {
        Window::ALL
            .into_iter()
            .filter_map(|w| self.limit(w).map(|l| (w, l)))
    }
}
