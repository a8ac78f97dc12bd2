//! Append-only usage log
//!
//! One `UsageRecord` per external call attempt. Records are never updated;
//! they are inserted after the call and pruned once older than the longest
//! window. Aggregation is always "everything strictly after `since`".

mod memory;
mod sqlite;

pub use memory::MemoryUsageStore;
pub use sqlite::SqliteUsageStore;

use common::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One external call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub service_name: String,
    /// Unix milliseconds when the call completed.
    pub timestamp: u64,
    pub credits_used: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl UsageRecord {
    pub fn success(service: &str, credits_used: u64, timestamp: u64) -> Self {
        Self {
            service_name: service.to_string(),
            timestamp,
            credits_used,
            success: true,
            error_message: None,
        }
    }

    pub fn failure(service: &str, credits_used: u64, error: &str, timestamp: u64) -> Self {
        Self {
            service_name: service.to_string(),
            timestamp,
            credits_used,
            success: false,
            error_message: Some(error.to_string()),
        }
    }
}

/// Aggregate of records in a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub credits: u64,
}

/// Storage backend for the usage log.
///
/// Uses boxed futures so the limiter can hold an `Arc<dyn UsageStore>`.
pub trait UsageStore: Send + Sync {
    /// Append one record.
    fn append(&self, record: UsageRecord) -> BoxFuture<'_, Result<()>>;

    /// Requests and credits for `service` with `timestamp > since`.
    fn totals_since<'a>(&'a self, service: &'a str, since: u64)
    -> BoxFuture<'a, Result<UsageTotals>>;

    /// Timestamp of the `n`-th oldest (0-based) record for `service` with
    /// `timestamp > since`.
    fn nth_oldest_since<'a>(&'a self, service: &'a str, since: u64, n: u64)
    -> BoxFuture<'a, Result<Option<u64>>>;

    /// Delete every record with `timestamp <= cutoff`. Returns rows removed.
    fn prune_before(&self, cutoff: u64) -> BoxFuture<'_, Result<u64>>;
}
