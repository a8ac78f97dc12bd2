//! In-process usage log, for tests and single-worker deployments

use common::BoxFuture;
use tokio::sync::RwLock;

use super::{UsageRecord, UsageStore, UsageTotals};
use crate::error::Result;

/// Usage log kept in a `Vec`, appended in call order.
#[derive(Default)]
pub struct MemoryUsageStore {
    records: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl UsageStore for MemoryUsageStore {
    fn append(&self, record: UsageRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.records.write().await.push(record);
            Ok(())
        })
    }

    fn totals_since<'a>(
        &'a self,
        service: &'a str,
        since: u64,
    ) -> BoxFuture<'a, Result<UsageTotals>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let totals = records
                .iter()
                .filter(|r| r.service_name == service && r.timestamp > since)
                .fold(UsageTotals::default(), |acc, r| UsageTotals {
                    requests: acc.requests + 1,
                    credits: acc.credits + r.credits_used,
                });
            Ok(totals)
        })
    }

    fn nth_oldest_since<'a>(
        &'a self,
        service: &'a str,
        since: u64,
        n: u64,
    ) -> BoxFuture<'a, Result<Option<u64>>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let mut stamps: Vec<u64> = records
                .iter()
                .filter(|r| r.service_name == service && r.timestamp > since)
                .map(|r| r.timestamp)
                .collect();
            stamps.sort_unstable();
            Ok(usize::try_from(n).ok().and_then(|i| stamps.get(i).copied()))
        })
    }

    fn prune_before(&self, cutoff: u64) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|r| r.timestamp > cutoff);
            Ok((before - records.len()) as u64)
        })
    }
}
