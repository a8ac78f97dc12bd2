//! SQLite-backed usage log shared by every worker process on the host

use common::BoxFuture;
use sqlx::SqlitePool;
use tracing::debug;

use super::{UsageRecord, UsageStore, UsageTotals};
use crate::error::Result;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    service_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    credits_used INTEGER NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_usage_service_ts ON usage_records (service_name, timestamp)";

/// Usage log stored in the `usage_records` table.
///
/// Timestamps and credits are stored as INTEGER (i64); values above
/// `i64::MAX` never occur for unix milliseconds.
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    /// Wrap a pool and make sure the table exists.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        debug!("usage_records table ready");
        Ok(Self { pool })
    }
}

impl UsageStore for SqliteUsageStore {
    fn append(&self, record: UsageRecord) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO usage_records (service_name, timestamp, credits_used, success, error_message)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.service_name)
            .bind(record.timestamp as i64)
            .bind(record.credits_used as i64)
            .bind(record.success)
            .bind(&record.error_message)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn totals_since<'a>(
        &'a self,
        service: &'a str,
        since: u64,
    ) -> BoxFuture<'a, Result<UsageTotals>> {
        Box::pin(async move {
            let (requests, credits) = sqlx::query_as::<_, (i64, i64)>(
                r#"
                SELECT COUNT(*), COALESCE(SUM(credits_used), 0)
                FROM usage_records
                WHERE service_name = ? AND timestamp > ?
                "#,
            )
            .bind(service)
            .bind(since as i64)
            .fetch_one(&self.pool)
            .await?;
            Ok(UsageTotals {
                requests: requests.max(0) as u64,
                credits: credits.max(0) as u64,
            })
        })
    }

    fn nth_oldest_since<'a>(
        &'a self,
        service: &'a str,
        since: u64,
        n: u64,
    ) -> BoxFuture<'a, Result<Option<u64>>> {
        Box::pin(async move {
            let stamp = sqlx::query_scalar::<_, i64>(
                "SELECT timestamp FROM usage_records WHERE service_name = ? AND timestamp > ? \
                 ORDER BY timestamp ASC LIMIT 1 OFFSET ?",
            )
            .bind(service)
            .bind(since as i64)
            .bind(i64::try_from(n).unwrap_or(i64::MAX))
            .fetch_optional(&self.pool)
            .await?;
            Ok(stamp.map(|ts| ts.max(0) as u64))
        })
    }

    fn prune_before(&self, cutoff: u64) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM usage_records WHERE timestamp <= ?")
                .bind(cutoff as i64)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Single-connection pool: every `:memory:` connection is its own database.
    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn aggregates_within_window() {
        let store = SqliteUsageStore::new(memory_pool().await).await.unwrap();
        store
            .append(UsageRecord::success("hunter", 1, 1_000))
            .await
            .unwrap();
        store
            .append(UsageRecord::success("hunter", 2, 2_000))
            .await
            .unwrap();
        store
            .append(UsageRecord::failure("hunter", 0, "502", 3_000))
            .await
            .unwrap();
        store
            .append(UsageRecord::success("moz", 5, 2_500))
            .await
            .unwrap();

        let totals = store.totals_since("hunter", 1_000).await.unwrap();
        assert_eq!(totals, UsageTotals { requests: 2, credits: 2 });
        assert_eq!(store.nth_oldest_since("hunter", 0, 0).await.unwrap(), Some(1_000));
        assert_eq!(store.nth_oldest_since("hunter", 0, 2).await.unwrap(), Some(3_000));
        assert_eq!(store.nth_oldest_since("hunter", 0, 3).await.unwrap(), None);
        assert_eq!(store.nth_oldest_since("nobody", 0, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn prune_deletes_old_rows() {
        let store = SqliteUsageStore::new(memory_pool().await).await.unwrap();
        for ts in [100, 200, 300] {
            store
                .append(UsageRecord::success("hunter", 1, ts))
                .await
                .unwrap();
        }
        assert_eq!(store.prune_before(200).await.unwrap(), 2);
        let totals = store.totals_since("hunter", 0).await.unwrap();
        assert_eq!(totals.requests, 1);
    }

    #[tokio::test]
    async fn table_creation_is_idempotent() {
        let pool = memory_pool().await;
        SqliteUsageStore::new(pool.clone()).await.unwrap();
        SqliteUsageStore::new(pool).await.unwrap();
    }
}
