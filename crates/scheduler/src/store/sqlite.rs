//! SQLite-backed job queue shared by every worker process on the host

use common::BoxFuture;
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

use super::{JobCounts, JobStore, STALE_MESSAGE};
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobStatus, NewJob};
use crate::transition::Transition;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    scheduled_at INTEGER,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    error_message TEXT,
    result TEXT
)
"#;

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_scheduled ON jobs (status, scheduled_at)";

const COLUMNS: &str = "id, job_type, payload, priority, status, attempts, max_attempts, \
    scheduled_at, created_at, started_at, completed_at, error_message, result";

/// Row as stored. JSON columns are TEXT, timestamps INTEGER unix ms.
#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    payload: String,
    priority: i64,
    status: String,
    attempts: i64,
    max_attempts: i64,
    scheduled_at: Option<i64>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    error_message: Option<String>,
    result: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self> {
        let corrupt = |message: String| Error::CorruptRow {
            id: row.id,
            message,
        };
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status {}", row.status)))?;
        let payload: Value = serde_json::from_str(&row.payload)
            .map_err(|e| corrupt(format!("payload: {e}")))?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| corrupt(format!("result: {e}")))?;

        Ok(Job {
            id: row.id,
            job_type: row.job_type,
            payload,
            priority: row.priority,
            status,
            attempts: to_u32(row.attempts),
            max_attempts: to_u32(row.max_attempts),
            scheduled_at: row.scheduled_at.map(to_u64),
            created_at: to_u64(row.created_at),
            started_at: row.started_at.map(to_u64),
            completed_at: row.completed_at.map(to_u64),
            error_message: row.error_message,
            result,
        })
    }
}

fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

/// Decode rows, setting aside the ones that no longer parse.
fn decode_rows(rows: Vec<JobRow>) -> (Vec<Job>, Vec<(JobId, String)>) {
    let mut jobs = Vec::with_capacity(rows.len());
    let mut corrupt = Vec::new();
    for row in rows {
        match Job::try_from(row) {
            Ok(job) => jobs.push(job),
            Err(Error::CorruptRow { id, message }) => {
                warn!(job_id = id, error = %message, "skipping undecodable job row");
                corrupt.push((id, message));
            }
            Err(e) => warn!(error = %e, "skipping undecodable job row"),
        }
    }
    (jobs, corrupt)
}

/// Job queue stored in the `jobs` table.
///
/// Claims and transitions are single conditional UPDATEs, so concurrent
/// workers on other connections or processes cannot both win.
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap a pool and make sure the table exists.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        debug!("jobs table ready");
        Ok(Self { pool })
    }
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, job: NewJob, now: u64) -> BoxFuture<'_, Result<JobId>> {
        Box::pin(async move {
            let result = sqlx::query(
                r#"
                INSERT INTO jobs (job_type, payload, priority, status, attempts, max_attempts, scheduled_at, created_at)
                VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)
                "#,
            )
            .bind(&job.job_type)
            .bind(job.payload.to_string())
            .bind(job.priority)
            .bind(i64::from(job.max_attempts))
            .bind(job.scheduled_at.map(|at| at as i64))
            .bind(now as i64)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
    }

    fn fetch_due(&self, now: u64, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, JobRow>(&format!(
                r#"
                SELECT {COLUMNS} FROM jobs
                WHERE status IN ('pending', 'retrying')
                  AND (scheduled_at IS NULL OR scheduled_at <= ?)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT ?
                "#
            ))
            .bind(now as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            let (jobs, corrupt) = decode_rows(rows);
            // Fail them so they stop occupying the head of the queue.
            for (id, message) in corrupt {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'failed', completed_at = ?, error_message = ?
                    WHERE id = ? AND status IN ('pending', 'retrying')
                    "#,
                )
                .bind(now as i64)
                .bind(format!("undecodable job row: {message}"))
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            Ok(jobs)
        })
    }

    fn claim(&self, id: JobId, now: u64) -> BoxFuture<'_, Result<Option<Job>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, JobRow>(&format!(
                r#"
                UPDATE jobs SET status = 'processing', started_at = ?
                WHERE id = ? AND status IN ('pending', 'retrying')
                  AND (scheduled_at IS NULL OR scheduled_at <= ?)
                RETURNING {COLUMNS}
                "#
            ))
            .bind(now as i64)
            .bind(id)
            .bind(now as i64)
            .fetch_optional(&self.pool)
            .await?;
            row.map(Job::try_from).transpose()
        })
    }

    fn apply<'a>(&'a self, id: JobId, transition: &'a Transition) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let query = match transition {
                Transition::Complete {
                    result,
                    completed_at,
                } => sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'completed', completed_at = ?, result = ?, error_message = NULL
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
                .bind(*completed_at as i64)
                .bind(result.to_string()),
                Transition::Retry {
                    attempts,
                    scheduled_at,
                    error,
                } => sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'retrying', attempts = ?, scheduled_at = ?, error_message = ?
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
                .bind(i64::from(*attempts))
                .bind(*scheduled_at as i64)
                .bind(error.as_str()),
                Transition::Defer {
                    scheduled_at,
                    reason,
                } => sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'retrying', scheduled_at = ?, error_message = ?
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
                .bind(*scheduled_at as i64)
                .bind(reason.as_str()),
                Transition::Fail {
                    attempts,
                    completed_at,
                    error,
                } => sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'failed', attempts = ?, completed_at = ?, error_message = ?
                    WHERE id = ? AND status = 'processing'
                    "#,
                )
                .bind(i64::from(*attempts))
                .bind(*completed_at as i64)
                .bind(error.as_str()),
            };
            let result = query.bind(id).execute(&self.pool).await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn get(&self, id: JobId) -> BoxFuture<'_, Result<Option<Job>>> {
        Box::pin(async move {
            let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(Job::try_from).transpose()
        })
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> BoxFuture<'_, Result<Vec<Job>>> {
        Box::pin(async move {
            let rows = match status {
                Some(status) => {
                    sqlx::query_as::<_, JobRow>(&format!(
                        "SELECT {COLUMNS} FROM jobs WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ?"
                    ))
                    .bind(status.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, JobRow>(&format!(
                        "SELECT {COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?"
                    ))
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(decode_rows(rows).0)
        })
    }

    fn counts(&self) -> BoxFuture<'_, Result<JobCounts>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, (String, i64)>(
                "SELECT status, COUNT(*) FROM jobs GROUP BY status",
            )
            .fetch_all(&self.pool)
            .await?;
            let mut counts = JobCounts::default();
            for (status, n) in rows {
                if let Some(status) = JobStatus::parse(&status) {
                    counts.add(status, to_u64(n));
                }
            }
            Ok(counts)
        })
    }

    fn recover_stale(&self, started_before: u64, now: u64) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            // SET expressions see the pre-update row, so `attempts + 1` is the
            // new count in every clause.
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'retrying' END,
                    completed_at = CASE WHEN attempts + 1 >= max_attempts THEN ? ELSE NULL END,
                    scheduled_at = NULL,
                    attempts = attempts + 1,
                    error_message = ?
                WHERE status = 'processing' AND (started_at IS NULL OR started_at <= ?)
                "#,
            )
            .bind(now as i64)
            .bind(STALE_MESSAGE)
            .bind(started_before as i64)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
    }

    fn purge_finished(&self, completed_before: u64) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND completed_at <= ?")
                    .bind(completed_before as i64)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Single-connection pool: every `:memory:` connection is its own database.
    async fn store() -> SqliteJobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteJobStore::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn orders_by_priority_then_age() {
        contract::orders_by_priority_then_age(&store().await).await;
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        contract::claim_is_exclusive(&store().await).await;
    }

    #[tokio::test]
    async fn stale_fetch_cannot_skip_backoff() {
        contract::stale_fetch_cannot_skip_backoff(&store().await).await;
    }

    #[tokio::test]
    async fn applies_transitions() {
        contract::applies_transitions(&store().await).await;
    }

    #[tokio::test]
    async fn recovers_and_purges() {
        contract::recovers_and_purges(&store().await).await;
    }

    #[tokio::test]
    async fn counts_and_lists() {
        contract::counts_and_lists(&store().await).await;
    }

    #[tokio::test]
    async fn payload_survives_storage() {
        let store = store().await;
        let payload = serde_json::json!({"domain": "example.com", "depth": [1, 2]});
        let id = store
            .enqueue(NewJob::new("discover_emails", payload.clone()).with_priority(-2), 7)
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.payload, payload);
        assert_eq!(job.priority, -2);
        assert_eq!(job.created_at, 7);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn undecodable_row_does_not_block_the_queue() {
        let store = store().await;
        let broken = store
            .enqueue(NewJob::new("a", serde_json::json!({})).with_priority(9), 0)
            .await
            .unwrap();
        let healthy = store
            .enqueue(NewJob::new("a", serde_json::json!({"ok": true})), 0)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET payload = '{not json' WHERE id = ?")
            .bind(broken)
            .execute(&store.pool)
            .await
            .unwrap();

        let due = store.fetch_due(10, 10).await.unwrap();
        assert_eq!(due.iter().map(|j| j.id).collect::<Vec<_>>(), vec![healthy]);

        let (status, message): (String, String) =
            sqlx::query_as("SELECT status, error_message FROM jobs WHERE id = ?")
                .bind(broken)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(status, "failed");
        assert!(message.contains("payload"));
        assert_eq!(store.fetch_due(10, 10).await.unwrap().len(), 1);
        assert_eq!(store.list(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_status_is_reported() {
        let store = store().await;
        let id = store
            .enqueue(NewJob::new("a", serde_json::json!({})), 0)
            .await
            .unwrap();
        sqlx::query("UPDATE jobs SET status = 'interrupted' WHERE id = ?")
            .bind(id)
            .execute(&store.pool)
            .await
            .unwrap();
        assert!(matches!(
            store.get(id).await,
            Err(Error::CorruptRow { .. })
        ));
    }
}
