//! Execution history persistence
//!
//! Append-only ledger of execution attempts. `append` inserts, `finalize`
//! stamps the terminal outcome exactly once; a record whose `finished_at` is
//! set is never touched again. Everything else is a query.

use chrono::{DateTime, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::types::{ExecutionRecord, ExecutionRow, ExecutionStatus, HistoryFilter, HistoryPage};

const DEFAULT_PAGE_SIZE: i64 = 50;

/// SQLite-backed execution history.
#[derive(Clone)]
pub struct HistoryStore {
    pool: Pool<Sqlite>,
}

impl HistoryStore {
    /// Create the store over an already-migrated pool (see [`crate::db`]).
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Append a new attempt record.
    pub async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_records (
                id, run_id, attachment_id, controller_id, attempt,
                status, started_at, finished_at, error, summary, orphaned
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.run_id.to_string())
        .bind(record.attachment_id.to_string())
        .bind(record.controller_id.to_string())
        .bind(record.attempt as i64)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(&record.error)
        .bind(&record.summary)
        .bind(record.orphaned)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a record by ID.
    pub async fn get(&self, id: Uuid) -> Result<ExecutionRecord> {
        let row: ExecutionRow = sqlx::query_as("SELECT * FROM execution_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("execution record", id))?;

        row.try_into()
    }

    /// Flip a still-armed Scheduled record to Running with the actual start
    /// time. Returns `false` when the record was cancelled (or already moved
    /// on) in the meantime.
    pub async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_records SET status = 'running', started_at = ?
            WHERE id = ? AND status = 'scheduled' AND finished_at IS NULL
            "#,
        )
        .bind(started_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Stamp the terminal outcome on an open record. Returns `false` when
    /// the record is gone or already finalized; finalized records are never
    /// rewritten.
    pub async fn finalize(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        summary: Option<&str>,
        orphaned: bool,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let result = sqlx::query(
            r#"
            UPDATE execution_records
            SET status = ?, finished_at = ?, error = ?, summary = ?, orphaned = ?
            WHERE id = ? AND finished_at IS NULL
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(error)
        .bind(summary)
        .bind(orphaned)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Non-terminal records for an attachment (the "already running" check).
    pub async fn open_records(&self, attachment_id: Uuid) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM execution_records
            WHERE attachment_id = ? AND finished_at IS NULL
            ORDER BY started_at DESC
            "#,
        )
        .bind(attachment_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// All non-terminal records, used by startup recovery.
    pub async fn non_terminal(&self) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT * FROM execution_records WHERE finished_at IS NULL ORDER BY started_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| r.try_into()).collect()
    }

    /// Delete not-yet-started Scheduled records for an attachment (detach
    /// side-effect). Returns how many were cancelled.
    pub async fn cancel_scheduled(&self, attachment_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM execution_records WHERE attachment_id = ? AND status = 'scheduled'",
        )
        .bind(attachment_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Query records ordered by `started_at` descending, paginated.
    pub async fn query(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let offset = filter.offset.unwrap_or(0).max(0);

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM execution_records WHERE 1 = 1");
        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM execution_records WHERE 1 = 1");

        for builder in [&mut select, &mut count] {
            if let Some(attachment_id) = filter.attachment_id {
                builder
                    .push(" AND attachment_id = ")
                    .push_bind(attachment_id.to_string());
            }
            if let Some(controller_id) = filter.controller_id {
                builder
                    .push(" AND controller_id = ")
                    .push_bind(controller_id.to_string());
            }
            if let Some(status) = filter.status {
                builder.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(since) = filter.since {
                builder.push(" AND started_at >= ").push_bind(since);
            }
            if let Some(until) = filter.until {
                builder.push(" AND started_at < ").push_bind(until);
            }
        }

        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        select
            .push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows: Vec<ExecutionRow> = select.build_query_as().fetch_all(&self.pool).await?;
        let records = rows
            .into_iter()
            .map(|r| r.try_into())
            .collect::<Result<Vec<ExecutionRecord>>>()?;

        Ok(HistoryPage {
            records,
            total,
            limit,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;

    async fn store() -> HistoryStore {
        let pool = db::connect_in_memory().await.unwrap();
        HistoryStore::new(pool)
    }

    fn running_record(attachment_id: Uuid, attempt: u32) -> ExecutionRecord {
        ExecutionRecord::started(Uuid::new_v4(), attachment_id, Uuid::new_v4(), attempt, Utc::now())
    }

    #[tokio::test]
    async fn append_and_finalize() {
        let store = store().await;
        let record = running_record(Uuid::new_v4(), 1);
        store.append(&record).await.unwrap();

        let finalized = store
            .finalize(record.id, ExecutionStatus::Success, None, Some("12 rows"), false)
            .await
            .unwrap();
        assert!(finalized);

        let fetched = store.get(record.id).await.unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Success);
        assert_eq!(fetched.summary.as_deref(), Some("12 rows"));
        assert!(fetched.finished_at.is_some());
    }

    #[tokio::test]
    async fn finalized_records_are_immutable() {
        let store = store().await;
        let record = running_record(Uuid::new_v4(), 1);
        store.append(&record).await.unwrap();

        store
            .finalize(record.id, ExecutionStatus::Failed, Some("boom"), None, false)
            .await
            .unwrap();

        let touched = store
            .finalize(record.id, ExecutionStatus::Success, None, Some("late"), false)
            .await
            .unwrap();
        assert!(!touched);

        let fetched = store.get(record.id).await.unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn open_records_only_returns_non_terminal() {
        let store = store().await;
        let attachment_id = Uuid::new_v4();

        let open = running_record(attachment_id, 1);
        store.append(&open).await.unwrap();

        let closed = running_record(attachment_id, 1);
        store.append(&closed).await.unwrap();
        store
            .finalize(closed.id, ExecutionStatus::Success, None, None, false)
            .await
            .unwrap();

        let records = store.open_records(attachment_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, open.id);
    }

    #[tokio::test]
    async fn cancel_scheduled_leaves_running_alone() {
        let store = store().await;
        let attachment_id = Uuid::new_v4();

        let pending = ExecutionRecord::scheduled(
            Uuid::new_v4(),
            attachment_id,
            Uuid::new_v4(),
            2,
            Utc::now() + Duration::seconds(30),
        );
        store.append(&pending).await.unwrap();

        let running = running_record(attachment_id, 1);
        store.append(&running).await.unwrap();

        let cancelled = store.cancel_scheduled(attachment_id).await.unwrap();
        assert_eq!(cancelled, 1);
        assert!(store.get(pending.id).await.is_err());
        assert!(store.get(running.id).await.is_ok());
    }

    #[tokio::test]
    async fn mark_running_requires_armed_record() {
        let store = store().await;
        let pending = ExecutionRecord::scheduled(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            2,
            Utc::now(),
        );
        store.append(&pending).await.unwrap();

        assert!(store.mark_running(pending.id, Utc::now()).await.unwrap());
        // Second flip is a no-op: the record is no longer Scheduled.
        assert!(!store.mark_running(pending.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let store = store().await;
        let attachment_id = Uuid::new_v4();
        let controller_id = Uuid::new_v4();
        let run_id = Uuid::new_v4();
        let base = Utc::now();

        for attempt in 1..=3u32 {
            let mut record = ExecutionRecord::started(
                run_id,
                attachment_id,
                controller_id,
                attempt,
                base + Duration::seconds(attempt as i64),
            );
            record.status = ExecutionStatus::Failed;
            record.finished_at = Some(record.started_at + Duration::seconds(1));
            store.append(&record).await.unwrap();
        }

        let other = running_record(Uuid::new_v4(), 1);
        store.append(&other).await.unwrap();

        let page = store
            .query(&HistoryFilter {
                attachment_id: Some(attachment_id),
                limit: Some(2),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.records.len(), 2);
        // Newest first.
        assert_eq!(page.records[0].attempt, 3);
        assert_eq!(page.records[1].attempt, 2);

        let next = store
            .query(&HistoryFilter {
                attachment_id: Some(attachment_id),
                limit: Some(2),
                offset: Some(2),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(next.records.len(), 1);
        assert_eq!(next.records[0].attempt, 1);

        let failed_only = store
            .query(&HistoryFilter {
                status: Some(ExecutionStatus::Failed),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failed_only.total, 3);
    }
}
