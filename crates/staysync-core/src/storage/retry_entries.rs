//! Repository for the durable retry queue.
//!
//! Rows exist only while an entry is queued. Claiming sets a lease
//! (`claimed_until`) inside a `FOR UPDATE SKIP LOCKED` transaction so two
//! overlapping retry passes never pick up the same entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{RetryEntry, RetryStatus},
};

const RETRY_COLUMNS: &str = r"
    id, service, operation_type, priority, payload, dedupe_key, scheduled_retry_at,
    attempts, max_attempts, last_error, status, claimed_until, created_at, updated_at
";

/// Repository for retry queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an entry unless one with the same dedupe key is queued.
    ///
    /// Returns the stored entry and whether it was inserted by this call.
    ///
    /// # Errors
    ///
    /// Returns error if insert or lookup fails.
    pub async fn insert_if_absent(&self, entry: &RetryEntry) -> Result<(RetryEntry, bool)> {
        let sql = format!(
            r"
            INSERT INTO retry_entries ({RETRY_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING {RETRY_COLUMNS}
            "
        );
        let inserted = sqlx::query_as::<_, RetryEntry>(&sql)
            .bind(entry.id)
            .bind(&entry.service)
            .bind(&entry.operation_type)
            .bind(entry.priority)
            .bind(&entry.payload)
            .bind(&entry.dedupe_key)
            .bind(entry.scheduled_retry_at)
            .bind(entry.attempts)
            .bind(entry.max_attempts)
            .bind(&entry.last_error)
            .bind(entry.status)
            .bind(entry.claimed_until)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .fetch_optional(&*self.pool)
            .await?;

        if let Some(inserted) = inserted {
            return Ok((inserted, true));
        }

        let sql = format!("SELECT {RETRY_COLUMNS} FROM retry_entries WHERE dedupe_key = $1");
        let existing = sqlx::query_as::<_, RetryEntry>(&sql)
            .bind(&entry.dedupe_key)
            .fetch_one(&*self.pool)
            .await?;

        Ok((existing, false))
    }

    /// Claims due entries under a lease.
    ///
    /// Entries are due when `scheduled_retry_at <= now`, attempts remain,
    /// and no other pass holds an unexpired lease. Results are ordered by
    /// priority then due time.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RetryEntry>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM retry_entries
            WHERE status = 'queued'
              AND scheduled_retry_at <= $1
              AND attempts < max_attempts
              AND (claimed_until IS NULL OR claimed_until <= $1)
            ORDER BY priority ASC, scheduled_retry_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let sql = format!(
            "UPDATE retry_entries SET claimed_until = $2 WHERE id = ANY($1) RETURNING {RETRY_COLUMNS}"
        );
        let mut entries = sqlx::query_as::<_, RetryEntry>(&sql)
            .bind(&ids)
            .bind(lease_until)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        entries.sort_by_key(|entry| (entry.priority, entry.scheduled_retry_at));
        Ok(entries)
    }

    /// Deletes an entry, returning it with the terminal status applied.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn remove(&self, id: Uuid, status: RetryStatus) -> Result<Option<RetryEntry>> {
        let sql = format!("DELETE FROM retry_entries WHERE id = $1 RETURNING {RETRY_COLUMNS}");
        let removed =
            sqlx::query_as::<_, RetryEntry>(&sql).bind(id).fetch_optional(&*self.pool).await?;

        Ok(removed.map(|mut entry| {
            entry.status = status;
            entry
        }))
    }

    /// Records a failed attempt and releases the lease.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reschedule(
        &self,
        id: Uuid,
        attempts: i32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE retry_entries
            SET attempts = $2, scheduled_retry_at = $3, last_error = $4,
                claimed_until = NULL, updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(attempts)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Moves an entry's schedule without consuming an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn defer(&self, id: Uuid, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r"
            UPDATE retry_entries
            SET scheduled_retry_at = $2, claimed_until = NULL, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Lists queued entries in processing order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<RetryEntry>> {
        let sql = format!(
            "SELECT {RETRY_COLUMNS} FROM retry_entries ORDER BY priority ASC, scheduled_retry_at ASC"
        );
        let entries = sqlx::query_as::<_, RetryEntry>(&sql).fetch_all(&*self.pool).await?;

        Ok(entries)
    }
}
