//! Repository for named scheduler locks.
//!
//! A lock row is taken over only once its `expires_at` has passed, so a
//! node that crashes mid-cycle blocks others for at most the lock TTL.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{error::Result, models::SchedulerLock};

/// Repository for scheduler lock operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Takes the lock if it is free or expired.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO scheduler_locks (name, owner, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET owner = EXCLUDED.owner, acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE scheduler_locks.expires_at <= $3
            RETURNING name
            ",
        )
        .bind(name)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    /// Releases the lock if `owner` still holds it.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds the current holder of a lock.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, name: &str) -> Result<Option<SchedulerLock>> {
        let lock = sqlx::query_as::<_, SchedulerLock>(
            "SELECT name, owner, acquired_at, expires_at FROM scheduler_locks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(lock)
    }

    /// Deletes locks whose expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
