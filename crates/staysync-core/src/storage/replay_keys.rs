//! Repository for webhook anti-replay keys.
//!
//! Behaves as a key-value store with TTL: a key can be remembered again
//! only after its previous entry expired.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;

/// Repository for replay key operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records a key, returning false if an unexpired entry already exists.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn remember(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let stored: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO replay_keys (key, expires_at)
            VALUES ($1, $3)
            ON CONFLICT (key) DO UPDATE SET expires_at = EXCLUDED.expires_at
            WHERE replay_keys.expires_at <= $2
            RETURNING key
            ",
        )
        .bind(key)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(stored.is_some())
    }

    /// Deletes keys whose expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM replay_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
