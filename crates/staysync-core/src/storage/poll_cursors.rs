//! Repository for poller cursors and traffic statistics.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::PollCursor};

const CURSOR_COLUMNS: &str = r"
    name, last_continuous_poll_at, last_successful_continuous_poll_at, last_deep_check_at,
    last_successful_deep_check_at, last_recovery_at, traffic_checks, traffic_total_lag_seconds,
    traffic_max_lag_seconds, traffic_recoveries, updated_at
";

/// Repository for poll cursor operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a cursor by name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, name: &str) -> Result<Option<PollCursor>> {
        let sql = format!("SELECT {CURSOR_COLUMNS} FROM poll_cursors WHERE name = $1");
        let cursor =
            sqlx::query_as::<_, PollCursor>(&sql).bind(name).fetch_optional(&*self.pool).await?;

        Ok(cursor)
    }

    /// Applies `update` to the cursor under a row lock, creating it from
    /// `seed` when absent. Returns the cursor as persisted.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn update_with<F>(&self, seed: &PollCursor, update: F) -> Result<PollCursor>
    where
        F: FnOnce(&mut PollCursor),
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO poll_cursors (name, updated_at)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            ",
        )
        .bind(&seed.name)
        .bind(seed.updated_at)
        .execute(&mut *tx)
        .await?;

        let sql = format!("SELECT {CURSOR_COLUMNS} FROM poll_cursors WHERE name = $1 FOR UPDATE");
        let mut cursor =
            sqlx::query_as::<_, PollCursor>(&sql).bind(&seed.name).fetch_one(&mut *tx).await?;

        update(&mut cursor);

        sqlx::query(
            r"
            UPDATE poll_cursors
            SET last_continuous_poll_at = $2, last_successful_continuous_poll_at = $3,
                last_deep_check_at = $4, last_successful_deep_check_at = $5,
                last_recovery_at = $6, traffic_checks = $7, traffic_total_lag_seconds = $8,
                traffic_max_lag_seconds = $9, traffic_recoveries = $10, updated_at = $11
            WHERE name = $1
            ",
        )
        .bind(&cursor.name)
        .bind(cursor.last_continuous_poll_at)
        .bind(cursor.last_successful_continuous_poll_at)
        .bind(cursor.last_deep_check_at)
        .bind(cursor.last_successful_deep_check_at)
        .bind(cursor.last_recovery_at)
        .bind(cursor.traffic_checks)
        .bind(cursor.traffic_total_lag_seconds)
        .bind(cursor.traffic_max_lag_seconds)
        .bind(cursor.traffic_recoveries)
        .bind(cursor.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(cursor)
    }
}
