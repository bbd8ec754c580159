//! Repository for fixed-window rate limit counters.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::RateLimitWindow};

/// Repository for rate limit window operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds the window for a key.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let window = sqlx::query_as::<_, RateLimitWindow>(
            "SELECT key, window_start, count FROM rate_limit_windows WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(window)
    }

    /// Applies `update` to the window under a row lock, creating it from
    /// `seed` when absent.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn update_with<F, R>(&self, seed: &RateLimitWindow, update: F) -> Result<R>
    where
        F: FnOnce(&mut RateLimitWindow) -> R,
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO rate_limit_windows (key, window_start, count)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            ",
        )
        .bind(&seed.key)
        .bind(seed.window_start)
        .bind(seed.count)
        .execute(&mut *tx)
        .await?;

        let mut window = sqlx::query_as::<_, RateLimitWindow>(
            "SELECT key, window_start, count FROM rate_limit_windows WHERE key = $1 FOR UPDATE",
        )
        .bind(&seed.key)
        .fetch_one(&mut *tx)
        .await?;

        let output = update(&mut window);

        sqlx::query("UPDATE rate_limit_windows SET window_start = $2, count = $3 WHERE key = $1")
            .bind(&window.key)
            .bind(window.window_start)
            .bind(window.count)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(output)
    }

    /// Deletes the window for a key.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_limit_windows WHERE key = $1")
            .bind(key)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
