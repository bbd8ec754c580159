//! Repository for circuit breaker rows.
//!
//! One row per downstream service. State changes go through
//! [`Repository::update_with`], which applies the transition under a row
//! lock so concurrent nodes never lose a failure or success count.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{error::Result, models::CircuitRecord};

/// Repository for circuit breaker operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds the circuit for a service.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, service: &str) -> Result<Option<CircuitRecord>> {
        let record = sqlx::query_as::<_, CircuitRecord>(
            r"
            SELECT service, state, failure_count, success_count, failure_threshold,
                   success_threshold, recovery_timeout_seconds, opened_at, updated_at
            FROM circuits
            WHERE service = $1
            ",
        )
        .bind(service)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Lists every known circuit ordered by service name.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<CircuitRecord>> {
        let records = sqlx::query_as::<_, CircuitRecord>(
            r"
            SELECT service, state, failure_count, success_count, failure_threshold,
                   success_threshold, recovery_timeout_seconds, opened_at, updated_at
            FROM circuits
            ORDER BY service
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Applies `update` to the circuit row under a row lock.
    ///
    /// The row is created from `seed` if it does not exist yet. Returns the
    /// record as persisted and the closure's output.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn update_with<F, R>(&self, seed: &CircuitRecord, update: F) -> Result<(CircuitRecord, R)>
    where
        F: FnOnce(&mut CircuitRecord) -> R,
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO circuits (
                service, state, failure_count, success_count, failure_threshold,
                success_threshold, recovery_timeout_seconds, opened_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (service) DO NOTHING
            ",
        )
        .bind(&seed.service)
        .bind(seed.state)
        .bind(seed.failure_count)
        .bind(seed.success_count)
        .bind(seed.failure_threshold)
        .bind(seed.success_threshold)
        .bind(seed.recovery_timeout_seconds)
        .bind(seed.opened_at)
        .bind(seed.updated_at)
        .execute(&mut *tx)
        .await?;

        let mut record = Self::lock_row(&mut tx, &seed.service).await?;
        let output = update(&mut record);

        sqlx::query(
            r"
            UPDATE circuits
            SET state = $2, failure_count = $3, success_count = $4, failure_threshold = $5,
                success_threshold = $6, recovery_timeout_seconds = $7, opened_at = $8,
                updated_at = $9
            WHERE service = $1
            ",
        )
        .bind(&record.service)
        .bind(record.state)
        .bind(record.failure_count)
        .bind(record.success_count)
        .bind(record.failure_threshold)
        .bind(record.success_threshold)
        .bind(record.recovery_timeout_seconds)
        .bind(record.opened_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((record, output))
    }

    async fn lock_row(tx: &mut Transaction<'_, Postgres>, service: &str) -> Result<CircuitRecord> {
        let record = sqlx::query_as::<_, CircuitRecord>(
            r"
            SELECT service, state, failure_count, success_count, failure_threshold,
                   success_threshold, recovery_timeout_seconds, opened_at, updated_at
            FROM circuits
            WHERE service = $1
            FOR UPDATE
            ",
        )
        .bind(service)
        .fetch_one(&mut **tx)
        .await?;

        Ok(record)
    }
}
