//! Isolated PostgreSQL schemas for repository tests.
//!
//! Each [`TestDatabase`] creates a fresh schema on the server named by
//! `DATABASE_URL` and pins every pooled connection to it through
//! `search_path`, so tests sharing one server never see each other's rows.
//! Without `DATABASE_URL` the constructor returns `None` and the caller
//! skips.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use staysync_core::storage::{schema, Storage};
use staysync_delivery::storage::PostgresStorage;
use uuid::Uuid;

/// A private schema with the staysync tables applied.
pub struct TestDatabase {
    pool: PgPool,
    admin: PgPool,
    schema: String,
}

impl TestDatabase {
    /// Connects to `DATABASE_URL` and prepares a fresh schema.
    ///
    /// Returns `Ok(None)` when `DATABASE_URL` is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or the schema cannot
    /// be created.
    pub async fn from_env() -> Result<Option<Self>> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            tracing::warn!("DATABASE_URL not set, skipping PostgreSQL test");
            return Ok(None);
        };

        let schema = format!("staysync_test_{}", Uuid::new_v4().simple());

        let admin = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        admin
            .execute(format!("CREATE SCHEMA \"{schema}\"").as_str())
            .await
            .context("Failed to create test schema")?;

        let search_path = format!("SET search_path TO \"{schema}\"");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    conn.execute(search_path.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .context("Failed to connect to test schema")?;

        schema::apply(&pool).await.context("Failed to apply schema")?;

        Ok(Some(Self { pool, admin, schema }))
    }

    /// Returns the pool pinned to this schema.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Repositories over this schema.
    pub fn storage(&self) -> Arc<Storage> {
        Arc::new(Storage::new(self.pool()))
    }

    /// The pipeline's storage adapter over this schema.
    pub fn reliability_storage(&self) -> PostgresStorage {
        PostgresStorage::new(self.storage())
    }

    /// Drops the schema and closes both pools.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be dropped.
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        self.admin
            .execute(format!("DROP SCHEMA \"{}\" CASCADE", self.schema).as_str())
            .await
            .context("Failed to drop test schema")?;
        self.admin.close().await;
        Ok(())
    }
}
