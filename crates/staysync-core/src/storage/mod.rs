//! Database access layer implementing the repository pattern for the
//! shared reliability store.
//!
//! Every node of the forwarder reads and mutates the same rows, so each
//! repository exposes atomic primitives (mutate-by-key inside a row lock,
//! insert-if-absent, lease-based claim) instead of read-modify-write pairs.
//!
//! All database operations MUST go through these repositories. Direct SQL
//! queries outside this module are forbidden to maintain consistency.

use std::sync::Arc;

use sqlx::PgPool;

pub mod circuits;
pub mod poll_cursors;
pub mod rate_limits;
pub mod replay_keys;
pub mod reservation_identities;
pub mod retry_entries;
pub mod schema;
pub mod scheduler_locks;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for reservation identities and their aliases.
    pub identities: Arc<reservation_identities::Repository>,

    /// Repository for per-service circuit breaker rows.
    pub circuits: Arc<circuits::Repository>,

    /// Repository for the durable retry queue.
    pub retry_entries: Arc<retry_entries::Repository>,

    /// Repository for fixed-window rate limit counters.
    pub rate_limits: Arc<rate_limits::Repository>,

    /// Repository for poller cursors and traffic statistics.
    pub poll_cursors: Arc<poll_cursors::Repository>,

    /// Repository for named scheduler locks.
    pub scheduler_locks: Arc<scheduler_locks::Repository>,

    /// Repository for webhook anti-replay keys.
    pub replay_keys: Arc<replay_keys::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            identities: Arc::new(reservation_identities::Repository::new(pool.clone())),
            circuits: Arc::new(circuits::Repository::new(pool.clone())),
            retry_entries: Arc::new(retry_entries::Repository::new(pool.clone())),
            rate_limits: Arc::new(rate_limits::Repository::new(pool.clone())),
            poll_cursors: Arc::new(poll_cursors::Repository::new(pool.clone())),
            scheduler_locks: Arc::new(scheduler_locks::Repository::new(pool.clone())),
            replay_keys: Arc::new(replay_keys::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        // Actual database testing requires a running PostgreSQL
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
