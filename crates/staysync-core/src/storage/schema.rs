//! Schema for the shared reliability store.
//!
//! Every statement is idempotent so nodes may apply it on each start.

use sqlx::PgPool;

use crate::error::{CoreError, Result};

/// Tables and indexes, each statement idempotent.
pub const SCHEMA: &[(&str, &str)] = &[
    (
        "reservation_identities",
        r"
        CREATE TABLE IF NOT EXISTS reservation_identities (
            id UUID PRIMARY KEY,
            primary_id TEXT NOT NULL,
            processed BOOLEAN NOT NULL DEFAULT FALSE,
            first_seen_at TIMESTAMPTZ NOT NULL,
            processed_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "reservation_aliases",
        r"
        CREATE TABLE IF NOT EXISTS reservation_aliases (
            alias TEXT PRIMARY KEY,
            identity_id UUID NOT NULL REFERENCES reservation_identities(id) ON DELETE CASCADE,
            created_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "reservation_aliases index",
        "CREATE INDEX IF NOT EXISTS idx_reservation_aliases_identity ON reservation_aliases(identity_id)",
    ),
    (
        "circuits",
        r"
        CREATE TABLE IF NOT EXISTS circuits (
            service TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            failure_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_threshold INTEGER NOT NULL,
            success_threshold INTEGER NOT NULL,
            recovery_timeout_seconds BIGINT NOT NULL,
            opened_at TIMESTAMPTZ,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "retry_entries",
        r"
        CREATE TABLE IF NOT EXISTS retry_entries (
            id UUID PRIMARY KEY,
            service TEXT NOT NULL,
            operation_type TEXT NOT NULL,
            priority SMALLINT NOT NULL,
            payload JSONB NOT NULL,
            dedupe_key TEXT NOT NULL UNIQUE,
            scheduled_retry_at TIMESTAMPTZ NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            last_error TEXT,
            status TEXT NOT NULL,
            claimed_until TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "retry_entries index",
        r"
        CREATE INDEX IF NOT EXISTS idx_retry_entries_due
        ON retry_entries(priority, scheduled_retry_at)
        WHERE status = 'queued'
        ",
    ),
    (
        "rate_limit_windows",
        r"
        CREATE TABLE IF NOT EXISTS rate_limit_windows (
            key TEXT PRIMARY KEY,
            window_start TIMESTAMPTZ NOT NULL,
            count BIGINT NOT NULL
        )
        ",
    ),
    (
        "poll_cursors",
        r"
        CREATE TABLE IF NOT EXISTS poll_cursors (
            name TEXT PRIMARY KEY,
            last_continuous_poll_at TIMESTAMPTZ,
            last_successful_continuous_poll_at TIMESTAMPTZ,
            last_deep_check_at TIMESTAMPTZ,
            last_successful_deep_check_at TIMESTAMPTZ,
            last_recovery_at TIMESTAMPTZ,
            traffic_checks BIGINT NOT NULL DEFAULT 0,
            traffic_total_lag_seconds BIGINT NOT NULL DEFAULT 0,
            traffic_max_lag_seconds BIGINT NOT NULL DEFAULT 0,
            traffic_recoveries BIGINT NOT NULL DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "scheduler_locks",
        r"
        CREATE TABLE IF NOT EXISTS scheduler_locks (
            name TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "replay_keys",
        r"
        CREATE TABLE IF NOT EXISTS replay_keys (
            key TEXT PRIMARY KEY,
            expires_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "replay_keys index",
        "CREATE INDEX IF NOT EXISTS idx_replay_keys_expiry ON replay_keys(expires_at)",
    ),
];

/// Creates missing tables and indexes.
///
/// # Errors
///
/// Returns `CoreError::Database` naming the statement that failed.
pub async fn apply(pool: &PgPool) -> Result<()> {
    for (name, statement) in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| CoreError::Database(format!("failed to create {name}: {e}")))?;
    }

    Ok(())
}
