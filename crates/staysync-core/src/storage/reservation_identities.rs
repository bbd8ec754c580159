//! Repository for the dedup identity store.
//!
//! Identities live in `reservation_identities`; every known identifier
//! (primary id included) is a row in `reservation_aliases` pointing at its
//! identity. Merges serialize on per-identifier advisory locks so two nodes
//! seeing overlapping identifiers at the same time converge on one identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{IdentityMerge, ReservationIdentity},
};

#[derive(sqlx::FromRow)]
struct IdentityRow {
    id: Uuid,
    primary_id: String,
    processed: bool,
    first_seen_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    aliases: Vec<String>,
}

impl From<IdentityRow> for ReservationIdentity {
    fn from(row: IdentityRow) -> Self {
        Self {
            id: row.id,
            primary_id: row.primary_id,
            aliases: row.aliases.into_iter().collect(),
            processed: row.processed,
            first_seen_at: row.first_seen_at,
            processed_at: row.processed_at,
            updated_at: row.updated_at,
        }
    }
}

const SELECT_IDENTITY: &str = r"
    SELECT i.id, i.primary_id, i.processed, i.first_seen_at, i.processed_at, i.updated_at,
           COALESCE(
               array_agg(a.alias ORDER BY a.alias) FILTER (WHERE a.alias <> i.primary_id),
               '{}'
           ) AS aliases
    FROM reservation_identities i
    LEFT JOIN reservation_aliases a ON a.identity_id = i.id
";

/// Repository for reservation identity operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds the identity owning a normalized identifier.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_identifier(&self, identifier: &str) -> Result<Option<ReservationIdentity>> {
        let sql = format!(
            "{SELECT_IDENTITY} WHERE i.id = (SELECT identity_id FROM reservation_aliases WHERE alias = $1) GROUP BY i.id"
        );
        let row = sqlx::query_as::<_, IdentityRow>(&sql)
            .bind(identifier)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Finds an identity by its internal id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ReservationIdentity>> {
        self.find_by_id_impl(&*self.pool, id).await
    }

    async fn find_by_id_impl<'e, E>(&self, executor: E, id: Uuid) -> Result<Option<ReservationIdentity>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("{SELECT_IDENTITY} WHERE i.id = $1 GROUP BY i.id");
        let row = sqlx::query_as::<_, IdentityRow>(&sql).bind(id).fetch_optional(executor).await?;

        Ok(row.map(Into::into))
    }

    /// Attaches identifiers to one identity, creating it if none is known.
    ///
    /// Identifiers are expected in priority order; the first becomes the
    /// primary id of a new identity. When the identifiers span several
    /// existing identities they are folded into the oldest one so the
    /// reservation never has two identities. With `mark_processed` the
    /// resulting identity is flagged processed in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for an empty identifier list, or a
    /// database error if the transaction fails.
    pub async fn merge(
        &self,
        identifiers: &[String],
        mark_processed: bool,
        now: DateTime<Utc>,
    ) -> Result<IdentityMerge> {
        let Some(primary) = identifiers.first() else {
            return Err(CoreError::InvalidInput("no identifiers to merge".to_string()));
        };

        let mut sorted = identifiers.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut tx = self.pool.begin().await?;

        // Sorted acquisition keeps concurrent merges deadlock free
        for identifier in &sorted {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(identifier)
                .execute(&mut *tx)
                .await?;
        }

        let owners: Vec<(Uuid, bool)> = sqlx::query_as(
            r"
            SELECT i.id, i.processed
            FROM reservation_identities i
            WHERE i.id IN (SELECT identity_id FROM reservation_aliases WHERE alias = ANY($1))
            ORDER BY i.first_seen_at ASC, i.id ASC
            ",
        )
        .bind(&sorted)
        .fetch_all(&mut *tx)
        .await?;

        let was_processed = owners.iter().any(|(_, processed)| *processed);
        let created = owners.is_empty();

        let identity_id = match owners.first() {
            Some((survivor, _)) => {
                for (other, _) in owners.iter().skip(1) {
                    sqlx::query("UPDATE reservation_aliases SET identity_id = $1 WHERE identity_id = $2")
                        .bind(survivor)
                        .bind(other)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query("DELETE FROM reservation_identities WHERE id = $1")
                        .bind(other)
                        .execute(&mut *tx)
                        .await?;
                }
                if was_processed {
                    sqlx::query(
                        r"
                        UPDATE reservation_identities
                        SET processed = TRUE, processed_at = COALESCE(processed_at, $2)
                        WHERE id = $1
                        ",
                    )
                    .bind(survivor)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                *survivor
            },
            None => {
                let id = Uuid::new_v4();
                sqlx::query(
                    r"
                    INSERT INTO reservation_identities
                        (id, primary_id, processed, first_seen_at, processed_at, updated_at)
                    VALUES ($1, $2, FALSE, $3, NULL, $3)
                    ",
                )
                .bind(id)
                .bind(primary)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                id
            },
        };

        let learned: Vec<String> = sqlx::query_scalar(
            r"
            INSERT INTO reservation_aliases (alias, identity_id, created_at)
            SELECT alias, $2, $3 FROM UNNEST($1::text[]) AS alias
            ON CONFLICT (alias) DO NOTHING
            RETURNING alias
            ",
        )
        .bind(&sorted)
        .bind(identity_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if mark_processed {
            sqlx::query(
                r"
                UPDATE reservation_identities
                SET processed = TRUE, processed_at = COALESCE(processed_at, $2), updated_at = $2
                WHERE id = $1
                ",
            )
            .bind(identity_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        } else if !learned.is_empty() {
            sqlx::query("UPDATE reservation_identities SET updated_at = $2 WHERE id = $1")
                .bind(identity_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        let identity = self
            .find_by_id_impl(&mut *tx, identity_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("identity {identity_id}")))?;

        tx.commit().await?;

        // Preserve caller priority order for reporting
        let learned =
            identifiers.iter().filter(|id| learned.contains(id)).cloned().collect::<Vec<_>>();

        Ok(IdentityMerge { identity, created, learned, was_processed })
    }

    /// Counts stored identities.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM reservation_identities")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
