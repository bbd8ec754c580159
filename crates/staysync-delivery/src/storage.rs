//! Storage abstraction over the shared reliability store.
//!
//! Every component that needs durable state (dedup, breaker, retry queue,
//! rate limiter, poller, replay guard) goes through [`ReliabilityStorage`].
//! The trait only exposes atomic primitives: mutate-by-key closures applied
//! under a lock, identity merge, insert-if-absent, and lease-based claim.
//! That keeps concurrent nodes and overlapping tasks correct without the
//! callers coordinating.
//!
//! Two implementations ship: [`PostgresStorage`] over
//! `staysync_core::storage::Storage` for multi-node deployments, and
//! [`memory::MemoryStorage`] for single-node use and tests.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use staysync_core::{
    error::Result,
    models::{
        CircuitRecord, IdentityMerge, PollCursor, RateLimitWindow, ReservationIdentity, RetryEntry,
        RetryStatus,
    },
};
use uuid::Uuid;

use crate::rate_limit::RateLimitDecision;

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transition applied to a circuit row. Returns a caller-defined flag.
pub type CircuitUpdate = Box<dyn FnOnce(&mut CircuitRecord) -> bool + Send>;

/// Counter update applied to a rate limit window.
pub type WindowUpdate = Box<dyn FnOnce(&mut RateLimitWindow) -> RateLimitDecision + Send>;

/// Bookkeeping update applied to a poll cursor.
pub type CursorUpdate = Box<dyn FnOnce(&mut PollCursor) + Send>;

/// Rows removed by a housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Expired anti-replay keys deleted.
    pub replay_keys: u64,
    /// Expired scheduler locks deleted.
    pub locks: u64,
}

/// Storage operations required by the forwarding pipeline.
pub trait ReliabilityStorage: Send + Sync + 'static {
    /// Verifies the store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;

    /// Finds the identity owning a normalized identifier.
    fn find_identity(&self, identifier: String) -> StorageFuture<'_, Option<ReservationIdentity>>;

    /// Atomically attaches identifiers to one identity.
    ///
    /// Creates the identity if none of the identifiers is known and folds
    /// multiple existing identities into the oldest. Never leaves two
    /// identities sharing an identifier.
    fn merge_identity(
        &self,
        identifiers: Vec<String>,
        mark_processed: bool,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, IdentityMerge>;

    /// Finds the circuit row for a service.
    fn find_circuit(&self, service: String) -> StorageFuture<'_, Option<CircuitRecord>>;

    /// Lists all circuit rows.
    fn list_circuits(&self) -> StorageFuture<'_, Vec<CircuitRecord>>;

    /// Applies a transition to a circuit row under a lock, creating it from
    /// `seed` if absent.
    fn update_circuit(
        &self,
        seed: CircuitRecord,
        update: CircuitUpdate,
    ) -> StorageFuture<'_, (CircuitRecord, bool)>;

    /// Inserts a retry entry unless its dedupe key is already queued.
    ///
    /// Returns the stored entry and whether this call inserted it.
    fn enqueue_retry(&self, entry: RetryEntry) -> StorageFuture<'_, (RetryEntry, bool)>;

    /// Claims up to `limit` due entries, leasing them until `lease_until`.
    ///
    /// Ordered by priority then scheduled time.
    fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<RetryEntry>>;

    /// Deletes a retry entry, returning it with the terminal status applied.
    fn remove_retry(&self, id: Uuid, status: RetryStatus) -> StorageFuture<'_, Option<RetryEntry>>;

    /// Records a failed attempt and releases the lease.
    fn reschedule_retry(
        &self,
        id: Uuid,
        attempts: i32,
        next_retry_at: DateTime<Utc>,
        last_error: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Moves an entry's schedule without consuming an attempt.
    fn defer_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Lists queued retry entries in processing order.
    fn list_retries(&self) -> StorageFuture<'_, Vec<RetryEntry>>;

    /// Finds the window for a rate limit key.
    fn find_rate_window(&self, key: String) -> StorageFuture<'_, Option<RateLimitWindow>>;

    /// Applies a counter update under a lock, creating the window from
    /// `seed` if absent.
    fn update_rate_window(
        &self,
        seed: RateLimitWindow,
        update: WindowUpdate,
    ) -> StorageFuture<'_, RateLimitDecision>;

    /// Clears a rate limit key.
    fn delete_rate_window(&self, key: String) -> StorageFuture<'_, ()>;

    /// Finds a poll cursor.
    fn find_cursor(&self, name: String) -> StorageFuture<'_, Option<PollCursor>>;

    /// Applies an update to a poll cursor under a lock, creating it from
    /// `seed` if absent.
    fn update_cursor(&self, seed: PollCursor, update: CursorUpdate) -> StorageFuture<'_, PollCursor>;

    /// Takes a named lock if it is free or expired.
    fn try_acquire_lock(
        &self,
        name: String,
        owner: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Releases a named lock held by `owner`.
    fn release_lock(&self, name: String, owner: String) -> StorageFuture<'_, bool>;

    /// Records a key with TTL; false if an unexpired entry exists.
    fn remember_replay_key(
        &self,
        key: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Deletes expired replay keys and locks.
    fn purge_expired(&self, now: DateTime<Utc>) -> StorageFuture<'_, PurgeReport>;
}

/// Production storage implementation using PostgreSQL.
///
/// Wraps `staysync_core::storage::Storage`; all database operations go
/// through its repositories.
pub struct PostgresStorage {
    storage: Arc<staysync_core::storage::Storage>,
}

impl PostgresStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<staysync_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl ReliabilityStorage for PostgresStorage {
    fn health_check(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }

    fn find_identity(&self, identifier: String) -> StorageFuture<'_, Option<ReservationIdentity>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.identities.find_by_identifier(&identifier).await })
    }

    fn merge_identity(
        &self,
        identifiers: Vec<String>,
        mark_processed: bool,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, IdentityMerge> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.identities.merge(&identifiers, mark_processed, now).await })
    }

    fn find_circuit(&self, service: String) -> StorageFuture<'_, Option<CircuitRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.circuits.find(&service).await })
    }

    fn list_circuits(&self) -> StorageFuture<'_, Vec<CircuitRecord>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.circuits.list().await })
    }

    fn update_circuit(
        &self,
        seed: CircuitRecord,
        update: CircuitUpdate,
    ) -> StorageFuture<'_, (CircuitRecord, bool)> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.circuits.update_with(&seed, update).await })
    }

    fn enqueue_retry(&self, entry: RetryEntry) -> StorageFuture<'_, (RetryEntry, bool)> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_entries.insert_if_absent(&entry).await })
    }

    fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> StorageFuture<'_, Vec<RetryEntry>> {
        let storage = self.storage.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move { storage.retry_entries.claim_due(now, lease_until, limit).await })
    }

    fn remove_retry(&self, id: Uuid, status: RetryStatus) -> StorageFuture<'_, Option<RetryEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_entries.remove(id, status).await })
    }

    fn reschedule_retry(
        &self,
        id: Uuid,
        attempts: i32,
        next_retry_at: DateTime<Utc>,
        last_error: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.retry_entries.reschedule(id, attempts, next_retry_at, &last_error, now).await
        })
    }

    fn defer_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_entries.defer(id, next_retry_at, now).await })
    }

    fn list_retries(&self) -> StorageFuture<'_, Vec<RetryEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.retry_entries.list().await })
    }

    fn find_rate_window(&self, key: String) -> StorageFuture<'_, Option<RateLimitWindow>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.rate_limits.find(&key).await })
    }

    fn update_rate_window(
        &self,
        seed: RateLimitWindow,
        update: WindowUpdate,
    ) -> StorageFuture<'_, RateLimitDecision> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.rate_limits.update_with(&seed, update).await })
    }

    fn delete_rate_window(&self, key: String) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.rate_limits.delete(&key).await })
    }

    fn find_cursor(&self, name: String) -> StorageFuture<'_, Option<PollCursor>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.poll_cursors.find(&name).await })
    }

    fn update_cursor(&self, seed: PollCursor, update: CursorUpdate) -> StorageFuture<'_, PollCursor> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.poll_cursors.update_with(&seed, update).await })
    }

    fn try_acquire_lock(
        &self,
        name: String,
        owner: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.scheduler_locks.try_acquire(&name, &owner, now, expires_at).await
        })
    }

    fn release_lock(&self, name: String, owner: String) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduler_locks.release(&name, &owner).await })
    }

    fn remember_replay_key(
        &self,
        key: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.replay_keys.remember(&key, now, expires_at).await })
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StorageFuture<'_, PurgeReport> {
        let storage = self.storage.clone();
        Box::pin(async move {
            let replay_keys = storage.replay_keys.purge_expired(now).await?;
            let locks = storage.scheduler_locks.purge_expired(now).await?;
            Ok(PurgeReport { replay_keys, locks })
        })
    }
}

pub mod memory {
    //! In-memory storage implementation.
    //!
    //! Serves single-node deployments without a database and deterministic
    //! tests. All state sits behind one async lock, so every operation is
    //! atomic with respect to the others. Supports injecting a storage
    //! failure to exercise error paths.

    use std::{
        collections::{BTreeSet, HashMap},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use staysync_core::{
        error::{CoreError, Result},
        models::{
            CircuitRecord, IdentityMerge, PollCursor, RateLimitWindow, ReservationIdentity,
            RetryEntry, RetryStatus, SchedulerLock,
        },
    };
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::{
        CircuitUpdate, CursorUpdate, PurgeReport, ReliabilityStorage, StorageFuture, WindowUpdate,
    };
    use crate::rate_limit::RateLimitDecision;

    #[derive(Default)]
    struct State {
        identities: HashMap<Uuid, ReservationIdentity>,
        alias_index: HashMap<String, Uuid>,
        circuits: HashMap<String, CircuitRecord>,
        retries: HashMap<Uuid, RetryEntry>,
        rate_windows: HashMap<String, RateLimitWindow>,
        cursors: HashMap<String, PollCursor>,
        locks: HashMap<String, SchedulerLock>,
        replay_keys: HashMap<String, DateTime<Utc>>,
        failure: Option<String>,
        enqueue_failure: Option<String>,
    }

    impl State {
        fn check_failure(&self) -> Result<()> {
            match &self.failure {
                Some(message) => Err(CoreError::Database(message.clone())),
                None => Ok(()),
            }
        }

        fn merge_identity(
            &mut self,
            identifiers: &[String],
            mark_processed: bool,
            now: DateTime<Utc>,
        ) -> Result<IdentityMerge> {
            let Some(primary) = identifiers.first() else {
                return Err(CoreError::InvalidInput("no identifiers to merge".to_string()));
            };

            let mut owners: Vec<Uuid> = identifiers
                .iter()
                .filter_map(|id| self.alias_index.get(id).copied())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            owners.sort_by_key(|id| {
                self.identities.get(id).map(|identity| (identity.first_seen_at, *id))
            });

            let was_processed = owners
                .iter()
                .any(|id| self.identities.get(id).is_some_and(|identity| identity.processed));
            let created = owners.is_empty();

            let survivor_id = match owners.first() {
                Some(survivor) => {
                    for other in owners.iter().skip(1) {
                        if let Some(folded) = self.identities.remove(other) {
                            for identifier in folded.identifiers() {
                                self.alias_index.insert(identifier.to_string(), *survivor);
                            }
                            if let Some(target) = self.identities.get_mut(survivor) {
                                target.aliases.insert(folded.primary_id.clone());
                                target.aliases.extend(folded.aliases.iter().cloned());
                            }
                        }
                    }
                    *survivor
                },
                None => {
                    let id = Uuid::new_v4();
                    self.identities.insert(id, ReservationIdentity {
                        id,
                        primary_id: primary.clone(),
                        aliases: BTreeSet::new(),
                        processed: false,
                        first_seen_at: now,
                        processed_at: None,
                        updated_at: now,
                    });
                    id
                },
            };

            let mut learned = Vec::new();
            for identifier in identifiers {
                if !self.alias_index.contains_key(identifier) {
                    self.alias_index.insert(identifier.clone(), survivor_id);
                    learned.push(identifier.clone());
                }
            }

            let identity = self
                .identities
                .get_mut(&survivor_id)
                .ok_or_else(|| CoreError::NotFound(format!("identity {survivor_id}")))?;

            for identifier in &learned {
                if *identifier != identity.primary_id {
                    identity.aliases.insert(identifier.clone());
                }
            }
            if was_processed || mark_processed {
                identity.processed = true;
                identity.processed_at.get_or_insert(now);
            }
            if mark_processed || !learned.is_empty() {
                identity.updated_at = now;
            }

            Ok(IdentityMerge { identity: identity.clone(), created, learned, was_processed })
        }
    }

    fn processing_order(entries: &mut [RetryEntry]) {
        entries.sort_by_key(|entry| (entry.priority, entry.scheduled_retry_at, entry.created_at));
    }

    /// In-memory reliability store.
    #[derive(Clone, Default)]
    pub struct MemoryStorage {
        state: Arc<RwLock<State>>,
    }

    impl MemoryStorage {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every subsequent operation fail with a database error.
        pub async fn inject_failure(&self, message: impl Into<String>) {
            self.state.write().await.failure = Some(message.into());
        }

        /// Makes only retry enqueues fail with a database error.
        pub async fn inject_enqueue_failure(&self, message: impl Into<String>) {
            self.state.write().await.enqueue_failure = Some(message.into());
        }

        /// Clears injected failures.
        pub async fn clear_failure(&self) {
            let mut state = self.state.write().await;
            state.failure = None;
            state.enqueue_failure = None;
        }

        /// Returns all identities for verification.
        pub async fn identities(&self) -> Vec<ReservationIdentity> {
            self.state.read().await.identities.values().cloned().collect()
        }

        /// Returns the current holder of a named lock, expired or not.
        pub async fn lock_holder(&self, name: &str) -> Option<SchedulerLock> {
            self.state.read().await.locks.get(name).cloned()
        }

        /// Number of stored replay keys, expired or not.
        pub async fn replay_key_count(&self) -> usize {
            self.state.read().await.replay_keys.len()
        }
    }

    impl ReliabilityStorage for MemoryStorage {
        fn health_check(&self) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move { state.read().await.check_failure() })
        }

        fn find_identity(
            &self,
            identifier: String,
        ) -> StorageFuture<'_, Option<ReservationIdentity>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                state.check_failure()?;
                Ok(state
                    .alias_index
                    .get(&identifier)
                    .and_then(|id| state.identities.get(id))
                    .cloned())
            })
        }

        fn merge_identity(
            &self,
            identifiers: Vec<String>,
            mark_processed: bool,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, IdentityMerge> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                state.merge_identity(&identifiers, mark_processed, now)
            })
        }

        fn find_circuit(&self, service: String) -> StorageFuture<'_, Option<CircuitRecord>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                state.check_failure()?;
                Ok(state.circuits.get(&service).cloned())
            })
        }

        fn list_circuits(&self) -> StorageFuture<'_, Vec<CircuitRecord>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                state.check_failure()?;
                let mut circuits: Vec<_> = state.circuits.values().cloned().collect();
                circuits.sort_by(|a, b| a.service.cmp(&b.service));
                Ok(circuits)
            })
        }

        fn update_circuit(
            &self,
            seed: CircuitRecord,
            update: CircuitUpdate,
        ) -> StorageFuture<'_, (CircuitRecord, bool)> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                let record = state.circuits.entry(seed.service.clone()).or_insert(seed);
                let flag = update(record);
                Ok((record.clone(), flag))
            })
        }

        fn enqueue_retry(&self, entry: RetryEntry) -> StorageFuture<'_, (RetryEntry, bool)> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                if let Some(message) = &state.enqueue_failure {
                    return Err(CoreError::Database(message.clone()));
                }
                if let Some(existing) =
                    state.retries.values().find(|existing| existing.dedupe_key == entry.dedupe_key)
                {
                    return Ok((existing.clone(), false));
                }
                state.retries.insert(entry.id, entry.clone());
                Ok((entry, true))
            })
        }

        fn claim_due_retries(
            &self,
            now: DateTime<Utc>,
            lease_until: DateTime<Utc>,
            limit: usize,
        ) -> StorageFuture<'_, Vec<RetryEntry>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;

                let mut due: Vec<RetryEntry> = state
                    .retries
                    .values()
                    .filter(|entry| {
                        entry.status == RetryStatus::Queued
                            && entry.scheduled_retry_at <= now
                            && entry.attempts < entry.max_attempts
                            && entry.claimed_until.is_none_or(|lease| lease <= now)
                    })
                    .cloned()
                    .collect();
                processing_order(&mut due);
                due.truncate(limit);

                for entry in &mut due {
                    entry.claimed_until = Some(lease_until);
                    if let Some(stored) = state.retries.get_mut(&entry.id) {
                        stored.claimed_until = Some(lease_until);
                    }
                }
                Ok(due)
            })
        }

        fn remove_retry(
            &self,
            id: Uuid,
            status: RetryStatus,
        ) -> StorageFuture<'_, Option<RetryEntry>> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                Ok(state.retries.remove(&id).map(|mut entry| {
                    entry.status = status;
                    entry
                }))
            })
        }

        fn reschedule_retry(
            &self,
            id: Uuid,
            attempts: i32,
            next_retry_at: DateTime<Utc>,
            last_error: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                if let Some(entry) = state.retries.get_mut(&id) {
                    entry.attempts = attempts;
                    entry.scheduled_retry_at = next_retry_at;
                    entry.last_error = Some(last_error);
                    entry.claimed_until = None;
                    entry.updated_at = now;
                }
                Ok(())
            })
        }

        fn defer_retry(
            &self,
            id: Uuid,
            next_retry_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                if let Some(entry) = state.retries.get_mut(&id) {
                    entry.scheduled_retry_at = next_retry_at;
                    entry.claimed_until = None;
                    entry.updated_at = now;
                }
                Ok(())
            })
        }

        fn list_retries(&self) -> StorageFuture<'_, Vec<RetryEntry>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                state.check_failure()?;
                let mut entries: Vec<_> = state.retries.values().cloned().collect();
                processing_order(&mut entries);
                Ok(entries)
            })
        }

        fn find_rate_window(&self, key: String) -> StorageFuture<'_, Option<RateLimitWindow>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                state.check_failure()?;
                Ok(state.rate_windows.get(&key).cloned())
            })
        }

        fn update_rate_window(
            &self,
            seed: RateLimitWindow,
            update: WindowUpdate,
        ) -> StorageFuture<'_, RateLimitDecision> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                let window = state.rate_windows.entry(seed.key.clone()).or_insert(seed);
                Ok(update(window))
            })
        }

        fn delete_rate_window(&self, key: String) -> StorageFuture<'_, ()> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                state.rate_windows.remove(&key);
                Ok(())
            })
        }

        fn find_cursor(&self, name: String) -> StorageFuture<'_, Option<PollCursor>> {
            let state = self.state.clone();
            Box::pin(async move {
                let state = state.read().await;
                state.check_failure()?;
                Ok(state.cursors.get(&name).cloned())
            })
        }

        fn update_cursor(
            &self,
            seed: PollCursor,
            update: CursorUpdate,
        ) -> StorageFuture<'_, PollCursor> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                let cursor = state.cursors.entry(seed.name.clone()).or_insert(seed);
                update(cursor);
                Ok(cursor.clone())
            })
        }

        fn try_acquire_lock(
            &self,
            name: String,
            owner: String,
            now: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                if state.locks.get(&name).is_some_and(|lock| lock.expires_at > now) {
                    return Ok(false);
                }
                state
                    .locks
                    .insert(name.clone(), SchedulerLock { name, owner, acquired_at: now, expires_at });
                Ok(true)
            })
        }

        fn release_lock(&self, name: String, owner: String) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                if state.locks.get(&name).is_some_and(|lock| lock.owner == owner) {
                    state.locks.remove(&name);
                    return Ok(true);
                }
                Ok(false)
            })
        }

        fn remember_replay_key(
            &self,
            key: String,
            now: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                if state.replay_keys.get(&key).is_some_and(|expiry| *expiry > now) {
                    return Ok(false);
                }
                state.replay_keys.insert(key, expires_at);
                Ok(true)
            })
        }

        fn purge_expired(&self, now: DateTime<Utc>) -> StorageFuture<'_, PurgeReport> {
            let state = self.state.clone();
            Box::pin(async move {
                let mut state = state.write().await;
                state.check_failure()?;
                let replay_before = state.replay_keys.len();
                state.replay_keys.retain(|_, expiry| *expiry > now);
                let locks_before = state.locks.len();
                state.locks.retain(|_, lock| lock.expires_at > now);
                Ok(PurgeReport {
                    replay_keys: (replay_before - state.replay_keys.len()) as u64,
                    locks: (locks_before - state.locks.len()) as u64,
                })
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::Duration;
        use serde_json::json;
        use staysync_core::models::{NewRetryEntry, RetryPriority};

        use super::*;

        fn ids(values: &[&str]) -> Vec<String> {
            values.iter().map(|v| v.to_string()).collect()
        }

        fn retry(dedupe_key: &str, priority: RetryPriority, due: DateTime<Utc>) -> RetryEntry {
            NewRetryEntry {
                service: "meta".into(),
                operation_type: "dispatch".into(),
                priority,
                payload: json!({}),
                dedupe_key: dedupe_key.into(),
                scheduled_retry_at: due,
                max_attempts: 3,
                last_error: None,
            }
            .into_entry(due)
        }

        #[tokio::test]
        async fn merge_creates_then_learns_aliases() {
            let storage = MemoryStorage::new();
            let now = Utc::now();

            let first = storage.merge_identity(ids(&["r1"]), true, now).await.unwrap();
            let second = storage.merge_identity(ids(&["r1", "b9"]), false, now).await.unwrap();

            assert!(first.created);
            assert!(!second.created);
            assert!(second.was_processed);
            assert_eq!(second.learned, ids(&["b9"]));
            assert_eq!(second.identity.id, first.identity.id);
            assert!(storage.find_identity("b9".into()).await.unwrap().unwrap().processed);
        }

        #[tokio::test]
        async fn merge_folds_split_identities_into_oldest() {
            let storage = MemoryStorage::new();
            let now = Utc::now();

            let old = storage.merge_identity(ids(&["a"]), true, now).await.unwrap();
            storage.merge_identity(ids(&["b"]), false, now + Duration::seconds(1)).await.unwrap();
            let merged = storage
                .merge_identity(ids(&["b", "a"]), false, now + Duration::seconds(2))
                .await
                .unwrap();

            assert_eq!(merged.identity.id, old.identity.id);
            assert!(merged.identity.matches("b"));
            assert_eq!(storage.identities().await.len(), 1);
        }

        #[tokio::test]
        async fn enqueue_is_insert_if_absent() {
            let storage = MemoryStorage::new();
            let now = Utc::now();

            let (first, inserted) =
                storage.enqueue_retry(retry("k", RetryPriority::Normal, now)).await.unwrap();
            let (second, inserted_again) =
                storage.enqueue_retry(retry("k", RetryPriority::Normal, now)).await.unwrap();

            assert!(inserted);
            assert!(!inserted_again);
            assert_eq!(first.id, second.id);
            assert_eq!(storage.list_retries().await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn claim_orders_by_priority_and_leases() {
            let storage = MemoryStorage::new();
            let now = Utc::now();
            storage.enqueue_retry(retry("low", RetryPriority::Low, now)).await.unwrap();
            storage.enqueue_retry(retry("high", RetryPriority::High, now)).await.unwrap();
            storage
                .enqueue_retry(retry("later", RetryPriority::High, now + Duration::minutes(5)))
                .await
                .unwrap();

            let lease = now + Duration::minutes(1);
            let claimed = storage.claim_due_retries(now, lease, 10).await.unwrap();
            let again = storage.claim_due_retries(now, lease, 10).await.unwrap();

            let keys: Vec<_> = claimed.iter().map(|e| e.dedupe_key.as_str()).collect();
            assert_eq!(keys, vec!["high", "low"]);
            assert!(again.is_empty());
        }

        #[tokio::test]
        async fn expired_lock_can_be_taken_over() {
            let storage = MemoryStorage::new();
            let now = Utc::now();
            let ttl = now + Duration::seconds(30);

            assert!(storage.try_acquire_lock("poll".into(), "a".into(), now, ttl).await.unwrap());
            assert!(!storage.try_acquire_lock("poll".into(), "b".into(), now, ttl).await.unwrap());
            assert!(storage
                .try_acquire_lock("poll".into(), "b".into(), ttl, ttl + Duration::seconds(30))
                .await
                .unwrap());
            assert!(!storage.release_lock("poll".into(), "a".into()).await.unwrap());
        }

        #[tokio::test]
        async fn injected_failure_surfaces_as_database_error() {
            let storage = MemoryStorage::new();
            storage.inject_failure("disk on fire").await;

            let err = storage.health_check().await.unwrap_err();

            assert!(matches!(err, CoreError::Database(_)));
            storage.clear_failure().await;
            assert!(storage.health_check().await.is_ok());
        }
    }
}
