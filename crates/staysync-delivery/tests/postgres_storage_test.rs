//! Integration tests for the PostgreSQL store.
//!
//! Exercises the SQL repositories through `PostgresStorage`, the adapter the
//! pipeline uses in multi-node deployments. Each test runs in its own schema
//! on the server named by `DATABASE_URL` and is skipped when it is unset.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use staysync_core::models::{
    CircuitRecord, NewRetryEntry, PollCursor, RateLimitWindow, RetryPriority, RetryStatus,
};
use staysync_delivery::{rate_limit::RateLimitDecision, storage::ReliabilityStorage};
use staysync_testing::TestDatabase;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn seconds(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

async fn database() -> Option<TestDatabase> {
    staysync_testing::init_test_tracing();
    TestDatabase::from_env().await.expect("test database should be reachable")
}

fn retry(service: &str, dedupe_key: &str, priority: RetryPriority, due: DateTime<Utc>) -> NewRetryEntry {
    NewRetryEntry {
        service: service.to_string(),
        operation_type: "dispatch".to_string(),
        priority,
        payload: json!({"code": dedupe_key}),
        dedupe_key: dedupe_key.to_string(),
        scheduled_retry_at: due,
        max_attempts: 5,
        last_error: Some("HTTP 503".to_string()),
    }
}

#[tokio::test]
async fn storage_health_check() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    storage.health_check().await?;

    db.close().await
}

#[tokio::test]
async fn merge_folds_separate_identities_into_the_oldest() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    let first = storage.merge_identity(vec!["r-1".into()], false, start()).await?;
    assert!(first.created);
    let second = storage.merge_identity(vec!["gid-1".into()], true, start() + seconds(60)).await?;
    assert!(second.created);
    assert_eq!(db.storage().identities.count().await?, 2);

    let merged =
        storage.merge_identity(vec!["r-1".into(), "gid-1".into()], false, start() + seconds(120)).await?;

    assert!(!merged.created);
    assert!(merged.was_processed);
    assert!(merged.learned.is_empty());
    assert_eq!(merged.identity.id, first.identity.id);
    assert_eq!(merged.identity.primary_id, "r-1");
    assert!(merged.identity.processed);
    assert_eq!(db.storage().identities.count().await?, 1);

    let found = storage.find_identity("gid-1".into()).await?.expect("alias resolves");
    assert_eq!(found.id, first.identity.id);
    assert!(found.matches("r-1"));

    db.close().await
}

#[tokio::test]
async fn merge_reports_newly_learned_aliases_in_caller_order() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    storage.merge_identity(vec!["r-7".into()], false, start()).await?;
    let merged = storage
        .merge_identity(vec!["r-7".into(), "txn-7".into(), "gid-7".into()], false, start())
        .await?;

    assert_eq!(merged.learned, vec!["txn-7".to_string(), "gid-7".to_string()]);
    assert!(!merged.identity.processed);

    db.close().await
}

#[tokio::test]
async fn concurrent_merges_of_one_reservation_create_one_identity() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    let (a, b) = tokio::join!(
        storage.merge_identity(vec!["r-2".into(), "gid-2".into()], false, start()),
        storage.merge_identity(vec!["gid-2".into(), "r-2".into()], false, start()),
    );
    let (a, b) = (a?, b?);

    assert_eq!(a.identity.id, b.identity.id);
    assert!(a.created ^ b.created);
    assert_eq!(db.storage().identities.count().await?, 1);

    db.close().await
}

#[tokio::test]
async fn enqueue_keeps_one_entry_per_dedupe_key() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    let (stored, inserted) = storage
        .enqueue_retry(retry("crm", "crm:r-3", RetryPriority::Normal, start()).into_entry(start()))
        .await?;
    assert!(inserted);

    let (existing, inserted) = storage
        .enqueue_retry(
            retry("crm", "crm:r-3", RetryPriority::High, start() + seconds(5)).into_entry(start()),
        )
        .await?;

    assert!(!inserted);
    assert_eq!(existing.id, stored.id);
    assert_eq!(existing.priority, RetryPriority::Normal);
    assert_eq!(storage.list_retries().await?.len(), 1);

    db.close().await
}

#[tokio::test]
async fn claims_follow_priority_then_due_time_and_hold_a_lease() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    for entry in [
        retry("crm", "crm:low", RetryPriority::Low, start() - seconds(30)),
        retry("crm", "crm:normal", RetryPriority::Normal, start() - seconds(20)),
        retry("crm", "crm:high", RetryPriority::High, start() - seconds(10)),
        retry("crm", "crm:later", RetryPriority::High, start() + seconds(600)),
    ] {
        storage.enqueue_retry(entry.into_entry(start() - seconds(60))).await?;
    }

    let lease_until = start() + seconds(60);
    let claimed = storage.claim_due_retries(start(), lease_until, 10).await?;
    let keys: Vec<_> = claimed.iter().map(|e| e.dedupe_key.as_str()).collect();
    assert_eq!(keys, vec!["crm:high", "crm:normal", "crm:low"]);
    assert!(claimed.iter().all(|e| e.claimed_until == Some(lease_until)));

    assert!(storage.claim_due_retries(start() + seconds(30), lease_until, 10).await?.is_empty());

    let reclaimed = storage.claim_due_retries(lease_until, lease_until + seconds(60), 10).await?;
    assert_eq!(reclaimed.len(), 3);

    db.close().await
}

#[tokio::test]
async fn overlapping_claims_never_share_an_entry() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    for n in 0..6 {
        let key = format!("crm:r-{n}");
        storage
            .enqueue_retry(retry("crm", &key, RetryPriority::Normal, start()).into_entry(start()))
            .await?;
    }

    let lease_until = start() + seconds(60);
    let (a, b) = tokio::join!(
        storage.claim_due_retries(start(), lease_until, 4),
        storage.claim_due_retries(start(), lease_until, 4),
    );
    let (a, b) = (a?, b?);

    let a_ids: HashSet<_> = a.iter().map(|e| e.id).collect();
    let b_ids: HashSet<_> = b.iter().map(|e| e.id).collect();
    assert!(a_ids.is_disjoint(&b_ids));
    assert_eq!(a_ids.len() + b_ids.len(), 6);

    db.close().await
}

#[tokio::test]
async fn reschedule_records_the_attempt_and_releases_the_lease() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    storage
        .enqueue_retry(retry("crm", "crm:r-4", RetryPriority::Normal, start()).into_entry(start()))
        .await?;
    let claimed = storage.claim_due_retries(start(), start() + seconds(60), 1).await?;
    let id = claimed[0].id;

    let next = start() + seconds(10);
    storage.reschedule_retry(id, 1, next, "HTTP 502".into(), start()).await?;

    let claimed = storage.claim_due_retries(next, next + seconds(60), 1).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].last_error.as_deref(), Some("HTTP 502"));

    let later = next + seconds(300);
    storage.defer_retry(id, later, next).await?;
    assert!(storage.claim_due_retries(later - seconds(1), later, 1).await?.is_empty());
    assert_eq!(storage.list_retries().await?[0].attempts, 1);

    let removed = storage.remove_retry(id, RetryStatus::Done).await?.expect("entry exists");
    assert_eq!(removed.status, RetryStatus::Done);
    assert!(storage.list_retries().await?.is_empty());
    assert!(storage.remove_retry(id, RetryStatus::Done).await?.is_none());

    db.close().await
}

#[tokio::test]
async fn circuit_updates_are_seeded_once_and_accumulate() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();
    let seed = CircuitRecord::closed("crm", 3, 2, 60, start());

    for _ in 0..2 {
        storage
            .update_circuit(
                seed.clone(),
                Box::new(|record| {
                    record.failure_count += 1;
                    true
                }),
            )
            .await?;
    }

    let record = storage.find_circuit("crm".into()).await?.expect("row created");
    assert_eq!(record.failure_count, 2);
    assert_eq!(storage.list_circuits().await?.len(), 1);

    db.close().await
}

#[tokio::test]
async fn concurrent_window_updates_are_serialized() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    let increment = || {
        storage.update_rate_window(
            RateLimitWindow::empty("integration:crm", start()),
            Box::new(|window| {
                window.count += 1;
                RateLimitDecision::Allowed { remaining: 0 }
            }),
        )
    };
    for result in futures::future::join_all((0..5).map(|_| increment())).await {
        result?;
    }

    let window = storage.find_rate_window("integration:crm".into()).await?.expect("window created");
    assert_eq!(window.count, 5);

    storage.delete_rate_window("integration:crm".into()).await?;
    assert!(storage.find_rate_window("integration:crm".into()).await?.is_none());

    db.close().await
}

#[tokio::test]
async fn cursor_updates_persist_every_field() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();

    let updated = storage
        .update_cursor(
            PollCursor::new("reservations", start()),
            Box::new(|cursor| {
                cursor.last_successful_continuous_poll_at = Some(start());
                cursor.traffic_checks = 3;
                cursor.traffic_max_lag_seconds = 240;
            }),
        )
        .await?;

    let found = storage.find_cursor("reservations".into()).await?.expect("cursor created");
    assert_eq!(found, updated);
    assert_eq!(found.last_successful_continuous_poll_at, Some(start()));
    assert_eq!(found.traffic_checks, 3);
    assert_eq!(found.traffic_max_lag_seconds, 240);

    db.close().await
}

#[tokio::test]
async fn named_lock_is_exclusive_until_released_or_expired() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();
    let lease = start() + seconds(60);

    assert!(storage.try_acquire_lock("poll".into(), "node-a".into(), start(), lease).await?);
    assert!(!storage.try_acquire_lock("poll".into(), "node-b".into(), start(), lease).await?);
    assert!(!storage.release_lock("poll".into(), "node-b".into()).await?);

    assert!(storage.release_lock("poll".into(), "node-a".into()).await?);
    assert!(storage.try_acquire_lock("poll".into(), "node-b".into(), start(), lease).await?);

    let after = lease + seconds(1);
    assert!(storage.try_acquire_lock("poll".into(), "node-c".into(), after, after + seconds(60)).await?);
    let holder = db.storage().scheduler_locks.find("poll").await?.expect("lock held");
    assert_eq!(holder.owner, "node-c");

    let purged = storage.purge_expired(after + seconds(120)).await?;
    assert_eq!(purged.locks, 1);
    assert!(db.storage().scheduler_locks.find("poll").await?.is_none());

    db.close().await
}

#[tokio::test]
async fn replay_key_is_rejected_until_it_expires() -> Result<()> {
    let Some(db) = database().await else { return Ok(()) };
    let storage = db.reliability_storage();
    let expiry = start() + seconds(300);

    assert!(storage.remember_replay_key("sig:abc".into(), start(), expiry).await?);
    assert!(!storage.remember_replay_key("sig:abc".into(), start() + seconds(60), expiry).await?);
    assert!(storage.remember_replay_key("sig:abc".into(), expiry, expiry + seconds(300)).await?);

    let purged = storage.purge_expired(expiry + seconds(600)).await?;
    assert_eq!(purged.replay_keys, 1);
    assert!(storage.remember_replay_key("sig:abc".into(), expiry + seconds(600), expiry + seconds(900)).await?);

    db.close().await
}
