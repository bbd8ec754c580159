//! Integration tests for core domain models.
//!
//! Tests reservation extraction, serialization of reliability records, and
//! clock behavior used by time-dependent components.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use staysync_core::{
    models::{
        CircuitRecord, CircuitState, DispatchResult, DispatchStatus, NewRetryEntry, PollCursor,
        RateLimitWindow, Reservation, RetryPriority, RetryStatus,
    },
    Clock, TestClock,
};

#[test]
fn reservation_serializes_as_plain_object() {
    let reservation =
        Reservation::from_value(json!({"code": "R1", "amount": 100, "guest": {"country": "PT"}}))
            .unwrap();

    let value = serde_json::to_value(&reservation).unwrap();

    assert_eq!(value, json!({"code": "R1", "amount": 100, "guest": {"country": "PT"}}));
    let back: Reservation = serde_json::from_value(value).unwrap();
    assert_eq!(back, reservation);
}

#[test]
fn reservation_has_field_treats_blank_as_missing() {
    let reservation =
        Reservation::from_value(json!({"email": " ", "phone": null, "amount": 0})).unwrap();

    assert!(!reservation.has_field("email"));
    assert!(!reservation.has_field("phone"));
    assert!(!reservation.has_field("missing"));
    assert!(reservation.has_field("amount"));
}

#[test]
fn dispatch_result_serializes_status_lowercase() {
    let mut result = DispatchResult::new(Some("r1".into()));
    result.successful.push("GA4".into());
    result.failed.push("Meta".into());
    result.finalize();

    let value = serde_json::to_value(&result).unwrap();

    assert_eq!(result.status, DispatchStatus::Partial);
    assert_eq!(value["status"], "partial");
    assert_eq!(value["successful"], json!(["GA4"]));
    assert_eq!(value["failed"], json!(["Meta"]));
}

#[test]
fn circuit_state_display_matches_storage_encoding() {
    assert_eq!(CircuitState::Closed.to_string(), "closed");
    assert_eq!(CircuitState::Open.to_string(), "open");
    assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    assert_eq!(serde_json::to_value(CircuitState::HalfOpen).unwrap(), "half_open");
}

#[test]
fn new_circuit_is_closed_with_zero_counters() {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let record = CircuitRecord::closed("meta", 5, 2, 60, now);

    assert_eq!(record.state, CircuitState::Closed);
    assert_eq!(record.failure_count, 0);
    assert_eq!(record.success_count, 0);
    assert!(record.opened_at.is_none());
}

#[test]
fn new_retry_entry_starts_queued_without_attempts() {
    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let entry = NewRetryEntry {
        service: "meta".into(),
        operation_type: "dispatch".into(),
        priority: RetryPriority::Normal,
        payload: json!({"url": "https://example.test"}),
        dedupe_key: "meta:r1:dispatch".into(),
        scheduled_retry_at: now,
        max_attempts: 3,
        last_error: Some("HTTP 500".into()),
    }
    .into_entry(now);

    assert_eq!(entry.attempts, 0);
    assert_eq!(entry.status, RetryStatus::Queued);
    assert_eq!(entry.created_at, now);
    assert!(entry.claimed_until.is_none());
}

#[test]
fn poll_cursor_average_lag() {
    let mut cursor = PollCursor::new("upstream", Utc::now());
    assert_eq!(cursor.average_lag_seconds(), 0.0);

    cursor.traffic_checks = 4;
    cursor.traffic_total_lag_seconds = 1000;

    assert_eq!(cursor.average_lag_seconds(), 250.0);
}

#[test]
fn empty_rate_window_starts_at_now() {
    let now = Utc::now();
    let window = RateLimitWindow::empty("integration:ga4", now);
    assert_eq!(window.count, 0);
    assert_eq!(window.window_start, now);
}

#[tokio::test]
async fn test_clock_drives_time_forward_on_sleep() {
    let start = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
    let clock = TestClock::with_start_time(start);

    clock.sleep(Duration::from_secs(3600)).await;

    assert_eq!(clock.now(), start + chrono::Duration::hours(1));
}
