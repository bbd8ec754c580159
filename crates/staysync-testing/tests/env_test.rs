//! Tests for the in-memory environment and its doubles.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use staysync_core::models::DispatchStatus;
use staysync_delivery::{
    source::ReservationSource,
    tasks::{ScheduledTask, TaskScheduler},
};
use staysync_testing::{
    integration, integration_url, reservation, RecordingTaskScheduler, Reply, StaticReservationSource,
    TestEnv,
};

#[tokio::test]
async fn env_wires_pipeline_to_scripted_transport() {
    let env = TestEnv::builder().integration(integration("crm")).integration(integration("mailer")).build();
    env.transport.enqueue(integration_url("mailer"), [Reply::status(502)]);

    let report = env.ingest(reservation("R-ENV", env.now())).await.expect("pipeline should run");

    let result = report.result.expect("dispatch result");
    assert_eq!(result.status, DispatchStatus::Partial);
    assert_eq!(result.successful, vec!["crm".to_string()]);
    assert_eq!(env.transport.count(&integration_url("crm")), 1);
    assert_eq!(env.retry_queue.pending().await.unwrap().len(), 1);
    assert_eq!(env.events.dispatched(), 1);
}

#[tokio::test]
async fn env_records_duplicates_as_skipped() {
    let env = TestEnv::builder().integration(integration("crm")).build();
    let booked = reservation("R-TWICE", env.now());

    env.ingest(booked.clone()).await.unwrap();
    let second = env.ingest(booked).await.unwrap();

    assert!(second.skipped());
    assert_eq!(env.events.skipped(), 1);
    assert_eq!(env.transport.count(&integration_url("crm")), 1);
}

#[test]
fn clock_starts_at_the_configured_time_and_advances() {
    let start = Utc.with_ymd_and_hms(2025, 3, 9, 1, 30, 0).unwrap();
    let env = TestEnv::builder().start_time(start).build();

    env.advance(Duration::from_secs(90));

    assert_eq!(env.now(), start + chrono::Duration::seconds(90));
}

#[tokio::test]
async fn static_source_returns_reservations_from_the_cursor_oldest_first() {
    let base = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
    let source = StaticReservationSource::new();
    source.extend([
        reservation("R-3", base + chrono::Duration::minutes(30)),
        reservation("R-1", base),
        reservation("R-2", base + chrono::Duration::minutes(10)),
    ]);

    let fetched = source.fetch_created_since(base, 10).await.unwrap();
    let codes: Vec<_> = fetched.iter().filter_map(|r| r.get_string("code")).collect();
    assert_eq!(codes, vec!["R-1".to_string(), "R-2".to_string(), "R-3".to_string()]);

    let page = source.fetch_created_since(base, 2).await.unwrap();
    assert_eq!(page.len(), 2);

    let found = source.fetch_by_id("r-1").await.unwrap();
    assert!(found.is_some());
    assert!(source.fetch_by_id("R-9").await.unwrap().is_none());
}

#[tokio::test]
async fn static_source_can_simulate_throttling() {
    let source = StaticReservationSource::new();
    source.set_throttled(true);

    let result = source.fetch_created_since(Utc::now(), 10).await;

    assert!(result.is_err());
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn recording_scheduler_registers_each_task_once() {
    let scheduler = RecordingTaskScheduler::new();

    assert!(scheduler.schedule_recurring(ScheduledTask::ContinuousPoll, Duration::from_secs(900)).await.unwrap());
    assert!(!scheduler.schedule_recurring(ScheduledTask::ContinuousPoll, Duration::from_secs(60)).await.unwrap());
    assert_eq!(scheduler.interval(ScheduledTask::ContinuousPoll), Some(Duration::from_secs(900)));

    scheduler.drop_all();
    assert!(!scheduler.is_scheduled(ScheduledTask::ContinuousPoll).await);

    scheduler.set_failing(true);
    assert!(scheduler.schedule_once(ScheduledTask::DeepCheck, Duration::from_secs(1)).await.is_err());
}
