//! Adaptive two-tier poller with self-healing recovery.
//!
//! The continuous tier runs often and fetches only reservations created
//! after the cursor. The deep-check tier runs rarely and re-scans a trailing
//! window, relying on deduplication to skip what was already sent. Both run
//! under a named lock with expiry so at most one poll cycle is active across
//! all nodes, and a crashed holder cannot block polling forever.
//!
//! Scheduled timers can die silently (process restarts, lost registrations).
//! Two mechanisms compensate:
//!
//! - Incoming non-administrative traffic checks the poll lag and polls
//!   inline when it exceeds the lag threshold.
//! - The health check re-registers every recurring task when polling has
//!   been silent too long. Registration is idempotent.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use staysync_core::{
    models::{PollCursor, Reservation},
    Clock,
};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result},
    events::Origin,
    pipeline::{Pipeline, PipelineReport, ReservationEvent},
    rate_limit::{RateLimit, RateLimitDecision, RateLimiter, UPSTREAM_POLL_KEY},
    retry::{RetryPassReport, RetryQueue},
    source::{ReservationSource, CREATED_AT_FIELDS},
    storage::{PurgeReport, ReliabilityStorage},
    tasks::{ScheduledTask, TaskScheduler},
};

/// Cursor row used by the poller.
pub const CURSOR_NAME: &str = "reservations";

/// Lock guarding poll cycles.
pub const POLL_LOCK_NAME: &str = "reservation_poll";

/// Path prefixes that never trigger traffic checks.
const ADMINISTRATIVE_PREFIXES: &[&str] = &["/admin", "/internal", "/health"];

/// Poller timing and sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Continuous tier interval.
    pub continuous_interval: Duration,
    /// Deep-check tier interval.
    pub deep_check_interval: Duration,
    /// Trailing window re-scanned by deep checks.
    pub deep_check_window: Duration,
    /// Retry queue pass interval.
    pub retry_interval: Duration,
    /// Health check interval.
    pub health_check_interval: Duration,
    /// Delay before the cleanup scheduled by a recovery.
    pub cleanup_delay: Duration,
    /// Poll silence that triggers self-healing.
    pub silence_threshold: Duration,
    /// Poll lag that makes traffic poll inline.
    pub traffic_lag_threshold: Duration,
    /// Lookback of the very first continuous poll.
    pub initial_lookback: Duration,
    /// Reservations fetched per continuous poll.
    pub batch_size: usize,
    /// Wall time a batch may spend before it stops scheduling work.
    pub time_budget: Duration,
    /// Lock expiry for crashed holders.
    pub lock_ttl: Duration,
    /// How long a scheduled poll waits for the lock.
    pub lock_acquire_timeout: Duration,
    /// Upstream API throttle.
    pub upstream_rate_limit: RateLimit,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            continuous_interval: Duration::from_secs(60),
            deep_check_interval: Duration::from_secs(6 * 3600),
            deep_check_window: Duration::from_secs(3 * 24 * 3600),
            retry_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(300),
            cleanup_delay: Duration::from_secs(30),
            silence_threshold: Duration::from_secs(900),
            traffic_lag_threshold: Duration::from_secs(300),
            initial_lookback: Duration::from_secs(3600),
            batch_size: 100,
            time_budget: Duration::from_secs(45),
            lock_ttl: Duration::from_secs(120),
            lock_acquire_timeout: Duration::from_secs(5),
            upstream_rate_limit: RateLimit { max_requests: 60, window: Duration::from_secs(60) },
        }
    }
}

impl PollerConfig {
    /// Recurring tasks and their intervals.
    pub fn recurring_tasks(&self) -> [(ScheduledTask, Duration); 4] {
        [
            (ScheduledTask::ContinuousPoll, self.continuous_interval),
            (ScheduledTask::DeepCheck, self.deep_check_interval),
            (ScheduledTask::RetryQueue, self.retry_interval),
            (ScheduledTask::HealthCheck, self.health_check_interval),
        ]
    }
}

/// Poll tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTier {
    /// New reservations only.
    Continuous,
    /// Trailing window.
    DeepCheck,
}

/// How a poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Every fetched reservation was attempted.
    Completed,
    /// Stopped early on the time budget or a stage error.
    Partial,
    /// Another cycle holds the lock.
    LockBusy,
    /// Local or upstream throttle; cursors unchanged.
    Throttled,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReport {
    /// Tier that ran.
    pub tier: PollTier,
    /// How it ended.
    pub status: PollStatus,
    /// Reservations returned by the upstream API.
    pub fetched: usize,
    /// Reservations fanned out.
    pub dispatched: usize,
    /// Reservations skipped as duplicates.
    pub skipped: usize,
    /// Reservations whose pipeline run failed.
    pub errors: usize,
    /// New cursor position, if it moved.
    pub cursor: Option<DateTime<Utc>>,
}

impl PollReport {
    fn empty(tier: PollTier, status: PollStatus) -> Self {
        Self { tier, status, fetched: 0, dispatched: 0, skipped: 0, errors: 0, cursor: None }
    }
}

/// Result of a traffic-triggered lag check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TrafficCheck {
    /// Administrative path, not counted.
    Ignored,
    /// Lag below threshold.
    Fresh {
        /// Seconds since the last successful poll.
        lag_seconds: i64,
    },
    /// Lag above threshold; polled inline.
    Polled {
        /// Seconds since the last successful poll.
        lag_seconds: i64,
        /// Inline poll result.
        report: PollReport,
    },
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Seconds since the last continuous poll started, if one ever ran.
    pub silence_seconds: Option<i64>,
    /// Recurring tasks that were not registered.
    pub missing_tasks: Vec<ScheduledTask>,
    /// Recovery run, if any.
    pub recovery: Option<RecoveryReport>,
}

impl HealthReport {
    /// True if no recovery was needed.
    pub fn healthy(&self) -> bool {
        self.recovery.is_none()
    }
}

/// Result of a self-healing recovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Tasks newly registered by this recovery.
    pub registered: Vec<ScheduledTask>,
    /// Tasks whose registration failed.
    pub failed: Vec<ScheduledTask>,
    /// Whether the one-shot cleanup was scheduled.
    pub cleanup_scheduled: bool,
}

/// Result of a scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "task")]
pub enum TaskOutcome {
    /// Poll result.
    Poll(PollReport),
    /// Retry pass result.
    Retry(RetryPassReport),
    /// Health check result.
    Health(HealthReport),
    /// Cleanup result.
    Cleanup {
        /// Expired anti-replay keys deleted.
        replay_keys: u64,
        /// Expired locks deleted.
        locks: u64,
    },
}

/// Polling statistics for the admin endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollingStats {
    /// Cursor row, if any poll ever ran.
    pub cursor: Option<PollCursor>,
    /// Average lag seen by traffic checks.
    pub average_lag_seconds: f64,
    /// Queued retries.
    pub retry_queue_depth: usize,
    /// Recurring tasks currently registered.
    pub registered_tasks: Vec<ScheduledTask>,
}

/// Two-tier poller.
#[derive(Clone)]
pub struct AdaptivePoller {
    config: PollerConfig,
    storage: Arc<dyn ReliabilityStorage>,
    source: Arc<dyn ReservationSource>,
    pipeline: Pipeline,
    retry_queue: RetryQueue,
    limiter: RateLimiter,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    owner: String,
}

impl std::fmt::Debug for AdaptivePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptivePoller")
            .field("config", &self.config)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl AdaptivePoller {
    /// Creates a poller. Each instance holds locks under its own owner id.
    pub fn new(
        config: PollerConfig,
        storage: Arc<dyn ReliabilityStorage>,
        source: Arc<dyn ReservationSource>,
        pipeline: Pipeline,
        retry_queue: RetryQueue,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::new(storage.clone(), clock.clone());
        Self {
            config,
            storage,
            source,
            pipeline,
            retry_queue,
            limiter,
            scheduler,
            clock,
            owner: format!("poller-{}", Uuid::new_v4()),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Returns the pipeline used for polled reservations.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Registers every recurring task. Already registered tasks are left
    /// alone.
    ///
    /// Returns the newly registered and the failed tasks.
    pub async fn register_tasks(&self) -> (Vec<ScheduledTask>, Vec<ScheduledTask>) {
        let mut registered = Vec::new();
        let mut failed = Vec::new();

        for (task, interval) in self.config.recurring_tasks() {
            match self.scheduler.schedule_recurring(task, interval).await {
                Ok(true) => registered.push(task),
                Ok(false) => {},
                Err(e) => {
                    tracing::error!(%task, error = %e, category = %e.category(), "task registration failed");
                    failed.push(task);
                },
            }
        }

        (registered, failed)
    }

    /// Fetches and dispatches reservations created at or after the cursor.
    ///
    /// A short page that completes moves the cursor to the poll start. A
    /// full page moves it to the creation time of the newest attempted
    /// reservation, and reservations sharing that time are fetched again
    /// next run. A full page made only of ties at the cursor is drained
    /// through a one-second window fetch before the cursor steps past it.
    /// When the batch stops early the cursor moves only up to the last
    /// fully attempted reservation. Reservations without a creation time
    /// never move it.
    ///
    /// # Errors
    ///
    /// Returns storage errors and upstream failures other than throttling.
    pub async fn execute_continuous_polling(&self) -> Result<PollReport> {
        self.with_lock(PollTier::Continuous, self.config.lock_acquire_timeout, || {
            self.continuous_cycle()
        })
        .await
    }

    /// Re-scans the trailing window.
    ///
    /// # Errors
    ///
    /// Returns storage errors and upstream failures other than throttling.
    pub async fn execute_deep_check(&self) -> Result<PollReport> {
        self.with_lock(PollTier::DeepCheck, self.config.lock_acquire_timeout, || {
            self.deep_check_cycle()
        })
        .await
    }

    async fn continuous_cycle(&self) -> Result<PollReport> {
        let started = self.clock.now();
        let cursor = self
            .update_cursor(Box::new(move |cursor: &mut PollCursor| cursor.last_continuous_poll_at = Some(started)))
            .await?;

        if !self.upstream_allowed().await {
            return Ok(PollReport::empty(PollTier::Continuous, PollStatus::Throttled));
        }

        let since = cursor.last_successful_continuous_poll_at.unwrap_or_else(|| {
            started - chrono::Duration::from_std(self.config.initial_lookback).unwrap_or_default()
        });

        let reservations = match self.source.fetch_created_since(since, self.config.batch_size).await
        {
            Ok(reservations) => reservations,
            Err(e @ DeliveryError::RateLimited { .. }) => {
                tracing::warn!(error = %e, "upstream throttled continuous poll");
                return Ok(PollReport::empty(PollTier::Continuous, PollStatus::Throttled));
            },
            Err(e) => return Err(e),
        };

        let page_full = reservations.len() >= self.config.batch_size;
        let (mut report, position) =
            self.run_batch(PollTier::Continuous, reservations, Origin::ContinuousPoll).await;

        let mut new_cursor = match report.status {
            PollStatus::Completed if !page_full => Some(started),
            _ => position.filter(|position| *position > since),
        };
        if new_cursor.is_none() && page_full && report.status == PollStatus::Completed {
            new_cursor = self.drain_ties(since, &mut report).await?;
        }

        if let Some(position) = new_cursor {
            self.update_cursor(Box::new(move |cursor: &mut PollCursor| {
                cursor.last_successful_continuous_poll_at = Some(position);
            }))
            .await?;
        }
        report.cursor = new_cursor;

        tracing::info!(
            fetched = report.fetched,
            dispatched = report.dispatched,
            skipped = report.skipped,
            errors = report.errors,
            status = ?report.status,
            "continuous poll finished"
        );
        Ok(report)
    }

    async fn deep_check_cycle(&self) -> Result<PollReport> {
        let started = self.clock.now();
        self.update_cursor(Box::new(move |cursor: &mut PollCursor| cursor.last_deep_check_at = Some(started)))
            .await?;

        if !self.upstream_allowed().await {
            return Ok(PollReport::empty(PollTier::DeepCheck, PollStatus::Throttled));
        }

        let from =
            started - chrono::Duration::from_std(self.config.deep_check_window).unwrap_or_default();
        let reservations = match self.source.fetch_window(from, started).await {
            Ok(reservations) => reservations,
            Err(e @ DeliveryError::RateLimited { .. }) => {
                tracing::warn!(error = %e, "upstream throttled deep check");
                return Ok(PollReport::empty(PollTier::DeepCheck, PollStatus::Throttled));
            },
            Err(e) => return Err(e),
        };

        let (report, _) = self.run_batch(PollTier::DeepCheck, reservations, Origin::DeepCheck).await;

        if report.status == PollStatus::Completed {
            self.update_cursor(Box::new(move |cursor: &mut PollCursor| {
                cursor.last_successful_deep_check_at = Some(started);
            }))
            .await?;
        }

        tracing::info!(
            fetched = report.fetched,
            dispatched = report.dispatched,
            skipped = report.skipped,
            errors = report.errors,
            status = ?report.status,
            "deep check finished"
        );
        Ok(report)
    }

    /// Processes every reservation created within one second of `since`.
    ///
    /// Returns the position just past that second once all of them were
    /// attempted.
    async fn drain_ties(&self, since: DateTime<Utc>, report: &mut PollReport) -> Result<Option<DateTime<Utc>>> {
        if !self.upstream_allowed().await {
            report.status = PollStatus::Throttled;
            return Ok(None);
        }

        let until = since + chrono::Duration::seconds(1);
        let ties = match self.source.fetch_window(since, until).await {
            Ok(ties) => ties,
            Err(e @ DeliveryError::RateLimited { .. }) => {
                tracing::warn!(error = %e, "upstream throttled tie drain");
                report.status = PollStatus::Throttled;
                return Ok(None);
            },
            Err(e) => return Err(e),
        };
        tracing::debug!(%since, count = ties.len(), "full page shares the cursor timestamp, draining it");

        let (drained, _) = self.run_batch(PollTier::Continuous, ties, Origin::ContinuousPoll).await;
        report.fetched += drained.fetched;
        report.dispatched += drained.dispatched;
        report.skipped += drained.skipped;
        report.errors += drained.errors;
        if drained.status != PollStatus::Completed {
            report.status = drained.status;
            return Ok(None);
        }
        Ok(Some(until))
    }

    /// Runs reservations through the pipeline until done or the budget runs
    /// out. Returns the report and the creation time of the newest
    /// reservation attempted before the first failure or budget stop.
    async fn run_batch(
        &self,
        tier: PollTier,
        reservations: Vec<Reservation>,
        origin: Origin,
    ) -> (PollReport, Option<DateTime<Utc>>) {
        let mut report = PollReport::empty(tier, PollStatus::Completed);
        report.fetched = reservations.len();

        let started = self.clock.now();
        let budget = chrono::Duration::from_std(self.config.time_budget).unwrap_or_default();
        let mut position = None;
        let mut clean_prefix = true;

        for reservation in reservations {
            if self.clock.now() - started >= budget {
                tracing::warn!(
                    ?tier,
                    attempted = report.dispatched + report.skipped + report.errors,
                    "poll time budget exhausted, resuming next run"
                );
                report.status = PollStatus::Partial;
                break;
            }

            match self.pipeline.run(ReservationEvent::new(reservation.clone(), origin)).await {
                Ok(outcome) => {
                    record_outcome(&mut report, &outcome);
                    if clean_prefix {
                        if let Some(created) = reservation.timestamp(CREATED_AT_FIELDS) {
                            position = Some(created);
                        }
                    }
                },
                Err(_) => {
                    report.errors += 1;
                    report.status = PollStatus::Partial;
                    clean_prefix = false;
                },
            }
        }

        (report, position)
    }

    /// Counts a request toward poll lag statistics and polls inline when
    /// the lag exceeds the threshold.
    ///
    /// Administrative paths are ignored. The inline poll does not wait for
    /// the lock. Lag beyond the silence threshold also runs self-healing.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the cursor update or the inline poll.
    pub async fn observe_traffic(&self, path: &str) -> Result<TrafficCheck> {
        if is_administrative(path) {
            return Ok(TrafficCheck::Ignored);
        }

        let now = self.clock.now();
        let cursor = self.storage.find_cursor(CURSOR_NAME.to_string()).await?;
        let last_poll = cursor.as_ref().and_then(|c| c.last_successful_continuous_poll_at);
        let lag_seconds = last_poll.map_or(i64::MAX, |at| (now - at).num_seconds().max(0));
        let recorded_lag = if last_poll.is_some() { lag_seconds } else { 0 };

        self.update_cursor(Box::new(move |cursor: &mut PollCursor| {
            cursor.traffic_checks += 1;
            cursor.traffic_total_lag_seconds = cursor.traffic_total_lag_seconds.saturating_add(recorded_lag);
            cursor.traffic_max_lag_seconds = cursor.traffic_max_lag_seconds.max(recorded_lag);
        }))
        .await?;

        if lag_seconds < duration_seconds(self.config.traffic_lag_threshold) {
            return Ok(TrafficCheck::Fresh { lag_seconds });
        }

        tracing::info!(lag_seconds, path, "poll lag above threshold, polling inline");

        if lag_seconds >= duration_seconds(self.config.silence_threshold) {
            self.execute_self_healing_recovery().await?;
        }

        let report = self
            .with_lock(PollTier::Continuous, Duration::ZERO, || self.continuous_cycle())
            .await?;
        if report.status != PollStatus::LockBusy {
            self.update_cursor(Box::new(|cursor: &mut PollCursor| cursor.traffic_recoveries += 1)).await?;
        }

        Ok(TrafficCheck::Polled { lag_seconds, report })
    }

    /// Detects silent polling and missing registrations and recovers.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn check_health(&self) -> Result<HealthReport> {
        let now = self.clock.now();
        let cursor = self.storage.find_cursor(CURSOR_NAME.to_string()).await?;
        let silence_seconds = cursor
            .and_then(|c| c.last_continuous_poll_at)
            .map(|at| (now - at).num_seconds().max(0));

        let mut missing_tasks = Vec::new();
        for (task, _) in self.config.recurring_tasks() {
            if !self.scheduler.is_scheduled(task).await {
                missing_tasks.push(task);
            }
        }

        let silent =
            silence_seconds.is_some_and(|s| s >= duration_seconds(self.config.silence_threshold));

        let recovery = if silent || !missing_tasks.is_empty() {
            tracing::warn!(?silence_seconds, ?missing_tasks, "polling unhealthy, recovering");
            Some(self.execute_self_healing_recovery().await?)
        } else {
            None
        };

        Ok(HealthReport { silence_seconds, missing_tasks, recovery })
    }

    /// Re-registers recurring tasks and schedules a one-shot cleanup.
    ///
    /// Safe to call any number of times; live registrations are kept.
    ///
    /// # Errors
    ///
    /// Returns storage errors from recording the recovery.
    pub async fn execute_self_healing_recovery(&self) -> Result<RecoveryReport> {
        let (registered, mut failed) = self.register_tasks().await;

        let cleanup_scheduled =
            match self.scheduler.schedule_once(ScheduledTask::Cleanup, self.config.cleanup_delay).await {
                Ok(scheduled) => scheduled,
                Err(e) => {
                    tracing::error!(error = %e, "cleanup scheduling failed");
                    failed.push(ScheduledTask::Cleanup);
                    false
                },
            };

        let now = self.clock.now();
        self.update_cursor(Box::new(move |cursor: &mut PollCursor| cursor.last_recovery_at = Some(now))).await?;

        tracing::info!(?registered, ?failed, cleanup_scheduled, "self-healing recovery finished");
        Ok(RecoveryReport { registered, failed, cleanup_scheduled })
    }

    /// Purges expired anti-replay keys and locks.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn execute_cleanup(&self) -> Result<PurgeReport> {
        let report = self.storage.purge_expired(self.clock.now()).await?;
        tracing::info!(replay_keys = report.replay_keys, locks = report.locks, "cleanup finished");
        Ok(report)
    }

    /// Runs one scheduled task.
    ///
    /// # Errors
    ///
    /// Returns the task's error.
    pub async fn run_task(&self, task: ScheduledTask) -> Result<TaskOutcome> {
        match task {
            ScheduledTask::ContinuousPoll => self.execute_continuous_polling().await.map(TaskOutcome::Poll),
            ScheduledTask::DeepCheck => self.execute_deep_check().await.map(TaskOutcome::Poll),
            ScheduledTask::RetryQueue => {
                self.retry_queue.process_due(self.clock.now()).await.map(TaskOutcome::Retry)
            },
            ScheduledTask::HealthCheck => self.check_health().await.map(TaskOutcome::Health),
            ScheduledTask::Cleanup => self.execute_cleanup().await.map(|report| TaskOutcome::Cleanup {
                replay_keys: report.replay_keys,
                locks: report.locks,
            }),
        }
    }

    /// Fetches one reservation upstream and dispatches it regardless of
    /// dedup state.
    ///
    /// Returns `None` when the upstream API does not know the id.
    ///
    /// # Errors
    ///
    /// Returns upstream or storage errors.
    pub async fn redispatch(&self, id: &str) -> Result<Option<PipelineReport>> {
        let Some(reservation) = self.source.fetch_by_id(id).await? else {
            return Ok(None);
        };
        self.pipeline.run(ReservationEvent::forced(reservation)).await.map(Some)
    }

    /// Returns cursor and queue statistics.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn stats(&self) -> Result<PollingStats> {
        let cursor = self.storage.find_cursor(CURSOR_NAME.to_string()).await?;
        let retry_queue_depth = self.retry_queue.pending().await?.len();

        let mut registered_tasks = Vec::new();
        for (task, _) in self.config.recurring_tasks() {
            if self.scheduler.is_scheduled(task).await {
                registered_tasks.push(task);
            }
        }

        Ok(PollingStats {
            average_lag_seconds: cursor.as_ref().map_or(0.0, PollCursor::average_lag_seconds),
            cursor,
            retry_queue_depth,
            registered_tasks,
        })
    }

    async fn upstream_allowed(&self) -> bool {
        match self.limiter.attempt(UPSTREAM_POLL_KEY, self.config.upstream_rate_limit).await {
            RateLimitDecision::Allowed { .. } => true,
            RateLimitDecision::Blocked { retry_after_seconds } => {
                tracing::warn!(retry_after_seconds, "upstream poll throttled locally");
                false
            },
        }
    }

    async fn update_cursor(&self, update: crate::storage::CursorUpdate) -> Result<PollCursor> {
        let now = self.clock.now();
        let cursor = self
            .storage
            .update_cursor(
                PollCursor::new(CURSOR_NAME, now),
                Box::new(move |cursor: &mut PollCursor| {
                    update(cursor);
                    cursor.updated_at = now;
                }),
            )
            .await?;
        Ok(cursor)
    }

    /// Runs `cycle` while holding the poll lock, waiting at most `wait`.
    ///
    /// The lock is released on every return path; a crash leaves it to
    /// expire after `lock_ttl`.
    async fn with_lock<'a, F, Fut>(&'a self, tier: PollTier, wait: Duration, cycle: F) -> Result<PollReport>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<PollReport>> + 'a,
    {
        if !self.acquire_lock(wait).await? {
            tracing::debug!(?tier, "poll lock busy, skipping cycle");
            return Ok(PollReport::empty(tier, PollStatus::LockBusy));
        }

        let result = cycle().await;

        if let Err(e) = self.storage.release_lock(POLL_LOCK_NAME.to_string(), self.owner.clone()).await {
            tracing::warn!(error = %e, "failed to release poll lock, it will expire");
        }

        result
    }

    async fn acquire_lock(&self, wait: Duration) -> Result<bool> {
        const RETRY_INTERVAL: Duration = Duration::from_millis(250);

        let ttl = chrono::Duration::from_std(self.config.lock_ttl).unwrap_or_default();
        let deadline = self.clock.now() + chrono::Duration::from_std(wait).unwrap_or_default();

        loop {
            let now = self.clock.now();
            let acquired = self
                .storage
                .try_acquire_lock(POLL_LOCK_NAME.to_string(), self.owner.clone(), now, now + ttl)
                .await?;
            if acquired {
                return Ok(true);
            }
            if now >= deadline {
                return Ok(false);
            }
            self.clock.sleep(RETRY_INTERVAL).await;
        }
    }
}

fn record_outcome(report: &mut PollReport, outcome: &PipelineReport) {
    if outcome.skipped() {
        report.skipped += 1;
    } else if outcome.result.is_some() {
        report.dispatched += 1;
    }
}

/// True for paths that never trigger traffic checks.
pub fn is_administrative(path: &str) -> bool {
    ADMINISTRATIVE_PREFIXES.iter().any(|prefix| {
        path == *prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
    })
}

fn duration_seconds(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn administrative_paths_are_recognized() {
        assert!(is_administrative("/admin"));
        assert!(is_administrative("/admin/polling/stats"));
        assert!(is_administrative("/internal/poll"));
        assert!(is_administrative("/health"));

        assert!(!is_administrative("/webhooks/reservations"));
        assert!(!is_administrative("/administrator"));
        assert!(!is_administrative("/"));
    }

    #[test]
    fn default_recurring_tasks_cover_every_tier() {
        let tasks: Vec<ScheduledTask> =
            PollerConfig::default().recurring_tasks().iter().map(|(task, _)| *task).collect();

        assert_eq!(tasks, vec![
            ScheduledTask::ContinuousPoll,
            ScheduledTask::DeepCheck,
            ScheduledTask::RetryQueue,
            ScheduledTask::HealthCheck,
        ]);
    }
}
