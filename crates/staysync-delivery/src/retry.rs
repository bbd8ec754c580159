//! Backoff policy and the durable retry queue.
//!
//! [`RetryPolicy`] computes when a failed call is tried again: exponential
//! growth from `base_delay`, capped at `max_delay`, with optional jitter.
//! [`RetryQueue`] stores failed outbound calls verbatim and replays them on
//! each pass until they succeed or reach `max_attempts`, consulting the
//! circuit breaker and rate limiter exactly like first attempts.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use staysync_core::{
    models::{NewRetryEntry, RetryEntry, RetryPriority, RetryStatus},
    Clock,
};
use uuid::Uuid;

use crate::{
    circuit::CircuitBreakerManager,
    client::{self, OutboundRequest, Transport},
    error::{DeliveryError, Result},
    rate_limit::{integration_key, RateLimit, RateLimitDecision, RateLimiter},
    storage::ReliabilityStorage,
};

/// Retry policy for failed outbound calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts before an entry is abandoned.
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between retry attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Returns the capped delay before retry number `attempt` (1-based),
    /// without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * attempt.max(1),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(20);
                let multiplier = 2_u32.saturating_pow(exponent);
                self.base_delay.saturating_mul(multiplier)
            },
        };

        std::cmp::min(delay, self.max_delay)
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Retry decision context for a failed call.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt number that just failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: DeliveryError,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Retry policy to apply.
    pub policy: RetryPolicy,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the call at the specified time.
    Retry {
        /// When the next attempt should be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Do not retry.
    GiveUp {
        /// Reason why the call should not be retried
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed call.
    pub fn new(
        attempt_number: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Determines if and when to retry based on the failure context.
    ///
    /// Gives up once `max_attempts` is reached or for non-retryable errors.
    /// Rate limit errors wait for their Retry-After guidance instead of the
    /// backoff curve.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + chrono_delay }
    }

    fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return Duration::from_secs(retry_after_seconds);
        }
        if matches!(self.error, DeliveryError::CircuitOpen { .. }) {
            return Duration::ZERO;
        }

        let capped_delay = self.policy.delay_for_attempt(self.attempt_number);
        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Applies jitter to a duration to prevent thundering herd effects.
///
/// Randomizes the delay by ±jitter_factor percentage.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

/// Operation type of a forwarded reservation call.
pub const FORWARD_OPERATION: &str = "forward_reservation";

/// A failed call to hand to the retry queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRequest {
    /// Integration the call targets.
    pub service: String,
    /// Kind of operation.
    pub operation_type: String,
    /// Processing priority.
    pub priority: RetryPriority,
    /// The original call, replayed verbatim.
    pub call: OutboundRequest,
    /// Logical identity of this retry; a second enqueue is a no-op.
    pub dedupe_key: String,
    /// First time the retry may run.
    pub due_at: DateTime<Utc>,
    /// Why the first attempt did not succeed.
    pub last_error: Option<String>,
}

impl RetryRequest {
    /// Builds a retry for one reservation forwarded to one integration.
    ///
    /// Reservations without an identifier get a unique key so they are
    /// never merged with another reservation's retry.
    pub fn forward(
        service: impl Into<String>,
        reservation_id: Option<&str>,
        call: OutboundRequest,
        priority: RetryPriority,
        due_at: DateTime<Utc>,
        last_error: impl Into<String>,
    ) -> Self {
        let service = service.into();
        let reservation = reservation_id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        Self {
            dedupe_key: format!("{service}:{reservation}:{FORWARD_OPERATION}"),
            service,
            operation_type: FORWARD_OPERATION.to_string(),
            priority,
            call,
            due_at,
            last_error: Some(last_error.into()),
        }
    }
}

/// Retry queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryQueueConfig {
    /// Backoff policy; `max_attempts` is stamped on each new entry.
    pub policy: RetryPolicy,
    /// Entries claimed per pass.
    pub batch_size: usize,
    /// How long a claimed entry stays invisible to other passes.
    pub lease: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self { policy: RetryPolicy::default(), batch_size: 50, lease: Duration::from_secs(300) }
    }
}

/// Counters for one `process_due` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryPassReport {
    /// Entries claimed.
    pub claimed: usize,
    /// Entries delivered and deleted.
    pub succeeded: usize,
    /// Entries that failed again and were rescheduled.
    pub rescheduled: usize,
    /// Entries deleted without success.
    pub abandoned: usize,
    /// Entries pushed back by an open circuit or rate limit, attempt not consumed.
    pub deferred: usize,
    /// Entries left leased because the store failed mid-pass.
    pub errors: usize,
}

/// Durable backlog of failed outbound calls.
#[derive(Clone)]
pub struct RetryQueue {
    config: RetryQueueConfig,
    storage: Arc<dyn ReliabilityStorage>,
    circuit: CircuitBreakerManager,
    limiter: RateLimiter,
    rate_limits: HashMap<String, RateLimit>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue").field("config", &self.config).finish_non_exhaustive()
    }
}

enum Outcome {
    Succeeded,
    Rescheduled,
    Abandoned,
    Deferred,
}

impl RetryQueue {
    /// Creates a retry queue.
    pub fn new(
        config: RetryQueueConfig,
        storage: Arc<dyn ReliabilityStorage>,
        circuit: CircuitBreakerManager,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::new(storage.clone(), clock.clone());
        Self {
            config,
            storage,
            circuit,
            limiter,
            rate_limits: HashMap::new(),
            transport,
            clock,
        }
    }

    /// Applies per-integration rate limits to replays.
    #[must_use]
    pub fn with_rate_limits(mut self, rate_limits: HashMap<String, RateLimit>) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    /// Returns the backoff policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.config.policy
    }

    /// Inserts a retry with zero attempts.
    ///
    /// Returns the stored entry. A retry whose dedupe key is already queued
    /// is not inserted again; the existing entry is returned.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the insert fails.
    pub async fn enqueue(&self, request: RetryRequest) -> Result<RetryEntry> {
        let payload = serde_json::to_value(&request.call)
            .map_err(|e| DeliveryError::internal(format!("failed to serialize call: {e}")))?;

        let entry = NewRetryEntry {
            service: request.service,
            operation_type: request.operation_type,
            priority: request.priority,
            payload,
            dedupe_key: request.dedupe_key,
            scheduled_retry_at: request.due_at,
            max_attempts: i32::try_from(self.config.policy.max_attempts).unwrap_or(i32::MAX),
            last_error: request.last_error,
        }
        .into_entry(self.clock.now());

        let (stored, inserted) = self.storage.enqueue_retry(entry).await?;
        if inserted {
            tracing::info!(
                retry_id = %stored.id,
                service = %stored.service,
                priority = ?stored.priority,
                scheduled_retry_at = %stored.scheduled_retry_at,
                "retry enqueued"
            );
        } else {
            tracing::debug!(retry_id = %stored.id, dedupe_key = %stored.dedupe_key, "retry already queued");
        }

        Ok(stored)
    }

    /// Lists queued entries in processing order.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the read fails.
    pub async fn pending(&self) -> Result<Vec<RetryEntry>> {
        Ok(self.storage.list_retries().await?)
    }

    /// Replays every entry due at `now`.
    ///
    /// Entries are claimed under a lease so overlapping passes never send
    /// the same entry twice. A store failure on one entry leaves it leased
    /// until the lease lapses and the pass moves on.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the claim itself fails.
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<RetryPassReport> {
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let entries =
            self.storage.claim_due_retries(now, now + lease, self.config.batch_size).await?;

        let mut report = RetryPassReport { claimed: entries.len(), ..RetryPassReport::default() };

        for entry in entries {
            let retry_id = entry.id;
            match self.process_entry(entry, now).await {
                Ok(Outcome::Succeeded) => report.succeeded += 1,
                Ok(Outcome::Rescheduled) => report.rescheduled += 1,
                Ok(Outcome::Abandoned) => report.abandoned += 1,
                Ok(Outcome::Deferred) => report.deferred += 1,
                Err(e) => {
                    tracing::error!(retry_id = %retry_id, error = %e, "retry processing failed");
                    report.errors += 1;
                },
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                rescheduled = report.rescheduled,
                abandoned = report.abandoned,
                deferred = report.deferred,
                "retry pass complete"
            );
        }

        Ok(report)
    }

    async fn process_entry(&self, entry: RetryEntry, now: DateTime<Utc>) -> Result<Outcome> {
        let call: OutboundRequest = match serde_json::from_value(entry.payload.clone()) {
            Ok(call) => call,
            Err(e) => {
                tracing::error!(retry_id = %entry.id, error = %e, "unreadable retry payload, abandoning");
                self.storage.remove_retry(entry.id, RetryStatus::Abandoned).await?;
                return Ok(Outcome::Abandoned);
            },
        };

        if !self.circuit.allow_request(&entry.service).await? {
            let retry_at = self.circuit.retry_at(&entry.service).await?.unwrap_or(now);
            tracing::debug!(retry_id = %entry.id, service = %entry.service, %retry_at, "circuit open, deferring retry");
            self.storage.defer_retry(entry.id, retry_at.max(now), now).await?;
            return Ok(Outcome::Deferred);
        }

        if let Some(limit) = self.rate_limits.get(&entry.service) {
            let decision = self.limiter.attempt(&integration_key(&entry.service), *limit).await;
            if let RateLimitDecision::Blocked { retry_after_seconds } = decision {
                let next = now + chrono::Duration::seconds(i64::try_from(retry_after_seconds).unwrap_or(60));
                self.storage.defer_retry(entry.id, next, now).await?;
                return Ok(Outcome::Deferred);
            }
        }

        match client::execute(self.transport.as_ref(), &call).await {
            Ok(_) => {
                self.circuit.record_success(&entry.service).await?;
                self.storage.remove_retry(entry.id, RetryStatus::Done).await?;
                tracing::info!(
                    retry_id = %entry.id,
                    service = %entry.service,
                    attempts = entry.attempts + 1,
                    "retry delivered"
                );
                Ok(Outcome::Succeeded)
            },
            Err(error) => self.record_failure(entry, error, now).await,
        }
    }

    async fn record_failure(
        &self,
        entry: RetryEntry,
        error: DeliveryError,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        if error.is_retryable() {
            self.circuit.record_failure(&entry.service).await?;
        }

        let attempts = entry.attempts.saturating_add(1);
        let policy = RetryPolicy {
            max_attempts: u32::try_from(entry.max_attempts).unwrap_or(0),
            ..self.config.policy.clone()
        };
        let context = RetryContext::new(
            u32::try_from(attempts).unwrap_or(u32::MAX),
            error.clone(),
            now,
            policy,
        );

        match context.decide_retry() {
            RetryDecision::Retry { next_attempt_at } => {
                tracing::warn!(
                    retry_id = %entry.id,
                    service = %entry.service,
                    attempts,
                    max_attempts = entry.max_attempts,
                    %next_attempt_at,
                    error = %error,
                    "retry failed, rescheduling"
                );
                self.storage
                    .reschedule_retry(entry.id, attempts, next_attempt_at, error.to_string(), now)
                    .await?;
                Ok(Outcome::Rescheduled)
            },
            RetryDecision::GiveUp { reason } => {
                if error.is_permanent() {
                    tracing::error!(
                        retry_id = %entry.id,
                        service = %entry.service,
                        category = %error.category(),
                        error = %error,
                        "integration rejected retry permanently, abandoning"
                    );
                } else {
                    tracing::warn!(
                        retry_id = %entry.id,
                        service = %entry.service,
                        attempts,
                        %reason,
                        "abandoning retry"
                    );
                }
                self.storage.remove_retry(entry.id, RetryStatus::Abandoned).await?;
                Ok(Outcome::Abandoned)
            },
        }
    }
}
