//! Circuit breaker implementation for downstream service protection.
//!
//! Provides per-service circuit breakers that fail fast during outages and
//! test recovery with trial calls. State is a row in the shared store keyed
//! by service name, so every node and every retry pass sees the same
//! breaker. Transitions are applied atomically under the row lock.
//!
//! # Circuit Breaker State Machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │   (Normal Operation)    │
//!                          │                         │
//!                          │ ● All requests allowed  │
//!                          │ ● Counting failures     │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!                           │                        │
//!      failure_threshold    │                        │ success_threshold
//!      consecutive failures │                        │ successes
//!                           ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │                  │       HALF-OPEN       │
//!    │      (Fail Fast)        │ recovery_timeout │   (Testing Recovery)  │
//!    │                         │ ───────────────▶ │                       │
//!    │ ● No I/O performed      │                  │ ● Trial calls allowed │
//!    │ ● Calls deferred        │ ◀─────────────── │                       │
//!    └─────────────────────────┘   any failure    └───────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use staysync_core::RealClock;
//! use staysync_delivery::{
//!     circuit::{CircuitBreakerManager, CircuitConfig},
//!     storage::memory::MemoryStorage,
//! };
//!
//! # async fn example() -> staysync_delivery::Result<()> {
//! let manager = CircuitBreakerManager::new(
//!     CircuitConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(RealClock::new()),
//! );
//!
//! if manager.allow_request("meta").await? {
//!     let call: Result<(), &str> = Ok(());
//!     match call {
//!         Ok(()) => manager.record_success("meta").await?,
//!         Err(_) => manager.record_failure("meta").await?,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use staysync_core::{
    models::{CircuitRecord, CircuitState},
    Clock,
};

use crate::{
    error::{DeliveryError, Result},
    storage::ReliabilityStorage,
};

/// Circuit breaker configuration applied to every service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting trial calls.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// Thresholds from the live config, written over whatever a row was seeded
/// with before each evaluation.
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    failure: i32,
    success: i32,
    recovery_seconds: i64,
}

impl Thresholds {
    fn apply(self, record: &mut CircuitRecord) {
        record.failure_threshold = self.failure;
        record.success_threshold = self.success;
        record.recovery_timeout_seconds = self.recovery_seconds;
    }
}

/// Shared-store backed circuit breaker manager for all services.
#[derive(Clone)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    storage: Arc<dyn ReliabilityStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager").field("config", &self.config).finish()
    }
}

impl CircuitBreakerManager {
    /// Creates a new circuit breaker manager.
    pub fn new(
        config: CircuitConfig,
        storage: Arc<dyn ReliabilityStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, storage, clock }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            failure: i32::try_from(self.config.failure_threshold).unwrap_or(i32::MAX),
            success: i32::try_from(self.config.success_threshold).unwrap_or(i32::MAX),
            recovery_seconds: i64::try_from(self.config.recovery_timeout.as_secs())
                .unwrap_or(i64::MAX),
        }
    }

    fn seed(&self, service: &str, now: DateTime<Utc>) -> CircuitRecord {
        let thresholds = self.thresholds();
        CircuitRecord::closed(
            service,
            thresholds.failure,
            thresholds.success,
            thresholds.recovery_seconds,
            now,
        )
    }

    /// Determines if a request to the service may proceed.
    ///
    /// Returns `false` only for an open circuit whose recovery timeout has
    /// not elapsed. An open circuit past its timeout flips to half-open and
    /// admits the call.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the circuit row cannot be
    /// read or updated.
    pub async fn allow_request(&self, service: &str) -> Result<bool> {
        let now = self.clock.now();
        let thresholds = self.thresholds();

        if let Some(mut record) = self.storage.find_circuit(service.to_string()).await? {
            thresholds.apply(&mut record);
            if record.state != CircuitState::Open {
                return Ok(true);
            }
            if record.retry_at().is_some_and(|retry_at| now < retry_at) {
                return Ok(false);
            }
        } else {
            return Ok(true);
        }

        let service_name = service.to_string();
        let (_, allowed) = self
            .storage
            .update_circuit(
                self.seed(service, now),
                Box::new(move |record| {
                    thresholds.apply(record);
                    match record.state {
                        CircuitState::Closed | CircuitState::HalfOpen => true,
                        CircuitState::Open => {
                            let elapsed = record.opened_at.map_or(i64::MAX, |opened| {
                                now.signed_duration_since(opened).num_seconds()
                            });
                            if elapsed >= record.recovery_timeout_seconds {
                                transition_to_half_open(&service_name, record, now);
                                true
                            } else {
                                false
                            }
                        },
                    }
                }),
            )
            .await?;

        Ok(allowed)
    }

    /// Records a successful call.
    ///
    /// Resets the failure count while closed; counts toward closing while
    /// half-open.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the update fails.
    pub async fn record_success(&self, service: &str) -> Result<()> {
        let now = self.clock.now();
        let service_name = service.to_string();
        let thresholds = self.thresholds();

        self.storage
            .update_circuit(
                self.seed(service, now),
                Box::new(move |record| {
                    thresholds.apply(record);
                    match record.state {
                        CircuitState::Closed => {
                            record.failure_count = 0;
                        },
                        CircuitState::Open => {
                            tracing::warn!(service = %service_name, "recorded success for open circuit");
                        },
                        CircuitState::HalfOpen => {
                            record.success_count += 1;
                            if record.success_count >= record.success_threshold {
                                transition_to_closed(&service_name, record);
                            }
                        },
                    }
                    record.updated_at = now;
                    true
                }),
            )
            .await?;

        Ok(())
    }

    /// Records a failed call.
    ///
    /// Opens a closed circuit once failures reach the threshold; any failure
    /// while half-open reopens immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the update fails.
    pub async fn record_failure(&self, service: &str) -> Result<()> {
        let now = self.clock.now();
        let service_name = service.to_string();
        let thresholds = self.thresholds();

        self.storage
            .update_circuit(
                self.seed(service, now),
                Box::new(move |record| {
                    thresholds.apply(record);
                    match record.state {
                        CircuitState::Closed => {
                            record.failure_count += 1;
                            if record.failure_count >= record.failure_threshold {
                                transition_to_open(&service_name, record, now);
                            }
                        },
                        CircuitState::Open => {},
                        CircuitState::HalfOpen => transition_to_open(&service_name, record, now),
                    }
                    record.updated_at = now;
                    true
                }),
            )
            .await?;

        Ok(())
    }

    /// Returns when the service's open circuit will admit trial calls.
    ///
    /// `None` when the circuit is not open.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the read fails.
    pub async fn retry_at(&self, service: &str) -> Result<Option<DateTime<Utc>>> {
        let thresholds = self.thresholds();
        let record = self.storage.find_circuit(service.to_string()).await?;
        Ok(record.and_then(|mut record| {
            thresholds.apply(&mut record);
            record.retry_at()
        }))
    }

    /// Returns the current circuit row for a service.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the read fails.
    pub async fn circuit(&self, service: &str) -> Result<Option<CircuitRecord>> {
        Ok(self.storage.find_circuit(service.to_string()).await?)
    }

    /// Returns every known circuit.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the read fails.
    pub async fn all_circuits(&self) -> Result<Vec<CircuitRecord>> {
        Ok(self.storage.list_circuits().await?)
    }

    /// Forces a circuit to the specified state (for testing/admin purposes).
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the update fails.
    pub async fn force_state(&self, service: &str, state: CircuitState) -> Result<()> {
        let now = self.clock.now();
        let service_name = service.to_string();

        self.storage
            .update_circuit(
                self.seed(service, now),
                Box::new(move |record| {
                    match state {
                        CircuitState::Open => transition_to_open(&service_name, record, now),
                        CircuitState::HalfOpen => transition_to_half_open(&service_name, record, now),
                        CircuitState::Closed => transition_to_closed(&service_name, record),
                    }
                    record.updated_at = now;
                    true
                }),
            )
            .await?;

        Ok(())
    }
}

fn transition_to_open(service: &str, record: &mut CircuitRecord, now: DateTime<Utc>) {
    tracing::warn!(
        service,
        failures = record.failure_count,
        previous = %record.state,
        "circuit breaker opening"
    );

    record.state = CircuitState::Open;
    record.opened_at = Some(now);
    record.success_count = 0;
}

fn transition_to_half_open(service: &str, record: &mut CircuitRecord, now: DateTime<Utc>) {
    tracing::info!(service, "circuit breaker transitioning to half-open");

    record.state = CircuitState::HalfOpen;
    record.success_count = 0;
    record.updated_at = now;
}

fn transition_to_closed(service: &str, record: &mut CircuitRecord) {
    tracing::info!(service, "circuit breaker closing - service recovered");

    record.state = CircuitState::Closed;
    record.failure_count = 0;
    record.success_count = 0;
    record.opened_at = None;
}

/// Checks if a call should be blocked by the circuit breaker.
///
/// Returns a circuit open error if the call must be deferred, or Ok(()) if
/// it should proceed.
///
/// # Errors
///
/// Returns `DeliveryError::CircuitOpen` when blocked, or a storage error.
pub async fn check_circuit_breaker(manager: &CircuitBreakerManager, service: &str) -> Result<()> {
    if manager.allow_request(service).await? {
        Ok(())
    } else {
        Err(DeliveryError::circuit_open(service))
    }
}

#[cfg(test)]
mod tests {
    use staysync_core::TestClock;

    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }

    fn manager() -> (CircuitBreakerManager, TestClock) {
        let clock = TestClock::new();
        let manager = CircuitBreakerManager::new(
            test_config(),
            Arc::new(MemoryStorage::new()),
            Arc::new(clock.clone()),
        );
        (manager, clock)
    }

    async fn state(manager: &CircuitBreakerManager, service: &str) -> CircuitState {
        manager.circuit(service).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn unknown_service_is_allowed() {
        let (manager, _) = manager();
        assert!(manager.allow_request("ga4").await.unwrap());
        assert!(manager.circuit("ga4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit() {
        let (manager, _) = manager();

        for _ in 0..2 {
            manager.record_failure("meta").await.unwrap();
            assert!(manager.allow_request("meta").await.unwrap());
        }

        manager.record_failure("meta").await.unwrap();

        assert!(!manager.allow_request("meta").await.unwrap());
        assert_eq!(state(&manager, "meta").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_half_opens_after_recovery_timeout() {
        let (manager, clock) = manager();
        manager.force_state("meta", CircuitState::Open).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(!manager.allow_request("meta").await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(manager.allow_request("meta").await.unwrap());
        assert_eq!(state(&manager, "meta").await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let (manager, _) = manager();
        manager.force_state("meta", CircuitState::HalfOpen).await.unwrap();

        manager.record_success("meta").await.unwrap();
        assert_eq!(state(&manager, "meta").await, CircuitState::HalfOpen);

        manager.record_success("meta").await.unwrap();
        assert_eq!(state(&manager, "meta").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let (manager, _) = manager();
        manager.force_state("meta", CircuitState::HalfOpen).await.unwrap();

        manager.record_success("meta").await.unwrap();
        manager.record_failure("meta").await.unwrap();

        assert!(!manager.allow_request("meta").await.unwrap());
        assert_eq!(state(&manager, "meta").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (manager, _) = manager();

        manager.record_failure("meta").await.unwrap();
        manager.record_failure("meta").await.unwrap();
        assert_eq!(manager.circuit("meta").await.unwrap().unwrap().failure_count, 2);

        manager.record_success("meta").await.unwrap();
        assert_eq!(manager.circuit("meta").await.unwrap().unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn retry_at_reports_recovery_time() {
        let (manager, clock) = manager();
        let opened = clock.now();

        assert_eq!(manager.retry_at("meta").await.unwrap(), None);

        manager.force_state("meta", CircuitState::Open).await.unwrap();

        assert_eq!(
            manager.retry_at("meta").await.unwrap(),
            Some(opened + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn existing_circuit_follows_updated_config() {
        let clock = TestClock::new();
        let storage = MemoryStorage::new();
        let before = CircuitBreakerManager::new(
            test_config(),
            Arc::new(storage.clone()),
            Arc::new(clock.clone()),
        );
        before.record_failure("meta").await.unwrap();

        let after = CircuitBreakerManager::new(
            CircuitConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(10),
                success_threshold: 1,
            },
            Arc::new(storage),
            Arc::new(clock.clone()),
        );
        after.record_failure("meta").await.unwrap();

        let record = after.circuit("meta").await.unwrap().unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.failure_threshold, 2);
        assert_eq!(record.recovery_timeout_seconds, 10);
        assert_eq!(
            after.retry_at("meta").await.unwrap(),
            Some(clock.now() + chrono::Duration::seconds(10))
        );

        clock.advance(Duration::from_secs(10));
        assert!(after.allow_request("meta").await.unwrap());
        after.record_success("meta").await.unwrap();
        assert_eq!(state(&after, "meta").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn check_circuit_breaker_helper() {
        let (manager, _) = manager();

        assert!(check_circuit_breaker(&manager, "meta").await.is_ok());

        manager.force_state("meta", CircuitState::Open).await.unwrap();
        let result = check_circuit_breaker(&manager, "meta").await;

        if let Err(DeliveryError::CircuitOpen { service }) = result {
            assert_eq!(service, "meta");
        } else {
            unreachable!("Expected CircuitOpen error, got: {:?}", result);
        }
    }
}
