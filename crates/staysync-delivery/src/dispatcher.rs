//! Fan-out of one reservation to every enabled integration.
//!
//! Integrations are attempted independently and concurrently; one failing
//! never affects the others. The aggregate [`DispatchResult`] reports which
//! integrations succeeded, failed or were skipped, and every failure that
//! is worth retrying comes back as a [`RetryRequest`] carrying the original
//! call verbatim.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use staysync_core::{
    models::{DispatchResult, Reservation, RetryPriority},
    Clock,
};

use crate::{
    circuit::CircuitBreakerManager,
    client::{self, OutboundRequest, Transport},
    error::{DeliveryError, ErrorCategory},
    integration::Integration,
    rate_limit::{integration_key, RateLimitDecision, RateLimiter},
    retry::{RetryContext, RetryDecision, RetryPolicy, RetryRequest},
};

/// Result of a fan-out plus the retries it produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Aggregate result.
    pub result: DispatchResult,
    /// One retry per failed, retryable integration.
    pub retries: Vec<RetryRequest>,
}

enum Attempt {
    Succeeded,
    Skipped(DeliveryError),
    Failed { error: DeliveryError, retry: Option<(OutboundRequest, RetryPriority, DateTime<Utc>)> },
}

/// Sends reservations to integrations.
#[derive(Clone)]
pub struct Dispatcher {
    integrations: Vec<Arc<dyn Integration>>,
    circuit: CircuitBreakerManager,
    limiter: RateLimiter,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.integrations.iter().map(|i| i.name()).collect();
        f.debug_struct("Dispatcher").field("integrations", &names).finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        integrations: Vec<Arc<dyn Integration>>,
        circuit: CircuitBreakerManager,
        limiter: RateLimiter,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { integrations, circuit, limiter, transport, policy, clock }
    }

    /// Returns the configured integrations.
    pub fn integrations(&self) -> &[Arc<dyn Integration>] {
        &self.integrations
    }

    /// Attempts every integration for one reservation.
    pub async fn dispatch(
        &self,
        reservation: &Reservation,
        reservation_id: Option<&str>,
    ) -> DispatchOutcome {
        let attempts =
            join_all(self.integrations.iter().map(|integration| {
                self.attempt(integration.as_ref(), reservation)
            }))
            .await;

        let mut result = DispatchResult::new(reservation_id.map(str::to_string));
        let mut retries = Vec::new();

        for (integration, attempt) in self.integrations.iter().zip(attempts) {
            let name = integration.name().to_string();
            match attempt {
                Attempt::Succeeded => result.successful.push(name),
                Attempt::Skipped(reason) => {
                    tracing::warn!(
                        integration = %name,
                        reservation_id,
                        category = %reason.category(),
                        reason = %reason,
                        "integration skipped"
                    );
                    result.skipped.push(name);
                },
                Attempt::Failed { error, retry } => {
                    if let Some((call, priority, due_at)) = retry {
                        retries.push(RetryRequest::forward(
                            &name,
                            reservation_id,
                            call,
                            priority,
                            due_at,
                            error.to_string(),
                        ));
                    }
                    result.errors.push((name.clone(), error.to_string()));
                    result.failed.push(name);
                },
            }
        }

        result.finalize();
        tracing::info!(
            reservation_id,
            status = %result.status,
            successful = ?result.successful,
            failed = ?result.failed,
            skipped = ?result.skipped,
            "reservation dispatched"
        );

        DispatchOutcome { result, retries }
    }

    async fn attempt(&self, integration: &dyn Integration, reservation: &Reservation) -> Attempt {
        let name = integration.name();

        if !integration.is_enabled() {
            return Attempt::Skipped(DeliveryError::configuration(format!(
                "integration {name} is not configured"
            )));
        }

        let call = match integration.build_request(reservation) {
            Ok(call) => call,
            Err(e) if e.category() == ErrorCategory::DataQuality => return Attempt::Skipped(e),
            Err(e) => return Attempt::Failed { error: e, retry: None },
        };

        let now = self.clock.now();

        if let Some(limit) = integration.rate_limit() {
            if let RateLimitDecision::Blocked { retry_after_seconds } =
                self.limiter.attempt(&integration_key(name), limit).await
            {
                let error = DeliveryError::rate_limited(retry_after_seconds);
                let due_at = self.first_retry_at(&error, now);
                return Attempt::Failed { error, retry: Some((call, RetryPriority::Normal, due_at)) };
            }
        }

        let allowed = self.circuit.allow_request(name).await.unwrap_or_else(|e| {
            tracing::warn!(integration = %name, error = %e, "circuit state unavailable, allowing call");
            true
        });
        if !allowed {
            return Attempt::Failed {
                error: DeliveryError::circuit_open(name),
                retry: Some((call, RetryPriority::High, now)),
            };
        }

        match client::execute(self.transport.as_ref(), &call).await {
            Ok(_) => {
                if let Err(e) = self.circuit.record_success(name).await {
                    tracing::warn!(integration = %name, error = %e, "failed to record circuit success");
                }
                Attempt::Succeeded
            },
            Err(error) => {
                if error.is_retryable() {
                    if let Err(e) = self.circuit.record_failure(name).await {
                        tracing::warn!(integration = %name, error = %e, "failed to record circuit failure");
                    }
                }

                if error.is_permanent() {
                    tracing::error!(
                        integration = %name,
                        category = %error.category(),
                        error = %error,
                        "integration rejected reservation permanently"
                    );
                    return Attempt::Failed { error, retry: None };
                }

                let due_at = self.first_retry_at(&error, self.clock.now());
                Attempt::Failed { error, retry: Some((call, RetryPriority::Normal, due_at)) }
            },
        }
    }

    fn first_retry_at(&self, error: &DeliveryError, now: DateTime<Utc>) -> DateTime<Utc> {
        let policy = RetryPolicy { max_attempts: u32::MAX, ..self.policy.clone() };
        match RetryContext::new(1, error.clone(), now, policy).decide_retry() {
            RetryDecision::Retry { next_attempt_at } => next_attempt_at,
            RetryDecision::GiveUp { .. } => now,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;
    use staysync_core::{models::DispatchStatus, TestClock};

    use super::*;
    use crate::{
        circuit::CircuitConfig,
        client::OutboundResponse,
        error::Result,
        integration::{JsonIntegration, JsonIntegrationConfig},
        rate_limit::RateLimit,
        storage::{memory::MemoryStorage, ReliabilityStorage},
    };

    /// Responds by URL host: `status.<code>.test` returns that code.
    #[derive(Default)]
    struct ByHost {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for ByHost {
        async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse> {
            self.calls.lock().unwrap().push(request.url.clone());
            let status = request
                .url
                .split('.')
                .nth(1)
                .and_then(|code| code.parse().ok())
                .unwrap_or(200);
            Ok(OutboundResponse {
                status_code: status,
                headers: HashMap::new(),
                body: String::new(),
                duration: Duration::ZERO,
            })
        }
    }

    fn integration(name: &str, status: u16) -> Arc<dyn Integration> {
        Arc::new(JsonIntegration::new(JsonIntegrationConfig::new(
            name,
            format!("https://status.{status}.test/{name}"),
        )))
    }

    fn dispatcher(integrations: Vec<Arc<dyn Integration>>) -> (Dispatcher, Arc<ByHost>, TestClock) {
        let clock = TestClock::new();
        let storage: Arc<dyn ReliabilityStorage> = Arc::new(MemoryStorage::new());
        let circuit =
            CircuitBreakerManager::new(CircuitConfig::default(), storage.clone(), Arc::new(clock.clone()));
        let limiter = RateLimiter::new(storage, Arc::new(clock.clone()));
        let transport = Arc::new(ByHost::default());
        let dispatcher = Dispatcher::new(
            integrations,
            circuit,
            limiter,
            transport.clone(),
            RetryPolicy { base_delay: Duration::from_secs(30), ..RetryPolicy::default() },
            Arc::new(clock.clone()),
        );
        (dispatcher, transport, clock)
    }

    fn reservation() -> Reservation {
        Reservation::from_value(json!({"code": "R1", "amount": 100})).unwrap()
    }

    #[tokio::test]
    async fn partial_success_retries_only_the_failure() {
        let (dispatcher, _, clock) =
            dispatcher(vec![integration("one", 200), integration("two", 500), integration("three", 204)]);

        let outcome = dispatcher.dispatch(&reservation(), Some("r1")).await;

        assert_eq!(outcome.result.status, DispatchStatus::Partial);
        assert_eq!(outcome.result.successful, vec!["one", "three"]);
        assert_eq!(outcome.result.failed, vec!["two"]);
        assert_eq!(outcome.retries.len(), 1);
        assert_eq!(outcome.retries[0].service, "two");
        assert_eq!(outcome.retries[0].due_at, clock.now() + chrono::Duration::seconds(30));
        assert_eq!(outcome.retries[0].call.url, "https://status.500.test/two");
    }

    #[tokio::test]
    async fn missing_field_skips_only_that_integration() {
        let mut meta = JsonIntegrationConfig::new("meta", "https://status.200.test/meta");
        meta.required_fields = vec!["email".into()];
        let (dispatcher, transport, _) =
            dispatcher(vec![integration("ga4", 200), Arc::new(JsonIntegration::new(meta))]);

        let outcome = dispatcher.dispatch(&reservation(), Some("r1")).await;

        assert_eq!(outcome.result.status, DispatchStatus::Success);
        assert_eq!(outcome.result.skipped, vec!["meta"]);
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (dispatcher, _, _) = dispatcher(vec![integration("ga4", 401)]);

        let outcome = dispatcher.dispatch(&reservation(), Some("r1")).await;

        assert_eq!(outcome.result.status, DispatchStatus::Failed);
        assert!(outcome.retries.is_empty());
        assert!(outcome.result.errors[0].1.contains("401"));
    }

    #[tokio::test]
    async fn open_circuit_defers_at_high_priority_without_io() {
        let (dispatcher, transport, clock) = dispatcher(vec![integration("meta", 200)]);
        dispatcher.circuit.force_state("meta", staysync_core::models::CircuitState::Open).await.unwrap();

        let outcome = dispatcher.dispatch(&reservation(), Some("r1")).await;

        assert!(transport.calls.lock().unwrap().is_empty());
        assert_eq!(outcome.retries[0].priority, RetryPriority::High);
        assert_eq!(outcome.retries[0].due_at, clock.now());
    }

    #[tokio::test]
    async fn rate_limited_integration_retries_after_window() {
        let mut ga4 = JsonIntegrationConfig::new("ga4", "https://status.200.test/ga4");
        ga4.rate_limit = Some(RateLimit { max_requests: 1, window: Duration::from_secs(60) });
        let (dispatcher, _, clock) = dispatcher(vec![Arc::new(JsonIntegration::new(ga4))]);

        dispatcher.dispatch(&reservation(), Some("r1")).await;
        let second = dispatcher.dispatch(&reservation(), Some("r2")).await;

        assert_eq!(second.result.failed, vec!["ga4"]);
        assert_eq!(second.retries[0].due_at, clock.now() + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn no_enabled_integrations_is_success() {
        let disabled = JsonIntegrationConfig::new("ga4", "");
        let (dispatcher, _, _) = dispatcher(vec![Arc::new(JsonIntegration::new(disabled))]);

        let outcome = dispatcher.dispatch(&reservation(), None).await;

        assert_eq!(outcome.result.status, DispatchStatus::Success);
        assert_eq!(outcome.result.skipped, vec!["ga4"]);
    }
}
