//! Health check handler for service monitoring.
//!
//! Reports store connectivity and how long ago polling last succeeded.
//! A store failure makes the service unhealthy; stale polling only degrades
//! it, since webhooks keep flowing and self-healing restarts the timers.

use std::{sync::Arc, time::Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use staysync_core::Clock;
use staysync_delivery::{
    poller::{AdaptivePoller, CURSOR_NAME},
    storage::ReliabilityStorage,
};
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Polling is stale
    Degraded,
    /// Store unreachable
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Shared store connectivity
    pub storage: ComponentHealth,
    /// Poll freshness
    pub polling: PollingHealth,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Poll freshness.
#[derive(Debug, Serialize)]
pub struct PollingHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Last successful continuous poll
    pub last_successful_poll_at: Option<DateTime<Utc>>,
    /// Seconds since then
    pub lag_seconds: Option<i64>,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
    /// State not known, e.g. polling has never run
    Unknown,
}

/// Health service that encapsulates clock dependency for testable health
/// checks.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Performs service health checks.
    pub async fn health_check(
        &self,
        storage: &dyn ReliabilityStorage,
        poller: &AdaptivePoller,
    ) -> HealthResponse {
        debug!("Performing health check");

        let timestamp = self.clock.now();
        let started = Instant::now();
        let storage_health = match storage.health_check().await {
            Ok(()) => ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms: 0 },
            Err(e) => {
                error!(error = %e, "Storage health check failed");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some("storage unreachable".to_string()),
                    response_time_ms: 0,
                }
            },
        };
        let storage_health = ComponentHealth {
            response_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            ..storage_health
        };

        let polling = if storage_health.status == ComponentStatus::Up {
            self.polling_health(storage, poller, timestamp).await
        } else {
            PollingHealth { status: ComponentStatus::Unknown, last_successful_poll_at: None, lag_seconds: None }
        };

        let status = match (storage_health.status, polling.status) {
            (ComponentStatus::Down, _) => HealthStatus::Unhealthy,
            (_, ComponentStatus::Down) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        HealthResponse {
            status,
            timestamp,
            checks: HealthChecks { storage: storage_health, polling },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn polling_health(
        &self,
        storage: &dyn ReliabilityStorage,
        poller: &AdaptivePoller,
        now: DateTime<Utc>,
    ) -> PollingHealth {
        let last = match storage.find_cursor(CURSOR_NAME.to_string()).await {
            Ok(cursor) => cursor.and_then(|c| c.last_successful_continuous_poll_at),
            Err(e) => {
                error!(error = %e, "Cursor lookup failed during health check");
                None
            },
        };

        let Some(last) = last else {
            return PollingHealth {
                status: ComponentStatus::Unknown,
                last_successful_poll_at: None,
                lag_seconds: None,
            };
        };

        let lag = (now - last).num_seconds().max(0);
        let threshold = i64::try_from(poller.config().silence_threshold.as_secs()).unwrap_or(i64::MAX);
        let status = if lag >= threshold { ComponentStatus::Down } else { ComponentStatus::Up };

        PollingHealth { status, last_successful_poll_at: Some(last), lag_seconds: Some(lag) }
    }
}

/// Health check endpoint handler.
///
/// Called frequently by load balancers, so it performs no recovery and no
/// upstream calls.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let health_service = HealthService::new(app_state.clock.clone());
    let response = health_service.health_check(app_state.storage.as_ref(), &app_state.poller).await;

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?response.status,
        storage_status = ?response.checks.storage.status,
        polling_status = ?response.checks.polling.status,
        "Health check completed"
    );

    (status_code, Json(response)).into_response()
}
