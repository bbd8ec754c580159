//! Poll entrypoint, administrative routes and health check.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use staysync_api::{create_router, AppState, AuthConfig, WebhookAuthenticator};
use staysync_core::Clock;
use staysync_delivery::storage::ReliabilityStorage;
use staysync_testing::{integration, integration_url, reservation, TestEnv};
use tower::ServiceExt;

const ADMIN: &str = "admin-secret";

fn env() -> TestEnv {
    TestEnv::builder()
        .integration(integration("analytics"))
        .start_time(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
        .build()
}

fn app(env: &TestEnv, admin_token: Option<&str>) -> Router {
    let storage: Arc<dyn ReliabilityStorage> = env.storage.clone();
    let clock: Arc<dyn Clock> = Arc::new(env.clock.clone());
    let auth = AuthConfig { token: "hook".into(), ..AuthConfig::default() };

    create_router(
        AppState {
            poller: Arc::new(env.poller.clone()),
            storage: storage.clone(),
            authenticator: WebhookAuthenticator::new(auth, storage, clock.clone()),
            admin_token: admin_token.map(str::to_string),
            clock,
        },
        Duration::from_secs(30),
    )
}

fn request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request should complete");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn admin_routes_are_closed_without_configured_token() {
    let env = env();
    let app = app(&env, None);

    let (status, body) = send(&app, request("POST", "/internal/poll", Some("anything"))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");
    assert_eq!(env.source.fetches(), 0);
}

#[tokio::test]
async fn wrong_or_missing_admin_token_is_rejected() {
    let env = env();
    let app = app(&env, Some(ADMIN));

    let (missing, _) = send(&app, request("GET", "/admin/polling/stats", None)).await;
    let (wrong, _) = send(&app, request("GET", "/admin/polling/stats", Some("admin-secreT"))).await;

    assert_eq!(missing, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_token_header_is_accepted() {
    let env = env();
    let app = app(&env, Some(ADMIN));

    let request = Request::builder()
        .method("GET")
        .uri("/admin/polling/stats")
        .header("x-admin-token", ADMIN)
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn poll_entrypoint_runs_a_continuous_cycle() {
    let env = env();
    env.source.push(reservation("R-POLL", env.now() - chrono::Duration::minutes(5)));
    let app = app(&env, Some(ADMIN));

    let (status, report) = send(&app, request("POST", "/internal/poll", Some(ADMIN))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["tier"], "continuous");
    assert_eq!(report["status"], "completed");
    assert_eq!(report["dispatched"], 1);
    assert_eq!(env.transport.count(&integration_url("analytics")), 1);
}

#[tokio::test]
async fn poll_entrypoint_selects_the_deep_tier() {
    let env = env();
    env.source.push(reservation("R-OLD", env.now() - chrono::Duration::hours(30)));
    let app = app(&env, Some(ADMIN));

    let (status, report) = send(&app, request("POST", "/internal/poll?tier=deep", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["tier"], "deep_check");
    assert_eq!(report["dispatched"], 1);

    let (status, _) = send(&app, request("POST", "/internal/poll?tier=weekly", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn redispatch_forwards_known_reservations_again() {
    let env = env();
    let booked = reservation("R-AGAIN", env.now() - chrono::Duration::minutes(1));
    env.source.push(booked.clone());
    env.ingest(booked).await.unwrap();
    let app = app(&env, Some(ADMIN));

    let (status, report) =
        send(&app, request("POST", "/admin/reservations/R-AGAIN/redispatch", Some(ADMIN))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["stage"]["stage"], "dispatched");
    assert_eq!(env.transport.count(&integration_url("analytics")), 2);

    let (missing, body) =
        send(&app, request("POST", "/admin/reservations/R-UNKNOWN/redispatch", Some(ADMIN))).await;
    assert_eq!(missing, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn stats_report_cursor_and_queue_depth() {
    let env = env();
    env.poller.execute_continuous_polling().await.unwrap();
    let app = app(&env, Some(ADMIN));

    let (status, stats) = send(&app, request("GET", "/admin/polling/stats", Some(ADMIN))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["retry_queue_depth"], 0);
    assert_eq!(stats["cursor"]["name"], "reservations");
    assert!(stats["cursor"]["last_successful_continuous_poll_at"].is_string());
}

#[tokio::test]
async fn health_reports_storage_and_poll_freshness() {
    let env = env();
    env.poller.execute_continuous_polling().await.unwrap();
    let app = app(&env, None);

    let (status, health) = send(&app, request("GET", "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["checks"]["storage"]["status"], "up");
    assert_eq!(health["checks"]["polling"]["lag_seconds"], 0);

    env.advance(Duration::from_secs(20 * 60));
    let (status, health) = send(&app, request("GET", "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn health_is_unavailable_when_storage_fails() {
    let env = env();
    env.storage.inject_failure("connection refused").await;
    let app = app(&env, None);

    let (status, health) = send(&app, request("GET", "/health", None)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["checks"]["storage"]["status"], "down");
}
