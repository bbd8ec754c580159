//! Push endpoint tests.
//!
//! Drives `/webhooks/reservations` through the full router with the
//! in-memory environment behind it and checks what reached the scripted
//! integrations.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use staysync_api::{auth::sign, create_router, AppState, AuthConfig, WebhookAuthenticator};
use staysync_core::Clock;
use staysync_delivery::storage::ReliabilityStorage;
use staysync_testing::{integration, integration_url, Reply, TestEnv};
use tower::ServiceExt;

const TOKEN: &str = "hook-token";
const SECRET: &str = "signing-secret";

fn env() -> TestEnv {
    TestEnv::builder().integration(integration("analytics")).integration(integration("marketing")).build()
}

fn app(env: &TestEnv, signing_secret: Option<&str>) -> Router {
    let storage: Arc<dyn ReliabilityStorage> = env.storage.clone();
    let clock: Arc<dyn Clock> = Arc::new(env.clock.clone());
    let auth = AuthConfig {
        token: TOKEN.to_string(),
        signing_secret: signing_secret.map(str::to_string),
        replay_window: Duration::from_secs(300),
    };

    create_router(
        AppState {
            poller: Arc::new(env.poller.clone()),
            storage: storage.clone(),
            authenticator: WebhookAuthenticator::new(auth, storage, clock.clone()),
            admin_token: None,
            clock,
        },
        Duration::from_secs(30),
    )
}

fn push(uri: &str, headers: &[(&str, String)], body: &str) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri).header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request should complete");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn signed_headers(env: &TestEnv, body: &str) -> Vec<(&'static str, String)> {
    let ts = env.now().timestamp();
    vec![
        ("x-webhook-token", TOKEN.to_string()),
        ("x-webhook-timestamp", ts.to_string()),
        ("x-webhook-signature", sign(SECRET, ts, body.as_bytes())),
    ]
}

#[tokio::test]
async fn authenticated_push_is_forwarded_to_every_integration() {
    let env = env();
    let app = app(&env, None);
    let body = json!({ "code": "R-1", "guest": "Ada" }).to_string();

    let (status, response) =
        send(&app, push("/webhooks/reservations", &[("x-webhook-token", TOKEN.into())], &body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "processed");
    assert_eq!(response["processed"], true);
    assert_eq!(response["reservation_id"], "r-1");
    assert_eq!(response["result"]["status"], "success");
    assert_eq!(env.transport.count(&integration_url("analytics")), 1);
    assert_eq!(env.transport.count(&integration_url("marketing")), 1);
}

#[tokio::test]
async fn token_may_travel_in_the_query_string() {
    let env = env();
    let app = app(&env, None);

    let (status, _) =
        send(&app, push(&format!("/webhooks/reservations?token={TOKEN}"), &[], r#"{"code":"R-2"}"#)).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_or_wrong_token_is_rejected_before_processing() {
    let env = env();
    let app = app(&env, None);

    let (missing, body) = send(&app, push("/webhooks/reservations", &[], r#"{"code":"R-3"}"#)).await;
    assert_eq!(missing, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "missing_token");

    let (wrong, body) =
        send(&app, push("/webhooks/reservations", &[("x-webhook-token", "nope".into())], r#"{"code":"R-3"}"#))
            .await;
    assert_eq!(wrong, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "invalid_token");

    assert!(env.transport.requests().is_empty());
}

#[tokio::test]
async fn duplicate_push_is_acknowledged_but_not_forwarded() {
    let env = env();
    let app = app(&env, None);
    let headers = [("x-webhook-token", TOKEN.to_string())];

    send(&app, push("/webhooks/reservations", &headers, r#"{"code":"R-4"}"#)).await;
    let (status, response) =
        send(&app, push("/webhooks/reservations", &headers, r#"{"reservation":{"code":"r-4"}}"#)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "skipped");
    assert_eq!(response["processed"], false);
    assert_eq!(response["reason"], "duplicate");
    assert_eq!(env.transport.requests().len(), 2);
}

#[tokio::test]
async fn failing_integration_is_reported_as_partial_success() {
    let env = env();
    env.transport.enqueue(integration_url("marketing"), [Reply::status(503)]);
    let app = app(&env, None);

    let (status, response) = send(
        &app,
        push("/webhooks/reservations", &[("x-webhook-token", TOKEN.into())], r#"{"code":"R-5"}"#),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["result"]["status"], "partial");
    assert_eq!(response["result"]["failed"], json!(["marketing"]));
    assert_eq!(response["result"]["retries_enqueued"], 1);
}

#[tokio::test]
async fn non_object_body_is_a_bad_request() {
    let env = env();
    let app = app(&env, None);

    let (status, body) =
        send(&app, push("/webhooks/reservations", &[("x-webhook-token", TOKEN.into())], "[1, 2, 3]")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn signed_push_is_accepted_once() {
    let env = env();
    let app = app(&env, Some(SECRET));
    let body = r#"{"code":"R-6"}"#;
    let headers = signed_headers(&env, body);

    let (first, _) = send(&app, push("/webhooks/reservations", &headers, body)).await;
    let (replay, response) = send(&app, push("/webhooks/reservations", &headers, body)).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(replay, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"]["code"], "replayed");
    assert_eq!(env.transport.count(&integration_url("analytics")), 1);
}

#[tokio::test]
async fn signed_mode_requires_signature_and_fresh_timestamp() {
    let env = env();
    let app = app(&env, Some(SECRET));
    let body = r#"{"code":"R-7"}"#;

    let (unsigned, response) =
        send(&app, push("/webhooks/reservations", &[("x-webhook-token", TOKEN.into())], body)).await;
    assert_eq!(unsigned, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"]["code"], "missing_signature");

    let stale = signed_headers(&env, body);
    env.advance(Duration::from_secs(600));
    let (status, response) = send(&app, push("/webhooks/reservations", &stale, body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"]["code"], "stale_timestamp");

    let tampered = signed_headers(&env, body);
    let (status, response) = send(&app, push("/webhooks/reservations", &tampered, r#"{"code":"R-8"}"#)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"]["code"], "invalid_signature");

    assert!(env.transport.requests().is_empty());
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let env = env();
    let app = app(&env, None);

    let response = app
        .oneshot(push("/webhooks/reservations", &[("x-webhook-token", TOKEN.into())], r#"{"code":"R-9"}"#))
        .await
        .unwrap();

    assert!(response.headers().contains_key("x-request-id"));
}
