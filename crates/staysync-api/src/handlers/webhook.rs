//! Reservation push endpoint.
//!
//! The upstream system posts each new reservation here. The body is the
//! reservation object itself, or an envelope with a `reservation` object.
//! Authentication runs against the raw bytes before any parsing so the
//! signature covers exactly what was sent.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use staysync_core::models::{DispatchResult, Reservation};
use staysync_delivery::{events::Origin, pipeline::ReservationEvent};
use tracing::{info, instrument, warn};

use crate::{ApiError, AppState};

/// Query parameters accepted by the push endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Shared token, for senders that cannot set headers.
    pub token: Option<String>,
}

/// Push endpoint response.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// `processed` or `skipped`.
    pub status: String,
    /// Whether the reservation was fanned out by this request.
    pub processed: bool,
    /// Why nothing was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Primary identifier, if the reservation had one.
    pub reservation_id: Option<String>,
    /// Fan-out result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DispatchResult>,
}

/// Receives one pushed reservation.
///
/// Returns 401 on authentication failure, 400 when the body is not a JSON
/// object, and 200 with the fan-out result otherwise. Integration failures
/// are reported in the result, never as an error status; they are already
/// queued for retry.
#[instrument(name = "receive_reservation", skip_all, fields(bytes = body.len()))]
pub async fn receive_reservation(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(err) = state.authenticator.authenticate(&headers, query.token.as_deref(), &body).await {
        warn!(category = "auth", code = err.code(), "webhook rejected");
        return err.into_response();
    }

    match process(&state, &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn process(state: &AppState, body: &[u8]) -> Result<WebhookResponse, ApiError> {
    let reservation = parse_reservation(body)?;

    let report = state
        .poller
        .pipeline()
        .run(ReservationEvent::new(reservation, Origin::Webhook))
        .await?;

    if report.skipped() {
        info!(reservation_id = ?report.reservation_id, "duplicate webhook skipped");
        return Ok(WebhookResponse {
            status: "skipped".to_string(),
            processed: false,
            reason: Some("duplicate".to_string()),
            reservation_id: report.reservation_id,
            result: None,
        });
    }

    Ok(WebhookResponse {
        status: "processed".to_string(),
        processed: true,
        reason: None,
        reservation_id: report.reservation_id,
        result: report.result,
    })
}

fn parse_reservation(body: &[u8]) -> Result<Reservation, ApiError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))?;

    let value = match value {
        Value::Object(mut map) if map.get("reservation").is_some_and(Value::is_object) => {
            map.remove("reservation").unwrap_or(Value::Null)
        },
        other => other,
    };

    Reservation::from_value(value)
        .ok_or_else(|| ApiError::BadRequest("reservation must be a JSON object".to_string()))
}
