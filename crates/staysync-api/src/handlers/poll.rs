//! Poll entrypoint for external schedulers.
//!
//! Lets a platform cron drive polling when the in-process scheduler is not
//! running. The continuous tier runs unless `tier=deep` is given. Either way
//! the call takes the shared poll lock, so it never overlaps a scheduled
//! cycle.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use staysync_delivery::poller::PollReport;
use tracing::instrument;

use crate::{ApiError, AppState};

/// Query parameters of the poll entrypoint.
#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// `continuous` (default) or `deep`.
    pub tier: Option<String>,
}

/// Runs one poll cycle and returns its report.
#[instrument(name = "trigger_poll", skip(state))]
pub async fn trigger_poll(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollReport>, ApiError> {
    let report = match query.tier.as_deref() {
        None | Some("continuous") => state.poller.execute_continuous_polling().await?,
        Some("deep") => state.poller.execute_deep_check().await?,
        Some(other) => return Err(ApiError::BadRequest(format!("unknown poll tier: {other}"))),
    };

    Ok(Json(report))
}
