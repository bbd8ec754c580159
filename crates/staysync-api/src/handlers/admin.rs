//! Administrative routes.

use axum::{
    extract::{Path, State},
    Json,
};
use staysync_delivery::{pipeline::PipelineReport, poller::PollingStats};
use tracing::{info, instrument};

use crate::{ApiError, AppState};

/// Re-fetches a reservation from the upstream API and forwards it to every
/// integration, ignoring dedup state.
#[instrument(name = "redispatch_reservation", skip(state))]
pub async fn redispatch_reservation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineReport>, ApiError> {
    let report = state
        .poller
        .redispatch(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("reservation {id}")))?;

    info!(reservation_id = %id, "manual re-dispatch completed");
    Ok(Json(report))
}

/// Cursor, traffic and queue statistics.
#[instrument(name = "polling_stats", skip(state))]
pub async fn polling_stats(State(state): State<AppState>) -> Result<Json<PollingStats>, ApiError> {
    Ok(Json(state.poller.stats().await?))
}
