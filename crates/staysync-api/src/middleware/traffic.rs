//! Traffic-triggered lag checks.
//!
//! Every request is a hint that the process is alive. The check runs in the
//! background so a slow inline poll never delays the response.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use staysync_delivery::poller::is_administrative;

use crate::AppState;

/// Spawns a poll lag check for non-administrative paths.
pub async fn observe_traffic(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();

    if !is_administrative(&path) {
        let poller = state.poller.clone();
        tokio::spawn(async move {
            if let Err(e) = poller.observe_traffic(&path).await {
                tracing::warn!(error = %e, path = %path, "traffic lag check failed");
            }
        });
    }

    next.run(req).await
}
