//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Traffic-triggered poll lag check
//! 5. Admin token check (admin and internal routes only)
//! 6. Handler execution
//!
//! Push requests authenticate inside their handler, since verification
//! needs the raw body.

use std::{future::Future, net::SocketAddr, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{
    handlers,
    middleware::{observe_traffic, require_admin_token},
    AppState,
};

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use staysync_api::{create_router, AppState};
///
/// fn build(state: AppState) -> axum::Router {
///     create_router(state, std::time::Duration::from_secs(30))
/// }
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/webhooks/reservations", post(handlers::receive_reservation));

    let admin_routes = Router::new()
        .route("/internal/poll", post(handlers::trigger_poll))
        .route("/admin/reservations/{id}/redispatch", post(handlers::redispatch_reservation))
        .route("/admin/polling/stats", get(handlers::polling_stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin_token));

    Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn_with_state(state.clone(), observe_traffic))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware to inject request ID into all responses.
///
/// Adds X-Request-Id header for tracing requests across services.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Serves the router until `shutdown` resolves.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server(
    app: Router,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
