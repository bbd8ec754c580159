//! staysync HTTP API.
//!
//! Configuration loading, webhook authentication and the axum router that
//! exposes the push endpoint, the poll entrypoint, administrative routes and
//! the health check.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use staysync_core::Clock;
use staysync_delivery::{poller::AdaptivePoller, storage::ReliabilityStorage};

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use auth::{AuthConfig, AuthError, WebhookAuthenticator};
pub use config::Config;
pub use error::{ApiError, ErrorBody};
pub use server::{create_router, shutdown_signal, start_server};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Poller, which also owns the reservation pipeline.
    pub poller: Arc<AdaptivePoller>,
    /// Shared store.
    pub storage: Arc<dyn ReliabilityStorage>,
    /// Push request verification.
    pub authenticator: WebhookAuthenticator,
    /// Token for administrative routes; `None` disables them.
    pub admin_token: Option<String>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("poller", &self.poller)
            .field("authenticator", &self.authenticator)
            .field("admin_enabled", &self.admin_token.is_some())
            .finish_non_exhaustive()
    }
}
