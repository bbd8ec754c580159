//! Fixed-window rate limiter keyed by arbitrary strings.
//!
//! Each key owns a counter and a window start in the shared store. A window
//! resets completely once it elapses; this is a fixed window, not a sliding
//! log. The limiter fails open: an empty key or an unreachable store never
//! blocks traffic.

use std::{sync::Arc, time::Duration};

use staysync_core::{models::RateLimitWindow, Clock};

use crate::{error::Result, storage::ReliabilityStorage};

/// Outcome of a rate limit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request admitted.
    Allowed {
        /// Requests still available in the current window.
        remaining: u64,
    },
    /// Request rejected until the window resets.
    Blocked {
        /// Seconds until the window resets, at least 1.
        retry_after_seconds: u64,
    },
}

impl RateLimitDecision {
    /// Returns true if the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Per-key limit, e.g. for one integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RateLimit {
    /// Requests admitted per window.
    pub max_requests: u64,
    /// Window length.
    pub window: Duration,
}

/// Limiter key for an outbound integration.
pub fn integration_key(integration: &str) -> String {
    format!("integration:{integration}")
}

/// Limiter key for the upstream reservation API.
pub const UPSTREAM_POLL_KEY: &str = "upstream:poll";

fn normalize_key(key: &str) -> &str {
    key.trim()
}

/// Fixed-window limiter over the shared store.
#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<dyn ReliabilityStorage>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a new limiter.
    pub fn new(storage: Arc<dyn ReliabilityStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Attempts to take one slot for `key`.
    ///
    /// Resets the window once it has elapsed, then admits the request if
    /// fewer than `max_requests` were admitted in the current window.
    pub async fn attempt(&self, key: &str, limit: RateLimit) -> RateLimitDecision {
        let key = normalize_key(key);
        if key.is_empty() {
            return RateLimitDecision::Allowed { remaining: limit.max_requests };
        }

        let now = self.clock.now();
        let window_seconds = i64::try_from(limit.window.as_secs()).unwrap_or(i64::MAX);
        let max = i64::try_from(limit.max_requests).unwrap_or(i64::MAX);

        let result = self
            .storage
            .update_rate_window(
                RateLimitWindow::empty(key, now),
                Box::new(move |window| {
                    let elapsed = now.signed_duration_since(window.window_start).num_seconds();
                    if elapsed >= window_seconds || elapsed < 0 {
                        window.window_start = now;
                        window.count = 0;
                    }

                    if window.count < max {
                        window.count += 1;
                        RateLimitDecision::Allowed {
                            remaining: u64::try_from(max - window.count).unwrap_or(0),
                        }
                    } else {
                        let elapsed = now.signed_duration_since(window.window_start).num_seconds();
                        RateLimitDecision::Blocked {
                            retry_after_seconds: u64::try_from(window_seconds - elapsed)
                                .unwrap_or(0)
                                .max(1),
                        }
                    }
                }),
            )
            .await;

        match result {
            Ok(decision) => {
                if let RateLimitDecision::Blocked { retry_after_seconds } = decision {
                    tracing::debug!(key, retry_after_seconds, "rate limit reached");
                }
                decision
            },
            Err(e) => {
                tracing::warn!(key, error = %e, "rate limiter store unavailable, allowing request");
                RateLimitDecision::Allowed { remaining: limit.max_requests }
            },
        }
    }

    /// Clears the window for `key`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the delete fails.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.storage.delete_rate_window(normalize_key(key).to_string()).await?;
        Ok(())
    }

    /// Returns seconds until `key` is admitted again, 0 if not blocked.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the read fails.
    pub async fn retry_after(&self, key: &str, limit: RateLimit) -> Result<u64> {
        let Some(window) = self.storage.find_rate_window(normalize_key(key).to_string()).await? else {
            return Ok(0);
        };

        let now = self.clock.now();
        let window_seconds = i64::try_from(limit.window.as_secs()).unwrap_or(i64::MAX);
        let elapsed = now.signed_duration_since(window.window_start).num_seconds();
        let max = i64::try_from(limit.max_requests).unwrap_or(i64::MAX);

        if elapsed >= window_seconds || window.count < max {
            return Ok(0);
        }
        Ok(u64::try_from(window_seconds - elapsed).unwrap_or(0).max(1))
    }
}
