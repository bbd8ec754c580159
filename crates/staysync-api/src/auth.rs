//! Webhook authentication with anti-replay protection.
//!
//! Every push request must carry the shared token in the `X-Webhook-Token`
//! header or the `token` query parameter. When a signing secret is
//! configured the request must also carry:
//!
//! - `X-Webhook-Timestamp`: unix seconds
//! - `X-Webhook-Signature`: `sha256=<mac>` where `<mac>` is the hex
//!   (case-insensitive) or base64 HMAC-SHA256 of `"{timestamp}.{raw body}"`
//!
//! A (timestamp, signature) pair is accepted once. The pair is stored as a
//! replay key that expires with the replay window, and timestamps outside
//! the window are rejected, so forgotten keys can never be replayed.

use std::{sync::Arc, time::Duration};

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use staysync_core::Clock;
use staysync_delivery::storage::ReliabilityStorage;

use crate::ErrorBody;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the shared token.
pub const TOKEN_HEADER: &str = "x-webhook-token";
/// Header carrying the signing timestamp.
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Webhook authentication settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared token. Empty rejects every request.
    pub token: String,
    /// HMAC secret; `None` disables signed mode.
    pub signing_secret: Option<String>,
    /// Accepted clock skew and replay key lifetime.
    pub replay_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { token: String::new(), signing_secret: None, replay_window: Duration::from_secs(300) }
    }
}

/// Authentication failures. Never retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token on the request.
    #[error("missing webhook token")]
    MissingToken,

    /// Token does not match.
    #[error("invalid webhook token")]
    InvalidToken,

    /// Signed mode is on and the signature header is absent.
    #[error("missing webhook signature")]
    MissingSignature,

    /// Signed mode is on and the timestamp header is absent.
    #[error("missing webhook timestamp")]
    MissingTimestamp,

    /// Timestamp is not unix seconds.
    #[error("malformed webhook timestamp")]
    MalformedTimestamp,

    /// Timestamp is outside the replay window.
    #[error("webhook timestamp outside the accepted window")]
    StaleTimestamp,

    /// Signature is neither hex nor base64.
    #[error("malformed webhook signature")]
    MalformedSignature,

    /// Signature does not match the body.
    #[error("webhook signature mismatch")]
    InvalidSignature,

    /// This (timestamp, signature) pair was already accepted.
    #[error("webhook replay detected")]
    Replayed,

    /// Replay store unavailable.
    #[error("replay store unavailable: {0}")]
    Storage(String),
}

impl AuthError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
            Self::MissingSignature => "missing_signature",
            Self::MissingTimestamp => "missing_timestamp",
            Self::MalformedTimestamp => "malformed_timestamp",
            Self::StaleTimestamp => "stale_timestamp",
            Self::MalformedSignature => "malformed_signature",
            Self::InvalidSignature => "invalid_signature",
            Self::Replayed => "replayed",
            Self::Storage(_) => "storage_unavailable",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        };
        let message = match &self {
            Self::Storage(_) => "authentication temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        (status, Json(ErrorBody::new(self.code(), message))).into_response()
    }
}

/// Verifies push requests.
#[derive(Clone)]
pub struct WebhookAuthenticator {
    config: AuthConfig,
    storage: Arc<dyn ReliabilityStorage>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WebhookAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookAuthenticator")
            .field("signed", &self.config.signing_secret.is_some())
            .field("replay_window", &self.config.replay_window)
            .finish_non_exhaustive()
    }
}

impl WebhookAuthenticator {
    /// Creates an authenticator.
    pub fn new(config: AuthConfig, storage: Arc<dyn ReliabilityStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { config, storage, clock }
    }

    /// Whether signed mode is on.
    pub fn is_signed(&self) -> bool {
        self.config.signing_secret.is_some()
    }

    /// Authenticates one request.
    ///
    /// `query_token` is the `token` query parameter, used when the header is
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        body: &[u8],
    ) -> Result<(), AuthError> {
        let token = header(headers, TOKEN_HEADER).or(query_token).ok_or(AuthError::MissingToken)?;
        if self.config.token.is_empty() || !bool::from(token.as_bytes().ct_eq(self.config.token.as_bytes())) {
            return Err(AuthError::InvalidToken);
        }

        let Some(secret) = &self.config.signing_secret else {
            return Ok(());
        };

        let signature = header(headers, SIGNATURE_HEADER).ok_or(AuthError::MissingSignature)?;
        let timestamp = header(headers, TIMESTAMP_HEADER).ok_or(AuthError::MissingTimestamp)?;
        let seconds: i64 = timestamp.trim().parse().map_err(|_| AuthError::MalformedTimestamp)?;

        let now = self.clock.now();
        let window = i64::try_from(self.config.replay_window.as_secs()).unwrap_or(i64::MAX);
        if (now.timestamp() - seconds).abs() > window {
            return Err(AuthError::StaleTimestamp);
        }

        let mac = decode_signature(signature)?;
        verify_mac(secret, timestamp.trim(), body, &mac)?;

        let replay_key = format!("webhook:{seconds}:{}", hex::encode(&mac));
        let expires_at = now + chrono::Duration::seconds(window);
        let fresh = self
            .storage
            .remember_replay_key(replay_key, now, expires_at)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        if !fresh {
            tracing::warn!(category = "auth", timestamp = seconds, "webhook replay rejected");
            return Err(AuthError::Replayed);
        }

        Ok(())
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty())
}

/// Decodes `sha256=<hex-or-base64>` (prefix optional) to raw MAC bytes.
fn decode_signature(signature: &str) -> Result<Vec<u8>, AuthError> {
    let encoded = signature.trim();
    let encoded = encoded.strip_prefix("sha256=").unwrap_or(encoded);

    if encoded.len() == 64 && encoded.chars().all(|c| c.is_ascii_hexdigit()) {
        return hex::decode(encoded.to_ascii_lowercase()).map_err(|_| AuthError::MalformedSignature);
    }

    STANDARD.decode(encoded).map_err(|_| AuthError::MalformedSignature)
}

fn verify_mac(secret: &str, timestamp: &str, body: &[u8], mac: &[u8]) -> Result<(), AuthError> {
    let mut expected =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidSignature)?;
    expected.update(timestamp.as_bytes());
    expected.update(b".");
    expected.update(body);
    expected.verify_slice(mac).map_err(|_| AuthError::InvalidSignature)
}

/// Computes the `sha256=<hex>` signature header value for a body.
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use staysync_core::TestClock;
    use staysync_delivery::storage::memory::MemoryStorage;

    use super::*;

    const SECRET: &str = "signing-secret";
    const BODY: &[u8] = br#"{"code":"R1"}"#;

    fn authenticator(secret: Option<&str>) -> (WebhookAuthenticator, TestClock) {
        let clock = TestClock::new();
        let auth = WebhookAuthenticator::new(
            AuthConfig {
                token: "hook-token".into(),
                signing_secret: secret.map(str::to_string),
                replay_window: Duration::from_secs(300),
            },
            Arc::new(MemoryStorage::new()),
            Arc::new(clock.clone()),
        );
        (auth, clock)
    }

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn signed(clock: &TestClock, signature: Option<String>) -> HeaderMap {
        let ts = clock.now().timestamp();
        headers(&[
            (TOKEN_HEADER, "hook-token".into()),
            (TIMESTAMP_HEADER, ts.to_string()),
            (SIGNATURE_HEADER, signature.unwrap_or_else(|| sign(SECRET, ts, BODY))),
        ])
    }

    #[tokio::test]
    async fn token_from_header_or_query() {
        let (auth, _) = authenticator(None);

        assert!(auth.authenticate(&headers(&[(TOKEN_HEADER, "hook-token".into())]), None, BODY).await.is_ok());
        assert!(auth.authenticate(&HeaderMap::new(), Some("hook-token"), BODY).await.is_ok());
        assert_eq!(auth.authenticate(&HeaderMap::new(), None, BODY).await, Err(AuthError::MissingToken));
        assert_eq!(
            auth.authenticate(&HeaderMap::new(), Some("hook-tokeN"), BODY).await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn valid_signature_is_accepted_once() {
        let (auth, clock) = authenticator(Some(SECRET));
        let request = signed(&clock, None);

        assert!(auth.authenticate(&request, None, BODY).await.is_ok());
        assert_eq!(auth.authenticate(&request, None, BODY).await, Err(AuthError::Replayed));
    }

    #[tokio::test]
    async fn uppercase_hex_and_base64_are_the_same_pair() {
        let (auth, clock) = authenticator(Some(SECRET));
        let ts = clock.now().timestamp();
        let hex_mac = sign(SECRET, ts, BODY).trim_start_matches("sha256=").to_string();
        let b64 = STANDARD.encode(hex::decode(&hex_mac).unwrap());

        let upper = signed(&clock, Some(format!("sha256={}", hex_mac.to_uppercase())));
        let base64 = signed(&clock, Some(format!("sha256={b64}")));

        assert!(auth.authenticate(&upper, None, BODY).await.is_ok());
        assert_eq!(auth.authenticate(&base64, None, BODY).await, Err(AuthError::Replayed));
    }

    #[tokio::test]
    async fn tampered_body_or_missing_headers_are_rejected() {
        let (auth, clock) = authenticator(Some(SECRET));

        assert_eq!(
            auth.authenticate(&signed(&clock, None), None, br#"{"code":"R2"}"#).await,
            Err(AuthError::InvalidSignature)
        );
        assert_eq!(
            auth.authenticate(&headers(&[(TOKEN_HEADER, "hook-token".into())]), None, BODY).await,
            Err(AuthError::MissingSignature)
        );
        assert_eq!(
            auth.authenticate(&signed(&clock, Some("sha256=%%%".into())), None, BODY).await,
            Err(AuthError::MalformedSignature)
        );
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let (auth, clock) = authenticator(Some(SECRET));
        let request = signed(&clock, None);

        clock.advance(Duration::from_secs(301));

        assert_eq!(auth.authenticate(&request, None, BODY).await, Err(AuthError::StaleTimestamp));
    }

        #[test]
    fn auth_errors_map_to_401_except_storage() {
        assert_eq!(AuthError::Replayed.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthError::Storage("down".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
