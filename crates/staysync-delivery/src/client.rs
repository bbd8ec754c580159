//! Outbound HTTP transport with bounded timeouts.
//!
//! Integrations build an [`OutboundRequest`]; the dispatcher and the retry
//! queue send it through a [`Transport`]. Requests are plain serializable
//! data so a failed call can be stored in the retry queue and replayed
//! verbatim later. Responses are classified into the error taxonomy for
//! retry and circuit breaker decisions.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Configuration for the outbound HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout applied to every outbound call.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "staysync/0.1".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// One outbound call, as built by an integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRequest {
    /// Destination URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Request headers.
    pub headers: BTreeMap<String, String>,
    /// Request body.
    pub body: String,
}

impl OutboundRequest {
    /// Creates a JSON POST request.
    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self { url: url.into(), method: "POST".to_string(), headers, body: body.to_string() }
    }

    /// Adds a header, replacing any previous value.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response to an outbound call.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers, lowercase names.
    pub headers: HashMap<String, String>,
    /// Response body (limited size).
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

impl OutboundResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Sends outbound requests.
///
/// Implementations return `Ok` for any HTTP response and `Err` only when no
/// response was received (timeout, connection failure). Use
/// [`classify_response`] to turn status codes into errors.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one request.
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse>;
}

/// Sends a request and classifies the response.
///
/// # Errors
///
/// Returns transport errors unchanged, and status errors per
/// [`classify_response`].
pub async fn execute(transport: &dyn Transport, request: &OutboundRequest) -> Result<OutboundResponse> {
    let response = transport.send(request).await?;
    classify_response(response)
}

/// Maps a response status to the error taxonomy.
///
/// 2xx succeeds; 429 is rate limited (honouring Retry-After); 5xx is a
/// transient server error; any other status is a permanent client error.
///
/// # Errors
///
/// Returns the categorized error for non-2xx responses.
pub fn classify_response(response: OutboundResponse) -> Result<OutboundResponse> {
    match response.status_code {
        200..=299 => Ok(response),
        429 => Err(DeliveryError::rate_limited(
            extract_retry_after_seconds(&response.headers).unwrap_or(DEFAULT_RETRY_AFTER),
        )),
        500..=599 => Err(DeliveryError::server_error(response.status_code, response.body)),
        status => Err(DeliveryError::client_error(status, response.body)),
    }
}

const DEFAULT_RETRY_AFTER: u64 = 60;

/// reqwest-backed transport with connection pooling.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    /// Creates a new transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the underlying reqwest client for sibling HTTP consumers.
    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    async fn read_body(response: reqwest::Response) -> String {
        const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
        const MAX_LOGGED_SIZE: usize = 1024;

        match response.bytes().await {
            Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
                let suffix = "... (truncated)";
                let truncated =
                    String::from_utf8_lossy(&bytes[..MAX_LOGGED_SIZE - suffix.len()]);
                format!("{truncated}{suffix}")
            },
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!("Failed to read response body: {}", e);
                format!("[Failed to read response body: {e}]")
            },
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!("outbound_call", url = %request.url, method = %request.method);

        async move {
            let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
                DeliveryError::configuration(format!("invalid method {}: {e}", request.method))
            })?;

            let mut http_request = self.client.request(method, &request.url).body(request.body.clone());
            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "Request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let headers = extract_headers(response.headers());
            let body = Self::read_body(response).await;
            let duration = start_time.elapsed();

            tracing::debug!(status = status_code, duration_ms = duration.as_millis(), "Received response");

            Ok(OutboundResponse { status_code, headers, body, duration })
        }
        .instrument(span)
        .await
    }
}

/// Extracts headers from reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();

    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }

    headers
}

/// Checks if a header is managed by the HTTP client and must not be copied
/// from the request definition.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts retry-after delay from response headers.
///
/// Supports both seconds format and HTTP-date format. Returns the delay in
/// seconds, or a default value (60s) if parsing fails.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let now = chrono::Utc::now();
        let retry_time = date_time.with_timezone(&chrono::Utc);

        if retry_time > now {
            if let Ok(std_duration) = retry_time.signed_duration_since(now).to_std() {
                return Some(std_duration.as_secs());
            }
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}
