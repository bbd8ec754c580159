//! Upstream reservation API used by the poll tiers and manual re-dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use staysync_core::models::Reservation;

use crate::{
    client::{self, OutboundRequest, Transport},
    error::{DeliveryError, Result},
};

/// Fields holding a reservation's creation time, in priority order.
pub const CREATED_AT_FIELDS: &[&str] = &["created_at", "created", "booked_at", "updated_at"];

/// Reads reservations from the upstream system.
#[async_trait]
pub trait ReservationSource: Send + Sync {
    /// At most `limit` reservations created at or after `since`, oldest
    /// first.
    ///
    /// The bound is inclusive so reservations sharing the cursor's
    /// timestamp are seen again; dedup absorbs the repeats. Implementations
    /// must not filter the page, since a short page tells the poller it has
    /// caught up.
    async fn fetch_created_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>>;

    /// Reservations created or modified within `[from, to]`.
    async fn fetch_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reservation>>;

    /// A single reservation by identifier.
    async fn fetch_by_id(&self, id: &str) -> Result<Option<Reservation>>;
}

/// Configuration of the upstream HTTP API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL, e.g. `https://pms.example.com/api`.
    pub base_url: String,
    /// Bearer token, if the API requires one.
    pub api_token: Option<String>,
}

/// [`ReservationSource`] over the upstream JSON API.
///
/// `GET {base}/reservations?created_since=..&limit=..`,
/// `GET {base}/reservations?from=..&to=..` and `GET {base}/reservations/{id}`.
/// Responses are either a JSON array or an object with a `reservations` or
/// `data` array.
#[derive(Clone)]
pub struct HttpReservationSource {
    config: UpstreamConfig,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for HttpReservationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReservationSource")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpReservationSource {
    /// Creates a source.
    pub fn new(config: UpstreamConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<String> {
        let base = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let url = reqwest::Url::parse_with_params(&base, params).map_err(|e| {
            DeliveryError::configuration(format!("invalid upstream url {base}: {e}"))
        })?;
        Ok(url.to_string())
    }

    fn get(&self, url: String) -> OutboundRequest {
        let mut request = OutboundRequest {
            url,
            method: "GET".to_string(),
            headers: std::collections::BTreeMap::new(),
            body: String::new(),
        }
        .with_header("accept", "application/json");
        if let Some(token) = &self.config.api_token {
            request = request.with_header("authorization", format!("Bearer {token}"));
        }
        request
    }

    async fn fetch_list(&self, url: String) -> Result<Vec<Reservation>> {
        let response = client::execute(self.transport.as_ref(), &self.get(url)).await?;
        let value: Value = serde_json::from_str(&response.body).map_err(|e| {
            DeliveryError::invalid_reservation(format!("upstream returned invalid JSON: {e}"))
        })?;
        Ok(parse_reservation_list(value))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Extracts reservation objects from an upstream list response.
///
/// Non-object entries are dropped with a data quality warning. The result is
/// sorted oldest first by creation time; entries without one keep their
/// relative order at the end.
pub fn parse_reservation_list(value: Value) -> Vec<Reservation> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("reservations").or_else(|| map.remove("data")) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let mut reservations: Vec<Reservation> = items
        .into_iter()
        .filter_map(|item| {
            let parsed = Reservation::from_value(item);
            if parsed.is_none() {
                tracing::warn!(category = "data_quality", "upstream list entry is not an object");
            }
            parsed
        })
        .collect();

    reservations.sort_by_key(|r| r.timestamp(CREATED_AT_FIELDS).map_or(i64::MAX, |t| t.timestamp()));
    reservations
}

#[async_trait]
impl ReservationSource for HttpReservationSource {
    async fn fetch_created_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let url = self.url("reservations", &[
            ("created_since", timestamp(since)),
            ("limit", limit.max(1).to_string()),
        ])?;
        self.fetch_list(url).await
    }

    async fn fetch_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let url = self.url("reservations", &[("from", timestamp(from)), ("to", timestamp(to))])?;
        self.fetch_list(url).await
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Reservation>> {
        let url = self.url(&format!("reservations/{id}"), &[])?;
        match client::execute(self.transport.as_ref(), &self.get(url)).await {
            Ok(response) => {
                let value: Value = serde_json::from_str(&response.body).map_err(|e| {
                    DeliveryError::invalid_reservation(format!("upstream returned invalid JSON: {e}"))
                })?;
                let value = match value {
                    Value::Object(mut map) if map.contains_key("reservation") => {
                        map.remove("reservation").unwrap_or(Value::Null)
                    },
                    other => other,
                };
                Ok(Reservation::from_value(value))
            },
            Err(DeliveryError::ClientError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::client::HttpTransport;

    fn source(server: &MockServer) -> HttpReservationSource {
        HttpReservationSource::new(
            UpstreamConfig {
                base_url: server.uri(),
                api_token: Some("upstream-token".into()),
            },
            Arc::new(HttpTransport::with_defaults().unwrap()),
        )
    }

    #[test]
    fn list_parsing_accepts_wrapped_arrays_and_sorts() {
        let value = json!({"data": [
            {"code": "B", "created_at": "2025-05-02T00:00:00Z"},
            "garbage",
            {"code": "A", "created_at": "2025-05-01T00:00:00Z"},
        ]});

        let codes: Vec<String> = parse_reservation_list(value)
            .iter()
            .filter_map(|r| r.get_string("code"))
            .collect();

        assert_eq!(codes, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn fetch_created_since_sends_cursor_limit_and_token() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .and(matchers::path("/reservations"))
            .and(matchers::query_param("created_since", "2025-05-01T00:00:00Z"))
            .and(matchers::query_param("limit", "10"))
            .and(matchers::header("authorization", "Bearer upstream-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"code": "OLD", "created_at": "2025-05-01T00:00:00Z"},
                {"code": "R1", "created_at": "2025-05-01T00:05:00Z"},
            ])))
            .mount(&server)
            .await;

        let since = "2025-05-01T00:00:00Z".parse().unwrap();
        let reservations = source(&server).fetch_created_since(since, 10).await.unwrap();

        let codes: Vec<String> = reservations.iter().filter_map(|r| r.get_string("code")).collect();
        assert_eq!(codes, vec!["OLD", "R1"]);
    }

    #[tokio::test]
    async fn upstream_throttle_surfaces_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "30"))
            .mount(&server)
            .await;

        let err = source(&server).fetch_window(Utc::now(), Utc::now()).await.unwrap_err();

        assert_eq!(err.retry_after_seconds(), Some(30));
    }

    #[tokio::test]
    async fn fetch_by_id_maps_404_to_none() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/reservations/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reservation": {"code": "R1"}})))
            .mount(&server)
            .await;
        Mock::given(matchers::path("/reservations/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = source(&server);

        assert!(source.fetch_by_id("r1").await.unwrap().is_some());
        assert!(source.fetch_by_id("missing").await.unwrap().is_none());
    }
}
