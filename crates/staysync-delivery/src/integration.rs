//! Downstream integrations.
//!
//! An integration turns a reservation into one outbound call. Missing data
//! is reported as `DeliveryError::MissingField`, which the dispatcher treats
//! as "skipped" for that integration only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use staysync_core::models::Reservation;

use crate::{
    client::OutboundRequest,
    error::{DeliveryError, Result},
    rate_limit::RateLimit,
};

/// One downstream destination.
pub trait Integration: Send + Sync {
    /// Stable name, used as circuit and retry service key.
    fn name(&self) -> &str;

    /// Whether the integration is configured and active.
    fn is_enabled(&self) -> bool;

    /// Outbound throttle, if any.
    fn rate_limit(&self) -> Option<RateLimit> {
        None
    }

    /// Builds the outbound call for a reservation.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::MissingField` when the reservation lacks data
    /// this integration requires.
    fn build_request(&self, reservation: &Reservation) -> Result<OutboundRequest>;
}

/// Configuration of a [`JsonIntegration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonIntegrationConfig {
    /// Integration name.
    pub name: String,
    /// Destination URL. Empty means unconfigured.
    #[serde(default)]
    pub url: String,
    /// HTTP method.
    #[serde(default = "default_method")]
    pub method: String,
    /// Extra headers, e.g. credentials.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Reservation fields that must be present.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Whether the integration is active.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Outbound throttle.
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_enabled() -> bool {
    true
}

impl JsonIntegrationConfig {
    /// Creates an enabled POST integration.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            required_fields: Vec::new(),
            enabled: true,
            rate_limit: None,
        }
    }
}

/// Posts the reservation map as JSON to a configured URL.
#[derive(Debug, Clone)]
pub struct JsonIntegration {
    config: JsonIntegrationConfig,
}

impl JsonIntegration {
    /// Creates an integration from its configuration.
    pub fn new(config: JsonIntegrationConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &JsonIntegrationConfig {
        &self.config
    }
}

impl Integration for JsonIntegration {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.trim().is_empty()
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        self.config.rate_limit
    }

    fn build_request(&self, reservation: &Reservation) -> Result<OutboundRequest> {
        if let Some(missing) = self
            .config
            .required_fields
            .iter()
            .find(|field| reservation.get_string(field).is_none())
        {
            return Err(DeliveryError::missing_field(&self.config.name, missing));
        }

        let body = serde_json::to_string(reservation.as_map())
            .map_err(|e| DeliveryError::invalid_reservation(e.to_string()))?;

        let mut headers = self.config.headers.clone();
        headers
            .entry("content-type".to_string())
            .or_insert_with(|| "application/json".to_string());

        Ok(OutboundRequest {
            url: self.config.url.clone(),
            method: self.config.method.to_uppercase(),
            headers,
            body,
        })
    }
}
