//! Reservation and integration builders with sensible defaults.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use staysync_core::models::Reservation;
use staysync_delivery::{integration::JsonIntegrationConfig, rate_limit::RateLimit};
use uuid::Uuid;

/// Builder for test reservations.
#[derive(Debug, Clone, Default)]
pub struct ReservationBuilder {
    fields: Map<String, Value>,
}

impl ReservationBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder with a random code, a guest and a creation time.
    pub fn with_defaults() -> Self {
        let code = format!("RES-{}", &Uuid::new_v4().simple().to_string()[..8]).to_uppercase();
        Self::new()
            .code(code)
            .field("guest_name", "Test Guest")
            .field("hotel_id", "hotel-1")
            .field("check_in", "2025-07-01")
            .field("check_out", "2025-07-04")
            .field("total_amount", 420.5)
            .created_at(Utc::now())
    }

    /// Sets the reservation code.
    #[must_use]
    pub fn code(self, code: impl Into<String>) -> Self {
        self.field("code", code.into())
    }

    /// Sets an alternate identifier field, e.g. `booking_id`.
    #[must_use]
    pub fn alias(self, field: &str, value: impl Into<String>) -> Self {
        self.field(field, value.into())
    }

    /// Sets the creation time.
    #[must_use]
    pub fn created_at(self, at: DateTime<Utc>) -> Self {
        self.field("created_at", at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    /// Sets an arbitrary field.
    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Removes a field.
    #[must_use]
    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    /// Builds the reservation.
    pub fn build(self) -> Reservation {
        Reservation::new(self.fields)
    }
}

/// Reservation with only a code and creation time.
pub fn reservation(code: &str, created_at: DateTime<Utc>) -> Reservation {
    ReservationBuilder::new().code(code).created_at(created_at).build()
}

/// Integration posting to `https://{name}.test/events`.
pub fn integration(name: &str) -> JsonIntegrationConfig {
    JsonIntegrationConfig::new(name, integration_url(name))
}

/// Integration with a per-integration rate limit.
pub fn rate_limited_integration(name: &str, limit: RateLimit) -> JsonIntegrationConfig {
    JsonIntegrationConfig { rate_limit: Some(limit), ..integration(name) }
}

/// URL of the integration built by [`integration`].
pub fn integration_url(name: &str) -> String {
    format!("https://{name}.test/events")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_code_and_creation_time() {
        let reservation = ReservationBuilder::with_defaults().build();

        assert!(reservation.get_string("code").is_some_and(|c| c.starts_with("RES-")));
        assert!(reservation.timestamp(&["created_at"]).is_some());
    }

    #[test]
    fn without_drops_a_field() {
        let reservation = ReservationBuilder::with_defaults().without("code").build();

        assert!(!reservation.has_field("code"));
    }
}
