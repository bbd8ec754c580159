//! Error types for reservation forwarding.
//!
//! Covers outbound call failures, circuit and rate-limit deferrals, data
//! quality problems in reservations, scheduling and storage failures. Every
//! error maps to an [`ErrorCategory`] that decides how it is handled:
//! retried, failed permanently, skipped, or propagated.

use std::fmt;

use staysync_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for reservation forwarding operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// HTTP response indicated a client error (4xx other than 429).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response indicated a server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Rate limit exceeded, either locally or reported by the remote side.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds to wait before retrying
        retry_after_seconds: u64,
    },

    /// Circuit breaker is open, call deferred without I/O.
    #[error("circuit breaker open for service {service}")]
    CircuitOpen {
        /// Service whose circuit is open
        service: String,
    },

    /// Reservation lacks a field an integration requires.
    #[error("reservation missing required field '{field}' for {integration}")]
    MissingField {
        /// Integration that needed the field
        integration: String,
        /// Name of the missing field
        field: String,
    },

    /// Reservation payload is malformed.
    #[error("invalid reservation: {message}")]
    InvalidReservation {
        /// What is wrong with it
        message: String,
    },

    /// All retry attempts exhausted.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of retry attempts made
        attempts: u32,
    },

    /// Shared store operation failed.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Invalid integration or component configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Task registration or scheduling failed.
    #[error("scheduling error: {message}")]
    SchedulingError {
        /// Scheduling error message
        message: String,
    },

    /// Shutdown requested while work was pending.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with retry guidance.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(service: impl Into<String>) -> Self {
        Self::CircuitOpen { service: service.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(integration: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField { integration: integration.into(), field: field.into() }
    }

    /// Creates an invalid reservation error.
    pub fn invalid_reservation(message: impl Into<String>) -> Self {
        Self::InvalidReservation { message: message.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a scheduling error.
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::SchedulingError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Determines if this error represents a temporary failure that should be
    /// retried through the retry queue.
    ///
    /// Returns `true` for network errors, timeouts, server errors (5xx), rate
    /// limits and open circuits. Open circuits are deferrals: the call never
    /// happened and must still be made.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::CircuitOpen { .. } => true,

            Self::ClientError { .. }
            | Self::MissingField { .. }
            | Self::InvalidReservation { .. }
            | Self::RetriesExhausted { .. }
            | Self::StorageError { .. }
            | Self::ConfigurationError { .. }
            | Self::SchedulingError { .. }
            | Self::ShutdownRequested
            | Self::InternalError { .. } => false,
        }
    }

    /// Returns true if the integration rejected the call for good.
    ///
    /// Permanent failures are recorded as failed and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::ClientError { .. } | Self::ConfigurationError { .. })
    }

    /// Returns the suggested retry delay in seconds for retryable errors.
    ///
    /// Uses the Retry-After guidance for rate limits, or None to indicate
    /// standard exponential backoff should be used.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Returns the error category.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

/// How an error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or missing credentials on inbound requests. Rejected, never retried.
    Auth,
    /// Timeouts, connection failures, 5xx and 429. Retried with backoff.
    TransientNetwork,
    /// Open circuit. Deferred to the retry queue at high priority.
    Circuit,
    /// 4xx other than 429 or bad integration configuration. Not retried.
    PermanentIntegration,
    /// Malformed reservation or missing field. Integration skipped.
    DataQuality,
    /// Task registration failures. Logged and recovered idempotently.
    Scheduling,
    /// Shared store failures. Propagated to the entrypoint caller.
    Storage,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::ServerError { .. }
            | DeliveryError::RateLimited { .. } => Self::TransientNetwork,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::ClientError { .. }
            | DeliveryError::RetriesExhausted { .. }
            | DeliveryError::ConfigurationError { .. } => Self::PermanentIntegration,
            DeliveryError::MissingField { .. } | DeliveryError::InvalidReservation { .. } => {
                Self::DataQuality
            },
            DeliveryError::SchedulingError { .. } => Self::Scheduling,
            DeliveryError::StorageError { .. } => Self::Storage,
            DeliveryError::ShutdownRequested | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::TransientNetwork => write!(f, "transient_network"),
            Self::Circuit => write!(f, "circuit"),
            Self::PermanentIntegration => write!(f, "permanent_integration"),
            Self::DataQuality => write!(f, "data_quality"),
            Self::Scheduling => write!(f, "scheduling"),
            Self::Storage => write!(f, "storage"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(500, "internal server error").is_retryable());
        assert!(DeliveryError::rate_limited(60).is_retryable());
        assert!(DeliveryError::circuit_open("meta").is_retryable());

        assert!(!DeliveryError::client_error(404, "not found").is_retryable());
        assert!(!DeliveryError::missing_field("ga4", "email").is_retryable());
        assert!(!DeliveryError::retries_exhausted(5).is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(!DeliveryError::storage("connection lost").is_retryable());
    }

    #[test]
    fn permanent_errors_are_client_and_configuration() {
        assert!(DeliveryError::client_error(401, "bad token").is_permanent());
        assert!(DeliveryError::configuration("no url").is_permanent());
        assert!(!DeliveryError::server_error(503, "").is_permanent());
        assert!(!DeliveryError::missing_field("meta", "email").is_permanent());
    }

    #[test]
    fn rate_limit_retry_after_extracted() {
        let error = DeliveryError::rate_limited(120);
        assert_eq!(error.retry_after_seconds(), Some(120));

        let timeout_error = DeliveryError::timeout(30);
        assert_eq!(timeout_error.retry_after_seconds(), None);
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(DeliveryError::network("test").category(), ErrorCategory::TransientNetwork);
        assert_eq!(DeliveryError::rate_limited(1).category(), ErrorCategory::TransientNetwork);
        assert_eq!(
            DeliveryError::client_error(400, "bad request").category(),
            ErrorCategory::PermanentIntegration
        );
        assert_eq!(
            DeliveryError::missing_field("ga4", "client_id").category(),
            ErrorCategory::DataQuality
        );
        assert_eq!(DeliveryError::circuit_open("meta").category(), ErrorCategory::Circuit);
        assert_eq!(DeliveryError::storage("down").category(), ErrorCategory::Storage);
    }

    #[test]
    fn core_errors_become_storage_errors() {
        let err = DeliveryError::from(CoreError::Database("pool closed".into()));
        assert!(matches!(err, DeliveryError::StorageError { .. }));
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::timeout(30);
        assert_eq!(error.to_string(), "request timeout after 30s");

        let circuit_error = DeliveryError::circuit_open("meta");
        assert_eq!(circuit_error.to_string(), "circuit breaker open for service meta");
    }
}
