//! Core domain models for reservation forwarding.
//!
//! Reservations stay a generic string-keyed map; consumers pull what they
//! need through narrow extractors instead of a monolithic struct. The
//! remaining types are the durable reliability records shared by every
//! node: identities, circuits, retry entries, rate windows, poll cursors
//! and scheduler locks. Database serialization traits live next to the
//! enums that need them.

use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// One booking event as received from a webhook or the upstream API.
///
/// Wraps the raw JSON object. Field names vary between producers, so
/// accessors accept a list of candidate keys and return the first present.
///
/// # Example
///
/// ```
/// use staysync_core::models::Reservation;
/// let reservation = Reservation::from_value(serde_json::json!({"code": "R1", "amount": 100}))
///     .unwrap();
/// assert_eq!(reservation.get_string("code").as_deref(), Some("R1"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reservation(Map<String, Value>);

impl Reservation {
    /// Wraps an existing JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON value, returning `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Returns the raw value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns a field as a non-empty string.
    ///
    /// Integer and boolean values are rendered as strings since upstream
    /// producers are inconsistent about identifier types.
    pub fn get_string(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Returns the first non-empty string among candidate fields.
    pub fn first_string(&self, fields: &[&str]) -> Option<String> {
        fields.iter().find_map(|field| self.get_string(field))
    }

    /// Returns the first parseable timestamp among candidate fields.
    ///
    /// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (interpreted as UTC) and unix
    /// seconds.
    pub fn timestamp(&self, fields: &[&str]) -> Option<DateTime<Utc>> {
        fields.iter().find_map(|field| match self.0.get(*field)? {
            Value::String(s) => parse_timestamp(s),
            Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
            _ => None,
        })
    }

    /// Returns true if the field is present and not null or empty.
    pub fn has_field(&self, field: &str) -> bool {
        match self.0.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }
    }

    /// Sets a field, replacing any previous value.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    /// Returns the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consumes the reservation and returns it as a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Reservation {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Logical reservation as known to the dedup store.
///
/// Every identifier ever observed for the same booking resolves to one
/// identity. Identities are never deleted by the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationIdentity {
    /// Internal identity key.
    pub id: Uuid,

    /// First identifier the identity was created from (normalized).
    pub primary_id: String,

    /// Other identifiers observed for the same reservation (normalized).
    pub aliases: BTreeSet<String>,

    /// Whether dispatch has been attempted for this reservation.
    pub processed: bool,

    /// When any identifier of this reservation was first seen.
    pub first_seen_at: DateTime<Utc>,

    /// When the reservation was marked processed.
    pub processed_at: Option<DateTime<Utc>>,

    /// Last time aliases or processed state changed.
    pub updated_at: DateTime<Utc>,
}

impl ReservationIdentity {
    /// Returns true if the identifier is the primary id or a known alias.
    pub fn matches(&self, identifier: &str) -> bool {
        self.primary_id == identifier || self.aliases.contains(identifier)
    }

    /// Iterates the primary id followed by all aliases.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_id.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Outcome of merging identifiers into the dedup store.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMerge {
    /// Identity after the merge.
    pub identity: ReservationIdentity,

    /// True if no identifier was known before and a new identity was created.
    pub created: bool,

    /// Identifiers attached by this merge that were previously unknown.
    pub learned: Vec<String>,

    /// Processed flag before this merge.
    pub was_processed: bool,
}

/// Circuit breaker state for a downstream service.
///
/// Transitions only along closed→open, open→half_open, half_open→closed
/// and half_open→open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    #[default]
    Closed,

    /// Service is failing, requests short-circuited without I/O.
    Open,

    /// Testing if the service recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl sqlx::Type<PgDb> for CircuitState {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for CircuitState {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("invalid circuit state: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for CircuitState {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Persisted circuit breaker row, keyed by service name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CircuitRecord {
    /// Downstream service this circuit protects.
    pub service: String,

    /// Current state.
    pub state: CircuitState,

    /// Consecutive failures while closed.
    pub failure_count: i32,

    /// Consecutive successes while half-open.
    pub success_count: i32,

    /// Failures that open the circuit.
    pub failure_threshold: i32,

    /// Half-open successes that close the circuit.
    pub success_threshold: i32,

    /// Seconds an open circuit waits before admitting trial calls.
    pub recovery_timeout_seconds: i64,

    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,

    /// Last state change or counter update.
    pub updated_at: DateTime<Utc>,
}

impl CircuitRecord {
    /// Creates a closed circuit with the given thresholds.
    pub fn closed(
        service: impl Into<String>,
        failure_threshold: i32,
        success_threshold: i32,
        recovery_timeout_seconds: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service: service.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            failure_threshold,
            success_threshold,
            recovery_timeout_seconds,
            opened_at: None,
            updated_at: now,
        }
    }

    /// Returns when an open circuit will admit trial calls.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Open => self
                .opened_at
                .map(|opened| opened + chrono::Duration::seconds(self.recovery_timeout_seconds)),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }
}

/// Lifecycle of a retry queue entry.
///
/// Rows are only persisted while `Queued`; terminal states are reported on
/// the entry returned when the row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Waiting for its scheduled retry time.
    Queued,

    /// Re-sent successfully and removed.
    Done,

    /// Gave up after max attempts or a permanent error and removed.
    Abandoned,
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Done => write!(f, "done"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl sqlx::Type<PgDb> for RetryStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RetryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "queued" => Ok(Self::Queued),
            "done" => Ok(Self::Done),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("invalid retry status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for RetryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Processing priority of a retry entry. Lower rank is processed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPriority {
    /// Calls deferred by an open circuit; they never reached the service.
    High,

    /// Ordinary transient failures.
    Normal,

    /// Background work that can wait.
    Low,
}

impl RetryPriority {
    /// Sort rank used by storage.
    pub const fn rank(self) -> i16 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Inverse of [`RetryPriority::rank`]. Unknown ranks map to `Low`.
    pub const fn from_rank(rank: i16) -> Self {
        match rank {
            0 => Self::High,
            1 => Self::Normal,
            _ => Self::Low,
        }
    }
}

impl sqlx::Type<PgDb> for RetryPriority {
    fn type_info() -> PgTypeInfo {
        <i16 as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for RetryPriority {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let rank = <i16 as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self::from_rank(rank))
    }
}

impl sqlx::Encode<'_, PgDb> for RetryPriority {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <i16 as sqlx::Encode<PgDb>>::encode_by_ref(&self.rank(), buf)
    }
}

/// Durable record of a failed outbound operation awaiting redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RetryEntry {
    /// Unique identifier for this entry.
    pub id: Uuid,

    /// Downstream service (integration name) the call targets.
    pub service: String,

    /// Kind of operation, e.g. `dispatch`.
    pub operation_type: String,

    /// Processing priority.
    pub priority: RetryPriority,

    /// Serialized original request, replayed verbatim.
    pub payload: Value,

    /// Logical identity of the retry; at most one queued row per key.
    pub dedupe_key: String,

    /// Earliest time the entry may be re-sent.
    pub scheduled_retry_at: DateTime<Utc>,

    /// Re-send attempts made so far.
    pub attempts: i32,

    /// Attempts after which the entry is abandoned.
    pub max_attempts: i32,

    /// Most recent failure reason.
    pub last_error: Option<String>,

    /// Current lifecycle state.
    pub status: RetryStatus,

    /// Lease held by a retry pass; other passes skip the entry until then.
    pub claimed_until: Option<DateTime<Utc>>,

    /// When the entry was first enqueued.
    pub created_at: DateTime<Utc>,

    /// Last reschedule.
    pub updated_at: DateTime<Utc>,
}

/// Parameters for enqueueing a retry entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRetryEntry {
    /// Downstream service the call targets.
    pub service: String,
    /// Kind of operation.
    pub operation_type: String,
    /// Processing priority.
    pub priority: RetryPriority,
    /// Serialized original request.
    pub payload: Value,
    /// Insert-if-absent key.
    pub dedupe_key: String,
    /// First retry time.
    pub scheduled_retry_at: DateTime<Utc>,
    /// Attempts before abandonment.
    pub max_attempts: i32,
    /// Reason for the original failure.
    pub last_error: Option<String>,
}

impl NewRetryEntry {
    /// Materializes the entry as stored, with zero attempts.
    pub fn into_entry(self, now: DateTime<Utc>) -> RetryEntry {
        RetryEntry {
            id: Uuid::new_v4(),
            service: self.service,
            operation_type: self.operation_type,
            priority: self.priority,
            payload: self.payload,
            dedupe_key: self.dedupe_key,
            scheduled_retry_at: self.scheduled_retry_at,
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            status: RetryStatus::Queued,
            claimed_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Fixed-window counter state for one rate limit key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RateLimitWindow {
    /// Limiter key, e.g. `integration:ga4`.
    pub key: String,

    /// Start of the current window.
    pub window_start: DateTime<Utc>,

    /// Requests admitted in the current window.
    pub count: i64,
}

impl RateLimitWindow {
    /// Creates an empty window starting now.
    pub fn empty(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self { key: key.into(), window_start: now, count: 0 }
    }
}

/// Progress and health bookkeeping for the adaptive poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollCursor {
    /// Cursor name; one per upstream source.
    pub name: String,

    /// Last time a continuous poll started.
    pub last_continuous_poll_at: Option<DateTime<Utc>>,

    /// High-water mark of the last successful continuous poll.
    pub last_successful_continuous_poll_at: Option<DateTime<Utc>>,

    /// Last time a deep check started.
    pub last_deep_check_at: Option<DateTime<Utc>>,

    /// Completion time of the last successful deep check.
    pub last_successful_deep_check_at: Option<DateTime<Utc>>,

    /// Last self-healing recovery.
    pub last_recovery_at: Option<DateTime<Utc>>,

    /// Traffic-triggered lag checks performed.
    pub traffic_checks: i64,

    /// Sum of observed lag across checks, in seconds.
    pub traffic_total_lag_seconds: i64,

    /// Largest observed lag, in seconds.
    pub traffic_max_lag_seconds: i64,

    /// Inline polls triggered by traffic.
    pub traffic_recoveries: i64,

    /// Last update.
    pub updated_at: DateTime<Utc>,
}

impl PollCursor {
    /// Creates an empty cursor.
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            last_continuous_poll_at: None,
            last_successful_continuous_poll_at: None,
            last_deep_check_at: None,
            last_successful_deep_check_at: None,
            last_recovery_at: None,
            traffic_checks: 0,
            traffic_total_lag_seconds: 0,
            traffic_max_lag_seconds: 0,
            traffic_recoveries: 0,
            updated_at: now,
        }
    }

    /// Average lag observed by traffic checks, in seconds.
    pub fn average_lag_seconds(&self) -> f64 {
        if self.traffic_checks == 0 {
            0.0
        } else {
            self.traffic_total_lag_seconds as f64 / self.traffic_checks as f64
        }
    }
}

/// Named mutual-exclusion lock with crash-safe expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SchedulerLock {
    /// Lock name.
    pub name: String,
    /// Holder token.
    pub owner: String,
    /// When the current holder acquired it.
    pub acquired_at: DateTime<Utc>,
    /// When the lock lapses if never released.
    pub expires_at: DateTime<Utc>,
}

/// Aggregate outcome of a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every attempted integration succeeded.
    Success,

    /// At least one succeeded and at least one failed.
    Partial,

    /// None of the attempted integrations succeeded.
    Failed,
}

impl DispatchStatus {
    /// Derives the aggregate status from success and failure counts.
    ///
    /// Skipped integrations never count. With nothing attempted the result
    /// is `Success`; there was nothing to fail.
    pub const fn from_counts(successful: usize, failed: usize) -> Self {
        match (successful, failed) {
            (_, 0) => Self::Success,
            (0, _) => Self::Failed,
            _ => Self::Partial,
        }
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of dispatching one reservation to every enabled integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Primary identifier of the reservation, if it had one.
    pub reservation_id: Option<String>,

    /// Aggregate status.
    pub status: DispatchStatus,

    /// Integrations that accepted the reservation.
    pub successful: Vec<String>,

    /// Integrations that failed.
    pub failed: Vec<String>,

    /// Integrations that were not applicable.
    pub skipped: Vec<String>,

    /// Failure reason per failed integration, in `failed` order.
    pub errors: Vec<(String, String)>,

    /// Retry entries enqueued for this dispatch.
    pub retries_enqueued: usize,
}

impl DispatchResult {
    /// Creates an empty result for a reservation.
    pub fn new(reservation_id: Option<String>) -> Self {
        Self {
            reservation_id,
            status: DispatchStatus::Success,
            successful: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
            retries_enqueued: 0,
        }
    }

    /// Recomputes `status` from the success and failure lists.
    pub fn finalize(&mut self) {
        self.status = DispatchStatus::from_counts(self.successful.len(), self.failed.len());
    }
}
