//! Reservation deduplication and identity resolution.
//!
//! A reservation may be seen many times under different identifiers: the
//! upstream code on one sighting, a booking id or confirmation number on
//! the next. Every identifier is normalized and attached as an alias of one
//! stored identity, so a reservation processed under any of its names is
//! never dispatched again.
//!
//! Overlapping runs (a push racing a poll) are serialized by an in-flight
//! claim on the merged identity: a named lock with a lease, taken after the
//! merge and held until the run has marked the reservation processed.

use std::{sync::Arc, time::Duration};

use staysync_core::{
    models::{IdentityMerge, Reservation},
    Clock,
};
use uuid::Uuid;

use crate::{error::Result, storage::ReliabilityStorage};

/// Lock name prefix of in-flight claims.
pub const CLAIM_PREFIX: &str = "dedup:";

/// Default lease of an in-flight claim.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(300);

/// Identifier fields read from a reservation, in priority order.
pub const DEFAULT_IDENTIFIER_FIELDS: &[&str] = &[
    "code",
    "reservation_code",
    "reservation_id",
    "booking_id",
    "confirmation_number",
    "external_id",
    "id",
];

/// Lowercases and strips characters outside `[A-Za-z0-9_-]`.
///
/// Returns `None` when nothing is left.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let normalized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    (!normalized.is_empty()).then_some(normalized)
}

/// Extracts normalized identifiers from `fields`, in order, without
/// duplicates. The first one is the primary id.
pub fn extract_identifiers<S: AsRef<str>>(reservation: &Reservation, fields: &[S]) -> Vec<String> {
    let mut identifiers: Vec<String> = Vec::new();

    for field in fields {
        let Some(normalized) =
            reservation.get_string(field.as_ref()).as_deref().and_then(normalize_identifier)
        else {
            continue;
        };
        if !identifiers.contains(&normalized) {
            identifiers.push(normalized);
        }
    }

    identifiers
}

/// Result of admitting a reservation for dispatch.
#[derive(Debug)]
pub enum Admission {
    /// New. Carries the in-flight claim when the reservation has
    /// identifiers.
    Accepted(Option<DedupClaim>),
    /// Already processed.
    Duplicate,
    /// Another run is dispatching it.
    InFlight,
}

/// In-flight claim on one identity.
///
/// Release it after the reservation is marked processed, or when the run
/// fails. A claim that is never released lapses after its lease.
pub struct DedupClaim {
    storage: Arc<dyn ReliabilityStorage>,
    name: String,
    owner: String,
}

impl std::fmt::Debug for DedupClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupClaim").field("name", &self.name).finish_non_exhaustive()
    }
}

impl DedupClaim {
    /// Lock name of the claim.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Releases the claim. Failures are logged; the lease expires anyway.
    pub async fn release(self) {
        if let Err(e) = self.storage.release_lock(self.name.clone(), self.owner).await {
            tracing::warn!(claim = %self.name, error = %e, "failed to release dedup claim, it will expire");
        }
    }
}

/// Identifier-to-processed-state store.
#[derive(Clone)]
pub struct DedupStore {
    storage: Arc<dyn ReliabilityStorage>,
    clock: Arc<dyn Clock>,
    identifier_fields: Vec<String>,
    claim_ttl: Duration,
}

impl DedupStore {
    /// Creates a store reading the default identifier fields.
    pub fn new(storage: Arc<dyn ReliabilityStorage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            identifier_fields: DEFAULT_IDENTIFIER_FIELDS.iter().map(|f| (*f).to_string()).collect(),
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    /// Overrides the in-flight claim lease.
    #[must_use]
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Overrides the identifier fields.
    #[must_use]
    pub fn with_identifier_fields(mut self, fields: Vec<String>) -> Self {
        if !fields.is_empty() {
            self.identifier_fields = fields;
        }
        self
    }

    /// Extracts this store's identifiers from a reservation.
    pub fn identifiers(&self, reservation: &Reservation) -> Vec<String> {
        extract_identifiers(reservation, &self.identifier_fields)
    }

    /// Returns true if `id` names a processed reservation.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the lookup fails.
    pub async fn is_processed(&self, id: &str) -> Result<bool> {
        let Some(normalized) = normalize_identifier(id) else {
            return Ok(false);
        };

        let identity = self.storage.find_identity(normalized).await?;
        Ok(identity.is_some_and(|identity| identity.processed))
    }

    /// Records every identifier on the reservation as one processed
    /// identity.
    ///
    /// Returns `None` when the reservation has no usable identifier.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the merge fails.
    pub async fn mark_processed(&self, reservation: &Reservation) -> Result<Option<IdentityMerge>> {
        let identifiers = self.identifiers(reservation);
        if identifiers.is_empty() {
            tracing::warn!(category = "data_quality", "reservation has no identifier, not recorded");
            return Ok(None);
        }

        let merge = self.storage.merge_identity(identifiers, true, self.clock.now()).await?;
        tracing::debug!(
            primary_id = %merge.identity.primary_id,
            aliases = merge.identity.aliases.len(),
            "reservation marked processed"
        );
        Ok(Some(merge))
    }

    /// Returns false if any identifier on the reservation was processed.
    ///
    /// Identifiers not seen before are attached to the existing identity
    /// either way, so a duplicate teaches the store its new aliases.
    /// Reservations without identifiers are always new.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the merge fails.
    pub async fn should_process(&self, reservation: &Reservation) -> Result<bool> {
        let identifiers = self.identifiers(reservation);
        if identifiers.is_empty() {
            tracing::warn!(
                category = "data_quality",
                "reservation has no identifier, treating as new"
            );
            return Ok(true);
        }

        Ok(!self.merge_sighting(identifiers).await?.was_processed)
    }

    /// Like [`DedupStore::should_process`], but also claims a new
    /// reservation so overlapping runs dispatch it once.
    ///
    /// The processed flag is read again after the claim is taken, since a
    /// run that finished in between has already marked it.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::StorageError` if the merge or claim fails.
    pub async fn admit(&self, reservation: &Reservation) -> Result<Admission> {
        let identifiers = self.identifiers(reservation);
        if identifiers.is_empty() {
            tracing::warn!(
                category = "data_quality",
                "reservation has no identifier, treating as new"
            );
            return Ok(Admission::Accepted(None));
        }

        let merge = self.merge_sighting(identifiers).await?;
        if merge.was_processed {
            return Ok(Admission::Duplicate);
        }

        let primary_id = merge.identity.primary_id;
        let name = format!("{CLAIM_PREFIX}{primary_id}");
        let owner = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(self.claim_ttl).unwrap_or_default();

        if !self.storage.try_acquire_lock(name.clone(), owner.clone(), now, expires_at).await? {
            tracing::debug!(%primary_id, "reservation is being dispatched by another run");
            return Ok(Admission::InFlight);
        }
        let claim = DedupClaim { storage: self.storage.clone(), name, owner };

        match self.storage.find_identity(primary_id).await {
            Ok(Some(identity)) if identity.processed => {
                claim.release().await;
                Ok(Admission::Duplicate)
            },
            Ok(_) => Ok(Admission::Accepted(Some(claim))),
            Err(e) => {
                claim.release().await;
                Err(e.into())
            },
        }
    }

    async fn merge_sighting(&self, identifiers: Vec<String>) -> Result<IdentityMerge> {
        let merge = self.storage.merge_identity(identifiers, false, self.clock.now()).await?;
        if merge.was_processed && !merge.learned.is_empty() {
            tracing::info!(
                primary_id = %merge.identity.primary_id,
                learned = ?merge.learned,
                "learned aliases from duplicate reservation"
            );
        }
        Ok(merge)
    }
}
