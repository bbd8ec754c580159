//! In-memory upstream reservation API.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use staysync_core::models::Reservation;
use staysync_delivery::{
    dedup::{extract_identifiers, normalize_identifier, DEFAULT_IDENTIFIER_FIELDS},
    source::{ReservationSource, CREATED_AT_FIELDS},
    DeliveryError, Result,
};

#[derive(Default)]
struct State {
    reservations: Vec<Reservation>,
    throttled: bool,
    unavailable: bool,
    fetches: usize,
}

/// [`ReservationSource`] over a list of reservations.
///
/// Filtering follows the HTTP source: incremental fetches return
/// reservations created at or after the cursor, oldest first.
#[derive(Clone, Default)]
pub struct StaticReservationSource {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for StaticReservationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticReservationSource").finish_non_exhaustive()
    }
}

impl StaticReservationSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reservation.
    pub fn push(&self, reservation: Reservation) {
        self.lock().reservations.push(reservation);
    }

    /// Adds several reservations.
    pub fn extend(&self, reservations: impl IntoIterator<Item = Reservation>) {
        self.lock().reservations.extend(reservations);
    }

    /// Makes every fetch fail with HTTP 429.
    pub fn set_throttled(&self, throttled: bool) {
        self.lock().throttled = throttled;
    }

    /// Makes every fetch fail with a network error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of fetch calls so far.
    pub fn fetches(&self) -> usize {
        self.lock().fetches
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn select<F>(&self, keep: F) -> Result<Vec<Reservation>>
    where
        F: Fn(Option<DateTime<Utc>>) -> bool,
    {
        let mut state = self.lock();
        state.fetches += 1;
        if state.throttled {
            return Err(DeliveryError::rate_limited(60));
        }
        if state.unavailable {
            return Err(DeliveryError::network("upstream unavailable"));
        }

        let mut selected: Vec<Reservation> = state
            .reservations
            .iter()
            .filter(|r| keep(r.timestamp(CREATED_AT_FIELDS)))
            .cloned()
            .collect();
        selected.sort_by_key(|r| r.timestamp(CREATED_AT_FIELDS).map_or(i64::MAX, |t| t.timestamp()));
        Ok(selected)
    }
}

#[async_trait]
impl ReservationSource for StaticReservationSource {
    async fn fetch_created_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Reservation>> {
        let mut selected = self.select(|created| created.is_none_or(|at| at >= since))?;
        selected.truncate(limit);
        Ok(selected)
    }

    async fn fetch_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Reservation>> {
        self.select(|created| created.is_some_and(|at| at >= from && at <= to))
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<Reservation>> {
        let Some(wanted) = normalize_identifier(id) else {
            return Ok(None);
        };
        let found = self.select(|_| true)?.into_iter().find(|r| {
            extract_identifiers(r, DEFAULT_IDENTIFIER_FIELDS).contains(&wanted)
        });
        Ok(found)
    }
}
