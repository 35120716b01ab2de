//! The three booking operations: create, cancel, list.
//!
//! A create moves through `Validating → Checking → Committed`. A validator
//! failure rejects it before the store is touched; an overlap found by the
//! store's atomic commit rejects it at `Checking`.

use std::sync::Arc;

use ulid::Ulid;

use crate::engine::{Engine, ReservationStore};
use crate::error::{BookingError, CommitError, DomainError};
use crate::model::{Ms, Reservation, Timestamp};
use crate::observability::{CANCELS_TOTAL, RESERVATIONS_TOTAL};
use crate::validate::{now_ms, validate};

pub struct BookingService<S: ReservationStore = Engine> {
    store: Arc<S>,
}

impl<S: ReservationStore> BookingService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Book `[start, end)` on `resource_id`, evaluated against the wall clock.
    pub async fn create(
        &self,
        resource_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Reservation, BookingError> {
        self.create_at(resource_id, start, end, now_ms()).await
    }

    /// Book `[start, end)` on `resource_id` as of `now` (Unix ms).
    pub async fn create_at(
        &self,
        resource_id: &str,
        start: Timestamp,
        end: Timestamp,
        now: Ms,
    ) -> Result<Reservation, BookingError> {
        let span = match validate(resource_id, &start, &end, now) {
            Ok(span) => span,
            Err(e) => return Err(reject(resource_id, e)),
        };

        let id = Ulid::new();
        match self.store.commit(resource_id, id, span).await {
            Ok(reservation) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "committed").increment(1);
                tracing::info!(%id, resource_id, %start, %end, "reservation committed");
                Ok(reservation)
            }
            Err(CommitError::Conflict(existing)) => Err(reject(
                resource_id,
                DomainError::Conflict {
                    resource_id: resource_id.to_owned(),
                    existing,
                },
            )),
            Err(CommitError::Store(e)) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "store_error").increment(1);
                tracing::error!(resource_id, "commit failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Cancel a reservation. Cancelling an id that is absent, or already
    /// cancelled, fails with `NotFound`.
    pub async fn cancel(&self, id: &str) -> Result<(), BookingError> {
        // Not a ULID, so it cannot name a reservation.
        let Ok(ulid) = Ulid::from_string(id) else {
            metrics::counter!(CANCELS_TOTAL, "outcome" => "not_found").increment(1);
            return Err(DomainError::NotFound(id.to_owned()).into());
        };
        match self.store.remove(ulid).await {
            Ok(true) => {
                metrics::counter!(CANCELS_TOTAL, "outcome" => "cancelled").increment(1);
                tracing::info!(%ulid, "reservation cancelled");
                Ok(())
            }
            Ok(false) => {
                metrics::counter!(CANCELS_TOTAL, "outcome" => "not_found").increment(1);
                tracing::debug!(%ulid, "cancel: no such reservation");
                Err(DomainError::NotFound(id.to_owned()).into())
            }
            Err(e) => {
                metrics::counter!(CANCELS_TOTAL, "outcome" => "store_error").increment(1);
                tracing::error!(%ulid, "cancel failed: {e}");
                Err(e.into())
            }
        }
    }

    /// All reservations on `resource_id`, ordered by start.
    pub async fn list(&self, resource_id: &str) -> Result<Vec<Reservation>, BookingError> {
        Ok(self.store.list_by_resource(resource_id).await?)
    }
}

fn reject(resource_id: &str, e: DomainError) -> BookingError {
    metrics::counter!(RESERVATIONS_TOTAL, "outcome" => e.kind()).increment(1);
    tracing::debug!(resource_id, kind = e.kind(), "reservation rejected: {e}");
    e.into()
}
