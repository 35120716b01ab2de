use async_trait::async_trait;
use ulid::Ulid;

use crate::error::{CommitError, StoreError};
use crate::model::{Reservation, Span};

use super::Engine;

/// Durable keeper of committed reservations.
///
/// `commit` must run the overlap check and the insert as one atomic step
/// with respect to every other commit on the same resource.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn commit(
        &self,
        resource_id: &str,
        id: Ulid,
        span: Span,
    ) -> Result<Reservation, CommitError>;

    /// `Ok(false)` when no reservation has this id.
    async fn remove(&self, id: Ulid) -> Result<bool, StoreError>;

    /// Ordered by start ascending; empty when the resource has none.
    async fn list_by_resource(&self, resource_id: &str) -> Result<Vec<Reservation>, StoreError>;
}

#[async_trait]
impl ReservationStore for Engine {
    async fn commit(
        &self,
        resource_id: &str,
        id: Ulid,
        span: Span,
    ) -> Result<Reservation, CommitError> {
        self.commit_reservation(resource_id, id, span).await
    }

    async fn remove(&self, id: Ulid) -> Result<bool, StoreError> {
        self.remove_reservation(id).await
    }

    async fn list_by_resource(&self, resource_id: &str) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.reservations_for(resource_id).await)
    }
}
