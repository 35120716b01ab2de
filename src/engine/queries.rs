use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    /// Snapshot of a resource's reservations, ordered by start. Empty for an unknown resource.
    pub async fn reservations_for(&self, resource_id: &str) -> Vec<Reservation> {
        let Some(rs) = self.get_resource(resource_id) else {
            return Vec::new();
        };
        let guard = rs.read().await;
        guard.reservations()
    }

    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let resource_id = self.get_resource_for_entity(&id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard
            .intervals
            .iter()
            .find(|i| i.id == id)
            .map(|i| Reservation {
                id,
                resource_id,
                span: i.span,
            })
    }
}
