use tokio::sync::oneshot;
use ulid::Ulid;

use crate::error::{CommitError, StoreError};
use crate::model::*;

use super::conflict::check_no_conflict;
use super::{Engine, WalCommand};

impl Engine {
    /// Check for overlap and insert as one step under the resource's write lock.
    pub async fn commit_reservation(
        &self,
        resource_id: &str,
        id: Ulid,
        span: Span,
    ) -> Result<Reservation, CommitError> {
        let _gate = self.compaction_gate.read().await;
        let rs = self.resource_entry(resource_id);
        let mut guard = rs.write().await;

        check_no_conflict(&guard, &span).map_err(CommitError::Conflict)?;

        let event = Event::ReservationCommitted {
            id,
            resource_id: resource_id.to_owned(),
            span,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Reservation {
            id,
            resource_id: resource_id.to_owned(),
            span,
        })
    }

    /// Remove a reservation. `Ok(false)` if no such reservation exists.
    pub async fn remove_reservation(&self, id: Ulid) -> Result<bool, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let Some(resource_id) = self.get_resource_for_entity(&id) else {
            return Ok(false);
        };
        let Some(rs) = self.get_resource(&resource_id) else {
            return Ok(false);
        };
        let mut guard = rs.write().await;
        // A concurrent remove may have won the lock first.
        if !guard.contains(id) {
            return Ok(false);
        }

        let event = Event::ReservationCancelled { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Reservations whose end is at or before `cutoff`, as (id, resource_id).
    /// Resources currently locked for writing are skipped.
    pub fn collect_finished(&self, cutoff: Ms) -> Vec<(Ulid, String)> {
        let mut finished = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for interval in &guard.intervals {
                    if interval.span.end <= cutoff {
                        finished.push((interval.id, guard.id.clone()));
                    }
                }
            }
        }
        finished
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;

        let resources: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            for interval in &guard.intervals {
                events.push(Event::ReservationCommitted {
                    id: interval.id,
                    resource_id: guard.id.clone(),
                    span: interval.span,
                });
            }
        }
        let live = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        tracing::info!(live, "compacted WAL");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
