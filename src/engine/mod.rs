mod conflict;
mod mutations;
mod queries;
mod store;

pub use store::ReservationStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Stage it in memory.
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Commit the whole batch with one write and one fsync. A failed commit
///    leaves none of the batch in the log.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the batch first so the command sees every prior append.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(
            poisoned = wal.is_poisoned(),
            "WAL flush failed for batch of {}: {e}",
            batch.len()
        );
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch.iter() {
        if let Err(e) = wal.stage(event) {
            wal.discard_staged();
            return Err(e);
        }
    }
    wal.commit()
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The durable reservation store.
///
/// Each resource owns one `RwLock<ResourceState>`, created lazily on first
/// commit and never removed, so every commit for a resource contends on the
/// same lock while different resources proceed independently.
pub struct Engine {
    pub state: DashMap<String, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, String>,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot and the log swap see no in-flight appends.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event directly to a ResourceState (no locking; caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, String>) {
    match event {
        Event::ReservationCommitted {
            id,
            resource_id,
            span,
        } => {
            rs.insert_interval(Interval { id: *id, span: *span });
            entity_map.insert(*id, resource_id.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            rs.remove_interval(*id);
            entity_map.remove(id);
        }
    }
}

/// Apply a logged event during recovery. A commit that reuses a live id or
/// overlaps a live interval would break the no-overlap invariant, so it is
/// skipped. Returns whether the event was applied.
fn replay_into(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, String>) -> bool {
    if let Event::ReservationCommitted { id, resource_id, span } = event {
        if entity_map.contains_key(id) {
            tracing::error!(%id, resource_id = %resource_id, "WAL replays a duplicate reservation id, skipping");
            return false;
        }
        if let Err(existing) = conflict::check_no_conflict(rs, span) {
            tracing::error!(%id, %existing, resource_id = %resource_id, "WAL replays an overlapping reservation, skipping");
            return false;
        }
    }
    apply_to_resource(rs, event, entity_map);
    true
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            entity_to_resource: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // Never use blocking_write here: this runs inside an async context.
        let mut skipped = 0usize;
        for event in &events {
            let rs = engine.resource_entry(event.resource_id());
            match rs.try_write() {
                Ok(mut guard) => {
                    if !replay_into(&mut guard, event, &engine.entity_to_resource) {
                        skipped += 1;
                    }
                }
                Err(_) => {
                    return Err(io::Error::other("replay: resource state unexpectedly locked"));
                }
            }
        }
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            skipped,
            resources = engine.state.len(),
            "replayed WAL"
        );

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Get the lock for a resource, creating an empty one on first use.
    pub(super) fn resource_entry(&self, id: &str) -> SharedResourceState {
        if let Some(rs) = self.get_resource(id) {
            return rs;
        }
        self.state
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id.to_owned()))))
            .value()
            .clone()
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<String> {
        self.entity_to_resource.get(entity_id).map(|e| e.value().clone())
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.entity_to_resource);
        Ok(())
    }
}
