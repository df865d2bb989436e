mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{
    available_slots, compute_available_slots, slot_candidates, AvailabilityRequest, SlotCandidate,
    DEFAULT_SERVICE_DURATION_MINUTES, SLOT_GRANULARITY_MINUTES,
};
pub use error::EngineError;
pub use store::BookingStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Invalidation, NotifyHub};
use crate::wal::Wal;

pub type SharedBusinessState = Arc<RwLock<BusinessState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while a flush is
/// in progress are written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// In-memory store of businesses and their calendars, made durable by the WAL.
pub struct Engine {
    pub state: DashMap<Ulid, SharedBusinessState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: appointment id → business id
    pub(super) appointment_to_business: DashMap<Ulid, Ulid>,
    /// Serializes business creation against WAL compaction.
    pub(super) create_lock: tokio::sync::Mutex<()>,
}

/// Apply an event to a BusinessState (no locking; caller holds the lock).
fn apply_to_business(bs: &mut BusinessState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleSet { schedule, .. } => {
            bs.schedule = *schedule;
        }
        Event::AppointmentBooked {
            id,
            business_id,
            span,
            status,
            label,
        } => {
            bs.insert_appointment(Appointment {
                id: *id,
                span: *span,
                status: *status,
                label: label.clone(),
            });
            index.insert(*id, *business_id);
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(appointment) = bs.appointment_mut(*id) {
                appointment.status = *status;
            }
        }
        Event::AppointmentDeleted { id, .. } => {
            bs.remove_appointment(*id);
            index.remove(id);
        }
        // Business creation/deletion happens at the DashMap level.
        Event::BusinessCreated { .. } | Event::BusinessDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            appointment_to_business: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        };

        // Nobody else holds these Arcs yet, so try_write always succeeds.
        // blocking_write would panic inside the runtime.
        for event in &events {
            match event {
                Event::BusinessCreated { id, name } => {
                    let bs = BusinessState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(bs)));
                }
                Event::BusinessDeleted { id } => {
                    engine.forget_business(id);
                }
                other => {
                    if let Some(business_id) = event_business_id(other)
                        && let Some(entry) = engine.state.get(&business_id)
                    {
                        let bs = entry.clone();
                        let mut guard = bs.try_write().expect("replay: uncontended write");
                        apply_to_business(&mut guard, other, &engine.appointment_to_business);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::BUSINESSES_ACTIVE).set(engine.state.len() as f64);
        tracing::info!(
            "replayed {} events into {} businesses",
            events.len(),
            engine.state.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub fn get_business(&self, id: &Ulid) -> Option<SharedBusinessState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_business_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_business
            .get(appointment_id)
            .map(|e| *e.value())
    }

    /// Drop a business and unindex its appointments.
    pub(super) fn forget_business(&self, id: &Ulid) {
        self.state.remove(id);
        self.appointment_to_business.retain(|_, business_id| business_id != id);
    }

    /// WAL-append, apply, then broadcast the invalidation.
    pub(super) async fn persist_and_apply(
        &self,
        business_id: Ulid,
        bs: &mut BusinessState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        let invalidation = Invalidation::for_event(business_id, bs, event);
        apply_to_business(bs, event, &self.appointment_to_business);
        self.notify.send(invalidation);
        Ok(())
    }

    /// Acquire a business's write lock, failing if it was deleted while we waited.
    pub(super) async fn lock_business(
        &self,
        business_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BusinessState>, EngineError> {
        let bs = self
            .get_business(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = bs.write_owned().await;
        if !self.state.contains_key(&business_id) {
            return Err(EngineError::NotFound(business_id));
        }
        Ok(guard)
    }

    /// Lookup appointment → business, then lock the business.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<BusinessState>), EngineError> {
        let business_id = self
            .get_business_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let guard = self.lock_business(business_id).await?;
        Ok((business_id, guard))
    }
}

/// The business an event belongs to (None for create/delete).
fn event_business_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ScheduleSet { business_id, .. }
        | Event::AppointmentBooked { business_id, .. }
        | Event::AppointmentStatusChanged { business_id, .. }
        | Event::AppointmentDeleted { business_id, .. } => Some(*business_id),
        Event::BusinessCreated { .. } | Event::BusinessDeleted { .. } => None,
    }
}
