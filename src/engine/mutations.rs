use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::{oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Invalidation;
use crate::schedule::WeeklySchedule;

use super::availability::validate_duration;
use super::conflict::{check_no_conflict, check_offered_slot, validate_label, validate_span};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_business(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_BUSINESSES {
            return Err(EngineError::LimitExceeded("too many businesses"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("business name too long"));
        }
        let _create = self.create_lock.lock().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BusinessCreated { id, name: name.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(BusinessState::new(id, name))));
        metrics::gauge!(crate::observability::BUSINESSES_ACTIVE).set(self.state.len() as f64);
        debug!("business {id} created");
        Ok(())
    }

    pub async fn delete_business(&self, id: Ulid) -> Result<(), EngineError> {
        // Hold the write lock so no booking lands while the business goes away.
        let _guard = self.lock_business(id).await?;

        let event = Event::BusinessDeleted { id };
        self.wal_append(&event).await?;
        self.forget_business(&id);
        self.notify.send(Invalidation {
            business_id: id,
            dates: Vec::new(),
        });
        self.notify.remove(&id);
        metrics::gauge!(crate::observability::BUSINESSES_ACTIVE).set(self.state.len() as f64);
        debug!("business {id} deleted");
        Ok(())
    }

    /// Replace the opening hours. `None` leaves the business unconfigured.
    pub async fn set_schedule(
        &self,
        business_id: Ulid,
        schedule: Option<WeeklySchedule>,
    ) -> Result<(), EngineError> {
        let mut guard = self.lock_business(business_id).await?;
        let event = Event::ScheduleSet { business_id, schedule };
        self.persist_and_apply(business_id, &mut guard, &event).await
    }

    /// Staff-side scheduling. Not restricted to opening hours, but never
    /// overlaps another active appointment.
    pub async fn book_appointment(
        &self,
        id: Ulid,
        business_id: Ulid,
        start: NaiveDateTime,
        duration_minutes: i64,
        status: AppointmentStatus,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        validate_duration(duration_minutes)?;
        if duration_minutes > MAX_APPOINTMENT_MINUTES {
            return Err(EngineError::LimitExceeded("appointment too long"));
        }
        let start_ms = local_ms(start);
        let span = Span::new(start_ms, start_ms + duration_minutes * MINUTE_MS);
        validate_span(&span)?;
        validate_label(label.as_deref())?;

        let mut guard = self.lock_business(business_id).await?;
        if self.appointment_to_business.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many appointments on business"));
        }
        if !status.is_vacated()
            && let Err(e) = check_no_conflict(&guard, &span)
        {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let event = Event::AppointmentBooked {
            id,
            business_id,
            span,
            status,
            label,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await?;
        debug!("appointment {id} booked for business {business_id} at {start}");
        Ok(())
    }

    /// Public self-service booking. The requested time must be one of the
    /// slots the availability engine offers right now; the check and the
    /// insert happen under the same write lock.
    pub async fn book_public(
        &self,
        id: Ulid,
        business_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
        duration_minutes: i64,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        validate_label(label.as_deref())?;

        let mut guard = self.lock_business(business_id).await?;
        if self.appointment_to_business.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_BUSINESS {
            return Err(EngineError::LimitExceeded("too many appointments on business"));
        }
        let span = match check_offered_slot(&guard, date, time, duration_minutes) {
            Ok(span) => span,
            Err(e) => {
                if matches!(e, EngineError::SlotUnavailable(_)) {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                return Err(e);
            }
        };

        let event = Event::AppointmentBooked {
            id,
            business_id,
            span,
            status: AppointmentStatus::Pending,
            label,
        };
        self.persist_and_apply(business_id, &mut guard, &event).await?;
        debug!("public booking {id} for business {business_id} on {date} {time}");
        Ok(())
    }

    pub async fn update_status(&self, id: Ulid, status: AppointmentStatus) -> Result<Ulid, EngineError> {
        let (business_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let current = guard
            .appointments
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.status)
            .ok_or(EngineError::NotFound(id))?;
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current,
                to: status,
            });
        }

        let event = Event::AppointmentStatusChanged { id, business_id, status };
        self.persist_and_apply(business_id, &mut guard, &event).await?;
        debug!("appointment {id}: {current} -> {status}");
        Ok(business_id)
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (business_id, mut guard) = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentDeleted { id, business_id };
        self.persist_and_apply(business_id, &mut guard, &event).await?;
        Ok(business_id)
    }

    /// Rewrite the WAL with the minimal event set that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Business write locks are taken before every append, so holding all
        // read locks (plus the create lock) keeps the snapshot and the WAL in step.
        let _create = self.create_lock.lock().await;
        let businesses: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(businesses.len());
        for bs in businesses {
            guards.push(bs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            // Deleted after we listed it but before we locked it.
            if !self.state.contains_key(&guard.id) {
                continue;
            }
            events.push(Event::BusinessCreated {
                id: guard.id,
                name: guard.name.clone(),
            });
            if guard.schedule.is_some() {
                events.push(Event::ScheduleSet {
                    business_id: guard.id,
                    schedule: guard.schedule,
                });
            }
            events.extend(guard.appointments.iter().map(|a| Event::AppointmentBooked {
                id: a.id,
                business_id: guard.id,
                span: a.span,
                status: a.status,
                label: a.label.clone(),
            }));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
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
