use chrono::{NaiveDate, NaiveDateTime};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::schedule::WeeklySchedule;

use super::availability::{compute_available_slots, AvailabilityRequest};
use super::{Engine, EngineError};

impl Engine {
    /// Bookable `HH:MM` start times for a service of `duration_minutes` on `date`.
    ///
    /// Unknown or unconfigured businesses and closed days give an empty list.
    pub async fn compute_available_slots(
        &self,
        business_id: Ulid,
        date: NaiveDate,
        duration_minutes: i64,
    ) -> Result<Vec<String>, EngineError> {
        let request = AvailabilityRequest::new(business_id, date, duration_minutes);
        let slots = compute_available_slots(self, &request).await?;
        metrics::counter!(crate::observability::SLOT_QUERIES_TOTAL).increment(1);
        debug!(
            "{} slots for business {business_id} on {date} ({duration_minutes}min)",
            slots.len()
        );
        Ok(slots)
    }

    pub async fn get_schedule(&self, business_id: Ulid) -> Result<Option<WeeklySchedule>, EngineError> {
        let bs = self
            .get_business(&business_id)
            .ok_or(EngineError::NotFound(business_id))?;
        let guard = bs.read().await;
        Ok(guard.schedule)
    }

    /// `open_now` is evaluated at `now` in business-local wall-clock time.
    pub async fn list_businesses(&self, now: NaiveDateTime) -> Vec<BusinessInfo> {
        let businesses: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(businesses.len());
        for bs in businesses {
            let guard = bs.read().await;
            infos.push(BusinessInfo {
                id: guard.id,
                name: guard.name.clone(),
                configured: guard.schedule.is_some(),
                open_now: guard.schedule.is_some_and(|s| s.is_open_at(now)),
            });
        }
        infos.sort_by_key(|b| b.id);
        infos
    }

    /// Appointments sorted by start, optionally only those touching `date`.
    /// Vacated appointments are included; callers filter by status.
    pub async fn get_appointments(
        &self,
        business_id: Ulid,
        date: Option<NaiveDate>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        let bs = match self.get_business(&business_id) {
            Some(bs) => bs,
            None => return Ok(vec![]),
        };
        let guard = bs.read().await;
        let selected: Vec<&Appointment> = match date {
            Some(d) => guard.overlapping(&day_span(d)).collect(),
            None => guard.appointments.iter().collect(),
        };
        selected
            .into_iter()
            .map(|a| {
                let start = from_local_ms(a.span.start);
                let end = from_local_ms(a.span.end);
                match (start, end) {
                    (Some(start), Some(end)) => Ok(AppointmentInfo {
                        id: a.id,
                        business_id,
                        start,
                        end,
                        status: a.status,
                        label: a.label.clone(),
                    }),
                    _ => Err(EngineError::InvalidInput(format!(
                        "appointment {} has an out-of-range time",
                        a.id
                    ))),
                }
            })
            .collect()
    }
}
