use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::schedule::WeeklySchedule;

use super::{Engine, EngineError};

/// The two reads the availability engine needs from storage.
///
/// Implementations report backend failures as
/// [`EngineError::StorageUnavailable`]; the engine passes them through.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// `Ok(None)` for an unknown business or one without opening hours.
    async fn weekly_schedule(&self, business_id: Ulid) -> Result<Option<WeeklySchedule>, EngineError>;

    /// Non-vacated appointments overlapping `[date 00:00, date+1 00:00)`.
    async fn active_bookings_on(
        &self,
        business_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<BookingInterval>, EngineError>;
}

#[async_trait]
impl BookingStore for Engine {
    async fn weekly_schedule(&self, business_id: Ulid) -> Result<Option<WeeklySchedule>, EngineError> {
        let Some(bs) = self.get_business(&business_id) else {
            return Ok(None);
        };
        let guard = bs.read().await;
        Ok(guard.schedule)
    }

    async fn active_bookings_on(
        &self,
        business_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<BookingInterval>, EngineError> {
        let Some(bs) = self.get_business(&business_id) else {
            return Ok(Vec::new());
        };
        let guard = bs.read().await;
        Ok(guard.active_bookings(&day_span(date)))
    }
}
