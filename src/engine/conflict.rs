use chrono::{NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::availability::{available_slots, validate_duration};
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidInput("appointment must end after it starts".into()));
    }
    if span.duration_ms() > MAX_APPOINTMENT_MINUTES * MINUTE_MS {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    Ok(())
}

pub(crate) fn validate_label(label: Option<&str>) -> Result<(), EngineError> {
    if label.is_some_and(|l| l.len() > MAX_LABEL_LEN) {
        return Err(EngineError::LimitExceeded("label too long"));
    }
    Ok(())
}

/// Write-time overlap check. The caller holds the business write lock, so
/// nothing can be booked between this check and the insert.
pub(crate) fn check_no_conflict(bs: &BusinessState, span: &Span) -> Result<(), EngineError> {
    match bs.overlapping(span).find(|a| !a.status.is_vacated()) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

/// Public self-service bookings must land on a slot the availability engine
/// would currently offer. Returns the span to book.
pub(crate) fn check_offered_slot(
    bs: &BusinessState,
    date: NaiveDate,
    time: NaiveTime,
    duration_minutes: i64,
) -> Result<Span, EngineError> {
    validate_duration(duration_minutes)?;
    if duration_minutes > MAX_APPOINTMENT_MINUTES {
        return Err(EngineError::LimitExceeded("appointment too long"));
    }
    let bookings = bs.active_bookings(&day_span(date));
    let slots = available_slots(bs.schedule.as_ref(), date, duration_minutes, &bookings)?;
    let requested = date.and_time(time);
    slots
        .iter()
        .find(|slot| slot.start == requested)
        .map(|slot| slot.span())
        .ok_or_else(|| EngineError::SlotUnavailable(format!("{date} {}", time.format("%H:%M"))))
}
