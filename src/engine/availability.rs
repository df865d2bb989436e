use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;
use crate::schedule::{DayWindow, WeeklySchedule};

use super::store::BookingStore;
use super::EngineError;

// ── Slot Algorithm ────────────────────────────────────────────────

/// Candidate start times are generated on this step, anchored at the
/// window's opening time.
pub const SLOT_GRANULARITY_MINUTES: i64 = 30;

/// Used by booking workflows when a service has no explicit duration.
pub const DEFAULT_SERVICE_DURATION_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityRequest {
    pub business_id: Ulid,
    pub date: NaiveDate,
    pub duration_minutes: i64,
}

impl AvailabilityRequest {
    pub fn new(business_id: Ulid, date: NaiveDate, duration_minutes: i64) -> Self {
        Self {
            business_id,
            date,
            duration_minutes,
        }
    }
}

/// One bookable start time, paired with the end implied by the service duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCandidate {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl SlotCandidate {
    pub fn span(&self) -> Span {
        Span::new(local_ms(self.start), local_ms(self.end))
    }

    /// `HH:MM`
    pub fn label(&self) -> String {
        self.start.format("%H:%M").to_string()
    }
}

pub fn validate_duration(duration_minutes: i64) -> Result<(), EngineError> {
    if duration_minutes <= 0 {
        return Err(EngineError::InvalidInput(format!(
            "service duration must be positive, got {duration_minutes} minutes"
        )));
    }
    Ok(())
}

/// Every start from `open` on the 30-minute grid whose end does not pass
/// `close`. An end exactly at `close` is allowed.
pub fn slot_candidates(window: &DayWindow, date: NaiveDate, duration_minutes: i64) -> Vec<SlotCandidate> {
    // Also covers degenerate windows (open >= close) and durations that would
    // overflow the date arithmetic below.
    if duration_minutes <= 0 || duration_minutes > window.length_minutes() {
        return Vec::new();
    }

    let duration = Duration::minutes(duration_minutes);
    let step = Duration::minutes(SLOT_GRANULARITY_MINUTES);
    let close = date.and_time(window.close);

    // Stepping past the last representable date ends the grid.
    let mut candidates = Vec::new();
    let mut next = Some(date.and_time(window.open));
    while let Some(start) = next {
        match start.checked_add_signed(duration) {
            Some(end) if end <= close => candidates.push(SlotCandidate { start, end }),
            _ => break,
        }
        next = start.checked_add_signed(step);
    }
    candidates
}

/// Pure availability computation over already-fetched inputs.
///
/// `schedule == None` (unconfigured business) and a closed weekday both yield
/// an empty list. A candidate survives only if `[start, end)` overlaps no
/// booking; touching intervals do not overlap.
pub fn available_slots(
    schedule: Option<&WeeklySchedule>,
    date: NaiveDate,
    duration_minutes: i64,
    bookings: &[BookingInterval],
) -> Result<Vec<SlotCandidate>, EngineError> {
    validate_duration(duration_minutes)?;
    let Some(window) = schedule.and_then(|s| s.window_for(date)) else {
        return Ok(Vec::new());
    };

    let mut slots = slot_candidates(&window, date, duration_minutes);
    slots.retain(|slot| {
        let span = slot.span();
        !bookings.iter().any(|b| b.span.overlaps(&span))
    });
    Ok(slots)
}

/// Fetch schedule and bookings from `store`, then compute the bookable
/// start times as `HH:MM` strings in ascending order.
pub async fn compute_available_slots<S>(
    store: &S,
    request: &AvailabilityRequest,
) -> Result<Vec<String>, EngineError>
where
    S: BookingStore + ?Sized,
{
    validate_duration(request.duration_minutes)?;

    let Some(schedule) = store.weekly_schedule(request.business_id).await? else {
        return Ok(Vec::new());
    };
    if schedule.window_for(request.date).is_none() {
        return Ok(Vec::new());
    }

    let bookings = store
        .active_bookings_on(request.business_id, request.date)
        .await?;
    let slots = available_slots(Some(&schedule), request.date, request.duration_minutes, &bookings)?;
    Ok(slots.iter().map(SlotCandidate::label).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, Weekday};

    // 2025-03-10 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn monday_hours(open: NaiveTime, close: NaiveTime) -> WeeklySchedule {
        WeeklySchedule::closed().with_day(Weekday::Mon, Some(DayWindow::new(open, close).unwrap()))
    }

    fn booking(start: NaiveTime, end: NaiveTime) -> BookingInterval {
        booking_on(monday(), start, monday(), end)
    }

    fn booking_on(d1: NaiveDate, start: NaiveTime, d2: NaiveDate, end: NaiveTime) -> BookingInterval {
        BookingInterval {
            id: Ulid::new(),
            span: Span::new(local_ms(d1.and_time(start)), local_ms(d2.and_time(end))),
        }
    }

    fn labels(slots: &[SlotCandidate]) -> Vec<String> {
        slots.iter().map(SlotCandidate::label).collect()
    }

    // ── Example scenarios ────────────────────────────────

    #[test]
    fn morning_window_one_hour_service() {
        let s = monday_hours(t(9, 0), t(12, 0));
        let slots = available_slots(Some(&s), monday(), 60, &[]).unwrap();
        assert_eq!(labels(&slots), ["09:00", "09:30", "10:00", "10:30", "11:00"]);
    }

    #[test]
    fn confirmed_booking_blocks_overlapping_starts() {
        let s = monday_hours(t(9, 0), t(12, 0));
        let bookings = [booking(t(10, 0), t(11, 0))];
        let slots = available_slots(Some(&s), monday(), 60, &bookings).unwrap();
        // 09:00 ends exactly when the booking starts; 11:00 starts exactly when it ends.
        assert_eq!(labels(&slots), ["09:00", "11:00"]);
    }

    #[test]
    fn grid_stops_at_last_representable_date() {
        use chrono::Datelike;
        let last = NaiveDate::MAX;
        let window = DayWindow::new(t(23, 0), t(23, 59)).unwrap();
        let s = WeeklySchedule::closed().with_day(last.weekday(), Some(window));
        let slots = available_slots(Some(&s), last, 29, &[]).unwrap();
        assert_eq!(labels(&slots), ["23:00", "23:30"]);
    }

    #[test]
    fn closed_day_is_empty() {
        let s = monday_hours(t(9, 0), t(12, 0));
        let tuesday = monday().succ_opt().unwrap();
        let bookings = [booking(t(9, 0), t(10, 0))];
        for duration in [15, 60, 600] {
            assert!(available_slots(Some(&s), tuesday, duration, &bookings).unwrap().is_empty());
        }
    }

    #[test]
    fn unconfigured_business_is_empty() {
        assert!(available_slots(None, monday(), 60, &[]).unwrap().is_empty());
    }

    #[test]
    fn service_longer_than_window_is_empty() {
        let s = monday_hours(t(9, 0), t(9, 30));
        assert!(available_slots(Some(&s), monday(), 60, &[]).unwrap().is_empty());
        assert!(available_slots(Some(&s), monday(), i64::MAX, &[]).unwrap().is_empty());
    }

    // ── Boundaries and grid ─────────────────────────────

    #[test]
    fn end_exactly_at_close_is_bookable() {
        let s = monday_hours(t(9, 0), t(10, 0));
        let slots = available_slots(Some(&s), monday(), 30, &[]).unwrap();
        assert_eq!(labels(&slots), ["09:00", "09:30"]);
        let slots = available_slots(Some(&s), monday(), 60, &[]).unwrap();
        assert_eq!(labels(&slots), ["09:00"]);
    }

    #[test]
    fn grid_is_anchored_to_opening_time() {
        let s = monday_hours(t(8, 5), t(10, 0));
        let slots = available_slots(Some(&s), monday(), 45, &[]).unwrap();
        assert_eq!(labels(&slots), ["08:05", "08:35", "09:05"]);
    }

    #[test]
    fn grid_does_not_depend_on_duration() {
        let s = monday_hours(t(9, 0), t(12, 0));
        let short = available_slots(Some(&s), monday(), 20, &[]).unwrap();
        let long = available_slots(Some(&s), monday(), 90, &[]).unwrap();
        assert_eq!(labels(&short), ["09:00", "09:30", "10:00", "10:30", "11:00", "11:30"]);
        assert_eq!(labels(&long), ["09:00", "09:30", "10:00", "10:30"]);
        for pair in short.windows(2) {
            assert_eq!((pair[1].start - pair[0].start).num_minutes(), SLOT_GRANULARITY_MINUTES);
        }
    }

    #[test]
    fn non_positive_duration_is_rejected() {
        let s = monday_hours(t(9, 0), t(12, 0));
        for duration in [0, -30] {
            let err = available_slots(Some(&s), monday(), duration, &[]).unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)), "{duration}: {err}");
        }
        // Rejected even when there is nothing to compute.
        assert!(matches!(available_slots(None, monday(), 0, &[]), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn degenerate_window_yields_no_candidates() {
        let window = DayWindow { open: t(9, 0), close: t(9, 0) };
        assert!(slot_candidates(&window, monday(), 1).is_empty());
        let inverted = DayWindow { open: t(12, 0), close: t(9, 0) };
        assert!(slot_candidates(&inverted, monday(), 30).is_empty());
    }

    #[test]
    fn booking_from_previous_evening_blocks_morning() {
        let s = monday_hours(t(0, 0), t(3, 0));
        let sunday = monday().pred_opt().unwrap();
        let bookings = [booking_on(sunday, t(23, 0), monday(), t(1, 0))];
        let slots = available_slots(Some(&s), monday(), 60, &bookings).unwrap();
        assert_eq!(labels(&slots), ["01:00", "01:30", "02:00"]);
    }

    #[test]
    fn short_booking_inside_slot_blocks_it() {
        let s = monday_hours(t(9, 0), t(11, 0));
        let bookings = [booking(t(9, 40), t(9, 50))];
        let slots = available_slots(Some(&s), monday(), 60, &bookings).unwrap();
        assert_eq!(labels(&slots), ["10:00"]);
    }

    #[test]
    fn returned_slots_respect_close_and_bookings() {
        let s = monday_hours(t(8, 0), t(18, 0));
        let bookings = [
            booking(t(8, 30), t(9, 15)),
            booking(t(12, 0), t(13, 0)),
            booking(t(16, 45), t(17, 0)),
        ];
        for duration in [15, 30, 45, 60, 90, 120] {
            let slots = available_slots(Some(&s), monday(), duration, &bookings).unwrap();
            let close = monday().and_time(t(18, 0));
            for slot in &slots {
                assert!(slot.end <= close);
                assert_eq!((slot.end - slot.start).num_minutes(), duration);
                assert!(bookings.iter().all(|b| !b.span.overlaps(&slot.span())));
            }
            for pair in slots.windows(2) {
                assert!(pair[0].start < pair[1].start);
            }
        }
    }
}
