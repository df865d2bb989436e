use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::schedule::WeeklySchedule;

/// Milliseconds on the business-local timeline. Wall-clock times are read as
/// if they were UTC; no zone conversion ever happens.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

pub fn local_ms(at: NaiveDateTime) -> Ms {
    at.and_utc().timestamp_millis()
}

pub fn from_local_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// `[date 00:00, date+1 00:00)` on the local timeline.
pub fn day_span(date: NaiveDate) -> Span {
    let start = local_ms(date.and_time(chrono::NaiveTime::MIN));
    Span::new(start, start + DAY_MS)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    /// Vacated appointments no longer occupy calendar time.
    pub fn is_vacated(self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }

    /// The moves the dashboard offers on an appointment card. Enforced here
    /// on every status change, not only in the UI.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, InProgress)
                | (Confirmed, Cancelled)
                | (Confirmed, NoShow)
                | (InProgress, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::InProgress => "IN_PROGRESS",
            AppointmentStatus::Completed => "COMPLETED",
            AppointmentStatus::Cancelled => "CANCELLED",
            AppointmentStatus::NoShow => "NO_SHOW",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(AppointmentStatus::Pending),
            "CONFIRMED" => Ok(AppointmentStatus::Confirmed),
            "IN_PROGRESS" => Ok(AppointmentStatus::InProgress),
            "COMPLETED" => Ok(AppointmentStatus::Completed),
            "CANCELLED" => Ok(AppointmentStatus::Cancelled),
            "NO_SHOW" => Ok(AppointmentStatus::NoShow),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub label: Option<String>,
}

/// Read-only projection of an active appointment used for conflict checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingInterval {
    pub id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct BusinessState {
    pub id: Ulid,
    pub name: Option<String>,
    pub schedule: Option<WeeklySchedule>,
    /// Sorted by `span.start`.
    pub appointments: Vec<Appointment>,
}

impl BusinessState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            schedule: None,
            appointments: Vec::new(),
        }
    }

    /// Insert appointment maintaining sort order by span.start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn appointment_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span overlaps `query`, vacated ones included.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Non-vacated appointments overlapping `query`.
    pub fn active_bookings(&self, query: &Span) -> Vec<BookingInterval> {
        self.overlapping(query)
            .filter(|a| !a.status.is_vacated())
            .map(|a| BookingInterval { id: a.id, span: a.span })
            .collect()
    }
}

/// WAL record format. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BusinessCreated {
        id: Ulid,
        name: Option<String>,
    },
    BusinessDeleted {
        id: Ulid,
    },
    ScheduleSet {
        business_id: Ulid,
        schedule: Option<WeeklySchedule>,
    },
    AppointmentBooked {
        id: Ulid,
        business_id: Ulid,
        span: Span,
        status: AppointmentStatus,
        label: Option<String>,
    },
    AppointmentStatusChanged {
        id: Ulid,
        business_id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentDeleted {
        id: Ulid,
        business_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub configured: bool,
    pub open_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub business_id: Ulid,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub status: AppointmentStatus,
    pub label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn at(h: u32, m: u32) -> Ms {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        local_ms(date.and_time(NaiveTime::from_hms_opt(h, m, 0).unwrap()))
    }

    fn appointment(start: Ms, end: Ms, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            span: Span::new(start, end),
            status,
            label: None,
        }
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(at(9, 0), at(10, 0));
        let b = Span::new(at(9, 30), at(10, 30));
        let c = Span::new(at(10, 0), at(11, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn local_ms_has_no_zone_shift() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let dt = date.and_hms_opt(9, 30, 0).unwrap();
        assert_eq!(from_local_ms(local_ms(dt)), Some(dt));
        assert_eq!(day_span(date).duration_ms(), DAY_MS);
        assert_eq!(day_span(date).start + 9 * 60 * MINUTE_MS + 30 * MINUTE_MS, local_ms(dt));
    }

    #[test]
    fn vacated_statuses() {
        assert!(AppointmentStatus::Cancelled.is_vacated());
        assert!(AppointmentStatus::NoShow.is_vacated());
        assert!(!AppointmentStatus::Pending.is_vacated());
        assert!(!AppointmentStatus::Confirmed.is_vacated());
        assert!(!AppointmentStatus::InProgress.is_vacated());
        assert!(!AppointmentStatus::Completed.is_vacated());
    }

    #[test]
    fn status_transitions() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Cancelled));
        for terminal in [Completed, Cancelled, NoShow] {
            for next in [Pending, Confirmed, InProgress, Completed, Cancelled, NoShow] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("no_show".parse::<AppointmentStatus>(), Ok(AppointmentStatus::NoShow));
        assert_eq!(" CONFIRMED ".parse::<AppointmentStatus>(), Ok(AppointmentStatus::Confirmed));
        assert!("DONE".parse::<AppointmentStatus>().is_err());
        assert_eq!(AppointmentStatus::InProgress.to_string(), "IN_PROGRESS");
    }

    #[test]
    fn appointments_stay_sorted() {
        let mut bs = BusinessState::new(Ulid::new(), None);
        bs.insert_appointment(appointment(at(11, 0), at(12, 0), AppointmentStatus::Confirmed));
        bs.insert_appointment(appointment(at(9, 0), at(10, 0), AppointmentStatus::Pending));
        bs.insert_appointment(appointment(at(10, 0), at(11, 0), AppointmentStatus::Confirmed));
        let starts: Vec<Ms> = bs.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![at(9, 0), at(10, 0), at(11, 0)]);
    }

    #[test]
    fn remove_unknown_appointment_returns_none() {
        let mut bs = BusinessState::new(Ulid::new(), None);
        bs.insert_appointment(appointment(at(9, 0), at(10, 0), AppointmentStatus::Confirmed));
        assert!(bs.remove_appointment(Ulid::new()).is_none());
        assert_eq!(bs.appointments.len(), 1);
    }

    #[test]
    fn active_bookings_skip_vacated_and_adjacent() {
        let mut bs = BusinessState::new(Ulid::new(), None);
        bs.insert_appointment(appointment(at(8, 0), at(9, 0), AppointmentStatus::Confirmed)); // adjacent
        bs.insert_appointment(appointment(at(9, 30), at(10, 0), AppointmentStatus::Cancelled));
        bs.insert_appointment(appointment(at(10, 0), at(11, 0), AppointmentStatus::Pending));
        bs.insert_appointment(appointment(at(13, 0), at(14, 0), AppointmentStatus::Confirmed)); // after

        let hits = bs.active_bookings(&Span::new(at(9, 0), at(12, 0)));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(at(10, 0), at(11, 0)));
    }

    #[test]
    fn overlapping_includes_interval_spanning_query() {
        let mut bs = BusinessState::new(Ulid::new(), None);
        bs.insert_appointment(appointment(at(6, 0), at(20, 0), AppointmentStatus::InProgress));
        assert_eq!(bs.overlapping(&Span::new(at(9, 0), at(9, 30))).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            id: Ulid::new(),
            business_id: Ulid::new(),
            span: Span::new(at(9, 0), at(10, 0)),
            status: AppointmentStatus::Pending,
            label: Some("Rex".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
