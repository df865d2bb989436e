//! Weekly opening hours.
//!
//! The storefront editor submits hours as a JSON document keyed by short
//! weekday names (`{"mon": {"open": "08:00", "close": "18:00"}, "sun": null}`).
//! That document is validated here, once, and turned into a fixed
//! seven-slot array so the availability engine never sees malformed input.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::limits::MAX_SCHEDULE_JSON_LEN;

const DAY_KEYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];
const TIME_FORMAT: &str = "%H:%M";

/// Opening and closing wall-clock times for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl DayWindow {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Result<Self, ScheduleError> {
        if open >= close {
            return Err(ScheduleError::EmptyWindow { open, close });
        }
        Ok(Self { open, close })
    }

    pub fn parse(open: &str, close: &str) -> Result<Self, ScheduleError> {
        Self::new(parse_time(open)?, parse_time(close)?)
    }

    pub fn length_minutes(&self) -> i64 {
        (self.close - self.open).num_minutes()
    }

    /// Inclusive at both ends.
    pub fn contains(&self, t: NaiveTime) -> bool {
        self.open <= t && t <= self.close
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    /// Indexed by `Weekday::num_days_from_monday()`. `None` = closed.
    days: [Option<DayWindow>; 7],
}

impl WeeklySchedule {
    /// A schedule closed every day.
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, day: Weekday, window: Option<DayWindow>) -> Self {
        self.set_day(day, window);
        self
    }

    pub fn set_day(&mut self, day: Weekday, window: Option<DayWindow>) {
        self.days[day.num_days_from_monday() as usize] = window;
    }

    pub fn day(&self, day: Weekday) -> Option<DayWindow> {
        self.days[day.num_days_from_monday() as usize]
    }

    pub fn window_for(&self, date: NaiveDate) -> Option<DayWindow> {
        self.day(date.weekday())
    }

    /// Monday first.
    pub fn iter(&self) -> impl Iterator<Item = (Weekday, Option<DayWindow>)> + '_ {
        self.days
            .iter()
            .enumerate()
            .map(|(i, w)| (weekday_from_index(i), *w))
    }

    pub fn is_open_at(&self, at: NaiveDateTime) -> bool {
        self.window_for(at.date())
            .is_some_and(|w| w.contains(at.time()))
    }

    pub fn from_json(json: &str) -> Result<Self, ScheduleError> {
        if json.len() > MAX_SCHEDULE_JSON_LEN {
            return Err(ScheduleError::TooLarge(json.len()));
        }
        let value: Value =
            serde_json::from_str(json).map_err(|e| ScheduleError::Json(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(ScheduleError::NotAnObject);
        };

        let mut schedule = Self::closed();
        for (key, entry) in &map {
            let day = weekday_from_key(key).ok_or_else(|| ScheduleError::UnknownDay(key.clone()))?;
            schedule.set_day(day, parse_entry(key, entry)?);
        }
        Ok(schedule)
    }

    pub fn to_json(&self) -> String {
        let mut map = Map::new();
        for (day, window) in self.iter() {
            let entry = match window {
                Some(w) => serde_json::json!({
                    "open": w.open.format(TIME_FORMAT).to_string(),
                    "close": w.close.format(TIME_FORMAT).to_string(),
                }),
                None => Value::Null,
            };
            map.insert(day_key(day).to_string(), entry);
        }
        Value::Object(map).to_string()
    }
}

pub fn day_key(day: Weekday) -> &'static str {
    DAY_KEYS[day.num_days_from_monday() as usize]
}

pub fn parse_time(s: &str) -> Result<NaiveTime, ScheduleError> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).map_err(|_| ScheduleError::BadTime(s.to_string()))
}

fn weekday_from_key(key: &str) -> Option<Weekday> {
    DAY_KEYS
        .iter()
        .position(|k| k.eq_ignore_ascii_case(key))
        .map(weekday_from_index)
}

fn weekday_from_index(i: usize) -> Weekday {
    match i {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

fn parse_entry(key: &str, entry: &Value) -> Result<Option<DayWindow>, ScheduleError> {
    match entry {
        Value::Null => Ok(None),
        Value::Object(fields) => {
            let field = |name: &'static str| {
                fields
                    .get(name)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ScheduleError::MissingField { day: key.to_string(), field: name })
            };
            DayWindow::parse(field("open")?, field("close")?).map(Some)
        }
        _ => Err(ScheduleError::BadWindow(key.to_string())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    Json(String),
    NotAnObject,
    TooLarge(usize),
    UnknownDay(String),
    BadWindow(String),
    MissingField { day: String, field: &'static str },
    BadTime(String),
    EmptyWindow { open: NaiveTime, close: NaiveTime },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Json(e) => write!(f, "invalid opening hours JSON: {e}"),
            ScheduleError::NotAnObject => write!(f, "opening hours must be a JSON object"),
            ScheduleError::TooLarge(len) => write!(f, "opening hours document too large ({len} bytes)"),
            ScheduleError::UnknownDay(k) => write!(f, "unknown weekday key: {k}"),
            ScheduleError::BadWindow(k) => write!(f, "{k}: expected null or {{open, close}}"),
            ScheduleError::MissingField { day, field } => write!(f, "{day}: missing {field}"),
            ScheduleError::BadTime(s) => write!(f, "bad time {s:?}, expected HH:MM"),
            ScheduleError::EmptyWindow { open, close } => {
                write!(f, "open {open} must be before close {close}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED_HOURS: &str = r#"{
        "mon": {"open": "08:00", "close": "18:00"},
        "tue": {"open": "08:00", "close": "18:00"},
        "wed": {"open": "08:00", "close": "18:00"},
        "thu": {"open": "08:00", "close": "18:00"},
        "fri": {"open": "08:00", "close": "18:00"},
        "sat": {"open": "09:00", "close": "14:00"},
        "sun": null
    }"#;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parses_storefront_document() {
        let s = WeeklySchedule::from_json(SEED_HOURS).unwrap();
        assert_eq!(s.day(Weekday::Mon), Some(DayWindow::new(t(8, 0), t(18, 0)).unwrap()));
        assert_eq!(s.day(Weekday::Sat), Some(DayWindow::new(t(9, 0), t(14, 0)).unwrap()));
        assert_eq!(s.day(Weekday::Sun), None);
    }

    #[test]
    fn missing_keys_are_closed() {
        let s = WeeklySchedule::from_json(r#"{"wed": {"open": "10:00", "close": "12:00"}}"#).unwrap();
        assert!(s.day(Weekday::Wed).is_some());
        assert_eq!(s.iter().filter(|(_, w)| w.is_some()).count(), 1);
    }

    #[test]
    fn window_for_uses_weekday_of_date() {
        let s = WeeklySchedule::from_json(SEED_HOURS).unwrap();
        // 2025-03-08 is a Saturday, 2025-03-09 a Sunday.
        let sat = NaiveDate::from_ymd_opt(2025, 3, 8).unwrap();
        let sun = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(s.window_for(sat).map(|w| w.close), Some(t(14, 0)));
        assert_eq!(s.window_for(sun), None);
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(matches!(WeeklySchedule::from_json("[1, 2]"), Err(ScheduleError::NotAnObject)));
        assert!(matches!(WeeklySchedule::from_json("{"), Err(ScheduleError::Json(_))));
        assert!(matches!(
            WeeklySchedule::from_json(r#"{"funday": null}"#),
            Err(ScheduleError::UnknownDay(_))
        ));
        assert!(matches!(
            WeeklySchedule::from_json(r#"{"mon": "08:00-18:00"}"#),
            Err(ScheduleError::BadWindow(_))
        ));
        assert!(matches!(
            WeeklySchedule::from_json(r#"{"mon": {"open": "08:00"}}"#),
            Err(ScheduleError::MissingField { field: "close", .. })
        ));
        assert!(matches!(
            WeeklySchedule::from_json(r#"{"mon": {"open": "8h", "close": "18:00"}}"#),
            Err(ScheduleError::BadTime(_))
        ));
        assert!(matches!(
            WeeklySchedule::from_json(r#"{"mon": {"open": "18:00", "close": "08:00"}}"#),
            Err(ScheduleError::EmptyWindow { .. })
        ));
        assert!(matches!(
            WeeklySchedule::from_json(r#"{"mon": {"open": "09:00", "close": "09:00"}}"#),
            Err(ScheduleError::EmptyWindow { .. })
        ));
    }

    #[test]
    fn rejects_oversized_document() {
        let huge = format!(r#"{{"mon": null, "pad": "{}"}}"#, "x".repeat(MAX_SCHEDULE_JSON_LEN));
        assert!(matches!(WeeklySchedule::from_json(&huge), Err(ScheduleError::TooLarge(_))));
    }

    #[test]
    fn json_roundtrip_preserves_schedule() {
        let s = WeeklySchedule::from_json(SEED_HOURS).unwrap();
        let again = WeeklySchedule::from_json(&s.to_json()).unwrap();
        assert_eq!(s, again);
    }

    #[test]
    fn open_at_is_inclusive() {
        let s = WeeklySchedule::from_json(SEED_HOURS).unwrap();
        let mon = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        assert!(s.is_open_at(mon.and_hms_opt(8, 0, 0).unwrap()));
        assert!(s.is_open_at(mon.and_hms_opt(18, 0, 0).unwrap()));
        assert!(!s.is_open_at(mon.and_hms_opt(18, 1, 0).unwrap()));
        assert!(!s.is_open_at(mon.and_hms_opt(7, 59, 0).unwrap()));
        let sun = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert!(!s.is_open_at(sun.and_hms_opt(12, 0, 0).unwrap()));
    }

    #[test]
    fn schedule_survives_bincode() {
        let s = WeeklySchedule::from_json(SEED_HOURS).unwrap();
        let bytes = bincode::serialize(&s).unwrap();
        let decoded: WeeklySchedule = bincode::deserialize(&bytes).unwrap();
        assert_eq!(s, decoded);
    }
}
