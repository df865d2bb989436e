use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{from_local_ms, BusinessState, Event, Span};

const CHANNEL_CAPACITY: usize = 256;

/// Cached availability for these dates of this business is stale.
/// An empty `dates` list means every date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invalidation {
    pub business_id: Ulid,
    pub dates: Vec<NaiveDate>,
}

impl Invalidation {
    /// Build the invalidation for `event`, read against the state *before*
    /// the event is applied (status changes and deletes need the old span).
    pub fn for_event(business_id: Ulid, bs: &BusinessState, event: &Event) -> Self {
        let span = match event {
            Event::AppointmentBooked { span, .. } => Some(*span),
            Event::AppointmentStatusChanged { id, .. } | Event::AppointmentDeleted { id, .. } => bs
                .appointments
                .iter()
                .find(|a| a.id == *id)
                .map(|a| a.span),
            Event::ScheduleSet { .. } | Event::BusinessCreated { .. } | Event::BusinessDeleted { .. } => None,
        };
        Self {
            business_id,
            dates: span.map(dates_touched).unwrap_or_default(),
        }
    }
}

/// Every calendar date `[start, end)` touches.
fn dates_touched(span: Span) -> Vec<NaiveDate> {
    let (Some(start), Some(end)) = (from_local_ms(span.start), from_local_ms(span.end - 1)) else {
        return Vec::new();
    };
    start
        .date()
        .iter_days()
        .take_while(|d| *d <= end.date())
        .collect()
}

/// Per-business broadcast of availability invalidations.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Invalidation>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to invalidations for a business. Creates the channel if needed.
    pub fn subscribe(&self, business_id: Ulid) -> broadcast::Receiver<Invalidation> {
        let sender = self
            .channels
            .entry(business_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, invalidation: Invalidation) {
        if let Some(sender) = self.channels.get(&invalidation.business_id) {
            let _ = sender.send(invalidation);
        }
    }

    pub fn remove(&self, business_id: &Ulid) {
        self.channels.remove(business_id);
    }
}
