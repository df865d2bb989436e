use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    /// A read or write against the backing store failed. Never retried here.
    StorageUnavailable(String),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Conflict(Ulid),
    SlotUnavailable(String),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    LimitExceeded(&'static str),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::StorageUnavailable(e) => write!(f, "storage unavailable: {e}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with appointment: {id}"),
            EngineError::SlotUnavailable(slot) => write!(f, "slot not available: {slot}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot change appointment status from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
