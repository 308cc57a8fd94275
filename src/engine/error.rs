use crate::model::{BookingId, BookingStatus, SlotKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    BookingNotFound(BookingId),
    SlotNotFound(SlotKey),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    SlotFull(SlotKey),
    InvalidRange(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Both absent-booking and absent-slot are the `NotFound` kind.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::BookingNotFound(_) | EngineError::SlotNotFound(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::SlotNotFound(key) => write!(f, "time slot not found: {key}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: booking is {from}, cannot become {to}")
            }
            EngineError::SlotFull(key) => {
                write!(f, "time slot {key} is full: all capacity reserved")
            }
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
