use ulid::Ulid;

use crate::model::Day;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Bad input; `field` names the offending field. Not retryable as-is.
    Validation { field: &'static str, reason: String },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Requested window overlaps a blocking reservation. `until` is the
    /// blocking window's dropoff day so callers can propose alternatives.
    Conflict { reservation_id: Ulid, until: Day },
    /// Caller's tenant scope does not own the reservation's resource.
    Authorization { tenant_id: Ulid },
    LimitExceeded(&'static str),
    /// Transaction exceeded its deadline; nothing was written. Retryable.
    Timeout,
    Wal(String),
}

impl EngineError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict { reservation_id, until } => {
                write!(f, "dates clash with reservation {reservation_id} (booked until {until})")
            }
            EngineError::Authorization { tenant_id } => {
                write!(f, "reservation belongs to another tenant (owner {tenant_id})")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Timeout => write!(f, "transaction timed out; retry"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
