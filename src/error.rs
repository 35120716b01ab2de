use thiserror::Error;
use ulid::Ulid;

use crate::model::Timestamp;

/// Business-rule outcomes. Deterministic for a given input; retrying the
/// same request reproduces the same error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("{field} must carry an explicit UTC offset, got {value}")]
    AmbiguousTime {
        field: &'static str,
        value: Timestamp,
    },
    #[error("start {start} must be before end {end}")]
    InvalidRange { start: Timestamp, end: Timestamp },
    #[error("reservations cannot start in the past: {start}")]
    PastReservation { start: Timestamp },
    #[error("reservation on {resource_id} overlaps existing reservation {existing}")]
    Conflict { resource_id: String, existing: Ulid },
    #[error("reservation not found: {0}")]
    NotFound(String),
}

/// Technical failure of the durable store. Never a domain outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
}

/// Result of a failed commit: either the interval is taken or the store broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("conflict with reservation {0}")]
    Conflict(Ulid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything a booking operation can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookingError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BookingError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            BookingError::Domain(e) => Some(e),
            BookingError::Store(_) => None,
        }
    }
}

impl DomainError {
    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            DomainError::AmbiguousTime { .. } => "ambiguous_time",
            DomainError::InvalidRange { .. } => "invalid_range",
            DomainError::PastReservation { .. } => "past_reservation",
            DomainError::Conflict { .. } => "conflict",
            DomainError::NotFound(_) => "not_found",
        }
    }
}
