//! Structural and temporal checks on a proposed interval. Never touches the store.

use chrono::Utc;

use crate::error::DomainError;
use crate::model::{Ms, Span, Timestamp};

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Check a proposed `[start, end)` for `resource_id` as of `now`.
///
/// Rules run in order and the first violation wins:
/// 1. both ends carry an explicit offset (`start` checked first),
/// 2. `start < end` at millisecond resolution,
/// 3. `start >= now`.
///
/// Returns the resolved span in Unix milliseconds.
pub fn validate(
    resource_id: &str,
    start: &Timestamp,
    end: &Timestamp,
    now: Ms,
) -> Result<Span, DomainError> {
    let start_ms = start.unix_ms().ok_or(DomainError::AmbiguousTime {
        field: "start",
        value: *start,
    })?;
    let end_ms = end.unix_ms().ok_or(DomainError::AmbiguousTime {
        field: "end",
        value: *end,
    })?;

    if start_ms >= end_ms {
        tracing::debug!(resource_id, %start, %end, "rejected: empty or inverted range");
        return Err(DomainError::InvalidRange {
            start: *start,
            end: *end,
        });
    }
    if start_ms < now {
        tracing::debug!(resource_id, %start, now, "rejected: starts in the past");
        return Err(DomainError::PastReservation { start: *start });
    }
    Ok(Span::new(start_ms, end_ms))
}
