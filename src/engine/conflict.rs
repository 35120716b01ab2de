use ulid::Ulid;

use crate::model::*;

/// Fails with the id of the first stored reservation overlapping `span`.
/// Caller holds the resource's write lock for the whole check-and-insert.
pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), Ulid> {
    match rs.overlapping(span).next() {
        Some(existing) => Err(existing.id),
        None => Ok(()),
    }
}
