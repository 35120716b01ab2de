use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only stored time type.
pub type Ms = i64;

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

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

pub(crate) fn ms_to_utc(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A point in time as supplied by a caller.
///
/// Only `Absolute` values can be placed on the timeline; a `Floating` reading
/// means different instants in different zones and is rejected by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Absolute(DateTime<FixedOffset>),
    Floating(NaiveDateTime),
}

impl Timestamp {
    pub fn from_unix_ms(ms: Ms) -> Option<Self> {
        DateTime::from_timestamp_millis(ms).map(|dt| Timestamp::Absolute(dt.fixed_offset()))
    }

    /// Unix milliseconds, or `None` for a floating reading.
    pub fn unix_ms(&self) -> Option<Ms> {
        match self {
            Timestamp::Absolute(dt) => Some(dt.timestamp_millis()),
            Timestamp::Floating(_) => None,
        }
    }
}

/// Offset-carrying forms tried after RFC 3339. `%#z` takes `Z`, `+hh`, `+hhmm` and `+hh:mm`.
const ABSOLUTE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%#z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M%#z",
    "%Y-%m-%d %H:%M%#z",
];

const FLOATING_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    /// Accepts ISO 8601 date-times with seconds or minute precision, a `T` or
    /// space separator, and an optional offset. Without an offset the result
    /// is `Floating`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut last_err = match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => return Ok(Timestamp::Absolute(dt)),
            Err(e) => e,
        };
        for fmt in ABSOLUTE_FORMATS {
            match DateTime::parse_from_str(s, fmt) {
                Ok(dt) => return Ok(Timestamp::Absolute(dt)),
                Err(e) => last_err = e,
            }
        }
        for fmt in FLOATING_FORMATS {
            match NaiveDateTime::parse_from_str(s, fmt) {
                Ok(dt) => return Ok(Timestamp::Floating(dt)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Absolute(dt) => write!(f, "{}", dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Timestamp::Floating(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

/// A committed booking of one resource for one half-open interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: String,
    pub span: Span,
}

impl Reservation {
    pub fn start(&self) -> DateTime<Utc> {
        ms_to_utc(self.span.start)
    }

    pub fn end(&self) -> DateTime<Utc> {
        ms_to_utc(self.span.end)
    }
}

/// A stored interval on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: String,
    /// Committed reservations, sorted by `span.start`, pairwise non-overlapping.
    pub intervals: Vec<Interval>,
}

impl ResourceState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            intervals: Vec::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        if let Some(pos) = self.intervals.iter().position(|i| i.id == id) {
            Some(self.intervals.remove(pos))
        } else {
            None
        }
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.intervals.iter().any(|i| i.id == id)
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.intervals
            .iter()
            .map(|i| Reservation {
                id: i.id,
                resource_id: self.id.clone(),
                span: i.span,
            })
            .collect()
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCommitted {
        id: Ulid,
        resource_id: String,
        span: Span,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: String,
    },
}

impl Event {
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ReservationCommitted { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. } => resource_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn state_with(spans: &[(Ms, Ms)]) -> ResourceState {
        let mut rs = ResourceState::new("room".into());
        for &(s, e) in spans {
            rs.insert_interval(Interval {
                id: Ulid::new(),
                span: Span::new(s, e),
            });
        }
        rs
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contained_overlaps() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn interval_ordering() {
        let rs = state_with(&[(300, 400), (100, 200), (200, 300)]);
        assert_eq!(rs.intervals[0].span.start, 100);
        assert_eq!(rs.intervals[1].span.start, 200);
        assert_eq!(rs.intervals[2].span.start, 300);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut rs = state_with(&[(0, 50), (100, 150), (200, 250)]);
        let ids: Vec<Ulid> = rs.intervals.iter().map(|i| i.id).collect();
        assert!(rs.remove_interval(ids[1]).is_some());
        assert_eq!(rs.intervals.len(), 2);
        assert_eq!(rs.intervals[0].id, ids[0]);
        assert_eq!(rs.intervals[1].id, ids[2]);
        assert!(!rs.contains(ids[1]));
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = state_with(&[(100, 200)]);
        assert!(rs.remove_interval(Ulid::new()).is_none());
        assert_eq!(rs.intervals.len(), 1);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let rs = state_with(&[(100, 200), (450, 600), (1000, 1100)]);
        let hits: Vec<_> = rs.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let rs = state_with(&[(100, 200), (300, 400)]);
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 0);
    }

    #[test]
    fn overlapping_large_interval_spanning_query() {
        let rs = state_with(&[(0, 10_000)]);
        assert_eq!(rs.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let rs = state_with(&[(100, 201)]);
        assert_eq!(rs.overlapping(&Span::new(200, 300)).count(), 1);
    }

    #[test]
    fn reservations_carry_resource_id() {
        let rs = state_with(&[(200, 300), (100, 200)]);
        let list = rs.reservations();
        assert_eq!(list.len(), 2);
        assert!(list.iter().all(|r| r.resource_id == "room"));
        assert_eq!(list[0].span.start, 100);
    }

    #[test]
    fn parse_rfc3339_with_zone() {
        let ts: Timestamp = "2026-01-20T10:00:00Z".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 20, 10, 0, 0).unwrap();
        assert_eq!(ts.unix_ms(), Some(expected.timestamp_millis()));
    }

    #[test]
    fn parse_rfc3339_with_offset() {
        let ts: Timestamp = "2026-01-20T12:00:00+02:00".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 20, 10, 0, 0).unwrap();
        assert_eq!(ts.unix_ms(), Some(expected.timestamp_millis()));
    }

    #[test]
    fn parse_postgres_text_output() {
        let ts: Timestamp = "2026-01-20 10:00:00+00".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 20, 10, 0, 0).unwrap();
        assert_eq!(ts.unix_ms(), Some(expected.timestamp_millis()));
    }

    #[test]
    fn parse_without_offset_is_floating() {
        let ts: Timestamp = "2026-01-20T10:00:00".parse().unwrap();
        assert!(matches!(ts, Timestamp::Floating(_)));
        assert_eq!(ts.unix_ms(), None);

        let ts: Timestamp = "2026-01-20 10:00:00".parse().unwrap();
        assert!(matches!(ts, Timestamp::Floating(_)));
    }

    #[test]
    fn parse_minute_precision() {
        let ts: Timestamp = "2026-01-20T10:00Z".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 1, 20, 10, 0, 0).unwrap();
        assert_eq!(ts.unix_ms(), Some(expected.timestamp_millis()));

        let ts: Timestamp = "2026-01-20T12:00+02:00".parse().unwrap();
        assert_eq!(ts.unix_ms(), Some(expected.timestamp_millis()));
    }

    #[test]
    fn parse_compact_offsets() {
        let expected = Utc
            .with_ymd_and_hms(2026, 1, 20, 10, 0, 0)
            .unwrap()
            .timestamp_millis();
        for s in [
            "2026-01-20T10:00:00+0000",
            "2026-01-20T10:00:00+00",
            "2026-01-20T11:30:00+0130",
            "2026-01-20 10:00+00",
        ] {
            let ts: Timestamp = s.parse().unwrap_or_else(|e| panic!("{s}: {e}"));
            assert_eq!(ts.unix_ms(), Some(expected), "{s}");
        }
    }

    #[test]
    fn parse_minute_precision_without_offset_is_floating() {
        for s in ["2026-01-20T10:00", "2026-01-20 10:00"] {
            let ts: Timestamp = s.parse().unwrap();
            assert!(matches!(ts, Timestamp::Floating(_)), "{s}");
        }
    }

    #[test]
    fn parse_garbage_fails() {
        assert!("next tuesday".parse::<Timestamp>().is_err());
        assert!("".parse::<Timestamp>().is_err());
    }

    #[test]
    fn unix_ms_is_absolute() {
        let ts = Timestamp::from_unix_ms(1_000).unwrap();
        assert_eq!(ts.unix_ms(), Some(1_000));
    }

    #[test]
    fn reservation_instants() {
        let start = Utc.with_ymd_and_hms(2026, 1, 20, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 20, 11, 0, 0).unwrap();
        let r = Reservation {
            id: Ulid::new(),
            resource_id: "RoomA".into(),
            span: Span::new(start.timestamp_millis(), end.timestamp_millis()),
        };
        assert_eq!(r.start(), start);
        assert_eq!(r.end(), end);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCommitted {
            id: Ulid::new(),
            resource_id: "RoomA".into(),
            span: Span::new(100, 200),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.resource_id(), "RoomA");
    }
}
