// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated event model shared by every component.
//!
//! A transaction in the log is identified by its `seqno`. Large transactions
//! are split into fragments that share the seqno and are numbered by `fragno`
//! (0-based); exactly one fragment of each seqno carries `last_frag = true`.
//!
//! ```text
//! seqno 41 ─ frag 0 (last)
//! seqno 42 ─ frag 0 ─ frag 1 ─ frag 2 (last)
//! seqno 43 ─ frag 0 (last)
//! ```
//!
//! The payload is a sum type: real change data, an out-of-band control
//! marker, or an empty (filtered) placeholder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Shard id assigned to events whose shard could not be determined.
/// Such events are always treated as critical.
pub const UNKNOWN_SHARD: &str = "#UNKNOWN";

/// Identifying subset of a replicated event.
///
/// Used wherever only position identity matters (commit positions,
/// control markers, restart computation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub seqno: u64,
    pub fragno: u16,
    pub last_frag: bool,
    pub source_id: String,
    /// Incremented on role changes; a mismatch at the same seqno means the
    /// two logs have diverged.
    pub epoch_number: u64,
    /// Opaque position in the source database (e.g. binlog file:offset).
    pub event_id: String,
    pub shard_id: String,
    pub source_tstamp: DateTime<Utc>,
    pub extract_tstamp: DateTime<Utc>,
}

impl Header {
    /// Build a header for a single-fragment transaction.
    pub fn new(seqno: u64, source_id: impl Into<String>, epoch_number: u64) -> Self {
        let now = Utc::now();
        Self {
            seqno,
            fragno: 0,
            last_frag: true,
            source_id: source_id.into(),
            epoch_number,
            event_id: String::new(),
            shard_id: UNKNOWN_SHARD.to_string(),
            source_tstamp: now,
            extract_tstamp: now,
        }
    }

    /// The seqno a reader should request after this header.
    ///
    /// Mid-transaction the same seqno is requested again so the remaining
    /// fragments arrive; on a transaction boundary the next seqno is due.
    pub fn next_request_seqno(&self) -> u64 {
        if self.last_frag {
            self.seqno + 1
        } else {
            self.seqno
        }
    }

    /// Position ordering: seqno first, then fragno.
    pub fn position_cmp(&self, other: &Header) -> Ordering {
        self.seqno
            .cmp(&other.seqno)
            .then(self.fragno.cmp(&other.fragno))
    }
}

/// Kind of an out-of-band control marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlKind {
    /// Force the consumer to observe and report its position.
    Sync,
    /// Ask the consumer to stop at this position.
    Stop,
    /// Seqnos `marker.seqno..=through_seqno` exist upstream but were not
    /// delivered; the consumer treats the range as applied.
    FilteredRange { through_seqno: u64 },
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Stop => "stop",
            Self::FilteredRange { .. } => "filtered_range",
        }
    }
}

/// A typed out-of-band event. Never carries change data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMarker {
    pub kind: ControlKind,
    /// Target seqno at which the marker takes effect.
    pub seqno: u64,
    /// Position snapshot the consumer reports after observing the marker.
    pub header: Header,
}

impl ControlMarker {
    pub fn new(kind: ControlKind, seqno: u64, header: Header) -> Self {
        Self { kind, seqno, header }
    }

    pub fn sync(header: Header) -> Self {
        Self::new(ControlKind::Sync, header.seqno, header)
    }

    pub fn stop(header: Header) -> Self {
        Self::new(ControlKind::Stop, header.seqno, header)
    }
}

/// Opaque unit of change data carried by a transaction fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeData {
    /// A statement to execute, optionally scoped to a schema.
    Statement {
        schema: Option<String>,
        query: String,
    },
    /// Encoded row changes for one table.
    Rows {
        schema: String,
        table: String,
        data: Vec<u8>,
    },
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payload", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Change(Vec<ChangeData>),
    Control(ControlMarker),
    /// Placeholder for a transaction whose content was filtered upstream.
    Empty,
}

/// One fragment of a replicated transaction, or a control marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedEvent {
    pub header: Header,
    pub payload: Payload,
}

impl ReplicatedEvent {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// Wrap a control marker as a queue event. The event header is the
    /// marker's snapshot moved to the marker's target seqno.
    pub fn from_marker(marker: ControlMarker) -> Self {
        let mut header = marker.header.clone();
        header.seqno = marker.seqno;
        header.fragno = 0;
        header.last_frag = true;
        Self {
            header,
            payload: Payload::Control(marker),
        }
    }

    pub fn seqno(&self) -> u64 {
        self.header.seqno
    }

    pub fn fragno(&self) -> u16 {
        self.header.fragno
    }

    pub fn last_frag(&self) -> bool {
        self.header.last_frag
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.payload, Payload::Empty)
    }

    pub fn control(&self) -> Option<&ControlMarker> {
        match &self.payload {
            Payload::Control(marker) => Some(marker),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        self.control().is_some()
    }
}

/// Minimum header by position.
pub fn min_header<'a>(headers: impl IntoIterator<Item = &'a Header>) -> Option<&'a Header> {
    headers.into_iter().min_by(|a, b| a.position_cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(seqno: u64, fragno: u16, last_frag: bool) -> Header {
        Header {
            fragno,
            last_frag,
            ..Header::new(seqno, "src", 1)
        }
    }

    #[test]
    fn test_next_request_seqno_at_boundary() {
        assert_eq!(fragment(10, 0, true).next_request_seqno(), 11);
    }

    #[test]
    fn test_next_request_seqno_mid_transaction() {
        assert_eq!(fragment(10, 1, false).next_request_seqno(), 10);
    }

    #[test]
    fn test_position_cmp_orders_by_seqno_then_fragno() {
        let a = fragment(5, 2, false);
        let b = fragment(5, 3, true);
        let c = fragment(6, 0, true);
        assert_eq!(a.position_cmp(&b), Ordering::Less);
        assert_eq!(b.position_cmp(&c), Ordering::Less);
        assert_eq!(c.position_cmp(&a), Ordering::Greater);
        assert_eq!(a.position_cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_from_marker_moves_header_to_target() {
        let snapshot = fragment(90, 0, true);
        let marker = ControlMarker::new(ControlKind::Sync, 100, snapshot);
        let event = ReplicatedEvent::from_marker(marker.clone());

        assert_eq!(event.seqno(), 100);
        assert!(event.last_frag());
        assert!(event.is_control());
        assert_eq!(event.control(), Some(&marker));
    }

    #[test]
    fn test_empty_payload() {
        let event = ReplicatedEvent::new(Header::new(1, "src", 0), Payload::Empty);
        assert!(event.is_empty());
        assert!(!event.is_control());
    }

    #[test]
    fn test_min_header() {
        let headers = [fragment(100, 0, true), fragment(80, 0, true), fragment(95, 0, true)];
        assert_eq!(min_header(headers.iter()).map(|h| h.seqno), Some(80));
        assert!(min_header(std::iter::empty::<&Header>()).is_none());
    }

    #[test]
    fn test_event_json_roundtrip() {
        let event = ReplicatedEvent::new(
            fragment(7, 1, false),
            Payload::Change(vec![ChangeData::Statement {
                schema: Some("shop".to_string()),
                query: "DELETE FROM carts".to_string(),
            }]),
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: ReplicatedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
