//! Watch predicates: "tell me when the stream reaches X".

use crate::event::Header;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition over the header of a completed transaction. Once it holds, a
/// SYNC marker is emitted and the predicate is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WatchPredicate {
    /// Transaction seqno reached or passed.
    Seqno(u64),
    /// Source commit time reached or passed.
    SourceTimestamp(DateTime<Utc>),
    /// Source event id reached or passed. Event ids compare as strings, so
    /// the source must use fixed-width positions.
    EventId(String),
}

impl WatchPredicate {
    /// Whether `header` satisfies the predicate. Only transaction boundaries
    /// (last fragments) can match.
    pub fn matches(&self, header: &Header) -> bool {
        if !header.last_frag {
            return false;
        }
        match self {
            Self::Seqno(seqno) => header.seqno >= *seqno,
            Self::SourceTimestamp(at) => header.source_tstamp >= *at,
            Self::EventId(event_id) => !header.event_id.is_empty() && header.event_id.as_str() >= event_id.as_str(),
        }
    }
}

impl fmt::Display for WatchPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seqno(seqno) => write!(f, "seqno>={}", seqno),
            Self::SourceTimestamp(at) => write!(f, "source_tstamp>={}", at.to_rfc3339()),
            Self::EventId(event_id) => write!(f, "event_id>={}", event_id),
        }
    }
}
