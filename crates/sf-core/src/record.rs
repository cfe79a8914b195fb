use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SourcePosition
// ---------------------------------------------------------------------------

/// Where a record was read from: `(partition, offset)` in the upstream log.
///
/// Positions are the record identity used for offset tracking and for
/// deduplicating replayed merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcePosition {
    pub partition: u32,
    pub offset: u64,
}

impl SourcePosition {
    pub fn new(partition: u32, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A keyed, timestamped event as read from the source.
///
/// `event_time` is epoch milliseconds. Stages never mutate a record in place;
/// they return a new one, so a replay of the same position always starts
/// from identical input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub event_time: i64,
    pub payload: serde_json::Value,
    pub position: SourcePosition,
}

impl Record {
    pub fn new(
        key: impl Into<String>,
        event_time: i64,
        payload: serde_json::Value,
        position: SourcePosition,
    ) -> Self {
        Self {
            key: key.into(),
            event_time,
            payload,
            position,
        }
    }

    /// Look up a top-level payload field.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }
}

/// A record travelling through the ingestion queue together with the number
/// of processing attempts it has already consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    pub record: Record,
    pub retry_count: u32,
}

impl QueuedRecord {
    pub fn fresh(record: Record) -> Self {
        Self {
            record,
            retry_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// WindowKey / WindowResult
// ---------------------------------------------------------------------------

/// Identity of one window instance: `(key, window_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub key: String,
    pub start: i64,
}

impl WindowKey {
    pub fn new(key: impl Into<String>, start: i64) -> Self {
        Self {
            key: key.into(),
            start,
        }
    }
}

/// A finalized window aggregate handed to the sink.
///
/// `correction` results carry the aggregate of records that arrived after the
/// window had closed; they go to the late-output sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub key: String,
    pub window_start: i64,
    pub window_end: i64,
    pub value: serde_json::Value,
    pub record_count: u64,
    #[serde(default)]
    pub correction: bool,
}

impl WindowResult {
    pub fn window_key(&self) -> WindowKey {
        WindowKey::new(self.key.clone(), self.window_start)
    }
}
