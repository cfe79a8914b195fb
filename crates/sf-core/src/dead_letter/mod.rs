mod handler;
mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{Record, SourcePosition, WindowResult};

pub use handler::{DeadLetterHandler, DeadLetterStats, Disposition};
pub use store::{DeadLetterStore, FileDeadLetterStore, MemoryDeadLetterStore};

/// Why something ended up in the dead-letter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Retryable,
    Permanent,
    /// Targeted a window that had already closed.
    Late,
    /// Evicted or rejected by the ingestion queue.
    Dropped,
    /// A finalized batch the sink could not write.
    SinkExhausted,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        Self::Retryable,
        Self::Permanent,
        Self::Late,
        Self::Dropped,
        Self::SinkExhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Permanent => "permanent",
            Self::Late => "late",
            Self::Dropped => "dropped",
            Self::SinkExhausted => "sink_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was dead-lettered: a source record or a batch of window results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeadLetterSubject {
    Record(Record),
    Batch(Vec<WindowResult>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original: DeadLetterSubject,
    pub error_kind: ErrorKind,
    pub message: String,
    pub retry_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn record(
        record: Record,
        error_kind: ErrorKind,
        message: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            original: DeadLetterSubject::Record(record),
            error_kind,
            message: message.into(),
            retry_count,
            last_attempt_at: Utc::now(),
        }
    }

    pub fn batch(batch: Vec<WindowResult>, message: impl Into<String>, retry_count: u32) -> Self {
        Self {
            original: DeadLetterSubject::Batch(batch),
            error_kind: ErrorKind::SinkExhausted,
            message: message.into(),
            retry_count,
            last_attempt_at: Utc::now(),
        }
    }

    /// Source position of a dead-lettered record.
    pub fn position(&self) -> Option<SourcePosition> {
        match &self.original {
            DeadLetterSubject::Record(r) => Some(r.position),
            DeadLetterSubject::Batch(_) => None,
        }
    }
}
