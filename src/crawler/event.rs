// SPDX-License-Identifier: Apache-2.0

//! Records that leave the crawler: line events, acknowledgements coming back
//! from the consumer, and failure reports.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::crawler::input::FileId;

/// One line read from a harvested file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub file_id: FileId,
    /// Path of the file when the line was read
    pub path: PathBuf,
    /// Byte position right after this line (terminator included)
    pub offset: u64,
    /// Truncation generation the offset belongs to
    pub generation: u64,
    /// Line content without its terminator
    pub line: String,
    /// Set only for an unterminated trailing line flushed at stop
    pub partial: bool,
    /// The line was longer than `max_line_size` and `line` holds only its
    /// first bytes; `offset` still covers the whole line
    pub truncated: bool,
    pub read_at: DateTime<Utc>,
}

impl Event {
    /// The acknowledgement that confirms delivery of this event
    pub fn ack(&self) -> Acknowledgement {
        Acknowledgement {
            file_id: self.file_id,
            generation: self.generation,
            offset: self.offset,
        }
    }
}

/// Confirmation that events of a file were delivered up to `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub file_id: FileId,
    pub generation: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A Tailer reached its Errored state
    TailerErrored,
    /// Resolving a group's patterns failed
    ScanFailed,
    /// Registry snapshots have been failing for too long
    PersistFailed,
}

/// Runtime failure surfaced on the supervisor's failure channel
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    /// Index of the pattern group, `None` for supervisor-wide failures
    pub group: Option<usize>,
    pub file_id: Option<FileId>,
    pub path: Option<PathBuf>,
    pub kind: FailureKind,
    pub message: String,
}
