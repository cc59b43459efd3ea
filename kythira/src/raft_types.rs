use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a raft log: the term in which it was created and its index in the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

/// An identifier of a snapshot.
///
/// Two snapshots built upto the same log id may still differ in bytes, thus a snapshot is
/// identified by an opaque string rather than by its last covered log id.
pub type SnapshotId = String;

/// The identity of a segment of a snapshot: which snapshot it belongs to and where it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSegmentId {
    pub id: SnapshotId,
    pub offset: u64,
}

impl Display for SnapshotSegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.id, self.offset)
    }
}

impl<D: ToString> From<(D, u64)> for SnapshotSegmentId {
    fn from(v: (D, u64)) -> Self {
        SnapshotSegmentId {
            id: v.0.to_string(),
            offset: v.1,
        }
    }
}

/// A summary of a message suitable for logging, without dumping entire payloads.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Whether to update a value or to leave it as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
