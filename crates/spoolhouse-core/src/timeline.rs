//! Timeline View
//!
//! A timeline is a histogram-like view of a buffer (or a single segment):
//! one entry per segment (or per bucket of records) plus a trailing
//! sentinel entry carrying the next message id and the most recent
//! timestamp. It is the shape UIs and telemetry want for rendering "how
//! much data, over what time range" without touching record contents.
//!
//! Entry `i` spans `bytes(i) = message_id(i+1) - message_id(i)` bytes and
//! `millis(i) = timestamp(i+1) - timestamp(i)` milliseconds; both are zero
//! for the sentinel entry.

use serde::{Deserialize, Serialize};

/// Parallel-array view over segments or record buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    ids: Vec<u64>,
    timestamps: Vec<i64>,
    counts: Vec<u32>,
}

impl Timeline {
    /// Build a timeline from parallel arrays. All three must have the same
    /// length; the last entry is the sentinel.
    pub fn from_parts(ids: Vec<u64>, timestamps: Vec<i64>, counts: Vec<u32>) -> Self {
        debug_assert_eq!(ids.len(), timestamps.len());
        debug_assert_eq!(ids.len(), counts.len());
        Self {
            ids,
            timestamps,
            counts,
        }
    }

    /// Number of entries, including the trailing sentinel.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Id of the first message covered by entry `i` (for the sentinel, the
    /// next message id).
    pub fn message_id(&self, i: usize) -> u64 {
        self.ids[i]
    }

    /// Timestamp of the first message covered by entry `i` (for the
    /// sentinel, the most recent timestamp).
    pub fn timestamp(&self, i: usize) -> i64 {
        self.timestamps[i]
    }

    /// Number of messages covered by entry `i`.
    pub fn count(&self, i: usize) -> u32 {
        self.counts[i]
    }

    /// Encoded bytes spanned by entry `i`; zero for the sentinel.
    pub fn bytes(&self, i: usize) -> u64 {
        if i + 1 == self.ids.len() {
            0
        } else {
            self.ids[i + 1] - self.ids[i]
        }
    }

    /// Milliseconds spanned by entry `i`; zero for the sentinel.
    pub fn millis(&self, i: usize) -> i64 {
        if i + 1 == self.timestamps.len() {
            0
        } else {
            self.timestamps[i + 1] - self.timestamps[i]
        }
    }
}
