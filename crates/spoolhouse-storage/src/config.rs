//! Buffer Configuration
//!
//! Controls how the buffer sizes its on-disk ring and how aggressively it
//! syncs:
//!
//! - **max_size**: total on-disk cap; the oldest segments are reclaimed
//!   once the ring exceeds it (0 disables reclamation)
//! - **segment_count**: target number of segments when the ring is full;
//!   guides the derived segment length
//! - **segment_length**: fixed segment size, or 0 to derive from
//!   `max_size / segment_count`
//! - **max_payload_size**: per-record limit, or 0 to derive from the
//!   segment length
//! - **auto_sync_interval_ms**: how long after an append the scheduled
//!   fsync fires (≤ 0 disables auto-sync; explicit `sync()` still works)
//! - **executor**/**timer**: runtime handles for background cleanup and
//!   the auto-sync task
//!
//! Smaller segments give more granular timeline data and faster
//! reclamation but cap the maximum payload and cost more rollovers.
//!
//! ## Usage
//!
//! ```ignore
//! use spoolhouse_storage::BufferConfig;
//!
//! // 1 GiB ring with 4 MiB segments, synced at most once a second
//! let config = BufferConfig {
//!     max_size: 1024 * 1024 * 1024,
//!     segment_length: 4 * 1024 * 1024,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::error::{Error, Result};

/// Hard ceiling for a single segment and for any payload: 1 GB.
const MAX_SEGMENT_LENGTH: u64 = 1000 * 1_000_000;

/// Room reserved in a segment for the file header and record framing when
/// deriving one limit from the other.
const SEGMENT_SLACK: u64 = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Total on-disk cap in bytes before the oldest segments are reclaimed
    /// (default: 100 GB). 0 disables reclamation.
    #[serde(default = "default_max_size")]
    pub max_size: u64,

    /// Target segment count when the ring is full (default: 1000).
    #[serde(default = "default_segment_count")]
    pub segment_count: u32,

    /// Fixed segment length in bytes; 0 derives it from `max_size` and
    /// `segment_count` (default: 0).
    #[serde(default)]
    pub segment_length: u64,

    /// Per-record payload limit in bytes; 0 derives it from the segment
    /// length (default: 128 KiB).
    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Delay after an append before the scheduled fsync fires; ≤ 0
    /// disables auto-sync (default: 1000).
    #[serde(default = "default_auto_sync_interval_ms")]
    pub auto_sync_interval_ms: i64,

    /// Runtime to run cleanup on; `None` runs cleanup inline on the
    /// appending task.
    #[serde(skip)]
    pub executor: Option<Handle>,

    /// Runtime the auto-sync task is spawned on; `None` uses the runtime
    /// the buffer was opened on.
    #[serde(skip)]
    pub timer: Option<Handle>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            segment_count: default_segment_count(),
            segment_length: 0,
            max_payload_size: default_max_payload_size(),
            auto_sync_interval_ms: default_auto_sync_interval_ms(),
            executor: None,
            timer: None,
        }
    }
}

fn default_max_size() -> u64 {
    100 * 1000 * 1_000_000 // 100 GB
}

fn default_segment_count() -> u32 {
    1000
}

fn default_max_payload_size() -> usize {
    128 * 1024
}

fn default_auto_sync_interval_ms() -> i64 {
    1000
}

impl BufferConfig {
    /// Check option ranges. Called once when the buffer opens.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.segment_count == 0 {
            return Err(Error::InvalidArgument(
                "segment_count must be greater than zero".to_string(),
            ));
        }
        if self.max_payload_size as u64 >= MAX_SEGMENT_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "max_payload_size out of range: {}",
                self.max_payload_size
            )));
        }
        if self.segment_length > 0 && self.segment_length > MAX_SEGMENT_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "segment_length out of range: {}",
                self.segment_length
            )));
        }
        Ok(())
    }

    /// Segment length in effect: the configured value, or
    /// `clamp(max_size / segment_count, max_payload_size + 2048, 1 GB)`.
    pub fn effective_segment_length(&self) -> u64 {
        if self.segment_length > 0 {
            return self.segment_length;
        }
        let derived = (self.max_size / self.segment_count as u64).min(MAX_SEGMENT_LENGTH);
        derived.max(self.max_payload_size as u64 + SEGMENT_SLACK)
    }

    /// Max payload size in effect: the configured value, or the segment
    /// length minus room for the file header and record framing.
    pub fn effective_max_payload_size(&self) -> usize {
        if self.max_payload_size > 0 {
            return self.max_payload_size;
        }
        (self.effective_segment_length() - SEGMENT_SLACK) as usize
    }
}
