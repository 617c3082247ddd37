//! Segment Storage Format
//!
//! This module implements the on-disk format for one segment file and the
//! cursor that iterates it.
//!
//! ## Segment File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                           │
//! │ - Magic bytes: "SPOL" (4 bytes)                             │
//! │ - Version: 1 (2 bytes)                                      │
//! │ - Flags: reserved, zero (2 bytes)                           │
//! │ - First message id (8 bytes)                                │
//! │ - Checkpoint: committed record bytes at last sync (8 bytes) │
//! │ - Reserved (8 bytes)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Record frame 1                                              │
//! │ - Frame length, including this field (4 bytes)              │
//! │ - CRC32 over everything after this field (4 bytes)          │
//! │ - Timestamp, ms since epoch (8 bytes)                       │
//! │ - Routing key length (2 bytes)                              │
//! │ - Routing key bytes (UTF-8)                                 │
//! │ - Payload bytes (frame length - 18 - key length)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Record frame 2                                              │
//! │ ...                                                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are big-endian.
//!
//! ## Ids Are Byte Offsets
//!
//! A record's id is `first_id + (frame position - header size)`. That makes
//! positioning a cursor at a known id a single seek, and it makes
//! `next_id - first_id` equal to the segment's record byte length, which
//! the buffer leans on for size and timeline math.
//!
//! ## Write/Read Coordination
//!
//! The writer advances an atomic committed length only after a frame is
//! fully written. Readers own private file handles and never read past the
//! committed length, so a concurrently appended record is either fully
//! visible or not visible at all.
//!
//! ## Crash Recovery
//!
//! Reopening a segment for append scans its frames from the start,
//! CRC-validating each, and truncates the file at the first incomplete or
//! corrupt frame (standard log recovery: truncate at the first bad frame).

mod cursor;
mod file;

pub(crate) use cursor::SegmentCursor;
pub(crate) use file::SegmentFile;

/// Magic bytes for segment files: "SPOL".
pub const SEGMENT_MAGIC: [u8; 4] = [0x53, 0x50, 0x4F, 0x4C];

/// Version number for the segment format.
pub const SEGMENT_VERSION: u16 = 1;

/// Bytes reserved at the start of every segment file.
pub const FILE_HEADER_SIZE: u64 = 32;

/// File position of the checkpoint field within the header.
pub(crate) const CHECKPOINT_OFFSET: u64 = 16;

/// Fixed frame bytes around a record: length + crc + timestamp + key length.
pub(crate) const FRAME_OVERHEAD: u64 = 4 + 4 + 8 + 2;

/// Upper bound on non-sentinel entries in a per-segment timeline.
pub(crate) const TIMELINE_MAX_BUCKETS: usize = 32;
