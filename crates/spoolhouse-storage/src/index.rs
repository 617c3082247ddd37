//! Directory Index
//!
//! In-memory master index of the segment files in a buffer directory,
//! rebuilt on open from the file names alone.
//!
//! ## Why File Names Are Enough
//!
//! Every segment is named `<first_id:016x>-<first_ts:016x>-<count>.qdb`.
//! First ids are strictly increasing across segments, so a lexicographic
//! sort of the names reconstructs the buffer order, and the name fields
//! give the index everything it needs:
//!
//! ```text
//! 0000000000000000-0000018c9a2b1f40-120.qdb     sealed, 120 messages
//! 0000000000041a00-0000018c9a2c0011-97.qdb      sealed, 97 messages
//! 0000000000082d40-0000018c9a2d5a7f-0.qdb       active (count 0 until sealed)
//! ```
//!
//! ## Structure
//!
//! Three parallel growable arrays of `(first_id, first_ts, count)` with a
//! `[head, tail)` window. Reclaiming the oldest segment just advances
//! `head`; the dead slots in front are compacted away once enough of them
//! accumulate. Lookups binary-search the window and return the
//! *predecessor* on a miss: the segment whose range covers the target.
//!
//! Positions handed out to callers are **logical** segment numbers
//! (`base + slot`), stable across compaction, so cursors can hold one
//! while the arrays shift underneath.

use std::path::Path;

use crate::error::{Error, Result};

/// Segment file extension.
pub const SEGMENT_SUFFIX: &str = "qdb";

/// Dead slots tolerated in front of the window before compaction.
const COMPACT_SLACK: usize = 512;

/// Minimum well-formed name: 16 hex + '-' + 16 hex + '-' + digit + ".qdb".
const MIN_NAME_LEN: usize = 39;

/// Master index of segment files, ordered by first message id.
#[derive(Debug)]
pub(crate) struct DirectoryIndex {
    first_ids: Vec<u64>,
    first_timestamps: Vec<i64>,
    counts: Vec<u32>,
    /// First live slot; everything before it has been reclaimed.
    head: usize,
    /// Logical segment number of slot 0.
    base: u64,
}

impl DirectoryIndex {
    /// Build the index from the `.qdb` file names in `dir`.
    ///
    /// Any `.qdb` file whose name does not match the fixed-width pattern is
    /// a fatal construction error. Other files are ignored.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(&format!(".{SEGMENT_SUFFIX}")) {
                names.push(name.to_string());
            }
        }
        names.sort_unstable();

        let mut index = Self {
            first_ids: Vec::with_capacity(names.len()),
            first_timestamps: Vec::with_capacity(names.len()),
            counts: Vec::with_capacity(names.len()),
            head: 0,
            base: 0,
        };
        for name in &names {
            let (first_id, first_ts, count) = parse_file_name(name)?;
            if let Some(&prev) = index.first_ids.last() {
                if first_id <= prev {
                    return Err(Error::InvalidSegment(format!(
                        "segment [{name}] does not extend its predecessor (first id {first_id} <= {prev})"
                    )));
                }
            }
            index.first_ids.push(first_id);
            index.first_timestamps.push(first_ts);
            index.counts.push(count);
        }
        Ok(index)
    }

    /// Number of live segments in the window.
    pub fn len(&self) -> usize {
        self.first_ids.len() - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical number of the oldest live segment.
    pub fn head_logical(&self) -> u64 {
        self.base + self.head as u64
    }

    /// Logical number one past the newest segment.
    pub fn tail_logical(&self) -> u64 {
        self.base + self.first_ids.len() as u64
    }

    /// Logical number of the newest segment, if any.
    pub fn last_logical(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.tail_logical() - 1)
        }
    }

    fn slot(&self, logical: u64) -> Option<usize> {
        if logical < self.head_logical() || logical >= self.tail_logical() {
            return None;
        }
        Some((logical - self.base) as usize)
    }

    /// `(first_id, first_ts, count)` of a live segment.
    pub fn entry(&self, logical: u64) -> Option<(u64, i64, u32)> {
        let slot = self.slot(logical)?;
        Some((
            self.first_ids[slot],
            self.first_timestamps[slot],
            self.counts[slot],
        ))
    }

    /// File name a live segment currently has on disk.
    pub fn file_name_at(&self, logical: u64) -> Option<String> {
        let (id, ts, count) = self.entry(logical)?;
        Some(file_name(id, ts, count))
    }

    /// Record the final message count of a sealed segment.
    pub fn set_count(&mut self, logical: u64, count: u32) {
        if let Some(slot) = self.slot(logical) {
            self.counts[slot] = count;
        }
    }

    /// Append a new (active) segment entry.
    pub fn push(&mut self, first_id: u64, first_ts: i64) {
        if self.head >= COMPACT_SLACK {
            self.first_ids.drain(..self.head);
            self.first_timestamps.drain(..self.head);
            self.counts.drain(..self.head);
            self.base += self.head as u64;
            self.head = 0;
        }
        self.first_ids.push(first_id);
        self.first_timestamps.push(first_ts);
        self.counts.push(0);
    }

    /// Drop the oldest segment from the window, returning its entry so the
    /// caller can unlink the file.
    pub fn drop_head(&mut self) -> Option<(u64, i64, u32)> {
        if self.is_empty() {
            return None;
        }
        let entry = (
            self.first_ids[self.head],
            self.first_timestamps[self.head],
            self.counts[self.head],
        );
        self.head += 1;
        Some(entry)
    }

    /// Logical number of the segment whose id range covers `id`.
    ///
    /// Ids below the window clamp to the head segment. Returns `None` only
    /// when the index is empty; ids past the end land in the last segment
    /// (the caller bounds them against `next_message_id`).
    pub fn find_by_id(&self, id: u64) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        let window = &self.first_ids[self.head..];
        let id = id.max(window[0]);
        let covered = window.partition_point(|&first| first <= id);
        Some(self.head_logical() + covered as u64 - 1)
    }

    /// Logical number of the segment whose first timestamp is the
    /// predecessor of `ts`. Same clamping as [`find_by_id`].
    pub fn find_by_timestamp(&self, ts: i64) -> Option<u64> {
        if self.is_empty() {
            return None;
        }
        let window = &self.first_timestamps[self.head..];
        let ts = ts.max(window[0]);
        let covered = window.partition_point(|&first| first <= ts);
        Some(self.head_logical() + covered as u64 - 1)
    }
}

/// Format a segment file name: 16 lowercase hex digits of the first id,
/// 16 of the first timestamp (two's complement for negatives), and the
/// decimal message count.
pub(crate) fn file_name(first_id: u64, first_ts: i64, count: u32) -> String {
    format!("{:016x}-{:016x}-{}.{}", first_id, first_ts as u64, count, SEGMENT_SUFFIX)
}

/// Parse a segment file name, rejecting anything that is not bit-exact.
pub(crate) fn parse_file_name(name: &str) -> Result<(u64, i64, u32)> {
    let corrupt = || Error::CorruptName(name.to_string());

    let stem = name
        .strip_suffix(&format!(".{SEGMENT_SUFFIX}"))
        .ok_or_else(corrupt)?;
    if name.len() < MIN_NAME_LEN || !name.is_ascii() {
        return Err(corrupt());
    }
    let bytes = stem.as_bytes();
    if bytes[16] != b'-' || bytes[33] != b'-' {
        return Err(corrupt());
    }

    let is_lower_hex = |s: &str| s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    let (id_part, ts_part, count_part) = (&stem[..16], &stem[17..33], &stem[34..]);
    if !is_lower_hex(id_part) || !is_lower_hex(ts_part) {
        return Err(corrupt());
    }
    if count_part.is_empty() || !count_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(corrupt());
    }

    let first_id = u64::from_str_radix(id_part, 16).map_err(|_| corrupt())?;
    let first_ts = u64::from_str_radix(ts_part, 16).map_err(|_| corrupt())? as i64;
    let count: u32 = count_part.parse().map_err(|_| corrupt())?;
    Ok((first_id, first_ts, count))
}
