//! Intra-segment cursor: forward iteration over one segment's records.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, Bytes};

use spoolhouse_core::Message;

use crate::error::{Error, Result};

use super::file::scan_committed;
use super::{SegmentFile, FILE_HEADER_SIZE, FRAME_OVERHEAD};

/// Forward cursor over the records of one segment.
///
/// Owns a private read handle on the segment file; the shared
/// [`SegmentFile`] is only consulted for the committed length, so a cursor
/// tailing the active segment picks up new records as the appender
/// publishes them, and never sees a partially written frame.
#[derive(Debug)]
pub(crate) struct SegmentCursor {
    segment: Arc<SegmentFile>,
    file: File,
    /// Record-byte offset (header excluded) of the next frame to read.
    pos: u64,
    current: Option<Message>,
}

impl SegmentCursor {
    /// Cursor positioned just before the record with id `from_id`.
    /// `from_id` may equal `next_message_id`: that is the tail position.
    pub(crate) async fn at_id(segment: &Arc<SegmentFile>, from_id: u64) -> Result<Self> {
        let next = segment.next_message_id();
        if from_id < segment.first_id() || from_id > next {
            return Err(Error::InvalidArgument(format!(
                "message id {from_id} outside segment range {}..{next}",
                segment.first_id()
            )));
        }
        let path = segment.path().await;
        Self::open(Arc::clone(segment), &path, from_id - segment.first_id())
    }

    /// Cursor positioned just before the last record whose timestamp is
    /// `<= ts`, or before the first record when every record is later.
    pub(crate) async fn at_timestamp(segment: &Arc<SegmentFile>, ts: i64) -> Result<Self> {
        let committed = segment.committed();
        let path = segment.path().await;
        let mut file = File::open(&path)?;
        let mut best = 0u64;
        scan_committed(&mut file, committed, |pos, _len, frame_ts| {
            if frame_ts <= ts {
                best = pos;
            }
        })?;
        Self::open(Arc::clone(segment), &path, best)
    }

    /// Open a cursor positioned `pos` record bytes into the segment.
    fn open(segment: Arc<SegmentFile>, path: &Path, pos: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            segment,
            file,
            pos,
            current: None,
        })
    }

    /// Advance to the next committed record. Returns `false` at the
    /// committed end; calling again later is fine (tail-follow).
    pub(crate) fn next(&mut self) -> Result<bool> {
        let committed = self.segment.committed();
        if self.pos >= committed {
            return Ok(false);
        }

        self.file.seek(SeekFrom::Start(FILE_HEADER_SIZE + self.pos))?;
        let mut head = [0u8; 8];
        self.file.read_exact(&mut head)?;
        let mut b = &head[..];
        let frame_len = b.get_u32() as u64;
        let stored_crc = b.get_u32();
        if frame_len < FRAME_OVERHEAD || self.pos + frame_len > committed {
            return Err(Error::InvalidSegment(format!(
                "frame at record offset {} has invalid length {frame_len}",
                self.pos
            )));
        }

        let mut body = vec![0u8; (frame_len - 8) as usize];
        self.file.read_exact(&mut body)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            return Err(Error::CrcMismatch {
                offset: self.segment.first_id() + self.pos,
            });
        }

        let mut body = Bytes::from(body);
        let timestamp = body.get_i64();
        let key_len = body.get_u16() as usize;
        if key_len > body.remaining() {
            return Err(Error::InvalidSegment(format!(
                "routing key at record offset {} overruns its frame",
                self.pos
            )));
        }
        let key = body.copy_to_bytes(key_len);
        let routing_key = String::from_utf8(key.to_vec()).map_err(|_| {
            Error::InvalidSegment(format!(
                "routing key at record offset {} is not UTF-8",
                self.pos
            ))
        })?;
        let payload = body.copy_to_bytes(body.remaining());

        self.current = Some(Message::new(
            self.segment.first_id() + self.pos,
            timestamp,
            routing_key,
            payload,
        ));
        self.pos += frame_len;
        Ok(true)
    }

    /// The record the last successful [`next`](Self::next) landed on.
    pub(crate) fn current(&self) -> Option<&Message> {
        self.current.as_ref()
    }

    pub(crate) fn segment(&self) -> &Arc<SegmentFile> {
        &self.segment
    }
}
