//! Segment file handle: the write path, recovery, and per-segment views.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use spoolhouse_core::Timeline;

use crate::error::{Error, Result};

use super::{
    CHECKPOINT_OFFSET, FILE_HEADER_SIZE, FRAME_OVERHEAD, SEGMENT_MAGIC, SEGMENT_VERSION,
    TIMELINE_MAX_BUCKETS,
};

/// Handle on one segment file.
///
/// The handle is shared (`Arc`) between the appender and any cursors
/// positioned on the segment. The write side lives behind an async mutex;
/// the read side is lock-free: cursors open their own file handles and
/// bound reads by the atomic committed length.
#[derive(Debug)]
pub(crate) struct SegmentFile {
    first_id: u64,
    /// Full-file length cap; 0 for read-only handles (never appended to).
    max_length: u64,
    io: Mutex<SegmentIo>,
    /// Record bytes fully written, excluding the file header.
    committed: AtomicU64,
    count: AtomicU32,
    most_recent_ts: AtomicI64,
    /// Set on append, cleared on checkpoint.
    dirty: AtomicBool,
}

#[derive(Debug)]
struct SegmentIo {
    path: PathBuf,
    /// Write handle; `None` once sealed, closed, or opened read-only.
    file: Option<File>,
}

impl SegmentFile {
    /// Create a fresh active segment and write its header.
    pub(crate) fn create(path: PathBuf, first_id: u64, max_length: u64) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = BytesMut::with_capacity(FILE_HEADER_SIZE as usize);
        header.put_slice(&SEGMENT_MAGIC);
        header.put_u16(SEGMENT_VERSION);
        header.put_u16(0); // flags
        header.put_u64(first_id);
        header.put_u64(0); // checkpoint
        header.put_bytes(0, 8); // reserved
        file.write_all(&header)?;

        debug!(path = %path.display(), first_id, "created segment");

        Ok(Arc::new(Self {
            first_id,
            max_length,
            io: Mutex::new(SegmentIo {
                path,
                file: Some(file),
            }),
            committed: AtomicU64::new(0),
            count: AtomicU32::new(0),
            most_recent_ts: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
        }))
    }

    /// Open a sealed segment read-only. `count` comes from the file name.
    pub(crate) fn open_read(path: PathBuf, first_id: u64, count: u32) -> Result<Arc<Self>> {
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        read_header(&mut file, &path, first_id)?;

        Ok(Arc::new(Self {
            first_id,
            max_length: 0,
            io: Mutex::new(SegmentIo { path, file: None }),
            committed: AtomicU64::new(len - FILE_HEADER_SIZE),
            count: AtomicU32::new(count),
            most_recent_ts: AtomicI64::new(0),
            dirty: AtomicBool::new(false),
        }))
    }

    /// Reopen the last segment of a buffer for append continuation.
    ///
    /// Scans every frame from the start, CRC-validating each, to recover
    /// the message count and committed length; a partial or corrupt tail
    /// is truncated away.
    pub(crate) fn open_append(path: PathBuf, first_id: u64, max_length: u64) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        let checkpoint = read_header(&mut file, &path, first_id)?;

        let data_len = len - FILE_HEADER_SIZE;
        let (valid, count, last_ts) = recover_scan(&mut file, data_len)?;
        if valid < checkpoint {
            warn!(
                path = %path.display(),
                checkpoint,
                recovered = valid,
                "segment lost checkpointed records; underlying storage dropped synced data"
            );
        }
        if valid < data_len {
            file.set_len(FILE_HEADER_SIZE + valid)?;
            file.sync_data()?;
            warn!(
                path = %path.display(),
                from = len,
                to = FILE_HEADER_SIZE + valid,
                "truncated segment to last valid frame during recovery"
            );
        }

        Ok(Arc::new(Self {
            first_id,
            max_length,
            io: Mutex::new(SegmentIo {
                path,
                file: Some(file),
            }),
            committed: AtomicU64::new(valid),
            count: AtomicU32::new(count),
            most_recent_ts: AtomicI64::new(last_ts),
            dirty: AtomicBool::new(false),
        }))
    }

    pub(crate) fn first_id(&self) -> u64 {
        self.first_id
    }

    /// Record bytes fully written, excluding the file header.
    pub(crate) fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Id the next appended message will get.
    pub(crate) fn next_message_id(&self) -> u64 {
        self.first_id + self.committed()
    }

    pub(crate) fn message_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Timestamp of the most recently appended message; 0 if none since open.
    pub(crate) fn most_recent_timestamp(&self) -> i64 {
        self.most_recent_ts.load(Ordering::Acquire)
    }

    /// Full file length in bytes, header included.
    pub(crate) fn length(&self) -> u64 {
        FILE_HEADER_SIZE + self.committed()
    }

    pub(crate) async fn path(&self) -> PathBuf {
        self.io.lock().await.path.clone()
    }

    /// Append one record. Returns the assigned id, or `None` when the
    /// frame would push the file past its length cap (the full sentinel).
    pub(crate) async fn append(
        &self,
        timestamp: i64,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<Option<u64>> {
        let frame_len = FRAME_OVERHEAD + routing_key.len() as u64 + payload.len() as u64;
        let mut io = self.io.lock().await;
        let file = io.file.as_mut().ok_or(Error::Closed)?;

        let committed = self.committed.load(Ordering::Acquire);
        if FILE_HEADER_SIZE + committed + frame_len > self.max_length {
            return Ok(None);
        }

        let mut frame = BytesMut::with_capacity(frame_len as usize);
        frame.put_u32(frame_len as u32);
        frame.put_u32(0); // crc, patched below
        frame.put_i64(timestamp);
        frame.put_u16(routing_key.len() as u16);
        frame.put_slice(routing_key.as_bytes());
        frame.put_slice(payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&frame[8..]);
        let crc = hasher.finalize();
        frame[4..8].copy_from_slice(&crc.to_be_bytes());

        file.seek(SeekFrom::Start(FILE_HEADER_SIZE + committed))?;
        file.write_all(&frame)?;

        // Publish only after the frame is fully on the file: readers bound
        // themselves by `committed` and must never see a partial record.
        self.committed.store(committed + frame_len, Ordering::Release);
        self.count.fetch_add(1, Ordering::Release);
        self.most_recent_ts.store(timestamp, Ordering::Release);
        self.dirty.store(true, Ordering::Release);

        Ok(Some(self.first_id + committed))
    }

    /// Force the committed records onto durable storage and persist the
    /// committed length into the header checkpoint field.
    ///
    /// No-op when nothing changed since the last checkpoint (unless
    /// `force`) or when the write handle is already gone.
    pub(crate) async fn checkpoint(&self, force: bool) -> Result<()> {
        if !force && !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut io = self.io.lock().await;
        let Some(file) = io.file.as_mut() else {
            return Ok(());
        };
        write_checkpoint(file, self.committed.load(Ordering::Acquire))?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Seal the segment: checkpoint, rename to its final-count name, and
    /// release the write handle. Read-side cursors are unaffected.
    pub(crate) async fn seal(&self, new_path: PathBuf) -> Result<()> {
        let mut io = self.io.lock().await;
        if let Some(file) = io.file.as_mut() {
            write_checkpoint(file, self.committed.load(Ordering::Acquire))?;
        }
        std::fs::rename(&io.path, &new_path)?;
        debug!(from = %io.path.display(), to = %new_path.display(), "sealed segment");
        io.path = new_path;
        io.file = None;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Checkpoint and release the write handle without renaming.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        if let Some(file) = io.file.as_mut() {
            write_checkpoint(file, self.committed.load(Ordering::Acquire))?;
            io.file = None;
            self.dirty.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Histogram of this segment's records: up to
    /// [`TIMELINE_MAX_BUCKETS`] evenly strided entries plus the sentinel.
    pub(crate) async fn timeline(&self) -> Result<Timeline> {
        let committed = self.committed();
        let count = self.message_count() as usize;
        if count == 0 {
            return Ok(Timeline::from_parts(
                vec![self.next_message_id()],
                vec![self.most_recent_timestamp()],
                vec![0],
            ));
        }

        let stride = count.div_ceil(TIMELINE_MAX_BUCKETS);
        let path = self.path().await;
        let mut file = File::open(&path)?;

        let mut ids = Vec::new();
        let mut timestamps = Vec::new();
        let mut counts: Vec<u32> = Vec::new();
        let mut last_ts = 0i64;
        let mut seen = 0usize;
        scan_committed(&mut file, committed, |pos, _len, ts| {
            if seen % stride == 0 {
                ids.push(self.first_id + pos);
                timestamps.push(ts);
                counts.push(0);
            }
            if let Some(bucket) = counts.last_mut() {
                *bucket += 1;
            }
            last_ts = ts;
            seen += 1;
        })?;

        ids.push(self.next_message_id());
        timestamps.push(last_ts);
        counts.push(0);
        Ok(Timeline::from_parts(ids, timestamps, counts))
    }
}

/// Read and validate the 32-byte header; returns the checkpoint field.
fn read_header(file: &mut File, path: &Path, expected_first_id: u64) -> Result<u64> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).map_err(|_| {
        Error::InvalidSegment(format!("[{}] is too short for a segment header", path.display()))
    })?;

    let mut b = &buf[..];
    let mut magic = [0u8; 4];
    b.copy_to_slice(&mut magic);
    if magic != SEGMENT_MAGIC {
        return Err(Error::InvalidSegment(format!(
            "[{}] has bad magic bytes",
            path.display()
        )));
    }
    let version = b.get_u16();
    if version != SEGMENT_VERSION {
        return Err(Error::InvalidSegment(format!(
            "[{}] has unsupported version {version}",
            path.display()
        )));
    }
    let _flags = b.get_u16();
    let first_id = b.get_u64();
    if first_id != expected_first_id {
        return Err(Error::InvalidSegment(format!(
            "[{}] header first id {first_id} does not match file name {expected_first_id}",
            path.display()
        )));
    }
    Ok(b.get_u64())
}

fn write_checkpoint(file: &mut File, committed: u64) -> Result<()> {
    file.seek(SeekFrom::Start(CHECKPOINT_OFFSET))?;
    file.write_all(&committed.to_be_bytes())?;
    file.sync_data()?;
    Ok(())
}

/// Lenient scan used by recovery: walk frames from the start of the record
/// area, stopping at `data_len` or the first incomplete/corrupt frame.
/// Returns `(valid record bytes, message count, last timestamp)`.
fn recover_scan(file: &mut File, data_len: u64) -> Result<(u64, u32, i64)> {
    let mut pos = 0u64;
    let mut count = 0u32;
    let mut last_ts = 0i64;
    let mut head = [0u8; 8];

    while pos + FRAME_OVERHEAD <= data_len {
        file.seek(SeekFrom::Start(FILE_HEADER_SIZE + pos))?;
        file.read_exact(&mut head)?;
        let mut b = &head[..];
        let frame_len = b.get_u32() as u64;
        let stored_crc = b.get_u32();
        if frame_len < FRAME_OVERHEAD || pos + frame_len > data_len {
            break;
        }

        let mut body = vec![0u8; (frame_len - 8) as usize];
        file.read_exact(&mut body)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            break;
        }

        last_ts = (&body[..8]).get_i64();
        pos += frame_len;
        count += 1;
    }
    Ok((pos, count, last_ts))
}

/// Strict scan over committed frames, invoking `visit(pos, frame_len, ts)`
/// for each. Frames below the committed length are trusted to be well
/// formed; an overrun means the segment is corrupt.
pub(super) fn scan_committed(
    file: &mut File,
    committed: u64,
    mut visit: impl FnMut(u64, u64, i64),
) -> Result<()> {
    let mut pos = 0u64;
    let mut head = [0u8; 8];
    let mut ts_buf = [0u8; 8];

    while pos < committed {
        file.seek(SeekFrom::Start(FILE_HEADER_SIZE + pos))?;
        file.read_exact(&mut head)?;
        let mut b = &head[..];
        let frame_len = b.get_u32() as u64;
        let _crc = b.get_u32();
        if frame_len < FRAME_OVERHEAD || pos + frame_len > committed {
            return Err(Error::InvalidSegment(format!(
                "frame at record offset {pos} overruns the committed length"
            )));
        }
        file.read_exact(&mut ts_buf)?;
        visit(pos, frame_len, (&ts_buf[..]).get_i64());
        pos += frame_len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentCursor;

    fn segment_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(crate::index::file_name(0, 1000, 0))
    }

    #[tokio::test]
    async fn test_append_assigns_byte_offset_ids() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();

        let a = segment.append(1000, "k", b"hello").await.unwrap().unwrap();
        let b = segment.append(1001, "", b"world!").await.unwrap().unwrap();
        assert_eq!(a, 0);
        // frame a = 18 + 1 + 5 = 24 bytes
        assert_eq!(b, 24);
        assert_eq!(segment.next_message_id(), 24 + 18 + 6);
        assert_eq!(segment.message_count(), 2);
        assert_eq!(segment.most_recent_timestamp(), 1001);
        assert_eq!(segment.length(), FILE_HEADER_SIZE + segment.committed());
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();

        for i in 0..5i64 {
            segment
                .append(1000 + i, "key", format!("payload-{i}").as_bytes())
                .await
                .unwrap()
                .unwrap();
        }

        let mut cursor = SegmentCursor::at_id(&segment, 0).await.unwrap();
        for i in 0..5i64 {
            assert!(cursor.next().unwrap());
            let msg = cursor.current().unwrap();
            assert_eq!(msg.timestamp, 1000 + i);
            assert_eq!(msg.routing_key, "key");
            assert_eq!(msg.payload.as_ref(), format!("payload-{i}").as_bytes());
        }
        assert!(!cursor.next().unwrap());
    }

    #[tokio::test]
    async fn test_cursor_positioned_mid_segment() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();

        let mut ids = Vec::new();
        for i in 0..3i64 {
            ids.push(segment.append(i, "", b"x").await.unwrap().unwrap());
        }

        let mut cursor = SegmentCursor::at_id(&segment, ids[1]).await.unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.current().unwrap().id, ids[1]);
    }

    #[tokio::test]
    async fn test_full_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        // room for the header plus one small frame only
        let segment = SegmentFile::create(segment_path(&dir), 0, FILE_HEADER_SIZE + 30).unwrap();

        assert!(segment.append(0, "", b"0123456789").await.unwrap().is_some());
        assert!(segment.append(1, "", b"0123456789").await.unwrap().is_none());
        // the sentinel does not consume an id
        assert_eq!(segment.message_count(), 1);
    }

    #[tokio::test]
    async fn test_reopen_recovers_count_and_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(&dir);
        let next;
        {
            let segment = SegmentFile::create(path.clone(), 0, 1 << 20).unwrap();
            for i in 0..4i64 {
                segment.append(100 + i, "rk", b"abcdef").await.unwrap().unwrap();
            }
            segment.checkpoint(true).await.unwrap();
            next = segment.next_message_id();
        }

        let reopened = SegmentFile::open_append(path, 0, 1 << 20).unwrap();
        assert_eq!(reopened.message_count(), 4);
        assert_eq!(reopened.next_message_id(), next);
        assert_eq!(reopened.most_recent_timestamp(), 103);

        // appending continues where the ids left off
        let id = reopened.append(104, "rk", b"abcdef").await.unwrap().unwrap();
        assert_eq!(id, next);
    }

    #[tokio::test]
    async fn test_reopen_truncates_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(&dir);
        let valid_len;
        {
            let segment = SegmentFile::create(path.clone(), 0, 1 << 20).unwrap();
            segment.append(100, "", b"good").await.unwrap().unwrap();
            valid_len = segment.length();
            segment.checkpoint(true).await.unwrap();
        }
        // simulate a torn write: a frame header promising more bytes than exist
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0, 0, 0, 200, 1, 2, 3, 4, 5]).unwrap();
        }

        let reopened = SegmentFile::open_append(path.clone(), 0, 1 << 20).unwrap();
        assert_eq!(reopened.message_count(), 1);
        assert_eq!(reopened.length(), valid_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[tokio::test]
    async fn test_reopen_truncates_corrupt_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(&dir);
        {
            let segment = SegmentFile::create(path.clone(), 0, 1 << 20).unwrap();
            segment.append(100, "", b"good").await.unwrap().unwrap();
            segment.append(101, "", b"bad!").await.unwrap().unwrap();
            segment.checkpoint(true).await.unwrap();
        }
        // flip a payload byte in the second frame
        {
            let len = std::fs::metadata(&path).unwrap().len();
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(len - 1)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let reopened = SegmentFile::open_append(path, 0, 1 << 20).unwrap();
        assert_eq!(reopened.message_count(), 1);
    }

    #[tokio::test]
    async fn test_open_read_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(&dir);
        std::fs::write(&path, b"this is not a segment file at all, not even close").unwrap();
        assert!(matches!(
            SegmentFile::open_read(path, 0, 0),
            Err(Error::InvalidSegment(_))
        ));
    }

    #[tokio::test]
    async fn test_open_read_rejects_first_id_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = segment_path(&dir);
        {
            let segment = SegmentFile::create(path.clone(), 0, 1 << 20).unwrap();
            segment.append(0, "", b"x").await.unwrap().unwrap();
            segment.close().await.unwrap();
        }
        assert!(matches!(
            SegmentFile::open_read(path, 777, 1),
            Err(Error::InvalidSegment(_))
        ));
    }

    #[tokio::test]
    async fn test_cursor_by_timestamp_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();
        for ts in [100i64, 200, 300, 400] {
            segment.append(ts, "", b"x").await.unwrap().unwrap();
        }

        let mut cursor = SegmentCursor::at_timestamp(&segment, 250).await.unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.current().unwrap().timestamp, 200);

        // before everything: clamp to the first record
        let mut cursor = SegmentCursor::at_timestamp(&segment, 50).await.unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.current().unwrap().timestamp, 100);

        // after everything: the last record
        let mut cursor = SegmentCursor::at_timestamp(&segment, 10_000).await.unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.current().unwrap().timestamp, 400);
    }

    #[tokio::test]
    async fn test_cursor_rejects_out_of_range_id() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 100, 1 << 20).unwrap();
        assert!(SegmentCursor::at_id(&segment, 50).await.is_err());
        assert!(SegmentCursor::at_id(&segment, 101).await.is_err());
        // exactly next_message_id is a valid wait position
        let mut cursor = SegmentCursor::at_id(&segment, 100).await.unwrap();
        assert!(!cursor.next().unwrap());
    }

    #[tokio::test]
    async fn test_timeline_buckets_cover_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();
        for i in 0..100i64 {
            segment.append(1000 + i, "", b"xy").await.unwrap().unwrap();
        }

        let timeline = segment.timeline().await.unwrap();
        assert!(timeline.len() <= TIMELINE_MAX_BUCKETS + 1);
        let total: u32 = (0..timeline.len()).map(|i| timeline.count(i)).sum();
        assert_eq!(total, 100);
        // sentinel carries the next id and the last timestamp
        assert_eq!(timeline.message_id(timeline.len() - 1), segment.next_message_id());
        assert_eq!(timeline.timestamp(timeline.len() - 1), 1099);
    }

    #[tokio::test]
    async fn test_append_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();
        segment.close().await.unwrap();
        assert!(matches!(
            segment.append(0, "", b"x").await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_seal_renames_and_keeps_readers_working() {
        let dir = tempfile::tempdir().unwrap();
        let segment = SegmentFile::create(segment_path(&dir), 0, 1 << 20).unwrap();
        segment.append(1000, "k", b"v").await.unwrap().unwrap();

        let mut cursor = SegmentCursor::at_id(&segment, 0).await.unwrap();
        let sealed = dir.path().join(crate::index::file_name(0, 1000, 1));
        segment.seal(sealed.clone()).await.unwrap();

        assert!(sealed.exists());
        assert!(!segment_path(&dir).exists());
        // the cursor's handle survives the rename
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.current().unwrap().payload.as_ref(), b"v");
    }
}
