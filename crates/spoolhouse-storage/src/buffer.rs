//! Message Buffer
//!
//! Stores messages in multiple segment files in one directory. The buffer
//! behaves as a bounded ring over disk: producers append at the tail, and
//! once total on-disk size exceeds the configured cap the oldest segment
//! files are reclaimed.
//!
//! ## Architecture
//!
//! ```text
//! append(ts, key, payload)
//!        │
//!        ▼
//! ┌───────────────┐  full   ┌──────────────────────────────┐
//! │ active segment│ ──────► │ seal: rename …-0.qdb to      │
//! │ (…-0.qdb)     │         │ …-<count>.qdb, open successor│
//! └──────┬────────┘         └──────────────┬───────────────┘
//!        │ id                              │
//!        ▼                                 ▼
//!   notify waiting cursors          cleanup(): unlink oldest
//!                                   while size() > max_size
//! ```
//!
//! A single buffer-wide lock serializes the directory index, the active
//! segment pointer, the waiter set, and the auto-sync task state. Waiting
//! cursors are notified *after* the lock is released: the snapshot taken
//! under the lock is iterated outside it, so a cursor that is mid-`next`
//! can never deadlock against a producer.
//!
//! ## Durability
//!
//! Appends land in the OS page cache. The first append after a quiet
//! period schedules a one-shot sync task `auto_sync_interval_ms` in the
//! future; `sync()` forces a checkpoint immediately. A checkpoint fsyncs
//! the active segment and persists its committed length in the segment
//! header.
//!
//! ## Ids
//!
//! Message ids are byte offsets into the buffer's logical stream, so the
//! id space is sparse. `cursor(id)` accepts any id previously returned by
//! `append` (or 0, or `next_message_id()`); ids that fell off the ring
//! clamp to the oldest surviving message.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use spoolhouse_core::Timeline;

use crate::config::BufferConfig;
use crate::cursor::MessageCursor;
use crate::error::{Error, Result};
use crate::index::{self, DirectoryIndex};
use crate::segment::{SegmentCursor, SegmentFile, FILE_HEADER_SIZE};
use crate::shutdown::{self, ShutdownRegistration};

/// Disk-backed message buffer. Clone handles share one buffer.
#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<BufferInner>,
}

pub(crate) struct BufferInner {
    dir: PathBuf,
    config: BufferConfig,
    /// Runtime for the one-shot auto-sync task.
    timer: Option<Handle>,
    /// Runtime for background cleanup; `None` runs cleanup inline.
    executor: Option<Handle>,
    closed: AtomicBool,
    state: Mutex<BufferState>,
}

struct BufferState {
    index: DirectoryIndex,
    /// Segment currently accepting appends.
    current: Option<Arc<SegmentFile>>,
    /// Byte length of the last segment while no write handle is open.
    last_file_length: u64,
    /// Id the first message gets while the buffer is empty.
    first_message_id: u64,
    /// Ring cap; mutable at runtime through `set_max_size`.
    max_size: u64,
    /// Sparse list of blocked-cursor wakers; slots are nulled on
    /// deregistration and reused.
    waiters: Vec<Option<Arc<Notify>>>,
    sync_task: Option<JoinHandle<()>>,
    registration: Option<ShutdownRegistration>,
}

impl MessageBuffer {
    /// Open the buffer in `dir`, creating the directory if needed and
    /// rebuilding the index from the segment file names found there.
    pub async fn open(dir: impl Into<PathBuf>, config: BufferConfig) -> Result<Self> {
        let dir = dir.into();
        config.validate()?;

        std::fs::create_dir_all(&dir)?;
        if !dir.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "[{}] is not a directory",
                dir.display()
            )));
        }

        let index = DirectoryIndex::scan(&dir)?;
        let last_file_length = match index.last_logical() {
            Some(last) => {
                let name = index.file_name_at(last).unwrap_or_default();
                std::fs::metadata(dir.join(name))?.len()
            }
            None => 0,
        };

        info!(
            dir = %dir.display(),
            segments = index.len(),
            "opened message buffer"
        );

        let inner = Arc::new(BufferInner {
            timer: config.timer.clone().or_else(|| Handle::try_current().ok()),
            executor: config.executor.clone(),
            dir,
            closed: AtomicBool::new(false),
            state: Mutex::new(BufferState {
                max_size: config.max_size,
                index,
                current: None,
                last_file_length,
                first_message_id: 0,
                waiters: Vec::new(),
                sync_task: None,
                registration: None,
            }),
            config,
        });

        let registration = shutdown::register(&inner);
        inner.state.lock().await.registration = Some(registration);

        Ok(Self { inner })
    }

    /// Append a message and return its id. Blocks only on filesystem I/O
    /// and the buffer lock.
    pub async fn append(&self, timestamp: i64, routing_key: &str, payload: &[u8]) -> Result<u64> {
        if routing_key.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument(format!(
                "routing key of {} bytes is too long",
                routing_key.len()
            )));
        }

        let waiters;
        let id;
        {
            let mut state = self.inner.state.lock().await;
            self.inner.check_open()?;

            let max_payload = self.inner.config.effective_max_payload_size();
            if payload.len() > max_payload {
                return Err(Error::Oversize {
                    size: payload.len(),
                    max: max_payload,
                });
            }

            if state.current.is_none() {
                if state.index.is_empty() {
                    self.inner.create_first_segment(&mut state, timestamp)?;
                } else {
                    self.inner.ensure_current(&mut state)?;
                }
            }
            let current = state
                .current
                .clone()
                .ok_or_else(|| Error::InvalidSegment("no active segment".to_string()))?;

            id = match current.append(timestamp, routing_key, payload).await? {
                Some(id) => id,
                None => {
                    self.roll_over(&mut state, &current, timestamp, routing_key, payload)
                        .await?
                }
            };

            waiters = snapshot_waiters(&state);
        }

        // Never signal while holding the buffer lock: a cursor mid-`next`
        // takes its own notifier first and the buffer lock second.
        for waiter in waiters {
            waiter.notify_one();
        }

        if self.inner.config.auto_sync_interval_ms > 0 {
            self.schedule_auto_sync().await;
        }

        Ok(id)
    }

    /// Seal the full active segment, open its successor, and retry the
    /// append there. Called with the buffer lock held.
    async fn roll_over(
        &self,
        state: &mut BufferState,
        current: &Arc<SegmentFile>,
        timestamp: i64,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64> {
        let inner = &self.inner;
        let last = state
            .index
            .last_logical()
            .ok_or_else(|| Error::InvalidSegment("rollover on an empty index".to_string()))?;
        let (first_id, first_ts, _) = state
            .index
            .entry(last)
            .ok_or_else(|| Error::InvalidSegment("active segment missing from index".to_string()))?;

        let count = current.message_count();
        current
            .seal(inner.dir.join(index::file_name(first_id, first_ts, count)))
            .await?;
        state.index.set_count(last, count);

        let next_id = current.next_message_id();
        let successor = SegmentFile::create(
            inner.dir.join(index::file_name(next_id, timestamp, 0)),
            next_id,
            inner.config.effective_segment_length(),
        )?;
        state.index.push(next_id, timestamp);
        state.current = Some(Arc::clone(&successor));
        debug!(
            sealed = count,
            next_id,
            segments = state.index.len(),
            "rolled over to a new segment"
        );

        let id = successor
            .append(timestamp, routing_key, payload)
            .await?
            .ok_or_else(|| {
                // the payload passed the size check, so a fresh segment must take it
                Error::InvalidSegment("message does not fit in an empty segment".to_string())
            })?;

        if let Some(executor) = &inner.executor {
            let inner = Arc::clone(inner);
            executor.spawn(async move {
                if let Err(error) = inner.cleanup_inner().await {
                    error!(error = %error, "background cleanup failed");
                }
            });
        } else {
            inner.cleanup_locked(state)?;
        }

        Ok(id)
    }

    async fn schedule_auto_sync(&self) {
        let mut state = self.inner.state.lock().await;
        if self.inner.is_closed() {
            return;
        }
        let pending = state
            .sync_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if pending {
            return;
        }
        let Some(timer) = &self.inner.timer else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let delay = Duration::from_millis(self.inner.config.auto_sync_interval_ms as u64);
        state.sync_task = Some(timer.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(error) = inner.sync_inner().await {
                error!(error = %error, "scheduled sync failed");
            }
        }));
    }

    /// Force a durable checkpoint of the active segment. No-op when the
    /// buffer is empty or nothing changed.
    pub async fn sync(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.sync_inner().await
    }

    /// Reclaim the oldest segments while the buffer exceeds its cap.
    pub async fn cleanup(&self) -> Result<()> {
        self.inner.cleanup_inner().await
    }

    /// Forward cursor starting at `message_id` (clamped to the oldest
    /// surviving message; rejected past `next_message_id`).
    pub async fn cursor(&self, message_id: u64) -> Result<MessageCursor> {
        let Some(logical) = self.inner.find_segment(message_id).await? else {
            return Ok(MessageCursor::empty(Arc::clone(&self.inner)));
        };
        let Some((logical, segment)) = self.inner.segment_for_cursor(logical).await? else {
            return Ok(MessageCursor::empty(Arc::clone(&self.inner)));
        };
        // the ring may have moved past the requested id
        let from = message_id.max(segment.first_id());
        let inner = SegmentCursor::at_id(&segment, from).await?;
        Ok(MessageCursor::positioned(
            Arc::clone(&self.inner),
            logical,
            inner,
        ))
    }

    /// Forward cursor starting at the newest message whose timestamp is
    /// `<= timestamp` (clamped to the oldest message).
    pub async fn cursor_by_timestamp(&self, timestamp: i64) -> Result<MessageCursor> {
        self.inner.check_open()?;
        let logical = {
            let state = self.inner.state.lock().await;
            state.index.find_by_timestamp(timestamp)
        };
        let Some(logical) = logical else {
            return Ok(MessageCursor::empty(Arc::clone(&self.inner)));
        };
        let Some((logical, segment)) = self.inner.segment_for_cursor(logical).await? else {
            return Ok(MessageCursor::empty(Arc::clone(&self.inner)));
        };
        let inner = SegmentCursor::at_timestamp(&segment, timestamp).await?;
        Ok(MessageCursor::positioned(
            Arc::clone(&self.inner),
            logical,
            inner,
        ))
    }

    /// Total on-disk size of the ring in bytes.
    pub async fn size(&self) -> Result<u64> {
        self.inner.check_open()?;
        let state = self.inner.state.lock().await;
        Ok(self.inner.size_locked(&state))
    }

    /// Number of messages currently in the buffer.
    pub async fn message_count(&self) -> Result<u64> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.index.is_empty() {
            return Ok(0);
        }
        self.inner.ensure_current(&mut state)?;
        let mut count = match &state.current {
            Some(current) => current.message_count() as u64,
            None => 0,
        };
        let last = state.index.last_logical().unwrap_or_default();
        for logical in state.index.head_logical()..last {
            if let Some((_, _, sealed)) = state.index.entry(logical) {
                count += sealed as u64;
            }
        }
        Ok(count)
    }

    /// Number of segment files in the ring window.
    pub async fn file_count(&self) -> usize {
        self.inner.state.lock().await.index.len()
    }

    /// Timestamp of the oldest message, or `None` when empty.
    pub async fn oldest_message_time(&self) -> Result<Option<i64>> {
        self.inner.check_open()?;
        let state = self.inner.state.lock().await;
        Ok(state
            .index
            .entry(state.index.head_logical())
            .map(|(_, ts, _)| ts))
    }

    /// Id the next appended message will get.
    pub async fn next_message_id(&self) -> Result<u64> {
        self.inner.next_message_id().await
    }

    /// Id of the oldest message still in the ring (the value appends start
    /// from while the buffer is empty).
    pub async fn first_message_id(&self) -> Result<u64> {
        self.inner.check_open()?;
        let state = self.inner.state.lock().await;
        Ok(state
            .index
            .entry(state.index.head_logical())
            .map(|(id, _, _)| id)
            .unwrap_or(state.first_message_id))
    }

    /// Choose the id of the first message. Only valid while the buffer is
    /// empty.
    pub async fn set_first_message_id(&self, first_message_id: u64) -> Result<()> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if !state.index.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot set the first message id of a non-empty buffer".to_string(),
            ));
        }
        state.first_message_id = first_message_id;
        Ok(())
    }

    /// Change the ring cap at runtime and reclaim immediately if the
    /// buffer now exceeds it.
    pub async fn set_max_size(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("invalid max_size 0".to_string()));
        }
        self.inner.check_open()?;
        {
            let mut state = self.inner.state.lock().await;
            if state.max_size == bytes {
                return Ok(());
            }
            state.max_size = bytes;
        }
        if let Some(executor) = &self.inner.executor {
            let inner = Arc::clone(&self.inner);
            executor.spawn(async move {
                if let Err(error) = inner.cleanup_inner().await {
                    error!(error = %error, "background cleanup failed");
                }
            });
            Ok(())
        } else {
            self.inner.cleanup_inner().await
        }
    }

    /// Histogram of the ring: one entry per segment (the last carrying the
    /// active segment's live count) plus a trailing sentinel with the next
    /// message id and most recent timestamp. `None` when empty.
    pub async fn timeline(&self) -> Result<Option<Timeline>> {
        self.inner.check_open()?;
        let mut state = self.inner.state.lock().await;
        if state.index.is_empty() {
            return Ok(None);
        }
        self.inner.ensure_current(&mut state)?;

        let head = state.index.head_logical();
        let last = state.index.last_logical().unwrap_or(head);
        let mut ids = Vec::with_capacity(state.index.len() + 1);
        let mut timestamps = Vec::with_capacity(state.index.len() + 1);
        let mut counts = Vec::with_capacity(state.index.len() + 1);
        for logical in head..=last {
            if let Some((id, ts, count)) = state.index.entry(logical) {
                ids.push(id);
                timestamps.push(ts);
                counts.push(count);
            }
        }
        if let Some(current) = &state.current {
            if let Some(active) = counts.last_mut() {
                *active = current.message_count();
            }
            ids.push(current.next_message_id());
            let recent = current.most_recent_timestamp();
            let sentinel_ts = if recent == 0 {
                timestamps.last().copied().unwrap_or_default()
            } else {
                recent
            };
            timestamps.push(sentinel_ts);
            counts.push(0);
        }
        Ok(Some(Timeline::from_parts(ids, timestamps, counts)))
    }

    /// Fine-grained timeline of the segment holding `message_id`, or
    /// `None` when the buffer is empty.
    pub async fn timeline_for(&self, message_id: u64) -> Result<Option<Timeline>> {
        let Some(logical) = self.inner.find_segment(message_id).await? else {
            return Ok(None);
        };
        let Some((_, segment)) = self.inner.segment_for_cursor(logical).await? else {
            return Ok(None);
        };
        Ok(Some(segment.timeline().await?))
    }

    /// Close the buffer: cancel the auto-sync task, checkpoint and release
    /// the active segment, deregister from the shutdown registry, and wake
    /// every blocked cursor. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Directory this buffer stores its segments in.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("dir", &self.inner.dir)
            .field("open", &self.is_open())
            .finish()
    }
}

impl BufferInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn create_first_segment(&self, state: &mut BufferState, timestamp: i64) -> Result<()> {
        let first_id = state.first_message_id;
        let segment = SegmentFile::create(
            self.dir.join(index::file_name(first_id, timestamp, 0)),
            first_id,
            self.config.effective_segment_length(),
        )?;
        state.index.push(first_id, timestamp);
        state.current = Some(segment);
        Ok(())
    }

    /// Reopen the last segment for append continuation after the buffer
    /// was closed and reopened. Called with the buffer lock held.
    fn ensure_current(&self, state: &mut BufferState) -> Result<()> {
        if state.current.is_some() {
            return Ok(());
        }
        let Some(last) = state.index.last_logical() else {
            return Ok(());
        };
        let (first_id, _, _) = state
            .index
            .entry(last)
            .ok_or_else(|| Error::InvalidSegment("last segment missing from index".to_string()))?;
        let name = state
            .index
            .file_name_at(last)
            .ok_or_else(|| Error::InvalidSegment("last segment missing from index".to_string()))?;
        let segment = SegmentFile::open_append(
            self.dir.join(name),
            first_id,
            self.config.effective_segment_length(),
        )?;
        state.current = Some(segment);
        Ok(())
    }

    pub(crate) async fn sync_inner(&self) -> Result<()> {
        let current = self.state.lock().await.current.clone();
        if let Some(current) = current {
            current.checkpoint(true).await?;
        }
        Ok(())
    }

    pub(crate) async fn cleanup_inner(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.cleanup_locked(&mut state)
    }

    /// Delete the oldest segments while the ring exceeds its cap. The
    /// active segment is never deleted. Called with the buffer lock held.
    fn cleanup_locked(&self, state: &mut BufferState) -> Result<()> {
        loop {
            if self.is_closed() {
                return Ok(());
            }
            if state.max_size == 0
                || self.size_locked(state) <= state.max_size
                || state.index.len() < 2
            {
                return Ok(());
            }
            let Some((first_id, first_ts, count)) = state.index.drop_head() else {
                return Ok(());
            };
            let doomed = self.dir.join(index::file_name(first_id, first_ts, count));
            std::fs::remove_file(&doomed)?;
            debug!(path = %doomed.display(), "reclaimed oldest segment");
        }
    }

    fn size_locked(&self, state: &BufferState) -> u64 {
        let segments = state.index.len() as u64;
        if segments == 0 {
            return 0;
        }
        let head = state.index.head_logical();
        let first = state.index.entry(head).map(|(id, _, _)| id).unwrap_or(0);
        let last = state
            .index
            .last_logical()
            .and_then(|l| state.index.entry(l))
            .map(|(id, _, _)| id)
            .unwrap_or(first);
        let active = match &state.current {
            Some(current) => current.length(),
            None => state.last_file_length,
        };
        (segments - 1) * FILE_HEADER_SIZE + (last - first) + active
    }

    pub(crate) async fn next_message_id(&self) -> Result<u64> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        if state.index.is_empty() {
            return Ok(state.first_message_id);
        }
        self.ensure_current(&mut state)?;
        match &state.current {
            Some(current) => Ok(current.next_message_id()),
            None => Ok(state.first_message_id),
        }
    }

    /// Logical number of the segment covering `message_id`, or `None`
    /// when the buffer is empty. Rejects ids past the end of the buffer.
    async fn find_segment(&self, message_id: u64) -> Result<Option<u64>> {
        let next = self.next_message_id().await?;
        if message_id > next {
            return Err(Error::InvalidArgument(format!(
                "message id {message_id} is past the end of the buffer ({next})"
            )));
        }
        let state = self.state.lock().await;
        Ok(state.index.find_by_id(message_id))
    }

    /// Segment handle for a cursor: the shared active handle when
    /// `logical` is the last segment, otherwise an independent read-only
    /// handle. Requests below the ring window clamp forward to the head;
    /// requests past the tail return `None`.
    pub(crate) async fn segment_for_cursor(
        &self,
        logical: u64,
    ) -> Result<Option<(u64, Arc<SegmentFile>)>> {
        let mut state = self.state.lock().await;
        self.check_open()?;
        let Some(last) = state.index.last_logical() else {
            return Ok(None);
        };
        let logical = logical.max(state.index.head_logical());
        if logical > last {
            return Ok(None);
        }
        if logical == last {
            self.ensure_current(&mut state)?;
            let current = state
                .current
                .clone()
                .ok_or_else(|| Error::InvalidSegment("active segment missing".to_string()))?;
            return Ok(Some((logical, current)));
        }
        let (first_id, _, count) = state
            .index
            .entry(logical)
            .ok_or_else(|| Error::InvalidSegment("segment missing from index".to_string()))?;
        let name = state
            .index
            .file_name_at(logical)
            .ok_or_else(|| Error::InvalidSegment("segment missing from index".to_string()))?;
        let segment = SegmentFile::open_read(self.dir.join(name), first_id, count)?;
        Ok(Some((logical, segment)))
    }

    /// Whether `segment` is the one currently accepting appends.
    pub(crate) async fn is_current_segment(&self, segment: &Arc<SegmentFile>) -> bool {
        let state = self.state.lock().await;
        state
            .current
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, segment))
    }

    pub(crate) async fn add_waiter(&self, notify: &Arc<Notify>) {
        let mut state = self.state.lock().await;
        for slot in state.waiters.iter_mut() {
            if slot.is_none() {
                *slot = Some(Arc::clone(notify));
                return;
            }
        }
        state.waiters.push(Some(Arc::clone(notify)));
    }

    pub(crate) async fn remove_waiter(&self, notify: &Arc<Notify>) {
        let mut state = self.state.lock().await;
        for slot in state.waiters.iter_mut() {
            if slot.as_ref().is_some_and(|n| Arc::ptr_eq(n, notify)) {
                *slot = None;
                return;
            }
        }
    }

    pub(crate) async fn close(&self) -> Result<()> {
        let (waiters, close_result) = {
            let mut state = self.state.lock().await;
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            if let Some(task) = state.sync_task.take() {
                task.abort();
            }
            let close_result = match state.current.take() {
                Some(current) => {
                    state.last_file_length = current.length();
                    current.close().await
                }
                None => Ok(()),
            };
            if let Some(registration) = state.registration.take() {
                shutdown::unregister(registration);
            }
            (snapshot_waiters(&state), close_result)
        };

        // wake blocked cursors so they observe the closed flag
        for waiter in waiters {
            waiter.notify_one();
        }

        info!(dir = %self.dir.display(), "closed message buffer");
        close_result
    }
}

fn snapshot_waiters(state: &BufferState) -> Vec<Arc<Notify>> {
    state.waiters.iter().flatten().cloned().collect()
}
