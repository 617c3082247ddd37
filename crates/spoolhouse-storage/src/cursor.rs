//! Buffer Cursor
//!
//! Forward iteration over the whole buffer, across segment boundaries,
//! with optional tail-following.
//!
//! ## Walking Segments
//!
//! A cursor holds the logical number of the segment it is on, a shared
//! handle on that segment, and an intra-segment cursor. When the segment
//! is exhausted the cursor either stops (if the segment is the active one;
//! that is the wait point) or closes its handles and opens the next
//! segment. A cursor created on an empty buffer adopts the first segment
//! once the buffer grows.
//!
//! ## Blocking Reads
//!
//! `next_timeout` registers the cursor in the buffer's waiter list, then
//! alternates non-blocking `next` attempts with parking on the cursor's
//! own notifier. Producers snapshot the waiter list under the buffer lock
//! and signal each notifier after releasing it, so the cursor-side lock
//! order (cursor first, buffer second) never deadlocks against the
//! producer side. A buffer `close()` signals every registered waiter and
//! the woken call surfaces [`Error::Interrupted`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use spoolhouse_core::Message;

use crate::buffer::BufferInner;
use crate::error::{Error, Result};
use crate::segment::SegmentCursor;

/// Forward cursor over the messages of a buffer.
///
/// Obtained from [`MessageBuffer::cursor`](crate::MessageBuffer::cursor)
/// or [`MessageBuffer::cursor_by_timestamp`](crate::MessageBuffer::cursor_by_timestamp).
pub struct MessageCursor {
    buffer: Arc<BufferInner>,
    position: Option<Position>,
    notify: Arc<Notify>,
    closed: bool,
}

struct Position {
    /// Logical segment number within the buffer's directory index.
    file_index: u64,
    inner: SegmentCursor,
}

impl MessageCursor {
    pub(crate) fn positioned(
        buffer: Arc<BufferInner>,
        file_index: u64,
        inner: SegmentCursor,
    ) -> Self {
        Self {
            buffer,
            position: Some(Position { file_index, inner }),
            notify: Arc::new(Notify::new()),
            closed: false,
        }
    }

    /// Cursor over a buffer that had no messages at creation time; it
    /// adopts the head segment on the first `next` after the buffer grows.
    pub(crate) fn empty(buffer: Arc<BufferInner>) -> Self {
        Self {
            buffer,
            position: None,
            notify: Arc::new(Notify::new()),
            closed: false,
        }
    }

    /// Advance to the next message or return `false` if there is none yet.
    /// Calling again after `false` is fine: once a producer appends, the
    /// next call returns `true`.
    pub async fn next(&mut self) -> Result<bool> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.buffer.check_open()?;

        if self.position.is_none() {
            // empty at creation; try to adopt the first segment
            let Some((file_index, segment)) = self.buffer.segment_for_cursor(0).await? else {
                return Ok(false);
            };
            let inner = SegmentCursor::at_id(&segment, segment.first_id()).await?;
            self.position = Some(Position { file_index, inner });
        }

        loop {
            let position = self
                .position
                .as_mut()
                .ok_or(Error::Closed)?;
            if position.inner.next()? {
                return Ok(true);
            }
            if self.buffer.is_current_segment(position.inner.segment()).await {
                // the wait point: producers will signal registered waiters
                return Ok(false);
            }

            // this segment is sealed and exhausted; move to the next one,
            // clamping forward if the ring already reclaimed it
            let target = position.file_index + 1;
            let Some((file_index, segment)) = self.buffer.segment_for_cursor(target).await? else {
                return Ok(false);
            };
            let inner = SegmentCursor::at_id(&segment, segment.first_id()).await?;
            self.position = Some(Position { file_index, inner });
        }
    }

    /// Advance to the next message, waiting for a producer if the buffer
    /// is exhausted. `None` waits indefinitely. Returns `false` on
    /// timeout; surfaces [`Error::Interrupted`] if the buffer closes while
    /// waiting.
    pub async fn next_timeout(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.buffer.add_waiter(&self.notify).await;
        let result = self.next_or_wait(timeout).await;
        self.buffer.remove_waiter(&self.notify).await;
        result
    }

    async fn next_or_wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let notify = Arc::clone(&self.notify);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.closed {
                return Err(Error::Closed);
            }
            if self.buffer.is_closed() {
                return Err(Error::Interrupted);
            }

            // arm the notifier before the check so an append that lands in
            // between still wakes the wait below
            let notified = notify.notified();
            if self.next().await? {
                return Ok(true);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        // timed out; one final attempt
                        return self.next().await;
                    }
                }
            }
        }
    }

    /// The message the last successful `next` landed on.
    pub fn message(&self) -> Result<&Message> {
        self.position
            .as_ref()
            .and_then(|p| p.inner.current())
            .ok_or_else(|| {
                Error::InvalidArgument("cursor has no current message".to_string())
            })
    }

    /// Id of the current message.
    pub fn id(&self) -> Result<u64> {
        Ok(self.message()?.id)
    }

    /// Timestamp of the current message.
    pub fn timestamp(&self) -> Result<i64> {
        Ok(self.message()?.timestamp)
    }

    /// Routing key of the current message.
    pub fn routing_key(&self) -> Result<&str> {
        Ok(&self.message()?.routing_key)
    }

    /// Payload size in bytes of the current message.
    pub fn payload_size(&self) -> Result<usize> {
        Ok(self.message()?.payload.len())
    }

    /// Payload of the current message (cheap clone of shared bytes).
    pub fn payload(&self) -> Result<Bytes> {
        Ok(self.message()?.payload.clone())
    }

    /// Release the cursor's segment handles. Any concurrent
    /// `next_timeout` on a clone of the buffer observes the closure.
    pub fn close(&mut self) {
        self.closed = true;
        self.position = None;
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for MessageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCursor")
            .field("closed", &self.closed)
            .field(
                "file_index",
                &self.position.as_ref().map(|p| p.file_index),
            )
            .finish()
    }
}
