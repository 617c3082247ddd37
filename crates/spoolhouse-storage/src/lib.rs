//! Spoolhouse Storage Layer
//!
//! A disk-backed message spool: producers append `(timestamp, routing
//! key, payload)` records, consumers stream them back with forward
//! cursors that can tail the buffer. Messages live in segment files in
//! one directory, and the directory behaves as a bounded ring: once total
//! size exceeds the configured cap, the oldest segments are reclaimed.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Producers  │
//! └──────┬──────┘
//!        │ append(ts, key, payload) -> id
//!        ▼
//! ┌──────────────────────┐     full      ┌──────────────────────┐
//! │    MessageBuffer     │ ────────────► │ seal + open successor│
//! │ directory index      │               │ reclaim oldest files │
//! │ active SegmentFile   │               └──────────────────────┘
//! └──────┬───────────────┘
//!        │ cursor(id) / cursor_by_timestamp(ts)
//!        ▼
//! ┌──────────────────────┐
//! │    MessageCursor     │  next() / next_timeout()
//! └──────┬───────────────┘
//!        ▼
//! ┌─────────────┐
//! │  Consumers  │
//! └─────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### MessageBuffer
//! The facade: appends, statistics (`size`, `message_count`, `timeline`),
//! cursor creation, sync policy, close.
//!
//! ### MessageCursor
//! Forward iteration across segment boundaries, positioning by id or
//! timestamp, and blocking tail reads with a timeout.
//!
//! ### Segment files
//! CRC-framed records in files named
//! `<first_id:016x>-<first_ts:016x>-<count>.qdb`; the active segment ends
//! in `-0.qdb` and is renamed with its final count when it fills up.
//!
//! ## Usage
//!
//! ```ignore
//! use spoolhouse_storage::{BufferConfig, MessageBuffer};
//!
//! let buffer = MessageBuffer::open("/var/spool/events", BufferConfig::default()).await?;
//!
//! let id = buffer.append(now_ms(), "orders", b"order-created").await?;
//!
//! let mut cursor = buffer.cursor(0).await?;
//! while cursor.next_timeout(Some(Duration::from_secs(5))).await? {
//!     handle(cursor.routing_key()?, cursor.payload()?);
//! }
//!
//! buffer.close().await?;
//! ```

pub mod buffer;
pub mod config;
pub mod cursor;
pub mod error;
pub(crate) mod index;
pub mod segment;
pub mod shutdown;

pub use buffer::MessageBuffer;
pub use config::BufferConfig;
pub use cursor::MessageCursor;
pub use error::{Error, Result};
pub use segment::FILE_HEADER_SIZE;

pub use spoolhouse_core::{Message, Timeline};
