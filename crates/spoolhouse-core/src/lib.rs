//! Core types shared across the spoolhouse crates.
//!
//! This crate is intentionally small: it holds the data types that cross
//! crate boundaries and nothing that touches the filesystem.
//!
//! - [`Message`]: a single spooled record
//! - [`Timeline`]: a histogram-style view of the segments in a buffer

pub mod message;
pub mod timeline;

pub use message::Message;
pub use timeline::Timeline;
