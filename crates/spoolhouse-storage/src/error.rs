//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### I/O Errors
//! - `Io`: a filesystem operation failed (create, rename, unlink, read,
//!   write, fsync)
//!
//! ### Lifecycle Errors
//! - `Closed`: operation invoked after `close()` or on a closed cursor
//! - `Interrupted`: a blocking `next` was woken by close
//!
//! ### Validation Errors
//! - `InvalidArgument`: bad configuration value, id past the end of the
//!   buffer, `set_first_message_id` on a non-empty buffer, routing key too
//!   long
//! - `Oversize`: payload exceeds the configured maximum
//! - `CorruptName`: a `.qdb` file name in the buffer directory does not
//!   parse
//!
//! ### Data Integrity Errors
//! - `CrcMismatch`: record checksum failure on read
//! - `InvalidSegment`: malformed segment header or frame
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("buffer or cursor has been closed")]
    Closed,

    #[error("blocked cursor was interrupted by close")]
    Interrupted,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid segment file name: {0}")]
    CorruptName(String),

    #[error("payload size {size} exceeds max payload size {max}")]
    Oversize { size: usize, max: usize },

    #[error("CRC mismatch at record offset {offset}")]
    CrcMismatch { offset: u64 },

    #[error("invalid segment: {0}")]
    InvalidSegment(String),
}
