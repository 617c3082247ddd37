//! Message Record Type
//!
//! A message is the unit of data in a spoolhouse buffer.
//!
//! ## Structure
//!
//! - **id**: unique, strictly increasing across the whole buffer. The id is
//!   the byte offset of the message's encoded record from the start of the
//!   buffer's logical stream, which lets the buffer compute sizes and do
//!   positioning without scanning segment contents.
//! - **timestamp**: milliseconds since the epoch, supplied by the producer.
//! - **routing_key**: UTF-8 string, possibly empty. Consumers use it to
//!   filter or dispatch; the buffer itself never interprets it.
//! - **payload**: arbitrary bytes.
//!
//! ## Design Decisions
//!
//! - Uses `bytes::Bytes` for the payload so cursors can hand out slices of
//!   a read buffer without copying.
//! - Implements `Serialize`/`Deserialize` so callers can ship messages over
//!   APIs or dump them for debugging.
//! - The timestamp is `i64` (not `u64`): producers may replay historical
//!   feeds with pre-epoch timestamps.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single message in the spool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Id of this message; also its byte offset in the buffer's logical stream.
    pub id: u64,

    /// Timestamp in milliseconds since epoch.
    pub timestamp: i64,

    /// Routing key, possibly empty.
    pub routing_key: String,

    /// Payload bytes.
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: u64, timestamp: i64, routing_key: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id,
            timestamp,
            routing_key: routing_key.into(),
            payload,
        }
    }

    /// Size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Estimate the in-memory size of this message in bytes.
    pub fn estimated_size(&self) -> usize {
        8 + // id
        8 + // timestamp
        self.routing_key.len() +
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------

    #[test]
    fn test_new() {
        let msg = Message::new(42, 1_700_000_000_000, "orders", Bytes::from("hello"));
        assert_eq!(msg.id, 42);
        assert_eq!(msg.timestamp, 1_700_000_000_000);
        assert_eq!(msg.routing_key, "orders");
        assert_eq!(msg.payload, Bytes::from("hello"));
    }

    #[test]
    fn test_new_empty_routing_key() {
        let msg = Message::new(0, 0, "", Bytes::from("payload"));
        assert!(msg.routing_key.is_empty());
        assert_eq!(msg.payload_size(), 7);
    }

    #[test]
    fn test_new_empty_payload() {
        let msg = Message::new(1, 1, "k", Bytes::new());
        assert_eq!(msg.payload_size(), 0);
    }

    #[test]
    fn test_negative_timestamp() {
        let msg = Message::new(0, -1000, "", Bytes::from("x"));
        assert_eq!(msg.timestamp, -1000);
    }

    // ---------------------------------------------------------------
    // estimated_size
    // ---------------------------------------------------------------

    #[test]
    fn test_estimated_size() {
        let msg = Message::new(0, 0, "abc", Bytes::from("12345"));
        // 8 + 8 + 3 + 5 = 24
        assert_eq!(msg.estimated_size(), 24);
    }

    #[test]
    fn test_estimated_size_empty() {
        let msg = Message::new(0, 0, "", Bytes::new());
        assert_eq!(msg.estimated_size(), 16);
    }

    // ---------------------------------------------------------------
    // Serde round-trip
    // ---------------------------------------------------------------

    #[test]
    fn test_serde_roundtrip() {
        let msg = Message::new(
            100,
            1_700_000_000_000,
            "user-123",
            Bytes::from(r#"{"action":"click"}"#),
        );
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(msg, back);
    }

    #[test]
    fn test_serde_roundtrip_binary_payload() {
        let msg = Message::new(10, 20, "", Bytes::from(vec![0u8, 1, 2, 255, 254]));
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(msg, back);
    }

    #[test]
    fn test_serde_roundtrip_negative_timestamp() {
        let msg = Message::new(0, -42, "k", Bytes::from("v"));
        let json = serde_json::to_string(&msg).expect("serialize");
        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.timestamp, -42);
    }
}
