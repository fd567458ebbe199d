//! Raw transport message.
//!
//! The connection task hands frames downstream as opaque bytes; nothing in
//! the transport layer interprets payloads. `Bytes` keeps the hot path
//! copy-free — cloning a [`RawMessage`] is a refcount bump, not a memcpy.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One frame received from the subscription, stamped at ingest.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The frame bytes exactly as received.
    pub payload: Bytes,
    /// Local wall clock when the frame was read off the socket.
    pub received_at: DateTime<Utc>,
    /// Id of the subscription session the frame arrived on. Shared, not
    /// copied — every frame of a session points at the same allocation.
    pub subscription_id: Arc<str>,
}

impl RawMessage {
    /// Stamp a payload with the current wall clock and session id.
    pub fn new(payload: impl Into<Bytes>, subscription_id: Arc<str>) -> Self {
        Self {
            payload: payload.into(),
            received_at: Utc::now(),
            subscription_id,
        }
    }

    /// Payload as a string slice, if valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn shares_payload_allocation_on_clone() {
        let session: Arc<str> = Arc::from("sub-1");
        let msg = RawMessage::new(Bytes::from(vec![1u8; 4096]), session);
        let cloned = msg.clone();
        assert_eq!(msg.payload.as_ptr(), cloned.payload.as_ptr());
        assert_eq!(&*cloned.subscription_id, "sub-1");
    }

    #[test]
    fn payload_str_rejects_invalid_utf8() {
        let msg = RawMessage::new(Bytes::from_static(&[0xFF, 0xFE]), Arc::from("s"));
        assert!(msg.payload_str().is_none());
    }
}
