//! Message data model (§3). Ownership follows the rewrite note in SPEC_FULL.md §9: the broker
//! owns every `Message` it holds outright (`HashMap`/`Vec` plus a stable id, no shared-pointer
//! cycles); a zero-copy payload carries an explicit owned/external tag instead of a bare pointer.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

pub type MessageId = u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Priority {
        Priority::Normal
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    FireAndForget,
    AtLeastOnce,
    ExactlyOnceIntent,
}

impl Default for DeliveryMode {
    fn default() -> DeliveryMode {
        DeliveryMode::AtLeastOnce
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Status {
    Pending,
    Sent,
    Delivered,
    Acknowledged,
    DeadLetter,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DeadLetterReason {
    Expired,
    MaxRetriesExceeded,
    Rejected,
    QueueFull,
    Unknown,
}

/// A message payload. `External` never copies the referenced bytes; it is the producer's
/// responsibility to keep the buffer alive for as long as the broker may read it (see
/// `send_message_zero_copy` in `queue.rs`).
pub enum Payload {
    Owned(Vec<u8>),
    External {
        data: *const u8,
        len: usize,
        dealloc: Option<Box<dyn FnOnce() + Send>>,
    },
}

// `External` carries a raw pointer because it is, by design, a non-owning view into a caller's
// buffer; the caller guarantees it outlives every operation the broker performs on it, which is
// exactly the safety condition `Send` already requires callers to uphold elsewhere in this crate.
unsafe impl Send for Payload {}

impl Payload {
    pub fn owned(data: Vec<u8>) -> Payload {
        Payload::Owned(data)
    }

    /// Constructs a non-owning buffer descriptor over `data`. `data` must remain valid until the
    /// message is no longer referenced by the broker (enqueue, in-memory delivery, and any
    /// persistence call all read through this pointer without copying per the zero-copy contract).
    pub fn external(data: &[u8]) -> Payload {
        Payload::External { data: data.as_ptr(), len: data.len(), dealloc: None }
    }

    pub fn external_with_dealloc(data: &[u8], dealloc: Box<dyn FnOnce() + Send>) -> Payload {
        Payload::External { data: data.as_ptr(), len: data.len(), dealloc: Some(dealloc) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Owned(bytes) => bytes.as_slice(),
            Payload::External { data, len, .. } => unsafe { std::slice::from_raw_parts(*data, *len) },
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materializes an owned copy, used by the persistence collaborator (the one place the
    /// zero-copy contract allows a copy) and by compression/encryption in-place transforms.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Payload::External { dealloc, .. } = self {
            if let Some(dealloc) = dealloc.take() {
                dealloc();
            }
        }
    }
}

impl Clone for Payload {
    fn clone(&self) -> Payload {
        // Cloning always yields an owned copy; only the original producer's handle is allowed to
        // be external, so clones (e.g. taken for a retry/requeue path) can't outlive the source
        // buffer by accident.
        Payload::Owned(self.to_vec())
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub message_type: String,
    pub priority: Priority,
    pub delivery_mode: DeliveryMode,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at_ms: u64,
    pub status: Status,
    pub properties: HashMap<String, String>,
    pub payload: Payload,
    pub dead_letter_reason: Option<DeadLetterReason>,
    pub original_queue: Option<String>,
}

impl Message {
    pub fn new(id: MessageId, message_type: impl Into<String>, payload: Payload) -> Message {
        Message {
            id,
            message_type: message_type.into(),
            priority: Priority::default(),
            delivery_mode: DeliveryMode::default(),
            created_at_ms: flux::time::timestamp_millis(),
            expires_at_ms: 0,
            retry_count: 0,
            max_retries: 0,
            next_retry_at_ms: 0,
            status: Status::Pending,
            properties: HashMap::new(),
            payload,
            dead_letter_reason: None,
            original_queue: None,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms > 0 && now_ms > self.expires_at_ms
    }

    pub fn is_retry_due(&self, now_ms: u64) -> bool {
        self.next_retry_at_ms == 0 || now_ms >= self.next_retry_at_ms
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_payload_reads_through_to_source_buffer() {
        let source = vec![1u8, 2, 3, 4];
        let payload = Payload::external(&source);
        assert_eq!(payload.as_bytes(), &source[..]);
    }

    #[test]
    fn cloning_external_payload_yields_owned_copy() {
        let source = vec![9u8, 8, 7];
        let payload = Payload::external(&source);
        let cloned = payload.clone();
        assert!(matches!(cloned, Payload::Owned(_)));
        assert_eq!(cloned.as_bytes(), &source[..]);
    }

    #[test]
    fn expiry_and_retry_due_checks() {
        let msg = Message::new(1, "test", Payload::owned(vec![0]));
        assert!(!msg.is_expired(msg.created_at_ms + 1));
        assert!(msg.is_retry_due(msg.created_at_ms));
    }
}
