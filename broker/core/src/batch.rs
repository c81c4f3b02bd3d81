//! Message batching (§3, §4.12). Grounded on `MessageQueue::CreateBatch`/`AddToBatch`/
//! `CommitBatch`/`ProcessBatchExpiration`. A batch is a buffer of messages accumulated client-side
//! of a single `commit`; it is not itself a queue and holds no delivery state.

use crate::message::Message;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub type BatchId = u64;

pub struct Batch {
    pub id: BatchId,
    /// `None` for an unassociated batch (Open Question decision in DESIGN.md: each message
    /// added to an unassociated batch must carry its own target queue name as a property;
    /// `add_to_batch` enforces that at the broker layer).
    pub queue: Option<String>,
    pub messages: Vec<Message>,
    pub created_at_ms: u64,
    pub expire_at_ms: u64,
    pub finalized: bool,
}

pub struct BatchManager {
    next_id: AtomicU64,
    batches: Mutex<HashMap<BatchId, Batch>>,
    committed: Mutex<HashSet<BatchId>>,
}

impl BatchManager {
    pub fn new() -> BatchManager {
        BatchManager {
            next_id: AtomicU64::new(1),
            batches: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashSet::new()),
        }
    }

    pub fn create_batch(&self, queue: Option<String>, ttl_ms: u64) -> BatchId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = flux::time::timestamp_millis();
        let batch = Batch {
            id,
            queue,
            messages: Vec::new(),
            created_at_ms: now,
            expire_at_ms: if ttl_ms == 0 { 0 } else { now + ttl_ms },
            finalized: false,
        };
        self.batches.lock().unwrap().insert(id, batch);
        id
    }

    /// Appends `message` to a still-open batch. Rejects messages with no target once the batch
    /// itself has no associated queue and the message carries no `queue` property, per the
    /// unassociated-batch decision recorded in DESIGN.md.
    pub fn add_to_batch(&self, id: BatchId, message: Message) -> Result<(), BatchError> {
        let mut batches = self.batches.lock().unwrap();
        let batch = batches.get_mut(&id).ok_or(BatchError::NotFound)?;
        if batch.finalized {
            return Err(BatchError::AlreadyCommitted);
        }
        if batch.queue.is_none() && message.property("queue").is_none() {
            return Err(BatchError::NoTargetQueue);
        }
        batch.messages.push(message);
        Ok(())
    }

    /// Finalizes a batch and hands its messages back to the caller for dispatch (one `send` per
    /// message, against `batch.queue` or each message's own `queue` property). Idempotent: a
    /// second `commit_batch` on an already-committed id returns an empty vec rather than erroring,
    /// matching `CommitBatch`'s "already finalized" short-circuit.
    pub fn commit_batch(&self, id: BatchId) -> Result<(Option<String>, Vec<Message>), BatchError> {
        let mut committed = self.committed.lock().unwrap();
        if committed.contains(&id) {
            return Ok((None, Vec::new()));
        }
        let mut batches = self.batches.lock().unwrap();
        let batch = batches.get_mut(&id).ok_or(BatchError::NotFound)?;
        batch.finalized = true;
        let messages = std::mem::take(&mut batch.messages);
        let queue = batch.queue.clone();
        committed.insert(id);
        Ok((queue, messages))
    }

    pub fn batch_len(&self, id: BatchId) -> Option<usize> {
        self.batches.lock().unwrap().get(&id).map(|b| b.messages.len())
    }

    /// Drops batches that expired without being committed, returning their ids for logging
    /// (§4.12 `ProcessBatchExpiration` background sweep).
    pub fn sweep_expired(&self, now_ms: u64) -> Vec<BatchId> {
        let mut batches = self.batches.lock().unwrap();
        let expired: Vec<BatchId> = batches
            .values()
            .filter(|b| !b.finalized && b.expire_at_ms != 0 && b.expire_at_ms < now_ms)
            .map(|b| b.id)
            .collect();
        for id in &expired {
            batches.remove(id);
        }
        expired
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BatchError {
    NotFound,
    AlreadyCommitted,
    NoTargetQueue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn msg(id: u64) -> Message {
        Message::new(id, "test", Payload::owned(vec![1]))
    }

    #[test]
    fn unassociated_batch_rejects_messages_with_no_queue_property() {
        let manager = BatchManager::new();
        let id = manager.create_batch(None, 0);
        let result = manager.add_to_batch(id, msg(1));
        assert_eq!(result, Err(BatchError::NoTargetQueue));
    }

    #[test]
    fn unassociated_batch_accepts_messages_with_queue_property() {
        let manager = BatchManager::new();
        let id = manager.create_batch(None, 0);
        let mut message = msg(1);
        message.set_property("queue", "orders");
        assert!(manager.add_to_batch(id, message).is_ok());
        assert_eq!(manager.batch_len(id), Some(1));
    }

    #[test]
    fn commit_batch_is_idempotent() {
        let manager = BatchManager::new();
        let id = manager.create_batch(Some("orders".into()), 0);
        manager.add_to_batch(id, msg(1)).unwrap();
        let (queue, messages) = manager.commit_batch(id).unwrap();
        assert_eq!(queue.as_deref(), Some("orders"));
        assert_eq!(messages.len(), 1);

        let (queue_again, messages_again) = manager.commit_batch(id).unwrap();
        assert_eq!(queue_again, None);
        assert!(messages_again.is_empty());
    }

    #[test]
    fn sweep_drops_expired_uncommitted_batches() {
        let manager = BatchManager::new();
        let id = manager.create_batch(Some("orders".into()), 1);
        let expired = manager.sweep_expired(flux::time::timestamp_millis() + 1_000);
        assert_eq!(expired, vec![id]);
        assert_eq!(manager.batch_len(id), None);
    }
}
