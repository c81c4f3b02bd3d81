//! Queue lifecycle, storage and delivery (§3, §4.8). Grounded on
//! `examples/original_source/Shared/MessageQueue/MessageQueue.cpp`'s `QueueData`/`SendMessage`/
//! `ReceiveMessage`/`RejectMessage` (FIFO + priority storage, pending-ack table, sliding-window
//! timestamp deques, latency ring), re-expressed with Rust ownership: the queue exclusively owns
//! its messages behind a `Mutex`, and blocking receive is `Condvar::wait_timeout_while` rather than
//! a `shared_mutex` + `wait_until` pair (std's `RwLock` has no wait/notify primitive, so the
//! "reader-writer lock" of §5 is realized here as a `Mutex` + `Condvar`, consistent with every
//! other per-queue access being a full read-modify-write anyway).

use crate::message::{DeadLetterReason, Message, MessageId, Priority, Status};
use serde_derive::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum QueueType {
    Standard,
    Priority,
    DeadLetter,
    Delay,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PersistenceMode {
    Memory,
    Disk,
    DiskAndMemory,
}

impl PersistenceMode {
    pub fn persists(self) -> bool {
        !matches!(self, PersistenceMode::Memory)
    }
}

/// Base delay, backoff multiplier, cap and retry budget (§3 Queue, §8 retry schedule property).
/// `max_retries` is the count of *additional* attempts after the first delivery, pinned per the
/// Open Question decision in DESIGN.md: `retry_count < max_retries` is the retry-eligibility test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy { base_delay_ms: 1000, backoff_multiplier: 2.0, max_delay_ms: 60_000, max_retries: 3 }
    }
}

impl RetryPolicy {
    /// The k-th retry delay: `min(base_delay * multiplier^k, max_delay)` (§8).
    pub fn delay_for(&self, retry_count: u32) -> u64 {
        let scaled = self.base_delay_ms as f64 * self.backoff_multiplier.powi(retry_count as i32);
        (scaled.min(self.max_delay_ms as f64)).round() as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub queue_type: QueueType,
    pub persistence_mode: PersistenceMode,
    pub max_count: u64,
    pub max_bytes: u64,
    pub default_ttl_ms: u64,
    pub retry_policy: RetryPolicy,
    pub dead_letter_enabled: bool,
    pub enable_priority: bool,
    pub auto_ack: bool,
    pub latency_capacity: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            name: name.into(),
            queue_type: QueueType::Standard,
            persistence_mode: PersistenceMode::Memory,
            max_count: 10_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl_ms: 0,
            retry_policy: RetryPolicy::default(),
            dead_letter_enabled: true,
            enable_priority: false,
            auto_ack: false,
            latency_capacity: 1024,
        }
    }

    /// Per-message size budget derived from the queue's count/byte caps (§4.8 send validation).
    pub fn max_message_bytes(&self) -> u64 {
        if self.max_count == 0 {
            self.max_bytes
        } else {
            self.max_bytes / self.max_count
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub created_at_ms: u64,
    pub total_messages: u64,
    pub processed_messages: u64,
    pub dead_letter_messages: u64,
    pub retried_messages: u64,
    pub expired_messages: u64,
    pub rejected_messages: u64,
    /// Supplemented per SPEC_FULL.md §1.2: cumulative compression byte accounting.
    pub compressed_count: u64,
    pub original_bytes_total: u64,
    pub compressed_bytes_total: u64,
}

impl QueueStats {
    /// Running compression ratio (compressed/original), 1.0 when nothing has been compressed yet.
    pub fn compression_ratio(&self) -> f64 {
        if self.original_bytes_total == 0 {
            1.0
        } else {
            self.compressed_bytes_total as f64 / self.original_bytes_total as f64
        }
    }
}

struct PriorityEntry {
    priority: Priority,
    seq: u64,
    message: Message,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    /// Higher priority sorts greater (dequeues first); among equal priorities, the earlier
    /// arrival (smaller `seq`) sorts greater, giving FIFO tie-break out of a max-heap (§8).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of a single dequeue attempt (§4.8 receive). `Expired`/`Delivered` carry the message
/// back to the caller; the queue's own lock is always released by the time either reaches the
/// broker, so the broker is free to take the DLQ's lock without violating the ordering rule in §5.
pub enum DequeueOutcome {
    Delivered(Message),
    Expired(Message),
    RetryNotDue,
    Empty,
}

struct QueueState {
    ready: VecDeque<Message>,
    priority_ready: BinaryHeap<PriorityEntry>,
    pending_ack: HashMap<MessageId, Message>,
    dead_letter_fifo: VecDeque<Message>,
    stats: QueueStats,
    enqueue_timestamps: VecDeque<u64>,
    dequeue_timestamps: VecDeque<u64>,
    latency_samples: VecDeque<f64>,
    latency_capacity: usize,
    arrival_seq: u64,
}

impl QueueState {
    fn ready_len(&self) -> usize {
        self.ready.len() + self.priority_ready.len()
    }

    fn is_empty(&self) -> bool {
        self.ready_len() == 0
    }

    fn record_latency(&mut self, sample_ms: f64) {
        if self.latency_samples.len() >= self.latency_capacity {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(sample_ms);
    }
}

pub struct Queue {
    pub config: Mutex<QueueConfig>,
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

impl Queue {
    pub fn new(config: QueueConfig) -> Queue {
        let latency_capacity = config.latency_capacity;
        Queue {
            config: Mutex::new(config),
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                priority_ready: BinaryHeap::new(),
                pending_ack: HashMap::new(),
                dead_letter_fifo: VecDeque::new(),
                stats: QueueStats { created_at_ms: flux::time::timestamp_millis(), ..Default::default() },
                enqueue_timestamps: VecDeque::new(),
                dequeue_timestamps: VecDeque::new(),
                latency_samples: VecDeque::new(),
                latency_capacity,
                arrival_seq: 0,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn name(&self) -> String {
        self.config.lock().unwrap().name.clone()
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().ready_len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.state.lock().unwrap().pending_ack.len()
    }

    /// `pending_count` per the §8 invariant: `|ready| + |pending_ack| = pending_count`.
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.ready_len() + state.pending_ack.len()
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().unwrap().stats.clone()
    }

    pub fn is_priority(&self) -> bool {
        self.config.lock().unwrap().enable_priority
    }

    /// Appends a validated, id-assigned message to ready storage and wakes one waiter. Capacity
    /// and per-message size checks happen in the broker before this is called (§4.8).
    pub fn enqueue(&self, mut message: Message) {
        let now = flux::time::timestamp_millis();
        message.status = Status::Sent;
        let mut state = self.state.lock().unwrap();
        let priority = message.priority;
        let is_priority = self.config.lock().unwrap().enable_priority;
        state.stats.total_messages += 1;
        state.enqueue_timestamps.push_back(now);
        if is_priority {
            let seq = state.arrival_seq;
            state.arrival_seq += 1;
            state.priority_ready.push(PriorityEntry { priority, seq, message });
        } else {
            state.ready.push_back(message);
        }
        drop(state);
        self.not_empty.notify_one();
    }

    /// Re-inserts a message at the front of ready storage, preserving FIFO order, used for the
    /// retry-not-due putback path and for `requeue_dead_letter_message`.
    fn requeue_front(&self, state: &mut QueueState, message: Message, is_priority: bool) {
        if is_priority {
            let seq = state.arrival_seq;
            state.arrival_seq += 1;
            state.priority_ready.push(PriorityEntry { priority: message.priority, seq, message });
        } else {
            state.ready.push_front(message);
        }
    }

    /// Blocking receive with an optional timeout (`None` = wait forever, `Some(Duration::ZERO)` =
    /// non-blocking poll). Mirrors `ReceiveMessage`'s condition-variable wait, but returns an
    /// enum so the broker can perform cross-queue effects (DLQ move) outside this lock (§5).
    pub fn receive(&self, timeout: Option<Duration>, shutting_down: &AtomicBool) -> DequeueOutcome {
        let mut state = self.state.lock().unwrap();

        if state.is_empty() {
            match timeout {
                Some(d) if d.is_zero() => return DequeueOutcome::Empty,
                Some(d) => {
                    let (guard, _timeout_result) = self
                        .not_empty
                        .wait_timeout_while(state, d, |s| s.is_empty() && !shutting_down.load(AtomicOrdering::SeqCst))
                        .unwrap();
                    state = guard;
                }
                None => {
                    state = self
                        .not_empty
                        .wait_while(state, |s| s.is_empty() && !shutting_down.load(AtomicOrdering::SeqCst))
                        .unwrap();
                }
            }
            if state.is_empty() {
                return DequeueOutcome::Empty;
            }
        }

        let is_priority = self.config.lock().unwrap().enable_priority;
        let next = if is_priority {
            state.priority_ready.pop().map(|entry| entry.message)
        } else {
            state.ready.pop_front()
        };

        let mut message = match next {
            Some(message) => message,
            None => return DequeueOutcome::Empty,
        };

        let now = flux::time::timestamp_millis();
        state.dequeue_timestamps.push_back(now);

        if message.is_expired(now) {
            return DequeueOutcome::Expired(message);
        }

        if !message.is_retry_due(now) {
            self.requeue_front(&mut state, message, is_priority);
            return DequeueOutcome::RetryNotDue;
        }

        message.status = Status::Delivered;
        let auto_ack = self.config.lock().unwrap().auto_ack;
        if !auto_ack {
            state.pending_ack.insert(message.id, message.clone());
        }
        DequeueOutcome::Delivered(message)
    }

    /// Removes `id` from the pending-ack table and samples processing latency (§4.8 acknowledge).
    pub fn acknowledge(&self, id: MessageId) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        let message = state.pending_ack.remove(&id)?;
        state.stats.processed_messages += 1;
        let now = flux::time::timestamp_millis();
        let latency = (now.saturating_sub(message.created_at_ms)) as f64;
        state.record_latency(latency);
        Some(message)
    }

    pub fn peek_pending(&self, id: MessageId) -> Option<Message> {
        self.state.lock().unwrap().pending_ack.get(&id).cloned()
    }

    /// Removes `id` from the pending-ack table without sampling success latency, used by reject.
    pub fn take_pending(&self, id: MessageId) -> Option<Message> {
        self.state.lock().unwrap().pending_ack.remove(&id)
    }

    /// Computes the next retry delay and requeues `message`, incrementing its retry counters.
    /// Returns the updated message so the caller can log/inspect it.
    pub fn schedule_retry(&self, mut message: Message, retry_policy: &RetryPolicy) -> Message {
        let now = flux::time::timestamp_millis();
        let delay = retry_policy.delay_for(message.retry_count);
        message.next_retry_at_ms = now + delay;
        message.retry_count += 1;
        message.status = Status::Pending;

        let mut state = self.state.lock().unwrap();
        state.stats.retried_messages += 1;
        let is_priority = self.config.lock().unwrap().enable_priority;
        self.requeue_front(&mut state, message.clone(), is_priority);
        drop(state);
        self.not_empty.notify_one();
        message
    }

    /// Marks stats for a message that is leaving this queue for a DLQ (§4.9, reason-specific
    /// counters), without touching ready/pending storage — the message itself is appended to the
    /// DLQ's own `dead_letter_fifo` by the broker after this queue's lock is released.
    pub fn record_dead_letter(&self, reason: DeadLetterReason) {
        let mut state = self.state.lock().unwrap();
        state.stats.dead_letter_messages += 1;
        match reason {
            DeadLetterReason::Expired => state.stats.expired_messages += 1,
            DeadLetterReason::MaxRetriesExceeded => state.stats.retried_messages += 1,
            DeadLetterReason::Rejected => state.stats.rejected_messages += 1,
            _ => {}
        }
    }

    /// Appends to this queue's dead-letter FIFO (only meaningful when this `Queue` is itself a
    /// `_DLQ`) and bumps its own total/pending counters.
    pub fn push_dead_letter(&self, message: Message) {
        let mut state = self.state.lock().unwrap();
        state.stats.total_messages += 1;
        state.dead_letter_fifo.push_back(message);
    }

    pub fn drain_dead_letters(&self, max: usize) -> Vec<Message> {
        let mut state = self.state.lock().unwrap();
        let n = max.min(state.dead_letter_fifo.len());
        state.dead_letter_fifo.drain(..n).collect()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.state.lock().unwrap().dead_letter_fifo.len()
    }

    /// Locates and removes a message by id from the dead-letter FIFO, used by
    /// `requeue_dead_letter_message` (§4.9).
    pub fn take_dead_letter(&self, id: MessageId) -> Option<Message> {
        let mut state = self.state.lock().unwrap();
        let pos = state.dead_letter_fifo.iter().position(|m| m.id == id)?;
        state.dead_letter_fifo.remove(pos)
    }

    pub fn purge(&self) {
        let mut state = self.state.lock().unwrap();
        state.ready.clear();
        state.priority_ready.clear();
        state.pending_ack.clear();
        state.dead_letter_fifo.clear();
    }

    /// Wakes every blocked receiver, used before queue deletion and on broker shutdown (§4.8).
    pub fn wake_all(&self) {
        self.not_empty.notify_all();
    }

    pub fn record_compression_sample(&self, original_len: usize, compressed_len: usize) {
        let mut state = self.state.lock().unwrap();
        state.stats.compressed_count += 1;
        state.stats.original_bytes_total += original_len as u64;
        state.stats.compressed_bytes_total += compressed_len as u64;
    }

    /// Trims both timestamp deques to `window_ms` and returns (enqueue_rate, dequeue_rate,
    /// p50_latency, p95_latency) for a metrics snapshot (§4.13).
    pub fn windowed_metrics(&self, now_ms: u64, window_ms: u64) -> (f64, f64, f64, f64) {
        let mut state = self.state.lock().unwrap();
        crate::metrics::trim_old(&mut state.enqueue_timestamps, now_ms, window_ms);
        crate::metrics::trim_old(&mut state.dequeue_timestamps, now_ms, window_ms);
        let enqueue_rate = crate::metrics::rate_per_sec(state.enqueue_timestamps.len(), window_ms);
        let dequeue_rate = crate::metrics::rate_per_sec(state.dequeue_timestamps.len(), window_ms);
        let samples: Vec<f64> = state.latency_samples.iter().copied().collect();
        let (p50, p95) = crate::metrics::percentiles(&samples);
        (enqueue_rate, dequeue_rate, p50, p95)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use std::sync::atomic::AtomicBool;

    fn msg(id: MessageId, priority: Priority) -> Message {
        let mut m = Message::new(id, "test", Payload::owned(vec![1, 2, 3]));
        m.priority = priority;
        m
    }

    #[test]
    fn fifo_order_is_preserved() {
        let queue = Queue::new(QueueConfig::new("q"));
        queue.enqueue(msg(1, Priority::Normal));
        queue.enqueue(msg(2, Priority::Normal));
        let shutting_down = AtomicBool::new(false);
        match queue.receive(Some(Duration::ZERO), &shutting_down) {
            DequeueOutcome::Delivered(m) => assert_eq!(m.id, 1),
            _ => panic!("expected delivery"),
        }
        match queue.receive(Some(Duration::ZERO), &shutting_down) {
            DequeueOutcome::Delivered(m) => assert_eq!(m.id, 2),
            _ => panic!("expected delivery"),
        }
    }

    #[test]
    fn priority_order_with_arrival_tiebreak() {
        let mut config = QueueConfig::new("q");
        config.enable_priority = true;
        let queue = Queue::new(config);
        queue.enqueue(msg(1, Priority::Low));
        queue.enqueue(msg(2, Priority::Normal));
        queue.enqueue(msg(3, Priority::High));
        queue.enqueue(msg(4, Priority::Normal));
        queue.enqueue(msg(5, Priority::Critical));

        let shutting_down = AtomicBool::new(false);
        let mut order = Vec::new();
        for _ in 0..5 {
            if let DequeueOutcome::Delivered(m) = queue.receive(Some(Duration::ZERO), &shutting_down) {
                order.push(m.id);
            }
        }
        assert_eq!(order, vec![5, 3, 2, 4, 1]);
    }

    #[test]
    fn pending_ack_invariant_holds_across_receive_and_ack() {
        let queue = Queue::new(QueueConfig::new("q"));
        queue.enqueue(msg(1, Priority::Normal));
        assert_eq!(queue.pending_count(), 1);

        let shutting_down = AtomicBool::new(false);
        let delivered = match queue.receive(Some(Duration::ZERO), &shutting_down) {
            DequeueOutcome::Delivered(m) => m,
            _ => panic!("expected delivery"),
        };
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.pending_ack_count(), 1);

        queue.acknowledge(delivered.id);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn retry_delay_matches_exponential_backoff_with_cap() {
        let policy = RetryPolicy { base_delay_ms: 10, backoff_multiplier: 2.0, max_delay_ms: 100, max_retries: 5 };
        assert_eq!(policy.delay_for(0), 10);
        assert_eq!(policy.delay_for(1), 20);
        assert_eq!(policy.delay_for(2), 40);
        assert_eq!(policy.delay_for(10), 100);
    }

    #[test]
    fn empty_queue_with_zero_timeout_returns_immediately() {
        let queue = Queue::new(QueueConfig::new("q"));
        let shutting_down = AtomicBool::new(false);
        assert!(matches!(queue.receive(Some(Duration::ZERO), &shutting_down), DequeueOutcome::Empty));
    }
}
