//! Multi-operation transactions (§3, §4.11). Grounded on `MessageQueue::BeginTransaction`/
//! `CommitTransaction`/`RollbackTransaction`/`AddTransactionOperation`/
//! `ExecuteTransactionOperation`. Execution of individual operations is left to the broker (it
//! owns the queue registry); this module owns transaction bookkeeping, status transitions and
//! statistics only.

use crate::message::Message;
use crate::queue::QueueConfig;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub type TransactionId = u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone)]
pub enum TransactionOperation {
    Send { queue: String, message: Message },
    Acknowledge { queue: String, message_id: u64 },
    Reject { queue: String, message_id: u64, requeue: bool },
    CreateQueue { config: QueueConfig },
    DeleteQueue { queue: String },
}

pub struct Transaction {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub description: String,
    pub timeout_ms: u64,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub operations: Vec<TransactionOperation>,
    pub distributed: bool,
    pub coordinator_id: Option<String>,
}

impl Transaction {
    fn new(id: TransactionId, description: String, timeout_ms: u64) -> Transaction {
        Transaction {
            id,
            status: TransactionStatus::Pending,
            description,
            timeout_ms,
            start_time_ms: flux::time::timestamp_millis(),
            end_time_ms: None,
            operations: Vec::new(),
            distributed: false,
            coordinator_id: None,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.status == TransactionStatus::Pending && self.start_time_ms + self.timeout_ms < now_ms
    }
}

#[derive(Debug, Default, Clone)]
pub struct TransactionStats {
    pub committed: u64,
    pub rolled_back: u64,
    pub timed_out: u64,
    pub failed: u64,
    /// Exponential moving averages (§4.11), alpha = 0.2.
    pub avg_commit_duration_ms: f64,
    pub avg_rollback_duration_ms: f64,
}

const EMA_ALPHA: f64 = 0.2;

pub struct TransactionManager {
    next_id: AtomicU64,
    transactions: Mutex<HashMap<TransactionId, Transaction>>,
    stats: Mutex<TransactionStats>,
}

impl TransactionManager {
    pub fn new() -> TransactionManager {
        TransactionManager {
            next_id: AtomicU64::new(1),
            transactions: Mutex::new(HashMap::new()),
            stats: Mutex::new(TransactionStats::default()),
        }
    }

    pub fn begin(&self, description: impl Into<String>, timeout_ms: u64) -> TransactionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transaction = Transaction::new(id, description.into(), timeout_ms);
        self.transactions.lock().unwrap().insert(id, transaction);
        id
    }

    pub fn begin_distributed(&self, coordinator_id: impl Into<String>, description: impl Into<String>, timeout_ms: u64) -> TransactionId {
        let id = self.begin(description, timeout_ms);
        let mut transactions = self.transactions.lock().unwrap();
        if let Some(transaction) = transactions.get_mut(&id) {
            transaction.distributed = true;
            transaction.coordinator_id = Some(coordinator_id.into());
        }
        id
    }

    /// Appends `operation` while the transaction is pending; `Err(())` signals invalid-state or
    /// not-found, which the broker maps to `BrokerError::InvalidState`/`TransactionNotFound`.
    pub fn add_operation(&self, id: TransactionId, operation: TransactionOperation) -> Result<(), TransactionError> {
        let mut transactions = self.transactions.lock().unwrap();
        let transaction = transactions.get_mut(&id).ok_or(TransactionError::NotFound)?;
        if transaction.status != TransactionStatus::Pending {
            return Err(TransactionError::InvalidState);
        }
        transaction.operations.push(operation);
        Ok(())
    }

    /// Validates every queued operation's pre-conditions for distributed two-phase commit
    /// (§4.11 `prepare_transaction`). This single-participant model treats "prepared" as "every
    /// operation still structurally valid" — no separate lock is taken on target queues here.
    pub fn prepare(&self, id: TransactionId) -> Result<(), TransactionError> {
        let transactions = self.transactions.lock().unwrap();
        let transaction = transactions.get(&id).ok_or(TransactionError::NotFound)?;
        if transaction.status != TransactionStatus::Pending {
            return Err(TransactionError::InvalidState);
        }
        Ok(())
    }

    /// Takes the transaction's operations out for the broker to execute, without mutating status
    /// yet — the broker calls `finish` with the outcome once it has run them.
    pub fn take_for_commit(&self, id: TransactionId) -> Result<Vec<TransactionOperation>, TransactionError> {
        let transactions = self.transactions.lock().unwrap();
        let transaction = transactions.get(&id).ok_or(TransactionError::NotFound)?;
        if transaction.status != TransactionStatus::Pending {
            return Err(TransactionError::InvalidState);
        }
        Ok(transaction.operations.clone())
    }

    /// Records the outcome of executing a transaction's operations: `Ok(())` moves it to
    /// `Committed`; `Err(_)` moves it to `Failed` (the first failing operation's error, per §4.11).
    pub fn finish_commit(&self, id: TransactionId, outcome: Result<(), String>) {
        let mut transactions = self.transactions.lock().unwrap();
        let now = flux::time::timestamp_millis();
        if let Some(transaction) = transactions.get_mut(&id) {
            if transaction.status != TransactionStatus::Pending {
                return;
            }
            let duration = (now.saturating_sub(transaction.start_time_ms)) as f64;
            transaction.end_time_ms = Some(now);
            transaction.status = if outcome.is_ok() { TransactionStatus::Committed } else { TransactionStatus::Failed };
            drop(transactions);
            let mut stats = self.stats.lock().unwrap();
            if outcome.is_ok() {
                stats.committed += 1;
                stats.avg_commit_duration_ms = ema(stats.avg_commit_duration_ms, duration, stats.committed);
            } else {
                stats.failed += 1;
            }
        }
    }

    pub fn rollback(&self, id: TransactionId, _reason: &str) -> Result<(), TransactionError> {
        let mut transactions = self.transactions.lock().unwrap();
        let transaction = transactions.get_mut(&id).ok_or(TransactionError::NotFound)?;
        if transaction.status != TransactionStatus::Pending {
            return Err(TransactionError::InvalidState);
        }
        let now = flux::time::timestamp_millis();
        let duration = (now.saturating_sub(transaction.start_time_ms)) as f64;
        transaction.end_time_ms = Some(now);
        transaction.status = TransactionStatus::RolledBack;
        drop(transactions);
        let mut stats = self.stats.lock().unwrap();
        stats.rolled_back += 1;
        stats.avg_rollback_duration_ms = ema(stats.avg_rollback_duration_ms, duration, stats.rolled_back);
        Ok(())
    }

    /// Moves every pending transaction whose deadline has passed to `TimedOut`, returning their
    /// ids so the broker can invoke the timeout handler for each (§4.11 background sweep).
    pub fn sweep_timeouts(&self, now_ms: u64) -> Vec<TransactionId> {
        let mut transactions = self.transactions.lock().unwrap();
        let mut timed_out = Vec::new();
        for transaction in transactions.values_mut() {
            if transaction.is_expired(now_ms) {
                transaction.status = TransactionStatus::TimedOut;
                transaction.end_time_ms = Some(now_ms);
                timed_out.push(transaction.id);
            }
        }
        drop(transactions);
        if !timed_out.is_empty() {
            let mut stats = self.stats.lock().unwrap();
            stats.timed_out += timed_out.len() as u64;
        }
        timed_out
    }

    pub fn status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.transactions.lock().unwrap().get(&id).map(|t| t.status)
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats.lock().unwrap().clone()
    }
}

fn ema(previous: f64, sample: f64, count: u64) -> f64 {
    if count <= 1 {
        sample
    } else {
        EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * previous
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionError {
    NotFound,
    InvalidState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_leaves_pending_at_most_once() {
        let manager = TransactionManager::new();
        let id = manager.begin("test", 10_000);
        assert_eq!(manager.status(id), Some(TransactionStatus::Pending));
        manager.finish_commit(id, Ok(()));
        assert_eq!(manager.status(id), Some(TransactionStatus::Committed));
        // A second finish must not move it again.
        manager.finish_commit(id, Err("late".into()));
        assert_eq!(manager.status(id), Some(TransactionStatus::Committed));
    }

    #[test]
    fn operations_rejected_once_no_longer_pending() {
        let manager = TransactionManager::new();
        let id = manager.begin("test", 10_000);
        manager.finish_commit(id, Ok(()));
        let result = manager.add_operation(id, TransactionOperation::DeleteQueue { queue: "q".into() });
        assert_eq!(result, Err(TransactionError::InvalidState));
    }

    #[test]
    fn sweep_moves_expired_pending_transactions_to_timed_out() {
        let manager = TransactionManager::new();
        let id = manager.begin("test", 10);
        let timed_out = manager.sweep_timeouts(flux::time::timestamp_millis() + 1_000);
        assert_eq!(timed_out, vec![id]);
        assert_eq!(manager.status(id), Some(TransactionStatus::TimedOut));
    }
}
