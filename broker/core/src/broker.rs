//! Top-level broker: owns every queue, topic and piece of cluster/transaction/batch state, and
//! drives the background threads described in §5 (scheduler, DLQ monitor, metrics monitor,
//! heartbeat, transaction-timeout sweeper, alert monitor). Grounded on `MessageQueue`'s
//! constructor/`Initialize`/`Shutdown`/`SendMessage`/`ReceiveMessage`/`ProcessScheduledMessages`/
//! `ProcessHeartbeat`/`ProcessMetricsMonitoring` — one C++ god-object's responsibilities split
//! across the collaborators in this crate, tied back together here.

use crate::batch::BatchManager;
use crate::cluster::{Cluster, FailoverHandler, LeaderChangeHandler, Shard};
use crate::compression::{self, CompressionConfig};
use crate::dlq::{self, DeadLetterAlert, DeadLetterMonitor, DeadLetterSample};
use crate::encryption::{self, EncryptionConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::message::{DeadLetterReason, Message, MessageId, Status};
use crate::metrics::{ClusterMetricsSnapshot, QueueMetricsSnapshot};
use crate::persistence::Persistence;
use crate::queue::{DequeueOutcome, Queue, QueueConfig};
use crate::topic::{SubscriberHandler, Topic};
use crate::transaction::{TransactionError, TransactionId, TransactionManager, TransactionOperation};
use flux::logging::{self, Logger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

pub type EventHandler = Box<dyn Fn(&str, &Message) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(BrokerError, &str) + Send + Sync>;
pub type AlertHandler = Box<dyn Fn(&DeadLetterAlert) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    event: Option<EventHandler>,
    error: Option<ErrorHandler>,
    alert: Option<AlertHandler>,
    leader_change: Option<LeaderChangeHandler>,
    failover: Option<FailoverHandler>,
}

/// The subset of configuration §6 allows mutating at runtime via `set_global_config`; the rest of
/// `BrokerConfig` (listen address, max clients) is fixed for the broker's lifetime.
struct RuntimeConfig {
    metrics_interval_ms: u64,
    metrics_window_ms: u64,
    metrics_latency_capacity: usize,
}

struct ScheduledMessage {
    id: u64,
    queue: String,
    message: Message,
    execute_at_ms: u64,
    recurring: bool,
    interval_ms: u64,
    remaining_count: u32,
}

/// A mutex+condvar pair shared by every background thread; shutdown flips it once and every
/// thread's wait wakes immediately (§5 "stop flag observed under a mutex").
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn new() -> StopSignal {
        StopSignal { stopped: Mutex::new(false), condvar: Condvar::new() }
    }

    /// Waits up to `timeout` or until stopped; returns true if the stop signal fired.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap();
        let (guard, _) = self.condvar.wait_timeout_while(guard, timeout, |stopped| !*stopped).unwrap();
        *guard
    }

    fn signal(&self) {
        *self.stopped.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

struct Inner {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    cluster: RwLock<Cluster>,
    transactions: TransactionManager,
    batches: BatchManager,
    dlq_monitor: DeadLetterMonitor,
    persistence: Option<Box<dyn Persistence>>,
    compression_configs: Mutex<HashMap<String, CompressionConfig>>,
    encryption_configs: Mutex<HashMap<String, EncryptionConfig>>,
    handlers: Mutex<Handlers>,
    runtime_config: RwLock<RuntimeConfig>,
    scheduled: Mutex<Vec<ScheduledMessage>>,
    next_message_id: AtomicU64,
    next_scheduled_id: AtomicU64,
    stop: StopSignal,
    shutting_down: AtomicBool,
    logger: Logger,
}

pub struct Broker {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: &crate::config::BrokerConfig, persistence: Option<Box<dyn Persistence>>, logger: Logger) -> Broker {
        let cluster = Cluster::new(config.cluster.shard_vnodes, config.cluster.heartbeat_flap_prob, config.cluster.min_replication_acks);
        let inner = Arc::new(Inner {
            queues: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
            cluster: RwLock::new(cluster),
            transactions: TransactionManager::new(),
            batches: BatchManager::new(),
            dlq_monitor: DeadLetterMonitor::new(),
            persistence,
            compression_configs: Mutex::new(HashMap::new()),
            encryption_configs: Mutex::new(HashMap::new()),
            handlers: Mutex::new(Handlers::default()),
            runtime_config: RwLock::new(RuntimeConfig {
                metrics_interval_ms: config.metrics.interval_ms,
                metrics_window_ms: config.metrics.window_ms,
                metrics_latency_capacity: config.metrics.latency_capacity,
            }),
            scheduled: Mutex::new(Vec::new()),
            next_message_id: AtomicU64::new(1),
            next_scheduled_id: AtomicU64::new(1),
            stop: StopSignal::new(),
            shutting_down: AtomicBool::new(false),
            logger,
        });
        {
            let mut cluster = inner.cluster.write().unwrap();
            cluster.set_shards(
                (0..config.cluster.shards.max(1))
                    .map(|i| Shard { id: i, replicas: Vec::new() })
                    .collect(),
            );
        }
        Broker { inner, threads: Mutex::new(Vec::new()) }
    }

    /// Opens the persistence collaborator (if any) and spawns the six background threads.
    /// Recovery from disk, when a persistence collaborator is configured, happens here: every
    /// queue `list_persisted_queues` names is recreated and its messages reloaded in stored order.
    pub fn start(&self) -> BrokerResult<()> {
        if let Some(store) = &self.inner.persistence {
            store.initialize()?;
            for name in store.list_persisted_queues()? {
                let (config, _stats) = store.load_queue(&name)?;
                let queue = Arc::new(Queue::new(config));
                for message in store.load_all_messages(&name)? {
                    queue.enqueue(message);
                }
                self.inner.queues.write().unwrap().insert(name, queue);
            }
        }

        let mut threads = self.threads.lock().unwrap();
        threads.push(spawn_loop(self.inner.clone(), Duration::from_millis(100), run_scheduler_tick));
        threads.push(spawn_loop(self.inner.clone(), Duration::from_secs(1), run_dlq_monitor_tick));
        threads.push(spawn_loop(self.inner.clone(), Duration::from_secs(1), run_metrics_monitor_tick));
        threads.push(spawn_loop(self.inner.clone(), Duration::from_millis(200), run_heartbeat_tick));
        threads.push(spawn_loop(self.inner.clone(), Duration::from_secs(1), run_transaction_sweep_tick));
        threads.push(spawn_loop(self.inner.clone(), Duration::from_secs(1), run_alert_monitor_tick));
        logging::info!(self.inner.logger, "broker started"; "background_threads" => threads.len());
        Ok(())
    }

    /// Signals every background thread to stop, joins them, wakes any blocked `receive_message`
    /// caller, and flushes persistent state if a collaborator is configured.
    pub fn shutdown(&self) -> BrokerResult<()> {
        self.inner.stop.signal();
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        for queue in self.inner.queues.read().unwrap().values() {
            queue.wake_all();
        }
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(store) = &self.inner.persistence {
            for (name, queue) in self.inner.queues.read().unwrap().iter() {
                store.save_queue(name, &queue.config.lock().unwrap(), &queue.stats())?;
            }
            store.shutdown()?;
        }
        logging::info!(self.inner.logger, "broker shut down");
        Ok(())
    }

    // -- Queue management (§4.8) --------------------------------------------------------------

    pub fn create_queue(&self, config: QueueConfig) -> BrokerResult<()> {
        let mut queues = self.inner.queues.write().unwrap();
        if queues.contains_key(&config.name) {
            return Err(BrokerError::AlreadyInitialized);
        }
        let name = config.name.clone();
        let dlq_config = {
            let mut dlq_config = QueueConfig::new(dlq::dead_letter_queue_name(&name));
            dlq_config.queue_type = crate::queue::QueueType::DeadLetter;
            dlq_config.dead_letter_enabled = false;
            dlq_config.persistence_mode = crate::queue::PersistenceMode::Disk;
            dlq_config.max_count = config.max_count * 2;
            dlq_config.max_bytes = config.max_bytes * 2;
            dlq_config.default_ttl_ms = 86_400_000;
            dlq_config
        };
        queues.insert(name.clone(), Arc::new(Queue::new(config)));
        queues.entry(dlq_config.name.clone()).or_insert_with(|| Arc::new(Queue::new(dlq_config)));
        Ok(())
    }

    pub fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        let mut queues = self.inner.queues.write().unwrap();
        let queue = queues.remove(name).ok_or(BrokerError::QueueNotFound)?;
        queue.wake_all();
        queues.remove(&dlq::dead_letter_queue_name(name));
        Ok(())
    }

    pub fn purge_queue(&self, name: &str) -> BrokerResult<()> {
        self.queue(name)?.purge();
        Ok(())
    }

    pub fn queue_stats(&self, name: &str) -> BrokerResult<crate::queue::QueueStats> {
        Ok(self.queue(name)?.stats())
    }

    fn queue(&self, name: &str) -> BrokerResult<Arc<Queue>> {
        self.inner.queues.read().unwrap().get(name).cloned().ok_or(BrokerError::QueueNotFound)
    }

    // -- Send / receive / acknowledge (§4.8) ---------------------------------------------------

    pub fn send_message(&self, queue_name: &str, mut message: Message) -> BrokerResult<MessageId> {
        let queue = self.queue(queue_name)?;
        let config = queue.config.lock().unwrap().clone();

        if message.id == 0 {
            message.id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        }
        if message.payload.is_empty() {
            return Err(BrokerError::InvalidArgument);
        }
        if message.payload.len() as u64 > config.max_message_bytes() {
            return Err(BrokerError::MessageTooLarge);
        }
        if queue.message_count() as u64 >= config.max_count {
            return Err(BrokerError::QueueFull);
        }
        if message.expires_at_ms == 0 && config.default_ttl_ms > 0 {
            message.expires_at_ms = message.created_at_ms + config.default_ttl_ms;
        }
        if message.max_retries == 0 {
            message.max_retries = config.retry_policy.max_retries;
        }

        self.apply_send_transforms(queue_name, &mut message)?;
        self.route_message(&mut message);

        if let Some(store) = &self.inner.persistence {
            if config.persistence_mode.persists() {
                store.save_message(queue_name, &message)?;
            }
        }

        let id = message.id;
        queue.enqueue(message);
        self.emit_event("message_sent", queue_name, id);
        Ok(id)
    }

    /// Zero-copy send path (§3, §4.8): the caller's buffer is referenced, not copied, until the
    /// message leaves the broker via persistence or compression/encryption (both of which must
    /// materialize an owned copy regardless).
    pub fn send_message_zero_copy(&self, queue_name: &str, message_type: &str, payload: &[u8]) -> BrokerResult<MessageId> {
        let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::new(id, message_type, crate::message::Payload::external(payload));
        self.send_message(queue_name, message)
    }

    pub fn receive_message(&self, queue_name: &str, timeout: Option<Duration>) -> BrokerResult<Option<Message>> {
        let queue = self.queue(queue_name)?;
        match queue.receive(timeout, &self.inner.shutting_down) {
            DequeueOutcome::Delivered(mut message) => {
                self.apply_receive_transforms(&mut message)?;
                self.emit_event("message_received", queue_name, message.id);
                Ok(Some(message))
            }
            DequeueOutcome::Expired(message) => {
                self.move_to_dead_letter(queue_name, message, DeadLetterReason::Expired)?;
                Ok(None)
            }
            DequeueOutcome::RetryNotDue | DequeueOutcome::Empty => Ok(None),
        }
    }

    pub fn acknowledge(&self, queue_name: &str, message_id: MessageId) -> BrokerResult<()> {
        let queue = self.queue(queue_name)?;
        queue.acknowledge(message_id).map(|_| ()).ok_or(BrokerError::MessageNotFound)
    }

    /// Rejects a delivered-but-unacknowledged message: retries it if under budget, else moves it
    /// to the dead-letter queue (§4.8/§4.9).
    pub fn reject(&self, queue_name: &str, message_id: MessageId, requeue: bool) -> BrokerResult<()> {
        let queue = self.queue(queue_name)?;
        let message = queue.take_pending(message_id).ok_or(BrokerError::MessageNotFound)?;

        if !requeue || message.retry_count >= message.max_retries {
            let reason = if message.retry_count >= message.max_retries { DeadLetterReason::MaxRetriesExceeded } else { DeadLetterReason::Rejected };
            self.move_to_dead_letter(queue_name, message, reason)?;
            return Ok(());
        }

        let policy = queue.config.lock().unwrap().retry_policy.clone();
        queue.schedule_retry(message, &policy);
        Ok(())
    }

    /// Moves `message` to `{queue}_DLQ`, dropping the source queue's reference before touching the
    /// DLQ (§5 deadlock-avoidance rule: no lock is held here across the move).
    fn move_to_dead_letter(&self, source_queue: &str, mut message: Message, reason: DeadLetterReason) -> BrokerResult<()> {
        {
            let source = self.queue(source_queue)?;
            source.record_dead_letter(reason);
        }
        message.status = Status::DeadLetter;
        message.dead_letter_reason = Some(reason);
        message.original_queue = Some(source_queue.to_string());

        let dlq_name = dlq::dead_letter_queue_name(source_queue);
        let dlq = self.queue(&dlq_name)?;
        dlq.push_dead_letter(message);
        Ok(())
    }

    pub fn dead_letter_messages(&self, source_queue: &str, max: usize) -> BrokerResult<Vec<Message>> {
        Ok(self.queue(&dlq::dead_letter_queue_name(source_queue))?.drain_dead_letters(max))
    }

    pub fn requeue_dead_letter_message(&self, source_queue: &str, message_id: MessageId) -> BrokerResult<()> {
        let dlq = self.queue(&dlq::dead_letter_queue_name(source_queue))?;
        let mut message = dlq.take_dead_letter(message_id).ok_or(BrokerError::MessageNotFound)?;
        message.status = Status::Pending;
        message.retry_count = 0;
        message.dead_letter_reason = None;
        let source = self.queue(source_queue)?;
        source.enqueue(message);
        Ok(())
    }

    pub fn purge_dead_letter_queue(&self, source_queue: &str) -> BrokerResult<()> {
        self.queue(&dlq::dead_letter_queue_name(source_queue))?.purge();
        Ok(())
    }

    pub fn set_dead_letter_alert_config(&self, queue_name: &str, config: dlq::DeadLetterAlertConfig) {
        self.inner.dlq_monitor.set_config(queue_name, config);
    }

    // -- Compression / encryption (§4.8, supplemented per §1.2) --------------------------------

    pub fn set_compression_config(&self, queue_name: impl Into<String>, config: CompressionConfig) {
        self.inner.compression_configs.lock().unwrap().insert(queue_name.into(), config);
    }

    pub fn set_encryption_config(&self, queue_name: impl Into<String>, config: EncryptionConfig) {
        self.inner.encryption_configs.lock().unwrap().insert(queue_name.into(), config);
    }

    fn apply_send_transforms(&self, queue_name: &str, message: &mut Message) -> BrokerResult<()> {
        if let Some(config) = self.inner.compression_configs.lock().unwrap().get(queue_name).cloned() {
            if config.auto_enable && message.payload.len() >= config.min_size {
                let original = message.payload.to_vec();
                let (compressed, _duration) = compression::compress(&original, config.level)?;
                let queue = self.queue(queue_name)?;
                queue.record_compression_sample(original.len(), compressed.len());
                message.payload = crate::message::Payload::owned(compressed);
                message.set_property("Compressed", "1");
                message.set_property("CompressionAlgorithm", "gzip");
            }
        }
        if let Some(config) = self.inner.encryption_configs.lock().unwrap().get(queue_name).cloned() {
            if config.auto_enable {
                let ciphertext = encryption::encrypt(&config, &message.payload.to_vec())?;
                message.payload = crate::message::Payload::owned(ciphertext);
                message.set_property("Encrypted", "1");
                message.set_property("EncryptionAlgorithm", config.algorithm.name());
                if config.algorithm == crate::encryption::EncryptionAlgorithm::Aes256Gcm {
                    message.set_property("GcmPacked", "nonce|ciphertext|tag");
                }
            }
        }
        Ok(())
    }

    fn apply_receive_transforms(&self, message: &mut Message) -> BrokerResult<()> {
        if message.property("Encrypted") == Some("1") {
            let algorithm_name = message.property("EncryptionAlgorithm").unwrap_or("").to_string();
            let config = self.encryption_config_for(&algorithm_name, message)?;
            let plaintext = encryption::decrypt(&config, &message.payload.to_vec())?;
            message.payload = crate::message::Payload::owned(plaintext);
            message.properties.remove("Encrypted");
            message.properties.remove("EncryptionAlgorithm");
            message.properties.remove("GcmPacked");
        } else if compression::looks_compressed(message.payload.as_bytes()) || message.property("Compressed") == Some("1") {
            if let Ok((decompressed, _duration)) = compression::decompress(&message.payload.to_vec()) {
                message.payload = crate::message::Payload::owned(decompressed);
                message.properties.remove("Compressed");
                message.properties.remove("CompressionAlgorithm");
            }
        }
        Ok(())
    }

    /// Resolves the decrypt-side config by algorithm name, falling back to any per-queue config
    /// matching the message's `original_queue` (the broker has no other way to recover which
    /// queue's key applies once the message is in flight outside its source queue's lock).
    fn encryption_config_for(&self, algorithm_name: &str, message: &Message) -> BrokerResult<EncryptionConfig> {
        let configs = self.inner.encryption_configs.lock().unwrap();
        if let Some(queue) = &message.original_queue {
            if let Some(config) = configs.get(queue) {
                return Ok(config.clone());
            }
        }
        configs
            .values()
            .find(|c| c.algorithm.name() == algorithm_name)
            .cloned()
            .ok_or(BrokerError::OperationFailed)
    }

    // -- Topics (§4.8 pub-sub) ------------------------------------------------------------------

    pub fn create_topic(&self, name: impl Into<String>) -> Arc<Topic> {
        let name = name.into();
        self.inner.topics.write().unwrap().entry(name.clone()).or_insert_with(|| Arc::new(Topic::new(name))).clone()
    }

    pub fn subscribe(&self, topic_name: &str, subscriber_id: impl Into<String>, handler: SubscriberHandler) -> BrokerResult<()> {
        let topic = self.create_topic(topic_name);
        topic.subscribe(subscriber_id, handler);
        Ok(())
    }

    pub fn publish(&self, topic_name: &str, message: &Message) -> BrokerResult<usize> {
        let topics = self.inner.topics.read().unwrap();
        let topic = topics.get(topic_name).ok_or(BrokerError::QueueNotFound)?;
        Ok(topic.publish(message))
    }

    // -- Scheduling (§4.8, `ScheduleMessage`) ---------------------------------------------------

    pub fn schedule_message(&self, queue_name: &str, message: Message, delay_ms: u64) -> u64 {
        let id = self.inner.next_scheduled_id.fetch_add(1, Ordering::Relaxed);
        let now = flux::time::timestamp_millis();
        self.inner.scheduled.lock().unwrap().push(ScheduledMessage {
            id,
            queue: queue_name.to_string(),
            message,
            execute_at_ms: now + delay_ms,
            recurring: false,
            interval_ms: 0,
            remaining_count: 1,
        });
        id
    }

    pub fn schedule_recurring_message(&self, queue_name: &str, message: Message, interval_ms: u64, count: u32) -> u64 {
        let id = self.inner.next_scheduled_id.fetch_add(1, Ordering::Relaxed);
        let now = flux::time::timestamp_millis();
        self.inner.scheduled.lock().unwrap().push(ScheduledMessage {
            id,
            queue: queue_name.to_string(),
            message,
            execute_at_ms: now + interval_ms,
            recurring: true,
            interval_ms,
            remaining_count: count,
        });
        id
    }

    pub fn cancel_scheduled_message(&self, id: u64) -> bool {
        let mut scheduled = self.inner.scheduled.lock().unwrap();
        let before = scheduled.len();
        scheduled.retain(|s| s.id != id);
        scheduled.len() != before
    }

    // -- Transactions (§4.11) --------------------------------------------------------------------

    pub fn begin_transaction(&self, description: impl Into<String>, timeout_ms: u64) -> TransactionId {
        self.inner.transactions.begin(description, timeout_ms)
    }

    pub fn add_transaction_operation(&self, id: TransactionId, operation: TransactionOperation) -> BrokerResult<()> {
        self.inner.transactions.add_operation(id, operation).map_err(map_transaction_error)
    }

    /// Executes every queued operation in order; stops at the first failure (§4.11) and marks the
    /// transaction `Failed` rather than partially committed.
    pub fn commit_transaction(&self, id: TransactionId) -> BrokerResult<()> {
        let operations = self.inner.transactions.take_for_commit(id).map_err(map_transaction_error)?;
        let mut outcome = Ok(());
        for operation in operations {
            if let Err(err) = self.execute_transaction_operation(operation) {
                outcome = Err(err.describe().to_string());
                break;
            }
        }
        self.inner.transactions.finish_commit(id, outcome.clone());
        outcome.map_err(|_| BrokerError::OperationFailed)
    }

    pub fn rollback_transaction(&self, id: TransactionId, reason: &str) -> BrokerResult<()> {
        self.inner.transactions.rollback(id, reason).map_err(map_transaction_error)
    }

    fn execute_transaction_operation(&self, operation: TransactionOperation) -> BrokerResult<()> {
        match operation {
            TransactionOperation::Send { queue, message } => self.send_message(&queue, message).map(|_| ()),
            TransactionOperation::Acknowledge { queue, message_id } => self.acknowledge(&queue, message_id),
            TransactionOperation::Reject { queue, message_id, requeue } => self.reject(&queue, message_id, requeue),
            TransactionOperation::CreateQueue { config } => self.create_queue(config),
            TransactionOperation::DeleteQueue { queue } => self.delete_queue(&queue),
        }
    }

    // -- Batching (§4.12) -------------------------------------------------------------------------

    pub fn create_batch(&self, queue: Option<String>, ttl_ms: u64) -> u64 {
        self.inner.batches.create_batch(queue, ttl_ms)
    }

    pub fn add_to_batch(&self, batch_id: u64, message: Message) -> BrokerResult<()> {
        self.inner.batches.add_to_batch(batch_id, message).map_err(|_| BrokerError::InvalidState)
    }

    /// Commits a batch and dispatches each of its messages via `send_message`, against the
    /// batch's own queue or (for an unassociated batch) each message's `queue` property.
    pub fn commit_batch(&self, batch_id: u64) -> BrokerResult<Vec<MessageId>> {
        let (queue, messages) = self.inner.batches.commit_batch(batch_id).map_err(|_| BrokerError::InvalidState)?;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let target = queue.clone().or_else(|| message.property("queue").map(|q| q.to_string())).ok_or(BrokerError::InvalidArgument)?;
            ids.push(self.send_message(&target, message)?);
        }
        Ok(ids)
    }

    // -- Clustering / routing / replication (§4.10) ------------------------------------------------

    pub fn set_cluster_shards(&self, shards: Vec<Shard>) {
        self.inner.cluster.write().unwrap().set_shards(shards);
    }

    /// Picks a routing key (`partition_key` property, else the queue name), resolves it to a
    /// shard and node through the ring, stamps routing telemetry onto the message, and
    /// replicates a WAL entry on the target shard's leader (§4.10).
    fn route_message(&self, message: &mut Message) {
        let key = message.property("partition_key").map(|s| s.to_string()).unwrap_or_else(|| message.message_type.clone());
        let mut cluster = self.inner.cluster.write().unwrap();
        let (shard_id, _ring_node) = match cluster.shard_for_key(&key) {
            Some(resolved) => resolved,
            None => return,
        };
        let shard = match cluster.shard(shard_id) {
            Some(shard) => shard.clone(),
            None => return,
        };

        let chosen = shard
            .leader()
            .filter(|r| r.healthy)
            .or_else(|| shard.replicas.iter().find(|r| r.role == crate::cluster::ReplicaRole::Follower && r.healthy))
            .or_else(|| shard.replicas.first());

        let attempt: u32 = message.property("routing_retry_count").and_then(|v| v.parse().ok()).unwrap_or(0);
        message.set_property("routing_retry_count", (attempt + 1).to_string());
        message.set_property("routing_attempt", (attempt + 1).to_string());

        if let Some(replica) = chosen {
            message.set_property("routed_node", replica.node_id.clone());
            message.set_property("routed_shard", shard_id.to_string());
            message.set_property("routed_role", format!("{:?}", replica.role));
            message.set_property("routed_healthy", replica.healthy.to_string());
        }

        let now = flux::time::timestamp_millis();
        if let Some(outcome) = cluster.replicate(shard_id, message.id, &message.message_type, now) {
            logging::debug!(self.inner.logger, "replicated"; "shard" => shard_id, "acks" => outcome.acks, "lag" => outcome.lag);
        }
    }

    pub fn promote_to_leader(&self, shard_id: crate::cluster::ShardId, node_id: &str) -> bool {
        self.inner.cluster.write().unwrap().promote_to_leader(shard_id, node_id)
    }

    pub fn demote_to_follower(&self, shard_id: crate::cluster::ShardId, node_id: &str) -> bool {
        self.inner.cluster.write().unwrap().demote_to_follower(shard_id, node_id)
    }

    pub fn cluster_metrics(&self) -> ClusterMetricsSnapshot {
        let cluster = self.inner.cluster.read().unwrap();
        cluster.metrics_snapshot(flux::time::timestamp_millis())
    }

    pub fn queue_metrics(&self, queue_name: &str) -> BrokerResult<QueueMetricsSnapshot> {
        let queue = self.queue(queue_name)?;
        let runtime_config = self.inner.runtime_config.read().unwrap();
        let now = flux::time::timestamp_millis();
        let (enqueue_rate, dequeue_rate, p50, p95) = queue.windowed_metrics(now, runtime_config.metrics_window_ms);
        let stats = queue.stats();
        Ok(QueueMetricsSnapshot {
            queue_name: queue_name.to_string(),
            pending_messages: queue.pending_count() as u64,
            total_messages: stats.total_messages,
            processed_messages: stats.processed_messages,
            dead_letter_messages: stats.dead_letter_messages,
            retried_messages: stats.retried_messages,
            enqueue_rate,
            dequeue_rate,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            timestamp_ms: now,
        })
    }

    // -- Handlers (§5 "handlers invoked without holding other locks") ---------------------------

    pub fn set_event_handler(&self, handler: EventHandler) {
        self.inner.handlers.lock().unwrap().event = Some(handler);
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.inner.handlers.lock().unwrap().error = Some(handler);
    }

    pub fn set_dead_letter_alert_handler(&self, handler: AlertHandler) {
        self.inner.handlers.lock().unwrap().alert = Some(handler);
    }

    pub fn set_leader_change_handler(&self, handler: LeaderChangeHandler) {
        self.inner.handlers.lock().unwrap().leader_change = Some(handler);
    }

    pub fn set_failover_handler(&self, handler: FailoverHandler) {
        self.inner.handlers.lock().unwrap().failover = Some(handler);
    }

    fn emit_event(&self, kind: &str, queue_name: &str, message_id: MessageId) {
        let handlers = self.inner.handlers.lock().unwrap();
        if let Some(handler) = &handlers.event {
            let mut dummy = Message::new(message_id, kind, crate::message::Payload::owned(Vec::new()));
            dummy.set_property("queue", queue_name);
            handler(kind, &dummy);
        }
    }

    // -- Runtime-mutable global config (§6 `set_global_config`) ---------------------------------

    pub fn set_global_config(&self, key: &str, value: &str) -> BrokerResult<()> {
        match key {
            "metrics.interval.ms" => {
                let parsed: u64 = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                if parsed < 100 {
                    return Err(BrokerError::InvalidArgument);
                }
                self.inner.runtime_config.write().unwrap().metrics_interval_ms = parsed;
            }
            "metrics.window.ms" => {
                let parsed: u64 = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                if parsed < 1000 {
                    return Err(BrokerError::InvalidArgument);
                }
                self.inner.runtime_config.write().unwrap().metrics_window_ms = parsed;
            }
            "metrics.latency.capacity" => {
                let parsed: usize = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                if parsed < 32 {
                    return Err(BrokerError::InvalidArgument);
                }
                self.inner.runtime_config.write().unwrap().metrics_latency_capacity = parsed;
            }
            "cluster.shards" => {
                let parsed: u32 = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                let mut cluster = self.inner.cluster.write().unwrap();
                cluster.set_shards((0..parsed.max(1)).map(|i| Shard { id: i, replicas: Vec::new() }).collect());
            }
            "cluster.shard.vnodes" => {
                let parsed: u32 = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                let mut cluster = self.inner.cluster.write().unwrap();
                cluster.shard_vnodes = parsed;
                cluster.rebuild_ring();
            }
            "cluster.heartbeat.flap.prob" => {
                let parsed: f64 = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                self.inner.cluster.write().unwrap().heartbeat_flap_prob = parsed.clamp(0.0, 1.0);
            }
            "replication.min.acks" => {
                let parsed: u32 = value.parse().map_err(|_| BrokerError::InvalidArgument)?;
                self.inner.cluster.write().unwrap().min_replication_acks = parsed;
            }
            _ => return Err(BrokerError::InvalidArgument),
        }
        Ok(())
    }
}

fn map_transaction_error(err: TransactionError) -> BrokerError {
    match err {
        TransactionError::NotFound => BrokerError::TransactionNotFound,
        TransactionError::InvalidState => BrokerError::InvalidState,
    }
}

/// Spawns a background thread that runs `tick` every `interval` until the shared stop signal
/// fires, catching panics per-iteration so one bad tick doesn't kill the thread (§7).
fn spawn_loop(inner: Arc<Inner>, interval: Duration, tick: fn(&Arc<Inner>)) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if inner.stop.wait(interval) {
            break;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| tick(&inner)));
        if result.is_err() {
            logging::error!(inner.logger, "background tick panicked");
        }
    })
}

fn run_scheduler_tick(inner: &Arc<Inner>) {
    let now = flux::time::timestamp_millis();
    let mut due = Vec::new();
    {
        let mut scheduled = inner.scheduled.lock().unwrap();
        let mut remaining = Vec::with_capacity(scheduled.len());
        for mut entry in scheduled.drain(..) {
            if entry.execute_at_ms > now {
                remaining.push(entry);
                continue;
            }
            due.push((entry.queue.clone(), entry.message.clone()));
            if entry.recurring && entry.remaining_count != 1 {
                entry.execute_at_ms = now + entry.interval_ms;
                if entry.remaining_count > 1 {
                    entry.remaining_count -= 1;
                }
                remaining.push(entry);
            }
        }
        *scheduled = remaining;
    }
    for (queue_name, message) in due {
        if let Some(queue) = inner.queues.read().unwrap().get(&queue_name).cloned() {
            queue.enqueue(message);
        } else {
            logging::warn!(inner.logger, "scheduled message targets missing queue"; "queue" => queue_name);
        }
    }
}

fn run_dlq_monitor_tick(inner: &Arc<Inner>) {
    let now = flux::time::timestamp_millis();
    let queues: Vec<(String, Arc<Queue>)> = inner.queues.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    for (name, queue) in &queues {
        if name.ends_with("_DLQ") {
            continue;
        }
        let dlq_name = dlq::dead_letter_queue_name(name);
        let dlq_len = inner.queues.read().unwrap().get(&dlq_name).map(|q| q.dead_letter_count() as u64).unwrap_or(0);
        let dlq_max = inner.queues.read().unwrap().get(&dlq_name).map(|q| q.config.lock().unwrap().max_count).unwrap_or(0);
        let stats = queue.stats();
        let dead_letter_rate = if stats.total_messages > 0 {
            stats.dead_letter_messages as f64 / stats.total_messages as f64
        } else {
            0.0
        };
        let sample = DeadLetterSample {
            current_dead_letter_messages: stats.dead_letter_messages,
            dead_letter_rate,
            dlq_len,
            dlq_max_len: dlq_max,
        };
        let triggered = inner.dlq_monitor.check_alerts(name, &sample, now);
        if !triggered.is_empty() {
            let handlers = inner.handlers.lock().unwrap();
            if let Some(handler) = &handlers.alert {
                for alert in &triggered {
                    handler(alert);
                }
            }
        }
    }
}

fn run_metrics_monitor_tick(inner: &Arc<Inner>) {
    let now = flux::time::timestamp_millis();
    let window_ms = inner.runtime_config.read().unwrap().metrics_window_ms;
    for (name, queue) in inner.queues.read().unwrap().iter() {
        let (enqueue_rate, dequeue_rate, p50, p95) = queue.windowed_metrics(now, window_ms);
        logging::debug!(inner.logger, "queue metrics"; "queue" => name, "enqueue_rate" => enqueue_rate, "dequeue_rate" => dequeue_rate, "p50_ms" => p50, "p95_ms" => p95);
    }
}

fn run_heartbeat_tick(inner: &Arc<Inner>) {
    let failovers = inner.cluster.write().unwrap().heartbeat_tick();
    if failovers.is_empty() {
        return;
    }
    let handlers = inner.handlers.lock().unwrap();
    for (shard_id, old_leader, new_leader) in failovers {
        logging::warn!(inner.logger, "failover"; "shard" => shard_id, "old_leader" => &old_leader, "new_leader" => &new_leader);
        if let Some(handler) = &handlers.leader_change {
            handler(shard_id, &old_leader, &new_leader);
        }
        if let Some(handler) = &handlers.failover {
            handler(shard_id, &old_leader, &new_leader);
        }
    }
}

fn run_transaction_sweep_tick(inner: &Arc<Inner>) {
    let now = flux::time::timestamp_millis();
    let timed_out = inner.transactions.sweep_timeouts(now);
    if !timed_out.is_empty() {
        logging::warn!(inner.logger, "transactions timed out"; "count" => timed_out.len());
    }
    let expired_batches = inner.batches.sweep_expired(now);
    if !expired_batches.is_empty() {
        logging::debug!(inner.logger, "batches expired"; "count" => expired_batches.len());
    }
}

fn run_alert_monitor_tick(inner: &Arc<Inner>) {
    // Dead-letter alerting runs on its own tick (`run_dlq_monitor_tick`); this tick is reserved
    // for non-DLQ alert categories the core does not yet define (§4.9 names only DLQ alerts).
    let _ = inner;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    fn test_broker() -> Broker {
        Broker::new(&crate::config::BrokerConfig::default(), None, flux::logging::discard())
    }

    #[test]
    fn send_and_receive_round_trip() {
        let broker = test_broker();
        broker.create_queue(QueueConfig::new("orders")).unwrap();
        let message = Message::new(0, "order.created", Payload::owned(vec![1, 2, 3]));
        let id = broker.send_message("orders", message).unwrap();

        let received = broker.receive_message("orders", Some(Duration::ZERO)).unwrap().unwrap();
        assert_eq!(received.id, id);
        broker.acknowledge("orders", id).unwrap();
        assert_eq!(broker.queue_stats("orders").unwrap().processed_messages, 1);
    }

    #[test]
    fn reject_without_requeue_moves_to_dead_letter_queue() {
        let broker = test_broker();
        broker.create_queue(QueueConfig::new("orders")).unwrap();
        let id = broker.send_message("orders", Message::new(0, "t", Payload::owned(vec![1]))).unwrap();
        broker.receive_message("orders", Some(Duration::ZERO)).unwrap();
        broker.reject("orders", id, false).unwrap();

        let dead = broker.dead_letter_messages("orders", 10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }

    #[test]
    fn commit_batch_dispatches_every_message_to_its_queue() {
        let broker = test_broker();
        broker.create_queue(QueueConfig::new("orders")).unwrap();
        let batch_id = broker.create_batch(Some("orders".into()), 0);
        broker.add_to_batch(batch_id, Message::new(0, "t", Payload::owned(vec![1]))).unwrap();
        broker.add_to_batch(batch_id, Message::new(0, "t", Payload::owned(vec![2]))).unwrap();

        let ids = broker.commit_batch(batch_id).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(broker.queue_stats("orders").unwrap().total_messages, 2);
    }

    #[test]
    fn transaction_rolls_back_without_executing_operations() {
        let broker = test_broker();
        broker.create_queue(QueueConfig::new("orders")).unwrap();
        let tx = broker.begin_transaction("test", 10_000);
        broker
            .add_transaction_operation(tx, TransactionOperation::Send { queue: "orders".into(), message: Message::new(0, "t", Payload::owned(vec![1])) })
            .unwrap();
        broker.rollback_transaction(tx, "test rollback").unwrap();
        assert_eq!(broker.queue_stats("orders").unwrap().total_messages, 0);
    }

    #[test]
    fn set_global_config_rejects_unknown_keys() {
        let broker = test_broker();
        assert!(broker.set_global_config("not.a.real.key", "1").is_err());
        assert!(broker.set_global_config("metrics.interval.ms", "500").is_ok());
    }
}
