//! Persistence collaborator contract (§4.14). Grounded on `MessageQueue::SaveMessageToDisk`/
//! `LoadPersistedMessages`/`SaveQueueToDisk`/`LoadQueueFromDisk`, re-expressed as a trait the
//! broker is generic over rather than a concrete mandated store.

use crate::error::{BrokerError, BrokerResult};
use crate::message::Message;
use crate::queue::{QueueConfig, QueueStats};
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub trait Persistence: Send + Sync {
    fn initialize(&self) -> BrokerResult<()>;
    fn shutdown(&self) -> BrokerResult<()>;
    fn save_message(&self, queue: &str, message: &Message) -> BrokerResult<()>;
    fn load_all_messages(&self, queue: &str) -> BrokerResult<Vec<Message>>;
    fn save_queue(&self, name: &str, config: &QueueConfig, stats: &QueueStats) -> BrokerResult<()>;
    fn load_queue(&self, name: &str) -> BrokerResult<(QueueConfig, QueueStats)>;
    fn list_persisted_queues(&self) -> BrokerResult<Vec<String>>;
}

/// On-disk representation of one message, independent of the in-memory `Payload` tag — persisted
/// messages are always materialized as owned bytes (§3's zero-copy contract explicitly excludes
/// the persistence path).
#[derive(Debug, Serialize, Deserialize)]
struct PersistedMessage {
    id: u64,
    message_type: String,
    priority: crate::message::Priority,
    delivery_mode: crate::message::DeliveryMode,
    created_at_ms: u64,
    expires_at_ms: u64,
    retry_count: u32,
    max_retries: u32,
    next_retry_at_ms: u64,
    properties: std::collections::HashMap<String, String>,
    payload: Vec<u8>,
}

impl From<&Message> for PersistedMessage {
    fn from(message: &Message) -> PersistedMessage {
        PersistedMessage {
            id: message.id,
            message_type: message.message_type.clone(),
            priority: message.priority,
            delivery_mode: message.delivery_mode,
            created_at_ms: message.created_at_ms,
            expires_at_ms: message.expires_at_ms,
            retry_count: message.retry_count,
            max_retries: message.max_retries,
            next_retry_at_ms: message.next_retry_at_ms,
            properties: message.properties.clone(),
            payload: message.payload.to_vec(),
        }
    }
}

impl From<PersistedMessage> for Message {
    fn from(persisted: PersistedMessage) -> Message {
        let mut message = Message::new(persisted.id, persisted.message_type, crate::message::Payload::owned(persisted.payload));
        message.priority = persisted.priority;
        message.delivery_mode = persisted.delivery_mode;
        message.created_at_ms = persisted.created_at_ms;
        message.expires_at_ms = persisted.expires_at_ms;
        message.retry_count = persisted.retry_count;
        message.max_retries = persisted.max_retries;
        message.next_retry_at_ms = persisted.next_retry_at_ms;
        message.properties = persisted.properties;
        message
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueMetadata {
    config: QueueConfig,
    stats: QueueStats,
}

/// Default implementation (§4.14): one directory per queue under `root_dir`, one
/// `message-{id}.json` file per message plus a `queue.json` metadata file, all `serde_json`.
pub struct FilePersistence {
    root_dir: PathBuf,
}

impl FilePersistence {
    pub fn new(root_dir: impl Into<PathBuf>) -> FilePersistence {
        FilePersistence { root_dir: root_dir.into() }
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.root_dir.join(queue)
    }

    fn message_path(&self, queue: &str, id: u64) -> PathBuf {
        self.queue_dir(queue).join(format!("message-{}.json", id))
    }

    fn metadata_path(&self, queue: &str) -> PathBuf {
        self.queue_dir(queue).join("queue.json")
    }
}

fn io_err(_err: std::io::Error) -> BrokerError {
    BrokerError::OperationFailed
}

fn json_err(_err: serde_json::Error) -> BrokerError {
    BrokerError::OperationFailed
}

impl Persistence for FilePersistence {
    fn initialize(&self) -> BrokerResult<()> {
        fs::create_dir_all(&self.root_dir).map_err(io_err)
    }

    fn shutdown(&self) -> BrokerResult<()> {
        Ok(())
    }

    fn save_message(&self, queue: &str, message: &Message) -> BrokerResult<()> {
        fs::create_dir_all(self.queue_dir(queue)).map_err(io_err)?;
        let persisted = PersistedMessage::from(message);
        let encoded = serde_json::to_vec(&persisted).map_err(json_err)?;
        fs::write(self.message_path(queue, message.id), encoded).map_err(io_err)
    }

    /// Loads every persisted message for `queue` in ascending id order — the file-based default's
    /// approximation of "stored order" (§6); a store backed by an append log would instead replay
    /// its own write order.
    fn load_all_messages(&self, queue: &str) -> BrokerResult<Vec<Message>> {
        let dir = self.queue_dir(queue);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            let is_message = path.file_name().and_then(|n| n.to_str()).map(|n| n.starts_with("message-")).unwrap_or(false);
            if !is_message {
                continue;
            }
            let bytes = fs::read(&path).map_err(io_err)?;
            let persisted: PersistedMessage = serde_json::from_slice(&bytes).map_err(json_err)?;
            messages.push(Message::from(persisted));
        }
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    fn save_queue(&self, name: &str, config: &QueueConfig, stats: &QueueStats) -> BrokerResult<()> {
        fs::create_dir_all(self.queue_dir(name)).map_err(io_err)?;
        let metadata = QueueMetadata { config: config.clone(), stats: stats.clone() };
        let encoded = serde_json::to_vec(&metadata).map_err(json_err)?;
        fs::write(self.metadata_path(name), encoded).map_err(io_err)
    }

    fn load_queue(&self, name: &str) -> BrokerResult<(QueueConfig, QueueStats)> {
        let bytes = fs::read(self.metadata_path(name)).map_err(io_err)?;
        let metadata: QueueMetadata = serde_json::from_slice(&bytes).map_err(json_err)?;
        Ok((metadata.config, metadata.stats))
    }

    fn list_persisted_queues(&self) -> BrokerResult<Vec<String>> {
        if !self.root_dir.exists() {
            return Ok(Vec::new());
        }
        let mut queues = Vec::new();
        for entry in fs::read_dir(&self.root_dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if Path::new(&self.metadata_path(name)).exists() {
                        queues.push(name.to_string());
                    }
                }
            }
        }
        queues.sort();
        Ok(queues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use tempfile::tempdir;

    #[test]
    fn round_trips_messages_in_ascending_id_order() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        store.initialize().unwrap();

        store.save_message("orders", &Message::new(2, "t", Payload::owned(vec![2]))).unwrap();
        store.save_message("orders", &Message::new(1, "t", Payload::owned(vec![1]))).unwrap();

        let loaded = store.load_all_messages("orders").unwrap();
        assert_eq!(loaded.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(loaded[0].payload.as_bytes(), &[1]);
    }

    #[test]
    fn round_trips_queue_metadata() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        store.initialize().unwrap();

        let config = QueueConfig::new("orders");
        let stats = QueueStats::default();
        store.save_queue("orders", &config, &stats).unwrap();

        let (loaded_config, _loaded_stats) = store.load_queue("orders").unwrap();
        assert_eq!(loaded_config.name, "orders");
    }

    #[test]
    fn list_persisted_queues_only_returns_queues_with_metadata() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        store.initialize().unwrap();
        store.save_message("orphan", &Message::new(1, "t", Payload::owned(vec![1]))).unwrap();
        store.save_queue("orders", &QueueConfig::new("orders"), &QueueStats::default()).unwrap();

        let queues = store.list_persisted_queues().unwrap();
        assert_eq!(queues, vec!["orders".to_string()]);
    }

    #[test]
    fn missing_queue_directory_yields_empty_message_list() {
        let dir = tempdir().unwrap();
        let store = FilePersistence::new(dir.path());
        store.initialize().unwrap();
        assert!(store.load_all_messages("nonexistent").unwrap().is_empty());
    }
}
