//! Message broker core: queues, topics, transactions, batching, dead-letter handling, clustering
//! and replication, metrics, and a pluggable persistence collaborator, built on the `flux` logging
//! substrate and the `broker_runtime` async I/O and hash-ring layers.

#![allow(clippy::too_many_arguments)]

pub mod batch;
pub mod broker;
pub mod cluster;
pub mod compression;
pub mod config;
pub mod dlq;
pub mod encryption;
pub mod error;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod topic;
pub mod transaction;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use message::{DeliveryMode, Message, MessageId, Payload, Priority};
