//! Process-start TOML configuration (§1.1/§6). Mirrors the teacher's `GameConfig` shape: a tree of
//! `#[derive(Serialize, Deserialize)]` structs with a `Default` impl and a `load` associated
//! function, loaded with `serdeconv`. `set_global_config` (§6) layers a narrow, validated
//! runtime-mutable subset on top of this at broker construction time; the two are independent.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28015;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerConfig {
    pub address: Option<String>,
    pub max_clients: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MetricsConfig {
    pub interval_ms: u64,
    pub window_ms: u64,
    pub latency_capacity: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClusterSeedConfig {
    pub shards: u32,
    pub shard_vnodes: u32,
    pub heartbeat_flap_prob: f64,
    pub heartbeat_interval_ms: u64,
    pub min_replication_acks: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub cluster: ClusterSeedConfig,
}

impl Default for BrokerConfig {
    fn default() -> BrokerConfig {
        BrokerConfig {
            server: ServerConfig { address: Some(format!("0.0.0.0:{}", DEFAULT_PORT)), max_clients: 1024 },
            metrics: MetricsConfig { interval_ms: 1000, window_ms: 60_000, latency_capacity: 1024 },
            cluster: ClusterSeedConfig {
                shards: 1,
                shard_vnodes: 64,
                heartbeat_flap_prob: 0.0,
                heartbeat_interval_ms: 200,
                min_replication_acks: 1,
            },
        }
    }
}

impl BrokerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> BrokerConfig {
        serdeconv::from_toml_file(path).expect("Error loading broker configuration file")
    }
}
