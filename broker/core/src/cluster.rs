//! Sharding, replica roles, WAL replication and heartbeat-driven failover (§3, §4.10). Grounded on
//! `MessageQueue::RebuildShardRing`/`SetClusterConfig`/`GetShardForKey`/`ProcessHeartbeat`/
//! `SimulateReplication`/`PromoteToLeader`/`DemoteToFollower`. Shard-to-node naming (`"shard-{i}"`)
//! and the xorshift-style heartbeat health flap are both carried over from the original.

use broker_runtime::HashRing;
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub type ShardId = u32;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub node_id: String,
    pub role: ReplicaRole,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub replicas: Vec<Replica>,
}

impl Shard {
    pub fn leader(&self) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.role == ReplicaRole::Leader)
    }

    pub fn healthy_follower_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.role == ReplicaRole::Follower && r.healthy).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub index: u64,
    pub message_id: u64,
    pub queue: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
pub struct Wal {
    pub entries: Vec<WalEntry>,
    pub follower_applied_index: std::collections::HashMap<String, u64>,
}

impl Wal {
    pub fn leader_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn max_follower_applied(&self) -> u64 {
        self.follower_applied_index.values().copied().max().unwrap_or(0)
    }
}

/// One replication attempt's outcome, used for the per-send replication event (§4.10).
pub struct ReplicationOutcome {
    pub shard_id: ShardId,
    pub acks: u32,
    pub lag: i64,
    pub leader_log_len: u64,
    pub follower_applied_index: u64,
}

pub type LeaderChangeHandler = Box<dyn Fn(ShardId, &str, &str) + Send + Sync>;
pub type FailoverHandler = Box<dyn Fn(ShardId, &str, &str) + Send + Sync>;

pub struct Cluster {
    pub shards: Vec<Shard>,
    pub ring: HashRing,
    pub wal: Vec<Wal>,
    pub shard_vnodes: u32,
    pub heartbeat_flap_prob: f64,
    pub min_replication_acks: u32,
    rng_state: AtomicU64,
}

impl Cluster {
    pub fn new(shard_vnodes: u32, heartbeat_flap_prob: f64, min_replication_acks: u32) -> Cluster {
        Cluster {
            shards: Vec::new(),
            ring: HashRing::new(),
            wal: Vec::new(),
            shard_vnodes,
            heartbeat_flap_prob,
            min_replication_acks,
            rng_state: AtomicU64::new(0x9E3779B97F4A7C15),
        }
    }

    /// Replaces the shard topology wholesale (e.g. from `SetClusterConfig`) and rebuilds the ring.
    /// Each shard's WAL starts every follower replica at applied index 0, so the heartbeat
    /// catch-up loop (`process_heartbeat`) has entries to advance from the moment the cluster is
    /// built, rather than only once a test or caller inserts one by hand.
    pub fn set_shards(&mut self, shards: Vec<Shard>) {
        self.wal = shards
            .iter()
            .map(|shard| {
                let mut wal = Wal::default();
                for replica in &shard.replicas {
                    if replica.role == ReplicaRole::Follower {
                        wal.follower_applied_index.insert(replica.node_id.clone(), 0);
                    }
                }
                wal
            })
            .collect();
        self.shards = shards;
        self.rebuild_ring();
    }

    /// Rebuilds the consistent-hash ring from the current shard count, one ring-node per shard
    /// named `"shard-{index}"`, matching the original's single-machine shard simulation.
    pub fn rebuild_ring(&mut self) {
        self.ring.clear();
        for i in 0..self.shards.len().max(1) as u32 {
            self.ring.add_node(&format!("shard-{}", i), self.shard_vnodes.max(1));
        }
    }

    pub fn shard_for_key(&self, key: &str) -> Option<(ShardId, String)> {
        let node_id = self.ring.get_node(key)?.to_string();
        let shard_index = node_id.rsplit('-').next()?.parse::<u32>().ok()?;
        Some((shard_index, node_id))
    }

    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(id as usize)
    }

    pub fn shard_mut(&mut self, id: ShardId) -> Option<&mut Shard> {
        self.shards.get_mut(id as usize)
    }

    pub fn set_node_health(&mut self, node_id: &str, healthy: bool) {
        for shard in &mut self.shards {
            for replica in &mut shard.replicas {
                if replica.node_id == node_id {
                    replica.healthy = healthy;
                }
            }
        }
    }

    pub fn promote_to_leader(&mut self, shard_id: ShardId, node_id: &str) -> bool {
        let shard = match self.shard_mut(shard_id) {
            Some(shard) => shard,
            None => return false,
        };
        if !shard.replicas.iter().any(|r| r.node_id == node_id) {
            return false;
        }
        for replica in &mut shard.replicas {
            replica.role = if replica.node_id == node_id { ReplicaRole::Leader } else { ReplicaRole::Follower };
        }
        true
    }

    pub fn demote_to_follower(&mut self, shard_id: ShardId, node_id: &str) -> bool {
        let shard = match self.shard_mut(shard_id) {
            Some(shard) => shard,
            None => return false,
        };
        for replica in &mut shard.replicas {
            if replica.node_id == node_id {
                replica.role = ReplicaRole::Follower;
                return true;
            }
        }
        false
    }

    /// Appends a WAL entry on `shard_id`'s leader and counts healthy followers as ACKs, capped at
    /// `min_replication_acks` (§4.10).
    pub fn replicate(&mut self, shard_id: ShardId, message_id: u64, queue: &str, now_ms: u64) -> Option<ReplicationOutcome> {
        let min_acks = self.min_replication_acks;
        let shard = self.shards.get(shard_id as usize)?;
        let healthy_followers = shard.healthy_follower_count() as u32;
        let acked = healthy_followers.min(min_acks);

        let wal = self.wal.get_mut(shard_id as usize)?;
        let index = wal.leader_index() + 1;
        wal.entries.push(WalEntry { index, message_id, queue: queue.to_string(), timestamp_ms: now_ms });

        let lag = healthy_followers as i64 - acked as i64;
        Some(ReplicationOutcome {
            shard_id,
            acks: acked,
            lag,
            leader_log_len: wal.leader_index(),
            follower_applied_index: wal.max_follower_applied(),
        })
    }

    /// xorshift64* PRNG, matching the original's avoidance of a global `rand()` state so heartbeat
    /// flapping is reproducible from a fixed seed in tests.
    fn next_uniform(&self) -> f64 {
        let mut seed = self.rng_state.load(Ordering::Relaxed);
        seed ^= seed >> 12;
        seed ^= seed << 25;
        seed ^= seed >> 27;
        self.rng_state.store(seed, Ordering::Relaxed);
        let r = seed.wrapping_mul(0x2545F4914F6CDD1D);
        ((r & 0xFFFF_FFFF) as f64) / (0xFFFF_FFFFu32 as f64)
    }

    /// One heartbeat tick (§4.10): randomly flips replica health, elects a takeover leader if the
    /// current one is unhealthy, and advances follower applied indices by 1-3 entries. Returns the
    /// `(shard_id, old_leader, new_leader)` triples for any failover that occurred this tick, so
    /// the broker can invoke its leader-change/failover handlers outside the cluster lock.
    pub fn heartbeat_tick(&mut self) -> Vec<(ShardId, String, String)> {
        let mut failovers = Vec::new();

        for shard in &mut self.shards {
            let mut current_leader = String::new();
            let mut leader_healthy = false;
            for replica in &mut shard.replicas {
                let uniform = self.next_uniform();
                if uniform < self.heartbeat_flap_prob {
                    replica.healthy = !replica.healthy;
                }
                if replica.role == ReplicaRole::Leader {
                    current_leader = replica.node_id.clone();
                    leader_healthy = replica.healthy;
                }
            }

            if !leader_healthy && !current_leader.is_empty() {
                let takeover = shard
                    .replicas
                    .iter()
                    .find(|r| r.node_id != current_leader && r.healthy)
                    .map(|r| r.node_id.clone());

                if let Some(takeover_node) = takeover {
                    for replica in &mut shard.replicas {
                        if replica.node_id == current_leader {
                            replica.role = ReplicaRole::Follower;
                        } else if replica.node_id == takeover_node {
                            replica.role = ReplicaRole::Leader;
                        }
                    }
                    failovers.push((shard.id, current_leader, takeover_node));
                }
            }
        }

        for wal in &mut self.wal {
            let leader_len = wal.leader_index();
            if leader_len == 0 {
                continue;
            }
            for applied in wal.follower_applied_index.values_mut() {
                if *applied < leader_len {
                    let gap = leader_len - *applied;
                    let step = gap.min(3);
                    *applied = (*applied + step).min(leader_len);
                }
            }
        }

        failovers
    }

    pub fn metrics_snapshot(&self, now_ms: u64) -> crate::metrics::ClusterMetricsSnapshot {
        let leader_count = self.shards.iter().filter(|s| s.leader().is_some()).count();
        let healthy_replica_count = self.shards.iter().flat_map(|s| &s.replicas).filter(|r| r.healthy).count();
        let total_wal_length: u64 = self.wal.iter().map(|w| w.leader_index()).sum();
        let max_follower_applied_index = self.wal.iter().map(|w| w.max_follower_applied()).max().unwrap_or(0);
        let total_replication_lag: i64 = self
            .shards
            .iter()
            .zip(self.wal.iter())
            .map(|(shard, wal)| shard.healthy_follower_count() as i64 - wal.max_follower_applied().min(i64::MAX as u64) as i64)
            .sum();

        crate::metrics::ClusterMetricsSnapshot {
            shard_count: self.shards.len(),
            leader_count,
            healthy_replica_count,
            total_wal_length,
            max_follower_applied_index,
            total_replication_lag,
            timestamp_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_shard_cluster() -> Cluster {
        let mut cluster = Cluster::new(16, 0.0, 1);
        cluster.set_shards(vec![
            Shard {
                id: 0,
                replicas: vec![
                    Replica { node_id: "node-a".into(), role: ReplicaRole::Leader, healthy: true },
                    Replica { node_id: "node-b".into(), role: ReplicaRole::Follower, healthy: true },
                ],
            },
            Shard {
                id: 1,
                replicas: vec![
                    Replica { node_id: "node-b".into(), role: ReplicaRole::Leader, healthy: true },
                    Replica { node_id: "node-a".into(), role: ReplicaRole::Follower, healthy: true },
                ],
            },
        ]);
        cluster
    }

    #[test]
    fn shard_for_key_is_stable() {
        let cluster = two_shard_cluster();
        let first = cluster.shard_for_key("user_0").unwrap();
        let second = cluster.shard_for_key("user_0").unwrap();
        assert_eq!(first.0, second.0);
    }

    #[test]
    fn unhealthy_leader_triggers_failover_to_healthy_follower() {
        let mut cluster = two_shard_cluster();
        cluster.set_node_health("node-b", false);
        let failovers = cluster.heartbeat_tick();
        let shard1_failover = failovers.iter().find(|(id, ..)| *id == 1);
        assert!(shard1_failover.is_some());
        let (_, old, new) = shard1_failover.unwrap();
        assert_eq!(old, "node-b");
        assert_eq!(new, "node-a");
        assert_eq!(cluster.shard(1).unwrap().leader().unwrap().node_id, "node-a");
    }

    #[test]
    fn replication_acks_capped_at_min_acks() {
        let mut cluster = two_shard_cluster();
        cluster.min_replication_acks = 1;
        let outcome = cluster.replicate(0, 42, "orders", 1000).unwrap();
        assert_eq!(outcome.acks, 1);
        assert_eq!(outcome.leader_log_len, 1);
    }

    #[test]
    fn leader_log_len_never_falls_below_max_follower_applied() {
        let mut cluster = two_shard_cluster();
        cluster.replicate(0, 1, "q", 0);
        cluster.wal[0].follower_applied_index.insert("node-b".into(), 0);
        for _ in 0..5 {
            cluster.heartbeat_tick();
        }
        assert!(cluster.wal[0].leader_index() >= cluster.wal[0].max_follower_applied());
    }

    #[test]
    fn promote_and_demote_swap_roles_synchronously() {
        let mut cluster = two_shard_cluster();
        assert!(cluster.promote_to_leader(0, "node-b"));
        assert_eq!(cluster.shard(0).unwrap().leader().unwrap().node_id, "node-b");
        assert!(cluster.demote_to_follower(0, "node-b"));
        assert!(cluster.shard(0).unwrap().leader().is_none());
    }
}
