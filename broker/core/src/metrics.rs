//! Metrics windowing and snapshot types (§4.13). Grounded on `MessageQueue::TrimOld`/
//! `ComputeRatePerSec`/`ComputePercentiles`/`GetQueueMetrics`/`ProcessMetricsMonitoring`.

use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Drops timestamps older than `window_ms` relative to `now_ms` from the front of `deque`.
pub fn trim_old(deque: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
    let cutoff = now_ms.saturating_sub(window_ms);
    while let Some(&front) = deque.front() {
        if front < cutoff {
            deque.pop_front();
        } else {
            break;
        }
    }
}

pub fn rate_per_sec(count_in_window: usize, window_ms: u64) -> f64 {
    if window_ms == 0 {
        return 0.0;
    }
    count_in_window as f64 / (window_ms as f64 / 1000.0)
}

/// p50/p95 from a sorted copy of `samples`, matching `ComputePercentiles`'s
/// `round(q * (n - 1))` index selection.
pub fn percentiles(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let last = sorted.len() - 1;
    let idx = |q: f64| -> usize { ((q * last as f64).round() as usize).min(last) };
    (sorted[idx(0.5)], sorted[idx(0.95)])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetricsSnapshot {
    pub queue_name: String,
    pub pending_messages: u64,
    pub total_messages: u64,
    pub processed_messages: u64,
    pub dead_letter_messages: u64,
    pub retried_messages: u64,
    pub enqueue_rate: f64,
    pub dequeue_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterMetricsSnapshot {
    pub shard_count: usize,
    pub leader_count: usize,
    pub healthy_replica_count: usize,
    pub total_wal_length: u64,
    pub max_follower_applied_index: u64,
    pub total_replication_lag: i64,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_entries_outside_the_window() {
        let mut deque: VecDeque<u64> = vec![100, 4_000, 9_900, 10_000].into_iter().collect();
        trim_old(&mut deque, 10_000, 5_000);
        assert_eq!(deque, VecDeque::from(vec![9_900, 10_000]));
    }

    #[test]
    fn percentiles_of_empty_samples_are_zero() {
        assert_eq!(percentiles(&[]), (0.0, 0.0));
    }

    #[test]
    fn percentiles_pick_expected_indices() {
        let samples: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        let (p50, p95) = percentiles(&samples);
        assert_eq!(p50, 51.0);
        assert_eq!(p95, 96.0);
    }
}
