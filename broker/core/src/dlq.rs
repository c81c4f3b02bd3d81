//! Dead-letter queue naming, alert configuration and monitoring (§4.9). Grounded on
//! `MessageQueue::CheckDeadLetterAlerts`/`TriggerDeadLetterAlert`/`GetDeadLetterQueueName`: a DLQ
//! is just another `Queue` named `{source}_DLQ`; this module owns the naming convention plus the
//! alert-threshold bookkeeping the broker's monitor thread drives.

use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

pub fn dead_letter_queue_name(source_queue: &str) -> String {
    format!("{}_DLQ", source_queue)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    DeadLetterCountExceeded,
    DeadLetterRateExceeded,
    DeadLetterQueueFull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterAlertConfig {
    pub enable_count_alert: bool,
    pub max_dead_letter_messages: u64,
    pub enable_rate_alert: bool,
    pub max_dead_letter_rate: f64,
}

impl Default for DeadLetterAlertConfig {
    fn default() -> DeadLetterAlertConfig {
        DeadLetterAlertConfig {
            enable_count_alert: false,
            max_dead_letter_messages: 1000,
            enable_rate_alert: false,
            max_dead_letter_rate: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterAlert {
    pub alert_type: AlertType,
    pub queue_name: String,
    pub dead_letter_queue_name: String,
    pub alert_message: String,
    pub current_value: u64,
    pub threshold_value: u64,
    pub current_rate: f64,
    pub threshold_rate: f64,
    pub alert_time_ms: u64,
    pub is_active: bool,
}

/// Per-source-queue view handed to `check_alerts`, read from the queue's own `QueueStats` plus
/// the DLQ's current occupancy.
pub struct DeadLetterSample {
    pub current_dead_letter_messages: u64,
    pub dead_letter_rate: f64,
    pub dlq_len: u64,
    pub dlq_max_len: u64,
}

pub struct DeadLetterMonitor {
    configs: Mutex<HashMap<String, DeadLetterAlertConfig>>,
    active_alerts: Mutex<HashMap<String, Vec<DeadLetterAlert>>>,
}

impl DeadLetterMonitor {
    pub fn new() -> DeadLetterMonitor {
        DeadLetterMonitor { configs: Mutex::new(HashMap::new()), active_alerts: Mutex::new(HashMap::new()) }
    }

    pub fn set_config(&self, queue_name: impl Into<String>, config: DeadLetterAlertConfig) {
        self.configs.lock().unwrap().insert(queue_name.into(), config);
    }

    pub fn config(&self, queue_name: &str) -> DeadLetterAlertConfig {
        self.configs.lock().unwrap().get(queue_name).cloned().unwrap_or_default()
    }

    pub fn active_alerts(&self, queue_name: &str) -> Vec<DeadLetterAlert> {
        self.active_alerts.lock().unwrap().get(queue_name).cloned().unwrap_or_default()
    }

    pub fn all_active_alerts(&self) -> Vec<DeadLetterAlert> {
        self.active_alerts.lock().unwrap().values().flatten().cloned().collect()
    }

    pub fn clear_alert(&self, queue_name: &str, alert_type: AlertType) {
        let mut active = self.active_alerts.lock().unwrap();
        if let Some(alerts) = active.get_mut(queue_name) {
            alerts.retain(|a| a.alert_type != alert_type);
        }
    }

    pub fn clear_all_alerts(&self, queue_name: &str) {
        self.active_alerts.lock().unwrap().remove(queue_name);
    }

    /// Evaluates one source queue's configured thresholds against `sample`, recording and
    /// returning any newly-triggered alerts (§4.9 monitor thread tick). The caller invokes the
    /// registered alert handler for each returned alert after this call returns.
    pub fn check_alerts(&self, queue_name: &str, sample: &DeadLetterSample, now_ms: u64) -> Vec<DeadLetterAlert> {
        let config = self.config(queue_name);
        let dlq_name = dead_letter_queue_name(queue_name);
        let mut triggered = Vec::new();

        if config.enable_count_alert && sample.current_dead_letter_messages > config.max_dead_letter_messages {
            triggered.push(DeadLetterAlert {
                alert_type: AlertType::DeadLetterCountExceeded,
                queue_name: queue_name.to_string(),
                dead_letter_queue_name: dlq_name.clone(),
                alert_message: "dead letter count exceeds threshold".to_string(),
                current_value: sample.current_dead_letter_messages,
                threshold_value: config.max_dead_letter_messages,
                current_rate: 0.0,
                threshold_rate: 0.0,
                alert_time_ms: now_ms,
                is_active: true,
            });
        }

        if config.enable_rate_alert && sample.dead_letter_rate > config.max_dead_letter_rate {
            triggered.push(DeadLetterAlert {
                alert_type: AlertType::DeadLetterRateExceeded,
                queue_name: queue_name.to_string(),
                dead_letter_queue_name: dlq_name.clone(),
                alert_message: "dead letter rate exceeds threshold".to_string(),
                current_value: 0,
                threshold_value: 0,
                current_rate: sample.dead_letter_rate,
                threshold_rate: config.max_dead_letter_rate,
                alert_time_ms: now_ms,
                is_active: true,
            });
        }

        if sample.dlq_max_len > 0 && sample.dlq_len >= sample.dlq_max_len {
            triggered.push(DeadLetterAlert {
                alert_type: AlertType::DeadLetterQueueFull,
                queue_name: queue_name.to_string(),
                dead_letter_queue_name: dlq_name,
                alert_message: "dead letter queue is full".to_string(),
                current_value: sample.dlq_len,
                threshold_value: sample.dlq_max_len,
                current_rate: 0.0,
                threshold_rate: 0.0,
                alert_time_ms: now_ms,
                is_active: true,
            });
        }

        if !triggered.is_empty() {
            let mut active = self.active_alerts.lock().unwrap();
            active.entry(queue_name.to_string()).or_default().extend(triggered.iter().cloned());
        }
        triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_name_appends_suffix() {
        assert_eq!(dead_letter_queue_name("orders"), "orders_DLQ");
    }

    #[test]
    fn count_alert_fires_once_threshold_exceeded() {
        let monitor = DeadLetterMonitor::new();
        monitor.set_config("orders", DeadLetterAlertConfig { enable_count_alert: true, max_dead_letter_messages: 5, ..Default::default() });
        let sample = DeadLetterSample { current_dead_letter_messages: 6, dead_letter_rate: 0.0, dlq_len: 0, dlq_max_len: 0 };
        let alerts = monitor.check_alerts("orders", &sample, 1000);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::DeadLetterCountExceeded);
        assert_eq!(monitor.active_alerts("orders").len(), 1);
    }

    #[test]
    fn clear_alert_removes_only_that_type() {
        let monitor = DeadLetterMonitor::new();
        monitor.set_config(
            "orders",
            DeadLetterAlertConfig { enable_count_alert: true, max_dead_letter_messages: 0, enable_rate_alert: true, max_dead_letter_rate: 0.0 },
        );
        let sample = DeadLetterSample { current_dead_letter_messages: 1, dead_letter_rate: 1.0, dlq_len: 0, dlq_max_len: 0 };
        monitor.check_alerts("orders", &sample, 1000);
        assert_eq!(monitor.active_alerts("orders").len(), 2);

        monitor.clear_alert("orders", AlertType::DeadLetterCountExceeded);
        let remaining = monitor.active_alerts("orders");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].alert_type, AlertType::DeadLetterRateExceeded);
    }
}
