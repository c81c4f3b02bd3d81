//! Pub-sub topics (§3, §4.8). Grounded on `MessageQueue::TopicData`/`PublishMessage`/
//! `DeliverMessageToSubscribers`: a subscriber table keyed by subscriber id with no per-subscriber
//! backlog — publish is a synchronous fan-out to whatever handlers are registered at the moment.

use crate::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type SubscriberHandler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Default, Clone)]
pub struct TopicStats {
    pub created_at_ms: u64,
    pub messages_published: u64,
    pub delivery_attempts: u64,
}

struct TopicState {
    subscribers: HashMap<String, SubscriberHandler>,
    stats: TopicStats,
}

pub struct Topic {
    name: String,
    state: Mutex<TopicState>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Topic {
        Topic {
            name: name.into(),
            state: Mutex::new(TopicState {
                subscribers: HashMap::new(),
                stats: TopicStats { created_at_ms: flux::time::timestamp_millis(), ..Default::default() },
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self, subscriber_id: impl Into<String>, handler: SubscriberHandler) {
        self.state.lock().unwrap().subscribers.insert(subscriber_id.into(), handler);
    }

    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.state.lock().unwrap().subscribers.remove(subscriber_id);
    }

    pub fn active_subscribers(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribers.keys().cloned().collect()
    }

    pub fn stats(&self) -> TopicStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Fans `message` out to every currently-registered subscriber. Handlers are collected under
    /// the topic lock and invoked after it is released, per §5's "handlers invoked without holding
    /// other locks" rule.
    pub fn publish(&self, message: &Message) -> usize {
        let handlers: Vec<SubscriberHandler> = {
            let mut state = self.state.lock().unwrap();
            state.stats.messages_published += 1;
            state.subscribers.values().cloned().collect()
        };
        for handler in &handlers {
            handler(message);
        }
        if !handlers.is_empty() {
            self.state.lock().unwrap().stats.delivery_attempts += handlers.len() as u64;
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_fans_out_to_every_subscriber_with_no_backlog() {
        let topic = Topic::new("events");
        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        topic.subscribe("sub-a", Arc::new(move |_msg| { c1.fetch_add(1, Ordering::SeqCst); }));
        let c2 = counter.clone();
        topic.subscribe("sub-b", Arc::new(move |_msg| { c2.fetch_add(1, Ordering::SeqCst); }));

        let message = Message::new(1, "test", Payload::owned(vec![0]));
        let delivered = topic.publish(&message);

        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_from_fanout() {
        let topic = Topic::new("events");
        topic.subscribe("sub-a", Arc::new(|_msg| {}));
        topic.unsubscribe("sub-a");
        assert_eq!(topic.active_subscribers().len(), 0);
    }
}
