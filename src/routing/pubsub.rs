//! In-process signal broker.
//!
//! Routes live signals to the connections whose targets subscribed to the
//! matching topic classes. Connections register with their subscribed
//! topics and the union of their targets' authorization subjects; a signal
//! is delivered when both the topic and at least one read subject match.
//! Fine-grained per-target filtering happens again inside the connection
//! actor, so this gate only prunes connections with no chance to match.

use crate::protocol::signal::{Signal, SubscriptionTopic};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Subscriber {
    topics: HashSet<SubscriptionTopic>,
    subjects: HashSet<String>,
    tx: mpsc::UnboundedSender<Signal>,
}

/// Shared pub/sub registry, cheap to clone.
#[derive(Clone, Default)]
pub struct SignalBroker {
    subscribers: Arc<Mutex<HashMap<String, Subscriber>>>,
}

impl SignalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a subscriber. Re-subscribing under the same id
    /// replaces the previous topic set, which is how a modified connection
    /// swaps its subscriptions.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        topics: Vec<SubscriptionTopic>,
        subjects: Vec<String>,
        tx: mpsc::UnboundedSender<Signal>,
    ) {
        let mut subscribers = self.subscribers.lock();
        subscribers.insert(
            subscriber_id.into(),
            Subscriber {
                topics: topics.into_iter().collect(),
                subjects: subjects.into_iter().collect(),
                tx,
            },
        );
    }

    pub fn remove_subscriber(&self, subscriber_id: &str) {
        self.subscribers.lock().remove(subscriber_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver a signal to every matching subscriber; returns how many
    /// received it. Subscribers whose channel is gone are pruned.
    pub fn publish(&self, signal: &Signal) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();
        let subscribers = self.subscribers.lock();
        for (id, subscriber) in subscribers.iter() {
            let topic_matches = subscriber.topics.iter().any(|t| t.covers(&signal.topic));
            let subject_matches = signal
                .read_subjects
                .iter()
                .any(|s| subscriber.subjects.contains(s));
            if topic_matches && subject_matches {
                if subscriber.tx.send(signal.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale.push(id.clone());
                }
            }
        }
        drop(subscribers);
        if !stale.is_empty() {
            let mut subscribers = self.subscribers.lock();
            for id in stale {
                subscribers.remove(&id);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::signal::{Channel, EntityId, TopicCriterion, TopicPath};
    use serde_json::json;

    fn twin_event(subject: &str) -> Signal {
        Signal::new(
            TopicPath::new(
                &EntityId::new("ns", "thing"),
                Channel::Twin,
                TopicCriterion::Events,
                "modified",
            ),
            json!({}),
        )
        .with_read_subjects(vec![subject.to_string()])
    }

    #[test]
    fn test_publish_routes_by_topic_and_subject() {
        let broker = SignalBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(
            "c1",
            vec![SubscriptionTopic::TwinEvents],
            vec!["subject:reader".to_string()],
            tx,
        );

        assert_eq!(broker.publish(&twin_event("subject:reader")), 1);
        assert!(rx.try_recv().is_ok());

        assert_eq!(broker.publish(&twin_event("subject:other")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resubscribe_replaces_topics() {
        let broker = SignalBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(
            "c1",
            vec![SubscriptionTopic::TwinEvents],
            vec!["subject:reader".to_string()],
            tx.clone(),
        );
        broker.subscribe(
            "c1",
            vec![SubscriptionTopic::LiveMessages],
            vec!["subject:reader".to_string()],
            tx,
        );
        assert_eq!(broker.subscriber_count(), 1);
        assert_eq!(broker.publish(&twin_event("subject:reader")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let broker = SignalBroker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        broker.subscribe(
            "c1",
            vec![SubscriptionTopic::TwinEvents],
            vec!["subject:reader".to_string()],
            tx,
        );
        drop(rx);
        assert_eq!(broker.publish(&twin_event("subject:reader")), 0);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
