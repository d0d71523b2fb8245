//! Topic fan-out for the relay.
//!
//! Every topic owns one tokio broadcast channel. Frames are encoded once and
//! shared as `Arc<str>`; each subscriber gets an independent receiver that
//! buffers up to `capacity` frames before it starts lagging.
//!
//! Delivery includes the publisher's own connection. Dropping echoes is the
//! client's job.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Snapshot of a topic's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicTopicStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of one topic.
pub struct TopicGroup {
    sender: broadcast::Sender<Arc<str>>,
    /// Connection ids currently subscribed
    subscribers: RwLock<HashSet<Uuid>>,
    capacity: usize,
    stats: AtomicTopicStats,
}

impl TopicGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicTopicStats::default(),
        }
    }

    /// Register a connection and hand it a receiver.
    pub async fn add_subscriber(&self, conn_id: Uuid) -> broadcast::Receiver<Arc<str>> {
        self.subscribers.write().await.insert(conn_id);
        self.sender.subscribe()
    }

    pub async fn remove_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.write().await.remove(conn_id)
    }

    pub async fn has_subscriber(&self, conn_id: &Uuid) -> bool {
        self.subscribers.read().await.contains(conn_id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver a pre-encoded frame to every receiver. Returns how many got it.
    pub fn publish(&self, frame: Arc<str>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Topic name → group. Topics appear on first subscribe and go away when
/// their last subscriber leaves.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<TopicGroup>>>,
    default_capacity: usize,
}

impl TopicRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Register `conn_id` on `topic`, creating the topic if needed. Holding
    /// the registry write lock keeps this atomic with [`unsubscribe`](Self::unsubscribe),
    /// so a subscriber never lands on a group that was just dropped.
    pub async fn subscribe(
        &self,
        topic: &str,
        conn_id: Uuid,
    ) -> (Arc<TopicGroup>, broadcast::Receiver<Arc<str>>) {
        let mut topics = self.topics.write().await;
        let group = match topics.get(topic) {
            Some(group) => group.clone(),
            None => {
                let group = Arc::new(TopicGroup::new(self.default_capacity));
                topics.insert(topic.to_string(), group.clone());
                log::debug!("Topic {topic} created");
                group
            }
        };
        let rx = group.add_subscriber(conn_id).await;
        (group, rx)
    }

    /// Drop `conn_id` from `topic` and remove the topic once empty. Returns
    /// true if the topic was removed.
    pub async fn unsubscribe(&self, topic: &str, conn_id: &Uuid) -> bool {
        let mut topics = self.topics.write().await;
        let Some(group) = topics.get(topic) else {
            return false;
        };
        group.remove_subscriber(conn_id).await;
        if group.subscriber_count().await == 0 {
            topics.remove(topic);
            log::debug!("Topic {topic} removed (empty)");
            return true;
        }
        false
    }

    pub async fn get(&self, topic: &str) -> Option<Arc<TopicGroup>> {
        self.topics.read().await.get(topic).cloned()
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn active_topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }
}
