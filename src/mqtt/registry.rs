//! Topic-keyed registry of message handlers.
//!
//! One broker session serves many subscribers: each topic filter maps to a list
//! of handlers, and an inbound message is delivered to every handler whose
//! filter matches its topic.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::packet::QoS;

/// An inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Callback invoked on the channel's reader task for every matching message.
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle identifying one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct TopicEntry {
    qos: QoS,
    handlers: Vec<(SubscriptionId, MessageHandler)>,
}

/// Handlers grouped by topic filter.
#[derive(Default)]
pub struct HandlerRegistry {
    topics: BTreeMap<String, TopicEntry>,
    next_id: u64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `filter`. The filter's QoS is the highest requested so far.
    pub fn add(&mut self, filter: &str, qos: QoS, handler: MessageHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);

        let entry = self
            .topics
            .entry(filter.to_string())
            .or_insert_with(|| TopicEntry {
                qos,
                handlers: Vec::new(),
            });
        entry.qos = entry.qos.max(qos);
        entry.handlers.push((id, handler));
        id
    }

    /// Remove a single handler.
    ///
    /// Returns its filter and whether that filter has no handlers left.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<(String, bool)> {
        let filter = self
            .topics
            .iter()
            .find(|(_, entry)| entry.handlers.iter().any(|(hid, _)| *hid == id))
            .map(|(filter, _)| filter.clone())?;

        let now_empty = match self.topics.get_mut(&filter) {
            Some(entry) => {
                entry.handlers.retain(|(hid, _)| *hid != id);
                entry.handlers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove(&filter);
        }
        Some((filter, now_empty))
    }

    /// Drop every handler registered under `filter`, returning how many were removed.
    pub fn remove_topic(&mut self, filter: &str) -> usize {
        self.topics
            .remove(filter)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    /// Handlers whose filter matches `topic`, cloned so they can run outside the lock.
    pub fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        self.topics
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .flat_map(|(_, entry)| entry.handlers.iter().map(|(_, h)| h.clone()))
            .collect()
    }

    /// Every filter with its QoS, used to restore subscriptions after a reconnect.
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.topics
            .iter()
            .map(|(filter, entry)| (filter.clone(), entry.qos))
            .collect()
    }

    pub fn contains_filter(&self, filter: &str) -> bool {
        self.topics.contains_key(filter)
    }

    /// Number of registered handlers across all filters.
    pub fn len(&self) -> usize {
        self.topics.values().map(|entry| entry.handlers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: &Arc<AtomicUsize>) -> MessageHandler {
        let counter = counter.clone();
        Arc::new(move |_msg: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("laser_engraver_img", "laser_engraver_img"));
        assert!(!topic_matches("laser_engraver_img", "laser_engraver_img/x"));
        assert!(topic_matches("engraver/+/status", "engraver/1/status"));
        assert!(!topic_matches("engraver/+/status", "engraver/1/2/status"));
        assert!(topic_matches("engraver/#", "engraver/1/2/status"));
        assert!(topic_matches("engraver/#", "engraver"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn test_two_topics_do_not_clobber_each_other() {
        let mut registry = HandlerRegistry::new();
        let images = Arc::new(AtomicUsize::new(0));
        let status = Arc::new(AtomicUsize::new(0));

        registry.add("laser_engraver_img", QoS::AtLeastOnce, counting_handler(&images));
        registry.add("engraver/status", QoS::AtMostOnce, counting_handler(&status));

        let msg = Message {
            topic: "laser_engraver_img".to_string(),
            payload: vec![1, 2, 3],
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        for handler in registry.handlers_for(&msg.topic) {
            handler(&msg);
        }

        assert_eq!(images.load(Ordering::SeqCst), 1);
        assert_eq!(status.load(Ordering::SeqCst), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_reports_last_handler() {
        let mut registry = HandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = registry.add("t", QoS::AtMostOnce, counting_handler(&counter));
        let second = registry.add("t", QoS::AtLeastOnce, counting_handler(&counter));
        assert_eq!(registry.filters(), vec![("t".to_string(), QoS::AtLeastOnce)]);

        assert_eq!(registry.remove(first), Some(("t".to_string(), false)));
        assert_eq!(registry.remove(second), Some(("t".to_string(), true)));
        assert_eq!(registry.remove(second), None);
        assert!(registry.is_empty());
    }
}
