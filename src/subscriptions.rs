use crate::message::{PacketMeta, QoS};
use crate::topic;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Distinguishes logical subscribers sharing one wire subscription.
pub type RefKey = String;

/// Ref key used by callers that only ever hold one subscription per filter.
pub const DEFAULT_REF_KEY: &str = "0";

pub type MessageHandler = Arc<dyn Fn(&str, &[u8], &PacketMeta) + Send + Sync>;

#[derive(Clone)]
pub struct SubscriptionEntry {
    pub filter: String,
    pub qos: QoS,
    pub handler: MessageHandler,
    pub ref_key: RefKey,
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("ref_key", &self.ref_key)
            .finish()
    }
}

/// What removing an entry did to its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotFound,
    /// Entries remain; the group's effective QoS is now this.
    Remaining(QoS),
    /// That was the last entry; the wire subscription should go.
    GroupEmptied,
}

/// Topic filter -> ref key -> entry.
///
/// The effective wire QoS of a filter is the maximum QoS requested by its entries.
#[derive(Default)]
pub struct SubscriptionRegistry {
    groups: BTreeMap<String, BTreeMap<RefKey, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for (filter, ref key) and returns the group's new
    /// effective QoS.
    pub fn insert(&mut self, entry: SubscriptionEntry) -> QoS {
        let group = self.groups.entry(entry.filter.clone()).or_default();
        group.insert(entry.ref_key.clone(), entry);
        max_qos(group)
    }

    pub fn remove(&mut self, filter: &str, ref_key: &str) -> Removal {
        let Some(group) = self.groups.get_mut(filter) else {
            return Removal::NotFound;
        };
        if group.remove(ref_key).is_none() {
            return Removal::NotFound;
        }
        if group.is_empty() {
            self.groups.remove(filter);
            Removal::GroupEmptied
        } else {
            Removal::Remaining(max_qos(group))
        }
    }

    pub fn effective_qos(&self, filter: &str) -> Option<QoS> {
        self.groups.get(filter).map(max_qos)
    }

    /// Every filter with its effective QoS, in filter order.
    pub fn wire_subscriptions(&self) -> Vec<(String, QoS)> {
        self.groups
            .iter()
            .map(|(filter, group)| (filter.clone(), max_qos(group)))
            .collect()
    }

    pub fn ref_keys(&self, filter: &str) -> Vec<RefKey> {
        self.groups
            .get(filter)
            .map(|group| group.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Handlers of every entry whose filter matches `topic`, one per entry.
    pub fn matching_handlers(&self, topic: &str) -> Vec<MessageHandler> {
        self.groups
            .iter()
            .filter(|(filter, _)| topic::matches(filter, topic))
            .flat_map(|(_, group)| group.values().map(|entry| entry.handler.clone()))
            .collect()
    }

    /// Number of entries across all filters.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn max_qos(group: &BTreeMap<RefKey, SubscriptionEntry>) -> QoS {
    group
        .values()
        .map(|entry| entry.qos)
        .max()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(filter: &str, qos: QoS, ref_key: &str) -> SubscriptionEntry {
        SubscriptionEntry {
            filter: filter.to_string(),
            qos,
            handler: Arc::new(|_: &str, _: &[u8], _: &PacketMeta| {}),
            ref_key: ref_key.to_string(),
        }
    }

    #[test]
    fn effective_qos_is_group_maximum() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.insert(entry("a/b", QoS::AtMostOnce, "n1")), QoS::AtMostOnce);
        assert_eq!(registry.insert(entry("a/b", QoS::ExactlyOnce, "n2")), QoS::ExactlyOnce);
        assert_eq!(registry.effective_qos("a/b"), Some(QoS::ExactlyOnce));
        assert_eq!(registry.remove("a/b", "n2"), Removal::Remaining(QoS::AtMostOnce));
        assert_eq!(registry.effective_qos("a/b"), Some(QoS::AtMostOnce));
    }

    #[test]
    fn same_ref_key_overwrites() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(entry("a/b", QoS::ExactlyOnce, "n1"));
        registry.insert(entry("a/b", QoS::AtMostOnce, "n1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.effective_qos("a/b"), Some(QoS::AtMostOnce));
    }

    #[test]
    fn removing_last_entry_drops_group() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(entry("a/b", QoS::AtLeastOnce, "n1"));
        assert_eq!(registry.remove("a/b", "n1"), Removal::GroupEmptied);
        assert!(registry.is_empty());
        assert_eq!(registry.effective_qos("a/b"), None);
    }

    #[test]
    fn removal_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(entry("a/b", QoS::AtLeastOnce, "n1"));
        assert_eq!(registry.remove("a/b", "n2"), Removal::NotFound);
        assert_eq!(registry.remove("x", "n1"), Removal::NotFound);
        assert_eq!(registry.remove("a/b", "n1"), Removal::GroupEmptied);
        assert_eq!(registry.remove("a/b", "n1"), Removal::NotFound);
    }

    #[test]
    fn matching_handlers_fan_out_per_entry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = SubscriptionRegistry::new();
        for (filter, key) in [("a/+", "n1"), ("a/+", "n2"), ("a/#", "n1"), ("b/#", "n1")] {
            let hits = hits.clone();
            registry.insert(SubscriptionEntry {
                filter: filter.to_string(),
                qos: QoS::AtMostOnce,
                handler: Arc::new(move |_: &str, _: &[u8], _: &PacketMeta| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
                ref_key: key.to_string(),
            });
        }
        let handlers = registry.matching_handlers("a/x");
        assert_eq!(handlers.len(), 3);
        for handler in handlers {
            handler("a/x", b"", &PacketMeta::default());
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(registry.matching_handlers("c").is_empty());
    }

    #[test]
    fn wire_subscriptions_aggregate_per_filter() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(entry("a", QoS::AtMostOnce, "1"));
        registry.insert(entry("a", QoS::AtLeastOnce, "2"));
        registry.insert(entry("b", QoS::ExactlyOnce, "1"));
        assert_eq!(
            registry.wire_subscriptions(),
            vec![("a".to_string(), QoS::AtLeastOnce), ("b".to_string(), QoS::ExactlyOnce)]
        );
        assert_eq!(registry.ref_keys("a"), vec!["1".to_string(), "2".to_string()]);
        assert_eq!(registry.len(), 3);
    }
}
