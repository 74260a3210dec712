//! Client-to-server subscription messages and the connection's active set.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe(Subscription),
    Unsubscribe(Unsubscription),
    Ping,
}

/// A logical interest in a view, possibly narrowed by key, partition,
/// filters, or a take/skip window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub view: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unsubscription {
    pub view: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Subscription {
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            key: None,
            partition: None,
            filters: None,
            take: None,
            skip: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_filters(mut self, filters: HashMap<String, String>) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Deduplication key covering every field of the subscription. Filters
    /// serialize key-sorted so equal intents always collapse.
    pub fn sub_key(&self) -> String {
        let filters: BTreeMap<&String, &String> = self
            .filters
            .iter()
            .flat_map(|f| f.iter())
            .collect();
        let filters_str = serde_json::to_string(&filters).unwrap_or_else(|_| "{}".to_string());
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.view,
            self.key.as_deref().unwrap_or("*"),
            self.partition.as_deref().unwrap_or(""),
            filters_str,
            self.take.map(|t| t.to_string()).unwrap_or_default(),
            self.skip.map(|s| s.to_string()).unwrap_or_default(),
        )
    }
}

impl Unsubscription {
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    fn matches(&self, sub: &Subscription) -> bool {
        self.view == sub.view && self.key == sub.key
    }
}

impl From<&Subscription> for Unsubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            view: sub.view.clone(),
            key: sub.key.clone(),
        }
    }
}

/// Insertion-ordered set of the subscriptions currently held against the
/// server. Order is preserved so a reconnect replays intents in the order
/// they were first subscribed.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    order: Vec<String>,
    subs: HashMap<String, Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the subscription was newly added.
    pub fn add(&mut self, sub: Subscription) -> bool {
        let key = sub.sub_key();
        if self.subs.contains_key(&key) {
            return false;
        }
        self.order.push(key.clone());
        self.subs.insert(key, sub);
        true
    }

    /// Removes every entry matching the unsubscription's view and key.
    /// Returns true if anything was removed.
    pub fn remove_matching(&mut self, unsub: &Unsubscription) -> bool {
        let removed: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, sub)| unsub.matches(sub))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &removed {
            self.subs.remove(key);
        }
        self.order.retain(|k| !removed.contains(k));
        !removed.is_empty()
    }

    pub fn contains(&self, sub: &Subscription) -> bool {
        self.subs.contains_key(&sub.sub_key())
    }

    pub fn contains_matching(&self, unsub: &Unsubscription) -> bool {
        self.subs.values().any(|sub| unsub.matches(sub))
    }

    /// All subscriptions, in first-subscribe order.
    pub fn all(&self) -> Vec<Subscription> {
        self.order
            .iter()
            .filter_map(|k| self.subs.get(k).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_message_shape() {
        let msg = ClientMessage::Subscribe(
            Subscription::new("Round/list").with_key("835").with_take(10),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["view"], "Round/list");
        assert_eq!(json["key"], "835");
        assert_eq!(json["take"], 10);
        assert!(json.get("partition").is_none());
        assert!(json.get("filters").is_none());
    }

    #[test]
    fn ping_message_shape() {
        let json = serde_json::to_value(&ClientMessage::Ping).unwrap();
        assert_eq!(json, json!({"type": "ping"}));
    }

    #[test]
    fn unsubscribe_message_shape() {
        let msg = ClientMessage::Unsubscribe(Unsubscription::new("Round/list").with_key("835"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "unsubscribe");
        assert_eq!(json["view"], "Round/list");
        assert_eq!(json["key"], "835");
    }

    #[test]
    fn sub_key_distinguishes_fields() {
        let plain = Subscription::new("Round/list");
        let keyed = Subscription::new("Round/list").with_key("835");
        let windowed = Subscription::new("Round/list").with_take(5).with_skip(2);
        assert_ne!(plain.sub_key(), keyed.sub_key());
        assert_ne!(plain.sub_key(), windowed.sub_key());
    }

    #[test]
    fn sub_key_is_stable_across_filter_order() {
        let mut a = HashMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());
        let mut b = HashMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());

        let first = Subscription::new("Round/list").with_filters(a);
        let second = Subscription::new("Round/list").with_filters(b);
        assert_eq!(first.sub_key(), second.sub_key());
    }

    #[test]
    fn set_preserves_first_subscribe_order() {
        let mut set = SubscriptionSet::new();
        assert!(set.add(Subscription::new("B/list")));
        assert!(set.add(Subscription::new("A/list")));
        assert!(!set.add(Subscription::new("B/list")));

        let views: Vec<String> = set.all().into_iter().map(|s| s.view).collect();
        assert_eq!(views, vec!["B/list".to_string(), "A/list".to_string()]);
    }

    #[test]
    fn remove_matching_is_idempotent() {
        let mut set = SubscriptionSet::new();
        set.add(Subscription::new("Round/list").with_key("1"));
        let unsub = Unsubscription::new("Round/list").with_key("1");
        assert!(set.remove_matching(&unsub));
        assert!(!set.remove_matching(&unsub));
        assert!(set.is_empty());
    }
}
