//! Storage adapter: per-view key/value state with ordering, eviction, and
//! update fan-out. [`MemoryStore`] is the default backend; alternative
//! backends implement [`Storage`].

use crate::frame::{SortConfig, SortOrder};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the simple and rich update channels. Overflow drops the
/// oldest queued update (recency wins for UI consumers).
pub const UPDATE_BACKLOG: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Upsert,
    Patch,
    Delete,
}

/// Minimal change notification for one entity.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub view: String,
    pub key: String,
    pub kind: UpdateKind,
    /// Full value for upserts, the raw delta for patches, absent for deletes.
    pub data: Option<Value>,
}

/// Change notification carrying before/after context.
#[derive(Debug, Clone)]
pub struct RichStoreUpdate {
    pub view: String,
    pub key: String,
    pub change: RichChange,
}

#[derive(Debug, Clone)]
pub enum RichChange {
    Created {
        data: Value,
    },
    Updated {
        before: Value,
        after: Value,
        patch: Option<Value>,
    },
    Deleted {
        last_known: Option<Value>,
    },
}

/// Capability interface over per-view storage. Writes come only from the
/// frame processor; reads may happen from any task and observe a consistent
/// snapshot (the in-memory backend copies out under its read lock).
///
/// For every mutation the simple update is published before the rich one.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, view: &str, key: &str) -> Option<Value>;
    /// Values in view order: configured sort order, else insertion order.
    async fn get_all(&self, view: &str) -> Vec<Value>;
    async fn has(&self, view: &str, key: &str) -> bool;
    async fn keys(&self, view: &str) -> Vec<String>;
    async fn size(&self, view: &str) -> usize;
    async fn set(&self, view: &str, key: &str, value: Value);
    /// Removes the entry, returning the value that was present.
    async fn delete(&self, view: &str, key: &str) -> Option<Value>;
    /// Clears one view, or every view when `None`.
    async fn clear(&self, view: Option<&str>);
    /// Removes the least-recently-updated entry (unsorted views) or the
    /// last entry in enumeration order (sorted views).
    async fn evict_oldest(&self, view: &str) -> Option<(String, Value)>;
    /// Once-only sort binding. A view that already has a config keeps it.
    async fn set_view_config(&self, view: &str, config: SortConfig);
    async fn get_view_config(&self, view: &str) -> Option<SortConfig>;

    fn notify_update(&self, update: StoreUpdate);
    fn notify_rich_update(&self, update: RichStoreUpdate);
    fn updates(&self) -> broadcast::Receiver<StoreUpdate>;
    fn rich_updates(&self) -> broadcast::Receiver<RichStoreUpdate>;
}

/// f64 with a total order; NaN sorts below every other value.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedFloat(f64);

impl Eq for OrderedFloat {}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or_else(|| {
            if self.0.is_nan() && other.0.is_nan() {
                Ordering::Equal
            } else if self.0.is_nan() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        })
    }
}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Comparable sort value extracted from an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SortValue {
    Null,
    Bool(bool),
    Number(OrderedFloat),
    Text(String),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Null => 0,
            SortValue::Bool(_) => 1,
            SortValue::Number(_) => 2,
            SortValue::Text(_) => 3,
        }
    }

    fn render(&self) -> String {
        match self {
            SortValue::Null => String::new(),
            SortValue::Bool(b) => b.to_string(),
            SortValue::Number(n) => n.0.to_string(),
            SortValue::Text(s) => s.clone(),
        }
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortValue::Null, SortValue::Null) => Ordering::Equal,
            (SortValue::Null, _) => Ordering::Less,
            (_, SortValue::Null) => Ordering::Greater,
            (SortValue::Bool(a), SortValue::Bool(b)) => a.cmp(b),
            (SortValue::Number(a), SortValue::Number(b)) => a.cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            // Mixed concrete types compare by string rendering, with the
            // variant rank keeping the order antisymmetric on ties.
            (a, b) => match a.render().cmp(&b.render()) {
                Ordering::Equal => a.rank().cmp(&b.rank()),
                other => other,
            },
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// (sort value, entity key) pair; the key tie-break keeps ordering total
/// and deterministic when sort values collide.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SortKey {
    sort_value: SortValue,
    entity_key: String,
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.sort_value.cmp(&other.sort_value) {
            Ordering::Equal => self.entity_key.cmp(&other.entity_key),
            other => other,
        }
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn extract_sort_value(entity: &Value, field_path: &[String]) -> SortValue {
    let mut current = entity;
    for segment in field_path {
        match current.get(segment) {
            Some(v) => current = v,
            None => return SortValue::Null,
        }
    }

    match current {
        Value::Bool(b) => SortValue::Bool(*b),
        Value::Number(n) => n
            .as_f64()
            .map(|f| SortValue::Number(OrderedFloat(f)))
            .unwrap_or(SortValue::Null),
        Value::String(s) => SortValue::Text(s.clone()),
        _ => SortValue::Null,
    }
}

struct ViewData {
    entities: HashMap<String, Value>,
    /// Touch order for unsorted views; head is the eviction candidate.
    access_order: VecDeque<String>,
    sort_config: Option<SortConfig>,
    sorted_keys: BTreeMap<SortKey, ()>,
}

impl ViewData {
    fn new(sort_config: Option<SortConfig>) -> Self {
        Self {
            entities: HashMap::new(),
            access_order: VecDeque::new(),
            sort_config,
            sorted_keys: BTreeMap::new(),
        }
    }

    fn set_sort_config(&mut self, config: SortConfig) {
        if self.sort_config.is_some() {
            return;
        }
        self.sort_config = Some(config);
        self.rebuild_order();
    }

    fn rebuild_order(&mut self) {
        self.sorted_keys.clear();
        if let Some(config) = &self.sort_config {
            for (key, value) in &self.entities {
                self.sorted_keys.insert(
                    SortKey {
                        sort_value: extract_sort_value(value, &config.field),
                        entity_key: key.clone(),
                    },
                    (),
                );
            }
        }
        self.access_order.clear();
    }

    fn sort_key_for(&self, key: &str, value: &Value) -> Option<SortKey> {
        self.sort_config.as_ref().map(|config| SortKey {
            sort_value: extract_sort_value(value, &config.field),
            entity_key: key.to_string(),
        })
    }

    fn insert(&mut self, key: String, value: Value) {
        if self.sort_config.is_some() {
            if let Some(old) = self.entities.get(&key) {
                if let Some(old_key) = self.sort_key_for(&key, old) {
                    self.sorted_keys.remove(&old_key);
                }
            }
            if let Some(sort_key) = self.sort_key_for(&key, &value) {
                self.sorted_keys.insert(sort_key, ());
            }
        } else if self.entities.contains_key(&key) {
            self.access_order.retain(|k| k != &key);
            self.access_order.push_back(key.clone());
        } else {
            self.access_order.push_back(key.clone());
        }
        self.entities.insert(key, value);
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        if self.sort_config.is_some() {
            if let Some(value) = self.entities.get(key) {
                if let Some(sort_key) = self.sort_key_for(key, value) {
                    self.sorted_keys.remove(&sort_key);
                }
            }
        } else {
            self.access_order.retain(|k| k != key);
        }
        self.entities.remove(key)
    }

    fn evict_oldest(&mut self) -> Option<(String, Value)> {
        if let Some(config) = &self.sort_config {
            // Tail of the enumeration order is the lowest-priority entry.
            let victim = match config.order {
                SortOrder::Asc => self.sorted_keys.keys().next_back().cloned(),
                SortOrder::Desc => self.sorted_keys.keys().next().cloned(),
            }?;
            self.sorted_keys.remove(&victim);
            let value = self.entities.remove(&victim.entity_key)?;
            return Some((victim.entity_key, value));
        }

        let oldest = self.access_order.pop_front()?;
        let value = self.entities.remove(&oldest)?;
        Some((oldest, value))
    }

    fn len(&self) -> usize {
        self.entities.len()
    }

    fn ordered_keys(&self) -> Vec<String> {
        if let Some(config) = &self.sort_config {
            let keys: Vec<String> = self
                .sorted_keys
                .keys()
                .map(|sk| sk.entity_key.clone())
                .collect();
            match config.order {
                SortOrder::Asc => keys,
                SortOrder::Desc => keys.into_iter().rev().collect(),
            }
        } else {
            self.access_order.iter().cloned().collect()
        }
    }

    fn ordered_values(&self) -> Vec<Value> {
        self.ordered_keys()
            .iter()
            .filter_map(|k| self.entities.get(k).cloned())
            .collect()
    }
}

/// Default in-memory storage backend.
pub struct MemoryStore {
    views: Arc<RwLock<HashMap<String, ViewData>>>,
    /// Sort configs can arrive before the first entity of a view; they are
    /// held here and attached when the view materializes.
    view_configs: Arc<RwLock<HashMap<String, SortConfig>>>,
    updates_tx: broadcast::Sender<StoreUpdate>,
    rich_tx: broadcast::Sender<RichStoreUpdate>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_BACKLOG);
        let (rich_tx, _) = broadcast::channel(UPDATE_BACKLOG);
        Self {
            views: Arc::new(RwLock::new(HashMap::new())),
            view_configs: Arc::new(RwLock::new(HashMap::new())),
            updates_tx,
            rich_tx,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            views: self.views.clone(),
            view_configs: self.view_configs.clone(),
            updates_tx: self.updates_tx.clone(),
            rich_tx: self.rich_tx.clone(),
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, view: &str, key: &str) -> Option<Value> {
        let views = self.views.read().await;
        views.get(view)?.entities.get(key).cloned()
    }

    async fn get_all(&self, view: &str) -> Vec<Value> {
        let views = self.views.read().await;
        views
            .get(view)
            .map(|v| v.ordered_values())
            .unwrap_or_default()
    }

    async fn has(&self, view: &str, key: &str) -> bool {
        let views = self.views.read().await;
        views
            .get(view)
            .map(|v| v.entities.contains_key(key))
            .unwrap_or(false)
    }

    async fn keys(&self, view: &str) -> Vec<String> {
        let views = self.views.read().await;
        views
            .get(view)
            .map(|v| v.ordered_keys())
            .unwrap_or_default()
    }

    async fn size(&self, view: &str) -> usize {
        let views = self.views.read().await;
        views.get(view).map(|v| v.len()).unwrap_or(0)
    }

    async fn set(&self, view: &str, key: &str, value: Value) {
        let sort_config = self.view_configs.read().await.get(view).cloned();
        let mut views = self.views.write().await;
        let view_data = views
            .entry(view.to_string())
            .or_insert_with(|| ViewData::new(sort_config));
        view_data.insert(key.to_string(), value);
    }

    async fn delete(&self, view: &str, key: &str) -> Option<Value> {
        let mut views = self.views.write().await;
        views.get_mut(view)?.remove(key)
    }

    async fn clear(&self, view: Option<&str>) {
        let mut views = self.views.write().await;
        match view {
            Some(view) => {
                views.remove(view);
            }
            None => views.clear(),
        }
    }

    async fn evict_oldest(&self, view: &str) -> Option<(String, Value)> {
        let mut views = self.views.write().await;
        let evicted = views.get_mut(view)?.evict_oldest();
        if let Some((key, _)) = &evicted {
            tracing::debug!(view, key = key.as_str(), "evicted oldest entry");
        }
        evicted
    }

    async fn set_view_config(&self, view: &str, config: SortConfig) {
        {
            let mut configs = self.view_configs.write().await;
            if configs.contains_key(view) {
                return;
            }
            configs.insert(view.to_string(), config.clone());
        }
        let mut views = self.views.write().await;
        if let Some(view_data) = views.get_mut(view) {
            view_data.set_sort_config(config);
        }
    }

    async fn get_view_config(&self, view: &str) -> Option<SortConfig> {
        self.view_configs.read().await.get(view).cloned()
    }

    fn notify_update(&self, update: StoreUpdate) {
        let _ = self.updates_tx.send(update);
    }

    fn notify_rich_update(&self, update: RichStoreUpdate) {
        let _ = self.rich_tx.send(update);
    }

    fn updates(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates_tx.subscribe()
    }

    fn rich_updates(&self) -> broadcast::Receiver<RichStoreUpdate> {
        self.rich_tx.subscribe()
    }
}
