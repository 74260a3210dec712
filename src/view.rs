//! Typed view handles bound to the storage adapter and the subscription
//! registry. A state view addresses entities by key; a list view covers a
//! whole collection.

use crate::registry::SubscriptionRegistry;
use crate::store::Storage;
use crate::stream::{Coalesced, KeyFilter, RichUpdateStream, Update, UpdateStream};
use crate::subscription::Subscription;
use futures_util::future::Either;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Options for list-view streaming methods. `take(1)` narrows a collection
/// subscription to its first value.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub take: Option<usize>,
    pub skip: Option<usize>,
}

impl WatchOptions {
    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    fn apply(self, mut sub: Subscription) -> Subscription {
        if let Some(take) = self.take {
            sub = sub.with_take(take);
        }
        if let Some(skip) = self.skip {
            sub = sub.with_skip(skip);
        }
        sub
    }
}

/// Per-entity view: `get` by key, streams narrowed to `(view, key)`.
pub struct StateView<T> {
    registry: SubscriptionRegistry,
    storage: Arc<dyn Storage>,
    view_path: String,
    flush_interval: Duration,
    _marker: PhantomData<T>,
}

impl<T> StateView<T>
where
    T: DeserializeOwned + Unpin + Send + 'static,
{
    pub(crate) fn new(
        registry: SubscriptionRegistry,
        storage: Arc<dyn Storage>,
        view_path: String,
        flush_interval: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            view_path,
            flush_interval,
            _marker: PhantomData,
        }
    }

    /// Current value for the key, or `None` for a view or key the adapter
    /// has never seen. Does not register a subscription.
    pub async fn get(&self, key: &str) -> Option<T> {
        let value = self.storage.get(&self.view_path, key).await?;
        serde_json::from_value(value).ok()
    }

    /// Watch updates for one key.
    pub fn watch(&self, key: &str) -> UpdateStream<T> {
        UpdateStream::new(
            self.registry.clone(),
            self.storage.clone(),
            self.view_path.clone(),
            KeyFilter::Single(key.to_string()),
            Subscription::new(&self.view_path).with_key(key),
        )
    }

    /// Watch updates for one key with before/after context.
    pub fn watch_rich(&self, key: &str) -> RichUpdateStream<T> {
        RichUpdateStream::new(
            self.registry.clone(),
            self.storage.clone(),
            self.view_path.clone(),
            KeyFilter::Single(key.to_string()),
            Subscription::new(&self.view_path).with_key(key),
        )
    }

    /// Stream of the key's values, coalesced through the client's flush
    /// window when one is configured.
    pub fn values(&self, key: &str) -> impl Stream<Item = T> {
        coalesce(self.watch(key), self.flush_interval)
    }
}

/// Collection view: ordered `get`, whole-view streams with an optional
/// take/skip window.
pub struct ListView<T> {
    registry: SubscriptionRegistry,
    storage: Arc<dyn Storage>,
    view_path: String,
    flush_interval: Duration,
    _marker: PhantomData<T>,
}

impl<T> ListView<T>
where
    T: DeserializeOwned + Unpin + Send + 'static,
{
    pub(crate) fn new(
        registry: SubscriptionRegistry,
        storage: Arc<dyn Storage>,
        view_path: String,
        flush_interval: Duration,
    ) -> Self {
        Self {
            registry,
            storage,
            view_path,
            flush_interval,
            _marker: PhantomData,
        }
    }

    /// All current values, in view order (configured sort, else insertion).
    pub async fn get(&self) -> Vec<T> {
        self.storage
            .get_all(&self.view_path)
            .await
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    pub fn watch(&self, opts: WatchOptions) -> UpdateStream<T> {
        UpdateStream::new(
            self.registry.clone(),
            self.storage.clone(),
            self.view_path.clone(),
            KeyFilter::None,
            opts.apply(Subscription::new(&self.view_path)),
        )
    }

    pub fn watch_rich(&self, opts: WatchOptions) -> RichUpdateStream<T> {
        RichUpdateStream::new(
            self.registry.clone(),
            self.storage.clone(),
            self.view_path.clone(),
            KeyFilter::None,
            opts.apply(Subscription::new(&self.view_path)),
        )
    }

    pub fn values(&self, opts: WatchOptions) -> impl Stream<Item = T> {
        coalesce(self.watch(opts), self.flush_interval)
    }
}

fn coalesce<T, S>(stream: S, window: Duration) -> impl Stream<Item = T>
where
    S: Stream<Item = Update<T>>,
{
    let data = stream.filter_map(|update| futures_util::future::ready(update.into_data()));
    if window.is_zero() {
        Either::Left(data)
    } else {
        Either::Right(Coalesced::new(data, window))
    }
}
