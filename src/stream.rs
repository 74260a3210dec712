//! Per-consumer async sequences over the store's update channels.
//!
//! Each stream owns a registry guard (shared wire subscription) and a
//! private broadcast receiver; both are registered lazily on first poll and
//! released when the stream drops. The backlog is bounded: a consumer that
//! falls behind loses the oldest updates, favoring recency.

use crate::registry::{SubscriptionGuard, SubscriptionRegistry};
use crate::store::{RichChange, RichStoreUpdate, Storage, StoreUpdate, UpdateKind};
use crate::subscription::Subscription;
use futures_util::Stream;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;
use tokio_stream::wrappers::BroadcastStream;

/// Minimal change notification, typed.
#[derive(Debug, Clone)]
pub enum Update<T> {
    Upsert { key: String, data: T },
    Patch { key: String, data: T },
    Delete { key: String },
}

impl<T> Update<T> {
    pub fn key(&self) -> &str {
        match self {
            Update::Upsert { key, .. } => key,
            Update::Patch { key, .. } => key,
            Update::Delete { key } => key,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Update::Upsert { data, .. } => Some(data),
            Update::Patch { data, .. } => Some(data),
            Update::Delete { .. } => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            Update::Upsert { data, .. } => Some(data),
            Update::Patch { data, .. } => Some(data),
            Update::Delete { .. } => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Update::Delete { .. })
    }
}

/// Change notification with before/after context, typed.
#[derive(Debug, Clone)]
pub enum RichUpdate<T> {
    Created {
        key: String,
        data: T,
    },
    Updated {
        key: String,
        before: T,
        after: T,
        patch: Option<Value>,
    },
    Deleted {
        key: String,
        last_known: Option<T>,
    },
}

impl<T> RichUpdate<T> {
    pub fn key(&self) -> &str {
        match self {
            RichUpdate::Created { key, .. } => key,
            RichUpdate::Updated { key, .. } => key,
            RichUpdate::Deleted { key, .. } => key,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            RichUpdate::Created { data, .. } => Some(data),
            RichUpdate::Updated { after, .. } => Some(after),
            RichUpdate::Deleted { last_known, .. } => last_known.as_ref(),
        }
    }

    pub fn before(&self) -> Option<&T> {
        match self {
            RichUpdate::Created { .. } => None,
            RichUpdate::Updated { before, .. } => Some(before),
            RichUpdate::Deleted { last_known, .. } => last_known.as_ref(),
        }
    }

    pub fn patch(&self) -> Option<&Value> {
        match self {
            RichUpdate::Updated { patch, .. } => patch.as_ref(),
            _ => None,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, RichUpdate::Created { .. })
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, RichUpdate::Updated { .. })
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RichUpdate::Deleted { .. })
    }
}

#[derive(Debug, Clone)]
pub enum KeyFilter {
    None,
    Single(String),
}

impl KeyFilter {
    fn matches(&self, key: &str) -> bool {
        match self {
            KeyFilter::None => true,
            KeyFilter::Single(k) => k == key,
        }
    }
}

enum StreamState {
    /// Not yet consuming: the wire subscription and the update receiver are
    /// registered on the first poll.
    Lazy {
        registry: SubscriptionRegistry,
        storage: Arc<dyn Storage>,
        subscription: Subscription,
    },
    ActiveSimple {
        _guard: SubscriptionGuard,
        inner: BroadcastStream<StoreUpdate>,
    },
    ActiveRich {
        _guard: SubscriptionGuard,
        inner: BroadcastStream<RichStoreUpdate>,
    },
    Invalid,
}

pub struct UpdateStream<T> {
    state: StreamState,
    view: String,
    key_filter: KeyFilter,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> UpdateStream<T> {
    pub fn new(
        registry: SubscriptionRegistry,
        storage: Arc<dyn Storage>,
        view: String,
        key_filter: KeyFilter,
        subscription: Subscription,
    ) -> Self {
        Self {
            state: StreamState::Lazy {
                registry,
                storage,
                subscription,
            },
            view,
            key_filter,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Unpin> Stream for UpdateStream<T> {
    type Item = Update<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                StreamState::Lazy { .. } => {
                    let StreamState::Lazy {
                        registry,
                        storage,
                        subscription,
                    } = std::mem::replace(&mut this.state, StreamState::Invalid)
                    else {
                        unreachable!()
                    };
                    let guard = registry.subscribe(subscription);
                    this.state = StreamState::ActiveSimple {
                        _guard: guard,
                        inner: BroadcastStream::new(storage.updates()),
                    };
                }
                StreamState::ActiveSimple { inner, .. } => {
                    match Pin::new(inner).poll_next(cx) {
                        Poll::Ready(Some(Ok(update))) => {
                            if update.view != this.view || !this.key_filter.matches(&update.key) {
                                continue;
                            }
                            if let Some(typed) = typed_update::<T>(update) {
                                return Poll::Ready(Some(typed));
                            }
                        }
                        Poll::Ready(Some(Err(_lagged))) => {
                            tracing::warn!(
                                view = %this.view,
                                "update stream lagged behind, oldest updates were dropped"
                            );
                        }
                        Poll::Ready(None) => return Poll::Ready(None),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                StreamState::ActiveRich { .. } => unreachable!("simple stream in rich state"),
                StreamState::Invalid => panic!("update stream in invalid state"),
            }
        }
    }
}

fn typed_update<T: DeserializeOwned>(update: StoreUpdate) -> Option<Update<T>> {
    match update.kind {
        UpdateKind::Delete => Some(Update::Delete { key: update.key }),
        UpdateKind::Upsert | UpdateKind::Patch => {
            let data = update.data?;
            match serde_json::from_value::<T>(data) {
                Ok(typed) => Some(match update.kind {
                    UpdateKind::Upsert => Update::Upsert {
                        key: update.key,
                        data: typed,
                    },
                    _ => Update::Patch {
                        key: update.key,
                        data: typed,
                    },
                }),
                Err(e) => {
                    tracing::warn!(key = %update.key, error = %e, "update failed to deserialize, skipping");
                    None
                }
            }
        }
    }
}

pub struct RichUpdateStream<T> {
    state: StreamState,
    view: String,
    key_filter: KeyFilter,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> RichUpdateStream<T> {
    pub fn new(
        registry: SubscriptionRegistry,
        storage: Arc<dyn Storage>,
        view: String,
        key_filter: KeyFilter,
        subscription: Subscription,
    ) -> Self {
        Self {
            state: StreamState::Lazy {
                registry,
                storage,
                subscription,
            },
            view,
            key_filter,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Unpin> Stream for RichUpdateStream<T> {
    type Item = RichUpdate<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                StreamState::Lazy { .. } => {
                    let StreamState::Lazy {
                        registry,
                        storage,
                        subscription,
                    } = std::mem::replace(&mut this.state, StreamState::Invalid)
                    else {
                        unreachable!()
                    };
                    let guard = registry.subscribe(subscription);
                    this.state = StreamState::ActiveRich {
                        _guard: guard,
                        inner: BroadcastStream::new(storage.rich_updates()),
                    };
                }
                StreamState::ActiveRich { inner, .. } => {
                    match Pin::new(inner).poll_next(cx) {
                        Poll::Ready(Some(Ok(update))) => {
                            if update.view != this.view || !this.key_filter.matches(&update.key) {
                                continue;
                            }
                            if let Some(typed) = typed_rich_update::<T>(update) {
                                return Poll::Ready(Some(typed));
                            }
                        }
                        Poll::Ready(Some(Err(_lagged))) => {
                            tracing::warn!(
                                view = %this.view,
                                "rich update stream lagged behind, oldest updates were dropped"
                            );
                        }
                        Poll::Ready(None) => return Poll::Ready(None),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                StreamState::ActiveSimple { .. } => unreachable!("rich stream in simple state"),
                StreamState::Invalid => panic!("rich update stream in invalid state"),
            }
        }
    }
}

fn decode_value<T: DeserializeOwned>(value: Value, key: &str, what: &str) -> Option<T> {
    match serde_json::from_value::<T>(value) {
        Ok(typed) => Some(typed),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "{} failed to deserialize, skipping", what);
            None
        }
    }
}

fn typed_rich_update<T: DeserializeOwned>(update: RichStoreUpdate) -> Option<RichUpdate<T>> {
    let RichStoreUpdate { key, change, .. } = update;
    match change {
        RichChange::Created { data } => {
            let data = decode_value(data, &key, "created value")?;
            Some(RichUpdate::Created { key, data })
        }
        RichChange::Updated {
            before,
            after,
            patch,
        } => {
            let before = decode_value(before, &key, "previous value")?;
            let after = decode_value(after, &key, "updated value")?;
            Some(RichUpdate::Updated {
                key,
                before,
                after,
                patch,
            })
        }
        RichChange::Deleted { last_known } => {
            let last_known = last_known.and_then(|v| decode_value(v, &key, "last known value"));
            Some(RichUpdate::Deleted { key, last_known })
        }
    }
}

pin_project! {
    /// Render-frame batching: once an item arrives, further items replace it
    /// until the window elapses, then the latest is emitted. Used by the
    /// `values()` streams when the client's flush interval is non-zero.
    pub struct Coalesced<S, T> {
        #[pin]
        inner: S,
        window: Duration,
        pending: Option<T>,
        delay: Option<Pin<Box<Sleep>>>,
        done: bool,
    }
}

impl<S, T> Coalesced<S, T>
where
    S: Stream<Item = T>,
{
    pub fn new(inner: S, window: Duration) -> Self {
        Self {
            inner,
            window,
            pending: None,
            delay: None,
            done: false,
        }
    }
}

impl<S, T> Stream for Coalesced<S, T>
where
    S: Stream<Item = T>,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if !*this.done {
            loop {
                match this.inner.as_mut().poll_next(cx) {
                    Poll::Ready(Some(item)) => {
                        if this.delay.is_none() {
                            *this.delay = Some(Box::pin(tokio::time::sleep(*this.window)));
                        }
                        *this.pending = Some(item);
                    }
                    Poll::Ready(None) => {
                        *this.done = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if *this.done {
            // Flush whatever is buffered, then end.
            if let Some(item) = this.pending.take() {
                *this.delay = None;
                return Poll::Ready(Some(item));
            }
            return Poll::Ready(None);
        }

        if let Some(delay) = this.delay.as_mut() {
            if delay.as_mut().poll(cx).is_ready() {
                *this.delay = None;
                if let Some(item) = this.pending.take() {
                    return Poll::Ready(Some(item));
                }
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn coalesced_emits_latest_of_a_burst() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut coalesced = Coalesced::new(
            UnboundedReceiverStream::new(rx),
            Duration::from_millis(16),
        );

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        tx.send(3).unwrap();

        assert_eq!(coalesced.next().await, Some(3));

        tx.send(4).unwrap();
        assert_eq!(coalesced.next().await, Some(4));

        drop(tx);
        assert_eq!(coalesced.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_flushes_pending_on_end() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut coalesced = Coalesced::new(
            UnboundedReceiverStream::new(rx),
            Duration::from_secs(3600),
        );

        tx.send(7).unwrap();
        drop(tx);

        // The source ended before the window elapsed; the buffered item
        // still comes out.
        assert_eq!(coalesced.next().await, Some(7));
        assert_eq!(coalesced.next().await, None);
    }
}
