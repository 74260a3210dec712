//! Reference-counted multiplexing of logical subscriptions onto the
//! connection. Many consumers with the same intent share one wire
//! subscription; the last one out sends the unsubscribe.

use crate::subscription::{Subscription, Unsubscription};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The seam between the registry and the transport. Implemented by the
/// connection manager; tests substitute a recording sink.
pub trait SubscriptionSink: Send + Sync {
    fn send_subscribe(&self, sub: Subscription);
    fn send_unsubscribe(&self, unsub: Unsubscription);
}

struct Tracker {
    subscription: Subscription,
    ref_count: usize,
}

struct RegistryInner {
    trackers: Mutex<HashMap<String, Tracker>>,
    sink: Arc<dyn SubscriptionSink>,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn SubscriptionSink>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                trackers: Mutex::new(HashMap::new()),
                sink,
            }),
        }
    }

    /// Registers interest. The wire subscribe goes out only when the ref
    /// count goes 0 → 1. The returned guard releases on drop.
    pub fn subscribe(&self, sub: Subscription) -> SubscriptionGuard {
        let sub_key = sub.sub_key();
        let is_new = {
            let mut trackers = self.inner.trackers.lock().expect("registry lock poisoned");
            match trackers.get_mut(&sub_key) {
                Some(tracker) => {
                    tracker.ref_count += 1;
                    false
                }
                None => {
                    trackers.insert(
                        sub_key.clone(),
                        Tracker {
                            subscription: sub.clone(),
                            ref_count: 1,
                        },
                    );
                    true
                }
            }
        };
        if is_new {
            tracing::debug!(sub_key = %sub_key, "forwarding new subscription");
            self.inner.sink.send_subscribe(sub);
        }
        SubscriptionGuard {
            inner: self.inner.clone(),
            sub_key,
            released: false,
        }
    }

    /// Force-releases every tracker, issuing a wire unsubscribe for each.
    /// Guards that outlive this call become no-ops.
    pub fn clear(&self) {
        let trackers: Vec<Tracker> = {
            let mut map = self.inner.trackers.lock().expect("registry lock poisoned");
            map.drain().map(|(_, t)| t).collect()
        };
        for tracker in trackers {
            self.inner
                .sink
                .send_unsubscribe(Unsubscription::from(&tracker.subscription));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.trackers.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One consumer's hold on a shared subscription. Dropping it (or calling
/// [`release`](Self::release)) decrements the count; at zero the tracker is
/// removed and the unsubscribe is forwarded.
pub struct SubscriptionGuard {
    inner: Arc<RegistryInner>,
    sub_key: String,
    released: bool,
}

impl SubscriptionGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let unsub = {
            let mut trackers = self.inner.trackers.lock().expect("registry lock poisoned");
            match trackers.get_mut(&self.sub_key) {
                Some(tracker) => {
                    tracker.ref_count -= 1;
                    if tracker.ref_count == 0 {
                        let tracker = trackers
                            .remove(&self.sub_key)
                            .expect("tracker present at zero count");
                        Some(Unsubscription::from(&tracker.subscription))
                    } else {
                        None
                    }
                }
                // Cleared out from under us; nothing left to release.
                None => None,
            }
        };
        if let Some(unsub) = unsub {
            tracing::debug!(sub_key = %self.sub_key, "last reference released, unsubscribing");
            self.inner.sink.send_unsubscribe(unsub);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
