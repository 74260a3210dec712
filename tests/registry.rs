//! Reference-counting laws and stream-driven subscription lifecycles.

use futures_util::StreamExt;
use livestack_sdk::{
    KeyFilter, MemoryStore, RichChange, RichStoreUpdate, RichUpdate, RichUpdateStream, Storage,
    StoreUpdate, Subscription, SubscriptionRegistry, SubscriptionSink, Unsubscription, Update,
    UpdateKind, UpdateStream,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

#[derive(Default)]
struct RecordingSink {
    subscribes: Mutex<Vec<Subscription>>,
    unsubscribes: Mutex<Vec<Unsubscription>>,
}

impl SubscriptionSink for RecordingSink {
    fn send_subscribe(&self, sub: Subscription) {
        self.subscribes.lock().unwrap().push(sub);
    }

    fn send_unsubscribe(&self, unsub: Unsubscription) {
        self.unsubscribes.lock().unwrap().push(unsub);
    }
}

fn setup() -> (Arc<RecordingSink>, SubscriptionRegistry, Arc<dyn Storage>) {
    let sink = Arc::new(RecordingSink::default());
    let registry = SubscriptionRegistry::new(sink.clone());
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    (sink, registry, storage)
}

fn watch_all(
    registry: &SubscriptionRegistry,
    storage: &Arc<dyn Storage>,
    view: &str,
) -> UpdateStream<Value> {
    UpdateStream::new(
        registry.clone(),
        storage.clone(),
        view.to_string(),
        KeyFilter::None,
        Subscription::new(view),
    )
}

#[test]
fn refcount_dedup_law() {
    let (sink, registry, _) = setup();
    let sub = Subscription::new("A/list").with_key("k");

    let first = registry.subscribe(sub.clone());
    let second = registry.subscribe(sub.clone());
    assert_eq!(sink.subscribes.lock().unwrap().len(), 1);

    first.release();
    assert!(sink.unsubscribes.lock().unwrap().is_empty());

    second.release();
    assert_eq!(sink.unsubscribes.lock().unwrap().len(), 1);
    assert_eq!(sink.unsubscribes.lock().unwrap()[0].view, "A/list");
}

#[tokio::test]
async fn two_streams_share_one_wire_subscription() {
    let (sink, registry, storage) = setup();

    let mut s1 = watch_all(&registry, &storage, "A/list");
    let mut s2 = watch_all(&registry, &storage, "A/list");

    // First poll registers; no updates yet, so both sit pending.
    assert!(timeout(Duration::from_millis(50), s1.next()).await.is_err());
    assert!(timeout(Duration::from_millis(50), s2.next()).await.is_err());
    assert_eq!(sink.subscribes.lock().unwrap().len(), 1);

    drop(s1);
    assert!(sink.unsubscribes.lock().unwrap().is_empty());

    drop(s2);
    assert_eq!(sink.unsubscribes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unpolled_stream_never_subscribes() {
    let (sink, registry, storage) = setup();
    let stream = watch_all(&registry, &storage, "A/list");
    drop(stream);
    assert!(sink.subscribes.lock().unwrap().is_empty());
    assert!(sink.unsubscribes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stream_filters_by_view_and_key() {
    let (_sink, registry, storage) = setup();

    let mut stream = UpdateStream::<Value>::new(
        registry.clone(),
        storage.clone(),
        "A/list".to_string(),
        KeyFilter::Single("k".to_string()),
        Subscription::new("A/list").with_key("k"),
    );
    assert!(timeout(Duration::from_millis(50), stream.next())
        .await
        .is_err());

    storage.notify_update(StoreUpdate {
        view: "B/list".to_string(),
        key: "k".to_string(),
        kind: UpdateKind::Upsert,
        data: Some(json!({"n": 1})),
    });
    storage.notify_update(StoreUpdate {
        view: "A/list".to_string(),
        key: "other".to_string(),
        kind: UpdateKind::Upsert,
        data: Some(json!({"n": 2})),
    });
    storage.notify_update(StoreUpdate {
        view: "A/list".to_string(),
        key: "k".to_string(),
        kind: UpdateKind::Upsert,
        data: Some(json!({"n": 3})),
    });

    let update = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    match update {
        Update::Upsert { key, data } => {
            assert_eq!(key, "k");
            assert_eq!(data, json!({"n": 3}));
        }
        other => panic!("expected upsert, got {:?}", other),
    }
}

#[tokio::test]
async fn stream_delivers_deletes_and_patches_in_order() {
    let (_sink, registry, storage) = setup();
    let mut stream = watch_all(&registry, &storage, "A/list");
    assert!(timeout(Duration::from_millis(50), stream.next())
        .await
        .is_err());

    storage.notify_update(StoreUpdate {
        view: "A/list".to_string(),
        key: "k".to_string(),
        kind: UpdateKind::Patch,
        data: Some(json!({"n": 1})),
    });
    storage.notify_update(StoreUpdate {
        view: "A/list".to_string(),
        key: "k".to_string(),
        kind: UpdateKind::Delete,
        data: None,
    });

    let first = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Update::Patch { .. }));

    let second = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(second.is_delete());
    assert_eq!(second.key(), "k");
}

#[tokio::test]
async fn rich_stream_types_all_three_changes() {
    let (_sink, registry, storage) = setup();

    let mut stream = RichUpdateStream::<Value>::new(
        registry.clone(),
        storage.clone(),
        "A/list".to_string(),
        KeyFilter::None,
        Subscription::new("A/list"),
    );
    assert!(timeout(Duration::from_millis(50), stream.next())
        .await
        .is_err());

    storage.notify_rich_update(RichStoreUpdate {
        view: "A/list".to_string(),
        key: "k".to_string(),
        change: RichChange::Created {
            data: json!({"n": 1}),
        },
    });
    storage.notify_rich_update(RichStoreUpdate {
        view: "A/list".to_string(),
        key: "k".to_string(),
        change: RichChange::Updated {
            before: json!({"n": 1}),
            after: json!({"n": 2}),
            patch: Some(json!({"n": 2})),
        },
    });
    storage.notify_rich_update(RichStoreUpdate {
        view: "A/list".to_string(),
        key: "k".to_string(),
        change: RichChange::Deleted {
            last_known: Some(json!({"n": 2})),
        },
    });

    let created = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert!(created.is_created());

    let updated = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    match &updated {
        RichUpdate::Updated { before, after, .. } => {
            assert_eq!(before, &json!({"n": 1}));
            assert_eq!(after, &json!({"n": 2}));
        }
        other => panic!("expected updated, got {:?}", other),
    }
    assert_eq!(updated.patch().unwrap(), &json!({"n": 2}));

    let deleted = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    match deleted {
        RichUpdate::Deleted { last_known, .. } => {
            assert_eq!(last_known.unwrap(), json!({"n": 2}));
        }
        other => panic!("expected deleted, got {:?}", other),
    }
}

#[tokio::test]
async fn subscribe_release_leaves_no_storage_change() {
    let (sink, registry, storage) = setup();

    let guard = registry.subscribe(Subscription::new("A/list"));
    guard.release();

    assert_eq!(sink.subscribes.lock().unwrap().len(), 1);
    assert_eq!(sink.unsubscribes.lock().unwrap().len(), 1);
    assert_eq!(storage.size("A/list").await, 0);
    assert!(registry.is_empty());
}
