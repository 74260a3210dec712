//! Frame processor: applies decoded frames to the storage adapter and
//! publishes simple and rich update notifications.

use crate::frame::{EntityFrame, EntityOp, Frame, SnapshotFrame, SubscribedFrame};
use crate::store::{RichChange, RichStoreUpdate, Storage, StoreUpdate, UpdateKind};
use serde_json::Value;
use std::sync::Arc;

pub struct FrameProcessor {
    storage: Arc<dyn Storage>,
    max_entries_per_view: Option<usize>,
}

impl FrameProcessor {
    pub fn new(storage: Arc<dyn Storage>, max_entries_per_view: Option<usize>) -> Self {
        Self {
            storage,
            max_entries_per_view,
        }
    }

    pub async fn apply(&self, frame: Frame) {
        match frame {
            Frame::Subscribed(frame) => self.apply_subscribed(frame).await,
            Frame::Snapshot(frame) => self.apply_snapshot(frame).await,
            Frame::Entity(frame) => self.apply_entity(frame).await,
        }
    }

    async fn apply_subscribed(&self, frame: SubscribedFrame) {
        tracing::debug!(view = %frame.view, sort = ?frame.sort, "subscription acknowledged");
        if let Some(sort) = frame.sort {
            self.storage.set_view_config(&frame.view, sort).await;
        }
    }

    async fn apply_snapshot(&self, frame: SnapshotFrame) {
        tracing::debug!(view = %frame.view, count = frame.entities.len(), "applying snapshot");
        for entity in frame.entities {
            let before = self.storage.get(&frame.view, &entity.key).await;
            self.storage
                .set(&frame.view, &entity.key, entity.data.clone())
                .await;
            self.publish_upsert(&frame.view, &entity.key, entity.data, before);
        }
        self.enforce_bound(&frame.view).await;
    }

    async fn apply_entity(&self, frame: EntityFrame) {
        tracing::debug!(view = %frame.view, key = %frame.key, op = ?frame.op, "applying frame");
        match frame.op {
            EntityOp::Create | EntityOp::Upsert => {
                let before = self.storage.get(&frame.view, &frame.key).await;
                self.storage
                    .set(&frame.view, &frame.key, frame.data.clone())
                    .await;
                self.enforce_bound(&frame.view).await;
                self.publish_upsert(&frame.view, &frame.key, frame.data, before);
            }
            EntityOp::Patch => {
                let before = self.storage.get(&frame.view, &frame.key).await;
                let merged = match &before {
                    Some(existing) => {
                        let mut target = existing.clone();
                        deep_merge_with_append(&mut target, &frame.data, &frame.append, "");
                        target
                    }
                    None => frame.data.clone(),
                };
                self.storage
                    .set(&frame.view, &frame.key, merged.clone())
                    .await;
                self.enforce_bound(&frame.view).await;

                self.storage.notify_update(StoreUpdate {
                    view: frame.view.clone(),
                    key: frame.key.clone(),
                    kind: UpdateKind::Patch,
                    data: Some(frame.data.clone()),
                });
                let change = match before {
                    Some(before) => RichChange::Updated {
                        before,
                        after: merged,
                        patch: Some(frame.data),
                    },
                    None => RichChange::Created { data: merged },
                };
                self.storage.notify_rich_update(RichStoreUpdate {
                    view: frame.view,
                    key: frame.key,
                    change,
                });
            }
            EntityOp::Delete => {
                let before = self.storage.delete(&frame.view, &frame.key).await;
                self.storage.notify_update(StoreUpdate {
                    view: frame.view.clone(),
                    key: frame.key.clone(),
                    kind: UpdateKind::Delete,
                    data: None,
                });
                if before.is_some() {
                    self.storage.notify_rich_update(RichStoreUpdate {
                        view: frame.view,
                        key: frame.key,
                        change: RichChange::Deleted { last_known: before },
                    });
                }
            }
        }
    }

    fn publish_upsert(&self, view: &str, key: &str, data: Value, before: Option<Value>) {
        self.storage.notify_update(StoreUpdate {
            view: view.to_string(),
            key: key.to_string(),
            kind: UpdateKind::Upsert,
            data: Some(data.clone()),
        });
        let change = match before {
            Some(before) => RichChange::Updated {
                before,
                after: data,
                patch: None,
            },
            None => RichChange::Created { data },
        };
        self.storage.notify_rich_update(RichStoreUpdate {
            view: view.to_string(),
            key: key.to_string(),
            change,
        });
    }

    /// Evicts until the view is back under the configured bound. Runs after
    /// snapshot batches and after each individual insert, never mid-merge.
    async fn enforce_bound(&self, view: &str) {
        let Some(max) = self.max_entries_per_view else {
            return;
        };
        while self.storage.size(view).await > max {
            let Some((key, value)) = self.storage.evict_oldest(view).await else {
                break;
            };
            self.storage.notify_update(StoreUpdate {
                view: view.to_string(),
                key: key.clone(),
                kind: UpdateKind::Delete,
                data: None,
            });
            self.storage.notify_rich_update(RichStoreUpdate {
                view: view.to_string(),
                key,
                change: RichChange::Deleted {
                    last_known: Some(value),
                },
            });
        }
    }
}

/// Recursively merge `patch` into `target`. Arrays concatenate when their
/// dotted path (from the patch root) is listed in `append_paths`, and are
/// replaced wholesale otherwise. Nested objects recurse; everything else
/// replaces.
pub fn deep_merge_with_append(
    target: &mut Value,
    patch: &Value,
    append_paths: &[String],
    current_path: &str,
) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                let field_path = if current_path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", current_path, key)
                };
                match target_map.get_mut(key) {
                    Some(target_value) => {
                        deep_merge_with_append(target_value, patch_value, append_paths, &field_path)
                    }
                    None => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (Value::Array(target_arr), Value::Array(patch_arr))
            if append_paths.iter().any(|p| p == current_path) =>
        {
            target_arr.extend(patch_arr.iter().cloned());
        }
        (target, patch) => {
            *target = patch.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn merge(mut target: Value, patch: Value, append: &[&str]) -> Value {
        let append: Vec<String> = append.iter().map(|s| s.to_string()).collect();
        deep_merge_with_append(&mut target, &patch, &append, "");
        target
    }

    #[test]
    fn appends_listed_array_paths() {
        let merged = merge(json!({"xs": [1]}), json!({"xs": [2]}), &["xs"]);
        assert_eq!(merged, json!({"xs": [1, 2]}));
    }

    #[test]
    fn replaces_unlisted_arrays() {
        let merged = merge(json!({"xs": [1, 2]}), json!({"xs": [3]}), &[]);
        assert_eq!(merged, json!({"xs": [3]}));
    }

    #[test]
    fn nested_append_path_is_dotted() {
        let merged = merge(
            json!({"events": {"bets": [{"n": 1}]}, "other": 1}),
            json!({"events": {"bets": [{"n": 2}]}}),
            &["events.bets"],
        );
        assert_eq!(
            merged,
            json!({"events": {"bets": [{"n": 1}, {"n": 2}]}, "other": 1})
        );
    }

    #[test]
    fn top_level_name_does_not_match_nested_path() {
        // "bets" alone must not opt the nested events.bets array in.
        let merged = merge(
            json!({"events": {"bets": [1]}}),
            json!({"events": {"bets": [2]}}),
            &["bets"],
        );
        assert_eq!(merged, json!({"events": {"bets": [2]}}));
    }

    #[test]
    fn objects_merge_and_primitives_replace() {
        let merged = merge(
            json!({"a": {"x": 1, "y": 2}, "n": 1}),
            json!({"a": {"y": 3, "z": 4}, "n": 9}),
            &[],
        );
        assert_eq!(merged, json!({"a": {"x": 1, "y": 3, "z": 4}, "n": 9}));
    }

    #[test]
    fn array_into_non_array_replaces() {
        let merged = merge(json!({"xs": 5}), json!({"xs": [1]}), &["xs"]);
        assert_eq!(merged, json!({"xs": [1]}));
    }
}
