//! Task persistence: CRUD plus the request-id secondary index.
//!
//! Layout: `task:{task_id}` holds the serialized [`Task`];
//! `request_index:{request_id}` holds the set of task ids whose items carry
//! that request id. The index is kept consistent with the item list on every
//! mutation.
//!
//! Corruption policy: a payload that fails to decode or fails
//! [`Task::validate`] is deleted before the error surfaces, so a retried
//! read sees a clean "not found" instead of a partially-valid object.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TaskStoreError;
use crate::model::Task;
use crate::store::{SharedStore, request_index_key, task_key};

/// Store for tasks, backed by the shared key-value store.
pub struct TaskStore {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Persist a new task. Fails with [`TaskStoreError::DuplicateTask`] if
    /// the key already exists; on success every item's request id gains an
    /// index entry.
    pub async fn create(&self, task: &Task) -> Result<(), TaskStoreError> {
        let raw = serde_json::to_string(task).map_err(crate::error::StoreError::from)?;
        let created = self
            .store
            .put_if_absent(&task_key(&task.task_id), &raw, self.ttl)
            .await?;
        if !created {
            return Err(TaskStoreError::DuplicateTask {
                task_id: task.task_id.clone(),
            });
        }

        for request_id in task.request_ids() {
            self.store
                .set_add(&request_index_key(&request_id), &task.task_id, self.ttl)
                .await?;
        }

        tracing::debug!(
            task_id = %task.task_id,
            items = task.items.len(),
            "Task created"
        );
        Ok(())
    }

    /// Load a task by id. Returns `None` when absent; deletes the record
    /// and raises [`TaskStoreError::CorruptedState`] when it cannot be
    /// decoded.
    pub async fn load(&self, task_id: &str) -> Result<Option<Task>, TaskStoreError> {
        let key = task_key(task_id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(self.decode(&key, &raw).await?)),
            None => Ok(None),
        }
    }

    /// Resolve a request id through the secondary index and load the owning
    /// task. An index set with more than one member is a store-consistency
    /// error, never a silent pick; a dangling entry (task deleted or
    /// expired underneath the index) is repaired and treated as absent.
    pub async fn load_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<Task>, TaskStoreError> {
        let index_key = request_index_key(request_id);
        let task_ids = self.store.set_members(&index_key).await?;

        match task_ids.len() {
            0 => Ok(None),
            1 => {
                let task_id = &task_ids[0];
                match self.load(task_id).await? {
                    Some(task) => Ok(Some(task)),
                    None => {
                        tracing::warn!(
                            request_id = %request_id,
                            task_id = %task_id,
                            "Dangling request index entry, removing"
                        );
                        self.store.set_remove(&index_key, task_id).await?;
                        Ok(None)
                    }
                }
            }
            count => Err(TaskStoreError::IndexInconsistent {
                request_id: request_id.to_string(),
                count,
            }),
        }
    }

    /// Persist changes to an existing task. Fails with
    /// [`TaskStoreError::TaskNotFound`] when the key is absent. The request
    /// index is diffed against the previously stored item set: removed
    /// request ids lose their entry, current ones are (re-)added, which also
    /// refreshes their TTL.
    pub async fn update(&self, task: &Task) -> Result<(), TaskStoreError> {
        let key = task_key(&task.task_id);
        let previous_raw =
            self.store
                .get(&key)
                .await?
                .ok_or_else(|| TaskStoreError::TaskNotFound {
                    task_id: task.task_id.clone(),
                })?;
        let previous = self.decode(&key, &previous_raw).await?;

        let raw = serde_json::to_string(task).map_err(crate::error::StoreError::from)?;
        self.store.put(&key, &raw, self.ttl).await?;

        let old_ids: BTreeSet<String> = previous.request_ids().into_iter().collect();
        let new_ids: BTreeSet<String> = task.request_ids().into_iter().collect();

        for removed in old_ids.difference(&new_ids) {
            self.store
                .set_remove(&request_index_key(removed), &task.task_id)
                .await?;
        }
        for current in &new_ids {
            self.store
                .set_add(&request_index_key(current), &task.task_id, self.ttl)
                .await?;
        }

        tracing::debug!(
            task_id = %task.task_id,
            status = %task.status,
            items = task.items.len(),
            "Task updated"
        );
        Ok(())
    }

    /// Delete a task and every index entry it owned.
    pub async fn delete(&self, task_id: &str) -> Result<(), TaskStoreError> {
        let key = task_key(task_id);
        let raw = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| TaskStoreError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let task = self.decode(&key, &raw).await?;

        self.store.delete(&key).await?;
        for request_id in task.request_ids() {
            self.store
                .set_remove(&request_index_key(&request_id), task_id)
                .await?;
        }

        tracing::debug!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Decode and validate a raw payload, deleting the key on failure so the
    /// caller never receives a partially-valid object and retried reads see
    /// "not found".
    async fn decode(&self, key: &str, raw: &str) -> Result<Task, TaskStoreError> {
        let reason = match serde_json::from_str::<Task>(raw) {
            Ok(task) => match task.validate() {
                Ok(()) => return Ok(task),
                Err(reason) => reason,
            },
            Err(e) => e.to_string(),
        };

        tracing::warn!(key = %key, reason = %reason, "Corrupted task record, deleting");
        self.store.delete(key).await?;
        Err(TaskStoreError::CorruptedState {
            key: key.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{TaskItem, TaskStatus};
    use crate::store::MemoryStore;

    fn task_store() -> (Arc<MemoryStore>, TaskStore) {
        let shared = Arc::new(MemoryStore::new());
        let store = TaskStore::new(shared.clone(), Duration::from_secs(60));
        (shared, store)
    }

    fn sample_task(task_id: &str, request_id: &str) -> Task {
        Task::new(task_id, "s-1", "u-1").with_item(TaskItem::user_text(task_id, request_id, "hi"))
    }

    #[tokio::test]
    async fn test_create_then_load_round_trips() {
        let (_, store) = task_store();
        let task = sample_task("t-1", "r-1");

        store.create(&task).await.expect("create");
        let loaded = store.load("t-1").await.expect("load").expect("present");
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn test_create_duplicate_fails_without_mutation() {
        let (_, store) = task_store();
        let task = sample_task("t-1", "r-1");
        store.create(&task).await.expect("create");

        let mut other = sample_task("t-1", "r-2");
        other.session_id = "s-2".into();
        let err = store.create(&other).await.expect_err("duplicate");
        assert!(matches!(err, TaskStoreError::DuplicateTask { .. }));

        let loaded = store.load("t-1").await.expect("load").expect("present");
        assert_eq!(loaded.session_id, "s-1");
        // The failed create must not have indexed the new request id.
        assert!(
            store
                .load_by_request_id("r-2")
                .await
                .expect("load r-2")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_load_by_request_id_follows_index() {
        let (_, store) = task_store();
        let task = sample_task("t-1", "r-1");
        store.create(&task).await.expect("create");

        let loaded = store
            .load_by_request_id("r-1")
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.task_id, "t-1");
        assert!(store.load_by_request_id("r-absent").await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_update_missing_task_fails() {
        let (_, store) = task_store();
        let err = store
            .update(&sample_task("t-ghost", "r-1"))
            .await
            .expect_err("missing");
        assert!(matches!(err, TaskStoreError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_rewrites_index_delta() {
        let (shared, store) = task_store();
        let mut task = sample_task("t-1", "r-1");
        store.create(&task).await.expect("create");

        // Replace the item list so r-1 disappears and r-2 appears.
        task.items.clear();
        task.push_item(TaskItem::user_text("t-1", "r-2", "again"));
        store.update(&task).await.expect("update");

        assert!(store.load_by_request_id("r-1").await.expect("r-1").is_none());
        let loaded = store
            .load_by_request_id("r-2")
            .await
            .expect("r-2")
            .expect("present");
        assert_eq!(loaded.task_id, "t-1");
        // The stale index key is gone entirely (empty sets are dropped).
        assert!(
            shared
                .set_members(&request_index_key("r-1"))
                .await
                .expect("members")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_deleted_and_reported() {
        let (shared, store) = task_store();
        shared
            .put(&task_key("t-bad"), "{not json", Duration::from_secs(60))
            .await
            .expect("seed");

        let err = store.load("t-bad").await.expect_err("corrupt");
        assert!(matches!(err, TaskStoreError::CorruptedState { .. }));

        // The record was removed: a retried read sees a clean miss.
        assert!(store.load("t-bad").await.expect("reload").is_none());
    }

    #[tokio::test]
    async fn test_schema_invalid_payload_is_corrupted() {
        let (shared, store) = task_store();
        // Valid JSON, but the item belongs to a different task.
        let mut task = sample_task("t-1", "r-1");
        task.items[0].task_id = "t-other".into();
        let raw = serde_json::to_string(&task).expect("serialize");
        shared
            .put(&task_key("t-1"), &raw, Duration::from_secs(60))
            .await
            .expect("seed");

        let err = store.load("t-1").await.expect_err("invalid");
        assert!(matches!(err, TaskStoreError::CorruptedState { .. }));
        assert!(store.load("t-1").await.expect("reload").is_none());
    }

    #[tokio::test]
    async fn test_inconsistent_index_is_an_error() {
        let (shared, store) = task_store();
        store.create(&sample_task("t-1", "r-1")).await.expect("create t-1");
        // Force a second owner into the index.
        shared
            .set_add(&request_index_key("r-1"), "t-2", Duration::from_secs(60))
            .await
            .expect("seed");

        let err = store
            .load_by_request_id("r-1")
            .await
            .expect_err("inconsistent");
        assert!(matches!(
            err,
            TaskStoreError::IndexInconsistent { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_dangling_index_entry_is_repaired() {
        let (shared, store) = task_store();
        shared
            .set_add(&request_index_key("r-1"), "t-ghost", Duration::from_secs(60))
            .await
            .expect("seed");

        assert!(store.load_by_request_id("r-1").await.expect("load").is_none());
        assert!(
            shared
                .set_members(&request_index_key("r-1"))
                .await
                .expect("members")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_delete_removes_task_and_index() {
        let (_, store) = task_store();
        let mut task = sample_task("t-1", "r-1");
        task.set_status(TaskStatus::Completed);
        store.create(&task).await.expect("create");

        store.delete("t-1").await.expect("delete");
        assert!(store.load("t-1").await.expect("load").is_none());
        assert!(store.load_by_request_id("r-1").await.expect("index").is_none());

        let err = store.delete("t-1").await.expect_err("already gone");
        assert!(matches!(err, TaskStoreError::TaskNotFound { .. }));
    }
}
