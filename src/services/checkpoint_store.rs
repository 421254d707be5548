//! Checkpoint store: named, time-ordered snapshots of conversation state.
//!
//! Snapshots are deep copies; mutating the source thread after
//! `create` never changes a stored checkpoint, and restoring never
//! mutates the stored checkpoint. Restore either truncates the target
//! thread in place or forks a child thread with lineage recorded.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::error::RuntimeError;
use crate::domain::models::checkpoint::{Checkpoint, SerializedState};
use crate::domain::models::message::Thread;
use crate::services::event_bus::{EventBus, EventCategory, EventPayload, EventSeverity};

struct Inner {
    checkpoints: HashMap<Uuid, Checkpoint>,
    /// Per-thread checkpoint ids in creation order.
    by_thread: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory checkpoint store with JSON export/import.
pub struct CheckpointStore {
    inner: Arc<RwLock<Inner>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                checkpoints: HashMap::new(),
                by_thread: HashMap::new(),
            })),
        }
    }

    /// Snapshot the thread's tail (all current messages).
    pub async fn create(&self, thread: &Thread, label: Option<String>) -> Checkpoint {
        self.snapshot(thread, thread.messages.len(), label).await
    }

    /// Snapshot the thread up to `message_index` (exclusive).
    pub async fn create_at(
        &self,
        thread: &Thread,
        message_index: usize,
        label: Option<String>,
    ) -> Result<Checkpoint, RuntimeError> {
        if message_index > thread.messages.len() {
            return Err(RuntimeError::CheckpointNotFound(thread.id));
        }
        Ok(self.snapshot(thread, message_index, label).await)
    }

    async fn snapshot(&self, thread: &Thread, message_index: usize, label: Option<String>) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            label,
            thread_id: thread.id,
            message_index,
            state: SerializedState::from_messages(thread.messages[..message_index].to_vec()),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        };

        let mut inner = self.inner.write().await;
        inner.by_thread.entry(thread.id).or_default().push(checkpoint.id);
        inner.checkpoints.insert(checkpoint.id, checkpoint.clone());
        debug!(checkpoint_id = %checkpoint.id, thread_id = %thread.id, message_index, "checkpoint created");
        checkpoint
    }

    /// Fetch a shared immutable view of a checkpoint.
    pub async fn get(&self, id: Uuid) -> Option<Checkpoint> {
        let inner = self.inner.read().await;
        inner.checkpoints.get(&id).cloned()
    }

    /// All checkpoints for a thread in creation order.
    pub async fn list_for_thread(&self, thread_id: Uuid) -> Vec<Checkpoint> {
        let inner = self.inner.read().await;
        inner
            .by_thread
            .get(&thread_id)
            .map(|ids| ids.iter().filter_map(|id| inner.checkpoints.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Restore `id` into `thread`, truncating its messages to the
    /// snapshot and copying them in. The thread must be the checkpoint's
    /// own thread.
    pub async fn restore_in_place(&self, id: Uuid, thread: &mut Thread) -> Result<(), RuntimeError> {
        let checkpoint = self.get(id).await.ok_or(RuntimeError::CheckpointNotFound(id))?;
        if checkpoint.thread_id != thread.id {
            return Err(RuntimeError::CheckpointNotFound(id));
        }
        thread.messages.clear();
        thread.messages.extend(checkpoint.state.messages.iter().cloned());
        thread.updated_at = Utc::now();
        info!(checkpoint_id = %id, thread_id = %thread.id, "restored checkpoint in place");
        Ok(())
    }

    /// Restore `id` as a new child thread; lineage points at the
    /// checkpoint's thread.
    pub async fn restore_fork(&self, id: Uuid) -> Result<Thread, RuntimeError> {
        let checkpoint = self.get(id).await.ok_or(RuntimeError::CheckpointNotFound(id))?;
        let child = Thread::child_of(checkpoint.thread_id, checkpoint.state.messages.clone());
        info!(checkpoint_id = %id, child_id = %child.id, "restored checkpoint as fork");
        Ok(child)
    }

    /// Keep only the newest `n` checkpoints per thread. Returns the
    /// number removed.
    pub async fn prune_keep_last_n_per_thread(&self, n: usize) -> usize {
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        let mut doomed = Vec::new();
        for ids in inner.by_thread.values_mut() {
            while ids.len() > n {
                doomed.push(ids.remove(0));
            }
        }
        for id in doomed {
            if inner.checkpoints.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove checkpoints older than `age`. Returns the number removed.
    pub async fn prune_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - age;
        let mut inner = self.inner.write().await;
        let doomed: Vec<Uuid> = inner
            .checkpoints
            .values()
            .filter(|cp| cp.created_at < cutoff)
            .map(|cp| cp.id)
            .collect();
        for id in &doomed {
            inner.checkpoints.remove(id);
        }
        for ids in inner.by_thread.values_mut() {
            ids.retain(|id| !doomed.contains(id));
        }
        doomed.len()
    }

    /// Serialize every checkpoint to JSON for persistence.
    pub async fn export_json(&self) -> Result<String, serde_json::Error> {
        let inner = self.inner.read().await;
        let mut all: Vec<&Checkpoint> = inner.checkpoints.values().collect();
        all.sort_by_key(|cp| cp.created_at);
        serde_json::to_string_pretty(&all)
    }

    /// Import checkpoints from JSON, preserving ids and dates. Returns
    /// the number imported.
    pub async fn import_json(&self, json: &str) -> Result<usize, serde_json::Error> {
        let imported: Vec<Checkpoint> = serde_json::from_str(json)?;
        let count = imported.len();
        let mut inner = self.inner.write().await;
        for checkpoint in imported {
            let ids = inner.by_thread.entry(checkpoint.thread_id).or_default();
            if !ids.contains(&checkpoint.id) {
                ids.push(checkpoint.id);
            }
            inner.checkpoints.insert(checkpoint.id, checkpoint);
        }
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.checkpoints.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a labelled checkpoint every N appended messages.
///
/// Feed it the thread after each append; it tracks the message count at
/// the last checkpoint and snapshots when the delta reaches `every`.
pub struct AutoCheckpointer {
    store: Arc<CheckpointStore>,
    every: usize,
    last_len: Mutex<usize>,
    event_bus: Arc<EventBus>,
}

impl AutoCheckpointer {
    pub fn new(store: Arc<CheckpointStore>, every: usize, event_bus: Arc<EventBus>) -> Self {
        Self { store, every, last_len: Mutex::new(0), event_bus }
    }

    /// Observe the thread after an append; returns the checkpoint if one
    /// was created.
    pub async fn observe(&self, thread: &Thread) -> Option<Checkpoint> {
        if self.every == 0 {
            return None;
        }
        let mut last_len = self.last_len.lock().await;
        if thread.messages.len() < *last_len + self.every {
            return None;
        }
        *last_len = thread.messages.len();
        drop(last_len);
        let label = format!("auto-{}", thread.messages.len());
        let checkpoint = self.store.create(thread, Some(label)).await;
        self.event_bus.publish(
            EventSeverity::Info,
            EventCategory::Checkpoint,
            EventPayload::CheckpointCreated {
                checkpoint_id: checkpoint.id,
                thread_id: checkpoint.thread_id,
                label: checkpoint.label.clone(),
            },
        );
        Some(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::message::Message;

    fn thread_with_messages(n: usize) -> Thread {
        let mut thread = Thread::new();
        for i in 0..n {
            thread.push(Message::user(format!("message {i}")));
        }
        thread
    }

    #[tokio::test]
    async fn test_snapshot_is_immutable_under_thread_mutation() {
        let store = CheckpointStore::new();
        let mut thread = thread_with_messages(3);

        let checkpoint = store.create(&thread, Some("pin".into())).await;

        // Mutate the thread after snapshotting.
        thread.push(Message::user("later message"));
        thread.messages[0] = Message::user("rewritten");

        let snapshot = store.get(checkpoint.id).await.unwrap();
        assert_eq!(snapshot.state.messages.len(), 3);
        assert_eq!(snapshot.state.messages[0].content.as_text(), "message 0");
    }

    #[tokio::test]
    async fn test_restore_in_place_truncates() {
        let store = CheckpointStore::new();
        let mut thread = thread_with_messages(2);
        let checkpoint = store.create(&thread, None).await;

        thread.push(Message::user("extra 1"));
        thread.push(Message::user("extra 2"));
        assert_eq!(thread.len(), 4);

        store.restore_in_place(checkpoint.id, &mut thread).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread.messages[1].content.as_text(), "message 1");
    }

    #[tokio::test]
    async fn test_restore_in_place_rejects_foreign_thread() {
        let store = CheckpointStore::new();
        let thread = thread_with_messages(2);
        let checkpoint = store.create(&thread, None).await;

        let mut other = thread_with_messages(1);
        let result = store.restore_in_place(checkpoint.id, &mut other).await;
        assert!(matches!(result, Err(RuntimeError::CheckpointNotFound(_))));
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_fork_records_lineage() {
        let store = CheckpointStore::new();
        let thread = thread_with_messages(3);
        let checkpoint = store.create_at(&thread, 2, None).await.unwrap();

        let fork = store.restore_fork(checkpoint.id).await.unwrap();
        assert_eq!(fork.parent_id, Some(thread.id));
        assert_eq!(fork.len(), 2);
        assert_ne!(fork.id, thread.id);
    }

    #[tokio::test]
    async fn test_create_at_out_of_range() {
        let store = CheckpointStore::new();
        let thread = thread_with_messages(1);
        assert!(store.create_at(&thread, 5, None).await.is_err());
    }

    #[tokio::test]
    async fn test_prune_keep_last_n() {
        let store = CheckpointStore::new();
        let thread = thread_with_messages(1);
        for _ in 0..5 {
            store.create(&thread, None).await;
        }
        let removed = store.prune_keep_last_n_per_thread(2).await;
        assert_eq!(removed, 3);
        assert_eq!(store.list_for_thread(thread.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_older_than_keeps_fresh() {
        let store = CheckpointStore::new();
        let thread = thread_with_messages(1);
        store.create(&thread, None).await;
        let removed = store.prune_older_than(Duration::hours(1)).await;
        assert_eq!(removed, 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let store = CheckpointStore::new();
        let thread = thread_with_messages(2);
        let a = store.create(&thread, Some("a".into())).await;
        let b = store.create(&thread, Some("b".into())).await;

        let json = store.export_json().await.unwrap();

        let restored = CheckpointStore::new();
        let count = restored.import_json(&json).await.unwrap();
        assert_eq!(count, 2);

        let got_a = restored.get(a.id).await.unwrap();
        assert_eq!(got_a.label.as_deref(), Some("a"));
        assert_eq!(got_a.created_at, a.created_at);
        assert_eq!(got_a.state.messages.len(), 2);

        let got_b = restored.get(b.id).await.unwrap();
        assert_eq!(got_b.id, b.id);
    }

    #[tokio::test]
    async fn test_auto_checkpointer_every_n() {
        let store = Arc::new(CheckpointStore::new());
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let auto = AutoCheckpointer::new(store.clone(), 3, bus);
        let mut thread = Thread::new();

        let mut created = 0;
        for i in 0..7 {
            thread.push(Message::user(format!("m{i}")));
            if auto.observe(&thread).await.is_some() {
                created += 1;
            }
        }
        // Checkpoints at message counts 3 and 6.
        assert_eq!(created, 2);
        let list = store.list_for_thread(thread.id).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].label.as_deref(), Some("auto-3"));

        // Each auto-checkpoint was announced on the bus.
        let event = events.try_recv().expect("checkpoint event published");
        assert!(matches!(event.payload, EventPayload::CheckpointCreated { .. }));
    }
}
