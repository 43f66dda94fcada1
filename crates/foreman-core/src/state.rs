//! Task-level snapshots with autosave and crash recovery.
//!
//! One snapshot per task, persisted as a JSON blob under
//! `state/{task_id}`. The in-memory view is authoritative: persistence
//! failures are logged and absorbed, and the next successful flush
//! repairs the store. Timestamps serialize as RFC 3339 strings and are
//! re-hydrated on load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use foreman_store::BlobStore;

use crate::config::StateConfig;
use crate::task::TaskStatus;

const KEY_PREFIX: &str = "state/";

/// Durable progress record for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub name: String,
    pub status: TaskStatus,
    /// Percent complete, 0..=100.
    pub progress: u8,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Partial update applied to a snapshot by [`StateManager::update`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl SnapshotPatch {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn step(step: impl Into<String>) -> Self {
        Self {
            current_step: Some(step.into()),
            ..Self::default()
        }
    }
}

/// Maintains per-task snapshots on durable storage.
pub struct StateManager {
    store: Arc<dyn BlobStore>,
    config: StateConfig,
    snapshots: Arc<Mutex<HashMap<Uuid, TaskSnapshot>>>,
    autosave: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl StateManager {
    pub fn new(store: Arc<dyn BlobStore>, config: StateConfig) -> Self {
        Self {
            store,
            config,
            snapshots: Arc::new(Mutex::new(HashMap::new())),
            autosave: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key_for(task_id: Uuid) -> String {
        format!("{KEY_PREFIX}{task_id}")
    }

    /// Best-effort flush of one snapshot to the store.
    async fn flush(store: &Arc<dyn BlobStore>, snapshot: &TaskSnapshot) {
        let bytes = serde_json::to_vec(snapshot).expect("snapshot serializes");
        if let Err(e) = store.put(&Self::key_for(snapshot.task_id), &bytes).await {
            tracing::warn!(
                task_id = %snapshot.task_id,
                error = %e,
                "failed to persist task snapshot, in-memory state remains authoritative"
            );
        }
    }

    /// Create the initial snapshot for a task and start its autosave
    /// timer.
    pub async fn create(
        &self,
        task_id: Uuid,
        name: &str,
        metadata: Option<serde_json::Value>,
    ) -> TaskSnapshot {
        let snapshot = TaskSnapshot {
            task_id,
            name: name.to_owned(),
            status: TaskStatus::Pending,
            progress: 0,
            current_step: None,
            completed_steps: Vec::new(),
            result: None,
            error: None,
            started_at: None,
            updated_at: Utc::now(),
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        };

        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .insert(task_id, snapshot.clone());
        Self::flush(&self.store, &snapshot).await;
        self.start_autosave(task_id);
        snapshot
    }

    /// Merge a patch into a task's snapshot.
    ///
    /// Returns `None` for unknown tasks. When the patched status and
    /// progress equal the current values the merge is a no-op apart
    /// from `updated_at`. A `current_step` not yet in
    /// `completed_steps` is appended there.
    pub async fn update(&self, task_id: Uuid, patch: SnapshotPatch) -> Option<TaskSnapshot> {
        let snapshot = {
            let mut snapshots = self.snapshots.lock().expect("snapshots lock poisoned");
            let snapshot = snapshots.get_mut(&task_id)?;

            if let Some(status) = patch.status {
                snapshot.status = status;
            }
            if let Some(progress) = patch.progress {
                snapshot.progress = progress.min(100);
            }
            if let Some(step) = patch.current_step {
                if !snapshot.completed_steps.contains(&step) {
                    snapshot.completed_steps.push(step.clone());
                }
                snapshot.current_step = Some(step);
            }
            if let Some(result) = patch.result {
                snapshot.result = Some(result);
            }
            if let Some(error) = patch.error {
                snapshot.error = Some(error);
            }
            snapshot.updated_at = Utc::now();
            snapshot.clone()
        };

        Self::flush(&self.store, &snapshot).await;
        Some(snapshot)
    }

    /// Transition to RUNNING, recording `started_at`.
    pub async fn mark_running(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        {
            let mut snapshots = self.snapshots.lock().expect("snapshots lock poisoned");
            let snapshot = snapshots.get_mut(&task_id)?;
            snapshot.status = TaskStatus::Running;
            snapshot.started_at.get_or_insert_with(Utc::now);
            snapshot.updated_at = Utc::now();
        }
        let snapshot = self.get(task_id)?;
        Self::flush(&self.store, &snapshot).await;
        Some(snapshot)
    }

    /// Terminal transition to COMPLETED: final flush, autosave stops.
    pub async fn mark_completed(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Option<TaskSnapshot> {
        let snapshot = self
            .update(
                task_id,
                SnapshotPatch {
                    status: Some(TaskStatus::Completed),
                    progress: Some(100),
                    result,
                    ..SnapshotPatch::default()
                },
            )
            .await?;
        self.stop_autosave(task_id);
        Some(snapshot)
    }

    /// Terminal transition to FAILED: final flush, autosave stops.
    pub async fn mark_failed(&self, task_id: Uuid, error: &str) -> Option<TaskSnapshot> {
        let snapshot = self
            .update(
                task_id,
                SnapshotPatch {
                    status: Some(TaskStatus::Failed),
                    error: Some(error.to_owned()),
                    ..SnapshotPatch::default()
                },
            )
            .await?;
        self.stop_autosave(task_id);
        Some(snapshot)
    }

    /// In-memory snapshot, if tracked.
    pub fn get(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .get(&task_id)
            .cloned()
    }

    /// Load every persisted snapshot still in a non-terminal state.
    /// Called on startup to find work that survived a crash.
    pub async fn recoverable(&self) -> Vec<TaskSnapshot> {
        let mut out = Vec::new();
        let keys = match self.store.list(KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list persisted snapshots");
                return out;
            }
        };
        for key in keys {
            let Ok(Some(bytes)) = self.store.get(&key).await else {
                continue;
            };
            match serde_json::from_slice::<TaskSnapshot>(&bytes) {
                Ok(snapshot)
                    if matches!(snapshot.status, TaskStatus::Pending | TaskStatus::Running) =>
                {
                    out.push(snapshot);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(key, error = %e, "skipping unreadable snapshot"),
            }
        }
        out.sort_by_key(|s| s.updated_at);
        out
    }

    /// Recover one task after a restart.
    ///
    /// RUNNING snapshots transition back to PENDING -- progress and
    /// completed steps survive -- so the scheduler redispatches them.
    /// Terminal snapshots are returned unchanged.
    pub async fn recover(&self, task_id: Uuid) -> Option<TaskSnapshot> {
        let bytes = self.store.get(&Self::key_for(task_id)).await.ok()??;
        let mut snapshot: TaskSnapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "unreadable snapshot");
                return None;
            }
        };

        if snapshot.status == TaskStatus::Running {
            snapshot.status = TaskStatus::Pending;
            snapshot.updated_at = Utc::now();
            Self::flush(&self.store, &snapshot).await;
            tracing::info!(
                task_id = %task_id,
                progress = snapshot.progress,
                "recovered interrupted task back to pending"
            );
        }

        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .insert(task_id, snapshot.clone());
        if !snapshot.status.is_terminal() {
            self.start_autosave(task_id);
        }
        Some(snapshot)
    }

    /// Spawn the periodic flush loop for a live task.
    fn start_autosave(&self, task_id: Uuid) {
        let interval = self.config.auto_save_interval();
        let store = Arc::clone(&self.store);
        let snapshots = Arc::clone(&self.snapshots);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so the
            // loop writes on the interval, not at spawn.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = snapshots
                    .lock()
                    .expect("snapshots lock poisoned")
                    .get(&task_id)
                    .cloned();
                match snapshot {
                    Some(snapshot) => Self::flush(&store, &snapshot).await,
                    None => break,
                }
            }
        });

        if let Some(old) = self
            .autosave
            .lock()
            .expect("autosave lock poisoned")
            .insert(task_id, handle)
        {
            old.abort();
        }
    }

    fn stop_autosave(&self, task_id: Uuid) {
        if let Some(handle) = self
            .autosave
            .lock()
            .expect("autosave lock poisoned")
            .remove(&task_id)
        {
            handle.abort();
        }
    }

    /// Number of tasks with a live autosave timer.
    pub fn autosave_count(&self) -> usize {
        self.autosave.lock().expect("autosave lock poisoned").len()
    }

    /// Stop all autosave timers and flush everything once. Idempotent.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut autosave = self.autosave.lock().expect("autosave lock poisoned");
            autosave.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.abort();
        }

        let snapshots: Vec<TaskSnapshot> = self
            .snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .values()
            .cloned()
            .collect();
        for snapshot in snapshots {
            Self::flush(&self.store, &snapshot).await;
        }
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field(
                "tracked",
                &self.snapshots.lock().expect("snapshots lock poisoned").len(),
            )
            .field("autosave_timers", &self.autosave_count())
            .finish()
    }
}
