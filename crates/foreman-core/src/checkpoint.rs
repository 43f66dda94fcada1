//! Step-level incremental snapshots within a task.
//!
//! Long-running task bodies record a checkpoint per completed step;
//! after a restart they restore the latest one and resume from there.
//! A task's checkpoints are persisted together as one JSON blob under
//! `checkpoints/{task_id}` -- the store's rename-based `put` keeps the
//! blob atomic per task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use foreman_store::BlobStore;

use crate::config::CheckpointConfig;

const KEY_PREFIX: &str = "checkpoints/";

/// One durable step snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub task_id: Uuid,
    pub step_index: u32,
    pub step_name: String,
    /// Opaque caller state; typed schemas belong to callers.
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Summary of a task's checkpoint history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMetadata {
    pub task_id: Uuid,
    pub total_steps: usize,
    pub current_step: Option<u32>,
    pub last_update: Option<DateTime<Utc>>,
}

/// Recursively merge `patch` into `target`. Objects merge key-wise;
/// anything else replaces.
fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

struct ServiceInner {
    store: Arc<dyn BlobStore>,
    config: CheckpointConfig,
    /// Per-task checkpoint lists, lazily loaded from the store.
    checkpoints: Mutex<HashMap<Uuid, Vec<Checkpoint>>>,
    /// Restored step state, merged into by `update_state`.
    step_state: Mutex<HashMap<Uuid, serde_json::Value>>,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

/// Step-level checkpointing for long-running executors. Cheap to
/// clone; clones share the same caches and timers.
#[derive(Clone)]
pub struct CheckpointService {
    inner: Arc<ServiceInner>,
}

impl CheckpointService {
    pub fn new(store: Arc<dyn BlobStore>, config: CheckpointConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                store,
                config,
                checkpoints: Mutex::new(HashMap::new()),
                step_state: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.inner.config
    }

    fn key_for(task_id: Uuid) -> String {
        format!("{KEY_PREFIX}{task_id}")
    }

    /// Ensure a task's list is present in the cache, loading it from
    /// the store on first touch.
    async fn ensure_loaded(&self, task_id: Uuid) {
        {
            let cache = self.inner.checkpoints.lock().await;
            if cache.contains_key(&task_id) {
                return;
            }
        }
        let loaded = match self.inner.store.get(&Self::key_for(task_id)).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(task_id = %task_id, error = %e, "unreadable checkpoint blob");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "failed to load checkpoints");
                Vec::new()
            }
        };
        self.inner
            .checkpoints
            .lock()
            .await
            .entry(task_id)
            .or_insert(loaded);
    }

    /// Best-effort persist of a task's full checkpoint list.
    async fn persist(&self, task_id: Uuid, list: &[Checkpoint]) {
        let bytes = serde_json::to_vec(list).expect("checkpoints serialize");
        if let Err(e) = self.inner.store.put(&Self::key_for(task_id), &bytes).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to persist checkpoints");
        }
    }

    /// Record a checkpoint.
    ///
    /// Identity is `(task_id, step_index, step_name)`: recreating an
    /// existing key with identical state returns the existing id
    /// without a write; with different state it updates in place and
    /// keeps the id. A new key appends, pruning the oldest checkpoint
    /// past the retention limit.
    pub async fn create(
        &self,
        task_id: Uuid,
        step_index: u32,
        step_name: &str,
        state: serde_json::Value,
    ) -> Uuid {
        self.ensure_loaded(task_id).await;

        let (id, list) = {
            let mut cache = self.inner.checkpoints.lock().await;
            let list = cache.entry(task_id).or_default();

            if let Some(existing) = list
                .iter_mut()
                .find(|c| c.step_index == step_index && c.step_name == step_name)
            {
                if existing.state == state {
                    return existing.checkpoint_id;
                }
                existing.state = state;
                existing.created_at = Utc::now();
                (existing.checkpoint_id, list.clone())
            } else {
                let checkpoint = Checkpoint {
                    checkpoint_id: Uuid::new_v4(),
                    task_id,
                    step_index,
                    step_name: step_name.to_owned(),
                    state,
                    created_at: Utc::now(),
                };
                let id = checkpoint.checkpoint_id;
                list.push(checkpoint);
                let max = self.inner.config.max_checkpoints_per_task();
                while list.len() > max {
                    let pruned = list.remove(0);
                    tracing::debug!(
                        task_id = %task_id,
                        step = %pruned.step_name,
                        "pruned oldest checkpoint"
                    );
                }
                (id, list.clone())
            }
        };

        self.persist(task_id, &list).await;
        id
    }

    /// All checkpoints for a task, oldest first.
    pub async fn list(&self, task_id: Uuid) -> Vec<Checkpoint> {
        self.ensure_loaded(task_id).await;
        self.inner
            .checkpoints
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The checkpoint with the highest step index.
    pub async fn latest(&self, task_id: Uuid) -> Option<Checkpoint> {
        self.list(task_id)
            .await
            .into_iter()
            .max_by_key(|c| c.step_index)
    }

    /// Load a checkpoint (the named one, or the latest) into the
    /// task's in-memory step state and return it.
    pub async fn restore(&self, task_id: Uuid, checkpoint_id: Option<Uuid>) -> Option<Checkpoint> {
        let checkpoint = match checkpoint_id {
            Some(id) => self
                .list(task_id)
                .await
                .into_iter()
                .find(|c| c.checkpoint_id == id)?,
            None => self.latest(task_id).await?,
        };

        self.inner
            .step_state
            .lock()
            .await
            .insert(task_id, checkpoint.state.clone());
        tracing::info!(
            task_id = %task_id,
            step_index = checkpoint.step_index,
            step = %checkpoint.step_name,
            "restored checkpoint"
        );
        Some(checkpoint)
    }

    /// Merge a patch into the restored step state. Returns the merged
    /// state, or `None` when nothing was restored for the task.
    pub async fn update_state(
        &self,
        task_id: Uuid,
        patch: serde_json::Value,
    ) -> Option<serde_json::Value> {
        let mut states = self.inner.step_state.lock().await;
        let state = states.get_mut(&task_id)?;
        merge_json(state, patch);
        Some(state.clone())
    }

    /// The current in-memory step state for a task.
    pub async fn step_state(&self, task_id: Uuid) -> Option<serde_json::Value> {
        self.inner.step_state.lock().await.get(&task_id).cloned()
    }

    /// Start periodic checkpointing for a task: every interval the
    /// supplied closures are sampled and recorded through
    /// [`Self::create`].
    pub async fn start_periodic<S, T>(&self, task_id: Uuid, get_state: S, get_step: T)
    where
        S: Fn() -> serde_json::Value + Send + Sync + 'static,
        T: Fn() -> (u32, String) + Send + Sync + 'static,
    {
        let service = self.clone();
        let interval = self.inner.config.checkpoint_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (step_index, step_name) = get_step();
                let state = get_state();
                service.create(task_id, step_index, &step_name, state).await;
            }
        });

        if let Some(old) = self.inner.timers.lock().await.insert(task_id, handle) {
            old.abort();
        }
    }

    /// Stop periodic checkpointing for a task. Idempotent.
    pub async fn stop(&self, task_id: Uuid) {
        if let Some(handle) = self.inner.timers.lock().await.remove(&task_id) {
            handle.abort();
        }
    }

    /// Stop every periodic timer. Idempotent.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut timers = self.inner.timers.lock().await;
            timers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }

    /// Summary of a task's checkpoint history.
    pub async fn metadata(&self, task_id: Uuid) -> CheckpointMetadata {
        let list = self.list(task_id).await;
        CheckpointMetadata {
            task_id,
            total_steps: list.len(),
            current_step: list.iter().map(|c| c.step_index).max(),
            last_update: list.iter().map(|c| c.created_at).max(),
        }
    }
}

impl std::fmt::Debug for CheckpointService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointService").finish_non_exhaustive()
    }
}
