//! Dead-letter queue: the durable parking lot for permanently failed
//! work.
//!
//! Entries live in the blob store under `dlq/{entry_id}`; the store is
//! the source of truth and the in-memory index is rebuilt from it at
//! open and kept in sync on every write. Resolution actions that put
//! work back into circulation go through the [`RequeueSink`] port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use foreman_store::BlobStore;

use crate::config::DlqConfig;
use crate::error::{EngineError, EngineResult};

const KEY_PREFIX: &str = "dlq/";

/// Entry total past which the queue reports unhealthy.
const HEALTHY_MAX_ENTRIES: usize = 1_000;
/// Entry age past which the queue reports unhealthy.
const HEALTHY_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A parked unit of failed work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub original_task_id: Uuid,
    pub name: String,
    /// Opaque caller data carried from the task.
    pub payload: serde_json::Value,
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Set when `retry_count` reached the intervention threshold; such
    /// entries are excluded from bulk auto-retry.
    pub manual_intervention_required: bool,
}

/// How an entry leaves the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Requeue to the originating queue with a single attempt.
    Retry { delay: Option<Duration> },
    /// Requeue to a named queue (the originating one when `None`).
    Requeue { queue: Option<String> },
    /// Drop the entry.
    Discard,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqStats {
    pub total: usize,
    pub pending_intervention: usize,
    pub oldest_entry_age_ms: Option<u64>,
}

/// Receives entries leaving the queue via retry/requeue resolutions.
///
/// The engine's default sink re-inserts the original task as PENDING
/// with a single attempt; tests substitute recording sinks.
#[async_trait]
pub trait RequeueSink: Send + Sync {
    async fn requeue(
        &self,
        entry: &DlqEntry,
        queue: &str,
        delay: Option<Duration>,
    ) -> anyhow::Result<()>;
}

/// Durable store of unrecoverable failures.
pub struct DeadLetterQueue {
    store: Arc<dyn BlobStore>,
    config: DlqConfig,
    sink: Option<Arc<dyn RequeueSink>>,
    /// Insertion-ordered cache of what the store holds.
    entries: Mutex<Vec<DlqEntry>>,
}

impl DeadLetterQueue {
    /// Open the queue over a store, loading any persisted entries.
    pub async fn open(store: Arc<dyn BlobStore>, config: DlqConfig) -> EngineResult<Self> {
        let mut entries = Vec::new();
        for key in store.list(KEY_PREFIX).await? {
            match store.get(&key).await? {
                Some(bytes) => match serde_json::from_slice::<DlqEntry>(&bytes) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(key, error = %e, "skipping unreadable DLQ entry");
                    }
                },
                None => continue,
            }
        }
        // The store lists in unspecified order; failure time recovers
        // insertion order.
        entries.sort_by_key(|e| e.failed_at);

        Ok(Self {
            store,
            config,
            sink: None,
            entries: Mutex::new(entries),
        })
    }

    /// Bind the sink that receives retried/requeued entries.
    pub fn with_sink(mut self, sink: Arc<dyn RequeueSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn key_for(id: Uuid) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    /// Park a failed unit of work. Returns the new entry id.
    pub async fn add_entry(
        &self,
        original_task_id: Uuid,
        name: &str,
        payload: serde_json::Value,
        error: &str,
        retry_count: u32,
    ) -> EngineResult<Uuid> {
        let entry = DlqEntry {
            id: Uuid::new_v4(),
            original_task_id,
            name: name.to_owned(),
            payload,
            error: error.to_owned(),
            failed_at: Utc::now(),
            retry_count,
            max_retries: self.config.max_retries(),
            manual_intervention_required: retry_count >= self.config.intervention_threshold(),
        };

        let bytes = serde_json::to_vec(&entry).expect("DLQ entry serializes");
        self.store.put(&Self::key_for(entry.id), &bytes).await?;

        tracing::warn!(
            entry_id = %entry.id,
            task_id = %original_task_id,
            retry_count,
            intervention = entry.manual_intervention_required,
            "task parked in dead-letter queue"
        );

        let id = entry.id;
        self.entries.lock().await.push(entry);
        Ok(id)
    }

    /// Page through entries in insertion order.
    pub async fn entries(&self, limit: usize, offset: usize) -> Vec<DlqEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries awaiting operator action, in insertion order.
    pub async fn entries_requiring_intervention(&self, limit: usize) -> Vec<DlqEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.manual_intervention_required)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Look up a single entry.
    pub async fn get(&self, entry_id: Uuid) -> Option<DlqEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|e| e.id == entry_id)
            .cloned()
    }

    /// Apply a resolution action to an entry.
    ///
    /// Returns `false` when the entry does not exist. Retry/requeue
    /// hand the entry to the bound [`RequeueSink`] before removal;
    /// resolving those without a sink is an error and leaves the entry
    /// in place.
    pub async fn resolve(&self, entry_id: Uuid, action: Resolution) -> EngineResult<bool> {
        let entry = match self.get(entry_id).await {
            Some(entry) => entry,
            None => return Ok(false),
        };

        match &action {
            Resolution::Retry { delay } => {
                let sink = self.sink.as_ref().ok_or_else(|| {
                    EngineError::InvalidInput("no requeue sink bound to the DLQ".into())
                })?;
                sink.requeue(&entry, "default", *delay)
                    .await
                    .map_err(|e| EngineError::ExecutorFailure(format!("requeue failed: {e:#}")))?;
            }
            Resolution::Requeue { queue } => {
                let sink = self.sink.as_ref().ok_or_else(|| {
                    EngineError::InvalidInput("no requeue sink bound to the DLQ".into())
                })?;
                let queue = queue.as_deref().unwrap_or("default");
                sink.requeue(&entry, queue, None)
                    .await
                    .map_err(|e| EngineError::ExecutorFailure(format!("requeue failed: {e:#}")))?;
            }
            Resolution::Discard => {}
        }

        self.store.delete(&Self::key_for(entry_id)).await?;
        self.entries.lock().await.retain(|e| e.id != entry_id);
        tracing::info!(entry_id = %entry_id, ?action, "dead-letter entry resolved");
        Ok(true)
    }

    /// Retry every entry not requiring intervention. Returns how many
    /// were resolved.
    pub async fn retry_all_auto_retryable(&self) -> EngineResult<usize> {
        let candidates: Vec<Uuid> = self
            .entries
            .lock()
            .await
            .iter()
            .filter(|e| !e.manual_intervention_required)
            .map(|e| e.id)
            .collect();

        let mut resolved = 0;
        for id in candidates {
            if self.resolve(id, Resolution::Retry { delay: None }).await? {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    pub async fn stats(&self) -> DlqStats {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        DlqStats {
            total: entries.len(),
            pending_intervention: entries
                .iter()
                .filter(|e| e.manual_intervention_required)
                .count(),
            oldest_entry_age_ms: entries
                .iter()
                .map(|e| (now - e.failed_at).num_milliseconds().max(0) as u64)
                .max(),
        }
    }

    /// Healthy while the queue is small and nothing has rotted for a
    /// week.
    pub async fn is_healthy(&self) -> bool {
        let stats = self.stats().await;
        stats.total < HEALTHY_MAX_ENTRIES
            && stats
                .oldest_entry_age_ms
                .is_none_or(|age| age < HEALTHY_MAX_AGE.as_millis() as u64)
    }

    /// Administrative wipe. Returns the number of removed entries.
    pub async fn clear(&self) -> EngineResult<usize> {
        let ids: Vec<Uuid> = self.entries.lock().await.iter().map(|e| e.id).collect();
        for id in &ids {
            self.store.delete(&Self::key_for(*id)).await?;
        }
        self.entries.lock().await.clear();
        Ok(ids.len())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("sink_bound", &self.sink.is_some())
            .finish()
    }
}
