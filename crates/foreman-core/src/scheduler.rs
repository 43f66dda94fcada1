//! Single-task execution: dispatch to an executor, race against the
//! timeout, route failures through retry backoff, emit lifecycle
//! events.
//!
//! Lock discipline: the graph lock is always taken before the dispatch
//! sets lock, and neither is held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::Rng;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::executor::ExecutorRegistry;
use crate::graph::{GraphView, SharedGraph, StatusCounts};
use crate::task::{TaskResult, TaskStatus};

/// The running/completed/failed id sets, guarded together so the three
/// updates of one transition are observed as a unit.
#[derive(Debug, Default)]
struct DispatchSets {
    running: HashSet<Uuid>,
    completed: HashSet<Uuid>,
    failed: HashSet<Uuid>,
}

/// Executes tasks against registered executors.
#[derive(Clone)]
pub struct Scheduler {
    graph: SharedGraph,
    registry: ExecutorRegistry,
    bus: EventBus,
    config: SchedulerConfig,
    sets: Arc<Mutex<DispatchSets>>,
    /// Deferred back-to-pending transitions, cancellable per task.
    pending_retries: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(
        graph: SharedGraph,
        registry: ExecutorRegistry,
        bus: EventBus,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            registry,
            bus,
            config,
            sets: Arc::new(Mutex::new(DispatchSets::default())),
            pending_retries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Ids currently running, as seen by the dispatch sets.
    pub fn running(&self) -> HashSet<Uuid> {
        self.sets.lock().expect("dispatch sets lock poisoned").running.clone()
    }

    /// Sizes of the running/completed/failed dispatch sets, observed
    /// under one lock so the three counts are mutually consistent.
    pub fn dispatch_counts(&self) -> (usize, usize, usize) {
        let sets = self.sets.lock().expect("dispatch sets lock poisoned");
        (sets.running.len(), sets.completed.len(), sets.failed.len())
    }

    /// Compute the ready set against the current running set and
    /// concurrency budget.
    pub fn ready(&self) -> Vec<crate::task::Task> {
        let running = self.running();
        self.graph
            .read()
            .expect("graph lock poisoned")
            .ready(&running, self.config.max_concurrent())
    }

    /// True iff the graph is non-empty and every task is terminal.
    pub fn is_complete(&self) -> bool {
        self.graph.read().expect("graph lock poisoned").is_complete()
    }

    /// Task counts per status.
    pub fn status(&self) -> StatusCounts {
        self.graph.read().expect("graph lock poisoned").status_counts()
    }

    /// Execute one attempt of `task_id` on the named executor.
    ///
    /// Marks the task RUNNING, races the executor against the
    /// configured timeout, and records the outcome. On failure with
    /// retry budget left, a deferred transition back to PENDING is
    /// scheduled with exponential backoff; either way the error is
    /// propagated to the caller.
    pub async fn execute_task(&self, task_id: Uuid, executor_id: &str) -> EngineResult<TaskResult> {
        let task = self
            .graph
            .read()
            .expect("graph lock poisoned")
            .get(task_id)
            .cloned()
            .ok_or(EngineError::TaskNotFound(task_id))?;

        let executor = self
            .registry
            .get(executor_id)
            .ok_or_else(|| EngineError::ExecutorNotFound(executor_id.to_owned()))?;

        {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            graph.mark_running(task_id, executor_id)?;
            self.sets
                .lock()
                .expect("dispatch sets lock poisoned")
                .running
                .insert(task_id);
        }
        tracing::info!(task_id = %task_id, executor = executor_id, attempt = task.retries, "task started");
        self.bus.emit(TaskEvent::new(task_id, EventKind::Started));

        let view = GraphView::new(Arc::clone(&self.graph));
        let timeout = self.config.task_timeout();
        let started = Instant::now();

        // Soft timeout: if the deadline wins, the executor future is
        // dropped and any late result is discarded with it.
        let outcome = tokio::time::timeout(timeout, executor.execute(&task, &view)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                let result = TaskResult {
                    success: true,
                    output,
                    duration_ms,
                };
                let recorded = {
                    let mut graph = self.graph.write().expect("graph lock poisoned");
                    let mut sets = self.sets.lock().expect("dispatch sets lock poisoned");
                    sets.running.remove(&task_id);
                    // A sweeper may have routed this task elsewhere
                    // while the executor ran; a late result is
                    // discarded.
                    let still_running = graph
                        .get(task_id)
                        .is_some_and(|t| t.status == TaskStatus::Running);
                    if still_running {
                        graph.mark_completed(task_id, result.clone())?;
                        sets.completed.insert(task_id);
                    }
                    still_running
                };
                if recorded {
                    tracing::info!(task_id = %task_id, duration_ms, "task completed");
                    self.bus.emit(TaskEvent::new(task_id, EventKind::Completed));
                } else {
                    tracing::debug!(task_id = %task_id, "late executor result discarded");
                }
                Ok(result)
            }
            Ok(Err(e)) => {
                let error = EngineError::ExecutorFailure(format!("{e:#}"));
                self.handle_failure(task_id, &error).await;
                Err(error)
            }
            Err(_elapsed) => {
                let error = EngineError::Timeout {
                    task_id,
                    timeout_ms: timeout.as_millis() as u64,
                };
                self.handle_failure(task_id, &error).await;
                Err(error)
            }
        }
    }

    /// Route a failed attempt: retry with backoff when budget remains,
    /// otherwise fail permanently and cascade blocking.
    async fn handle_failure(&self, task_id: Uuid, error: &EngineError) {
        let message = error.to_string();

        let retry_plan = {
            let mut graph = self.graph.write().expect("graph lock poisoned");
            let mut sets = self.sets.lock().expect("dispatch sets lock poisoned");
            sets.running.remove(&task_id);

            // A sweeper may already have requeued or failed this task;
            // this attempt's outcome is then stale.
            let still_running = graph
                .get(task_id)
                .is_some_and(|t| t.status == TaskStatus::Running);
            if !still_running {
                tracing::debug!(task_id = %task_id, "late executor failure discarded");
                return;
            }

            let can_retry = graph.get(task_id).is_some_and(|t| t.can_retry());
            if can_retry {
                match graph.record_attempt_failure(task_id, &message) {
                    Ok(attempt) => Some(attempt),
                    Err(_) => None,
                }
            } else {
                if graph.mark_failed(task_id, &message).is_ok() {
                    sets.failed.insert(task_id);
                }
                None
            }
        };

        match retry_plan {
            Some(attempt) => {
                let delay = self.retry_delay_for(attempt);
                tracing::warn!(
                    task_id = %task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "task failed, retry scheduled"
                );
                self.bus.emit(TaskEvent::new(
                    task_id,
                    EventKind::Failed {
                        retry: true,
                        attempt,
                        delay_ms: Some(delay.as_millis() as u64),
                    },
                ));
                self.schedule_retry(task_id, delay);
            }
            None => {
                let attempt = self
                    .graph
                    .read()
                    .expect("graph lock poisoned")
                    .get(task_id)
                    .map(|t| t.retries)
                    .unwrap_or(0);
                tracing::warn!(task_id = %task_id, error = %message, "task failed permanently");
                self.bus.emit(TaskEvent::new(
                    task_id,
                    EventKind::Failed {
                        retry: false,
                        attempt,
                        delay_ms: None,
                    },
                ));

                let blocked = {
                    let mut graph = self.graph.write().expect("graph lock poisoned");
                    graph.mark_blocked()
                };
                for id in blocked {
                    self.bus.emit(TaskEvent::new(id, EventKind::Blocked));
                }
            }
        }
    }

    /// Exponential backoff with jitter, capped at
    /// [`SchedulerConfig::MAX_RETRY_DELAY_MS`].
    fn retry_delay_for(&self, attempt: u32) -> std::time::Duration {
        let base = self.config.retry_delay().as_millis() as f64;
        let jitter: f64 = rand::rng().random_range(0.0..=0.2);
        let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
        let delay = (base * exp * (1.0 + jitter)).min(SchedulerConfig::MAX_RETRY_DELAY_MS as f64);
        std::time::Duration::from_millis(delay as u64)
    }

    /// Schedule the deferred RUNNING -> PENDING transition for a retry.
    fn schedule_retry(&self, task_id: Uuid, delay: std::time::Duration) {
        let graph = Arc::clone(&self.graph);
        let bus = self.bus.clone();
        let pending = Arc::clone(&self.pending_retries);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let requeued = {
                let mut graph = graph.write().expect("graph lock poisoned");
                graph.requeue(task_id).is_ok()
            };
            if requeued {
                bus.emit(TaskEvent::new(task_id, EventKind::RetryScheduled));
            }
            pending
                .lock()
                .expect("pending retries lock poisoned")
                .remove(&task_id);
        });

        // Replace any prior timer for the same task.
        if let Some(old) = self
            .pending_retries
            .lock()
            .expect("pending retries lock poisoned")
            .insert(task_id, handle)
        {
            old.abort();
        }
    }

    /// Cancel a scheduled retry transition. Returns `true` if one was
    /// pending.
    pub fn cancel_pending_retry(&self, task_id: Uuid) -> bool {
        if let Some(handle) = self
            .pending_retries
            .lock()
            .expect("pending retries lock poisoned")
            .remove(&task_id)
        {
            handle.abort();
            true
        } else {
            false
        }
    }

    /// Number of retry transitions currently waiting on their delay.
    pub fn pending_retry_count(&self) -> usize {
        self.pending_retries
            .lock()
            .expect("pending retries lock poisoned")
            .len()
    }

    /// Abort all pending retry timers. Idempotent.
    pub fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self
                .pending_retries
                .lock()
                .expect("pending retries lock poisoned");
            pending.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("status", &self.status())
            .field("pending_retries", &self.pending_retry_count())
            .finish()
    }
}
