//! Timeout manager: periodic sweep over running tasks, routing
//! overruns to retry, the dead-letter queue, or cancellation.
//!
//! The sweep never holds the graph lock across an await: candidates
//! are collected under the read lock, then each transition re-checks
//! the task's status under the write lock before applying.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::dlq::DeadLetterQueue;
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::graph::SharedGraph;
use crate::task::{Task, TaskStatus};

/// Where the manager routed a timed-out task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    Retry,
    Dlq,
    Cancel,
}

impl fmt::Display for TimeoutAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Dlq => "dlq",
            Self::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// Advisory callbacks invoked by the sweep.
#[derive(Default)]
pub struct TimeoutHooks {
    /// A timed-out task was routed somewhere.
    pub on_timeout: Option<Box<dyn Fn(&Task, TimeoutAction) + Send + Sync>>,
    /// A timed-out task was parked in the dead-letter queue.
    pub on_dlq: Option<Box<dyn Fn(&Task) + Send + Sync>>,
    /// A pending/blocked task has a failed dependency. Advisory only;
    /// the BLOCKED transition itself is the graph's job.
    pub on_dependency_failed: Option<Box<dyn Fn(&Task, Uuid) + Send + Sync>>,
}

impl fmt::Debug for TimeoutHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutHooks")
            .field("on_timeout", &self.on_timeout.is_some())
            .field("on_dlq", &self.on_dlq.is_some())
            .field("on_dependency_failed", &self.on_dependency_failed.is_some())
            .finish()
    }
}

struct ManagerInner {
    graph: SharedGraph,
    config: TimeoutConfig,
    bus: EventBus,
    dlq: Option<Arc<DeadLetterQueue>>,
    hooks: TimeoutHooks,
    /// Ids handled in the current sweep; cleared at each sweep start
    /// and dropped on stop.
    handled: Mutex<HashSet<Uuid>>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Periodic sweeper over RUNNING tasks. Cheap to clone; clones share
/// the same sweep loop and state.
#[derive(Clone)]
pub struct TimeoutManager {
    inner: Arc<ManagerInner>,
}

impl TimeoutManager {
    pub fn new(graph: SharedGraph, bus: EventBus, config: TimeoutConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                graph,
                config,
                bus,
                dlq: None,
                hooks: TimeoutHooks::default(),
                handled: Mutex::new(HashSet::new()),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Bind the dead-letter queue used for exhausted timeouts.
    /// Builder-style; must be called before the manager is shared.
    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configured before sharing")
            .dlq = Some(dlq);
        self
    }

    /// Attach advisory hooks. Builder-style; must be called before the
    /// manager is shared.
    pub fn with_hooks(mut self, hooks: TimeoutHooks) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configured before sharing")
            .hooks = hooks;
        self
    }

    /// Start the periodic sweep loop. Idempotent: a second start while
    /// running is a no-op.
    pub fn start(&self) {
        let mut cancel = self.inner.cancel.lock().expect("cancel lock poisoned");
        if cancel.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *cancel = Some(token.clone());
        drop(cancel);

        let manager = self.clone();
        let interval = self.inner.config.check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.sweep_once().await,
                    _ = token.cancelled() => break,
                }
            }
        });
        tracing::info!(interval_ms = interval.as_millis() as u64, "timeout manager started");
    }

    /// Stop the sweep loop and drop the handled set. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self
            .inner
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .take()
        {
            token.cancel();
            self.inner
                .handled
                .lock()
                .expect("handled lock poisoned")
                .clear();
            tracing::info!("timeout manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .is_some()
    }

    /// Effective retry ceiling for a task: its own budget, capped by
    /// the manager's configured maximum.
    fn can_retry(&self, task: &Task) -> bool {
        task.retries < task.max_retries.min(self.inner.config.max_retries())
    }

    /// Run one sweep. Exposed so tests and callers can drive sweeps
    /// without the timer.
    pub async fn sweep_once(&self) {
        self.inner
            .handled
            .lock()
            .expect("handled lock poisoned")
            .clear();

        let now = Utc::now();
        let timeout = self.inner.config.task_timeout();

        // 1. Collect overrunning RUNNING tasks under the read lock.
        let timed_out: Vec<Task> = {
            let graph = self.inner.graph.read().expect("graph lock poisoned");
            graph
                .all()
                .into_iter()
                .filter(|t| t.status == TaskStatus::Running)
                .filter(|t| {
                    t.started_at.is_some_and(|started| {
                        (now - started).num_milliseconds() > timeout.as_millis() as i64
                    })
                })
                .collect()
        };

        // 2. Route each one at most once per sweep.
        for task in timed_out {
            {
                let mut handled = self.inner.handled.lock().expect("handled lock poisoned");
                if !handled.insert(task.id) {
                    continue;
                }
            }
            self.route_timed_out(&task).await;
        }

        // 3. Advisory dependency-failure scan.
        if let Some(on_dep_failed) = &self.inner.hooks.on_dependency_failed {
            let victims: Vec<(Task, Uuid)> = {
                let graph = self.inner.graph.read().expect("graph lock poisoned");
                graph
                    .all()
                    .into_iter()
                    .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Blocked))
                    .filter_map(|t| {
                        graph.failed_dependencies_of(&t).first().copied().map(|d| (t, d))
                    })
                    .collect()
            };
            for (task, failed_dep) in victims {
                on_dep_failed(&task, failed_dep);
            }
        }
    }

    /// Apply retry/DLQ/cancel routing to one overrunning task.
    async fn route_timed_out(&self, task: &Task) {
        let timeout_ms = self.inner.config.task_timeout().as_millis() as u64;

        if self.can_retry(task) {
            let transitioned = {
                let mut graph = self.inner.graph.write().expect("graph lock poisoned");
                // The task may have finished between collection and now.
                if graph.get(task.id).is_some_and(|t| t.status == TaskStatus::Running) {
                    let _ = graph.record_attempt_failure(task.id, "timeout");
                    graph.requeue(task.id).is_ok()
                } else {
                    false
                }
            };
            if transitioned {
                tracing::warn!(task_id = %task.id, timeout_ms, "running task timed out, requeued for retry");
                self.inner.bus.emit(TaskEvent::new(
                    task.id,
                    EventKind::TimedOut {
                        action: TimeoutAction::Retry.to_string(),
                    },
                ));
                if let Some(hook) = &self.inner.hooks.on_timeout {
                    hook(task, TimeoutAction::Retry);
                }
            }
            return;
        }

        let error = format!("task timed out after {timeout_ms}ms");

        if self.inner.config.enable_dlq {
            if let Some(dlq) = &self.inner.dlq {
                let failed = {
                    let mut graph = self.inner.graph.write().expect("graph lock poisoned");
                    if graph.get(task.id).is_some_and(|t| t.status == TaskStatus::Running) {
                        graph.mark_failed(task.id, &error).is_ok()
                    } else {
                        false
                    }
                };
                if failed {
                    if let Err(e) = dlq
                        .add_entry(task.id, &task.name, task.payload.clone(), &error, task.retries)
                        .await
                    {
                        tracing::warn!(task_id = %task.id, error = %e, "failed to park timed-out task in DLQ");
                    }
                    self.inner.bus.emit(TaskEvent::new(
                        task.id,
                        EventKind::TimedOut {
                            action: TimeoutAction::Dlq.to_string(),
                        },
                    ));
                    if let Some(hook) = &self.inner.hooks.on_timeout {
                        hook(task, TimeoutAction::Dlq);
                    }
                    if let Some(hook) = &self.inner.hooks.on_dlq {
                        hook(task);
                    }
                    self.cascade_blocked();
                }
                return;
            }
        }

        // No DLQ available: cancel outright.
        let failed = {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            if graph.get(task.id).is_some_and(|t| t.status == TaskStatus::Running) {
                graph.mark_failed(task.id, "cancelled by timeout").is_ok()
            } else {
                false
            }
        };
        if failed {
            tracing::warn!(task_id = %task.id, timeout_ms, "running task cancelled by timeout");
            self.inner.bus.emit(TaskEvent::new(
                task.id,
                EventKind::TimedOut {
                    action: TimeoutAction::Cancel.to_string(),
                },
            ));
            if let Some(hook) = &self.inner.hooks.on_timeout {
                hook(task, TimeoutAction::Cancel);
            }
            self.cascade_blocked();
        }
    }

    /// Cascade BLOCKED transitions after a timeout-induced failure.
    fn cascade_blocked(&self) {
        let blocked = {
            let mut graph = self.inner.graph.write().expect("graph lock poisoned");
            graph.mark_blocked()
        };
        for id in blocked {
            self.inner.bus.emit(TaskEvent::new(id, EventKind::Blocked));
        }
    }
}

impl fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("running", &self.is_running())
            .field("dlq_bound", &self.inner.dlq.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::shared_graph;
    use crate::task::TaskSpec;

    fn manager_config(timeout_ms: i64) -> TimeoutConfig {
        TimeoutConfig {
            task_timeout_ms: timeout_ms,
            check_interval_ms: 20,
            ..TimeoutConfig::default()
        }
    }

    #[tokio::test]
    async fn start_stop_idempotent() {
        let manager = TimeoutManager::new(shared_graph(), EventBus::new(), manager_config(1_000));

        manager.start();
        manager.start();
        assert!(manager.is_running());

        manager.stop();
        manager.stop();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn sweep_retries_overrunning_task() {
        let graph = shared_graph();
        let id = graph
            .write()
            .unwrap()
            .insert(TaskSpec::new("slow").max_retries(2))
            .unwrap();
        graph.write().unwrap().mark_running(id, "worker").unwrap();

        // Sub-second timeout: valid for the manager (only the
        // scheduler's budget is range-clamped).
        let manager = TimeoutManager::new(Arc::clone(&graph), EventBus::new(), manager_config(30));

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        manager.sweep_once().await;

        let task = graph.read().unwrap().get(id).unwrap().clone();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);
        assert_eq!(task.error.as_deref(), Some("timeout"));
        assert!(task.started_at.is_none(), "requeue resets the clock");
    }

    #[tokio::test]
    async fn sweep_ignores_fresh_running_tasks() {
        let graph = shared_graph();
        let id = graph
            .write()
            .unwrap()
            .insert(TaskSpec::new("fresh").max_retries(2))
            .unwrap();
        graph.write().unwrap().mark_running(id, "worker").unwrap();

        let manager =
            TimeoutManager::new(Arc::clone(&graph), EventBus::new(), manager_config(60_000));
        manager.sweep_once().await;

        assert_eq!(
            graph.read().unwrap().get(id).unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn dependency_failure_advisory_fires() {
        let graph = shared_graph();
        let (a, b) = {
            let mut g = graph.write().unwrap();
            let a = g.insert(TaskSpec::new("a")).unwrap();
            let b = g.insert(TaskSpec::new("b").depends_on([a])).unwrap();
            g.mark_failed(a, "boom").unwrap();
            (a, b)
        };

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let manager =
            TimeoutManager::new(Arc::clone(&graph), EventBus::new(), manager_config(60_000))
                .with_hooks(TimeoutHooks {
                    on_dependency_failed: Some(Box::new(move |task, dep| {
                        sink.lock().unwrap().push((task.id, dep));
                    })),
                    ..TimeoutHooks::default()
                });

        manager.sweep_once().await;

        let calls = seen.lock().unwrap();
        assert_eq!(calls.as_slice(), &[(b, a)]);
        // Advisory only: the graph still shows PENDING until
        // mark_blocked runs.
        assert_eq!(
            graph.read().unwrap().get(b).unwrap().status,
            TaskStatus::Pending
        );
    }
}
