//! Guardian: periodic health sweep detecting starved pending tasks and
//! wedged runners.
//!
//! Advisory only -- the guardian observes and reports, it never mutates
//! task state. Routing decisions stay with the scheduler and timeout
//! manager.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::GuardianConfig;
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::graph::SharedGraph;
use crate::task::{Task, TaskStatus};

/// Snapshot handed to `on_check` after every sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardianReport {
    pub timestamp: DateTime<Utc>,
    pub pending_count: usize,
    pub running_count: usize,
    pub stuck_count: usize,
    pub total_count: usize,
}

/// Lifetime counters across sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardianStats {
    pub check_count: u64,
    pub pending_timeouts_detected: u64,
    pub stuck_tasks_detected: u64,
}

/// Advisory callbacks invoked by the sweep.
#[derive(Default)]
pub struct GuardianHooks {
    /// A PENDING task has waited past the starvation threshold.
    pub on_pending_timeout: Option<Box<dyn Fn(&Task) + Send + Sync>>,
    /// Companion callback fired alongside `on_pending_timeout`.
    pub on_task_timeout: Option<Box<dyn Fn(&Task) + Send + Sync>>,
    /// A RUNNING task has been executing past the wedge threshold.
    pub on_task_stuck: Option<Box<dyn Fn(&Task) + Send + Sync>>,
    /// Sweep summary.
    pub on_check: Option<Box<dyn Fn(&GuardianReport) + Send + Sync>>,
}

impl fmt::Debug for GuardianHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardianHooks")
            .field("on_pending_timeout", &self.on_pending_timeout.is_some())
            .field("on_task_timeout", &self.on_task_timeout.is_some())
            .field("on_task_stuck", &self.on_task_stuck.is_some())
            .field("on_check", &self.on_check.is_some())
            .finish()
    }
}

struct GuardianInner {
    graph: SharedGraph,
    config: GuardianConfig,
    bus: EventBus,
    hooks: GuardianHooks,
    stats: Mutex<GuardianStats>,
    cancel: Mutex<Option<CancellationToken>>,
}

/// Periodic advisory sweeper over the whole graph. Cheap to clone;
/// clones share the same sweep loop and counters.
#[derive(Clone)]
pub struct Guardian {
    inner: Arc<GuardianInner>,
}

impl Guardian {
    pub fn new(graph: SharedGraph, bus: EventBus, config: GuardianConfig) -> Self {
        Self {
            inner: Arc::new(GuardianInner {
                graph,
                config,
                bus,
                hooks: GuardianHooks::default(),
                stats: Mutex::new(GuardianStats::default()),
                cancel: Mutex::new(None),
            }),
        }
    }

    /// Attach advisory hooks. Builder-style; must be called before the
    /// guardian is shared.
    pub fn with_hooks(mut self, hooks: GuardianHooks) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("configured before sharing")
            .hooks = hooks;
        self
    }

    /// Start the periodic sweep loop. Idempotent.
    pub fn start(&self) {
        let mut cancel = self.inner.cancel.lock().expect("cancel lock poisoned");
        if cancel.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *cancel = Some(token.clone());
        drop(cancel);

        let guardian = self.clone();
        let interval = self.inner.config.check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => guardian.sweep_once(),
                    _ = token.cancelled() => break,
                }
            }
        });
        tracing::info!(interval_ms = interval.as_millis() as u64, "guardian started");
    }

    /// Stop the sweep loop. Idempotent.
    pub fn stop(&self) {
        if let Some(token) = self
            .inner
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .take()
        {
            token.cancel();
            tracing::info!("guardian stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .cancel
            .lock()
            .expect("cancel lock poisoned")
            .is_some()
    }

    pub fn stats(&self) -> GuardianStats {
        *self.inner.stats.lock().expect("stats lock poisoned")
    }

    /// Run one sweep. Exposed so tests and callers can drive sweeps
    /// without the timer.
    pub fn sweep_once(&self) {
        let now = Utc::now();
        let max_pending = self.inner.config.max_pending_age().as_millis() as i64;
        let max_running = self.inner.config.max_running_age().as_millis() as i64;

        let tasks = self.inner.graph.read().expect("graph lock poisoned").all();

        let mut pending_count = 0;
        let mut running_count = 0;
        let mut starved = Vec::new();
        let mut stuck = Vec::new();

        for task in &tasks {
            match task.status {
                TaskStatus::Pending => {
                    pending_count += 1;
                    if (now - task.created_at).num_milliseconds() > max_pending {
                        starved.push(task.clone());
                    }
                }
                TaskStatus::Running => {
                    running_count += 1;
                    if task
                        .started_at
                        .is_some_and(|started| (now - started).num_milliseconds() > max_running)
                    {
                        stuck.push(task.clone());
                    }
                }
                _ => {}
            }
        }

        for task in &starved {
            tracing::warn!(
                task_id = %task.id,
                age_ms = (now - task.created_at).num_milliseconds(),
                "pending task starved past threshold"
            );
            self.inner.bus.emit(TaskEvent::new(task.id, EventKind::Starved));
            if let Some(hook) = &self.inner.hooks.on_pending_timeout {
                hook(task);
            }
            if let Some(hook) = &self.inner.hooks.on_task_timeout {
                hook(task);
            }
        }

        for task in &stuck {
            tracing::warn!(
                task_id = %task.id,
                executor = task.assigned_executor.as_deref().unwrap_or("-"),
                "running task appears stuck"
            );
            self.inner.bus.emit(TaskEvent::new(task.id, EventKind::Stuck));
            if let Some(hook) = &self.inner.hooks.on_task_stuck {
                hook(task);
            }
        }

        {
            let mut stats = self.inner.stats.lock().expect("stats lock poisoned");
            stats.check_count += 1;
            stats.pending_timeouts_detected += starved.len() as u64;
            stats.stuck_tasks_detected += stuck.len() as u64;
        }

        let report = GuardianReport {
            timestamp: now,
            pending_count,
            running_count,
            stuck_count: stuck.len(),
            total_count: tasks.len(),
        };
        if let Some(hook) = &self.inner.hooks.on_check {
            hook(&report);
        }
    }
}

impl fmt::Debug for Guardian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guardian")
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}
