//! Engine facade: owns the graph, bus, registry, and scheduler, and
//! runs the bounded dispatch loop to completion.
//!
//! The engine is a constructed value owned by the caller -- tests
//! instantiate a fresh engine per case. Sweepers (timeout manager,
//! guardian) are built against the engine's shared graph and bus and
//! run independently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, GuardianConfig, TimeoutConfig};
use crate::dlq::DeadLetterQueue;
use crate::error::EngineResult;
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::executor::{Executor, ExecutorRegistry};
use crate::graph::{GraphView, SharedGraph, StatusCounts, shared_graph};
use crate::guardian::Guardian;
use crate::scheduler::Scheduler;
use crate::state::{SnapshotPatch, StateManager, TaskSnapshot};
use crate::task::{Task, TaskResult, TaskSpec, TaskStatus};
use crate::timeout::TimeoutManager;

/// How long a cancelled run waits for in-flight executions to land.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle backoff between dispatch passes when nothing is in flight.
const IDLE_SLEEP: Duration = Duration::from_millis(50);

/// Result of running the engine to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Every task completed successfully.
    Completed,
    /// One or more tasks failed or were blocked by failures.
    Failed {
        failed: Vec<String>,
        blocked: Vec<String>,
    },
    /// The run was interrupted by a cancellation signal.
    Interrupted,
}

/// Message sent from spawned executions back to the dispatch loop.
struct ExecutionDone {
    task_id: Uuid,
    name: String,
    result: EngineResult<TaskResult>,
}

/// The orchestration engine.
pub struct Engine {
    graph: SharedGraph,
    bus: EventBus,
    registry: ExecutorRegistry,
    scheduler: Scheduler,
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let graph = shared_graph();
        let bus = EventBus::new();
        let registry = ExecutorRegistry::new();
        let scheduler = Scheduler::new(
            Arc::clone(&graph),
            registry.clone(),
            bus.clone(),
            config.scheduler.clone(),
        );
        Self {
            graph,
            bus,
            registry,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Read-only view of the graph, as handed to executors.
    pub fn graph_view(&self) -> GraphView {
        GraphView::new(Arc::clone(&self.graph))
    }

    /// The shared graph handle, for wiring sweepers or sinks built
    /// outside the engine's convenience constructors.
    pub fn shared_graph(&self) -> SharedGraph {
        Arc::clone(&self.graph)
    }

    /// Insert a task. Validation failures surface synchronously.
    pub fn submit(&self, spec: TaskSpec) -> EngineResult<Uuid> {
        self.graph.write().expect("graph lock poisoned").insert(spec)
    }

    /// Register an executor, replacing any prior binding for its id.
    pub fn register_executor(&self, executor: impl Executor + 'static) {
        self.registry.register(executor);
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler);
    }

    pub fn status(&self) -> StatusCounts {
        self.scheduler.status()
    }

    /// Look up a task.
    pub fn task(&self, id: Uuid) -> Option<Task> {
        self.graph.read().expect("graph lock poisoned").get(id).cloned()
    }

    /// Dependency-consistent linear order over all tasks.
    pub fn topological_order(&self) -> Vec<Uuid> {
        self.graph.read().expect("graph lock poisoned").topological_order()
    }

    /// Build a timeout manager over this engine's graph and bus.
    pub fn timeout_manager(
        &self,
        config: TimeoutConfig,
        dlq: Option<Arc<DeadLetterQueue>>,
    ) -> TimeoutManager {
        let mut manager = TimeoutManager::new(Arc::clone(&self.graph), self.bus.clone(), config);
        if let Some(dlq) = dlq {
            manager = manager.with_dlq(dlq);
        }
        manager
    }

    /// Build a guardian over this engine's graph and bus.
    pub fn guardian(&self, config: GuardianConfig) -> Guardian {
        Guardian::new(Arc::clone(&self.graph), self.bus.clone(), config)
    }

    /// Mirror lifecycle events into a state manager.
    ///
    /// Events are forwarded over a channel to a spawned applier task,
    /// so bus subscribers stay synchronous while snapshot persistence
    /// awaits the store. Must be called from within a runtime.
    pub fn attach_state_manager(&self, state: Arc<StateManager>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
        self.bus.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });

        let view = self.graph_view();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                Self::apply_to_state(&state, &view, &event).await;
            }
        });
    }

    async fn apply_to_state(state: &StateManager, view: &GraphView, event: &TaskEvent) {
        let task_id = event.task_id;
        match &event.kind {
            EventKind::Started => {
                if state.get(task_id).is_none() {
                    let name = view
                        .get(task_id)
                        .map(|t| t.name)
                        .unwrap_or_else(|| task_id.to_string());
                    state.create(task_id, &name, None).await;
                }
                state.mark_running(task_id).await;
            }
            EventKind::Completed => {
                let output = view.get(task_id).and_then(|t| t.result.map(|r| r.output));
                state.mark_completed(task_id, output).await;
            }
            EventKind::Failed { retry: false, .. } => {
                let error = view
                    .get(task_id)
                    .and_then(|t| t.error)
                    .unwrap_or_else(|| "task failed".to_owned());
                state.mark_failed(task_id, &error).await;
            }
            EventKind::Failed { retry: true, .. } => {
                let error = view.get(task_id).and_then(|t| t.error);
                state
                    .update(
                        task_id,
                        SnapshotPatch {
                            error,
                            ..SnapshotPatch::default()
                        },
                    )
                    .await;
            }
            EventKind::RetryScheduled => {
                state
                    .update(
                        task_id,
                        SnapshotPatch {
                            status: Some(TaskStatus::Pending),
                            ..SnapshotPatch::default()
                        },
                    )
                    .await;
            }
            EventKind::Blocked => {
                state
                    .update(
                        task_id,
                        SnapshotPatch {
                            status: Some(TaskStatus::Blocked),
                            ..SnapshotPatch::default()
                        },
                    )
                    .await;
            }
            EventKind::TimedOut { .. } | EventKind::Starved | EventKind::Stuck => {}
        }
    }

    /// Recover non-terminal snapshots after a restart.
    ///
    /// Every recoverable snapshot is run through
    /// [`StateManager::recover`], flipping interrupted RUNNING work
    /// back to PENDING with progress preserved. The recovered
    /// snapshots are returned so the caller can resubmit the
    /// corresponding task specs.
    pub async fn recover_from(&self, state: &StateManager) -> Vec<TaskSnapshot> {
        let mut recovered = Vec::new();
        for snapshot in state.recoverable().await {
            if let Some(snapshot) = state.recover(snapshot.task_id).await {
                tracing::info!(
                    task_id = %snapshot.task_id,
                    name = %snapshot.name,
                    progress = snapshot.progress,
                    "snapshot recovered for redispatch"
                );
                recovered.push(snapshot);
            }
        }
        recovered
    }

    /// Pick the executor for a task: its pinned executor when
    /// registered, otherwise round-robin over the registry.
    fn select_executor(&self, task: &Task) -> Result<String> {
        if let Some(preferred) = &task.requested_executor {
            if self.registry.get(preferred).is_some() {
                return Ok(preferred.clone());
            }
            tracing::warn!(
                task_name = %task.name,
                preferred = %preferred,
                "pinned executor not registered, falling back to round-robin"
            );
        }
        match self.registry.next_round_robin() {
            Some(executor) => Ok(executor.id().to_owned()),
            None => bail!("no executors registered"),
        }
    }

    /// Run the dispatch loop until every task is terminal or the token
    /// is cancelled.
    ///
    /// Ready tasks are spawned onto the runtime and report back over a
    /// channel; the loop parks on that channel when saturated and
    /// sleeps briefly when idle (retry timers may still be pending).
    pub async fn run(&self, cancel: CancellationToken) -> Result<EngineOutcome> {
        if self.registry.is_empty() {
            bail!("no executors registered");
        }

        let max_concurrent = self.config.scheduler.max_concurrent();
        let (tx, mut rx) = mpsc::channel::<ExecutionDone>(max_concurrent * 2);
        let mut in_flight: usize = 0;
        // Tasks spawned but not yet reported done; guards against
        // re-dispatching a task before its execution lands.
        let mut dispatched: HashSet<Uuid> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                tracing::info!(remaining = in_flight, "engine cancelled, draining in-flight tasks");
                let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
                while in_flight > 0 {
                    match tokio::time::timeout_at(deadline, rx.recv()).await {
                        Ok(Some(done)) => {
                            in_flight -= 1;
                            dispatched.remove(&done.task_id);
                            Self::log_done(&done);
                        }
                        _ => break,
                    }
                }
                if in_flight > 0 {
                    tracing::warn!(remaining = in_flight, "drain timeout expired");
                }
                self.scheduler.shutdown();
                return Ok(EngineOutcome::Interrupted);
            }

            // Drain completed executions without blocking.
            while let Ok(done) = rx.try_recv() {
                in_flight -= 1;
                dispatched.remove(&done.task_id);
                Self::log_done(&done);
            }

            // Termination check.
            if in_flight == 0 && self.scheduler.is_complete() {
                return Ok(self.final_outcome());
            }

            // Dispatch ready tasks. The scheduler's running set lags
            // behind freshly spawned executions, so cap by in-flight
            // count here as well.
            let capacity = max_concurrent.saturating_sub(in_flight);
            let ready: Vec<Task> = self
                .scheduler
                .ready()
                .into_iter()
                .filter(|t| !dispatched.contains(&t.id))
                .take(capacity)
                .collect();
            let spawned_any = !ready.is_empty();

            for task in ready {
                let executor_id = self.select_executor(&task)?;
                let scheduler = self.scheduler.clone();
                let tx = tx.clone();
                let task_id = task.id;
                let name = task.name.clone();

                dispatched.insert(task_id);
                in_flight += 1;

                tokio::spawn(async move {
                    let result = scheduler.execute_task(task_id, &executor_id).await;
                    let _ = tx
                        .send(ExecutionDone {
                            task_id,
                            name,
                            result,
                        })
                        .await;
                });
            }

            if in_flight >= max_concurrent || (in_flight > 0 && !spawned_any) {
                // Saturated, or waiting on stragglers: park until a
                // result or cancellation arrives.
                tokio::select! {
                    done = rx.recv() => {
                        if let Some(done) = done {
                            in_flight -= 1;
                            dispatched.remove(&done.task_id);
                            Self::log_done(&done);
                        }
                    }
                    _ = cancel.cancelled() => continue,
                }
            } else if !spawned_any {
                // Nothing runnable yet -- a retry timer or sweeper may
                // free work up. Brief sleep to avoid a busy loop.
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = cancel.cancelled() => continue,
                }
            }
        }
    }

    fn log_done(done: &ExecutionDone) {
        match &done.result {
            Ok(result) => {
                tracing::debug!(
                    task_id = %done.task_id,
                    task_name = %done.name,
                    duration_ms = result.duration_ms,
                    "execution finished"
                );
            }
            Err(e) => {
                tracing::debug!(
                    task_id = %done.task_id,
                    task_name = %done.name,
                    error = %e,
                    "execution failed, scheduler routed the outcome"
                );
            }
        }
    }

    /// Summarize a completed run from final task statuses.
    fn final_outcome(&self) -> EngineOutcome {
        let tasks = self.graph.read().expect("graph lock poisoned").all();
        let failed: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.name.clone())
            .collect();
        let blocked: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| t.name.clone())
            .collect();

        if failed.is_empty() && blocked.is_empty() {
            EngineOutcome::Completed
        } else {
            EngineOutcome::Failed { failed, blocked }
        }
    }

    /// Release scheduler timers. Sweepers built from this engine are
    /// stopped by their own `stop()`.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("status", &self.status())
            .field("executors", &self.registry.list())
            .finish()
    }
}

/// Default [`crate::dlq::RequeueSink`] that re-inserts the original
/// task into the engine's graph as PENDING with a single attempt.
pub struct GraphRequeueSink {
    graph: SharedGraph,
}

impl GraphRequeueSink {
    pub fn new(engine: &Engine) -> Arc<Self> {
        Arc::new(Self {
            graph: Arc::clone(&engine.graph),
        })
    }
}

#[async_trait::async_trait]
impl crate::dlq::RequeueSink for GraphRequeueSink {
    async fn requeue(
        &self,
        entry: &crate::dlq::DlqEntry,
        queue: &str,
        delay: Option<Duration>,
    ) -> Result<()> {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut graph = self.graph.write().expect("graph lock poisoned");
        match graph.get(entry.original_task_id).map(|t| t.status) {
            // The original record is still present: put it back in
            // circulation directly.
            Some(_) => {
                graph.requeue(entry.original_task_id)?;
            }
            // Entry outlived the task (e.g. restart): insert a fresh
            // single-attempt task from the parked payload.
            None => {
                graph.insert(
                    TaskSpec::new(entry.name.clone())
                        .payload(entry.payload.clone())
                        .max_retries(0),
                )?;
            }
        }
        tracing::info!(
            task_id = %entry.original_task_id,
            queue,
            "dead-letter entry requeued"
        );
        Ok(())
    }
}
