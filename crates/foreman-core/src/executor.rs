//! The `Executor` trait -- the port through which the scheduler runs
//! task bodies.
//!
//! Each executor is a named async callable. The trait is object-safe so
//! the registry can store `Arc<dyn Executor>` and the scheduler can
//! hand clones to spawned execution tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::graph::GraphView;
use crate::task::Task;

/// A registered unit-of-work runner.
///
/// The scheduler treats any returned error as a failed attempt and
/// routes it through retry/DLQ policy. Executors receive a read-only
/// [`GraphView`] to inspect other tasks' state; they never mutate the
/// graph.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name this executor registers under (e.g. "worker-1").
    fn id(&self) -> &str;

    /// Run one attempt of `task`. The returned value becomes the
    /// task's result output.
    async fn execute(&self, task: &Task, graph: &GraphView) -> Result<serde_json::Value>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
};

/// Closure-to-executor adapter.
///
/// Wraps an async closure so callers and tests can register executors
/// without defining a struct per behavior.
pub struct FnExecutor {
    executor_id: String,
    #[allow(clippy::type_complexity)]
    f: Box<dyn Fn(Task, GraphView) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>,
}

impl FnExecutor {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(Task, GraphView) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            executor_id: id.into(),
            f: Box::new(move |task, graph| Box::pin(f(task, graph))),
        }
    }
}

#[async_trait]
impl Executor for FnExecutor {
    fn id(&self) -> &str {
        &self.executor_id
    }

    async fn execute(&self, task: &Task, graph: &GraphView) -> Result<serde_json::Value> {
        (self.f)(task.clone(), graph.clone()).await
    }
}

/// A collection of registered [`Executor`] implementations, keyed by id.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<RwLock<ExecutorTable>>,
}

#[derive(Default)]
struct ExecutorTable {
    by_id: HashMap<String, Arc<dyn Executor>>,
    /// Registration order, for round-robin fallback selection.
    order: Vec<String>,
    next: usize,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under the id it reports.
    ///
    /// Re-registration under the same id replaces the previous binding
    /// and returns it.
    pub fn register(&self, executor: impl Executor + 'static) -> Option<Arc<dyn Executor>> {
        self.register_arc(Arc::new(executor))
    }

    /// Register an already-shared executor.
    pub fn register_arc(&self, executor: Arc<dyn Executor>) -> Option<Arc<dyn Executor>> {
        let id = executor.id().to_owned();
        let mut table = self.executors.write().expect("registry lock poisoned");
        let old = table.by_id.insert(id.clone(), executor);
        if old.is_none() {
            table.order.push(id);
        }
        old
    }

    /// Look up an executor by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Executor>> {
        self.executors
            .read()
            .expect("registry lock poisoned")
            .by_id
            .get(id)
            .cloned()
    }

    /// Pick the next executor round-robin over registration order.
    pub fn next_round_robin(&self) -> Option<Arc<dyn Executor>> {
        let mut table = self.executors.write().expect("registry lock poisoned");
        if table.order.is_empty() {
            return None;
        }
        let idx = table.next % table.order.len();
        table.next = table.next.wrapping_add(1);
        let id = table.order[idx].clone();
        table.by_id.get(&id).cloned()
    }

    /// Ids of all registered executors, in registration order.
    pub fn list(&self) -> Vec<String> {
        self.executors
            .read()
            .expect("registry lock poisoned")
            .order
            .clone()
    }

    pub fn len(&self) -> usize {
        self.executors
            .read()
            .expect("registry lock poisoned")
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.list())
            .finish()
    }
}
