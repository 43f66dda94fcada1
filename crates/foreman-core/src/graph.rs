//! Task graph: task records, dependency adjacency, and ready-set
//! queries.
//!
//! The graph is the single authority on task status. Mutation goes
//! through the semantic transition methods; sweepers and the scheduler
//! share the graph behind an `RwLock` and hold it only for short,
//! non-awaiting critical sections.
//!
//! Acyclicity is enforced structurally: edges are only created at
//! insert and may only reference tasks that already exist, so every
//! edge points backward in insertion time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::task::{Task, TaskResult, TaskSpec, TaskStatus};

/// Hard limit on task name length.
pub const MAX_NAME_LEN: usize = 200;
/// Hard limit on direct dependencies per task.
pub const MAX_DEPENDENCIES: usize = 100;
/// Hard limit on the per-task retry budget.
pub const MAX_RETRY_LIMIT: u32 = 10;

/// Counts of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.blocked
    }
}

/// Dependency-aware task collection.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<Uuid, Task>,
    /// id -> ids that depend on it (forward edges).
    dependents: HashMap<Uuid, Vec<Uuid>>,
    /// id -> ids it depends on (reverse edges, == Task.dependencies).
    depends_on: HashMap<Uuid, Vec<Uuid>>,
    /// Insertion order, for stable iteration and ready-set ties.
    order: Vec<Uuid>,
    next_seq: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a spec and insert it as a PENDING task.
    ///
    /// Fails with `InvalidInput` when the name is empty or too long,
    /// the retry budget exceeds the limit, there are too many
    /// dependencies, or any referenced dependency does not exist.
    pub fn insert(&mut self, spec: TaskSpec) -> EngineResult<Uuid> {
        if spec.name.is_empty() || spec.name.len() > MAX_NAME_LEN {
            return Err(EngineError::InvalidInput(format!(
                "task name must be 1..{MAX_NAME_LEN} characters, got {}",
                spec.name.len()
            )));
        }
        if spec.max_retries > MAX_RETRY_LIMIT {
            return Err(EngineError::InvalidInput(format!(
                "max_retries must be <= {MAX_RETRY_LIMIT}, got {}",
                spec.max_retries
            )));
        }
        if spec.dependencies.len() > MAX_DEPENDENCIES {
            return Err(EngineError::InvalidInput(format!(
                "at most {MAX_DEPENDENCIES} dependencies allowed, got {}",
                spec.dependencies.len()
            )));
        }
        for dep in &spec.dependencies {
            if !self.tasks.contains_key(dep) {
                return Err(EngineError::InvalidInput(format!(
                    "dependency {dep} does not exist"
                )));
            }
        }

        let id = Uuid::new_v4();
        let task = Task {
            id,
            name: spec.name,
            description: spec.description,
            priority: spec.priority,
            status: TaskStatus::Pending,
            dependencies: spec.dependencies.clone(),
            retries: 0,
            max_retries: spec.max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_executor: None,
            result: None,
            error: None,
            payload: spec.payload,
            requested_executor: spec.executor,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        for dep in &spec.dependencies {
            self.dependents.entry(*dep).or_default().push(id);
        }
        self.depends_on.insert(id, spec.dependencies);
        self.order.push(id);
        self.tasks.insert(id, task);

        tracing::debug!(task_id = %id, "task inserted");
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// All tasks in insertion order.
    pub fn all(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ids that depend on `id`.
    pub fn dependents_of(&self, id: Uuid) -> &[Uuid] {
        self.dependents.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether every dependency of `task` is COMPLETED.
    fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    /// PENDING tasks whose dependencies are all COMPLETED, excluding
    /// ids in `running`, truncated so `|running| + |selected|` stays
    /// within `max_concurrent`. Sorted by priority descending, stable
    /// on insertion order.
    pub fn ready(&self, running: &HashSet<Uuid>, max_concurrent: usize) -> Vec<Task> {
        let capacity = max_concurrent.saturating_sub(running.len());
        if capacity == 0 {
            return Vec::new();
        }

        let mut ready: Vec<&Task> = self
            .order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending && !running.contains(&t.id))
            .filter(|t| self.dependencies_satisfied(t))
            .collect();

        // Priority descending, insertion sequence as the tie-break.
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        ready.into_iter().take(capacity).cloned().collect()
    }

    /// Depth-first linear order consistent with dependency edges
    /// (dependencies before dependents).
    ///
    /// Terminates on malformed cyclic input: a visiting marker guards
    /// re-entry, so members of a cycle are placed arbitrarily rather
    /// than looping.
    pub fn topological_order(&self) -> Vec<Uuid> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<Uuid, Mark> = HashMap::with_capacity(self.tasks.len());
        let mut out = Vec::with_capacity(self.tasks.len());

        for &root in &self.order {
            if marks.contains_key(&root) {
                continue;
            }
            // Explicit stack: (id, next dependency index to visit).
            let mut stack: Vec<(Uuid, usize)> = vec![(root, 0)];
            marks.insert(root, Mark::Visiting);

            while let Some((id, dep_idx)) = stack.pop() {
                let deps = self.depends_on.get(&id).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(&dep) = deps.get(dep_idx) {
                    stack.push((id, dep_idx + 1));
                    if !marks.contains_key(&dep) {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                } else {
                    marks.insert(id, Mark::Done);
                    out.push(id);
                }
            }
        }
        out
    }

    /// Transition to BLOCKED every PENDING task with a FAILED
    /// dependency. Returns the newly blocked ids.
    pub fn mark_blocked(&mut self) -> Vec<Uuid> {
        let failed: HashSet<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id)
            .collect();
        if failed.is_empty() {
            return Vec::new();
        }

        let mut newly_blocked = Vec::new();
        for &id in &self.order {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.status == TaskStatus::Pending
                && task.dependencies.iter().any(|d| failed.contains(d))
            {
                task.status = TaskStatus::Blocked;
                task.completed_at = Some(Utc::now());
                newly_blocked.push(id);
                tracing::debug!(task_id = %id, "task blocked by failed dependency");
            }
        }
        newly_blocked
    }

    /// FAILED dependency ids of `task`, if any.
    pub fn failed_dependencies_of(&self, task: &Task) -> Vec<Uuid> {
        task.dependencies
            .iter()
            .filter(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|t| t.status == TaskStatus::Failed)
            })
            .copied()
            .collect()
    }

    /// Count tasks per status.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }

    /// True iff the graph is non-empty and every task is terminal.
    pub fn is_complete(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.values().all(|t| t.status.is_terminal())
    }

    // -----------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------

    fn task_mut(&mut self, id: Uuid) -> EngineResult<&mut Task> {
        self.tasks.get_mut(&id).ok_or(EngineError::TaskNotFound(id))
    }

    /// PENDING -> RUNNING. Records `started_at` and the executor.
    pub fn mark_running(&mut self, id: Uuid, executor: &str) -> EngineResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.assigned_executor = Some(executor.to_owned());
        Ok(())
    }

    /// RUNNING -> COMPLETED. Records `completed_at` and the result.
    pub fn mark_completed(&mut self, id: Uuid, result: TaskResult) -> EngineResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.result = Some(result);
        task.error = None;
        Ok(())
    }

    /// -> FAILED. Records `completed_at` and the error message.
    pub fn mark_failed(&mut self, id: Uuid, error: &str) -> EngineResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some(error.to_owned());
        Ok(())
    }

    /// Record a failed attempt: increments `retries` and stores the
    /// error without changing status. Returns the new attempt count.
    pub fn record_attempt_failure(&mut self, id: Uuid, error: &str) -> EngineResult<u32> {
        let task = self.task_mut(id)?;
        task.retries += 1;
        task.error = Some(error.to_owned());
        Ok(task.retries)
    }

    /// -> PENDING, clearing `started_at` so age-based sweeps restart
    /// from the requeue. Used by deferred retries, the timeout
    /// manager, and DLQ requeue.
    pub fn requeue(&mut self, id: Uuid) -> EngineResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        Ok(())
    }
}

/// Cloneable shared handle to a graph.
pub type SharedGraph = Arc<RwLock<TaskGraph>>;

/// Create a new shared, empty graph.
pub fn shared_graph() -> SharedGraph {
    Arc::new(RwLock::new(TaskGraph::new()))
}

/// Read-only view of a shared graph, for injection into executors.
///
/// Executors may inspect other tasks' state through this handle but
/// never mutate the graph.
#[derive(Clone)]
pub struct GraphView {
    inner: SharedGraph,
}

impl GraphView {
    pub fn new(inner: SharedGraph) -> Self {
        Self { inner }
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.inner.read().expect("graph lock poisoned").get(id).cloned()
    }

    pub fn all(&self) -> Vec<Task> {
        self.inner.read().expect("graph lock poisoned").all()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("graph lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.inner.read().expect("graph lock poisoned").status_counts()
    }
}

impl std::fmt::Debug for GraphView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphView").field("len", &self.len()).finish()
    }
}
