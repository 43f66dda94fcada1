//! Dependency-aware task orchestration engine.
//!
//! The engine accepts tasks organized as a DAG, dispatches ready tasks
//! to registered executors with bounded parallelism, enforces per-task
//! timeouts with exponential-backoff retry, quarantines permanently
//! failed work in a dead-letter queue, watches for starved and wedged
//! tasks, and persists enough state to survive restarts.
//!
//! Components:
//! - [`graph::TaskGraph`] -- task records, adjacency, ready-set queries
//! - [`scheduler::Scheduler`] -- single-task execution with retry backoff
//! - [`engine::Engine`] -- the bounded dispatch loop tying it together
//! - [`timeout::TimeoutManager`] -- overrun sweep routing to retry/DLQ/cancel
//! - [`guardian::Guardian`] -- advisory starvation/wedge detection
//! - [`dlq::DeadLetterQueue`] -- durable parking lot for dead work
//! - [`state::StateManager`] -- task snapshots with autosave and recovery
//! - [`checkpoint::CheckpointService`] -- step-level restart checkpoints
//! - [`events::EventBus`] -- synchronous lifecycle fan-out

pub mod checkpoint;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod guardian;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod timeout;

pub use checkpoint::{Checkpoint, CheckpointMetadata, CheckpointService};
pub use config::{
    CheckpointConfig, DlqConfig, EngineConfig, GuardianConfig, SchedulerConfig, StateConfig,
    TimeoutConfig,
};
pub use dlq::{DeadLetterQueue, DlqEntry, DlqStats, RequeueSink, Resolution};
pub use engine::{Engine, EngineOutcome, GraphRequeueSink};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, EventKind, TaskEvent};
pub use executor::{Executor, ExecutorRegistry, FnExecutor};
pub use graph::{GraphView, SharedGraph, StatusCounts, TaskGraph, shared_graph};
pub use guardian::{Guardian, GuardianHooks, GuardianReport, GuardianStats};
pub use scheduler::Scheduler;
pub use state::{SnapshotPatch, StateManager, TaskSnapshot};
pub use task::{Task, TaskPriority, TaskResult, TaskSpec, TaskStatus};
pub use timeout::{TimeoutAction, TimeoutHooks, TimeoutManager};
