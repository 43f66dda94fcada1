//! End-to-end dispatch tests: chains, diamonds, concurrency bounds,
//! and cancellation.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use foreman_core::{
    Engine, EngineConfig, EngineOutcome, EventKind, FnExecutor, SchedulerConfig, TaskSpec,
    TaskStatus,
};

/// Opt-in test logging: `RUST_LOG=foreman_core=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn engine_with_concurrency(max_concurrent_tasks: i64) -> Engine {
    init_tracing();
    Engine::new(EngineConfig {
        scheduler: SchedulerConfig {
            max_concurrent_tasks,
            ..SchedulerConfig::default()
        },
        ..EngineConfig::default()
    })
}

/// Tracks how many executions overlap, and the observed peak.
struct ConcurrencyProbe {
    current: AtomicI64,
    peak: AtomicI64,
}

impl ConcurrencyProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> i64 {
        self.peak.load(Ordering::SeqCst)
    }
}

// ===========================================================================
// Scenario: linear chain
// ===========================================================================

#[tokio::test]
async fn linear_chain_completes_in_order() {
    let engine = engine_with_concurrency(5);

    let started_order = Arc::new(Mutex::new(Vec::new()));
    let order = Arc::clone(&started_order);
    engine.register_executor(FnExecutor::new("worker", move |task, _g| {
        order.lock().unwrap().push(task.name.clone());
        async { Ok(serde_json::Value::Null) }
    }));

    let a = engine.submit(TaskSpec::new("a")).unwrap();
    let b = engine.submit(TaskSpec::new("b").depends_on([a])).unwrap();
    let c = engine.submit(TaskSpec::new("c").depends_on([b])).unwrap();

    let counts = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let sink = Arc::clone(&counts);
    engine.subscribe(move |event| {
        *sink.lock()
            .unwrap()
            .entry((event.task_id, std::mem::discriminant(&event.kind)))
            .or_insert(0usize) += 1;
    });

    let outcome = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    assert_eq!(engine.topological_order(), vec![a, b, c]);
    assert_eq!(*started_order.lock().unwrap(), vec!["a", "b", "c"]);
    for id in [a, b, c] {
        assert_eq!(engine.task(id).unwrap().status, TaskStatus::Completed);
    }

    // Exactly one Started and one Completed per task.
    let counts = counts.lock().unwrap();
    for id in [a, b, c] {
        let started = counts
            .get(&(id, std::mem::discriminant(&EventKind::Started)))
            .copied();
        let completed = counts
            .get(&(id, std::mem::discriminant(&EventKind::Completed)))
            .copied();
        assert_eq!(started, Some(1));
        assert_eq!(completed, Some(1));
    }
}

// ===========================================================================
// Scenario: diamond with bounded parallelism
// ===========================================================================

#[tokio::test]
async fn diamond_runs_middle_tasks_concurrently() {
    let engine = engine_with_concurrency(2);

    let probe = ConcurrencyProbe::new();
    let probe_clone = Arc::clone(&probe);
    engine.register_executor(FnExecutor::new("worker", move |_task, _g| {
        let probe = Arc::clone(&probe_clone);
        async move {
            probe.enter();
            tokio::time::sleep(Duration::from_millis(100)).await;
            probe.exit();
            Ok(serde_json::Value::Null)
        }
    }));

    let a = engine.submit(TaskSpec::new("a")).unwrap();
    let b = engine.submit(TaskSpec::new("b").depends_on([a])).unwrap();
    let c = engine.submit(TaskSpec::new("c").depends_on([a])).unwrap();
    let d = engine.submit(TaskSpec::new("d").depends_on([b, c])).unwrap();

    // Record when each task starts and completes.
    let timeline = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&timeline);
    engine.subscribe(move |event| {
        sink.lock().unwrap().push((event.task_id, event.kind.clone(), event.at));
    });

    let outcome = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    for id in [a, b, c, d] {
        assert_eq!(engine.task(id).unwrap().status, TaskStatus::Completed);
    }

    // B and C overlapped: both were in flight at once.
    assert!(probe.peak() >= 2, "middle of the diamond should run concurrently");
    assert!(probe.peak() <= 2, "never more than max_concurrent in flight");

    // D started only after both B and C completed.
    let timeline = timeline.lock().unwrap();
    let time_of = |wanted_id, wanted_kind: &EventKind| {
        timeline
            .iter()
            .find(|(id, kind, _)| *id == wanted_id && kind == wanted_kind)
            .map(|(_, _, at)| *at)
            .unwrap()
    };
    let d_started = time_of(d, &EventKind::Started);
    assert!(time_of(b, &EventKind::Completed) <= d_started);
    assert!(time_of(c, &EventKind::Completed) <= d_started);
}

// ===========================================================================
// Boundary: strict serial execution
// ===========================================================================

#[tokio::test]
async fn max_concurrent_one_is_strictly_serial() {
    let engine = engine_with_concurrency(1);

    let probe = ConcurrencyProbe::new();
    let probe_clone = Arc::clone(&probe);
    engine.register_executor(FnExecutor::new("worker", move |_task, _g| {
        let probe = Arc::clone(&probe_clone);
        async move {
            probe.enter();
            tokio::time::sleep(Duration::from_millis(20)).await;
            probe.exit();
            Ok(serde_json::Value::Null)
        }
    }));

    for i in 0..6 {
        engine.submit(TaskSpec::new(format!("t{i}"))).unwrap();
    }

    let outcome = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);
    assert_eq!(probe.peak(), 1, "tasks must execute one at a time");
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn cancellation_interrupts_and_drains() {
    let engine = engine_with_concurrency(2);

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed);
    engine.register_executor(FnExecutor::new("worker", move |_task, _g| {
        let counter = Arc::clone(&counter);
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    }));

    for i in 0..20 {
        engine.submit(TaskSpec::new(format!("t{i}"))).unwrap();
    }

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = engine.run(cancel).await.unwrap();
    assert_eq!(outcome, EngineOutcome::Interrupted);

    // In-flight work drained; the rest was never dispatched.
    assert!(completed.load(Ordering::SeqCst) >= 1, "drained work landed");
    let status = engine.status();
    assert!(status.completed < 20, "cancellation stopped dispatch early");
    assert!(status.pending > 0, "undispatched tasks remain pending");
}

// ===========================================================================
// Misc: no executors
// ===========================================================================

#[tokio::test]
async fn run_without_executors_is_an_error() {
    let engine = engine_with_concurrency(2);
    engine.submit(TaskSpec::new("t")).unwrap();
    let result = engine.run(CancellationToken::new()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_specs_are_rejected_synchronously() {
    let engine = engine_with_concurrency(2);
    assert!(engine.submit(TaskSpec::new("")).is_err());
    assert!(engine.submit(TaskSpec::new("x").max_retries(11)).is_err());
    assert!(
        engine
            .submit(TaskSpec::new("x").depends_on([uuid::Uuid::new_v4()]))
            .is_err()
    );
}
